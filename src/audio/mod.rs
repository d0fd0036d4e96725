//! Audio pipeline and codec seam
//!
//! The ring pipeline buffers audio chunks between the serial link and the
//! consumers on either side. The [`AudioCodec`] trait is the HAL surface the
//! application drives; on this device the companion module behind the serial
//! link *is* the codec.

mod pipeline;

pub use pipeline::{CaptureBuffer, PlaybackBuffer};

use async_trait::async_trait;

use crate::Result;

/// Duplex audio codec capability
#[async_trait]
pub trait AudioCodec: Send + Sync {
    /// Read up to `max_len` bytes of captured audio, waiting at most one
    /// polling interval. Returns an empty vec if nothing arrived in time.
    async fn read_captured(&self, max_len: usize) -> Vec<u8>;

    /// Queue audio for playback. Blocks while the playback queue is full.
    async fn write_playback(&self, data: &[u8]) -> Result<()>;

    /// Enable or disable the capture direction. Disabling drains buffered
    /// capture audio immediately.
    async fn enable_input(&self, enable: bool);

    /// Enable or disable the playback direction. Disabling flushes queued
    /// playback audio.
    async fn enable_output(&self, enable: bool);

    /// Set output volume, 0..=100.
    async fn set_volume(&self, percent: u8) -> Result<()>;
}

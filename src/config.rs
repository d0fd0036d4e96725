//! Configuration for the link and daemon
//!
//! The companion module ships in a few audio framings; each preset fixes the
//! chunk sizes, pacing interval, and pipeline capacities the firmware on the
//! other end expects.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

/// Audio framing preset negotiated with the companion module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioMode {
    /// Opus both directions, 20ms frames (40-byte chunks)
    Opus16k20ms,
    /// Opus capture, raw PCM playback (320-byte chunks, 10ms pacing)
    #[default]
    Opus16k20msPcm16k,
    /// Raw PCM both directions
    Pcm16k,
}

impl AudioMode {
    /// Capture-direction chunk size in bytes.
    #[must_use]
    pub const fn capture_chunk_len(self) -> usize {
        match self {
            Self::Opus16k20ms | Self::Opus16k20msPcm16k => 40,
            Self::Pcm16k => 512,
        }
    }

    /// Playback-direction chunk size in bytes.
    #[must_use]
    pub const fn playback_chunk_len(self) -> usize {
        match self {
            Self::Opus16k20ms => 40,
            Self::Opus16k20msPcm16k | Self::Pcm16k => 320,
        }
    }

    /// Pacing interval for the playback tick.
    #[must_use]
    pub const fn playback_interval(self) -> Duration {
        match self {
            Self::Opus16k20ms => Duration::from_millis(20),
            Self::Opus16k20msPcm16k | Self::Pcm16k => Duration::from_millis(10),
        }
    }

    /// Capture queue capacity in bytes.
    #[must_use]
    pub const fn capture_buf_len(self) -> usize {
        match self {
            Self::Opus16k20ms | Self::Opus16k20msPcm16k => 40 * 10,
            Self::Pcm16k => 1920 * 3,
        }
    }

    /// Playback queue capacity in bytes.
    #[must_use]
    pub const fn playback_buf_len(self) -> usize {
        match self {
            Self::Opus16k20ms => 40 * 10,
            Self::Opus16k20msPcm16k | Self::Pcm16k => 1920 * 3,
        }
    }
}

/// Link configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Audio framing preset
    pub mode: AudioMode,

    /// OTA mode-switch retry interval
    #[serde(with = "duration_ms", rename = "ota_retry_ms")]
    pub ota_retry_interval: Duration,

    /// Maximum OTA mode-switch attempts before the handshake fails.
    /// The companion firmware retried forever; a bound keeps a dead module
    /// from spinning the timer for the rest of the device's uptime.
    pub ota_max_retries: u32,

    /// Wake-word refresh poll interval (after OTA success and at startup)
    #[serde(with = "duration_ms", rename = "wake_word_poll_ms")]
    pub wake_word_poll_interval: Duration,

    /// Maximum wake-word refresh polls before giving up
    pub wake_word_poll_attempts: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mode: AudioMode::default(),
            ota_retry_interval: Duration::from_millis(500),
            ota_max_retries: 20,
            wake_word_poll_interval: Duration::from_millis(100),
            wake_word_poll_attempts: 20,
        }
    }
}

/// Listening mode driving the Speaking exit transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListeningMode {
    /// Device returns to Idle when the server stops speaking
    #[default]
    AutoStop,
    /// User explicitly stops listening
    Manual,
    /// Full duplex: capture stays live while speaking
    Realtime,
}

/// Top-level configuration (link + daemon)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial link configuration
    pub link: LinkConfig,

    /// Listening mode
    pub listening_mode: ListeningMode,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Ok(toml::from_str(&raw)?)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

//! Byte-stream transport seam
//!
//! The link core only needs to push bytes at the companion module; receiving
//! is the peripheral driver's job, which calls [`VoiceLink::on_receive`]
//! (crate::link::VoiceLink::on_receive) with whatever arrived.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

use crate::{Error, Result};

/// Outbound half of a byte-stream peripheral
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes down the link.
    async fn send(&self, bytes: &[u8]) -> Result<()>;
}

/// Transport over a TCP stream, for bench setups where the companion UART is
/// exposed by a serial-to-TCP bridge.
pub struct TcpTransport {
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpTransport {
    /// Wrap the write half of a connected stream.
    #[must_use]
    pub fn new(writer: OwnedWriteHalf) -> Arc<Self> {
        Arc::new(Self { writer: Mutex::new(writer) })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

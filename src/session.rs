//! Conversation session seam
//!
//! The daemon talks to whichever assistant backend is wired in through this
//! trait. Implementations cover the real server connection and the test
//! doubles; the daemon never sees past the trait.

use async_trait::async_trait;

use crate::Result;
use crate::config::ListeningMode;

/// Why an in-flight assistant reply is being aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbortReason {
    /// Caller-driven stop (toggle, shutdown)
    #[default]
    None,
    /// The user spoke the wake word mid-reply
    WakeWordDetected,
}

/// Assistant backend the daemon drives
#[async_trait]
pub trait Session: Send + Sync {
    /// Open the audio channel toward the backend.
    async fn open_audio_channel(&self) -> Result<()>;

    /// Close the audio channel.
    async fn close_audio_channel(&self);

    /// Whether the audio channel is currently open.
    async fn is_audio_channel_open(&self) -> bool;

    /// Forward one chunk of captured audio upstream.
    async fn send_audio(&self, chunk: Vec<u8>) -> Result<()>;

    /// Tell the backend the wake word was heard.
    async fn send_wake_word_detected(&self, wake_word: &str) -> Result<()>;

    /// Start a listening turn.
    async fn send_start_listening(&self, mode: ListeningMode) -> Result<()>;

    /// End the current listening turn.
    async fn send_stop_listening(&self) -> Result<()>;

    /// Abort whatever the backend is currently speaking.
    async fn send_abort(&self, reason: AbortReason) -> Result<()>;
}

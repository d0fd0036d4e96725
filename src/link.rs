//! Serial link to the companion voice module
//!
//! [`VoiceLink`] owns the frame decoder, both pipeline buffers, and the small
//! protocol sub-states (cached wake word, OTA mode flag). Decoded control
//! frames become typed [`LinkEvent`]s on an mpsc channel; audio frames go
//! straight into the capture queue. A pacing task drains the playback queue
//! at the mode's frame interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::audio::{AudioCodec, CaptureBuffer, PlaybackBuffer};
use crate::config::LinkConfig;
use crate::ota::{OtaEvent, OtaHandshake};
use crate::protocol::{Command, Frame, FrameDecoder, encode_frame, encode_frames};
use crate::transport::Transport;
use crate::{Error, Result};

/// Control text the companion sends when the user asks it to enter upgrade
/// mode. Literal string from the deployed firmware; do not localize.
pub const UPGRADE_MODE_SENTINEL: &str = "升级模式";

/// Wake word the companion ships with before it reports its own
const DEFAULT_WAKE_WORD: &str = "你好小智";

/// Bounded wait used by capture reads so disable is observable promptly
const READ_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);

/// Typed events delivered to the main-event context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Decoded voice-command text from the module
    VoiceCommand(String),
    /// The module announced upgrade mode (user voice request)
    UpgradeRequested,
    /// The cached wake word was refreshed from the module
    WakeWordRefreshed(String),
    /// OTA handshake lifecycle
    Ota(OtaEvent),
    /// Raw link bytes received while in OTA mode, for the transfer server
    OtaTransferData(Vec<u8>),
}

/// The communication core: frame codec + ring pipeline + protocol sub-states
pub struct VoiceLink {
    config: LinkConfig,
    transport: Arc<dyn Transport>,
    decoder: std::sync::Mutex<FrameDecoder>,
    capture: CaptureBuffer,
    playback: PlaybackBuffer,
    input_enabled: AtomicBool,
    output_enabled: AtomicBool,
    /// Whether the link is in OTA transfer mode (audio suspended)
    ota_mode: AtomicBool,
    /// Set once the module produces its first audio frame
    hello_seen: AtomicBool,
    /// Set once the module has ever reported a wake word
    wake_word_seen: AtomicBool,
    /// Armed while a wake-word refresh is outstanding; gates OTA completion
    wait_fresh_wake_word: AtomicBool,
    wake_word: std::sync::Mutex<String>,
    events: mpsc::UnboundedSender<LinkEvent>,
    pub(crate) ota: OtaHandshake,
}

impl VoiceLink {
    /// Create a link over the given transport.
    ///
    /// Returns the link and the receiving end of its event channel. Call
    /// [`start`](Self::start) to launch the pacing and wake-word poll tasks.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        config: LinkConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            capture: CaptureBuffer::new(config.mode.capture_buf_len()),
            playback: PlaybackBuffer::new(config.mode.playback_buf_len()),
            config,
            transport,
            decoder: std::sync::Mutex::new(FrameDecoder::new()),
            input_enabled: AtomicBool::new(false),
            output_enabled: AtomicBool::new(false),
            ota_mode: AtomicBool::new(false),
            hello_seen: AtomicBool::new(false),
            wake_word_seen: AtomicBool::new(false),
            wait_fresh_wake_word: AtomicBool::new(true),
            wake_word: std::sync::Mutex::new(DEFAULT_WAKE_WORD.to_string()),
            events,
            ota: OtaHandshake::new(),
        });
        (link, events_rx)
    }

    /// Launch the playback pacing task and the startup wake-word poll.
    pub fn start(self: &Arc<Self>) {
        let link = Arc::clone(self);
        tokio::spawn(async move {
            link.pacing_loop().await;
        });

        let link = Arc::clone(self);
        tokio::spawn(async move {
            link.startup_wake_word_poll().await;
        });
    }

    /// Periodic tick: drain at most one playback chunk per interval and
    /// forward it to the module.
    async fn pacing_loop(&self) {
        let chunk_len = self.config.mode.playback_chunk_len();
        let mut tick = tokio::time::interval(self.config.mode.playback_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            if !self.output_enabled.load(Ordering::Acquire)
                || self.ota_mode.load(Ordering::Acquire)
            {
                continue;
            }
            if let Some(chunk) = self.playback.try_pop(chunk_len).await
                && let Err(e) = self.send_frame(Command::SendPcm, &chunk).await
            {
                tracing::warn!(error = %e, "failed to send playback frame");
            }
        }
    }

    /// Ask the module for its wake word until it answers. A module that never
    /// answers is old firmware without OTA support.
    async fn startup_wake_word_poll(&self) {
        for _ in 0..self.config.wake_word_poll_attempts {
            if !self.wait_fresh_wake_word.load(Ordering::Acquire) {
                return;
            }
            if let Err(e) = self.send_frame(Command::SendGetWakeWord, &[1]).await {
                tracing::warn!(error = %e, "wake word request failed");
            }
            tokio::time::sleep(self.config.wake_word_poll_interval).await;
        }
        if self.wait_fresh_wake_word.load(Ordering::Acquire) {
            tracing::warn!("companion module never reported a wake word");
        }
    }

    /// Push bytes received from the transport into the codec and dispatch
    /// every complete frame. The receive path never blocks on I/O; downstream
    /// work is queued or handed to other tasks.
    pub async fn on_receive(&self, bytes: &[u8]) {
        if self.ota_mode.load(Ordering::Acquire) {
            // The OTA transfer server consumes the raw stream; frames (mode
            // switch confirmations) are still parsed below
            self.emit(LinkEvent::OtaTransferData(bytes.to_vec()));
        }

        let frames = {
            let mut decoder = self.decoder.lock().unwrap_or_else(|e| e.into_inner());
            decoder.feed(bytes)
        };
        for frame in frames {
            self.handle_frame(frame).await;
        }
    }

    async fn handle_frame(&self, frame: Frame) {
        match frame.command() {
            Some(Command::RecvPcm) => {
                self.hello_seen.store(true, Ordering::Release);
                if self.input_enabled.load(Ordering::Acquire) {
                    self.capture.push(frame.payload).await;
                }
                // Disabled capture discards silently: intentional backpressure
            }
            Some(Command::RecvControl) => {
                let text = control_text(&frame.payload);
                tracing::info!(%text, "control frame {:#06x}", frame.cmd);
                if text == UPGRADE_MODE_SENTINEL {
                    self.emit(LinkEvent::UpgradeRequested);
                } else if !self.ota.is_transfer_active() {
                    self.emit(LinkEvent::VoiceCommand(text));
                }
            }
            Some(Command::RecvWakeWord) => {
                let word = control_text(&frame.payload);
                tracing::info!(%word, "wake word report");
                self.wake_word_seen.store(true, Ordering::Release);
                self.wait_fresh_wake_word.store(false, Ordering::Release);
                if let Ok(mut cached) = self.wake_word.lock() {
                    *cached = word.clone();
                }
                self.emit(LinkEvent::WakeWordRefreshed(word));
            }
            Some(Command::RecvOta) => {
                self.on_ota_trigger();
            }
            Some(_) => {
                tracing::debug!("ignoring send-direction frame {:#06x}", frame.cmd);
            }
            None => {
                tracing::debug!("unknown command {:#06x}", frame.cmd);
            }
        }
    }

    /// Encode and send one logical payload, split into wire frames as needed.
    pub(crate) async fn send_frame(&self, cmd: Command, payload: &[u8]) -> Result<()> {
        let chunk_len = self.config.mode.playback_chunk_len();
        for frame in encode_frames(cmd, payload, chunk_len) {
            self.transport.send(&frame).await?;
        }
        Ok(())
    }

    pub(crate) fn emit(&self, event: LinkEvent) {
        // Receiver gone means the daemon is shutting down; drop silently
        let _ = self.events.send(event);
    }

    /// Queue audio for the module. Blocks while the playback queue is full
    /// (backpressure toward the decode/network path).
    pub async fn send_audio(&self, chunk: Vec<u8>) {
        self.playback.push(chunk).await;
    }

    /// Signal end of the playback stream.
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the frame.
    pub async fn send_pcm_eof(&self) -> Result<()> {
        self.transport
            .send(&encode_frame(Command::SendPcmEof, &[]))
            .await
    }

    /// Send control text to the module.
    ///
    /// # Errors
    ///
    /// Returns error if the text exceeds one frame or the transport fails.
    pub async fn send_control_text(&self, text: &str) -> Result<()> {
        if text.len() > crate::protocol::MAX_PAYLOAD_LEN {
            return Err(Error::Transport("control text exceeds frame limit".into()));
        }
        self.transport
            .send(&encode_frame(Command::SendControl, text.as_bytes()))
            .await
    }

    /// Set output volume as a percentage; the module takes 0..=31.
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the frame.
    pub async fn set_output_volume(&self, percent: u8) -> Result<()> {
        let vol = (u16::from(percent.min(100)) * 31 / 100) as u8;
        self.transport
            .send(&encode_frame(Command::SendVolume, &[vol]))
            .await
    }

    /// Enable or disable the capture direction. Disabling drains buffered
    /// audio immediately so no stale chunks surface after re-enable.
    /// Idempotent.
    pub async fn enable_capture(&self, enable: bool) {
        if self.input_enabled.swap(enable, Ordering::AcqRel) == enable {
            return;
        }
        if !enable {
            self.capture.clear().await;
        }
        tracing::debug!(enable, "capture direction");
    }

    /// Enable or disable the playback direction. Disabling flushes queued
    /// chunks. Idempotent.
    pub async fn enable_playback(&self, enable: bool) {
        if self.output_enabled.swap(enable, Ordering::AcqRel) == enable {
            return;
        }
        if !enable {
            self.playback.clear().await;
        }
        tracing::debug!(enable, "playback direction");
    }

    /// Read up to `max_bytes` of captured audio, waiting at most one polling
    /// interval.
    pub async fn read_captured(&self, max_bytes: usize) -> Vec<u8> {
        self.capture
            .read(max_bytes, READ_POLL_INTERVAL)
            .await
            .unwrap_or_default()
    }

    /// The module's current wake word.
    #[must_use]
    pub fn wake_word(&self) -> String {
        self.wake_word
            .lock()
            .map_or_else(|_| DEFAULT_WAKE_WORD.to_string(), |w| w.clone())
    }

    /// Whether the link is currently in OTA transfer mode.
    #[must_use]
    pub fn is_ota_active(&self) -> bool {
        self.ota_mode.load(Ordering::Acquire)
    }

    pub(crate) fn set_ota_mode(&self, active: bool) {
        self.ota_mode.store(active, Ordering::Release);
    }

    pub(crate) fn arm_wake_word_wait(&self) {
        self.wait_fresh_wake_word.store(true, Ordering::Release);
    }

    pub(crate) fn is_wake_word_wait_armed(&self) -> bool {
        self.wait_fresh_wake_word.load(Ordering::Acquire)
    }

    pub(crate) fn has_seen_hello(&self) -> bool {
        self.hello_seen.load(Ordering::Acquire)
    }

    pub(crate) fn has_seen_wake_word(&self) -> bool {
        self.wake_word_seen.load(Ordering::Acquire)
    }

    pub(crate) fn config(&self) -> &LinkConfig {
        &self.config
    }
}

#[async_trait]
impl AudioCodec for VoiceLink {
    async fn read_captured(&self, max_len: usize) -> Vec<u8> {
        Self::read_captured(self, max_len).await
    }

    async fn write_playback(&self, data: &[u8]) -> Result<()> {
        self.send_audio(data.to_vec()).await;
        Ok(())
    }

    async fn enable_input(&self, enable: bool) {
        self.enable_capture(enable).await;
    }

    async fn enable_output(&self, enable: bool) {
        self.enable_playback(enable).await;
    }

    async fn set_volume(&self, percent: u8) -> Result<()> {
        self.set_output_volume(percent).await
    }
}

/// Interpret a control payload as text, trimming the NUL terminator the
/// firmware appends.
fn control_text(payload: &[u8]) -> String {
    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_text_trims_nul() {
        assert_eq!(control_text(b"hello\0junk"), "hello");
        assert_eq!(control_text(b"hello"), "hello");
        assert_eq!(control_text(b""), "");
    }

    #[test]
    fn test_volume_scaling() {
        // Module range is 0..=31
        let scale = |pct: u8| (u16::from(pct.min(100)) * 31 / 100) as u8;
        assert_eq!(scale(0), 0);
        assert_eq!(scale(100), 31);
        assert_eq!(scale(150), 31);
        assert_eq!(scale(50), 15);
    }
}

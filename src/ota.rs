//! OTA handshake with the companion module
//!
//! Coordinates switching the module from audio mode to OTA transfer mode and
//! back. The payload transfer itself (HTTP/WebSocket server) is an external
//! collaborator; it drives [`VoiceLink::ota_progress`], [`VoiceLink::ota_succeeded`]
//! and [`VoiceLink::ota_failed`] and consumes `LinkEvent::OtaTransferData`.
//!
//! ```text
//! Idle -> AwaitingModeSwitch -> InProgress -> {Succeeded, Failed} -> Idle
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::link::{LinkEvent, VoiceLink};
use crate::protocol::Command;

/// Payload of the mode-switch request frame
const OTA_MODE_REQUEST: [u8; 1] = [0x01];

/// Synchronous result of requesting an OTA session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaStatus {
    /// Handshake started; progress arrives on the event channel
    Started,
    /// A prior handshake is still in flight
    Busy,
    /// The attached module firmware does not support OTA
    Unsupported,
}

/// OTA lifecycle events, forwarded to the registered event consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaEvent {
    /// The module confirmed OTA mode; transfer may begin
    Started,
    /// Download progress in percent, forwarded verbatim
    Progress(u8),
    /// Transfer complete and wake word refreshed; the device should restart
    Succeeded,
    /// Handshake or transfer failed; module reverted to audio mode
    Failed(String),
}

/// Handshake phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OtaPhase {
    /// No session
    #[default]
    Idle,
    /// Mode-switch frame sent, waiting for the module to confirm
    AwaitingModeSwitch,
    /// Module is in OTA mode, transfer underway
    InProgress,
    /// Terminal, transitions back to Idle
    Succeeded,
    /// Terminal, transitions back to Idle
    Failed,
}

/// Per-session handshake state owned by the link
#[derive(Debug, Default)]
pub(crate) struct OtaHandshake {
    phase: std::sync::Mutex<OtaPhase>,
    code: std::sync::Mutex<Option<String>>,
    retry_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl OtaHandshake {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn phase(&self) -> OtaPhase {
        self.phase.lock().map_or(OtaPhase::Idle, |p| *p)
    }

    fn set_phase(&self, phase: OtaPhase) {
        if let Ok(mut p) = self.phase.lock() {
            *p = phase;
        }
    }

    pub(crate) fn is_transfer_active(&self) -> bool {
        self.phase() == OtaPhase::InProgress
    }

    fn take_code(&self) -> Option<String> {
        self.code.lock().ok().and_then(|mut c| c.take())
    }

    fn abort_retry(&self) {
        if let Ok(mut task) = self.retry_task.lock()
            && let Some(handle) = task.take()
        {
            handle.abort();
        }
    }
}

impl VoiceLink {
    /// Whether the attached module can take an OTA session at all.
    ///
    /// A module that streams audio but never answered the wake-word request
    /// runs firmware from before the OTA protocol existed.
    #[must_use]
    pub fn is_ota_supported(&self) -> bool {
        !(self.has_seen_hello() && !self.has_seen_wake_word())
    }

    /// Start an OTA session with the given device pairing code.
    ///
    /// Sends the mode-switch frame and arms a bounded retry timer; the
    /// outcome arrives as [`OtaEvent`]s on the link's event channel.
    pub async fn start_ota(self: &Arc<Self>, code: &str) -> OtaStatus {
        if self.ota.phase() != OtaPhase::Idle {
            return OtaStatus::Busy;
        }
        if self.is_wake_word_wait_armed() && self.has_seen_wake_word() {
            // A previous session's wake-word refresh never completed
            return OtaStatus::Busy;
        }
        if !self.is_ota_supported() {
            return OtaStatus::Unsupported;
        }

        tracing::info!(code, "starting ota handshake");
        if let Ok(mut c) = self.ota.code.lock() {
            *c = Some(code.to_string());
        }
        self.arm_wake_word_wait();
        self.ota.set_phase(OtaPhase::AwaitingModeSwitch);

        if let Err(e) = self.send_frame(Command::SendOta, &OTA_MODE_REQUEST).await {
            tracing::warn!(error = %e, "mode-switch frame send failed, retry timer will resend");
        }

        let link = Arc::clone(self);
        let handle = tokio::spawn(async move {
            link.ota_retry_loop().await;
        });
        if let Ok(mut task) = self.ota.retry_task.lock() {
            *task = Some(handle);
        }
        OtaStatus::Started
    }

    /// Resend the mode-switch frame until the module confirms or the bound
    /// is exhausted. The original firmware retried forever; we fail after
    /// `ota_max_retries` and surface it.
    async fn ota_retry_loop(&self) {
        let interval = self.config().ota_retry_interval;
        let max_retries = self.config().ota_max_retries;
        for attempt in 1..=max_retries {
            tokio::time::sleep(interval).await;
            if self.is_ota_active() {
                return;
            }
            tracing::debug!(attempt, max_retries, "resending ota mode switch");
            if let Err(e) = self.send_frame(Command::SendOta, &OTA_MODE_REQUEST).await {
                tracing::warn!(error = %e, "mode-switch resend failed");
            }
        }
        tracing::warn!(max_retries, "module never entered ota mode");
        self.ota_failed("mode switch not acknowledged");
    }

    /// Handle the module's OTA trigger/confirmation frame.
    pub(crate) fn on_ota_trigger(&self) {
        self.ota.abort_retry();
        match self.ota.phase() {
            OtaPhase::AwaitingModeSwitch => {
                tracing::info!("module confirmed ota mode");
            }
            OtaPhase::Idle => {
                // Module-initiated upgrade (user voice request on the module side)
                tracing::info!("module initiated ota session");
                self.arm_wake_word_wait();
            }
            phase => {
                tracing::debug!(?phase, "redundant ota trigger");
                return;
            }
        }
        self.ota.set_phase(OtaPhase::InProgress);
        self.set_ota_mode(true);
        self.emit(LinkEvent::Ota(OtaEvent::Started));
    }

    /// Forward transfer progress from the external transfer server.
    pub fn ota_progress(&self, percent: u8) {
        self.emit(LinkEvent::Ota(OtaEvent::Progress(percent)));
    }

    /// Conclude the session successfully.
    ///
    /// Reverts to audio mode, then polls the module for a refreshed wake
    /// word (bounded) so the device is voice-ready immediately after the
    /// restart the caller is expected to perform.
    pub async fn ota_succeeded(&self) {
        self.set_ota_mode(false);
        for _ in 0..self.config().wake_word_poll_attempts {
            if !self.is_wake_word_wait_armed() {
                break;
            }
            if let Err(e) = self.send_frame(Command::SendGetWakeWord, &[1]).await {
                tracing::warn!(error = %e, "wake word refresh request failed");
            }
            tokio::time::sleep(self.config().wake_word_poll_interval).await;
        }
        if self.is_wake_word_wait_armed() {
            tracing::warn!("wake word not refreshed after ota, continuing anyway");
        }
        self.ota.set_phase(OtaPhase::Succeeded);
        let code = self.ota.take_code();
        tracing::info!(code = code.as_deref().unwrap_or("-"), "ota session complete");
        self.emit(LinkEvent::Ota(OtaEvent::Succeeded));
        self.ota.set_phase(OtaPhase::Idle);
    }

    /// Conclude the session with a failure; the module reverts to audio mode.
    pub fn ota_failed(&self, reason: &str) {
        self.ota.abort_retry();
        self.set_ota_mode(false);
        self.ota.set_phase(OtaPhase::Failed);
        let code = self.ota.take_code();
        tracing::warn!(code = code.as_deref().unwrap_or("-"), reason, "ota session failed");
        self.emit(LinkEvent::Ota(OtaEvent::Failed(reason.to_string())));
        self.ota.set_phase(OtaPhase::Idle);
    }

    /// Cancel a session without surfacing a failure event (caller-driven
    /// teardown). Cancels the retry timer.
    pub fn cancel_ota(&self) {
        self.ota.abort_retry();
        self.set_ota_mode(false);
        self.ota.set_phase(OtaPhase::Idle);
        self.ota.take_code();
    }
}

//! Application daemon: device state machine and event loop
//!
//! All state transitions happen on one task, the event loop. Everything else
//! (audio pumps, link events, external callers) communicates by posting an
//! [`AppEvent`]; the loop is the single writer of the device state, so two
//! racing triggers can never leave the device half-transitioned.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify, mpsc, watch};

use crate::audio::AudioCodec;
use crate::config::{Config, ListeningMode};
use crate::link::{LinkEvent, VoiceLink};
use crate::ota::{OtaEvent, OtaStatus};
use crate::session::{AbortReason, Session};

/// Device lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    #[default]
    Unknown,
    Starting,
    Idle,
    Connecting,
    Listening,
    Speaking,
    Upgrading,
    Activating,
    FatalError,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
            Self::Upgrading => "upgrading",
            Self::Activating => "activating",
            Self::FatalError => "fatal_error",
        };
        f.write_str(s)
    }
}

/// Events the daemon's loop consumes. Posting one is the only way to request
/// a state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// Button press: start a conversation, or stop the current one
    ToggleChat,
    /// Begin a listening turn
    StartListening,
    /// End the current listening turn
    StopListening,
    /// The wake word was heard (payload is the matched text)
    WakeWordDetected(String),
    /// The assistant backend closed the audio channel
    AudioChannelClosed,
    /// The backend started a spoken reply
    SpeechStart,
    /// The backend finished its spoken reply
    SpeechStop,
    /// One chunk of reply audio from the backend
    IncomingAudio(Vec<u8>),
    /// Enter upgrade mode, optionally with a device pairing code
    Upgrade(Option<String>),
    /// The firmware transfer completed; the device should restart
    UpgradeSucceeded,
    /// The firmware transfer failed
    UpgradeFailed(String),
    /// Unrecoverable error
    Fatal(String),
    /// Stop the event loop
    Shutdown,
}

/// Counter of in-flight background work the event loop must not race.
///
/// A transition waits for the count to reach zero before running its side
/// effects, so an audio write started under the old state always completes
/// before the new state's setup runs.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    count: AtomicUsize,
    idle: Notify,
}

impl BackgroundTasks {
    /// Register one unit of background work; finished when the guard drops.
    pub fn guard(self: &Arc<Self>) -> BackgroundGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        BackgroundGuard { tasks: Arc::clone(self) }
    }

    /// Wait until no background work is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// RAII registration of one background work unit
pub struct BackgroundGuard {
    tasks: Arc<BackgroundTasks>,
}

impl Drop for BackgroundGuard {
    fn drop(&mut self) {
        if self.tasks.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tasks.idle.notify_waiters();
        }
    }
}

/// Queue of reply audio between the event loop and the playback writer
#[derive(Debug, Default)]
struct DecodeQueue {
    chunks: Mutex<VecDeque<Vec<u8>>>,
    available: Notify,
}

impl DecodeQueue {
    async fn push(&self, chunk: Vec<u8>) {
        self.chunks.lock().await.push_back(chunk);
        self.available.notify_one();
    }

    async fn pop(&self) -> Vec<u8> {
        loop {
            let notified = self.available.notified();
            if let Some(chunk) = self.chunks.lock().await.pop_front() {
                return chunk;
            }
            notified.await;
        }
    }

    async fn clear(&self) {
        self.chunks.lock().await.clear();
    }
}

/// Cloneable handle for posting events and observing the device state
#[derive(Clone)]
pub struct DaemonHandle {
    events: mpsc::UnboundedSender<AppEvent>,
    state: watch::Receiver<DeviceState>,
}

impl DaemonHandle {
    /// Post an event to the loop. Silently dropped after shutdown.
    pub fn post(&self, event: AppEvent) {
        let _ = self.events.send(event);
    }

    /// Current device state.
    #[must_use]
    pub fn state(&self) -> DeviceState {
        *self.state.borrow()
    }

    /// Watch receiver for state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<DeviceState> {
        self.state.clone()
    }
}

/// The application daemon
pub struct Daemon {
    link: Arc<VoiceLink>,
    codec: Arc<dyn AudioCodec>,
    session: Arc<dyn Session>,
    config: Config,
    events_tx: mpsc::UnboundedSender<AppEvent>,
    events_rx: mpsc::UnboundedReceiver<AppEvent>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    state_tx: watch::Sender<DeviceState>,
    state_rx: watch::Receiver<DeviceState>,
    background: Arc<BackgroundTasks>,
    decode: Arc<DecodeQueue>,
    /// Set while the current spoken reply is being discarded
    aborted: Arc<AtomicBool>,
}

impl Daemon {
    /// Build a daemon over a started-or-startable link and a session backend.
    #[must_use]
    pub fn new(
        link: Arc<VoiceLink>,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        session: Arc<dyn Session>,
        config: Config,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(DeviceState::Unknown);
        Self {
            codec: Arc::clone(&link) as Arc<dyn AudioCodec>,
            link,
            session,
            config,
            events_tx,
            events_rx,
            link_events,
            state_tx,
            state_rx,
            background: Arc::new(BackgroundTasks::default()),
            decode: Arc::new(DecodeQueue::default()),
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for posting events and observing state.
    #[must_use]
    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            events: self.events_tx.clone(),
            state: self.state_rx.clone(),
        }
    }

    /// Run the daemon until [`AppEvent::Shutdown`] or a closed event channel.
    ///
    /// Spawns the link tasks, the link-event pump, and both audio pumps, then
    /// serves the event loop on the current task.
    pub async fn run(mut self) {
        self.link.start();
        self.set_state(DeviceState::Starting).await;

        let link_events = std::mem::replace(&mut self.link_events, mpsc::unbounded_channel().1);
        tokio::spawn(pump_link_events(
            link_events,
            self.events_tx.clone(),
            Arc::clone(&self.link),
        ));
        tokio::spawn(audio_input_loop(
            Arc::clone(&self.codec),
            Arc::clone(&self.session),
            self.state_rx.clone(),
            Arc::clone(&self.background),
            self.config.link.mode.capture_chunk_len(),
            self.config.listening_mode,
        ));
        tokio::spawn(audio_output_loop(
            Arc::clone(&self.codec),
            Arc::clone(&self.decode),
            Arc::clone(&self.aborted),
            Arc::clone(&self.background),
        ));

        self.set_state(DeviceState::Idle).await;

        while let Some(event) = self.events_rx.recv().await {
            if matches!(event, AppEvent::Shutdown) {
                tracing::info!("daemon shutting down");
                break;
            }
            self.handle_event(event).await;
        }

        self.session.close_audio_channel().await;
        self.codec.enable_input(false).await;
        self.codec.enable_output(false).await;
    }

    async fn handle_event(&mut self, event: AppEvent) {
        let state = *self.state_rx.borrow();
        if state == DeviceState::FatalError {
            tracing::debug!(?event, "ignoring event in fatal state");
            return;
        }
        match event {
            AppEvent::ToggleChat => match state {
                DeviceState::Idle => self.start_conversation().await,
                DeviceState::Speaking => self.abort_speaking(AbortReason::None).await,
                DeviceState::Listening => {
                    self.session.close_audio_channel().await;
                    self.set_state(DeviceState::Idle).await;
                }
                _ => tracing::debug!(%state, "toggle ignored"),
            },
            AppEvent::StartListening => match state {
                DeviceState::Idle => self.start_conversation().await,
                DeviceState::Speaking => {
                    self.abort_speaking(AbortReason::None).await;
                    self.enter_listening().await;
                }
                _ => tracing::debug!(%state, "start listening ignored"),
            },
            AppEvent::StopListening => {
                if state == DeviceState::Listening {
                    if let Err(e) = self.session.send_stop_listening().await {
                        tracing::warn!(error = %e, "stop listening failed");
                    }
                    self.set_state(DeviceState::Idle).await;
                }
            }
            AppEvent::WakeWordDetected(word) => self.on_wake_word(state, &word).await,
            AppEvent::AudioChannelClosed => {
                if !matches!(state, DeviceState::Upgrading | DeviceState::Idle) {
                    self.set_state(DeviceState::Idle).await;
                }
            }
            AppEvent::SpeechStart => {
                if matches!(state, DeviceState::Idle | DeviceState::Listening) {
                    self.set_state(DeviceState::Speaking).await;
                }
            }
            AppEvent::SpeechStop => {
                if state == DeviceState::Speaking {
                    if self.config.listening_mode == ListeningMode::Manual {
                        self.set_state(DeviceState::Idle).await;
                    } else {
                        self.enter_listening().await;
                    }
                }
            }
            AppEvent::IncomingAudio(chunk) => {
                if state == DeviceState::Speaking && !self.aborted.load(Ordering::Acquire) {
                    self.decode.push(chunk).await;
                }
            }
            AppEvent::Upgrade(code) => self.start_upgrade(state, code).await,
            AppEvent::UpgradeSucceeded => {
                tracing::info!("firmware transfer complete, restart required");
                self.set_state(DeviceState::Activating).await;
            }
            AppEvent::UpgradeFailed(reason) => {
                tracing::warn!(reason, "firmware upgrade failed");
                if state == DeviceState::Upgrading {
                    self.set_state(DeviceState::Idle).await;
                }
            }
            AppEvent::Fatal(reason) => {
                tracing::error!(reason, "fatal error");
                self.set_state(DeviceState::FatalError).await;
            }
            AppEvent::Shutdown => unreachable!("handled by the loop"),
        }
    }

    /// Open the audio channel and move to Listening. Failures land in Idle.
    async fn start_conversation(&mut self) {
        self.set_state(DeviceState::Connecting).await;
        if let Err(e) = self.session.open_audio_channel().await {
            tracing::warn!(error = %e, "audio channel open failed");
            self.set_state(DeviceState::Idle).await;
            return;
        }
        self.enter_listening().await;
    }

    async fn enter_listening(&mut self) {
        if let Err(e) = self.session.send_start_listening(self.config.listening_mode).await {
            tracing::warn!(error = %e, "start listening failed");
            self.set_state(DeviceState::Idle).await;
            return;
        }
        self.set_state(DeviceState::Listening).await;
    }

    async fn abort_speaking(&mut self, reason: AbortReason) {
        self.aborted.store(true, Ordering::Release);
        self.decode.clear().await;
        if let Err(e) = self.session.send_abort(reason).await {
            tracing::warn!(error = %e, "abort failed");
        }
        self.set_state(DeviceState::Idle).await;
    }

    async fn on_wake_word(&mut self, state: DeviceState, word: &str) {
        tracing::info!(word, %state, "wake word detected");
        match state {
            DeviceState::Idle => {
                self.set_state(DeviceState::Connecting).await;
                if !self.session.is_audio_channel_open().await
                    && let Err(e) = self.session.open_audio_channel().await
                {
                    tracing::warn!(error = %e, "audio channel open failed");
                    self.set_state(DeviceState::Idle).await;
                    return;
                }
                if let Err(e) = self.session.send_wake_word_detected(word).await {
                    tracing::warn!(error = %e, "wake word report failed");
                }
                self.enter_listening().await;
            }
            DeviceState::Speaking => {
                self.abort_speaking(AbortReason::WakeWordDetected).await;
                self.enter_listening().await;
            }
            _ => {}
        }
    }

    async fn start_upgrade(&mut self, state: DeviceState, code: Option<String>) {
        if state == DeviceState::Upgrading {
            return;
        }
        self.session.close_audio_channel().await;
        self.set_state(DeviceState::Upgrading).await;
        let code = code.unwrap_or_default();
        match self.link.start_ota(&code).await {
            OtaStatus::Started => {}
            OtaStatus::Busy => {
                tracing::warn!("ota handshake already in flight");
                self.set_state(DeviceState::Idle).await;
            }
            OtaStatus::Unsupported => {
                tracing::warn!("companion module does not support ota");
                self.set_state(DeviceState::Idle).await;
            }
        }
    }

    /// Transition to `next`, waiting out in-flight background work first,
    /// then run the new state's audio side effects.
    async fn set_state(&mut self, next: DeviceState) {
        let prev = *self.state_rx.borrow();
        if prev == next {
            return;
        }
        tracing::info!(from = %prev, to = %next, "state transition");
        self.background.wait_idle().await;
        let _ = self.state_tx.send(next);

        match next {
            DeviceState::Idle => {
                self.codec.enable_input(false).await;
            }
            DeviceState::Listening => {
                self.decode.clear().await;
                self.aborted.store(false, Ordering::Release);
                self.codec.enable_output(true).await;
                self.codec.enable_input(true).await;
            }
            DeviceState::Speaking => {
                self.aborted.store(false, Ordering::Release);
                self.decode.clear().await;
                self.codec.enable_output(true).await;
                if self.config.listening_mode != ListeningMode::Realtime {
                    self.codec.enable_input(false).await;
                }
            }
            DeviceState::Upgrading | DeviceState::FatalError | DeviceState::Activating => {
                self.decode.clear().await;
                self.codec.enable_input(false).await;
                self.codec.enable_output(false).await;
            }
            DeviceState::Unknown | DeviceState::Starting | DeviceState::Connecting => {}
        }
    }
}

/// Translate link events into app events.
async fn pump_link_events(
    mut rx: mpsc::UnboundedReceiver<LinkEvent>,
    tx: mpsc::UnboundedSender<AppEvent>,
    link: Arc<VoiceLink>,
) {
    while let Some(event) = rx.recv().await {
        let mapped = match event {
            LinkEvent::VoiceCommand(text) => {
                if text == link.wake_word() {
                    Some(AppEvent::WakeWordDetected(text))
                } else {
                    tracing::info!(%text, "voice command");
                    None
                }
            }
            LinkEvent::UpgradeRequested => Some(AppEvent::Upgrade(None)),
            LinkEvent::WakeWordRefreshed(word) => {
                tracing::info!(%word, "wake word refreshed");
                None
            }
            LinkEvent::Ota(OtaEvent::Started) => {
                tracing::info!("ota transfer started");
                None
            }
            LinkEvent::Ota(OtaEvent::Progress(pct)) => {
                tracing::debug!(pct, "ota progress");
                None
            }
            LinkEvent::Ota(OtaEvent::Succeeded) => Some(AppEvent::UpgradeSucceeded),
            LinkEvent::Ota(OtaEvent::Failed(reason)) => Some(AppEvent::UpgradeFailed(reason)),
            LinkEvent::OtaTransferData(bytes) => {
                tracing::trace!(len = bytes.len(), "ota transfer data");
                None
            }
        };
        if let Some(event) = mapped
            && tx.send(event).is_err()
        {
            return;
        }
    }
}

/// Forward captured audio to the session while the device is listening.
async fn audio_input_loop(
    codec: Arc<dyn AudioCodec>,
    session: Arc<dyn Session>,
    mut state_rx: watch::Receiver<DeviceState>,
    background: Arc<BackgroundTasks>,
    chunk_len: usize,
    listening_mode: ListeningMode,
) {
    loop {
        let active = {
            let state = *state_rx.borrow();
            state == DeviceState::Listening
                || (state == DeviceState::Speaking && listening_mode == ListeningMode::Realtime)
        };
        if !active {
            if state_rx.changed().await.is_err() {
                return;
            }
            continue;
        }
        // read_captured waits one polling interval internally, pacing the loop
        let chunk = codec.read_captured(chunk_len).await;
        if chunk.is_empty() {
            continue;
        }
        let _guard = background.guard();
        if let Err(e) = session.send_audio(chunk).await {
            tracing::warn!(error = %e, "audio upload failed");
        }
    }
}

/// Drain reply audio into the playback direction. Backpressure from the
/// playback queue propagates up to the decode queue producer.
async fn audio_output_loop(
    codec: Arc<dyn AudioCodec>,
    decode: Arc<DecodeQueue>,
    aborted: Arc<AtomicBool>,
    background: Arc<BackgroundTasks>,
) {
    loop {
        let chunk = decode.pop().await;
        if aborted.load(Ordering::Acquire) {
            continue;
        }
        let _guard = background.guard();
        if let Err(e) = codec.write_playback(&chunk).await {
            tracing::warn!(error = %e, "playback write failed");
        }
    }
}

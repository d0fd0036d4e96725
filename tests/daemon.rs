//! State-machine integration tests with a scripted session backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use voicelink::config::{Config, LinkConfig, ListeningMode};
use voicelink::daemon::{AppEvent, Daemon, DaemonHandle, DeviceState};
use voicelink::link::VoiceLink;
use voicelink::protocol::{Command, FrameDecoder};
use voicelink::session::{AbortReason, Session};
use voicelink::transport::Transport;

#[derive(Default)]
struct RecordingTransport {
    sent: std::sync::Mutex<Vec<u8>>,
}

impl RecordingTransport {
    fn count_cmd(&self, cmd: Command) -> usize {
        let bytes = self.sent.lock().unwrap().clone();
        FrameDecoder::new()
            .feed(&bytes)
            .iter()
            .filter(|f| f.command() == Some(cmd))
            .count()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, bytes: &[u8]) -> voicelink::Result<()> {
        self.sent.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }
}

/// Session double that records the calls made against it.
#[derive(Default)]
struct ScriptedSession {
    calls: std::sync::Mutex<Vec<String>>,
    channel_open: AtomicBool,
}

impl ScriptedSession {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn open_audio_channel(&self) -> voicelink::Result<()> {
        self.record("open");
        self.channel_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close_audio_channel(&self) {
        self.record("close");
        self.channel_open.store(false, Ordering::SeqCst);
    }

    async fn is_audio_channel_open(&self) -> bool {
        self.channel_open.load(Ordering::SeqCst)
    }

    async fn send_audio(&self, _chunk: Vec<u8>) -> voicelink::Result<()> {
        Ok(())
    }

    async fn send_wake_word_detected(&self, wake_word: &str) -> voicelink::Result<()> {
        self.record(format!("wake_word:{wake_word}"));
        Ok(())
    }

    async fn send_start_listening(&self, _mode: ListeningMode) -> voicelink::Result<()> {
        self.record("start_listening");
        Ok(())
    }

    async fn send_stop_listening(&self) -> voicelink::Result<()> {
        self.record("stop_listening");
        Ok(())
    }

    async fn send_abort(&self, reason: AbortReason) -> voicelink::Result<()> {
        self.record(format!("abort:{reason:?}"));
        Ok(())
    }
}

struct Harness {
    handle: DaemonHandle,
    session: Arc<ScriptedSession>,
    transport: Arc<RecordingTransport>,
}

fn start(config: Config) -> Harness {
    let transport = Arc::new(RecordingTransport::default());
    let (link, link_events) = VoiceLink::new(transport.clone(), LinkConfig::default());
    let session = Arc::new(ScriptedSession::default());
    let daemon = Daemon::new(link, link_events, session.clone(), config);
    let handle = daemon.handle();
    tokio::spawn(daemon.run());
    Harness { handle, session, transport }
}

async fn wait_state(handle: &DaemonHandle, want: DeviceState) {
    let mut rx = handle.watch_state();
    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for state {want}"))
        .expect("state channel closed");
}

#[tokio::test]
async fn test_toggle_opens_channel_and_listens() {
    let h = start(Config::default());
    wait_state(&h.handle, DeviceState::Idle).await;

    h.handle.post(AppEvent::ToggleChat);
    wait_state(&h.handle, DeviceState::Listening).await;

    assert_eq!(h.session.calls(), vec!["open", "start_listening"]);
}

#[tokio::test]
async fn test_speaking_round_trip_resumes_listening() {
    let h = start(Config::default());
    wait_state(&h.handle, DeviceState::Idle).await;

    h.handle.post(AppEvent::ToggleChat);
    wait_state(&h.handle, DeviceState::Listening).await;

    h.handle.post(AppEvent::SpeechStart);
    wait_state(&h.handle, DeviceState::Speaking).await;

    // Auto-stop mode goes straight back to listening after the reply
    h.handle.post(AppEvent::SpeechStop);
    wait_state(&h.handle, DeviceState::Listening).await;
}

#[tokio::test]
async fn test_manual_mode_idles_after_reply() {
    let config = Config {
        listening_mode: ListeningMode::Manual,
        ..Config::default()
    };
    let h = start(config);
    wait_state(&h.handle, DeviceState::Idle).await;

    h.handle.post(AppEvent::ToggleChat);
    wait_state(&h.handle, DeviceState::Listening).await;
    h.handle.post(AppEvent::SpeechStart);
    wait_state(&h.handle, DeviceState::Speaking).await;
    h.handle.post(AppEvent::SpeechStop);
    wait_state(&h.handle, DeviceState::Idle).await;
}

#[tokio::test]
async fn test_wake_word_aborts_reply() {
    let h = start(Config::default());
    wait_state(&h.handle, DeviceState::Idle).await;

    h.handle.post(AppEvent::ToggleChat);
    wait_state(&h.handle, DeviceState::Listening).await;
    h.handle.post(AppEvent::SpeechStart);
    wait_state(&h.handle, DeviceState::Speaking).await;

    h.handle.post(AppEvent::WakeWordDetected("你好小智".to_string()));
    wait_state(&h.handle, DeviceState::Listening).await;

    assert!(
        h.session
            .calls()
            .contains(&"abort:WakeWordDetected".to_string())
    );
}

#[tokio::test]
async fn test_reply_audio_reaches_the_module() {
    let h = start(Config::default());
    wait_state(&h.handle, DeviceState::Idle).await;

    h.handle.post(AppEvent::ToggleChat);
    wait_state(&h.handle, DeviceState::Listening).await;
    h.handle.post(AppEvent::SpeechStart);
    wait_state(&h.handle, DeviceState::Speaking).await;

    h.handle.post(AppEvent::IncomingAudio(vec![5u8; 320]));

    // Decode queue -> playback queue -> pacing tick -> wire
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if h.transport.count_cmd(Command::SendPcm) >= 1 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no audio frame sent");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_reply_audio_dropped_outside_speaking() {
    let h = start(Config::default());
    wait_state(&h.handle, DeviceState::Idle).await;

    h.handle.post(AppEvent::IncomingAudio(vec![5u8; 320]));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.transport.count_cmd(Command::SendPcm), 0);
}

#[tokio::test]
async fn test_conflicting_triggers_resolve_serially() {
    let h = start(Config::default());
    wait_state(&h.handle, DeviceState::Idle).await;

    // Both posted before the loop sees either; the second runs against the
    // state produced by the first, never against a half-applied transition
    h.handle.post(AppEvent::ToggleChat);
    h.handle.post(AppEvent::SpeechStart);
    wait_state(&h.handle, DeviceState::Speaking).await;
}

#[tokio::test]
async fn test_upgrade_enters_upgrading_and_closes_channel() {
    let h = start(Config::default());
    wait_state(&h.handle, DeviceState::Idle).await;

    h.handle.post(AppEvent::ToggleChat);
    wait_state(&h.handle, DeviceState::Listening).await;

    h.handle.post(AppEvent::Upgrade(Some("4242".to_string())));
    wait_state(&h.handle, DeviceState::Upgrading).await;

    assert!(h.session.calls().contains(&"close".to_string()));
    assert_eq!(h.handle.state(), DeviceState::Upgrading);
}

#[tokio::test]
async fn test_fatal_is_terminal() {
    let h = start(Config::default());
    wait_state(&h.handle, DeviceState::Idle).await;

    h.handle.post(AppEvent::Fatal("bus error".to_string()));
    wait_state(&h.handle, DeviceState::FatalError).await;

    h.handle.post(AppEvent::ToggleChat);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.handle.state(), DeviceState::FatalError);
}

#[tokio::test]
async fn test_stop_listening_returns_to_idle() {
    let h = start(Config::default());
    wait_state(&h.handle, DeviceState::Idle).await;

    h.handle.post(AppEvent::StartListening);
    wait_state(&h.handle, DeviceState::Listening).await;

    h.handle.post(AppEvent::StopListening);
    wait_state(&h.handle, DeviceState::Idle).await;

    assert!(h.session.calls().contains(&"stop_listening".to_string()));
}

//! Link-level integration tests against a recording transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use voicelink::config::LinkConfig;
use voicelink::link::{LinkEvent, UPGRADE_MODE_SENTINEL, VoiceLink};
use voicelink::ota::{OtaEvent, OtaStatus};
use voicelink::protocol::{Command, FrameDecoder, encode_frame};
use voicelink::transport::Transport;

/// Transport that records every write for later inspection.
#[derive(Default)]
struct RecordingTransport {
    sent: std::sync::Mutex<Vec<u8>>,
}

impl RecordingTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Decode everything written so far and return the frames.
    fn sent_frames(&self) -> Vec<voicelink::protocol::Frame> {
        let bytes = self.sent.lock().unwrap().clone();
        FrameDecoder::new().feed(&bytes)
    }

    fn count_cmd(&self, cmd: Command) -> usize {
        self.sent_frames()
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

fn new_link() -> (
    Arc<VoiceLink>,
    mpsc::UnboundedReceiver<LinkEvent>,
    Arc<RecordingTransport>,
) {
    let transport = RecordingTransport::new();
    let (link, events) = VoiceLink::new(transport.clone(), LinkConfig::default());
    (link, events, transport)
}

fn drain(events: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Vec<LinkEvent> {
    let mut out = Vec::new();
    while let Ok(e) = events.try_recv() {
        out.push(e);
    }
    out
}

#[tokio::test]
async fn test_control_frame_becomes_voice_command() {
    let (link, mut events, _transport) = new_link();

    // The canonical single-byte control frame
    link.on_receive(&[0xAA, 0x55, 0x00, 0x01, 0x80, 0x01, 0x4A, 0xCB])
        .await;

    assert_eq!(drain(&mut events), vec![LinkEvent::VoiceCommand("J".to_string())]);
}

#[tokio::test]
async fn test_upgrade_sentinel_is_not_a_voice_command() {
    let (link, mut events, _transport) = new_link();

    let mut payload = UPGRADE_MODE_SENTINEL.as_bytes().to_vec();
    payload.push(0); // firmware NUL-terminates control text
    link.on_receive(&encode_frame(Command::RecvControl, &payload))
        .await;

    assert_eq!(drain(&mut events), vec![LinkEvent::UpgradeRequested]);
}

#[tokio::test]
async fn test_capture_discarded_while_disabled() {
    let (link, _events, _transport) = new_link();

    link.on_receive(&encode_frame(Command::RecvPcm, &[1u8; 40])).await;
    assert!(link.read_captured(512).await.is_empty());

    link.enable_capture(true).await;
    link.on_receive(&encode_frame(Command::RecvPcm, &[2u8; 40])).await;
    assert_eq!(link.read_captured(512).await, vec![2u8; 40]);
}

#[tokio::test]
async fn test_disable_capture_is_idempotent() {
    let (link, _events, _transport) = new_link();

    link.enable_capture(true).await;
    link.on_receive(&encode_frame(Command::RecvPcm, &[7u8; 40])).await;

    // Disabling drains; a second disable is a no-op
    link.enable_capture(false).await;
    link.enable_capture(false).await;

    link.enable_capture(true).await;
    assert!(link.read_captured(512).await.is_empty());
}

#[tokio::test]
async fn test_wake_word_report_updates_cache() {
    let (link, mut events, _transport) = new_link();

    link.on_receive(&encode_frame(Command::RecvWakeWord, b"hey module\0"))
        .await;

    assert_eq!(link.wake_word(), "hey module");
    assert_eq!(
        drain(&mut events),
        vec![LinkEvent::WakeWordRefreshed("hey module".to_string())]
    );
}

#[tokio::test]
async fn test_start_ota_second_call_is_busy() {
    let (link, _events, transport) = new_link();

    // Module has reported a wake word, so OTA is supported
    link.on_receive(&encode_frame(Command::RecvWakeWord, b"hi\0")).await;

    assert_eq!(link.start_ota("1234").await, OtaStatus::Started);
    assert_eq!(link.start_ota("1234").await, OtaStatus::Busy);

    // The concurrent request must not have produced a second mode-switch frame
    assert_eq!(transport.count_cmd(Command::SendOta), 1);
}

#[tokio::test]
async fn test_start_ota_unsupported_on_old_firmware() {
    let (link, _events, transport) = new_link();

    // Audio flows but the module never answers the wake-word request
    link.on_receive(&encode_frame(Command::RecvPcm, &[0u8; 40])).await;

    assert_eq!(link.start_ota("1234").await, OtaStatus::Unsupported);
    assert_eq!(transport.count_cmd(Command::SendOta), 0);
}

#[tokio::test]
async fn test_ota_confirmation_enters_transfer_mode() {
    let (link, mut events, _transport) = new_link();

    link.on_receive(&encode_frame(Command::RecvWakeWord, b"hi\0")).await;
    assert_eq!(link.start_ota("1234").await, OtaStatus::Started);
    assert!(!link.is_ota_active());
    drain(&mut events);

    // Module acknowledges the mode switch
    link.on_receive(&encode_frame(Command::RecvOta, &[1])).await;
    assert!(link.is_ota_active());
    assert_eq!(drain(&mut events), vec![LinkEvent::Ota(OtaEvent::Started)]);

    // Raw bytes now reach the transfer consumer; control text is suppressed
    link.on_receive(&encode_frame(Command::RecvControl, b"noise\0")).await;
    let events = drain(&mut events);
    assert!(events.iter().all(|e| matches!(e, LinkEvent::OtaTransferData(_))));
    assert!(!events.is_empty());
}

#[tokio::test]
async fn test_ota_failed_reverts_to_audio_mode() {
    let (link, mut events, _transport) = new_link();

    link.on_receive(&encode_frame(Command::RecvWakeWord, b"hi\0")).await;
    assert_eq!(link.start_ota("1234").await, OtaStatus::Started);
    link.on_receive(&encode_frame(Command::RecvOta, &[1])).await;
    drain(&mut events);

    link.ota_failed("transfer interrupted");
    assert!(!link.is_ota_active());
    assert_eq!(
        drain(&mut events),
        vec![LinkEvent::Ota(OtaEvent::Failed("transfer interrupted".to_string()))]
    );

    // A new session can start once the module reports a fresh wake word
    link.on_receive(&encode_frame(Command::RecvWakeWord, b"hi\0")).await;
    assert_eq!(link.start_ota("5678").await, OtaStatus::Started);
}

#[tokio::test]
async fn test_playback_pacing_sends_frames() {
    let (link, _events, transport) = new_link();
    link.start();
    link.enable_playback(true).await;

    link.send_audio(vec![3u8; 320]).await;

    // One chunk per 10ms tick
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.count_cmd(Command::SendPcm), 1);
}

#[tokio::test]
async fn test_outbound_control_operations() {
    let (link, _events, transport) = new_link();

    link.set_output_volume(50).await.unwrap();
    link.send_control_text("ding").await.unwrap();
    link.send_pcm_eof().await.unwrap();

    let frames = transport.sent_frames();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].command(), Some(Command::SendVolume));
    assert_eq!(frames[0].payload, vec![15]); // 50% of the module's 0..=31
    assert_eq!(frames[1].command(), Some(Command::SendControl));
    assert_eq!(frames[1].payload, b"ding");
    assert_eq!(frames[2].command(), Some(Command::SendPcmEof));
    assert!(frames[2].payload.is_empty());
}

#[tokio::test]
async fn test_playback_held_until_enabled() {
    let (link, _events, transport) = new_link();
    link.start();

    // Queued audio stays put while the output direction is off
    link.send_audio(vec![3u8; 320]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.count_cmd(Command::SendPcm), 0);

    link.enable_playback(true).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.count_cmd(Command::SendPcm), 1);
}

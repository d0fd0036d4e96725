//! Voicelink - serial companion-module core for voice assistant devices
//!
//! This library drives the voice companion module that sits on the other end
//! of a UART: wake word detection, audio capture and playback, and firmware
//! upgrades all happen on that module, and this crate speaks its framed
//! protocol and runs the device-side state machine.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 Daemon                        │
//! │   event loop  │  device state  │  audio pumps │
//! └───────┬───────────────────────────────┬───────┘
//!         │ AppEvent / AudioCodec         │ Session
//! ┌───────▼───────────────────────┐ ┌─────▼───────┐
//! │           VoiceLink           │ │  assistant  │
//! │  frame codec │ pipeline │ OTA │ │  backend    │
//! └───────┬───────────────────────┘ └─────────────┘
//!         │ Transport (UART / TCP bridge)
//! ┌───────▼───────────────────────┐
//! │       companion module        │
//! └───────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod daemon;
pub mod error;
pub mod link;
pub mod ota;
pub mod protocol;
pub mod session;
pub mod transport;

pub use audio::{AudioCodec, CaptureBuffer, PlaybackBuffer};
pub use config::{AudioMode, Config, LinkConfig, ListeningMode};
pub use daemon::{AppEvent, Daemon, DaemonHandle, DeviceState};
pub use error::{Error, Result};
pub use link::{LinkEvent, UPGRADE_MODE_SENTINEL, VoiceLink};
pub use ota::{OtaEvent, OtaStatus};
pub use session::{AbortReason, Session};
pub use transport::{TcpTransport, Transport};

//! Wire protocol for the companion voice module
//!
//! The companion module speaks a length-prefixed, checksummed framing protocol
//! over a raw byte stream. All multi-byte fields are big-endian on the wire:
//!
//! ```text
//! offset 0: head     u16 = 0xAA55
//! offset 2: len      u16, payload length, 0..=512
//! offset 4: cmd      u16, command code
//! offset 6: payload  [u8; len]
//! offset 6+len: checksum  u8 = sum(bytes[0..6+len]) mod 256
//! ```
//!
//! The format must match the deployed companion firmware byte-for-byte; the
//! command code values below are the on-wire integers.

mod frame;

pub use frame::{FrameDecoder, encode_frame, encode_frames};

/// Frame header magic, as transmitted (big-endian `AA 55`)
pub const FRAME_HEAD: u16 = 0xAA55;

/// Smallest possible frame: header + len + cmd + checksum, empty payload
pub const MIN_FRAME_LEN: usize = 7;

/// Largest payload the protocol allows
pub const MAX_PAYLOAD_LEN: usize = 512;

/// Largest possible frame on the wire
pub const MAX_FRAME_LEN: usize = MIN_FRAME_LEN + MAX_PAYLOAD_LEN;

/// Command codes, on-wire values (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    /// Audio payload from the module (capture direction)
    RecvPcm = 0x8020,
    /// Control text from the module (voice command, mode announcements)
    RecvControl = 0x8001,
    /// Wake-word report from the module
    RecvWakeWord = 0x8002,
    /// Module-initiated OTA trigger
    RecvOta = 0x0501,
    /// Audio payload to the module (playback direction)
    SendPcm = 0x8120,
    /// End-of-stream marker for playback audio
    SendPcmEof = 0x0102,
    /// Control text to the module
    SendControl = 0x0202,
    /// Output volume, module range 0..=31
    SendVolume = 0x0302,
    /// Request the module switch to OTA mode
    SendOta = 0x0502,
    /// Request the current wake-word string
    SendGetWakeWord = 0x0702,
}

impl Command {
    /// Map an on-wire command code to the closed set, if known.
    #[must_use]
    pub const fn from_wire(code: u16) -> Option<Self> {
        match code {
            0x8020 => Some(Self::RecvPcm),
            0x8001 => Some(Self::RecvControl),
            0x8002 => Some(Self::RecvWakeWord),
            0x0501 => Some(Self::RecvOta),
            0x8120 => Some(Self::SendPcm),
            0x0102 => Some(Self::SendPcmEof),
            0x0202 => Some(Self::SendControl),
            0x0302 => Some(Self::SendVolume),
            0x0502 => Some(Self::SendOta),
            0x0702 => Some(Self::SendGetWakeWord),
            _ => None,
        }
    }
}

/// One checksum-verified unit of the wire protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// On-wire command code; may be outside the closed set if the companion
    /// firmware is newer than this crate
    pub cmd: u16,
    /// Payload bytes, opaque at this layer
    pub payload: Vec<u8>,
}

impl Frame {
    /// Interpret the command code, if it belongs to the known set.
    #[must_use]
    pub const fn command(&self) -> Option<Command> {
        Command::from_wire(self.cmd)
    }
}

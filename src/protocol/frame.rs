//! Frame serializer and resynchronizing deserializer
//!
//! The serializer is stateless per call. The decoder keeps a carry-over
//! accumulator so partial frames survive across feed calls, and resynchronizes
//! byte-by-byte after corruption instead of discarding the whole stream.

use super::{Command, FRAME_HEAD, Frame, MAX_FRAME_LEN, MAX_PAYLOAD_LEN, MIN_FRAME_LEN};

/// Carry-over capacity: two maximum frames, matching the companion firmware's
/// parse buffer
const ACCUMULATOR_CAPACITY: usize = MAX_FRAME_LEN * 2;

/// Encode a single frame with header, big-endian fields, and trailing checksum.
///
/// # Panics
///
/// Panics if `payload` exceeds [`MAX_PAYLOAD_LEN`]; use [`encode_frames`] for
/// arbitrary payloads.
#[must_use]
pub fn encode_frame(cmd: Command, payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() <= MAX_PAYLOAD_LEN, "payload exceeds frame limit");

    #[allow(clippy::cast_possible_truncation)]
    let len = payload.len() as u16;
    let mut out = Vec::with_capacity(MIN_FRAME_LEN + payload.len());
    out.extend_from_slice(&FRAME_HEAD.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&(cmd as u16).to_be_bytes());
    out.extend_from_slice(payload);
    let sum = out.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    out.push(sum);
    out
}

/// Encode a payload as one or more frames, none carrying more than
/// `max_chunk` bytes.
///
/// Chunk order is preserved and each emitted frame is self-checksummed. An
/// empty payload produces a single empty frame.
#[must_use]
pub fn encode_frames(cmd: Command, payload: &[u8], max_chunk: usize) -> Vec<Vec<u8>> {
    let chunk = max_chunk.clamp(1, MAX_PAYLOAD_LEN);
    if payload.is_empty() {
        return vec![encode_frame(cmd, &[])];
    }
    payload.chunks(chunk).map(|c| encode_frame(cmd, c)).collect()
}

/// Stateful resynchronizing frame parser.
///
/// Bytes that cannot (yet) be resolved into a complete valid frame are carried
/// over to the next [`feed`](Self::feed) call. Malformed bytes are consumed
/// silently; a stream that never resynchronizes cannot grow the accumulator
/// past its fixed capacity.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Number of carried-over bytes awaiting more data.
    #[must_use]
    pub const fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feed received bytes, returning every complete valid frame in wire order.
    ///
    /// Multiple frames per call are supported; a frame split across calls is
    /// reassembled. Frames failing the checksum are never returned, but their
    /// bytes are rescanned for a later header (resync). Valid streams never
    /// lose frames, whatever the read boundaries; capacity is enforced only
    /// on what the scan could not resolve.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(data);

        let head = FRAME_HEAD.to_be_bytes();
        let mut frames = Vec::new();
        let mut i = 0;

        while i < self.buf.len() {
            if self.buf[i] != head[0] {
                i += 1;
                continue;
            }
            // Possible header prefix at the very end: wait for more data
            if i + 1 >= self.buf.len() {
                break;
            }
            if self.buf[i + 1] != head[1] {
                i += 1;
                continue;
            }
            // Header candidate; need the length field before anything else
            if self.buf.len() - i < MIN_FRAME_LEN {
                break;
            }
            let len = usize::from(u16::from_be_bytes([self.buf[i + 2], self.buf[i + 3]]));
            if len > MAX_PAYLOAD_LEN {
                // Length field is firmware-controlled; bound-check before any
                // offset computation. Spurious header.
                i += 1;
                continue;
            }
            let total = MIN_FRAME_LEN + len;
            if self.buf.len() - i < total {
                // Plausible frame, not enough bytes yet
                break;
            }
            let body_end = i + total - 1;
            let sum = self.buf[i..body_end]
                .iter()
                .fold(0u8, |acc, b| acc.wrapping_add(*b));
            if sum != self.buf[body_end] {
                // Checksum mismatch: the header was spurious, rescan from the
                // next byte rather than discarding the buffer
                i += 1;
                continue;
            }
            let cmd = u16::from_be_bytes([self.buf[i + 4], self.buf[i + 5]]);
            frames.push(Frame {
                cmd,
                payload: self.buf[i + 6..body_end].to_vec(),
            });
            i += total;
        }

        self.buf.drain(..i);

        // The scan leaves at most one incomplete frame (under MAX_FRAME_LEN
        // bytes) behind, so a resyncable stream cannot reach this bound
        if self.buf.len() > ACCUMULATOR_CAPACITY {
            tracing::warn!(
                pending = self.buf.len(),
                "frame accumulator overflow, resetting parser state"
            );
            let start = self.buf.len() - ACCUMULATOR_CAPACITY;
            self.buf.drain(..start);
        }
        frames
    }
}

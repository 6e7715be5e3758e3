//! APT frame codec.
//!
//! Wire format:
//! ```text
//! ┌─────────┬─────────┬────┬────┬──────┬────────┬───────────────────┐
//! │ cmd LSB │ cmd MSB │ p1 │ p2 │ dest │ source │ payload (ext only)│
//! └─────────┴─────────┴────┴────┴──────┴────────┴───────────────────┘
//!                                  │
//!                                  └─ bit7 set: p1 | p2 << 8 payload bytes follow
//! ```
//!
//! Two decoders share the same framing rules. [`FrameDecoder`] is fed raw
//! receive bursts by the reader thread and yields every complete frame in
//! the burst, keeping a partial trailing frame for the next call.
//! [`decode`] pulls exactly one frame from a blocking byte source and is
//! used during the connect handshake, before the reader thread exists.

use std::io::Read;

use super::protocol::{EXTENDED_FLAG, HEADER_LEN, MAX_PAYLOAD_LEN};
use crate::error::{MalformedFrame, Result};

/// One protocol unit.
///
/// For extended frames `param1`/`param2` hold the payload length, so a
/// decoded frame always satisfies `decode(encode(f)) == f`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u16,
    pub param1: u8,
    pub param2: u8,
    pub dest: u8,
    pub source: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Header-only frame carrying two parameter bytes.
    pub fn short(command: u16, param1: u8, param2: u8, dest: u8, source: u8) -> Self {
        Self {
            command,
            param1,
            param2,
            dest: dest & !EXTENDED_FLAG,
            source,
            payload: Vec::new(),
        }
    }

    /// Frame with a payload. Fails if the payload exceeds the length field.
    pub fn extended(command: u16, dest: u8, source: u8, payload: Vec<u8>) -> Result<Self> {
        let len = u16::try_from(payload.len())
            .map_err(|_| MalformedFrame::PayloadTooLarge(payload.len()))?;
        let [param1, param2] = len.to_le_bytes();
        Ok(Self {
            command,
            param1,
            param2,
            dest: dest | EXTENDED_FLAG,
            source,
            payload,
        })
    }

    pub fn is_extended(&self) -> bool {
        self.dest & EXTENDED_FLAG != 0
    }

    /// Serialise to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = (!self.payload.is_empty()).then_some(self.payload.as_slice());
        encode(
            self.command,
            self.param1,
            self.param2,
            self.dest,
            self.source,
            payload,
        )
    }
}

/// Encode one frame.
///
/// A non-empty payload sets the extended flag on `dest` and replaces
/// `p1`/`p2` with the payload length. Otherwise the bare header is emitted
/// with the extended flag cleared.
pub fn encode(
    command: u16,
    p1: u8,
    p2: u8,
    dest: u8,
    source: u8,
    payload: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let [cmd_lsb, cmd_msb] = command.to_le_bytes();
    match payload {
        Some(data) if !data.is_empty() => {
            if data.len() > MAX_PAYLOAD_LEN {
                return Err(MalformedFrame::PayloadTooLarge(data.len()).into());
            }
            let [len_lsb, len_msb] = (data.len() as u16).to_le_bytes();
            let mut out = Vec::with_capacity(HEADER_LEN + data.len());
            out.extend_from_slice(&[
                cmd_lsb,
                cmd_msb,
                len_lsb,
                len_msb,
                dest | EXTENDED_FLAG,
                source,
            ]);
            out.extend_from_slice(data);
            Ok(out)
        }
        _ => Ok(vec![cmd_lsb, cmd_msb, p1, p2, dest & !EXTENDED_FLAG, source]),
    }
}

fn frame_from_header(header: &[u8; HEADER_LEN], payload: Vec<u8>) -> Frame {
    Frame {
        command: u16::from_le_bytes([header[0], header[1]]),
        param1: header[2],
        param2: header[3],
        dest: header[4],
        source: header[5],
        payload,
    }
}

fn payload_len(header: &[u8; HEADER_LEN]) -> usize {
    if header[4] & EXTENDED_FLAG == 0 {
        0
    } else {
        usize::from(u16::from_le_bytes([header[2], header[3]]))
    }
}

/// Decode exactly one frame from a blocking byte source.
///
/// The source is expected to wait for bytes itself (see
/// [`DeadlineReader`](super::transport::DeadlineReader)); a timeout
/// surfaces as [`Error::Timeout`](crate::error::Error::Timeout).
pub fn decode<R: Read + ?Sized>(source: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    source.read_exact(&mut header)?;
    let mut payload = vec![0u8; payload_len(&header)];
    source.read_exact(&mut payload)?;
    Ok(frame_from_header(&header, payload))
}

/// Decoder state machine.
enum DecoderState {
    /// Waiting for header bytes.
    ReadingHeader { collected: usize },
    /// Header received, reading payload.
    ReadingPayload { expected: usize },
}

/// Streaming frame decoder.
///
/// There is no checksum and no sync marker on this link, so a dropped byte
/// misaligns every following frame. The owner resets the decoder whenever
/// the port is reopened.
pub struct FrameDecoder {
    state: DecoderState,
    header_buf: [u8; HEADER_LEN],
    payload_buf: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::ReadingHeader { collected: 0 },
            header_buf: [0; HEADER_LEN],
            payload_buf: Vec::new(),
        }
    }

    /// Feed one receive burst; returns every frame it completes.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            match &mut self.state {
                DecoderState::ReadingHeader { collected } => {
                    let to_copy = (HEADER_LEN - *collected).min(data.len() - offset);
                    self.header_buf[*collected..*collected + to_copy]
                        .copy_from_slice(&data[offset..offset + to_copy]);
                    *collected += to_copy;
                    offset += to_copy;

                    if *collected == HEADER_LEN {
                        let expected = payload_len(&self.header_buf);
                        if expected == 0 {
                            frames.push(frame_from_header(&self.header_buf, Vec::new()));
                            self.state = DecoderState::ReadingHeader { collected: 0 };
                        } else {
                            self.payload_buf = Vec::with_capacity(expected);
                            self.state = DecoderState::ReadingPayload { expected };
                        }
                    }
                }

                DecoderState::ReadingPayload { expected } => {
                    let to_copy = (*expected - self.payload_buf.len()).min(data.len() - offset);
                    self.payload_buf
                        .extend_from_slice(&data[offset..offset + to_copy]);
                    offset += to_copy;

                    if self.payload_buf.len() == *expected {
                        let payload = core::mem::take(&mut self.payload_buf);
                        frames.push(frame_from_header(&self.header_buf, payload));
                        self.state = DecoderState::ReadingHeader { collected: 0 };
                    }
                }
            }
        }

        frames
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecoderState::ReadingHeader { collected: 0 })
    }

    /// Drop any partial frame (e.g. after a reconnect).
    pub fn reset(&mut self) {
        self.state = DecoderState::ReadingHeader { collected: 0 };
        self.payload_buf = Vec::new();
    }
}

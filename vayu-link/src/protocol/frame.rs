//! MAVLink framing
//!
//! v1: `[0xFE] [LEN] [SEQ] [SYS] [COMP] [MSGID] [PAYLOAD] [CRC_L] [CRC_H]`
//!
//! v2: `[0xFD] [LEN] [INCOMPAT] [COMPAT] [SEQ] [SYS] [COMP] [MSGID x3]
//! [PAYLOAD] [CRC_L] [CRC_H] [SIGNATURE x13]?`
//!
//! The checksum is CRC-16/MCRF4XX over everything after the magic byte,
//! followed by the message's CRC extra byte.
//!
//! This module provides:
//! - [`scan`]: locate and validate one frame in a byte slice
//! - [`FrameReader`]: accumulation buffer driving `scan` over a byte stream
//! - [`build_v2_frame`]: serialize a payload into a v2 frame

use super::ring_buffer::RingBuffer;

pub const MAGIC_V1: u8 = 0xFE;
pub const MAGIC_V2: u8 = 0xFD;

/// Header length including the magic byte
pub const HEADER_LEN_V1: usize = 6;
pub const HEADER_LEN_V2: usize = 10;
pub const CHECKSUM_LEN: usize = 2;
pub const SIGNATURE_LEN: usize = 13;
pub const MAX_PAYLOAD_LEN: usize = 255;

/// Incompat flag marking a signed v2 frame
pub const INCOMPAT_FLAG_SIGNED: u8 = 0x01;

/// Largest possible single frame (signed v2 with full payload)
pub const MAX_FRAME_LEN: usize = HEADER_LEN_V2 + MAX_PAYLOAD_LEN + CHECKSUM_LEN + SIGNATURE_LEN;

/// CRC-16/MCRF4XX (a.k.a. X.25) as used by MAVLink
#[derive(Debug, Clone, Copy)]
pub struct Crc16(u16);

impl Crc16 {
    pub const fn new() -> Self {
        Self(0xFFFF)
    }

    #[inline]
    pub fn accumulate(&mut self, byte: u8) {
        let mut tmp = byte ^ (self.0 & 0xFF) as u8;
        tmp ^= tmp << 4;
        let tmp = tmp as u16;
        self.0 = (self.0 >> 8) ^ (tmp << 8) ^ (tmp << 3) ^ (tmp >> 4);
    }

    pub fn accumulate_slice(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.accumulate(b);
        }
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

/// Protocol version a frame was sent with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameVersion {
    V1,
    V2,
}

/// One checksum-valid frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub version: FrameVersion,
    pub sequence: u8,
    pub system_id: u8,
    pub component_id: u8,
    pub message_id: u32,
    /// Complete frame as received, signature included
    pub bytes: Vec<u8>,
    payload_start: usize,
    payload_len: usize,
}

impl RawFrame {
    /// Payload as carried on the wire (v2 may have trailing zeros stripped)
    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.payload_start..self.payload_start + self.payload_len]
    }
}

/// Outcome of scanning a byte slice for a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scan {
    /// Valid frame; `consumed` counts any garbage before it
    Frame { frame: RawFrame, consumed: usize },
    /// Nothing complete yet; the first `skip` bytes are garbage
    Incomplete { skip: usize },
    /// Candidate frame failed validation; drop `skip` bytes and retry
    Invalid { skip: usize },
}

/// Find and validate the first frame in `buf`
///
/// `crc_extra` maps a message id to its CRC extra byte, `None` for ids the
/// caller can't decode. Such frames are reported as [`Scan::Invalid`].
pub fn scan<F>(buf: &[u8], crc_extra: F) -> Scan
where
    F: Fn(u32) -> Option<u8>,
{
    let Some(start) = buf.iter().position(|&b| b == MAGIC_V1 || b == MAGIC_V2) else {
        return Scan::Incomplete { skip: buf.len() };
    };

    let rest = &buf[start..];
    let version = if rest[0] == MAGIC_V2 {
        FrameVersion::V2
    } else {
        FrameVersion::V1
    };
    let header_len = match version {
        FrameVersion::V1 => HEADER_LEN_V1,
        FrameVersion::V2 => HEADER_LEN_V2,
    };

    if rest.len() < header_len {
        return Scan::Incomplete { skip: start };
    }

    let payload_len = rest[1] as usize;
    let (sequence, system_id, component_id, message_id, signature_len) = match version {
        FrameVersion::V1 => (rest[2], rest[3], rest[4], rest[5] as u32, 0),
        FrameVersion::V2 => {
            let signature_len = if rest[2] & INCOMPAT_FLAG_SIGNED != 0 {
                SIGNATURE_LEN
            } else {
                0
            };
            let message_id = u32::from_le_bytes([rest[7], rest[8], rest[9], 0]);
            (rest[4], rest[5], rest[6], message_id, signature_len)
        }
    };

    let crc_offset = header_len + payload_len;
    let total_len = crc_offset + CHECKSUM_LEN + signature_len;
    if rest.len() < total_len {
        return Scan::Incomplete { skip: start };
    }

    let Some(extra) = crc_extra(message_id) else {
        log::trace!("Dropping frame with unknown message id {}", message_id);
        return Scan::Invalid { skip: start + 1 };
    };

    let mut crc = Crc16::new();
    crc.accumulate_slice(&rest[1..crc_offset]);
    crc.accumulate(extra);
    let received = u16::from_le_bytes([rest[crc_offset], rest[crc_offset + 1]]);
    if crc.value() != received {
        log::trace!(
            "CRC mismatch for message id {}: expected 0x{:04X}, got 0x{:04X}",
            message_id,
            crc.value(),
            received
        );
        return Scan::Invalid { skip: start + 1 };
    }

    Scan::Frame {
        frame: RawFrame {
            version,
            sequence,
            system_id,
            component_id,
            message_id,
            bytes: rest[..total_len].to_vec(),
            payload_start: header_len,
            payload_len,
        },
        consumed: start + total_len,
    }
}

/// Result of [`FrameReader::next_frame`]
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(RawFrame),
    /// A candidate frame was dropped (bad checksum or unknown id)
    Dropped,
    /// Need more bytes
    Empty,
}

/// Accumulation buffer plus pending input
///
/// Input is moved into the buffer only as far as there is room, so a large
/// datagram carrying several frames never overflows it.
pub struct FrameReader {
    buffer: RingBuffer<MAX_FRAME_LEN>,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buffer: RingBuffer::new(),
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    /// Queue received bytes for parsing
    pub fn push(&mut self, bytes: &[u8]) {
        if self.pending_pos == self.pending.len() {
            self.pending.clear();
            self.pending_pos = 0;
        }
        self.pending.extend_from_slice(bytes);
    }

    /// Bytes held in the accumulation buffer
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Parse the next frame, pulling pending input in as needed
    pub fn next_frame<F>(&mut self, crc_extra: F) -> ReadOutcome
    where
        F: Fn(u32) -> Option<u8>,
    {
        loop {
            match scan(self.buffer.as_slice(), &crc_extra) {
                Scan::Frame { frame, consumed } => {
                    self.buffer.advance(consumed);
                    return ReadOutcome::Frame(frame);
                }
                Scan::Invalid { skip } => {
                    self.buffer.advance(skip);
                    return ReadOutcome::Dropped;
                }
                Scan::Incomplete { skip } => {
                    self.buffer.advance(skip);
                    if !self.refill() {
                        return ReadOutcome::Empty;
                    }
                }
            }
        }
    }

    fn refill(&mut self) -> bool {
        let available = self.pending.len() - self.pending_pos;
        let take = available.min(self.buffer.remaining());
        if take == 0 {
            return false;
        }
        let end = self.pending_pos + take;
        self.buffer.extend(&self.pending[self.pending_pos..end]);
        self.pending_pos = end;
        true
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a MAVLink v2 frame around `payload`
///
/// Trailing zero bytes are truncated as the protocol allows (at least one
/// payload byte is always kept).
pub fn build_v2_frame(
    sequence: u8,
    system_id: u8,
    component_id: u8,
    message_id: u32,
    crc_extra: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut payload_len = payload.len().min(MAX_PAYLOAD_LEN);
    while payload_len > 1 && payload[payload_len - 1] == 0 {
        payload_len -= 1;
    }

    let id = message_id.to_le_bytes();
    let mut frame = Vec::with_capacity(HEADER_LEN_V2 + payload_len + CHECKSUM_LEN);
    frame.extend_from_slice(&[
        MAGIC_V2,
        payload_len as u8,
        0, // incompat flags
        0, // compat flags
        sequence,
        system_id,
        component_id,
        id[0],
        id[1],
        id[2],
    ]);
    frame.extend_from_slice(&payload[..payload_len]);

    let mut crc = Crc16::new();
    crc.accumulate_slice(&frame[1..]);
    crc.accumulate(crc_extra);
    frame.extend_from_slice(&crc.value().to_le_bytes());
    frame
}

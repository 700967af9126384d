//! # Frame Codec
//!
//! Stateless encode/decode helpers for single RFC 6455 frames.
//!
//! ## Wire Format
//! ```text
//! byte0: FIN(1) RSV1-3(3) OPCODE(4)
//! byte1: MASK(1) LEN7(7)
//!   LEN7 == 126 -> 2 byte extended length (u16, big-endian)
//!   LEN7 == 127 -> 8 byte extended length (u64, big-endian, high bit 0)
//! [mask key: 4 bytes, present iff MASK == 1]
//! [payload: LEN bytes, XOR-masked with the key if MASK == 1]
//! ```
//!
//! A [`Frame`] always holds its payload unmasked. The mask key, when present,
//! is applied while encoding and removed while decoding.

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::close::build_close_payload;
use crate::error::{constants, ProtocolError, Result};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Default upper bound for the payload of one outbound data frame.
pub const DEFAULT_MAX_CHUNK: usize = 65535;

/// Largest header: 2 base bytes, 8 length bytes, 4 mask bytes.
pub const MAX_HEADER_LEN: usize = 14;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = 0x70;
const OPCODE_BITS: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN7_BITS: u8 = 0x7F;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// Parse a 4-bit opcode. Reserved values return `None`.
    #[inline]
    pub fn from_u8(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Close, ping and pong.
    #[inline]
    pub fn is_control(self) -> bool {
        (self as u8) & 0x08 != 0
    }

    /// Text and binary. Continuation is neither data nor control.
    #[inline]
    pub fn is_data(self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary)
    }
}

/// The first two header bytes, split into fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderBits {
    pub fin: bool,
    pub reserved: bool,
    pub opcode: u8,
    pub masked: bool,
    pub length_indicator: u8,
}

impl HeaderBits {
    /// Number of extended length bytes that follow: 0, 2 or 8.
    #[inline]
    pub fn extended_len_bytes(&self) -> usize {
        match self.length_indicator {
            LEN_16 => 2,
            LEN_64 => 8,
            _ => 0,
        }
    }

    /// Reject reserved bits, unknown opcodes, and malformed control frames.
    pub fn validate(&self) -> Result<OpCode> {
        if self.reserved {
            return Err(ProtocolError::violation(constants::ERR_RESERVED_BITS));
        }
        let opcode = OpCode::from_u8(self.opcode).ok_or_else(|| {
            ProtocolError::ProtocolViolation(format!("unknown opcode 0x{:X}", self.opcode))
        })?;
        if opcode.is_control() {
            if !self.fin {
                return Err(ProtocolError::violation(constants::ERR_FRAGMENTED_CONTROL));
            }
            if self.length_indicator as usize > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::violation(constants::ERR_OVERSIZED_CONTROL));
            }
        }
        Ok(opcode)
    }
}

/// Split the two fixed header bytes into their fields.
#[inline]
pub fn decode_header(byte0: u8, byte1: u8) -> HeaderBits {
    HeaderBits {
        fin: byte0 & FIN_BIT != 0,
        reserved: byte0 & RSV_BITS != 0,
        opcode: byte0 & OPCODE_BITS,
        masked: byte1 & MASK_BIT != 0,
        length_indicator: byte1 & LEN7_BITS,
    }
}

/// Resolve the payload length from the indicator and its extended bytes.
///
/// `extended` must hold exactly [`HeaderBits::extended_len_bytes`] bytes.
pub fn read_length(bits: &HeaderBits, extended: &[u8]) -> Result<u64> {
    match (bits.length_indicator, extended) {
        (LEN_16, [a, b]) => Ok(u16::from_be_bytes([*a, *b]) as u64),
        (LEN_64, ext) if ext.len() == 8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(ext);
            let len = u64::from_be_bytes(buf);
            if len >> 63 != 0 {
                return Err(ProtocolError::violation(constants::ERR_LENGTH_HIGH_BIT));
            }
            Ok(len)
        }
        (n, []) if n < LEN_16 => Ok(n as u64),
        _ => Err(ProtocolError::ProtocolViolation(format!(
            "extended length of {} bytes does not match indicator {}",
            extended.len(),
            bits.length_indicator
        ))),
    }
}

/// XOR `buf` with `mask`, treating `buf[0]` as payload byte `offset`.
///
/// Applying the same key at the same offset twice restores the input.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[(i + offset) & 3];
    }
}

/// Fresh random masking key.
#[inline]
pub fn generate_mask() -> [u8; 4] {
    rand::random()
}

/// Write a header in the shortest of the 2/4/10 byte forms, plus the key.
pub fn write_header(dst: &mut BytesMut, fin: bool, opcode: OpCode, length: u64, mask: Option<[u8; 4]>) {
    let byte0 = if fin { FIN_BIT } else { 0 } | opcode as u8;
    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };

    dst.reserve(MAX_HEADER_LEN);
    dst.put_u8(byte0);
    if length < LEN_16 as u64 {
        dst.put_u8(mask_bit | length as u8);
    } else if length <= u16::MAX as u64 {
        dst.put_u8(mask_bit | LEN_16);
        dst.put_u16(length as u16);
    } else {
        dst.put_u8(mask_bit | LEN_64);
        dst.put_u64(length);
    }
    if let Some(key) = mask {
        dst.put_slice(&key);
    }
}

/// Build a standalone header, generating a mask key when `masked` is set.
///
/// Returns the header bytes and the key the payload has to be masked with.
pub fn build_header(fin: bool, opcode: OpCode, length: u64, masked: bool) -> (BytesMut, Option<[u8; 4]>) {
    let mask = masked.then(generate_mask);
    let mut dst = BytesMut::with_capacity(MAX_HEADER_LEN);
    write_header(&mut dst, fin, opcode, length, mask);
    (dst, mask)
}

/// A single frame with its payload held unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(true, OpCode::Text, Bytes::from(text.into()))
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, data)
    }

    /// Ping carrying `payload`. Payloads longer than 125 bytes are truncated.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, control_payload(payload.into()))
    }

    /// Pong echoing a ping's payload verbatim.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, control_payload(payload.into()))
    }

    /// Close frame. Without a code the payload is empty.
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        Self::new(true, OpCode::Close, build_close_payload(code, reason))
    }

    /// Attach a masking key.
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    #[inline]
    pub fn masked(&self) -> bool {
        self.mask.is_some()
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.payload.len() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Size of the frame on the wire.
    pub fn encoded_len(&self) -> usize {
        let len = self.payload.len();
        let ext = if len < LEN_16 as usize {
            0
        } else if len <= u16::MAX as usize {
            2
        } else {
            8
        };
        2 + ext + if self.masked() { 4 } else { 0 } + len
    }

    /// Append the wire form of this frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        write_header(dst, self.fin, self.opcode, self.len(), self.mask);
        let start = dst.len();
        dst.extend_from_slice(&self.payload);
        if let Some(key) = self.mask {
            apply_mask(&mut dst[start..], key, 0);
        }
    }

    /// Wire form of this frame.
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut dst);
        dst.freeze()
    }

    /// Decode one frame from the front of a contiguous buffer.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete frame, or
    /// the frame and the number of bytes it occupied.
    pub fn parse(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let bits = decode_header(buf[0], buf[1]);
        let opcode = bits.validate()?;

        let mut pos = 2;
        let ext = bits.extended_len_bytes();
        if buf.len() < pos + ext {
            return Ok(None);
        }
        let length = read_length(&bits, &buf[pos..pos + ext])?;
        pos += ext;

        let mask = if bits.masked {
            if buf.len() < pos + 4 {
                return Ok(None);
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&buf[pos..pos + 4]);
            pos += 4;
            Some(key)
        } else {
            None
        };

        let length = usize::try_from(length).map_err(|_| ProtocolError::PayloadTooLarge(length))?;
        if buf.len() - pos < length {
            return Ok(None);
        }
        let mut payload = BytesMut::from(&buf[pos..pos + length]);
        if let Some(key) = mask {
            apply_mask(&mut payload, key, 0);
        }

        let frame = Frame {
            fin: bits.fin,
            opcode,
            mask,
            payload: payload.freeze(),
        };
        Ok(Some((frame, pos + length)))
    }
}

fn control_payload(mut payload: Bytes) -> Bytes {
    payload.truncate(MAX_CONTROL_PAYLOAD);
    payload
}

/// Split one logical message into frames of at most `max_chunk` bytes.
///
/// The first frame carries `opcode`, the rest are continuations, and only the
/// last has `fin` set. A message that fits is returned as a single frame. When
/// `masked` is set every frame gets its own fresh key.
pub fn chunk_and_wrap(opcode: OpCode, payload: Bytes, masked: bool, max_chunk: usize) -> Vec<Frame> {
    let max_chunk = max_chunk.max(1);
    let with_key = |frame: Frame| {
        if masked {
            frame.with_mask(generate_mask())
        } else {
            frame
        }
    };

    if payload.len() <= max_chunk {
        return vec![with_key(Frame::new(true, opcode, payload))];
    }

    let count = payload.len().div_ceil(max_chunk);
    let mut frames = Vec::with_capacity(count);
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + max_chunk).min(payload.len());
        let op = if offset == 0 { opcode } else { OpCode::Continuation };
        let fin = end == payload.len();
        frames.push(with_key(Frame::new(fin, op, payload.slice(offset..end))));
        offset = end;
    }
    frames
}

//! # Frame Assembler
//!
//! Per-connection incremental decoder. Bytes arrive in arbitrary increments,
//! down to one byte at a time; the assembler keeps partial header and payload
//! state between deliveries and never waits on the transport itself.
//!
//! ## States
//! ```text
//! AwaitingHeader -> AwaitingExtendedLength -> AwaitingMask -> AwaitingPayload -> FrameComplete
//!        ^                  (skipped when          (skipped when                      |
//!        |                   LEN7 < 126)            MASK == 0)                         |
//!        +-------------------------------------------------------------------------- -+
//! any state --(violation)--> Failed   (terminal)
//! ```
//!
//! Completed frames feed the message layer: an unfinished text or binary frame
//! opens a pending message that continuation frames extend until one arrives
//! with FIN set. Control frames may interleave with the fragments and are
//! surfaced immediately.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::debug;

use crate::core::codec::Role;
use crate::core::frame::{apply_mask, decode_header, read_length, Frame, OpCode};
use crate::error::{constants, ProtocolError, Result};

/// Cap on the up-front allocation for a payload, whatever its announced size.
const PAYLOAD_PREALLOC_LIMIT: usize = 64 * 1024;

/// What the assembler hands to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A complete, UTF-8 validated text message.
    Text(String),
    /// A complete binary message.
    Binary(Bytes),
    /// A ping, pong or close frame.
    Control(Frame),
}

#[derive(Debug, Clone, Copy)]
struct Head {
    fin: bool,
    opcode: OpCode,
    masked: bool,
}

#[derive(Debug)]
enum State {
    AwaitingHeader,
    AwaitingExtendedLength {
        head: Head,
        width: usize,
    },
    AwaitingMask {
        head: Head,
        length: u64,
    },
    AwaitingPayload {
        head: Head,
        mask: Option<[u8; 4]>,
        remaining: usize,
        payload: BytesMut,
    },
    FrameComplete(Frame),
    Failed,
}

#[derive(Debug)]
struct Pending {
    opcode: OpCode,
    buf: BytesMut,
}

/// Incremental frame parser and fragment reassembler.
#[derive(Debug)]
pub struct FrameAssembler {
    state: State,
    pending: Option<Pending>,
    role: Role,
    max_message_size: u64,
}

impl FrameAssembler {
    /// `role` is the local end: a server requires masked input, a client
    /// requires unmasked input.
    pub fn new(role: Role, max_message_size: usize) -> Self {
        Self {
            state: State::AwaitingHeader,
            pending: None,
            role,
            max_message_size: max_message_size as u64,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether a violation has been seen. No further bytes are processed.
    pub fn is_failed(&self) -> bool {
        matches!(self.state, State::Failed)
    }

    /// Whether a fragmented message is waiting for continuations.
    pub fn has_pending_message(&self) -> bool {
        self.pending.is_some()
    }

    /// At a frame boundary with no fragmented message open.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::AwaitingHeader) && self.pending.is_none()
    }

    /// Advance the frame state machine over `src`, consuming what it can.
    ///
    /// Returns the next complete frame, or `Ok(None)` once `src` runs dry.
    /// An error leaves the assembler in the `Failed` state.
    pub fn next_frame(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            // Any early return through `?` leaves `Failed` behind.
            let state = std::mem::replace(&mut self.state, State::Failed);
            let next = match state {
                State::Failed => {
                    return Err(ProtocolError::violation(constants::ERR_ASSEMBLER_FAILED));
                }
                State::AwaitingHeader => {
                    if src.len() < 2 {
                        self.state = State::AwaitingHeader;
                        return Ok(None);
                    }
                    let bits = decode_header(src[0], src[1]);
                    let opcode = bits.validate()?;
                    self.check_masking(bits.masked)?;
                    src.advance(2);

                    let head = Head {
                        fin: bits.fin,
                        opcode,
                        masked: bits.masked,
                    };
                    match bits.extended_len_bytes() {
                        0 => self.after_length(head, bits.length_indicator as u64)?,
                        width => State::AwaitingExtendedLength { head, width },
                    }
                }
                State::AwaitingExtendedLength { head, width } => {
                    if src.len() < width {
                        self.state = State::AwaitingExtendedLength { head, width };
                        return Ok(None);
                    }
                    let ext = src.split_to(width);
                    let indicator = if width == 2 { 126 } else { 127 };
                    let bits = decode_header(0, indicator);
                    let length = read_length(&bits, &ext)?;
                    self.after_length(head, length)?
                }
                State::AwaitingMask { head, length } => {
                    if src.len() < 4 {
                        self.state = State::AwaitingMask { head, length };
                        return Ok(None);
                    }
                    let mut key = [0u8; 4];
                    src.copy_to_slice(&mut key);
                    payload_state(head, length, Some(key))?
                }
                State::AwaitingPayload {
                    head,
                    mask,
                    remaining,
                    mut payload,
                } => {
                    let take = remaining.min(src.len());
                    if take > 0 {
                        let offset = payload.len();
                        if payload.is_empty() && take == remaining {
                            payload = src.split_to(take);
                        } else {
                            payload.extend_from_slice(&src[..take]);
                            src.advance(take);
                        }
                        if let Some(key) = mask {
                            apply_mask(&mut payload[offset..], key, offset);
                        }
                    }
                    let remaining = remaining - take;
                    if remaining > 0 {
                        self.state = State::AwaitingPayload {
                            head,
                            mask,
                            remaining,
                            payload,
                        };
                        return Ok(None);
                    }
                    State::FrameComplete(Frame {
                        fin: head.fin,
                        opcode: head.opcode,
                        mask,
                        payload: payload.freeze(),
                    })
                }
                State::FrameComplete(frame) => {
                    self.state = State::AwaitingHeader;
                    return Ok(Some(frame));
                }
            };
            self.state = next;
        }
    }

    /// Feed a complete frame into fragment reassembly.
    ///
    /// Returns a finished message or control frame, or `Ok(None)` while a
    /// fragmented message is still open.
    pub fn push_frame(&mut self, frame: Frame) -> Result<Option<Incoming>> {
        match frame.opcode {
            OpCode::Close | OpCode::Ping | OpCode::Pong => Ok(Some(Incoming::Control(frame))),
            OpCode::Text | OpCode::Binary => {
                if self.pending.is_some() {
                    return Err(ProtocolError::violation(constants::ERR_INTERLEAVED_DATA));
                }
                if frame.fin {
                    return complete(frame.opcode, frame.payload).map(Some);
                }
                debug!(opcode = ?frame.opcode, bytes = frame.payload.len(), "Fragmented message started");
                self.pending = Some(Pending {
                    opcode: frame.opcode,
                    buf: BytesMut::from(&frame.payload[..]),
                });
                Ok(None)
            }
            OpCode::Continuation => {
                let pending = self
                    .pending
                    .as_mut()
                    .ok_or_else(|| ProtocolError::violation(constants::ERR_ORPHAN_CONTINUATION))?;
                pending.buf.extend_from_slice(&frame.payload);
                if !frame.fin {
                    return Ok(None);
                }
                match self.pending.take() {
                    Some(done) => complete(done.opcode, done.buf.freeze()).map(Some),
                    None => Ok(None),
                }
            }
        }
    }

    /// Enter the terminal state and drop any partial message.
    pub fn fail(&mut self) {
        self.state = State::Failed;
        self.pending = None;
    }

    fn check_masking(&self, masked: bool) -> Result<()> {
        match (self.role, masked) {
            (Role::Server, false) => Err(ProtocolError::violation(constants::ERR_UNMASKED_FRAME)),
            (Role::Client, true) => Err(ProtocolError::violation(constants::ERR_MASKED_FRAME)),
            _ => Ok(()),
        }
    }

    fn after_length(&self, head: Head, length: u64) -> Result<State> {
        let buffered = match (&self.pending, head.opcode) {
            (Some(pending), OpCode::Continuation) => pending.buf.len() as u64,
            _ => 0,
        };
        if buffered.saturating_add(length) > self.max_message_size {
            return Err(ProtocolError::PayloadTooLarge(buffered.saturating_add(length)));
        }
        if head.masked {
            Ok(State::AwaitingMask { head, length })
        } else {
            payload_state(head, length, None)
        }
    }
}

fn payload_state(head: Head, length: u64, mask: Option<[u8; 4]>) -> Result<State> {
    let remaining = usize::try_from(length).map_err(|_| ProtocolError::PayloadTooLarge(length))?;
    Ok(State::AwaitingPayload {
        head,
        mask,
        remaining,
        payload: BytesMut::with_capacity(remaining.min(PAYLOAD_PREALLOC_LIMIT)),
    })
}

fn complete(opcode: OpCode, payload: Bytes) -> Result<Incoming> {
    match opcode {
        OpCode::Text => std::str::from_utf8(&payload)
            .map(|text| Incoming::Text(text.to_owned()))
            .map_err(|_| ProtocolError::InvalidPayload(constants::ERR_INVALID_UTF8.into())),
        _ => Ok(Incoming::Binary(payload)),
    }
}

impl Decoder for FrameAssembler {
    type Item = Incoming;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Incoming>> {
        loop {
            let frame = match self.next_frame(src) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(None),
                Err(e) => {
                    self.fail();
                    return Err(e);
                }
            };
            match self.push_frame(frame) {
                Ok(Some(incoming)) => return Ok(Some(incoming)),
                Ok(None) => continue,
                Err(e) => {
                    self.fail();
                    return Err(e);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Incoming>> {
        match self.decode(src)? {
            Some(incoming) => Ok(Some(incoming)),
            None if src.is_empty() && self.is_idle() => Ok(None),
            None => Err(ProtocolError::TransportError(
                "transport closed in the middle of a frame".to_string(),
            )),
        }
    }
}

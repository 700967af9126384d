//! # Error Types
//!
//! Error handling for the frame engine and the connection/channel layers.
//!
//! Every failure is scoped to exactly one connection. The variants fall into
//! the categories the connection layer reacts to:
//! - **Protocol violations**: reserved bits, unknown opcodes, unmasked client
//!   frames, oversized or fragmented control frames, orphan continuations.
//!   Answered with close code 1002.
//! - **Payload too large**: answered with 1009.
//! - **Invalid payload**: a text message that is not UTF-8. Answered with 1007.
//! - **Transport errors**: the socket failed; no close frame can be flushed.
//! - **Application errors**: a member write failed during a broadcast. These
//!   never leave the broadcaster.
//!
//! ## Example Usage
//! ```rust
//! use websocket_channels::error::{ProtocolError, Result};
//! use websocket_channels::core::close::CloseCode;
//!
//! fn check_opcode(op: u8) -> Result<()> {
//!     if op > 0xA {
//!         return Err(ProtocolError::ProtocolViolation(format!("unknown opcode 0x{op:X}")));
//!     }
//!     Ok(())
//! }
//!
//! let err = check_opcode(0xB).unwrap_err();
//! assert_eq!(err.close_code(), Some(CloseCode::PROTOCOL_ERROR));
//! ```

use std::io;
use thiserror::Error;

use crate::core::close::CloseCode;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Frame-level violations
    pub const ERR_RESERVED_BITS: &str = "reserved bits set without a negotiated extension";
    pub const ERR_UNMASKED_FRAME: &str = "client frame is not masked";
    pub const ERR_MASKED_FRAME: &str = "server frame must not be masked";
    pub const ERR_ORPHAN_CONTINUATION: &str = "continuation frame without a pending message";
    pub const ERR_INTERLEAVED_DATA: &str = "new data frame while a fragmented message is pending";
    pub const ERR_FRAGMENTED_CONTROL: &str = "control frame must not be fragmented";
    pub const ERR_OVERSIZED_CONTROL: &str = "control frame payload exceeds 125 bytes";
    pub const ERR_LENGTH_HIGH_BIT: &str = "most significant bit of 64-bit length must be 0";
    pub const ERR_ASSEMBLER_FAILED: &str = "frame assembler has already failed";

    /// Close payload errors
    pub const ERR_CLOSE_PAYLOAD_LENGTH: &str = "close payload of one byte";
    pub const ERR_CLOSE_CODE: &str = "invalid close status code";

    /// Payload errors
    pub const ERR_INVALID_UTF8: &str = "text message is not valid UTF-8";

    /// Close reasons sent to the peer
    pub const REASON_PROTOCOL_ERROR: &str = "protocol error";
    pub const REASON_INVALID_PAYLOAD: &str = "invalid payload";
    pub const REASON_MESSAGE_TOO_BIG: &str = "message too big";
    pub const REASON_IDLE_TIMEOUT: &str = "idle timeout";
    pub const REASON_SHUTDOWN: &str = "server shutting down";
}

// ProtocolError is the primary error type for all engine operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Message too big: {0} bytes")]
    PayloadTooLarge(u64),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Application error: {0}")]
    ApplicationError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Outbound queue full")]
    Backpressure,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Too many connections (limit {0})")]
    ConnectionLimit(usize),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// Close status this error is answered with, if the peer should be told.
    ///
    /// Transport failures return `None`: the socket is gone and nothing can be
    /// flushed.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            ProtocolError::ProtocolViolation(_) => Some(CloseCode::PROTOCOL_ERROR),
            ProtocolError::PayloadTooLarge(_) => Some(CloseCode::MESSAGE_TOO_BIG),
            ProtocolError::InvalidPayload(_) => Some(CloseCode::INVALID_PAYLOAD),
            ProtocolError::Timeout => Some(CloseCode::GOING_AWAY),
            _ => None,
        }
    }

    /// Reason string sent alongside [`close_code`](Self::close_code).
    pub fn close_reason(&self) -> &'static str {
        match self {
            ProtocolError::ProtocolViolation(_) => constants::REASON_PROTOCOL_ERROR,
            ProtocolError::PayloadTooLarge(_) => constants::REASON_MESSAGE_TOO_BIG,
            ProtocolError::InvalidPayload(_) => constants::REASON_INVALID_PAYLOAD,
            ProtocolError::Timeout => constants::REASON_IDLE_TIMEOUT,
            _ => "",
        }
    }

    /// Whether this error ends the connection it occurred on.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::ApplicationError(_)
                | ProtocolError::Backpressure
                | ProtocolError::Serialization(_)
        )
    }

    pub(crate) fn violation(msg: &str) -> Self {
        ProtocolError::ProtocolViolation(msg.to_string())
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

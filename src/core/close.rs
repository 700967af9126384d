//! Close status codes and close-frame payloads (RFC 6455 Section 5.5.1, 7.4).
//!
//! A close payload is an optional 2-byte big-endian status code followed by
//! an optional UTF-8 reason. Application codes in 3000-4999 pass through
//! unmodified.

use crate::error::{constants, ProtocolError, Result};

/// Largest reason that still fits a control frame next to the status code.
pub const MAX_REASON_LEN: usize = 123;

/// Well-known close status codes.
pub struct CloseCode;

impl CloseCode {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away (shutdown, idle timeout).
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Data type the endpoint cannot accept.
    pub const UNSUPPORTED: u16 = 1003;
    /// No status code was present. Never sent on the wire.
    pub const NO_STATUS: u16 = 1005;
    /// Connection dropped without a close frame. Never sent on the wire.
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload data (bad UTF-8).
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation.
    pub const POLICY: u16 = 1008;
    /// Message too big.
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    /// Unexpected condition on the server.
    pub const INTERNAL_ERROR: u16 = 1011;

    /// Whether `code` may appear in a close frame on the wire.
    pub fn is_valid(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

/// Status code and reason carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Build a close payload from an optional code and reason.
///
/// Without a code the payload is empty and any reason is dropped, since a
/// reason cannot be sent without a status. The reason is truncated to
/// [`MAX_REASON_LEN`] bytes on a character boundary.
pub fn build_close_payload(code: Option<u16>, reason: &str) -> Vec<u8> {
    let Some(code) = code else {
        return Vec::new();
    };

    let mut end = reason.len().min(MAX_REASON_LEN);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut payload = Vec::with_capacity(2 + end);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    payload
}

/// Parse an inbound close payload.
///
/// Returns `Ok(None)` for an empty payload (no status communicated).
pub fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseFrame>> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(ProtocolError::violation(constants::ERR_CLOSE_PAYLOAD_LENGTH)),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !CloseCode::is_valid(code) {
                return Err(ProtocolError::ProtocolViolation(format!(
                    "{}: {code}",
                    constants::ERR_CLOSE_CODE
                )));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| ProtocolError::InvalidPayload(constants::ERR_INVALID_UTF8.into()))?;
            Ok(Some(CloseFrame::new(code, reason)))
        }
    }
}

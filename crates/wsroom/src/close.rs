//! Close status codes and close frame payloads (RFC 6455 Section 5.5.1, 7.4).
//!
//! - [`CloseCode`]: well-known status codes plus application-defined ones
//! - [`parse_close_payload`]: extract status code + reason from a received close frame
//! - [`build_close_payload`]: build the payload for an outgoing close frame

use std::fmt;

use crate::error::ProtocolError;

/// Maximum reason length so the whole close payload fits a control frame (125 - 2).
const MAX_REASON_LEN: usize = 123;

/// WebSocket close status codes per RFC 6455 Section 7.4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000: the purpose of the connection has been fulfilled.
    Normal,
    /// 1001: endpoint is going away (server shutdown, page navigation).
    GoingAway,
    /// 1002: protocol error.
    ProtocolError,
    /// 1003: received a data type it cannot accept.
    UnsupportedData,
    /// 1005: no status code was present. Never sent on the wire.
    NoStatus,
    /// 1006: connection dropped without a close frame. Never sent on the wire.
    Abnormal,
    /// 1007: payload inconsistent with the message type (e.g. non-UTF-8 text).
    InvalidPayload,
    /// 1008: policy violation.
    PolicyViolation,
    /// 1009: message too big to process.
    MessageTooBig,
    /// 1010: client expected an extension the server did not negotiate.
    MandatoryExtension,
    /// 1011: unexpected condition on the server.
    InternalError,
    /// 1012: service is restarting.
    ServiceRestart,
    /// 1013: try again later.
    TryAgainLater,
    /// 1015: TLS handshake failure. Never sent on the wire.
    TlsHandshake,
    /// Any other code (library 3000-3999, application 4000-4999, or unassigned).
    Other(u16),
}

impl CloseCode {
    /// Returns true if this code may appear in a close frame on the wire.
    pub fn is_sendable(self) -> bool {
        match self {
            CloseCode::NoStatus | CloseCode::Abnormal | CloseCode::TlsHandshake => false,
            CloseCode::Other(code) => (3000..=4999).contains(&code),
            _ => true,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::UnsupportedData,
            1005 => CloseCode::NoStatus,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1010 => CloseCode::MandatoryExtension,
            1011 => CloseCode::InternalError,
            1012 => CloseCode::ServiceRestart,
            1013 => CloseCode::TryAgainLater,
            1015 => CloseCode::TlsHandshake,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::UnsupportedData => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::MandatoryExtension => 1010,
            CloseCode::InternalError => 1011,
            CloseCode::ServiceRestart => 1012,
            CloseCode::TryAgainLater => 1013,
            CloseCode::TlsHandshake => 1015,
            CloseCode::Other(code) => code,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// The status a connection closed with, as sent or received in a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        CloseFrame {
            code,
            reason: reason.into(),
        }
    }

    /// Returns true if the close was not an orderly handshake.
    pub fn is_abnormal(&self) -> bool {
        self.code == CloseCode::Abnormal
    }
}

impl fmt::Display for CloseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "code {}", self.code)
        } else {
            write!(f, "code {}: {}", self.code, self.reason)
        }
    }
}

/// Parse a received close frame payload into a [`CloseFrame`].
///
/// Per RFC 6455 Section 5.5.1:
/// - An empty payload means no status code was present (1005).
/// - A 1-byte payload is malformed.
/// - Otherwise the first 2 bytes are the big-endian code and the rest is a
///   UTF-8 reason. Codes that must never appear on the wire are rejected.
pub fn parse_close_payload(payload: &[u8]) -> Result<CloseFrame, ProtocolError> {
    match payload.len() {
        0 => Ok(CloseFrame::new(CloseCode::NoStatus, "")),
        1 => Err(ProtocolError::InvalidClosePayload),
        _ => {
            let raw = u16::from_be_bytes([payload[0], payload[1]]);
            let code = CloseCode::from(raw);
            let valid = match code {
                CloseCode::Other(c) => (3000..=4999).contains(&c),
                other => other.is_sendable(),
            };
            if !valid {
                return Err(ProtocolError::InvalidCloseCode(raw));
            }
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| ProtocolError::InvalidUtf8)?
                .to_string();
            Ok(CloseFrame { code, reason })
        }
    }
}

/// Build a close frame payload from a status code and reason string.
///
/// The payload is 2 bytes for the code (big-endian) followed by the reason
/// bytes, truncated at a character boundary so the total stays within the
/// 125-byte control frame limit.
pub fn build_close_payload(code: CloseCode, reason: &str) -> Vec<u8> {
    let mut end = reason.len().min(MAX_REASON_LEN);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }

    let mut payload = Vec::with_capacity(2 + end);
    payload.extend_from_slice(&u16::from(code).to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..end]);
    payload
}

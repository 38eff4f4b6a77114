//! Error types for the WebSocket engine.
//!
//! The taxonomy follows the layers of the protocol:
//!
//! - [`HandshakeError`]: the HTTP upgrade request was unacceptable; the
//!   stream never becomes a WebSocket.
//! - [`ProtocolError`]: the peer violated RFC 6455 framing rules. Always fatal
//!   to the connection, and each variant maps to the close status sent back.
//! - [`WsError`]: the crate-level error returned by connection and room
//!   operations, wrapping the two above plus transport failures.
//! - [`RoomError`]: failures surfaced by a [`Room`](crate::Room).
//!
//! An incomplete frame is not an error: the decoder returns `Ok(None)`.

use std::io;

use thiserror::Error;

use crate::close::{CloseCode, CloseFrame};
use crate::connection::ConnectionId;

/// Result type for WebSocket operations.
pub type Result<T> = std::result::Result<T, WsError>;

/// The upgrade request could not be turned into a WebSocket.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("missing or invalid Upgrade header")]
    InvalidUpgradeHeader,
    #[error("missing or invalid Connection header")]
    InvalidConnectionHeader,
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
    #[error("unsupported Sec-WebSocket-Version {0:?} (must be 13)")]
    UnsupportedVersion(String),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("I/O error during handshake: {0}")]
    Io(#[from] io::Error),
}

/// A violation of the RFC 6455 framing rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("non-zero RSV bits without negotiated extensions")]
    ReservedBitsSet,
    #[error("unknown opcode: 0x{0:X}")]
    InvalidOpcode(u8),
    #[error("MSB of 64-bit payload length must be 0")]
    InvalidLength,
    #[error("control frame cannot be fragmented")]
    FragmentedControlFrame,
    #[error("control frame payload too large: {0} bytes (max 125)")]
    ControlFrameTooLarge(u64),
    #[error("client frame must be masked")]
    UnmaskedFrame,
    #[error("server frame must not be masked")]
    MaskedFrame,
    #[error("unexpected continuation frame")]
    UnexpectedContinuation,
    #[error("new data frame during fragmented message")]
    InterleavedDataFrame,
    #[error("message too big: {size} bytes (max {max})")]
    MessageTooBig { size: u64, max: usize },
    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,
    #[error("invalid close frame payload")]
    InvalidClosePayload,
    #[error("invalid close code: {0}")]
    InvalidCloseCode(u16),
}

impl ProtocolError {
    /// The close status sent to the peer when this violation terminates the connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            ProtocolError::MessageTooBig { .. } => CloseCode::MessageTooBig,
            ProtocolError::InvalidUtf8 => CloseCode::InvalidPayload,
            _ => CloseCode::ProtocolError,
        }
    }
}

/// Crate-level error for connection and room operations.
#[derive(Debug, Error)]
pub enum WsError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The connection is closed; carries the status it closed with.
    #[error("connection closed ({0})")]
    Closed(CloseFrame),
}

impl WsError {
    /// Returns the close frame if this error is a terminal closure.
    pub fn close_frame(&self) -> Option<&CloseFrame> {
        match self {
            WsError::Closed(frame) => Some(frame),
            _ => None,
        }
    }
}

/// Failures surfaced by a room.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room {0:?} is closed")]
    Closed(String),
    #[error("broadcast to connection {peer} failed: {source}")]
    Broadcast {
        peer: ConnectionId,
        #[source]
        source: WsError,
    },
}

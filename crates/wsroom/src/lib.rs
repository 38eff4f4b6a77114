//! RFC 6455 WebSocket engine with broadcast rooms.
//!
//! - **Handshake** (`handshake`): upgrade validation, Sec-WebSocket-Accept, request head parsing
//! - **Frame codec** (`frame`): incremental decode from a residual buffer, encode, XOR masking
//! - **Reassembly** (`reassembly`): fragments to complete messages, size limits
//! - **Close** (`close`): status codes and close payloads
//! - **Connection** (`connection`): read/write over any duplex stream, close handshake
//! - **Room** (`room`): ordered enter/leave/message events and fan-out broadcast
//!
//! Everything is blocking and thread-based: one thread per connection read
//! loop, one coordinating thread per room.

pub mod close;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod reassembly;
pub mod room;

#[cfg(test)]
mod testing;

pub use close::{build_close_payload, parse_close_payload, CloseCode, CloseFrame};
pub use config::{ConnectionConfig, RoomConfig};
pub use connection::{Connection, ConnectionId, ConnectionState, Role, Transport};
pub use error::{HandshakeError, ProtocolError, Result, RoomError, WsError};
pub use frame::{apply_mask, decode, encode, encode_masked, Frame, Opcode};
pub use handshake::{compute_accept_key, read_request_head, Negotiator, RequestHead};
pub use reassembly::{Message, Reassembler};
pub use room::{EventKind, LoggingHooks, Peer, Room, RoomEvent, RoomHooks};

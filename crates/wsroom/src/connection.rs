//! One WebSocket peer session over a raw duplex stream.
//!
//! A [`Connection`] turns the byte stream into messages and back:
//!
//! ```text
//! read_message (one reader at a time)
//!     |
//!     +-- read chunk -> residual buffer -> decode frame
//!     +-- Ping  -> Pong echo (writer lock)
//!     +-- Pong  -> liveness timestamp
//!     +-- Close -> echo / complete handshake -> Closed
//!     +-- data  -> Reassembler -> Message
//!
//! write_message / ping / close (any thread, serialized by the writer lock)
//! ```
//!
//! The stream is held as three handles: one owned by the reader, one behind
//! the writer lock, and one used only to shut the socket down so that a
//! blocked reader or writer is released without taking either lock.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::close::{build_close_payload, parse_close_payload, CloseCode, CloseFrame};
use crate::config::ConnectionConfig;
use crate::error::{ProtocolError, Result, WsError};
use crate::frame::{self, decode_header, encode, encode_masked, Frame, Opcode, MAX_CONTROL_PAYLOAD};
use crate::reassembly::{Message, Reassembler};

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A duplex byte stream a connection can run over.
///
/// Implementations must hand out independent handles to the same underlying
/// stream, and `shutdown` must release readers blocked on any handle.
pub trait Transport: Read + Write + Send + Sync + Sized + 'static {
    fn try_clone(&self) -> io::Result<Self>;
    /// Shut down both directions of the stream.
    fn shutdown(&self) -> io::Result<()>;
    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()>;
    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, dur)
    }

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, dur)
    }
}

#[cfg(unix)]
impl Transport for std::os::unix::net::UnixStream {
    fn try_clone(&self) -> io::Result<Self> {
        std::os::unix::net::UnixStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, Shutdown::Both)
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, dur)
    }

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_write_timeout(self, dur)
    }
}

// ---------------------------------------------------------------------------
// Identity, role, state
// ---------------------------------------------------------------------------

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a fresh id. Ids increase monotonically.
    pub fn next() -> ConnectionId {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which end of the connection we are. Decides masking in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Expects masked frames, writes unmasked ones.
    Server,
    /// Expects unmasked frames, writes masked ones.
    Client,
}

/// Close handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// We sent a close frame and are waiting for the peer's.
    ClosingSent,
    /// The peer sent a close frame and our reply is on its way.
    ClosingReceived,
    Closed,
}

#[derive(Debug)]
struct Status {
    state: ConnectionState,
    /// Close frame sent while closing, then the final status once closed.
    close: Option<CloseFrame>,
}

struct ReadHalf<T> {
    stream: T,
    buffer: Vec<u8>,
    reassembler: Reassembler,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A WebSocket connection over transport `T`.
///
/// Share it as `Arc<Connection<T>>`: one thread drives [`read_message`]
/// while any number of threads write.
///
/// [`read_message`]: Connection::read_message
pub struct Connection<T: Transport> {
    id: ConnectionId,
    role: Role,
    config: ConnectionConfig,
    reader: Mutex<ReadHalf<T>>,
    writer: Mutex<T>,
    control: T,
    status: Mutex<Status>,
    state_changed: Condvar,
    last_pong: Mutex<Option<Instant>>,
}

impl<T: Transport> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

impl<T: Transport> Connection<T> {
    /// Wrap an already-upgraded stream.
    pub fn new(stream: T, role: Role, config: ConnectionConfig) -> io::Result<Connection<T>> {
        Self::with_buffered(stream, role, config, Vec::new())
    }

    /// Wrap an already-upgraded stream, seeding the read buffer with bytes
    /// that were read off the stream before the upgrade completed.
    pub fn with_buffered(
        stream: T,
        role: Role,
        config: ConnectionConfig,
        buffered: Vec<u8>,
    ) -> io::Result<Connection<T>> {
        let writer = stream.try_clone()?;
        let control = stream.try_clone()?;
        let reassembler = Reassembler::new(config.max_message_size);
        Ok(Connection {
            id: ConnectionId::next(),
            role,
            config,
            reader: Mutex::new(ReadHalf {
                stream,
                buffer: buffered,
                reassembler,
            }),
            writer: Mutex::new(writer),
            control,
            status: Mutex::new(Status {
                state: ConnectionState::Open,
                close: None,
            }),
            state_changed: Condvar::new(),
            last_pong: Mutex::new(None),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.status.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// The status the connection closed with, once it is closed.
    pub fn close_status(&self) -> Option<CloseFrame> {
        let status = self.status.lock();
        match status.state {
            ConnectionState::Closed => status.close.clone(),
            _ => None,
        }
    }

    /// When the last Pong arrived, if any.
    pub fn last_pong(&self) -> Option<Instant> {
        *self.last_pong.lock()
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    /// Block until the next complete message.
    ///
    /// Control frames are handled along the way: Ping is answered with a
    /// Pong carrying the same payload, Pong refreshes [`last_pong`], and Close
    /// runs the close handshake and returns [`WsError::Closed`]. Once the
    /// connection is closed every call returns `WsError::Closed` immediately.
    ///
    /// [`last_pong`]: Connection::last_pong
    pub fn read_message(&self) -> Result<Message> {
        let mut reader = self.reader.lock();
        loop {
            if let Some(frame) = self.close_status() {
                return Err(WsError::Closed(frame));
            }
            let Some(frame) = self.next_frame(&mut reader)? else {
                return Err(WsError::Closed(self.on_eof()));
            };
            if let Some(message) = self.handle_frame(&mut reader, frame)? {
                return Ok(message);
            }
        }
    }

    /// Read and decode the next frame, buffering across stream reads.
    /// `Ok(None)` means the stream reached EOF.
    fn next_frame(&self, reader: &mut MutexGuard<'_, ReadHalf<T>>) -> Result<Option<Frame>> {
        loop {
            match decode_header(&reader.buffer) {
                Ok(Some(header)) => {
                    if let Err(e) = self.check_header(header.opcode, header.mask_key.is_some(), header.payload_len) {
                        return Err(self.fail(e));
                    }
                    match frame::decode(&reader.buffer) {
                        Ok(Some((frame, used))) => {
                            reader.buffer.drain(..used);
                            return Ok(Some(frame));
                        }
                        Ok(None) => {}
                        Err(e) => return Err(self.fail(e)),
                    }
                }
                Ok(None) => {}
                Err(e) => return Err(self.fail(e)),
            }

            let mut chunk = vec![0u8; self.config.read_buffer_size.max(1)];
            let n = match reader.stream.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_timeout(&e) => return Err(e.into()),
                Err(e) => {
                    if let Some(frame) = self.close_status() {
                        return Err(WsError::Closed(frame));
                    }
                    debug!(conn = %self.id, error = %e, "transport error");
                    self.finish(CloseFrame::new(CloseCode::Abnormal, e.to_string()));
                    return Err(e.into());
                }
            };
            if n == 0 {
                return Ok(None);
            }
            reader.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Checks that only need the header: masking direction and declared size.
    fn check_header(&self, opcode: Opcode, masked: bool, payload_len: u64) -> std::result::Result<(), ProtocolError> {
        match self.role {
            Role::Server if !masked => return Err(ProtocolError::UnmaskedFrame),
            Role::Client if masked => return Err(ProtocolError::MaskedFrame),
            _ => {}
        }
        if opcode.is_data() && payload_len > self.config.max_message_size as u64 {
            return Err(ProtocolError::MessageTooBig {
                size: payload_len,
                max: self.config.max_message_size,
            });
        }
        Ok(())
    }

    fn handle_frame(
        &self,
        reader: &mut MutexGuard<'_, ReadHalf<T>>,
        frame: Frame,
    ) -> Result<Option<Message>> {
        match frame.opcode {
            Opcode::Ping => {
                if self.is_open() {
                    self.send_frame(Opcode::Pong, &frame.payload, true)?;
                }
                Ok(None)
            }
            Opcode::Pong => {
                *self.last_pong.lock() = Some(Instant::now());
                Ok(None)
            }
            Opcode::Close => {
                let received = match parse_close_payload(&frame.payload) {
                    Ok(received) => received,
                    Err(e) => return Err(self.fail(e)),
                };
                Err(WsError::Closed(self.on_close_received(received)))
            }
            Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                match reader.reassembler.push(frame) {
                    Ok(Some(message)) => {
                        // Validate the reassembled payload, not individual fragments
                        if message.is_text() && std::str::from_utf8(&message.payload).is_err() {
                            return Err(self.fail(ProtocolError::InvalidUtf8));
                        }
                        Ok(Some(message))
                    }
                    Ok(None) => Ok(None),
                    Err(e) => Err(self.fail(e)),
                }
            }
        }
    }

    /// The peer sent a close frame.
    fn on_close_received(&self, received: CloseFrame) -> CloseFrame {
        let state = {
            let mut status = self.status.lock();
            let state = status.state;
            if state == ConnectionState::Open {
                status.state = ConnectionState::ClosingReceived;
                self.state_changed.notify_all();
            }
            state
        };

        match state {
            ConnectionState::Open => {
                debug!(conn = %self.id, code = %received.code, "peer initiated close");
                // Echo the status code; 1005 means there was none to echo
                let payload = if received.code.is_sendable() {
                    build_close_payload(received.code, "")
                } else {
                    Vec::new()
                };
                if let Err(e) = self.send_close_frame(&payload) {
                    debug!(conn = %self.id, error = %e, "failed to echo close frame");
                }
                self.finish(received)
            }
            ConnectionState::ClosingSent => {
                debug!(conn = %self.id, code = %received.code, "close handshake complete");
                self.finish(received)
            }
            ConnectionState::ClosingReceived | ConnectionState::Closed => self
                .close_status()
                .unwrap_or(received),
        }
    }

    /// The stream ended. Normal only if the peer's close frame came first.
    fn on_eof(&self) -> CloseFrame {
        if let Some(frame) = self.close_status() {
            return frame;
        }
        debug!(conn = %self.id, "stream ended without close frame");
        self.finish(CloseFrame::new(
            CloseCode::Abnormal,
            "connection closed without close frame",
        ))
    }

    /// Terminate the connection for a protocol violation: send the matching
    /// close status (best-effort) and shut the stream down.
    fn fail(&self, error: ProtocolError) -> WsError {
        let code = error.close_code();
        warn!(conn = %self.id, code = %code, error = %error, "protocol error, closing connection");
        if self.is_open() {
            let payload = build_close_payload(code, &error.to_string());
            let _ = self.send_close_frame(&payload);
        }
        self.finish(CloseFrame::new(code, error.to_string()));
        WsError::Protocol(error)
    }

    /// Move to `Closed` (first caller wins), wake waiters, shut the stream.
    fn finish(&self, frame: CloseFrame) -> CloseFrame {
        let final_frame = {
            let mut status = self.status.lock();
            if status.state == ConnectionState::Closed {
                return status.close.clone().unwrap_or(frame);
            }
            status.state = ConnectionState::Closed;
            status.close = Some(frame.clone());
            self.state_changed.notify_all();
            frame
        };
        if let Err(e) = self.control.shutdown() {
            if e.kind() != io::ErrorKind::NotConnected {
                debug!(conn = %self.id, error = %e, "stream shutdown failed");
            }
        }
        final_frame
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    fn encode_for_role(&self, payload: &[u8], opcode: Opcode, fin: bool) -> Vec<u8> {
        match self.role {
            Role::Server => encode(payload, opcode, fin),
            Role::Client => encode_masked(payload, opcode, fin, rand::random()),
        }
    }

    /// Write one frame under the writer lock.
    fn send_frame(&self, opcode: Opcode, payload: &[u8], fin: bool) -> Result<()> {
        let bytes = self.encode_for_role(payload, opcode, fin);
        let mut writer = self.writer.lock();
        writer.write_all(&bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Write a close frame, waiting at most the close timeout for the writer
    /// lock and for the write itself. A writer stuck on a peer that stopped
    /// reading is released by the shutdown that follows.
    fn send_close_frame(&self, payload: &[u8]) -> Result<()> {
        let bytes = self.encode_for_role(payload, Opcode::Close, true);
        let timeout = self.config.close_timeout();
        let Some(mut writer) = self.writer.try_lock_for(timeout) else {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "writer busy, close frame not sent",
            )
            .into());
        };
        writer.set_write_timeout(Some(timeout))?;
        writer.write_all(&bytes)?;
        writer.flush()?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        let status = self.status.lock();
        match status.state {
            ConnectionState::Open => Ok(()),
            _ => Err(WsError::Closed(
                status
                    .close
                    .clone()
                    .unwrap_or_else(|| CloseFrame::new(CloseCode::Normal, "")),
            )),
        }
    }

    fn check_data_payload(payload: &[u8], opcode: Opcode) -> Result<()> {
        match opcode {
            Opcode::Text => {
                if std::str::from_utf8(payload).is_err() {
                    return Err(ProtocolError::InvalidUtf8.into());
                }
                Ok(())
            }
            Opcode::Binary => Ok(()),
            other => Err(ProtocolError::InvalidOpcode(other as u8).into()),
        }
    }

    /// Send a complete message as a single `fin=true` frame.
    ///
    /// `opcode` must be `Text` or `Binary`; text payloads must be UTF-8.
    pub fn write_message(&self, payload: &[u8], opcode: Opcode) -> Result<()> {
        Self::check_data_payload(payload, opcode)?;
        self.ensure_open()?;
        self.send_frame(opcode, payload, true)
    }

    /// Send a message split into frames of at most `fragment_size` bytes.
    ///
    /// The writer lock is held for the whole message so fragments from
    /// concurrent writers never interleave.
    pub fn write_fragmented(&self, payload: &[u8], opcode: Opcode, fragment_size: usize) -> Result<()> {
        Self::check_data_payload(payload, opcode)?;
        self.ensure_open()?;

        let fragment_size = fragment_size.max(1);
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![payload]
        } else {
            payload.chunks(fragment_size).collect()
        };
        let last = chunks.len() - 1;

        let mut writer = self.writer.lock();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let frame_opcode = if i == 0 { opcode } else { Opcode::Continuation };
            writer.write_all(&self.encode_for_role(chunk, frame_opcode, i == last))?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Send a Ping. The payload must fit a control frame (125 bytes).
    pub fn ping(&self, payload: &[u8]) -> Result<()> {
        if payload.len() as u64 > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::ControlFrameTooLarge(payload.len() as u64).into());
        }
        self.ensure_open()?;
        self.send_frame(Opcode::Ping, payload, true)
    }

    // -----------------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------------

    /// Start (or acknowledge) the close handshake and shut the stream down.
    ///
    /// Idempotent: once a close is under way or done, further calls return
    /// `Ok(())`. When we initiate, waits up to the configured close timeout
    /// for the peer's close frame before forcing the stream shut. If no other
    /// thread is reading, the wait drains incoming frames itself.
    ///
    /// If the close frame cannot be written within the close timeout (another
    /// writer is blocked on a peer that stopped reading), the connection is
    /// closed as abnormal, the stream is shut down and the write error is
    /// returned.
    pub fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        let sent = CloseFrame::new(code, reason);
        {
            let mut status = self.status.lock();
            if status.state != ConnectionState::Open {
                return Ok(());
            }
            status.state = ConnectionState::ClosingSent;
            status.close = Some(sent.clone());
            self.state_changed.notify_all();
        }
        debug!(conn = %self.id, code = %code, "sending close frame");

        let payload = if code.is_sendable() {
            build_close_payload(code, reason)
        } else {
            Vec::new()
        };
        if let Err(e) = self.send_close_frame(&payload) {
            debug!(conn = %self.id, error = %e, "close frame not sent, dropping connection");
            self.finish(CloseFrame::new(CloseCode::Abnormal, e.to_string()));
            return Err(e);
        }

        let deadline = Instant::now() + self.config.close_timeout();
        match self.reader.try_lock() {
            Some(mut reader) => self.drain_until_closed(&mut reader, deadline),
            None => {
                let mut status = self.status.lock();
                while status.state != ConnectionState::Closed {
                    if self.state_changed.wait_until(&mut status, deadline).timed_out() {
                        break;
                    }
                }
            }
        }

        if self.state() != ConnectionState::Closed {
            debug!(conn = %self.id, "close handshake timed out");
        }
        self.finish(sent);
        Ok(())
    }

    /// Read frames until the peer's close arrives, the stream ends, or the deadline passes.
    fn drain_until_closed(&self, reader: &mut MutexGuard<'_, ReadHalf<T>>, deadline: Instant) {
        loop {
            if self.state() == ConnectionState::Closed {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            if reader.stream.set_read_timeout(Some(remaining)).is_err() {
                return;
            }
            match self.next_frame(reader) {
                Ok(Some(frame)) if frame.opcode == Opcode::Close => {
                    let received = parse_close_payload(&frame.payload)
                        .unwrap_or_else(|_| CloseFrame::new(CloseCode::ProtocolError, ""));
                    self.on_close_received(received);
                    return;
                }
                // Data and other control frames are discarded while closing
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return,
            }
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

//! Accept loop and per-connection handling.
//!
//! One thread per accepted stream:
//!
//! 1. read the HTTP request head
//! 2. paths other than the WebSocket path get a plain `200 OK` greeting
//! 3. upgrade, enter the room, forward every message as a room event
//! 4. leave the room when the read loop ends

use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};
use wsroom::handshake::write_bad_request;
use wsroom::{
    read_request_head, Connection, EventKind, Negotiator, Room, RoomEvent, RoomError, WsError,
};

const GREETING: &str = "Hello World!";

/// Shared state for every connection handler.
pub struct ChatServer {
    negotiator: Negotiator,
    room: Arc<Room>,
    ws_path: String,
}

impl ChatServer {
    pub fn new(negotiator: Negotiator, room: Arc<Room>, ws_path: impl Into<String>) -> ChatServer {
        ChatServer {
            negotiator,
            room,
            ws_path: ws_path.into(),
        }
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    /// Accept connections until the listener fails.
    pub fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, room = %self.room.name(), "chat server listening");
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let server = Arc::clone(&self);
            let spawned = thread::Builder::new()
                .name("chat-conn".to_string())
                .spawn(move || server.handle_stream(stream));
            if let Err(e) = spawned {
                warn!(error = %e, "failed to spawn connection thread");
            }
        }
        Ok(())
    }

    fn handle_stream(&self, mut stream: TcpStream) {
        let peer_addr = stream.peer_addr().ok();
        let head = match read_request_head(&mut stream) {
            Ok(head) => head,
            Err(e) => {
                debug!(peer = ?peer_addr, error = %e, "bad request head");
                let _ = write_bad_request(&mut stream, &e.to_string());
                return;
            }
        };

        if head.path != self.ws_path {
            if let Err(e) = write_greeting(&mut stream) {
                debug!(peer = ?peer_addr, error = %e, "failed to write greeting");
            }
            return;
        }

        let conn = match self.negotiator.accept(stream, &head) {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                debug!(peer = ?peer_addr, error = %e, "upgrade rejected");
                return;
            }
        };
        info!(conn = %conn.id(), peer = ?peer_addr, "client connected");

        if let Err(e) = self.run_session(&conn) {
            debug!(conn = %conn.id(), error = %e, "session ended early");
        }
    }

    fn run_session(&self, conn: &Arc<Connection<TcpStream>>) -> Result<(), RoomError> {
        let id = conn.id();
        self.room.enter(conn.clone(), format!("{id} joined"))?;

        let result = loop {
            match conn.read_message() {
                Ok(msg) => {
                    let event = RoomEvent::new(EventKind::Message, conn.clone(), msg.payload)
                        .with_opcode(msg.opcode);
                    if let Err(e) = self.room.submit(event) {
                        break Err(e);
                    }
                }
                Err(WsError::Closed(frame)) => {
                    info!(conn = %id, code = %frame.code, "client disconnected");
                    break Ok(());
                }
                Err(e) => {
                    warn!(conn = %id, error = %e, "connection failed");
                    break Ok(());
                }
            }
        };

        // Leave even if forwarding failed, unless the room itself is gone
        match self.room.leave(conn.clone(), format!("{id} left")) {
            Err(RoomError::Closed(_)) | Ok(()) => result,
            Err(e) => Err(e),
        }
    }
}

fn write_greeting<W: Write>(stream: &mut W) -> io::Result<()> {
    write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        GREETING.len(),
        GREETING
    )?;
    stream.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::Duration;
    use wsroom::{ConnectionConfig, LoggingHooks, Opcode, Role, RoomConfig};

    fn start() -> (u16, Arc<ChatServer>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let room = Arc::new(Room::new("test", RoomConfig::default(), Arc::new(LoggingHooks)).unwrap());
        let server = Arc::new(ChatServer::new(
            Negotiator::new(ConnectionConfig::default()),
            room,
            "/ws",
        ));
        let serving = Arc::clone(&server);
        thread::spawn(move || serving.serve(listener));
        (port, server)
    }

    fn connect_client(port: u16) -> Connection<TcpStream> {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        write!(
            stream,
            "GET /ws HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
        )
        .unwrap();

        let mut resp = Vec::new();
        let mut byte = [0u8; 1];
        while !resp.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            resp.push(byte[0]);
        }
        assert!(resp.starts_with(b"HTTP/1.1 101"));
        Connection::new(stream, Role::Client, ConnectionConfig::default()).unwrap()
    }

    #[test]
    fn root_path_gets_greeting() {
        let (port, _server) = start();
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        let mut resp = String::new();
        stream.read_to_string(&mut resp).unwrap();
        assert!(resp.starts_with("HTTP/1.1 200 OK"));
        assert!(resp.ends_with("Hello World!"));
    }

    #[test]
    fn missing_key_gets_400() {
        let (port, _server) = start();
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .write_all(b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
            .unwrap();
        let mut resp = String::new();
        stream.read_to_string(&mut resp).unwrap();
        assert!(resp.starts_with("HTTP/1.1 400"), "got: {resp}");
    }

    #[test]
    fn messages_are_broadcast_to_everyone() {
        let (port, server) = start();

        let alice = connect_client(port);
        let joined = alice.read_message().unwrap();
        assert!(joined.as_text().unwrap().ends_with("joined"));

        let bob = connect_client(port);
        assert!(bob.read_message().unwrap().as_text().unwrap().ends_with("joined"));
        assert!(alice.read_message().unwrap().as_text().unwrap().ends_with("joined"));
        assert_eq!(server.room().len(), 2);

        alice.write_message(b"hello bob", Opcode::Text).unwrap();
        assert_eq!(alice.read_message().unwrap().as_text(), Some("hello bob"));
        assert_eq!(bob.read_message().unwrap().as_text(), Some("hello bob"));

        bob.close(wsroom::CloseCode::Normal, "").unwrap();
        let left = alice.read_message().unwrap();
        assert!(left.as_text().unwrap().ends_with("left"));
        assert_eq!(server.room().len(), 1);
    }
}

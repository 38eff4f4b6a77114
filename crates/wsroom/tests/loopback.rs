//! End-to-end tests over real loopback TCP sockets.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use wsroom::{
    decode, encode_masked, parse_close_payload, read_request_head, CloseCode, Connection,
    ConnectionConfig, Frame, Message, Negotiator, Opcode, Room, RoomConfig, LoggingHooks, WsError,
};

const MASK: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

// ── Helpers ──────────────────────────────────────────────────────────

/// Accept connections, upgrade each, and hand the connection to `handler` on its own thread.
fn start_server<F>(handler: F) -> u16
where
    F: Fn(Arc<Connection<TcpStream>>) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handler = Arc::new(handler);
    let negotiator = Negotiator::new(ConnectionConfig {
        close_timeout_ms: 500,
        ..ConnectionConfig::default()
    });

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let handler = Arc::clone(&handler);
            let negotiator = negotiator.clone();
            thread::spawn(move || {
                let Ok(head) = read_request_head(&mut stream) else { return };
                if let Ok(conn) = negotiator.accept(stream, &head) {
                    handler(Arc::new(conn));
                }
            });
        }
    });
    port
}

/// Run the read loop, reporting every message and the final error.
fn start_reporting_server() -> (u16, mpsc::Receiver<Result<Message, String>>) {
    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    let port = start_server(move |conn| {
        let tx = tx.lock().unwrap().clone();
        loop {
            match conn.read_message() {
                Ok(msg) => {
                    let _ = tx.send(Ok(msg));
                }
                Err(WsError::Closed(frame)) => {
                    let _ = tx.send(Err(format!("closed {}", u16::from(frame.code))));
                    return;
                }
                Err(e) => {
                    let _ = tx.send(Err(e.to_string()));
                    return;
                }
            }
        }
    });
    (port, rx)
}

fn ws_connect(port: u16) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    write!(
        stream,
        "GET /ws HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
    )
    .unwrap();
    stream.flush().unwrap();

    // Byte-by-byte so no frame bytes are consumed with the response
    let mut resp = Vec::new();
    let mut byte = [0u8; 1];
    while !resp.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        resp.push(byte[0]);
    }
    let resp = String::from_utf8_lossy(&resp);
    assert!(resp.starts_with("HTTP/1.1 101"), "expected 101, got: {resp}");
    assert!(resp.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    stream
}

fn send(stream: &mut TcpStream, opcode: Opcode, payload: &[u8], fin: bool) {
    stream.write_all(&encode_masked(payload, opcode, fin, MASK)).unwrap();
    stream.flush().unwrap();
}

fn read_frame(stream: &mut TcpStream) -> Frame {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1];
    loop {
        if let Some((frame, _)) = decode(&buf).unwrap() {
            return frame;
        }
        stream.read_exact(&mut chunk).unwrap();
        buf.push(chunk[0]);
    }
}

fn assert_eof(stream: &mut TcpStream) {
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty(), "unexpected trailing bytes: {rest:?}");
}

fn next(rx: &mpsc::Receiver<Result<Message, String>>) -> Result<Message, String> {
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

// ── Tests ────────────────────────────────────────────────────────────

#[test]
fn test_client_close_gets_reply_and_stream_closes() {
    let (port, rx) = start_reporting_server();
    let mut stream = ws_connect(port);

    send(&mut stream, Opcode::Text, b"hello", true);
    assert_eq!(next(&rx), Ok(Message::text("hello")));

    send(&mut stream, Opcode::Close, &1000u16.to_be_bytes(), true);
    let reply = read_frame(&mut stream);
    assert_eq!(reply.opcode, Opcode::Close);
    assert!(!reply.masked);
    assert_eq!(parse_close_payload(&reply.payload).unwrap().code, CloseCode::Normal);
    assert_eof(&mut stream);

    assert_eq!(next(&rx), Err("closed 1000".to_string()));
}

#[test]
fn test_eof_without_close_is_abnormal_closure() {
    let (port, rx) = start_reporting_server();
    let stream = ws_connect(port);
    drop(stream);
    assert_eq!(next(&rx), Err("closed 1006".to_string()));
}

#[test]
fn test_ping_between_fragments() {
    let (port, rx) = start_reporting_server();
    let mut stream = ws_connect(port);

    send(&mut stream, Opcode::Text, b"ab", false);
    send(&mut stream, Opcode::Continuation, b"cd", false);
    send(&mut stream, Opcode::Ping, b"ping!", true);
    send(&mut stream, Opcode::Continuation, b"ef", true);

    let pong = read_frame(&mut stream);
    assert_eq!(pong.opcode, Opcode::Pong);
    assert_eq!(pong.payload, b"ping!");
    assert_eq!(next(&rx), Ok(Message::text("abcdef")));
}

#[test]
fn test_unmasked_frame_closes_with_protocol_error() {
    let (port, rx) = start_reporting_server();
    let mut stream = ws_connect(port);

    stream.write_all(&wsroom::encode(b"oops", Opcode::Text, true)).unwrap();
    let close = read_frame(&mut stream);
    assert_eq!(close.opcode, Opcode::Close);
    assert_eq!(
        parse_close_payload(&close.payload).unwrap().code,
        CloseCode::ProtocolError
    );
    assert!(next(&rx).is_err());
}

#[test]
fn test_server_initiated_close() {
    let port = start_server(|conn| {
        conn.close(CloseCode::GoingAway, "shutting down").unwrap();
    });
    let mut stream = ws_connect(port);

    let close = read_frame(&mut stream);
    let frame = parse_close_payload(&close.payload).unwrap();
    assert_eq!(frame.code, CloseCode::GoingAway);
    assert_eq!(frame.reason, "shutting down");

    // Complete the handshake; the server then shuts the stream
    send(&mut stream, Opcode::Close, &1001u16.to_be_bytes(), true);
    assert_eof(&mut stream);
}

#[test]
fn test_close_unblocks_writer_stuck_on_silent_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    // Connected but never reads, so the server's send buffer fills up
    let _silent_client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    let (stream, _) = listener.accept().unwrap();

    let conn = Arc::new(
        Connection::new(
            stream,
            wsroom::Role::Server,
            ConnectionConfig {
                close_timeout_ms: 200,
                ..ConnectionConfig::default()
            },
        )
        .unwrap(),
    );

    let writer = {
        let conn = Arc::clone(&conn);
        thread::spawn(move || conn.write_message(&vec![0u8; 64 * 1024 * 1024], Opcode::Binary))
    };
    thread::sleep(Duration::from_millis(200));

    let (tx, rx) = mpsc::channel();
    {
        let conn = Arc::clone(&conn);
        thread::spawn(move || {
            let _ = tx.send(conn.close(CloseCode::Normal, ""));
        });
    }
    let result = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("close() must return while another writer is blocked");
    assert!(result.is_err());
    assert_eq!(conn.state(), wsroom::ConnectionState::Closed);
    assert_eq!(conn.close_status().unwrap().code, CloseCode::Abnormal);

    // The shutdown releases the blocked writer with an error
    assert!(writer.join().unwrap().is_err());
}

#[test]
fn test_rejected_upgrade_gets_400() {
    let port = start_server(|_| {});
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
        .write_all(b"GET /ws HTTP/1.1\r\nHost: localhost\r\nConnection: Upgrade\r\n\r\n")
        .unwrap();
    let mut resp = String::new();
    stream.read_to_string(&mut resp).unwrap();
    assert!(resp.starts_with("HTTP/1.1 400"), "got: {resp}");
}

#[test]
fn test_room_broadcast_over_tcp() {
    let room = Arc::new(Room::new("lobby", RoomConfig::default(), Arc::new(LoggingHooks)).unwrap());
    let port = {
        let room = Arc::clone(&room);
        start_server(move |conn| {
            room.enter(conn.clone(), "joined").unwrap();
            while let Ok(msg) = conn.read_message() {
                room.submit(
                    wsroom::RoomEvent::new(wsroom::EventKind::Message, conn.clone(), msg.payload)
                        .with_opcode(msg.opcode),
                )
                .unwrap();
            }
            let _ = room.leave(conn.clone(), "left");
        })
    };

    let mut alice = ws_connect(port);
    assert_eq!(read_frame(&mut alice).payload, b"joined");
    let mut bob = ws_connect(port);
    assert_eq!(read_frame(&mut bob).payload, b"joined");
    assert_eq!(read_frame(&mut alice).payload, b"joined");

    send(&mut alice, Opcode::Text, b"hi all", true);
    for stream in [&mut alice, &mut bob] {
        let frame = read_frame(stream);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload, b"hi all");
    }

    send(&mut bob, Opcode::Close, &1000u16.to_be_bytes(), true);
    assert_eq!(read_frame(&mut bob).opcode, Opcode::Close);
    assert_eq!(read_frame(&mut alice).payload, b"left");

    room.close();
    let close = read_frame(&mut alice);
    assert_eq!(close.opcode, Opcode::Close);
    assert_eq!(parse_close_payload(&close.payload).unwrap().code, CloseCode::Normal);
}

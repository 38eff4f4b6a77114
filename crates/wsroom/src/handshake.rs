//! WebSocket HTTP upgrade handshake (RFC 6455 Section 4.2).
//!
//! Validates the client's upgrade headers, computes the
//! `Sec-WebSocket-Accept` value, and writes the `101 Switching Protocols`
//! response (or `400 Bad Request` on failure).
//!
//! - [`compute_accept_key`]: SHA-1 + Base64 computation per RFC 6455 Section 4.2.2
//! - [`validate_upgrade_request`]: Header validation against RFC requirements
//! - [`upgrade_response`]: The literal 101 response
//! - [`read_request_head`]: Minimal request-head reader for servers that own the raw socket
//! - [`Negotiator`]: Validates, responds, and wraps the stream in a [`Connection`]

use std::io::{BufRead, BufReader, Read, Write};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::connection::{Connection, Role, Transport};
use crate::error::{HandshakeError, WsError};

/// RFC 6455 magic GUID concatenated with the client key for Sec-WebSocket-Accept.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the request head, to keep a misbehaving client from
/// streaming headers forever.
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Compute the `Sec-WebSocket-Accept` value per RFC 6455 Section 4.2.2.
///
/// Concatenates `client_key` + [`WS_GUID`], SHA-1 hashes, then Base64 encodes.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Validate upgrade request headers per RFC 6455 Section 4.2.1.
///
/// Returns the client key if all required headers are present and valid,
/// or the first validation failure.
pub fn validate_upgrade_request(headers: &[(String, String)]) -> Result<String, HandshakeError> {
    // Upgrade must be "websocket" (case-insensitive value)
    match find_header(headers, "Upgrade") {
        Some(v) if v.trim().eq_ignore_ascii_case("websocket") => {}
        _ => return Err(HandshakeError::InvalidUpgradeHeader),
    }

    // Connection may carry several tokens, e.g. "keep-alive, Upgrade"
    match find_header(headers, "Connection") {
        Some(v) if v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")) => {}
        _ => return Err(HandshakeError::InvalidConnectionHeader),
    }

    let client_key = match find_header(headers, "Sec-WebSocket-Key") {
        Some(k) if !k.trim().is_empty() => k.trim().to_string(),
        _ => return Err(HandshakeError::MissingKey),
    };

    if let Some(version) = find_header(headers, "Sec-WebSocket-Version") {
        if version.trim() != "13" {
            return Err(HandshakeError::UnsupportedVersion(version.to_string()));
        }
    }

    Ok(client_key)
}

/// The `101 Switching Protocols` response for the given accept key.
pub fn upgrade_response(accept_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_key
    )
}

/// Write a `400 Bad Request` response with the given reason.
pub fn write_bad_request<W: Write>(stream: &mut W, reason: &str) -> std::io::Result<()> {
    let body = format!("Bad Request: {}", reason);
    write!(
        stream,
        "HTTP/1.1 400 Bad Request\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    )?;
    stream.flush()
}

/// An HTTP request line plus headers, read off a raw stream.
#[derive(Debug, Clone, Default)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    /// Bytes that arrived after the blank line. A conforming client sends
    /// nothing before the 101 response, but anything that did arrive belongs
    /// to the frame stream.
    pub leftover: Vec<u8>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// Read one `\n`-terminated line, buffering at most `limit` bytes.
///
/// Hitting the limit before the newline means the head is too large.
fn read_bounded_line<B: BufRead>(
    reader: &mut B,
    line: &mut String,
    limit: usize,
) -> Result<usize, HandshakeError> {
    let n = reader.by_ref().take(limit as u64).read_line(line)?;
    if n == limit && !line.ends_with('\n') {
        return Err(HandshakeError::MalformedRequest(format!(
            "request head exceeds {} bytes",
            MAX_HEAD_SIZE
        )));
    }
    Ok(n)
}

/// Read an HTTP request head (request line and headers up to the blank line).
///
/// Only what the upgrade needs is parsed; bodies are not read.
pub fn read_request_head<R: Read>(stream: &mut R) -> Result<RequestHead, HandshakeError> {
    let mut reader = BufReader::new(stream);
    let mut consumed = 0usize;

    let mut request_line = String::new();
    let n = read_bounded_line(&mut reader, &mut request_line, MAX_HEAD_SIZE)?;
    if n == 0 {
        return Err(HandshakeError::MalformedRequest(
            "connection closed before request line".to_string(),
        ));
    }
    consumed += n;
    let request_line = request_line.trim_end();
    let mut parts = request_line.splitn(3, ' ');
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(m), Some(p)) if !m.is_empty() => (m.to_string(), p.to_string()),
        _ => {
            return Err(HandshakeError::MalformedRequest(format!(
                "malformed request line: {:?}",
                request_line
            )))
        }
    };

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let n = read_bounded_line(&mut reader, &mut line, MAX_HEAD_SIZE - consumed)?;
        if n == 0 {
            return Err(HandshakeError::MalformedRequest(
                "connection closed before end of headers".to_string(),
            ));
        }
        consumed += n;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let leftover = reader.buffer().to_vec();
    if !leftover.is_empty() {
        warn!(
            bytes = leftover.len(),
            "bytes buffered beyond HTTP headers during WebSocket upgrade"
        );
    }

    Ok(RequestHead {
        method,
        path,
        headers,
        leftover,
    })
}

/// Server-side handshake negotiator.
///
/// Holds the configuration handed to every connection it accepts. There is
/// no global state; construct one per server and share it by reference.
#[derive(Debug, Clone, Default)]
pub struct Negotiator {
    config: ConnectionConfig,
}

impl Negotiator {
    pub fn new(config: ConnectionConfig) -> Negotiator {
        Negotiator { config }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Validate the headers and build the 101 response.
    pub fn negotiate(&self, headers: &[(String, String)]) -> Result<String, HandshakeError> {
        let client_key = validate_upgrade_request(headers)?;
        Ok(upgrade_response(&compute_accept_key(&client_key)))
    }

    /// Complete the upgrade on a raw stream whose request head has been read.
    ///
    /// On success the 101 response has been written and the stream is wrapped
    /// in a server-role [`Connection`]. On failure a 400 response is written
    /// best-effort and the stream is dropped.
    pub fn accept<T: Transport>(
        &self,
        mut stream: T,
        head: &RequestHead,
    ) -> Result<Connection<T>, WsError> {
        if !head.method.eq_ignore_ascii_case("GET") {
            let _ = write_bad_request(&mut stream, "method must be GET");
            return Err(HandshakeError::MalformedRequest(format!(
                "method must be GET, got {}",
                head.method
            ))
            .into());
        }

        let response = match self.negotiate(&head.headers) {
            Ok(response) => response,
            Err(e) => {
                debug!(path = %head.path, error = %e, "rejecting WebSocket upgrade");
                let _ = write_bad_request(&mut stream, &e.to_string());
                return Err(e.into());
            }
        };
        stream.write_all(response.as_bytes())?;
        stream.flush()?;

        let conn = Connection::with_buffered(
            stream,
            Role::Server,
            self.config.clone(),
            head.leftover.clone(),
        )?;
        debug!(conn = %conn.id(), path = %head.path, "WebSocket upgrade complete");
        Ok(conn)
    }
}

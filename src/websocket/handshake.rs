//! WebSocket opening handshake (RFC 6455 §4.2)
//!
//! A request is accepted when it contains the three markers
//! `Upgrade: websocket`, `Connection: Upgrade` and `Sec-WebSocket-Key:`,
//! located by substring search in any order. The reply is a
//! `101 Switching Protocols` carrying `Sec-WebSocket-Accept`, computed as
//! `base64(SHA1(key + GUID))`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest, Sha1};
use std::io::{ErrorKind, Read, Write};

use super::error::{HandshakeError, HandshakeResult};

/// Fixed GUID appended to the client key (RFC 6455 §1.3)
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default upper bound on the size of a handshake request
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 4096;

const UPGRADE_MARKER: &str = "Upgrade: websocket";
const CONNECTION_MARKER: &str = "Connection: Upgrade";
const KEY_MARKER: &str = "Sec-WebSocket-Key:";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const READ_CHUNK: usize = 1024;

/// Compute the `Sec-WebSocket-Accept` value for a client key
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Build the `101 Switching Protocols` response
pub fn build_response(accept_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key
    )
}

/// A validated upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    key: String,
}

impl HandshakeRequest {
    /// Validate the request markers and extract the client key
    pub fn parse(request: &str) -> HandshakeResult<Self> {
        if !request.contains(UPGRADE_MARKER) {
            return Err(HandshakeError::MissingUpgrade);
        }
        if !request.contains(CONNECTION_MARKER) {
            return Err(HandshakeError::MissingConnection);
        }
        let key_start = request
            .find(KEY_MARKER)
            .map(|pos| pos + KEY_MARKER.len())
            .ok_or(HandshakeError::MissingKey)?;

        let rest = &request[key_start..];
        let key_end = rest.find("\r\n").ok_or(HandshakeError::MalformedKey)?;

        Ok(Self {
            key: rest[..key_end].trim().to_string(),
        })
    }

    /// Client-supplied `Sec-WebSocket-Key`
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn accept_key(&self) -> String {
        compute_accept_key(&self.key)
    }

    /// Full response text for this request
    pub fn response(&self) -> String {
        build_response(&self.accept_key())
    }
}

/// Outcome of a handshake attempt that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// Request incomplete; retry when the socket is readable again
    Pending,
    /// 101 response written, connection upgraded
    Complete,
}

/// Whether `buf` holds a complete request header block
pub fn is_request_complete(buf: &[u8]) -> bool {
    header_end(buf).is_some()
}

/// Offset just past the blank line ending the request head
fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// Read what is available from `stream` and upgrade once the request is complete
///
/// `buffer` carries partial request bytes between attempts on a non-blocking
/// socket. Once the upgrade succeeds it holds only the bytes that followed
/// the request head, which belong to the first frames. Any error means the
/// connection must be closed without a response.
pub fn attempt<S: Read + Write>(
    stream: &mut S,
    buffer: &mut Vec<u8>,
    max_request_size: usize,
) -> HandshakeResult<HandshakeProgress> {
    let mut chunk = [0u8; READ_CHUNK];

    let head_len = loop {
        if let Some(end) = header_end(buffer) {
            break end;
        }
        let room = max_request_size.saturating_sub(buffer.len());
        if room == 0 {
            return Err(HandshakeError::RequestTooLarge(max_request_size));
        }

        let limit = room.min(READ_CHUNK);
        match stream.read(&mut chunk[..limit]) {
            Ok(0) => return Err(HandshakeError::ConnectionClosed),
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return Ok(HandshakeProgress::Pending)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    };

    let request = HandshakeRequest::parse(&String::from_utf8_lossy(&buffer[..head_len]))?;
    stream.write_all(request.response().as_bytes())?;
    stream.flush()?;
    buffer.drain(..head_len);

    Ok(HandshakeProgress::Complete)
}

//! WebSocket protocol error types
//!
//! Errors raised while decoding frames or upgrading a connection. Both are
//! recovered per connection: the offending socket is closed, the server
//! keeps running.

use thiserror::Error;

/// Errors that can occur while decoding a WebSocket frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer ends before the frame its header declares
    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Declared payload length is above the configured limit
    #[error("Frame payload of {length} bytes exceeds limit of {limit} bytes")]
    TooLarge { length: u64, limit: usize },
}

/// Errors that can occur during the opening handshake
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// Peer closed the connection before sending a complete request
    #[error("Connection closed during handshake")]
    ConnectionClosed,

    /// Request is missing the `Upgrade: websocket` header
    #[error("Missing 'Upgrade: websocket' header")]
    MissingUpgrade,

    /// Request is missing the `Connection: Upgrade` header
    #[error("Missing 'Connection: Upgrade' header")]
    MissingConnection,

    /// Request is missing the `Sec-WebSocket-Key` header
    #[error("Missing 'Sec-WebSocket-Key' header")]
    MissingKey,

    /// Key header is not terminated by CRLF
    #[error("Malformed 'Sec-WebSocket-Key' header")]
    MalformedKey,

    /// Request grew past the handshake buffer without completing
    #[error("Handshake request exceeds {0} bytes")]
    RequestTooLarge(usize),

    /// Socket read or write failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for frame decoding
pub type FrameResult<T> = Result<T, FrameError>;

/// Result type alias for handshake operations
pub type HandshakeResult<T> = Result<T, HandshakeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FrameError::Truncated {
            needed: 10,
            available: 4,
        };
        assert_eq!(err.to_string(), "Truncated frame: need 10 bytes, have 4");

        let err = HandshakeError::MissingKey;
        assert_eq!(err.to_string(), "Missing 'Sec-WebSocket-Key' header");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: HandshakeError = io_err.into();
        assert!(matches!(err, HandshakeError::Io(_)));
    }
}

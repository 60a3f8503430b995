//! WebSocket Protocol Layer
//!
//! Pure protocol code with no knowledge of sockets or threads:
//!
//! - **frame**: RFC 6455 frame decoding and encoding
//! - **handshake**: HTTP upgrade validation and `Sec-WebSocket-Accept`
//! - **error**: Error types
//!
//! ## Example
//!
//! ```rust
//! use herald::websocket::{compute_accept_key, encode_text, Frame};
//!
//! let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
//! assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
//!
//! let bytes = encode_text("Broadcast: hello");
//! let frame = Frame::parse(&bytes).unwrap();
//! assert!(frame.is_final());
//! assert_eq!(frame.payload, b"Broadcast: hello");
//! ```

pub mod error;
pub mod frame;
pub mod handshake;

pub use error::{FrameError, FrameResult, HandshakeError, HandshakeResult};
pub use frame::{apply_mask, encode_text, Frame, OpCode, MAX_INLINE_LENGTH};
pub use handshake::{
    attempt, build_response, compute_accept_key, is_request_complete, HandshakeProgress,
    HandshakeRequest, DEFAULT_MAX_REQUEST_SIZE, WEBSOCKET_GUID,
};

//! # Herald
//!
//! Multi-threaded WebSocket broadcast server. Every text message a client
//! sends is rebroadcast, prefixed, to every connected client including the
//! sender.
//!
//! ## Features
//!
//! - **Event-driven I/O**: One `mio` readiness loop for accept and handshakes
//! - **Worker pool**: Fixed set of threads reading frames and broadcasting
//! - **RFC 6455 framing**: Masked client frames, unmasked server frames
//! - **Configurable**: TOML file with environment overrides
//!
//! ## Modules
//!
//! - [`websocket`]: Frame codec and opening handshake
//! - [`server`]: Event loop, worker pool and client registry
//! - [`config`]: Configuration loading
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use herald::{Config, Server};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default().config;
//!     config.validate()?;
//!
//!     let server = Server::bind(&config.server)?;
//!     println!("Listening on {}", server.local_addr());
//!
//!     // Blocks until ServerHandle::shutdown is called
//!     server.run()?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod server;
pub mod websocket;

// Re-export top-level types for convenience
pub use config::{Config, ConfigError, ConfigLoad, LoggingConfig, ServerConfig};

pub use server::{
    ClientRegistry, Connection, ConnectionState, Server, ServerError, ServerHandle, ServerResult,
    ServerStats, StatsSnapshot,
};

pub use websocket::{
    compute_accept_key, encode_text, Frame, FrameError, HandshakeError, HandshakeRequest, OpCode,
};

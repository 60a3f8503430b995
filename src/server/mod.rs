//! Herald Broadcast Server
//!
//! Event-driven WebSocket server that rebroadcasts every received message to
//! all connected peers.
//!
//! - **event_loop**: Acceptor and readiness loop, runs handshakes
//! - **worker**: Fixed worker pool reading frames and broadcasting
//! - **registry**: Shared map of open connections
//! - **queue**: Ready-connection queue feeding each worker
//! - **stats**: Server counters
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! accept -> handshake (loop thread) -> registry
//! readable -> queue[id % workers] -> worker: read, decode, broadcast
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use herald::config::ServerConfig;
//! use herald::server::Server;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(&ServerConfig::default())?;
//!     let handle = server.handle();
//!
//!     std::thread::spawn(move || {
//!         std::thread::sleep(std::time::Duration::from_secs(60));
//!         let _ = handle.shutdown();
//!     });
//!
//!     server.run()?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod event_loop;
pub mod queue;
pub mod registry;
pub mod stats;
pub mod worker;

pub use error::{ServerError, ServerResult};
pub use event_loop::{EventLoop, EventLoopSettings};
pub use queue::WorkQueue;
pub use registry::{ClientRegistry, Connection, ConnectionState};
pub use stats::{ServerStats, StatsSnapshot};
pub use worker::{
    broadcast, BroadcastOutcome, ServiceOutcome, WorkerContext, WorkerPool, WorkerSettings,
    DEFAULT_BROADCAST_PREFIX,
};

use mio::net::TcpListener;
use mio::{Interest, Poll, Waker};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::ServerConfig;

/// A bound server, ready to run
pub struct Server {
    event_loop: EventLoop,
    local_addr: SocketAddr,
    waker: Arc<Waker>,
    registry: Arc<ClientRegistry>,
    stats: Arc<ServerStats>,
}

impl Server {
    /// Bind the listener and start the worker pool
    ///
    /// Any failure here is a fatal startup error.
    pub fn bind(config: &ServerConfig) -> ServerResult<Self> {
        let address = config.bind_address();
        let addr: SocketAddr = address
            .parse()
            .map_err(|_| ServerError::InvalidAddress(address.clone()))?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, event_loop::LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), event_loop::WAKER)?);
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(ClientRegistry::new());
        let stats = Arc::new(ServerStats::new());

        let context = WorkerContext::new(
            Arc::clone(&registry),
            Arc::new(poll.registry().try_clone()?),
            Arc::clone(&stats),
            WorkerSettings {
                read_buffer_size: config.read_buffer_size,
                max_frame_size: config.max_frame_size,
                max_reads_per_pass: config.max_reads_per_pass,
                broadcast_prefix: config.broadcast_prefix.clone(),
            },
        );
        let pool = WorkerPool::spawn(config.workers, context)?;

        let event_loop = EventLoop::new(
            poll,
            listener,
            pool,
            Arc::clone(&registry),
            Arc::clone(&stats),
            EventLoopSettings {
                max_events: config.max_events,
                max_handshake_size: config.max_handshake_size,
            },
        );

        Ok(Self {
            event_loop,
            local_addr,
            waker,
            registry,
            stats,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for stopping the server from another thread
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            waker: Arc::clone(&self.waker),
        }
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Run the event loop on the calling thread until shutdown
    pub fn run(self) -> ServerResult<()> {
        tracing::info!("Server listening on {}", self.local_addr);
        self.event_loop.run()
    }
}

/// Cloneable handle that stops a running [`Server`]
#[derive(Debug, Clone)]
pub struct ServerHandle {
    waker: Arc<Waker>,
}

impl ServerHandle {
    /// Ask the event loop to stop; `run` returns once workers have joined
    pub fn shutdown(&self) -> ServerResult<()> {
        self.waker.wake()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn loopback_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            workers: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_bind_ephemeral_port() {
        let server = Server::bind(&loopback_config()).unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert!(server.registry().is_empty());
    }

    #[test]
    fn test_drop_without_run_stops_workers() {
        let server = Server::bind(&loopback_config()).unwrap();
        let registry = server.registry();

        drop(server);

        // Workers held the last other references through their context
        assert_eq!(Arc::strong_count(&registry), 1);
    }

    #[test]
    fn test_invalid_address() {
        let config = ServerConfig {
            host: "not an address".to_string(),
            ..loopback_config()
        };
        let result = Server::bind(&config);
        assert!(matches!(result, Err(ServerError::InvalidAddress(_))));
    }

    #[test]
    fn test_shutdown_stops_run() {
        let server = Server::bind(&loopback_config()).unwrap();
        let handle = server.handle();

        let runner = thread::spawn(move || server.run());
        handle.shutdown().unwrap();

        assert!(runner.join().unwrap().is_ok());
    }
}

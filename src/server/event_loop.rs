//! Event Loop / Acceptor
//!
//! Single thread multiplexing edge-triggered readiness over the listener,
//! every client socket and a shutdown waker.
//!
//! - Listener readable: accept until the backlog is empty, register each new
//!   socket and attempt its handshake right away on this thread
//! - Handshaking socket readable: continue the handshake on this thread; on
//!   success register the connection and queue it once on its worker
//! - Open socket readable: hand the id to its worker, never read here
//! - Waker: stop, join the workers and close every connection
//!
//! The loop also stops on a poll error other than `Interrupted`.

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use super::error::ServerResult;
use super::registry::{ClientRegistry, Connection, ConnectionState};
use super::stats::ServerStats;
use super::worker::WorkerPool;
use crate::websocket::handshake::{self, HandshakeProgress};

/// Token of the listening socket
pub const LISTENER: Token = Token(0);

/// Token of the shutdown waker
pub const WAKER: Token = Token(1);

/// First token handed to a client connection
const FIRST_CONNECTION: usize = 2;

/// Event loop tuning
#[derive(Debug, Clone, Copy)]
pub struct EventLoopSettings {
    /// Readiness events handled per poll
    pub max_events: usize,
    /// Largest accepted handshake request
    pub max_handshake_size: usize,
}

/// An accepted socket that has not finished its handshake
struct PendingHandshake {
    stream: TcpStream,
    peer_addr: SocketAddr,
    buffer: Vec<u8>,
    state: ConnectionState,
}

/// Readiness loop owning the listener and all handshaking sockets
pub struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    pending: HashMap<Token, PendingHandshake>,
    next_token: usize,
    registry: Arc<ClientRegistry>,
    stats: Arc<ServerStats>,
    pool: WorkerPool,
    settings: EventLoopSettings,
}

impl EventLoop {
    /// `listener` must already be registered with `poll` under [`LISTENER`]
    pub fn new(
        poll: Poll,
        listener: TcpListener,
        pool: WorkerPool,
        registry: Arc<ClientRegistry>,
        stats: Arc<ServerStats>,
        settings: EventLoopSettings,
    ) -> Self {
        Self {
            poll,
            listener,
            pending: HashMap::new(),
            next_token: FIRST_CONNECTION,
            registry,
            stats,
            pool,
            settings,
        }
    }

    /// Run until shutdown is requested or polling fails
    pub fn run(mut self) -> ServerResult<()> {
        let mut events = Events::with_capacity(self.settings.max_events.max(1));

        let result = loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(error = %e, "Poll failed, shutting down");
                break Err(e.into());
            }

            let mut stop = false;
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_connections(),
                    WAKER => stop = true,
                    token if self.pending.contains_key(&token) => self.continue_handshake(token),
                    token => self.pool.dispatch(token),
                }
            }

            if stop {
                tracing::info!("Shutdown requested");
                break Ok(());
            }
        };

        self.shutdown();
        result
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => self.on_accept(stream, peer_addr),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    fn on_accept(&mut self, mut stream: TcpStream, peer_addr: SocketAddr) {
        self.stats.record_accept();

        let token = Token(self.next_token);
        self.next_token += 1;
        tracing::debug!(connection_id = token.0, peer = %peer_addr, "New client connected");

        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE)
        {
            tracing::error!(connection_id = token.0, error = %e, "Failed to register socket");
            return;
        }

        self.pending.insert(
            token,
            PendingHandshake {
                stream,
                peer_addr,
                buffer: Vec::new(),
                state: ConnectionState::New,
            },
        );
        self.continue_handshake(token);
    }

    fn continue_handshake(&mut self, token: Token) {
        let Some(mut pending) = self.pending.remove(&token) else {
            return;
        };
        pending.state = ConnectionState::Handshaking;

        let progress = handshake::attempt(
            &mut pending.stream,
            &mut pending.buffer,
            self.settings.max_handshake_size,
        );

        match progress {
            Ok(HandshakeProgress::Pending) => {
                tracing::trace!(
                    connection_id = token.0,
                    buffered = pending.buffer.len(),
                    state = ?pending.state,
                    "Handshake incomplete"
                );
                self.pending.insert(token, pending);
            }
            Ok(HandshakeProgress::Complete) => self.open_connection(token, pending),
            Err(e) => {
                self.stats.record_handshake_failure();
                tracing::warn!(
                    connection_id = token.0,
                    peer = %pending.peer_addr,
                    error = %e,
                    "Handshake failed"
                );
                self.discard(pending);
            }
        }
    }

    /// Register an upgraded socket and hand it to its worker
    ///
    /// Bytes that followed the request head seed the inbound buffer. The
    /// worker is dispatched right away since those bytes, or data still
    /// unread in the socket, will not raise another edge.
    fn open_connection(&mut self, token: Token, pending: PendingHandshake) {
        let connection = Arc::new(Connection::new(token, pending.stream, pending.peer_addr));
        connection.inbound().extend_from_slice(&pending.buffer);

        if let Err(e) = self.registry.register(Arc::clone(&connection)) {
            tracing::error!(connection_id = token.0, error = %e, "Failed to register connection");
            let _ = self.poll.registry().deregister(&mut *connection.stream());
            connection.close();
            return;
        }
        self.pool.dispatch(token);
    }

    /// Stop polling a socket that never upgraded; dropping it closes it
    fn discard(&self, mut pending: PendingHandshake) {
        let _ = self.poll.registry().deregister(&mut pending.stream);
    }

    fn shutdown(self) {
        self.pool.shutdown();

        for connection in self.registry.drain() {
            connection.close();
        }
        tracing::info!(stats = %self.stats.snapshot(), "Event loop stopped");
    }
}

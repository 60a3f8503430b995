//! Client Registry
//!
//! Tracks every upgraded connection by id. The event loop inserts after a
//! successful handshake, workers remove on read failure, and broadcasts
//! iterate a snapshot.
//!
//! All map operations run under one lock. The lock is never held across
//! socket I/O: [`ClientRegistry::snapshot`] clones the `Arc`s out so that a
//! broadcast writes to peers after the lock has been released. A connection
//! removed while a broadcast still holds it only sees its sends fail.

use chrono::{DateTime, Utc};
use mio::net::TcpStream;
use mio::Token;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::io::{self, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use super::error::{ServerError, ServerResult};

/// Lifecycle of a connection
///
/// `New -> Handshaking -> Open -> Closed`; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Handshaking,
    Open,
    Closed,
}

/// An upgraded WebSocket connection
pub struct Connection {
    token: Token,
    peer_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    state: Mutex<ConnectionState>,
    /// Serializes writes from concurrent broadcasts with the owner's reads
    stream: Mutex<TcpStream>,
    /// Received bytes not yet decoded into a complete frame
    inbound: Mutex<Vec<u8>>,
}

impl Connection {
    /// Wrap a stream that has completed the handshake
    pub fn new(token: Token, stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            token,
            peer_addr,
            connected_at: Utc::now(),
            state: Mutex::new(ConnectionState::Open),
            stream: Mutex::new(stream),
            inbound: Mutex::new(Vec::new()),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn id(&self) -> usize {
        self.token.0
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Lock the underlying stream for reading or deregistration
    pub fn stream(&self) -> MutexGuard<'_, TcpStream> {
        self.stream.lock()
    }

    /// Lock the inbound frame buffer
    pub fn inbound(&self) -> MutexGuard<'_, Vec<u8>> {
        self.inbound.lock()
    }

    /// Write one encoded frame to the peer
    ///
    /// The socket is non-blocking; a full send buffer is reported as
    /// `WouldBlock` instead of waiting. If the buffer fills after part of
    /// the frame went out, the peer's frame stream can no longer be parsed:
    /// the connection is marked closed and its socket shut down, so the
    /// owning worker's next read fails and unregisters it.
    pub fn send(&self, bytes: &[u8]) -> io::Result<()> {
        if !self.is_open() {
            return Err(io::Error::new(ErrorKind::NotConnected, "connection closed"));
        }

        let mut stream = self.stream.lock();
        let mut written = 0;
        while written < bytes.len() {
            let result = match stream.write(&bytes[written..]) {
                Ok(0) => Err(io::Error::new(ErrorKind::WriteZero, "peer accepted no bytes")),
                Ok(n) => {
                    written += n;
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => Err(e),
            };

            if written > 0 {
                *self.state.lock() = ConnectionState::Closed;
                let _ = stream.shutdown(Shutdown::Both);
                tracing::warn!(
                    connection_id = self.token.0,
                    written,
                    total = bytes.len(),
                    "Frame partially sent, closing connection"
                );
            }
            return result;
        }
        Ok(())
    }

    /// Mark closed and shut the socket down in both directions
    ///
    /// The descriptor itself is released when the last reference is dropped.
    pub fn close(&self) {
        *self.state.lock() = ConnectionState::Closed;
        let _ = self.stream.lock().shutdown(Shutdown::Both);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.token.0)
            .field("peer_addr", &self.peer_addr)
            .field("connected_at", &self.connected_at)
            .field("state", &self.state())
            .finish()
    }
}

/// Shared map of open connections
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<Token, Arc<Connection>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an upgraded connection
    ///
    /// Fails if the id is already present.
    pub fn register(&self, connection: Arc<Connection>) -> ServerResult<()> {
        let token = connection.token();
        let peer = connection.peer_addr();

        {
            let mut clients = self.clients.lock();
            if clients.contains_key(&token) {
                return Err(ServerError::DuplicateConnection(token.0));
            }
            clients.insert(token, connection);
        }

        tracing::info!(connection_id = token.0, peer = %peer, "WebSocket connected");
        Ok(())
    }

    /// Remove a connection, returning it if it was registered
    pub fn unregister(&self, token: Token) -> Option<Arc<Connection>> {
        let removed = self.clients.lock().remove(&token);

        if let Some(connection) = &removed {
            tracing::info!(
                connection_id = token.0,
                peer = %connection.peer_addr(),
                "WebSocket disconnected"
            );
        }

        removed
    }

    pub fn get(&self, token: Token) -> Option<Arc<Connection>> {
        self.clients.lock().get(&token).cloned()
    }

    pub fn contains(&self, token: Token) -> bool {
        self.clients.lock().contains_key(&token)
    }

    /// Every registered connection, copied out from under the lock
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.clients.lock().values().cloned().collect()
    }

    /// Registered ids with their peer addresses, ordered by id
    pub fn peers(&self) -> Vec<(usize, SocketAddr)> {
        let mut peers: Vec<_> = self
            .clients
            .lock()
            .values()
            .map(|c| (c.id(), c.peer_addr()))
            .collect();
        peers.sort_unstable_by_key(|(id, _)| *id);
        peers
    }

    /// Remove every connection (used at shutdown)
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.clients.lock().drain().map(|(_, c)| c).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::TcpListener;

    /// A connected (server side, client side) socket pair over loopback
    pub(crate) fn socket_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }

    pub(crate) fn test_connection(id: usize) -> (Arc<Connection>, std::net::TcpStream) {
        let (server, client) = socket_pair();
        let peer = client.local_addr().unwrap();
        (Arc::new(Connection::new(Token(id), server, peer)), client)
    }

    #[test]
    fn test_register_unregister() {
        let registry = ClientRegistry::new();
        let (conn, _client) = test_connection(2);

        registry.register(conn).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(Token(2)));

        let removed = registry.unregister(Token(2));
        assert!(removed.is_some());
        assert!(registry.is_empty());
        assert!(registry.unregister(Token(2)).is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = ClientRegistry::new();
        let (first, _c1) = test_connection(5);
        let (second, _c2) = test_connection(5);

        registry.register(first).unwrap();
        let result = registry.register(second);

        assert!(matches!(result, Err(ServerError::DuplicateConnection(5))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_and_peers() {
        let registry = ClientRegistry::new();
        let mut clients = Vec::new();
        for id in [4, 2, 3] {
            let (conn, client) = test_connection(id);
            registry.register(conn).unwrap();
            clients.push(client);
        }

        let mut ids: Vec<usize> = registry.snapshot().iter().map(|c| c.id()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![2, 3, 4]);

        let peers = registry.peers();
        assert_eq!(peers.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(peers[0].1, clients[1].local_addr().unwrap());

        registry.unregister(Token(3));
        let ids: Vec<usize> = registry.snapshot().iter().map(|c| c.id()).collect();
        assert!(!ids.contains(&3));
    }

    #[test]
    fn test_send_after_close_fails_quietly() {
        let (conn, _client) = test_connection(2);
        assert!(conn.is_open());

        conn.close();
        assert_eq!(conn.state(), ConnectionState::Closed);

        let err = conn.send(b"late").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
    }

    #[test]
    fn test_partial_send_shuts_connection_down() {
        use std::io::Read;

        let (conn, mut client) = test_connection(2);
        let frame = vec![0x5a; 199_999];

        let mut whole_frames = 0;
        let err = loop {
            match conn.send(&frame) {
                Ok(()) => whole_frames += 1,
                Err(e) => break e,
            }
            assert!(whole_frames < 10_000, "send buffer never filled");
        };
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(
            conn.send(b"after").unwrap_err().kind(),
            std::io::ErrorKind::NotConnected
        );

        // Peer sees the complete frames, a cut-off tail, then EOF
        client
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).unwrap();
        assert!(received.len() > whole_frames * frame.len());
        assert!(received.len() < (whole_frames + 1) * frame.len());
        assert!(!received.ends_with(b"after"));
    }

    #[test]
    fn test_send_reaches_peer() {
        use std::io::Read;

        let (conn, mut client) = test_connection(2);
        conn.send(b"ping").unwrap();

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }
}

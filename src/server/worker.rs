//! Worker Pool
//!
//! A fixed set of threads that service readable connections. Every
//! connection is bound to one worker (`id % workers`) for its lifetime, so a
//! socket is never read by two threads and frames are handled in arrival
//! order.
//!
//! Servicing a connection:
//! 1. Read the socket into the connection's inbound buffer until it would
//!    block, or until the per-pass read limit is reached
//! 2. Decode every complete frame, keeping any trailing partial frame
//! 3. Drop non-final fragments; broadcast `prefix + payload` for the rest
//! 4. On EOF, read error or protocol error: unregister and close
//! 5. If the read limit cut the pass short, queue the connection again

use mio::Token;
use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::error::{ServerError, ServerResult};
use super::queue::WorkQueue;
use super::registry::{ClientRegistry, Connection};
use super::stats::ServerStats;
use crate::websocket::Frame;

/// Literal tag prepended to every rebroadcast message
pub const DEFAULT_BROADCAST_PREFIX: &str = "Broadcast: ";

/// Per-worker tuning
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Size of a single socket read
    pub read_buffer_size: usize,
    /// Largest accepted frame payload
    pub max_frame_size: usize,
    /// Socket reads per service pass before yielding to other connections
    pub max_reads_per_pass: usize,
    /// Text prepended to each rebroadcast message
    pub broadcast_prefix: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            read_buffer_size: 4096,
            max_frame_size: 16 * 1024 * 1024,
            max_reads_per_pass: 16,
            broadcast_prefix: DEFAULT_BROADCAST_PREFIX.to_string(),
        }
    }
}

/// Result of sending one frame to every registered peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub failed: usize,
}

/// Send an encoded frame to every connection in the registry, best-effort
///
/// A failed send is logged and skipped; it neither aborts the remaining
/// sends nor removes the peer.
pub fn broadcast(registry: &ClientRegistry, encoded: &[u8]) -> BroadcastOutcome {
    let mut outcome = BroadcastOutcome::default();

    for peer in registry.snapshot() {
        match peer.send(encoded) {
            Ok(()) => outcome.delivered += 1,
            Err(e) => {
                outcome.failed += 1;
                tracing::debug!(
                    connection_id = peer.id(),
                    error = %e,
                    "Broadcast send failed"
                );
            }
        }
    }

    outcome
}

/// Socket state at the end of one read pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Drained until it would block
    Drained,
    /// Read limit reached; more data may be waiting
    Yielded,
    /// Peer closed its side
    Eof,
}

/// Frames decoded from one connection in a single read pass
struct Received {
    frames: Vec<Frame>,
    state: ReadState,
}

/// What a service pass left to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// Nothing left until the next readiness event
    Idle,
    /// The socket may hold more data; service it again
    Pending,
    /// Connection was closed or was not registered
    Closed,
}

/// Shared state every worker needs
#[derive(Clone)]
pub struct WorkerContext {
    registry: Arc<ClientRegistry>,
    poll_registry: Arc<mio::Registry>,
    stats: Arc<ServerStats>,
    settings: Arc<WorkerSettings>,
}

impl WorkerContext {
    pub fn new(
        registry: Arc<ClientRegistry>,
        poll_registry: Arc<mio::Registry>,
        stats: Arc<ServerStats>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            registry,
            poll_registry,
            stats,
            settings: Arc::new(settings),
        }
    }

    /// Handle one readiness notification for `token`
    pub fn service(&self, token: Token) -> ServiceOutcome {
        let Some(connection) = self.registry.get(token) else {
            tracing::trace!(connection_id = token.0, "Readiness for unknown connection ignored");
            return ServiceOutcome::Closed;
        };

        match self.receive(&connection) {
            Ok(received) => {
                for frame in received.frames {
                    self.handle_frame(&connection, frame);
                }
                match received.state {
                    ReadState::Drained => ServiceOutcome::Idle,
                    ReadState::Yielded => ServiceOutcome::Pending,
                    ReadState::Eof => {
                        let leftover = connection.inbound().len();
                        if leftover > 0 {
                            self.stats.record_protocol_error();
                            tracing::debug!(
                                connection_id = token.0,
                                bytes = leftover,
                                "Peer closed mid-frame"
                            );
                        }
                        self.disconnect(&connection);
                        ServiceOutcome::Closed
                    }
                }
            }
            Err(ServerError::Frame(e)) => {
                self.stats.record_protocol_error();
                tracing::warn!(connection_id = token.0, error = %e, "Protocol error, closing");
                self.disconnect(&connection);
                ServiceOutcome::Closed
            }
            Err(e) => {
                tracing::debug!(connection_id = token.0, error = %e, "Read failed, closing");
                self.disconnect(&connection);
                ServiceOutcome::Closed
            }
        }
    }

    /// Read up to the per-pass limit and decode every complete frame
    ///
    /// Bytes already buffered (such as frames that arrived with the
    /// handshake) are decoded before the first read.
    fn receive(&self, connection: &Connection) -> ServerResult<Received> {
        let mut inbound = connection.inbound();
        let mut stream = connection.stream();
        let mut chunk = vec![0u8; self.settings.read_buffer_size.max(1)];
        let mut frames = Vec::new();

        self.extract_frames(&mut inbound, &mut frames)?;

        let mut reads = 0;
        let state = loop {
            if reads >= self.settings.max_reads_per_pass.max(1) {
                break ReadState::Yielded;
            }
            match stream.read(&mut chunk) {
                Ok(0) => break ReadState::Eof,
                Ok(n) => {
                    reads += 1;
                    inbound.extend_from_slice(&chunk[..n]);
                    self.extract_frames(&mut inbound, &mut frames)?;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break ReadState::Drained,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };

        Ok(Received { frames, state })
    }

    fn extract_frames(&self, inbound: &mut Vec<u8>, frames: &mut Vec<Frame>) -> ServerResult<()> {
        let mut consumed = 0;
        while let Some((frame, used)) =
            Frame::decode(&inbound[consumed..], self.settings.max_frame_size)?
        {
            frames.push(frame);
            consumed += used;
        }
        inbound.drain(..consumed);
        Ok(())
    }

    fn handle_frame(&self, connection: &Connection, frame: Frame) {
        if !frame.is_final() {
            self.stats.record_fragment_dropped();
            tracing::debug!(
                connection_id = connection.id(),
                bytes = frame.payload.len(),
                "Fragmented frame dropped"
            );
            return;
        }

        self.stats.record_message();
        tracing::info!(
            connection_id = connection.id(),
            message = %frame.payload_text(),
            "Received message"
        );

        let mut text = self.settings.broadcast_prefix.clone().into_bytes();
        text.extend_from_slice(&frame.payload);
        let encoded = Frame::text(text).encode();

        let outcome = broadcast(&self.registry, &encoded);
        self.stats
            .record_broadcast(outcome.delivered as u64, outcome.failed as u64);
        tracing::trace!(
            connection_id = connection.id(),
            delivered = outcome.delivered,
            failed = outcome.failed,
            "Broadcast complete"
        );
    }

    /// Unregister, stop polling and close a connection
    fn disconnect(&self, connection: &Connection) {
        if self.registry.unregister(connection.token()).is_none() {
            return;
        }

        if let Err(e) = self.poll_registry.deregister(&mut *connection.stream()) {
            tracing::debug!(connection_id = connection.id(), error = %e, "Deregister failed");
        }
        connection.close();
        self.stats.record_disconnect();
    }
}

/// Fixed-size pool of worker threads, one queue per worker
pub struct WorkerPool {
    queues: Vec<Arc<WorkQueue>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `size` workers (at least one)
    pub fn spawn(size: usize, context: WorkerContext) -> ServerResult<Self> {
        let size = size.max(1);
        let mut pool = Self {
            queues: Vec::with_capacity(size),
            handles: Vec::with_capacity(size),
        };

        for index in 0..size {
            let queue = Arc::new(WorkQueue::new());
            let worker_queue = Arc::clone(&queue);
            let worker_context = context.clone();

            let spawned = thread::Builder::new()
                .name(format!("herald-worker-{}", index))
                .spawn(move || run_worker(index, worker_queue, worker_context));

            match spawned {
                Ok(handle) => {
                    pool.queues.push(queue);
                    pool.handles.push(handle);
                }
                Err(e) => {
                    pool.shutdown();
                    return Err(ServerError::WorkerSpawn {
                        index,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(workers = size, "Worker pool started");
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.queues.len()
    }

    /// Index of the worker that owns `token`
    pub fn worker_for(&self, token: Token) -> usize {
        token.0 % self.queues.len()
    }

    /// Queue a readable connection on its owning worker
    pub fn dispatch(&self, token: Token) {
        let index = self.worker_for(token);
        if !self.queues[index].push(token) {
            tracing::trace!(connection_id = token.0, worker = index, "Already queued");
        }
    }

    /// Close every queue and join the workers
    pub fn shutdown(mut self) {
        self.stop();
        tracing::info!("Worker pool stopped");
    }

    fn stop(&mut self) {
        for queue in &self.queues {
            queue.close();
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(index: usize, queue: Arc<WorkQueue>, context: WorkerContext) {
    tracing::debug!(worker = index, "Worker started");
    while let Some(token) = queue.pop() {
        if context.service(token) == ServiceOutcome::Pending {
            // Back of this worker's own queue, behind connections already waiting
            queue.push(token);
        }
    }
    tracing::debug!(worker = index, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::registry::tests::test_connection;
    use mio::{Interest, Poll};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    const KEY: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

    struct Harness {
        _poll: Poll,
        registry: Arc<ClientRegistry>,
        stats: Arc<ServerStats>,
        context: WorkerContext,
        clients: Vec<TcpStream>,
    }

    impl Harness {
        fn new(connections: usize, settings: WorkerSettings) -> Self {
            let poll = Poll::new().unwrap();
            let registry = Arc::new(ClientRegistry::new());
            let stats = Arc::new(ServerStats::new());
            let poll_registry = Arc::new(poll.registry().try_clone().unwrap());

            let mut clients = Vec::new();
            for id in 0..connections {
                let (conn, client) = test_connection(id + 2);
                poll.registry()
                    .register(&mut *conn.stream(), conn.token(), Interest::READABLE)
                    .unwrap();
                registry.register(conn).unwrap();
                client
                    .set_read_timeout(Some(Duration::from_secs(2)))
                    .unwrap();
                clients.push(client);
            }

            let context = WorkerContext::new(
                Arc::clone(&registry),
                poll_registry,
                Arc::clone(&stats),
                settings,
            );

            Self {
                _poll: poll,
                registry,
                stats,
                context,
                clients,
            }
        }

        fn token(&self, client: usize) -> Token {
            Token(client + 2)
        }

        /// Service `client` until `done` holds or two seconds pass
        fn service_until(&self, client: usize, done: impl Fn(&Self) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !done(self) {
                assert!(Instant::now() < deadline, "condition not reached");
                self.context.service(self.token(client));
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    fn read_frame(stream: &mut TcpStream) -> Frame {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            if let Some((frame, _)) = Frame::decode(&buf, usize::MAX).unwrap() {
                return frame;
            }
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "server closed the connection");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn test_broadcast_fan_out_includes_sender() {
        let mut harness = Harness::new(3, WorkerSettings::default());

        harness.clients[0]
            .write_all(&Frame::text("hello").encode_masked(KEY))
            .unwrap();
        harness.service_until(0, |h| h.stats.snapshot().messages_received == 1);

        for client in harness.clients.iter_mut() {
            let frame = read_frame(client);
            assert!(frame.is_final());
            assert_eq!(frame.payload_text(), "Broadcast: hello");
        }
        assert_eq!(harness.stats.snapshot().frames_broadcast, 3);
    }

    #[test]
    fn test_read_failure_unregisters() {
        let mut harness = Harness::new(2, WorkerSettings::default());
        let gone = harness.clients.remove(0);
        drop(gone);

        let token = harness.token(0);
        harness.service_until(0, |h| !h.registry.contains(token));

        let ids: Vec<usize> = harness.registry.snapshot().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![3]);
        assert_eq!(harness.stats.snapshot().disconnects, 1);
    }

    #[test]
    fn test_fragment_dropped_connection_kept() {
        let harness = Harness::new(1, WorkerSettings::default());
        let mut fragment = Frame::text("part");
        fragment.fin = false;

        (&harness.clients[0])
            .write_all(&fragment.encode_masked(KEY))
            .unwrap();
        harness.service_until(0, |h| h.stats.snapshot().fragments_dropped == 1);

        let snapshot = harness.stats.snapshot();
        assert_eq!(snapshot.messages_received, 0);
        assert_eq!(snapshot.frames_broadcast, 0);
        assert!(harness.registry.contains(harness.token(0)));
    }

    #[test]
    fn test_frame_split_across_reads() {
        let mut harness = Harness::new(1, WorkerSettings::default());
        let bytes = Frame::text("a".repeat(300)).encode_masked(KEY);
        let (head, tail) = bytes.split_at(100);

        harness.clients[0].write_all(head).unwrap();
        harness.service_until(0, |h| {
            h.registry
                .get(h.token(0))
                .map(|c| {
                    let buffered = c.inbound().len();
                    buffered == 100
                })
                .unwrap_or(false)
        });
        assert_eq!(harness.stats.snapshot().messages_received, 0);

        harness.clients[0].write_all(tail).unwrap();
        harness.service_until(0, |h| h.stats.snapshot().messages_received == 1);

        let frame = read_frame(&mut harness.clients[0]);
        assert_eq!(frame.payload.len(), "Broadcast: ".len() + 300);
    }

    #[test]
    fn test_oversized_frame_closes_connection() {
        let settings = WorkerSettings {
            max_frame_size: 16,
            ..Default::default()
        };
        let harness = Harness::new(1, settings);

        (&harness.clients[0])
            .write_all(&Frame::text("this payload is too long").encode_masked(KEY))
            .unwrap();
        let token = harness.token(0);
        harness.service_until(0, |h| !h.registry.contains(token));

        assert_eq!(harness.stats.snapshot().protocol_errors, 1);
    }

    #[test]
    fn test_failed_send_keeps_peer_registered() {
        let harness = Harness::new(3, WorkerSettings::default());
        let closed = harness.registry.get(harness.token(1)).unwrap();
        closed.close();

        let outcome = broadcast(&harness.registry, &Frame::text("x").encode());
        assert_eq!(
            outcome,
            BroadcastOutcome {
                delivered: 2,
                failed: 1
            }
        );
        assert_eq!(harness.registry.len(), 3);
    }

    #[test]
    fn test_pool_affinity_and_shutdown() {
        let harness = Harness::new(0, WorkerSettings::default());
        let pool = WorkerPool::spawn(4, harness.context.clone()).unwrap();

        assert_eq!(pool.size(), 4);
        assert_eq!(pool.worker_for(Token(5)), 1);
        assert_eq!(pool.worker_for(Token(8)), 0);

        pool.dispatch(Token(42));
        pool.shutdown();
    }

    #[test]
    fn test_partially_sent_peer_removed_on_next_read() {
        let harness = Harness::new(1, WorkerSettings::default());
        let big = Frame::text(vec![b'z'; 199_999]).encode();

        let mut rounds = 0;
        while broadcast(&harness.registry, &big).failed == 0 {
            rounds += 1;
            assert!(rounds < 10_000, "send buffer never filled");
        }
        assert!(harness.registry.contains(harness.token(0)));

        let token = harness.token(0);
        harness.service_until(0, |h| !h.registry.contains(token));
        assert_eq!(harness.stats.snapshot().disconnects, 1);
    }

    #[test]
    fn test_buffered_bytes_decoded_before_reading() {
        let mut harness = Harness::new(1, WorkerSettings::default());
        let connection = harness.registry.get(harness.token(0)).unwrap();
        connection
            .inbound()
            .extend_from_slice(&Frame::text("early").encode_masked(KEY));

        let outcome = harness.context.service(harness.token(0));
        assert_eq!(outcome, ServiceOutcome::Idle);
        assert_eq!(harness.stats.snapshot().messages_received, 1);

        let frame = read_frame(&mut harness.clients[0]);
        assert_eq!(frame.payload_text(), "Broadcast: early");
    }

    #[test]
    fn test_read_limit_yields_pass() {
        let settings = WorkerSettings {
            read_buffer_size: 8,
            max_reads_per_pass: 1,
            ..Default::default()
        };
        let harness = Harness::new(1, settings);
        let token = harness.token(0);

        let bytes: Vec<u8> = ["a", "b", "c"]
            .iter()
            .flat_map(|text| Frame::text(*text).encode_masked(KEY))
            .collect();
        (&harness.clients[0]).write_all(&bytes).unwrap();

        // One 8-byte read holds exactly one 7-byte frame
        let deadline = Instant::now() + Duration::from_secs(2);
        let first = loop {
            let outcome = harness.context.service(token);
            if harness.stats.snapshot().messages_received > 0 {
                break outcome;
            }
            assert!(Instant::now() < deadline, "no data arrived");
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(first, ServiceOutcome::Pending);
        assert_eq!(harness.stats.snapshot().messages_received, 1);

        harness.service_until(0, |h| h.stats.snapshot().messages_received == 3);
        assert_eq!(harness.context.service(token), ServiceOutcome::Idle);
    }

    #[test]
    fn test_pool_requeues_yielded_connection() {
        let settings = WorkerSettings {
            read_buffer_size: 8,
            max_reads_per_pass: 1,
            ..Default::default()
        };
        let mut harness = Harness::new(2, settings);
        let pool = WorkerPool::spawn(1, harness.context.clone()).unwrap();

        let bytes: Vec<u8> = (0..5)
            .flat_map(|i| Frame::text(format!("m{}", i)).encode_masked(KEY))
            .collect();
        harness.clients[0].write_all(&bytes).unwrap();
        thread::sleep(Duration::from_millis(20));
        pool.dispatch(harness.token(0));

        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        let mut received = Vec::new();
        while received.len() < 5 {
            match Frame::decode(&buf, usize::MAX).unwrap() {
                Some((frame, used)) => {
                    buf.drain(..used);
                    received.push(frame.payload_text().into_owned());
                }
                None => {
                    let n = harness.clients[1].read(&mut chunk).unwrap();
                    assert!(n > 0);
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
        }

        let expected: Vec<String> = (0..5).map(|i| format!("Broadcast: m{}", i)).collect();
        assert_eq!(received, expected);
        pool.shutdown();
    }

    #[test]
    fn test_dropped_pool_closes_queues() {
        let harness = Harness::new(0, WorkerSettings::default());
        let pool = WorkerPool::spawn(2, harness.context.clone()).unwrap();
        let queues: Vec<Arc<WorkQueue>> = pool.queues.iter().map(Arc::clone).collect();

        drop(pool);

        assert!(queues.iter().all(|queue| queue.is_closed()));
    }

    #[test]
    fn test_pool_size_at_least_one() {
        let harness = Harness::new(0, WorkerSettings::default());
        let pool = WorkerPool::spawn(0, harness.context.clone()).unwrap();
        assert_eq!(pool.size(), 1);
        pool.shutdown();
    }
}

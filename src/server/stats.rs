//! Server statistics
//!
//! Lock-free counters shared by the event loop and the workers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters for one server instance
#[derive(Debug, Default)]
pub struct ServerStats {
    connections_accepted: AtomicU64,
    handshake_failures: AtomicU64,
    messages_received: AtomicU64,
    fragments_dropped: AtomicU64,
    frames_broadcast: AtomicU64,
    send_failures: AtomicU64,
    disconnects: AtomicU64,
    protocol_errors: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub handshake_failures: u64,
    pub messages_received: u64,
    pub fragments_dropped: u64,
    pub frames_broadcast: u64,
    pub send_failures: u64,
    pub disconnects: u64,
    pub protocol_errors: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accept(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_failure(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fragment_dropped(&self) {
        self.fragments_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one broadcast
    pub fn record_broadcast(&self, delivered: u64, failed: u64) {
        self.frames_broadcast.fetch_add(delivered, Ordering::Relaxed);
        self.send_failures.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            fragments_dropped: self.fragments_dropped.load(Ordering::Relaxed),
            frames_broadcast: self.frames_broadcast.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Accepted: {}, Handshake failures: {}, Messages: {}, Fragments dropped: {}, Frames sent: {}, Send failures: {}, Disconnects: {}, Protocol errors: {}",
            self.connections_accepted,
            self.handshake_failures,
            self.messages_received,
            self.fragments_dropped,
            self.frames_broadcast,
            self.send_failures,
            self.disconnects,
            self.protocol_errors
        )
    }
}

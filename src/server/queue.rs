//! Work queue between the event loop and one worker
//!
//! FIFO of connection ids whose sockets became readable. A token already
//! waiting in the queue is not queued twice: the worker drains the socket
//! completely when it gets to it, so a second entry would find nothing new.
//! This also bounds the queue length by the number of connections.

use mio::Token;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Token>,
    pending: HashSet<Token>,
    closed: bool,
}

/// Blocking multi-producer queue of ready connection ids
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a ready connection and wake one waiting worker
    ///
    /// Returns false if the token was already queued or the queue is closed.
    pub fn push(&self, token: Token) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed || !state.pending.insert(token) {
                return false;
            }
            state.items.push_back(token);
        }
        self.available.notify_one();
        true
    }

    /// Block until a token is available
    ///
    /// Returns `None` once the queue has been closed.
    pub fn pop(&self) -> Option<Token> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(token) = state.items.pop_front() {
                state.pending.remove(&token);
                return Some(token);
            }
            self.available.wait(&mut state);
        }
    }

    /// Stop the queue and wake every waiting worker
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.items.clear();
            state.pending.clear();
        }
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}

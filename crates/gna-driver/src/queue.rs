//! FIFO of requests waiting for the hardware.

use crate::request::{ScoreRequest, SessionId};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Pending scoring requests in submission order.
#[derive(Debug, Default)]
pub struct RequestQueue {
    pending: Mutex<VecDeque<ScoreRequest>>,
}

impl RequestQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request
    pub fn push_back(&self, request: ScoreRequest) {
        self.lock().push_back(request);
    }

    /// Take the oldest request
    pub fn pop_front(&self) -> Option<ScoreRequest> {
        self.lock().pop_front()
    }

    /// Take the oldest request submitted by `session`
    pub fn retrieve_next_for(&self, session: SessionId) -> Option<ScoreRequest> {
        let mut pending = self.lock();
        let index = pending.iter().position(|r| r.session_id() == session)?;
        pending.remove(index)
    }

    /// `true` when nothing is waiting
    pub fn is_idle(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of waiting requests
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// `true` when nothing is waiting
    pub fn is_empty(&self) -> bool {
        self.is_idle()
    }

    /// Take every waiting request
    pub fn purge(&self) -> Vec<ScoreRequest> {
        self.lock().drain(..).collect()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ScoreRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

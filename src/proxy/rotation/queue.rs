//! Pool-wide rotation request queue

use std::collections::VecDeque;

use parking_lot::Mutex;

/// A request to rotate one instance's address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationRequest {
    pub id: u32,
    pub forced: bool,
}

impl RotationRequest {
    pub fn new(id: u32, forced: bool) -> Self {
        Self { id, forced }
    }

    pub fn forced(id: u32) -> Self {
        Self::new(id, true)
    }
}

/// FIFO of pending rotation requests
///
/// Anyone may enqueue; the pool's queue worker drains it.
#[derive(Debug, Default)]
pub struct RotationQueue {
    pending: Mutex<VecDeque<RotationRequest>>,
}

impl RotationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, request: RotationRequest) {
        self.pending.lock().push_back(request);
    }

    /// Take every pending request in arrival order
    pub fn drain(&self) -> Vec<RotationRequest> {
        self.pending.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

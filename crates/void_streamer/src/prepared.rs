//! Prepared queue - requests waiting to be picked up by the processing stage

use std::collections::vec_deque::{self, VecDeque};

use crate::request::{RequestPtr, RequestStatus};

/// FIFO of fully specified requests
///
/// Not synchronized. It belongs to the thread that owns the context.
#[derive(Default)]
pub struct PreparedQueue {
    requests: VecDeque<RequestPtr>,
    /// Last pending id handed out
    last_pending_id: u64,
}

impl PreparedQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next pending id and append the request
    pub fn push(&mut self, request: RequestPtr) {
        assert!(
            !request.in_recycle_bin(),
            "A request sitting in a recycle bin was pushed to the prepared queue."
        );
        self.last_pending_id += 1;
        request.set_pending_id(self.last_pending_id);
        request.set_status(RequestStatus::Queued);
        self.requests.push_back(request);
    }

    /// Remove the oldest request
    pub fn pop(&mut self) -> Option<RequestPtr> {
        self.requests.pop_front()
    }

    /// Oldest request without removing it
    pub fn front(&self) -> Option<&RequestPtr> {
        self.requests.front()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Iterate in submission order
    pub fn iter(&self) -> vec_deque::Iter<'_, RequestPtr> {
        self.requests.iter()
    }

    /// Last pending id handed out, 0 if nothing was pushed yet
    pub fn last_pending_id(&self) -> u64 {
        self.last_pending_id
    }

    pub(crate) fn drain(&mut self) -> vec_deque::Drain<'_, RequestPtr> {
        self.requests.drain(..)
    }
}

//! Completion queue - finished requests waiting for their callbacks
//!
//! Any thread can push. The drain swaps the whole queue out in one short
//! critical section, so callbacks never run under the lock and completions
//! arriving meanwhile land in the fresh, empty queue.

use core::cell::RefCell;
use std::collections::VecDeque;

use parking_lot::ReentrantMutex;

use crate::request::RequestPtr;

/// Thread-safe FIFO of finished requests
///
/// The lock is reentrant: code running on behalf of a push (or holding the
/// queue through `with_locked`) can push again on the same thread.
#[derive(Default)]
pub struct CompletionQueue {
    queue: ReentrantMutex<RefCell<VecDeque<RequestPtr>>>,
}

impl CompletionQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a finished request
    ///
    /// # Panics
    /// If the request still waits on children or sits in a recycle bin.
    pub fn push(&self, request: RequestPtr) {
        assert_eq!(
            request.dependencies(),
            0,
            "Request marked as completed while it still has dependencies."
        );
        assert!(
            !request.in_recycle_bin(),
            "Request marked as completed while it sits in a recycle bin."
        );

        let guard = self.queue.lock();
        guard.borrow_mut().push_back(request);
    }

    /// Take everything queued so far, leaving an empty queue behind
    pub fn swap(&self) -> VecDeque<RequestPtr> {
        let guard = self.queue.lock();
        let taken = core::mem::take(&mut *guard.borrow_mut());
        taken
    }

    /// Run `f` while holding the queue lock. Pushes from inside `f` on this
    /// thread are allowed.
    pub fn with_locked<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        let _guard = self.queue.lock();
        f(self)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{FileRequest, RequestKind};
    use std::sync::Arc;

    #[test]
    fn test_swap_takes_everything() {
        let queue = CompletionQueue::new();
        let a = FileRequest::new(RequestKind::Internal);
        let b = FileRequest::new(RequestKind::Internal);
        queue.push(Arc::clone(&a));
        queue.push(Arc::clone(&b));
        assert_eq!(queue.len(), 2);

        let taken = queue.swap();
        assert_eq!(taken.len(), 2);
        assert!(Arc::ptr_eq(&taken[0], &a));
        assert!(Arc::ptr_eq(&taken[1], &b));
        assert!(queue.is_empty());
        assert!(queue.swap().is_empty());
    }

    #[test]
    fn test_reentrant_push() {
        let queue = CompletionQueue::new();
        queue.with_locked(|queue| {
            queue.push(FileRequest::new(RequestKind::Internal));
            queue.push(FileRequest::new(RequestKind::Internal));
        });
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_concurrent_pushes() {
        let queue = Arc::new(CompletionQueue::new());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        queue.push(FileRequest::new(RequestKind::Internal));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(queue.swap().len(), 400);
    }

    #[test]
    #[should_panic(expected = "still has dependencies")]
    fn test_push_with_dependencies_panics() {
        let queue = CompletionQueue::new();
        let parent = FileRequest::new(RequestKind::Internal);
        let child = FileRequest::new(RequestKind::Internal);
        child.link_parent(&parent);
        queue.push(parent);
    }
}

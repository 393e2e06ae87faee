//! Recycle pools - reusable request objects
//!
//! Two pools exist per context:
//! - `InternalRecycleBin`: requests owned by the streamer. Only the thread
//!   owning the context touches it, so it takes `&mut self` and no lock.
//! - `ExternalRequestPool`: requests handed out to callers as
//!   `ExternalRequest` handles. Handles are released from arbitrary threads,
//!   so the pool is guarded by its own mutex.
//!
//! The first time a pool is found empty it is pre-warmed with a batch of
//! requests. After that an empty pool allocates a single request at a time.
//!
//! The internal bin also keeps every request it ever allocated, so an
//! internal parent stays alive while it has children in flight even when the
//! processing stage dropped its own pointer to it.

use core::fmt;
use core::ops::Deref;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::request::{FileRequest, RequestKind, RequestPtr};

/// Freelist shared by both pool flavours
struct RecycleBin {
    kind: RequestKind,
    requests: Vec<RequestPtr>,
    /// Size of the first batch
    prewarm: usize,
    prewarmed: bool,
    /// Total requests ever created by this bin
    allocated: usize,
    /// Every request created by this bin, pooled or in flight
    owned: Option<Vec<RequestPtr>>,
    torn_down: bool,
}

/// Check the recycle preconditions and reset the request.
///
/// Runs outside any pool lock: resetting drops the old command and callback,
/// which may hold the last handle to another external request.
fn reset_for_recycle(request: &FileRequest, kind: RequestKind) {
    assert_eq!(
        request.dependencies(),
        0,
        "Request can't be recycled while it still has dependencies."
    );
    assert_eq!(
        request.kind(),
        kind,
        "Request recycled into the recycle bin of the other ownership kind."
    );
    assert!(
        !request.enter_recycle_bin(),
        "Request was recycled while already in a recycle bin."
    );
    request.reset();
}

impl RecycleBin {
    fn new(kind: RequestKind, prewarm: usize) -> Self {
        Self {
            kind,
            requests: Vec::new(),
            prewarm,
            prewarmed: false,
            allocated: 0,
            owned: None,
            torn_down: false,
        }
    }

    fn owning(mut self) -> Self {
        self.owned = Some(Vec::new());
        self
    }

    fn allocate(&mut self) -> RequestPtr {
        self.allocated += 1;
        let request = FileRequest::new(self.kind);
        if let Some(owned) = self.owned.as_mut() {
            owned.push(Arc::clone(&request));
        }
        request
    }

    fn acquire(&mut self) -> RequestPtr {
        if self.requests.is_empty() {
            if self.prewarmed {
                log::trace!("{:?} recycle bin empty, allocating a new request", self.kind);
                return self.allocate();
            }

            log::debug!(
                "Pre-warming {:?} recycle bin with {} requests",
                self.kind,
                self.prewarm
            );
            self.prewarmed = true;
            self.requests.reserve(self.prewarm);
            for _ in 0..self.prewarm {
                let request = self.allocate();
                request.enter_recycle_bin();
                self.requests.push(request);
            }
        }

        let request = match self.requests.pop() {
            Some(request) => request,
            None => return self.allocate(),
        };
        assert_eq!(
            request.kind(),
            self.kind,
            "Recycle bin contained a request of the wrong ownership kind."
        );
        assert!(
            request.is_unset(),
            "Recycle bin contained a request that still holds a command."
        );
        request.leave_recycle_bin();
        request
    }

    /// Keep a request that went through `reset_for_recycle`
    fn store(&mut self, request: RequestPtr) {
        if self.torn_down {
            log::trace!("{:?} recycle bin torn down, freeing request", self.kind);
            return;
        }
        self.requests.push(request);
    }

    fn tear_down(&mut self) -> usize {
        self.torn_down = true;
        let count = self.requests.len();
        self.requests.clear();
        self.owned = None;
        count
    }
}

/// Pool of streamer-owned requests
pub struct InternalRecycleBin {
    bin: RecycleBin,
}

impl InternalRecycleBin {
    /// Create an empty bin that pre-warms with `prewarm` requests
    pub fn new(prewarm: usize) -> Self {
        Self {
            bin: RecycleBin::new(RequestKind::Internal, prewarm).owning(),
        }
    }

    /// Take a reset request from the bin
    pub fn acquire(&mut self) -> RequestPtr {
        self.bin.acquire()
    }

    /// Reset a finished request and return it to the bin
    ///
    /// # Panics
    /// If the request still has dependencies, is external, or is already in
    /// a bin.
    pub fn recycle(&mut self, request: RequestPtr) {
        reset_for_recycle(&request, RequestKind::Internal);
        self.bin.store(request);
    }

    /// Number of requests waiting in the bin
    pub fn len(&self) -> usize {
        self.bin.requests.len()
    }

    /// Check if the bin is empty
    pub fn is_empty(&self) -> bool {
        self.bin.requests.is_empty()
    }

    /// Total requests ever created by this bin
    pub fn allocated_count(&self) -> usize {
        self.bin.allocated
    }
}

impl Drop for InternalRecycleBin {
    fn drop(&mut self) {
        self.bin.tear_down();
    }
}

/// Pool of caller-owned, reference counted requests
pub struct ExternalRequestPool {
    bin: Mutex<RecycleBin>,
}

impl ExternalRequestPool {
    /// Create an empty pool that pre-warms with `prewarm` requests
    pub fn new(prewarm: usize) -> Arc<Self> {
        Arc::new(Self {
            bin: Mutex::new(RecycleBin::new(RequestKind::External, prewarm)),
        })
    }

    /// Take a reset request from the pool
    pub fn acquire(self: &Arc<Self>) -> ExternalRequest {
        let request = self.bin.lock().acquire();
        ExternalRequest::new(request, Arc::downgrade(self))
    }

    /// Take `count` requests under a single lock acquisition
    pub fn acquire_batch(self: &Arc<Self>, count: usize, out: &mut Vec<ExternalRequest>) {
        out.reserve(count);
        let pool = Arc::downgrade(self);
        let mut bin = self.bin.lock();
        for _ in 0..count {
            out.push(ExternalRequest::new(bin.acquire(), pool.clone()));
        }
    }

    /// Reset a request whose last handle was released and return it
    fn recycle(&self, request: RequestPtr) {
        reset_for_recycle(&request, RequestKind::External);
        self.bin.lock().store(request);
    }

    /// Number of requests waiting in the pool
    pub fn len(&self) -> usize {
        self.bin.lock().requests.len()
    }

    /// Check if the pool is empty
    pub fn is_empty(&self) -> bool {
        self.bin.lock().requests.is_empty()
    }

    /// Total requests ever created by this pool
    pub fn allocated_count(&self) -> usize {
        self.bin.lock().allocated
    }

    /// Free every pooled request. Requests released afterwards are freed
    /// instead of pooled. Returns the number of requests freed.
    pub fn tear_down(&self) -> usize {
        self.bin.lock().tear_down()
    }
}

/// Reference counted handle to an external request
///
/// Cloning adds a reference. Dropping the last handle resets the request and
/// returns it to the pool it came from, or frees it if that pool is gone.
pub struct ExternalRequest {
    request: RequestPtr,
    pool: Weak<ExternalRequestPool>,
}

impl ExternalRequest {
    fn new(request: RequestPtr, pool: Weak<ExternalRequestPool>) -> Self {
        let refs = request.add_external_ref();
        assert_eq!(refs, 1, "Pooled external request still had live handles.");
        Self { request, pool }
    }

    /// The underlying request
    pub fn request(&self) -> &RequestPtr {
        &self.request
    }

    /// Number of live handles, including the one the streamer holds while
    /// the request is in flight
    pub fn ref_count(&self) -> usize {
        self.request.external_refs()
    }

    /// Check if two handles point at the same request
    pub fn ptr_eq(&self, other: &ExternalRequest) -> bool {
        Arc::ptr_eq(&self.request, &other.request)
    }
}

impl Deref for ExternalRequest {
    type Target = FileRequest;

    fn deref(&self) -> &FileRequest {
        &self.request
    }
}

impl Clone for ExternalRequest {
    fn clone(&self) -> Self {
        self.request.add_external_ref();
        Self {
            request: Arc::clone(&self.request),
            pool: self.pool.clone(),
        }
    }
}

impl Drop for ExternalRequest {
    fn drop(&mut self) {
        if self.request.release_external_ref() > 0 {
            return;
        }
        match self.pool.upgrade() {
            Some(pool) => pool.recycle(Arc::clone(&self.request)),
            None => log::trace!("External request pool is gone, freeing request"),
        }
    }
}

impl fmt::Debug for ExternalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalRequest")
            .field("refs", &self.ref_count())
            .field("request", &*self.request)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{FileCommand, FlushData, RequestStatus};

    #[test]
    fn test_internal_prewarm() {
        let mut bin = InternalRecycleBin::new(4);
        assert_eq!(bin.len(), 0);

        let request = bin.acquire();
        assert_eq!(bin.len(), 3);
        assert_eq!(bin.allocated_count(), 4);
        assert_eq!(request.kind(), RequestKind::Internal);
        assert!(!request.in_recycle_bin());
    }

    #[test]
    fn test_internal_grows_one_at_a_time_after_prewarm() {
        let mut bin = InternalRecycleBin::new(2);
        let _a = bin.acquire();
        let _b = bin.acquire();
        let _c = bin.acquire();

        assert_eq!(bin.len(), 0);
        assert_eq!(bin.allocated_count(), 3);
    }

    #[test]
    fn test_internal_recycle_reuses_object() {
        let mut bin = InternalRecycleBin::new(1);
        let request = bin.acquire();
        request.set_command(FileCommand::FlushAll);
        request.set_status(RequestStatus::Completed);
        let address = Arc::as_ptr(&request);

        bin.recycle(request);
        assert_eq!(bin.len(), 1);

        let again = bin.acquire();
        assert_eq!(Arc::as_ptr(&again), address);
        assert!(again.is_unset());
        assert_eq!(again.status(), RequestStatus::Pending);
    }

    #[test]
    fn test_internal_bin_keeps_in_flight_requests_alive() {
        let mut bin = InternalRecycleBin::new(1);
        let request = bin.acquire();
        let link = Arc::downgrade(&request);
        drop(request);

        let request = link.upgrade().unwrap();
        bin.recycle(request);
        assert_eq!(bin.len(), 1);

        drop(bin);
        assert!(link.upgrade().is_none());
    }

    #[test]
    #[should_panic(expected = "still has dependencies")]
    fn test_recycle_with_dependencies_panics() {
        let mut bin = InternalRecycleBin::new(2);
        let parent = bin.acquire();
        let child = bin.acquire();
        child.link_parent(&parent);
        bin.recycle(parent);
    }

    #[test]
    #[should_panic(expected = "already in a recycle bin")]
    fn test_double_recycle_panics() {
        let mut bin = InternalRecycleBin::new(1);
        let request = bin.acquire();
        bin.recycle(Arc::clone(&request));
        bin.recycle(request);
    }

    #[test]
    #[should_panic(expected = "other ownership kind")]
    fn test_wrong_kind_panics() {
        let mut bin = InternalRecycleBin::new(1);
        bin.recycle(FileRequest::new(RequestKind::External));
    }

    #[test]
    fn test_external_release_returns_to_pool() {
        let pool = ExternalRequestPool::new(1);
        let handle = pool.acquire();
        handle.set_command(FileCommand::Flush(FlushData { path: "a.pak".into() }));
        let copy = handle.clone();
        assert_eq!(handle.ref_count(), 2);

        drop(handle);
        assert_eq!(pool.len(), 0);
        assert_eq!(copy.ref_count(), 1);

        drop(copy);
        assert_eq!(pool.len(), 1);

        let again = pool.acquire();
        assert!(again.is_unset());
        assert_eq!(again.ref_count(), 1);
    }

    #[test]
    fn test_external_batch() {
        let pool = ExternalRequestPool::new(1);
        let mut handles = Vec::new();
        pool.acquire_batch(5, &mut handles);

        assert_eq!(handles.len(), 5);
        assert_eq!(pool.allocated_count(), 5);
        assert!(handles.iter().all(|h| h.kind() == RequestKind::External));

        handles.clear();
        assert_eq!(pool.len(), 5);
    }

    #[test]
    fn test_release_after_teardown_frees() {
        let pool = ExternalRequestPool::new(3);
        let handle = pool.acquire();
        assert_eq!(pool.tear_down(), 2);

        drop(handle);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_release_after_pool_dropped() {
        let pool = ExternalRequestPool::new(1);
        let handle = pool.acquire();
        let request = Arc::clone(handle.request());
        drop(pool);
        drop(handle);

        assert_eq!(Arc::strong_count(&request), 1);
        assert!(!request.in_recycle_bin());
    }
}

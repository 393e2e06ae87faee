//! Streamer context - request lifecycle and completion engine
//!
//! The context is owned by a single thread, normally the processing thread.
//! That thread acquires internal requests, moves requests through the
//! prepared queue and drains completions. Everything other threads need
//! (external requests, submission, reporting completions, waking the
//! processing thread) goes through a cloneable `ContextHandle`.
//!
//! ## Completion
//!
//! `drain_completed` swaps the shared completion queue into a local queue and
//! works through it. When the last child of a parent finishes, the parent is
//! appended to the same local queue, so a whole dependency chain resolves
//! bottom-up in a single pass without re-taking the lock.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};

use crate::completion::CompletionQueue;
use crate::config::StreamerConfig;
use crate::pool::{ExternalRequest, ExternalRequestPool, InternalRecycleBin};
use crate::prepared::PreparedQueue;
use crate::request::{FileRequest, RequestKind, RequestPtr, RequestStatus};
use crate::statistics::{AverageWindow, Statistic};
use crate::sync::ThreadSynchronizer;
use crate::{StreamerError, StreamerResult};

/// Owner name used for emitted statistics
const STATISTICS_OWNER: &str = "Streamer";

/// State shared between the context and its handles
struct Shared {
    external_pool: Arc<ExternalRequestPool>,
    completed: CompletionQueue,
    synchronizer: Arc<ThreadSynchronizer>,
    submissions: Sender<ExternalRequest>,
}

/// Thread-safe access point to a `StreamerContext`
#[derive(Clone)]
pub struct ContextHandle {
    shared: Arc<Shared>,
}

impl ContextHandle {
    /// Take a reset external request from the pool
    pub fn acquire_external(&self) -> ExternalRequest {
        self.shared.external_pool.acquire()
    }

    /// Take `count` external requests under a single lock acquisition
    pub fn acquire_external_batch(&self, count: usize, out: &mut Vec<ExternalRequest>) {
        self.shared.external_pool.acquire_batch(count, out);
    }

    /// Hand a filled-in external request to the processing thread and wake it
    pub fn submit(&self, request: ExternalRequest) -> StreamerResult<()> {
        self.shared
            .submissions
            .send(request)
            .map_err(|_| StreamerError::Disconnected)?;
        self.shared.synchronizer.resume();
        Ok(())
    }

    /// Report a request the processing stage has finished and wake the
    /// processing thread so it gets drained
    pub fn mark_completed(&self, request: RequestPtr) {
        self.shared.completed.push(request);
        self.shared.synchronizer.resume();
    }

    /// Wake the processing thread
    pub fn wake_processing_thread(&self) {
        self.shared.synchronizer.resume();
    }

    /// Synchronizer the processing thread sleeps on
    pub fn synchronizer(&self) -> &Arc<ThreadSynchronizer> {
        &self.shared.synchronizer
    }

    /// Number of external requests waiting in the pool
    pub fn external_pool_len(&self) -> usize {
        self.shared.external_pool.len()
    }

    /// Number of finished requests waiting for a drain
    pub fn completed_len(&self) -> usize {
        self.shared.completed.len()
    }
}

/// Rolling measurements kept when extended profiling is on
struct Profiling {
    /// Absolute difference between estimated and actual completion
    prediction_error_us: AverageWindow,
    callback_duration_us: AverageWindow,
    /// Missed deadline percentage per collection interval
    missed_deadlines: AverageWindow,
    deadline_requests: u64,
    deadline_misses: u64,
}

impl Profiling {
    fn new(window: usize) -> Self {
        Self {
            prediction_error_us: AverageWindow::new(window),
            callback_duration_us: AverageWindow::new(window),
            missed_deadlines: AverageWindow::new(window),
            deadline_requests: 0,
            deadline_misses: 0,
        }
    }

    fn record_completion(
        &mut self,
        now: Instant,
        estimated: Option<Instant>,
        deadline: Option<Instant>,
    ) {
        if let Some(estimated) = estimated {
            let error = if now >= estimated {
                now - estimated
            } else {
                estimated - now
            };
            self.prediction_error_us.push(error.as_micros() as f64);
        }
        if let Some(deadline) = deadline {
            self.deadline_requests += 1;
            if now > deadline {
                self.deadline_misses += 1;
            }
        }
    }
}

/// Values read from a request before its callback runs
struct Completion {
    kind: RequestKind,
    status: RequestStatus,
    parent: Option<Weak<FileRequest>>,
    estimated: Option<Instant>,
    deadline: Option<Instant>,
}

/// Request lifecycle owner for one streaming stack
pub struct StreamerContext {
    config: StreamerConfig,
    internal_pool: InternalRecycleBin,
    prepared: PreparedQueue,
    shared: Arc<Shared>,
    submissions: Receiver<ExternalRequest>,
    processed: u64,
    profiling: Option<Profiling>,
}

impl StreamerContext {
    /// Create a context with empty pools and queues
    pub fn new(config: StreamerConfig) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            external_pool: ExternalRequestPool::new(config.recycle_bin_prewarm),
            completed: CompletionQueue::new(),
            synchronizer: Arc::new(ThreadSynchronizer::new()),
            submissions: sender,
        });
        let profiling = config
            .extended_profiling
            .then(|| Profiling::new(config.statistics_window));

        Self {
            internal_pool: InternalRecycleBin::new(config.recycle_bin_prewarm),
            prepared: PreparedQueue::new(),
            shared,
            submissions: receiver,
            processed: 0,
            profiling,
            config,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    /// Handle for other threads
    pub fn handle(&self) -> ContextHandle {
        ContextHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    // Pools

    /// Take a reset internal request
    pub fn acquire_internal(&mut self) -> RequestPtr {
        self.internal_pool.acquire()
    }

    /// Take a reset external request
    pub fn acquire_external(&self) -> ExternalRequest {
        self.shared.external_pool.acquire()
    }

    /// Take `count` external requests under a single lock acquisition
    pub fn acquire_external_batch(&self, count: usize, out: &mut Vec<ExternalRequest>) {
        self.shared.external_pool.acquire_batch(count, out);
    }

    /// Return an internal request to its pool
    ///
    /// # Panics
    /// If the request has dependencies, is external or was already recycled.
    pub fn recycle_internal(&mut self, request: RequestPtr) {
        self.internal_pool.recycle(request);
    }

    /// Number of internal requests waiting in the pool
    pub fn internal_pool_len(&self) -> usize {
        self.internal_pool.len()
    }

    /// Number of external requests waiting in the pool
    pub fn external_pool_len(&self) -> usize {
        self.shared.external_pool.len()
    }

    // Prepared queue

    /// Queue a request for the processing stage
    ///
    /// # Panics
    /// If an external request is pushed without the streamer holding a
    /// handle to it. Use `push_prepared_external` for the first push.
    pub fn push_prepared(&mut self, request: RequestPtr) {
        if request.kind() == RequestKind::External {
            assert!(
                request.has_keep_alive(),
                "External request pushed without being submitted first."
            );
        }
        self.prepared.push(request);
    }

    /// Queue an external request, keeping it alive until it completes
    pub fn push_prepared_external(&mut self, request: ExternalRequest) {
        let ptr = Arc::clone(request.request());
        ptr.set_keep_alive(request);
        self.prepared.push(ptr);
    }

    /// Move requests submitted through `ContextHandle::submit` into the
    /// prepared queue. Returns the number moved.
    pub fn pump_submissions(&mut self) -> usize {
        let mut count = 0;
        while let Ok(request) = self.submissions.try_recv() {
            self.push_prepared_external(request);
            count += 1;
        }
        count
    }

    /// Remove the oldest prepared request
    pub fn pop_prepared(&mut self) -> Option<RequestPtr> {
        self.prepared.pop()
    }

    /// Oldest prepared request
    pub fn peek_prepared(&self) -> Option<&RequestPtr> {
        self.prepared.front()
    }

    /// Number of prepared requests
    pub fn prepared_len(&self) -> usize {
        self.prepared.len()
    }

    /// Prepared queue, for inspection by the processing stage
    pub fn prepared(&self) -> &PreparedQueue {
        &self.prepared
    }

    // Completion

    /// Report a finished request
    ///
    /// # Panics
    /// If the request still has dependencies or sits in a recycle bin.
    pub fn mark_completed(&self, request: RequestPtr) {
        self.shared.completed.push(request);
    }

    /// Fire callbacks for every finished request and resolve parents
    ///
    /// Keeps swapping the shared queue until it's observed empty. Returns
    /// true if at least one request was processed.
    pub fn drain_completed(&mut self) -> bool {
        let mut has_worked = false;
        loop {
            let mut local = self.shared.completed.swap();
            if local.is_empty() {
                return has_worked;
            }
            has_worked = true;
            log::trace!("Draining {} completed requests", local.len());
            self.drain_local(&mut local);
        }
    }

    fn drain_local(&mut self, local: &mut VecDeque<RequestPtr>) {
        while let Some(request) = local.pop_front() {
            // The callback may release or reuse the request, so everything
            // needed afterwards is read first.
            let completion = Completion {
                kind: request.kind(),
                status: request.status(),
                parent: request.parent_link(),
                estimated: request.estimated_completion(),
                deadline: request.deadline(),
            };

            let callback_start = Instant::now();
            if let Some(profiling) = self.profiling.as_mut() {
                profiling.record_completion(callback_start, completion.estimated, completion.deadline);
            }
            if let Some(callback) = request.take_completion_callback() {
                callback(&request);
                if let Some(profiling) = self.profiling.as_mut() {
                    let duration = callback_start.elapsed();
                    profiling.callback_duration_us.push(duration.as_micros() as f64);
                }
            }

            // Internal parents are owned by the recycle bin and external
            // ones by their handles, so the link only fails after teardown.
            match completion.parent.as_ref().map(Weak::upgrade) {
                Some(Some(parent)) => {
                    let remaining = parent.release_dependency();
                    parent.set_status(completion.status);
                    if remaining == 0 {
                        local.push_back(parent);
                    }
                }
                Some(None) => log::error!("Parent of a completed request was already freed"),
                None => {}
            }

            match completion.kind {
                RequestKind::Internal => self.internal_pool.recycle(request),
                RequestKind::External => request.release_keep_alive(),
            }
            self.processed += 1;
        }
    }

    /// Drop a request before it reaches the processing stage
    ///
    /// The request is detached from its parent and the parent's dependency
    /// count is decremented, but the parent is not checked for completion;
    /// that's up to the caller. No callback fires. Returns the parent, if any.
    ///
    /// # Panics
    /// If the request still has dependencies.
    pub fn reject_request(&mut self, request: RequestPtr) -> Option<RequestPtr> {
        assert_eq!(
            request.dependencies(),
            0,
            "Request can't be rejected while it still has dependencies."
        );

        let parent = request.take_parent();
        if let Some(parent) = &parent {
            parent.release_dependency();
        }

        match request.kind() {
            RequestKind::Internal => self.internal_pool.recycle(request),
            RequestKind::External => request.release_keep_alive(),
        }
        parent
    }

    // Thread synchronization

    /// Wake the processing thread
    pub fn wake_up_processing_thread(&self) {
        self.shared.synchronizer.resume();
    }

    /// Put the calling (processing) thread to sleep until woken, or until the
    /// configured idle timeout passes
    pub fn suspend_processing_thread(&self) {
        match self.config.idle_timeout() {
            Some(timeout) => {
                self.shared.synchronizer.suspend_for(timeout);
            }
            None => self.shared.synchronizer.suspend(),
        }
    }

    /// Synchronizer the processing thread sleeps on
    pub fn synchronizer(&self) -> &Arc<ThreadSynchronizer> {
        &self.shared.synchronizer
    }

    // Diagnostics

    /// Total requests drained since creation
    pub fn processed_count(&self) -> u64 {
        self.processed
    }

    /// Append the current statistics to `out`
    ///
    /// With extended profiling on this also folds the missed deadline ratio
    /// of the interval since the previous call into its rolling average.
    pub fn collect_statistics(&mut self, out: &mut Vec<Statistic>) {
        out.push(Statistic::integer(
            STATISTICS_OWNER,
            "Prepared requests",
            self.prepared.len() as i64,
        ));
        out.push(Statistic::integer(
            STATISTICS_OWNER,
            "Internal pool size",
            self.internal_pool.len() as i64,
        ));
        out.push(Statistic::integer(
            STATISTICS_OWNER,
            "External pool size",
            self.shared.external_pool.len() as i64,
        ));
        out.push(Statistic::integer(
            STATISTICS_OWNER,
            "Processed requests",
            self.processed as i64,
        ));

        if let Some(profiling) = self.profiling.as_mut() {
            if profiling.deadline_requests > 0 {
                let missed = profiling.deadline_misses as f64 / profiling.deadline_requests as f64;
                profiling.missed_deadlines.push(missed * 100.0);
                profiling.deadline_requests = 0;
                profiling.deadline_misses = 0;
            }
            out.push(Statistic::float(
                STATISTICS_OWNER,
                "Prediction error (us)",
                profiling.prediction_error_us.average(),
            ));
            out.push(Statistic::percentage(
                STATISTICS_OWNER,
                "Missed deadlines",
                profiling.missed_deadlines.average(),
            ));
            out.push(Statistic::float(
                STATISTICS_OWNER,
                "Callback duration (us)",
                profiling.callback_duration_us.average(),
            ));
        }
    }
}

impl Default for StreamerContext {
    fn default() -> Self {
        Self::new(StreamerConfig::default())
    }
}

impl Drop for StreamerContext {
    fn drop(&mut self) {
        let prepared: Vec<_> = self.prepared.drain().collect();
        let completed = self.shared.completed.swap();
        let in_flight = prepared.len() + completed.len();
        if in_flight > 0 {
            log::warn!(
                "Streamer context destroyed with {} requests still in flight",
                in_flight
            );
        }
        for request in prepared.iter().chain(completed.iter()) {
            request.release_keep_alive();
        }
        // Submitted but never pumped
        self.submissions.try_iter().for_each(drop);

        let freed = self.shared.external_pool.tear_down();
        log::info!(
            "Streamer context destroyed: {} requests processed, {} internal and {} external requests freed",
            self.processed,
            self.internal_pool.len(),
            freed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::FileCommand;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_drain_empty() {
        let mut context = StreamerContext::default();
        assert!(!context.drain_completed());
    }

    #[test]
    fn test_internal_request_is_recycled_after_drain() {
        let mut context = StreamerContext::default();
        let request = context.acquire_internal();
        request.set_command(FileCommand::FlushAll);
        context.push_prepared(request);

        let request = context.pop_prepared().unwrap();
        request.set_status(RequestStatus::Completed);
        context.mark_completed(request);

        assert_eq!(context.internal_pool_len(), 0);
        assert!(context.drain_completed());
        assert_eq!(context.internal_pool_len(), 1);
        assert_eq!(context.processed_count(), 1);
    }

    #[test]
    fn test_pump_submissions() {
        let mut context = StreamerContext::default();
        let handle = context.handle();

        let request = handle.acquire_external();
        request.set_command(FileCommand::FlushAll);
        handle.submit(request).unwrap();
        assert!(handle.synchronizer().is_wake_pending());

        assert_eq!(context.pump_submissions(), 1);
        assert_eq!(context.prepared_len(), 1);
        let queued = context.peek_prepared().unwrap();
        assert_eq!(queued.kind(), RequestKind::External);
        assert_eq!(queued.pending_id(), 1);
    }

    #[test]
    fn test_submit_after_context_dropped() {
        let context = StreamerContext::default();
        let handle = context.handle();
        let request = handle.acquire_external();
        drop(context);

        assert!(matches!(handle.submit(request), Err(StreamerError::Disconnected)));
    }

    #[test]
    #[should_panic(expected = "without being submitted")]
    fn test_push_external_without_keep_alive_panics() {
        let mut context = StreamerContext::default();
        let request = context.acquire_external();
        context.push_prepared(Arc::clone(request.request()));
    }

    #[test]
    fn test_callback_can_report_completions() {
        let mut context = StreamerContext::default();
        let handle = context.handle();
        let fired = Arc::new(AtomicUsize::new(0));

        let follow_up = context.acquire_internal();
        {
            let fired = Arc::clone(&fired);
            follow_up.set_completion_callback(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        let first = context.acquire_internal();
        {
            let fired = Arc::clone(&fired);
            first.set_completion_callback(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
                handle.mark_completed(follow_up);
            });
        }

        context.mark_completed(first);
        assert!(context.drain_completed());
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(context.handle().completed_len(), 0);
    }

    #[test]
    fn test_handle_completion_wakes_processing_thread() {
        let mut context = StreamerContext::default();
        let handle = context.handle();
        let request = context.acquire_internal();
        assert!(!handle.synchronizer().is_wake_pending());

        handle.mark_completed(request);
        assert!(handle.synchronizer().is_wake_pending());

        context.suspend_processing_thread();
        assert!(context.drain_completed());
    }

    #[test]
    fn test_statistics_without_profiling() {
        let mut context = StreamerContext::default();
        let mut stats = Vec::new();
        context.collect_statistics(&mut stats);

        let names: Vec<_> = stats.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            ["Prepared requests", "Internal pool size", "External pool size", "Processed requests"]
        );
    }

    #[test]
    fn test_drop_releases_in_flight_external_requests() {
        let mut context = StreamerContext::default();
        let request = context.acquire_external();
        let ptr = Arc::clone(request.request());
        context.push_prepared_external(request.clone());
        assert_eq!(request.ref_count(), 2);

        drop(context);
        assert_eq!(request.ref_count(), 1);
        drop(request);
        assert_eq!(Arc::strong_count(&ptr), 1);
    }
}

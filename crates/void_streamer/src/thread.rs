//! Processing thread - runs the streaming loop around a `StreamerContext`
//!
//! The thread owns the context. Each cycle it pumps submitted requests into
//! the prepared queue, lets the processor execute work and drains the
//! completions. It only suspends when none of those steps did anything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::StreamerConfig;
use crate::context::{ContextHandle, StreamerContext};
use crate::{StreamerError, StreamerResult};

/// The processing stage: picks up prepared requests and executes them
pub trait RequestProcessor: Send + 'static {
    /// Do one round of work. Return true if anything was done.
    ///
    /// Finished requests are reported with `StreamerContext::mark_completed`
    /// (or `ContextHandle::mark_completed` from another thread).
    fn execute(&mut self, context: &mut StreamerContext) -> bool;
}

impl<F> RequestProcessor for F
where
    F: FnMut(&mut StreamerContext) -> bool + Send + 'static,
{
    fn execute(&mut self, context: &mut StreamerContext) -> bool {
        self(context)
    }
}

/// Dedicated thread driving a streamer context
pub struct StreamerThread {
    handle: ContextHandle,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StreamerThread {
    /// Validate the configuration, create a context and start the thread
    pub fn spawn<P: RequestProcessor>(config: StreamerConfig, processor: P) -> StreamerResult<Self> {
        config.validate()?;

        let name = config.thread_name.clone();
        let context = StreamerContext::new(config);
        let handle = context.handle();
        let running = Arc::new(AtomicBool::new(true));

        let thread = {
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || main_loop(context, processor, running))
                .map_err(StreamerError::Spawn)?
        };
        log::info!("Streamer thread '{}' started", name);

        Ok(Self {
            handle,
            running,
            thread: Some(thread),
        })
    }

    /// Handle for submitting requests
    pub fn handle(&self) -> &ContextHandle {
        &self.handle
    }

    /// Check if the thread hasn't been asked to stop
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the thread to stop and wait for it. Completions already reported
    /// are drained before the thread exits.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.handle.wake_processing_thread();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Streamer thread panicked");
            }
        }
    }
}

impl Drop for StreamerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn main_loop<P: RequestProcessor>(mut context: StreamerContext, mut processor: P, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        let pumped = context.pump_submissions() > 0;
        let executed = processor.execute(&mut context);
        let drained = context.drain_completed();

        if !(pumped || executed || drained) {
            context.suspend_processing_thread();
        }
    }

    context.drain_completed();
    log::info!(
        "Streamer thread stopping after {} requests",
        context.processed_count()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{FileCommand, RequestStatus};
    use std::sync::mpsc;
    use std::time::Duration;

    fn complete_everything(context: &mut StreamerContext) -> bool {
        let mut worked = false;
        while let Some(request) = context.pop_prepared() {
            request.set_status(RequestStatus::Completed);
            context.mark_completed(request);
            worked = true;
        }
        worked
    }

    #[test]
    fn test_spawn_and_stop() {
        let mut thread = StreamerThread::spawn(StreamerConfig::default(), complete_everything).unwrap();
        assert!(thread.is_running());
        thread.stop();
        assert!(!thread.is_running());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = StreamerConfig::default().with_prewarm(0);
        let result = StreamerThread::spawn(config, complete_everything);
        assert!(matches!(result, Err(StreamerError::Config(_))));
    }

    #[test]
    fn test_submitted_request_completes() {
        let thread = StreamerThread::spawn(StreamerConfig::default(), complete_everything).unwrap();
        let (sender, receiver) = mpsc::channel();

        let request = thread.handle().acquire_external();
        request.set_command(FileCommand::FlushAll);
        request.set_completion_callback(move |request| {
            let _ = sender.send(request.status());
        });
        thread.handle().submit(request).unwrap();

        let status = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status, RequestStatus::Completed);
    }
}

//! # void_streamer - File Streaming Request Core
//!
//! Lifecycle and completion engine for asynchronous file requests:
//! - Pooled, reusable request objects (internal and reference counted external)
//! - FIFO prepared queue with monotonically increasing pending ids
//! - Completion draining with parent/child dependency resolution
//! - Latched suspend/resume for the processing thread
//! - Optional profiling statistics
//!
//! The processing stage that actually performs I/O plugs in through the
//! `RequestProcessor` trait; it pops prepared requests, executes them and
//! reports them back with `mark_completed`.
//!
//! ## Example
//!
//! ```ignore
//! use void_streamer::prelude::*;
//!
//! let streamer = StreamerThread::spawn(StreamerConfig::default(), |context: &mut StreamerContext| {
//!     let mut worked = false;
//!     while let Some(request) = context.pop_prepared() {
//!         // perform the read...
//!         request.set_status(RequestStatus::Completed);
//!         context.mark_completed(request);
//!         worked = true;
//!     }
//!     worked
//! })?;
//!
//! let request = streamer.handle().acquire_external();
//! request.set_command(FileCommand::ReadRequest(ReadRequestData::new("level.pak", 0, 4096)));
//! request.set_completion_callback(|request| println!("done: {:?}", request.status()));
//! streamer.handle().submit(request)?;
//! ```

pub mod request;
pub mod pool;
pub mod prepared;
pub mod completion;
pub mod sync;
pub mod statistics;
pub mod config;
pub mod context;
pub mod thread;

pub use request::{
    CancelData, CompletionCallback, FileCommand, FileExistsCheckData, FileMetaDataRetrievalData,
    FileRequest, FlushData, ReadData, ReadRequestData, RequestKind, RequestPriority, RequestPtr,
    RequestStatus,
};
pub use pool::{ExternalRequest, ExternalRequestPool, InternalRecycleBin};
pub use prepared::PreparedQueue;
pub use completion::CompletionQueue;
pub use sync::ThreadSynchronizer;
pub use statistics::{AverageWindow, Statistic, StatisticValue};
pub use config::{ConfigError, ConfigResult, StreamerConfig};
pub use context::{ContextHandle, StreamerContext};
pub use thread::{RequestProcessor, StreamerThread};

use thiserror::Error;

/// Streamer errors
#[derive(Debug, Error)]
pub enum StreamerError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to spawn streamer thread: {0}")]
    Spawn(std::io::Error),

    #[error("Streamer context is no longer accepting requests")]
    Disconnected,
}

pub type StreamerResult<T> = Result<T, StreamerError>;

/// Prelude - commonly used types
pub mod prelude {
    pub use crate::request::{FileCommand, FileRequest, ReadRequestData, RequestKind, RequestPtr, RequestStatus};
    pub use crate::pool::ExternalRequest;
    pub use crate::config::StreamerConfig;
    pub use crate::context::{ContextHandle, StreamerContext};
    pub use crate::thread::{RequestProcessor, StreamerThread};
    pub use crate::{StreamerError, StreamerResult};
}

//! File requests - the unit of work exchanged with the streaming stack
//!
//! A `FileRequest` carries a command payload, a status, an optional link to
//! the parent request it contributes to, and the callback that fires once the
//! request (and every child registered against it) has finished.
//!
//! Requests are pooled. While a request sits in a pool its command is
//! `FileCommand::Unset` and its `in_recycle_bin` flag is raised.

use core::any::Any;
use core::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::pool::ExternalRequest;

/// Shared pointer to a pooled request
pub type RequestPtr = Arc<FileRequest>;

/// Callback invoked exactly once when a request completes
pub type CompletionCallback = Box<dyn FnOnce(&FileRequest) + Send>;

/// Who owns a request for its whole lifetime
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Owned by the streamer, recycled automatically after completion
    Internal,
    /// Handed out to callers and reference counted
    External,
}

/// Status of a request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestStatus {
    /// Freshly acquired or reset
    #[default]
    Pending = 0,
    /// Waiting in the prepared queue
    Queued = 1,
    /// Picked up by the processing stage
    Processing = 2,
    /// Finished successfully
    Completed = 3,
    /// Finished with an error
    Failed = 4,
    /// Canceled before it could finish
    Canceled = 5,
}

impl RequestStatus {
    /// Check if the status is a final one
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Check if the request finished successfully
    pub fn is_success(&self) -> bool {
        *self == Self::Completed
    }
}

/// Priority hint for reads
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RequestPriority {
    Lowest = 0,
    Low = 1,
    #[default]
    Medium = 2,
    High = 3,
    Highest = 4,
}

/// High-level read submitted by a client
#[derive(Debug, Default)]
pub struct ReadRequestData {
    /// File to read from
    pub path: PathBuf,
    /// Byte offset into the file
    pub offset: u64,
    /// Number of bytes to read
    pub size: u64,
    /// Destination buffer, filled by the processing stage
    pub output: Vec<u8>,
    /// Point in time the caller needs the data by
    pub deadline: Option<Instant>,
    /// Scheduling hint
    pub priority: RequestPriority,
}

impl ReadRequestData {
    /// Create a read for a byte range of a file
    pub fn new(path: impl Into<PathBuf>, offset: u64, size: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            size,
            ..Default::default()
        }
    }

    /// Set the deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Low-level read issued by a stack layer on behalf of a parent request
#[derive(Debug, Default)]
pub struct ReadData {
    pub path: PathBuf,
    pub offset: u64,
    pub size: u64,
    pub output: Vec<u8>,
}

/// Check whether a file exists
#[derive(Debug, Default)]
pub struct FileExistsCheckData {
    pub path: PathBuf,
    /// Result, written by the processing stage
    pub found: bool,
}

/// Retrieve metadata for a file
#[derive(Debug, Default)]
pub struct FileMetaDataRetrievalData {
    pub path: PathBuf,
    /// Result, written by the processing stage
    pub file_size: u64,
    /// Result, written by the processing stage
    pub found: bool,
}

/// Cancel another in-flight request
#[derive(Debug)]
pub struct CancelData {
    /// Request to cancel. Non-owning.
    pub target: Weak<FileRequest>,
}

/// Flush cached data for a single file
#[derive(Debug, Default)]
pub struct FlushData {
    pub path: PathBuf,
}

/// Command payload of a request
#[derive(Default)]
pub enum FileCommand {
    /// No command, the state of every pooled request
    #[default]
    Unset,
    ReadRequest(ReadRequestData),
    Read(ReadData),
    FileExistsCheck(FileExistsCheckData),
    FileMetaDataRetrieval(FileMetaDataRetrievalData),
    Cancel(CancelData),
    Flush(FlushData),
    FlushAll,
    /// Opaque payload for collaborators with their own command types
    Custom(Box<dyn Any + Send + Sync>),
}

impl FileCommand {
    /// Check if this is the pooled sentinel
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    /// Short label for diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::ReadRequest(_) => "read request",
            Self::Read(_) => "read",
            Self::FileExistsCheck(_) => "file exists check",
            Self::FileMetaDataRetrieval(_) => "file metadata retrieval",
            Self::Cancel(_) => "cancel",
            Self::Flush(_) => "flush",
            Self::FlushAll => "flush all",
            Self::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for FileCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unset => write!(f, "Unset"),
            Self::ReadRequest(data) => f.debug_tuple("ReadRequest").field(data).finish(),
            Self::Read(data) => f.debug_tuple("Read").field(data).finish(),
            Self::FileExistsCheck(data) => f.debug_tuple("FileExistsCheck").field(data).finish(),
            Self::FileMetaDataRetrieval(data) => {
                f.debug_tuple("FileMetaDataRetrieval").field(data).finish()
            }
            Self::Cancel(data) => f.debug_tuple("Cancel").field(data).finish(),
            Self::Flush(data) => f.debug_tuple("Flush").field(data).finish(),
            Self::FlushAll => write!(f, "FlushAll"),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Mutable part of a request, guarded by the request's lock
#[derive(Default)]
struct RequestState {
    command: FileCommand,
    status: RequestStatus,
    parent: Option<Weak<FileRequest>>,
    on_completion: Option<CompletionCallback>,
    estimated_completion: Option<Instant>,
    /// Handle held by the streamer while an external request is in flight
    keep_alive: Option<ExternalRequest>,
}

/// A pooled unit of streaming work
pub struct FileRequest {
    kind: RequestKind,
    state: Mutex<RequestState>,
    /// Number of unfinished children
    dependencies: AtomicUsize,
    pending_id: AtomicU64,
    in_recycle_bin: AtomicBool,
    /// Live `ExternalRequest` handles, always zero for internal requests
    external_refs: AtomicUsize,
}

impl FileRequest {
    pub(crate) fn new(kind: RequestKind) -> RequestPtr {
        Arc::new(Self {
            kind,
            state: Mutex::new(RequestState::default()),
            dependencies: AtomicUsize::new(0),
            pending_id: AtomicU64::new(0),
            in_recycle_bin: AtomicBool::new(false),
            external_refs: AtomicUsize::new(0),
        })
    }

    /// Ownership kind
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Id assigned when the request entered the prepared queue, 0 if it never did
    pub fn pending_id(&self) -> u64 {
        self.pending_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_pending_id(&self, id: u64) {
        self.pending_id.store(id, Ordering::Release);
    }

    /// Current status
    pub fn status(&self) -> RequestStatus {
        self.state.lock().status
    }

    /// Set the status
    pub fn set_status(&self, status: RequestStatus) {
        self.state.lock().status = status;
    }

    /// Number of children that haven't finished yet
    pub fn dependencies(&self) -> usize {
        self.dependencies.load(Ordering::Acquire)
    }

    /// Check if the request currently sits in a pool
    pub fn in_recycle_bin(&self) -> bool {
        self.in_recycle_bin.load(Ordering::Acquire)
    }

    /// Raise the in-bin flag, returning the previous value
    pub(crate) fn enter_recycle_bin(&self) -> bool {
        self.in_recycle_bin.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn leave_recycle_bin(&self) {
        self.in_recycle_bin.store(false, Ordering::Release);
    }

    /// Replace the command payload
    pub fn set_command(&self, command: FileCommand) {
        self.state.lock().command = command;
    }

    /// Inspect the command payload
    pub fn with_command<R>(&self, f: impl FnOnce(&FileCommand) -> R) -> R {
        f(&self.state.lock().command)
    }

    /// Modify the command payload in place
    pub fn with_command_mut<R>(&self, f: impl FnOnce(&mut FileCommand) -> R) -> R {
        f(&mut self.state.lock().command)
    }

    /// Check if the command is the pooled sentinel
    pub fn is_unset(&self) -> bool {
        self.state.lock().command.is_unset()
    }

    /// Store the callback fired when this request completes
    pub fn set_completion_callback<F>(&self, callback: F)
    where
        F: FnOnce(&FileRequest) + Send + 'static,
    {
        self.state.lock().on_completion = Some(Box::new(callback));
    }

    pub(crate) fn take_completion_callback(&self) -> Option<CompletionCallback> {
        self.state.lock().on_completion.take()
    }

    /// Register this request as a dependency of `parent`
    ///
    /// The parent can't complete, be rejected or be recycled until this
    /// request has finished.
    pub fn link_parent(&self, parent: &RequestPtr) {
        assert!(
            !core::ptr::eq(self, Arc::as_ptr(parent)),
            "A request can't be its own parent."
        );
        assert!(
            !parent.in_recycle_bin(),
            "Linking a child to a parent request that sits in a recycle bin."
        );

        let mut state = self.state.lock();
        assert!(state.parent.is_none(), "Request already has a parent.");
        state.parent = Some(Arc::downgrade(parent));
        parent.dependencies.fetch_add(1, Ordering::AcqRel);
    }

    /// Parent this request contributes to, if any
    pub fn parent(&self) -> Option<RequestPtr> {
        self.state.lock().parent.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn parent_link(&self) -> Option<Weak<FileRequest>> {
        self.state.lock().parent.clone()
    }

    /// Detach from the parent, returning it
    pub(crate) fn take_parent(&self) -> Option<RequestPtr> {
        let link = self.state.lock().parent.take();
        link.as_ref().and_then(Weak::upgrade)
    }

    /// Decrement the dependency count, returning the remaining count
    pub(crate) fn release_dependency(&self) -> usize {
        match self
            .dependencies
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => panic!(
                "Request {} had a child finish while it wasn't tracking any dependencies.",
                self.pending_id()
            ),
        }
    }

    /// Estimated point in time the request will complete
    pub fn estimated_completion(&self) -> Option<Instant> {
        self.state.lock().estimated_completion
    }

    /// Set by the processing stage when it schedules the request
    pub fn set_estimated_completion(&self, at: Instant) {
        self.state.lock().estimated_completion = Some(at);
    }

    /// Deadline carried by a read request
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state.lock().command {
            FileCommand::ReadRequest(data) => data.deadline,
            _ => None,
        }
    }

    pub(crate) fn has_keep_alive(&self) -> bool {
        self.state.lock().keep_alive.is_some()
    }

    pub(crate) fn set_keep_alive(&self, handle: ExternalRequest) {
        let mut state = self.state.lock();
        assert!(
            state.keep_alive.is_none(),
            "External request is already in flight."
        );
        state.keep_alive = Some(handle);
    }

    /// Drop the streamer's reference to an in-flight external request.
    ///
    /// The handle is dropped after the request lock is released since the
    /// last release recycles the request, which locks it again.
    pub(crate) fn release_keep_alive(&self) {
        let handle = self.state.lock().keep_alive.take();
        drop(handle);
    }

    pub(crate) fn external_refs(&self) -> usize {
        self.external_refs.load(Ordering::Acquire)
    }

    pub(crate) fn add_external_ref(&self) -> usize {
        self.external_refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn release_external_ref(&self) -> usize {
        let previous = self.external_refs.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "External request released more often than acquired.");
        previous - 1
    }

    /// Return the request to its pooled state
    pub(crate) fn reset(&self) {
        let previous = core::mem::take(&mut *self.state.lock());
        self.pending_id.store(0, Ordering::Release);
        drop(previous);
    }
}

impl fmt::Debug for FileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FileRequest")
            .field("kind", &self.kind)
            .field("pending_id", &self.pending_id())
            .field("status", &state.status)
            .field("command", &state.command.name())
            .field("dependencies", &self.dependencies())
            .field("has_parent", &state.parent.is_some())
            .field("in_recycle_bin", &self.in_recycle_bin())
            .finish()
    }
}

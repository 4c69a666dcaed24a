//! Error types you might see while driving the sentry kernel or its control
//! plane
//!
//! Each failure domain gets its own enum. Validation and state errors are
//! surfaced to the immediate caller (and over the control socket as error
//! responses); `WouldBlock` is never an error to the guest, it parks the
//! caller on the waiter graph instead. Lock-order violations and state-file
//! corruption are fatal and abort the sandbox via panic.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the clock and timer fabric
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum TimeError {
    /// negative initial or interval duration in a timer setting
    #[error("invalid timer setting")]
    InvalidSetting,

    /// resume called on a timer that is not paused
    #[error("timer is not paused")]
    NotPaused,
}

/// Errors from waiter queues
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum WaiterError {
    /// registration attempted while the queue is being torn down
    #[error("waiter queue is closed")]
    QueueClosed,
}

/// Errors from the page allocator and memory file
#[derive(Error, Debug)]
pub enum MemoryError {
    /// the backing file cannot grow any further
    #[error("out of memory: {requested} bytes requested, {limit} byte limit")]
    OutOfMemory { requested: u64, limit: u64 },

    /// an accounting quota was exhausted
    #[error("memory quota exceeded for {class:?}")]
    QuotaExceeded { class: crate::memory::AccountingClass },

    /// operation on a range that is not tracked in the expected set
    #[error("invalid range [{start:#x}, {end:#x})")]
    InvalidRange { start: u64, end: u64 },

    /// backing file io error
    #[error("memory file io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from file descriptions and the mount shim
#[derive(Error, Debug)]
pub enum VfsError {
    /// no data (or no space) available right now; the caller should wait
    /// for readiness rather than surface this to the guest
    #[error("operation would block")]
    WouldBlock,

    /// short or malformed buffer for a fixed-size transfer
    #[error("invalid argument")]
    InvalidArgument,

    /// the description denies this access (e.g. pread on an anonymous fd)
    #[error("operation not permitted on this description")]
    NotPermitted,

    /// file descriptor is not present in the table
    #[error("bad file descriptor: {0}")]
    BadDescriptor(i32),

    /// too many outstanding references to a kernel object
    #[error("reference count overflow")]
    RefCountOverflow,

    /// mount destination does not resolve inside the namespace
    #[error("no such mount: {0:?}")]
    NoSuchMount(PathBuf),

    /// waiter queue error while registering for readiness
    #[error(transparent)]
    Waiter(#[from] WaiterError),
}

/// Errors from task and kernel-object operations
#[derive(Error, Debug)]
pub enum KernelError {
    /// the blocking operation was cancelled through its context
    #[error("operation canceled")]
    Canceled,

    /// the absolute deadline passed before the operation completed
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// no thread group with this pid
    #[error("no such process: {0}")]
    NoSuchProcess(i32),

    /// process creation failed validation
    #[error("invalid process args: {0}")]
    InvalidProcessArgs(String),

    /// the executable could not be resolved in the container image
    #[error("executable not found: {0:?}")]
    ExecutableNotFound(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Vfs(#[from] VfsError),
}

/// Errors from the checkpoint/restore engine and state files
#[derive(Error, Debug)]
pub enum StateError {
    /// state file io error
    #[error("state file io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// the trailing crc32 does not match the file contents
    #[error("state file checksum mismatch")]
    ChecksumMismatch,

    /// the file ends before the framing says it should
    #[error("state file truncated")]
    Truncated,

    /// the header is not a state file header, or the version is unknown
    #[error("state file corrupted: {0}")]
    Corruption(String),

    /// the restoring spec diverges from the checkpointed spec
    #[error("{field} does not match across checkpoint restore")]
    SpecMismatch { field: String },

    /// duplicated mounts in the restoring spec do not agree with each other
    #[error("invalid mount {destination:?} in restore spec")]
    InvalidMount { destination: String },

    /// object graph encode/decode error
    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Errors from the container control plane
#[derive(Error, Debug)]
pub enum ControlError {
    /// start called on a container that is not freshly created
    #[error("container already started")]
    AlreadyStarted,

    /// pause (or a running-only operation) called while not running
    #[error("container is not running")]
    NotRunning,

    /// resume called while not paused
    #[error("container is not paused")]
    NotPaused,

    /// container id contains characters outside [\w+-.]
    #[error("invalid container id: {0:?}")]
    InvalidId(String),

    /// a container with this id already has a state file
    #[error("container {0:?} already exists")]
    Exists(String),

    /// no container state on disk for this id
    #[error("container {0:?} not found")]
    NotFound(String),

    /// an abbreviated id matched more than one container
    #[error("container id {0:?} is ambiguous")]
    AmbiguousId(String),

    /// a required spec field is missing or malformed
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// the on-disk state file for a container cannot be decoded
    #[error("corrupted state file {path:?}: {source}")]
    CorruptedStateFile {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// control socket or state-directory io error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// malformed control message on the socket
    #[error("control protocol error: {0}")]
    Protocol(String),

    /// the remote side reported a failure
    #[error("{0}")]
    Remote(String),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Time(#[from] TimeError),

    /// message encode/decode error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

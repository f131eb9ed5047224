//! Error categorization and the failure side channel.
//!
//! Every unit of work (a listing, a stat, a chunk, a finalize) either succeeds
//! or produces a [`Failure`]. Failures never stall the queues: the item is
//! still acknowledged, and the failure is appended to a shared [`FailureLog`]
//! the orchestrator exposes after `wait_workers` returns.
//!
//! Categories drive the opt-in chunk retry:
//! - Retryable: transient failures that may succeed on retry (network resets, timeouts)
//! - Fatal: permanent failures (permission denied, missing file, short read)
//! - NoRetry: not an error of the transport, but retrying is pointless

use std::fmt;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

/// Category of an error for retry decision-making.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient error - retry may succeed (connection reset, timeout, etc.)
    Retryable,
    /// Permanent error - retry will never succeed (permission denied, short read, etc.)
    Fatal,
    /// Not a transport error, but should not retry (e.g. sink rejected the part set)
    NoRetry,
}

/// Which step of the pipeline produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureStage {
    /// Opening a source connection.
    Connect,
    /// Listing a directory.
    Listing,
    /// Querying a file size.
    Stat,
    /// Splitting a file into chunks.
    Plan,
    /// Opening the destination sink for a file.
    Open,
    /// Fetching or delivering one chunk.
    Chunk,
    /// Committing the ordered part list.
    Finalize,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Connect => "connect",
            FailureStage::Listing => "listing",
            FailureStage::Stat => "stat",
            FailureStage::Plan => "plan",
            FailureStage::Open => "open",
            FailureStage::Chunk => "chunk",
            FailureStage::Finalize => "finalize",
        }
    }
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded failure of one unit of work.
#[derive(Debug, Clone)]
pub struct Failure {
    /// The step that failed.
    pub stage: FailureStage,
    /// The remote path the work item referred to.
    pub path: String,
    /// Part number for chunk failures.
    pub part_number: Option<u32>,
    /// The underlying error message (full eyre chain).
    pub message: String,
    /// The error category.
    pub category: ErrorCategory,
    /// Number of attempts made before giving up.
    pub attempts: u8,
}

impl Failure {
    /// Build a failure from an error report, categorizing it on the way.
    pub fn from_report(stage: FailureStage, path: impl Into<String>, err: &eyre::Report) -> Self {
        Self {
            stage,
            path: path.into(),
            part_number: None,
            message: format!("{err:#}"),
            category: categorize_report(err),
            attempts: 1,
        }
    }

    /// Attach the part number of the chunk that failed.
    pub fn with_part(mut self, part_number: u32) -> Self {
        self.part_number = Some(part_number);
        self
    }

    /// Record how many attempts were made.
    pub fn with_attempts(mut self, attempts: u8) -> Self {
        self.attempts = attempts.max(1);
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.part_number {
            Some(part) => write!(
                f,
                "{} [{} part {}]: {}",
                self.path, self.stage, part, self.message
            ),
            None => write!(f, "{} [{}]: {}", self.path, self.stage, self.message),
        }
    }
}

impl std::error::Error for Failure {}

/// Shared, append-only list of failures.
#[derive(Debug, Clone, Default)]
pub struct FailureLog {
    inner: Arc<Mutex<Vec<Failure>>>,
}

impl FailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, failure: Failure) {
        self.inner.lock().push(failure);
    }

    pub fn snapshot(&self) -> Vec<Failure> {
        self.inner.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Categorize an IO error for retry decisions.
pub fn categorize_io_error(err: &io::Error) -> ErrorCategory {
    match err.kind() {
        // Retryable: transient conditions
        io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::WouldBlock => ErrorCategory::Retryable,

        // Fatal: permanent conditions
        io::ErrorKind::PermissionDenied
        | io::ErrorKind::NotFound
        | io::ErrorKind::InvalidData
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::AlreadyExists => ErrorCategory::Fatal,

        // These could go either way - default to fatal to avoid infinite loops
        io::ErrorKind::WriteZero
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::AddrInUse
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::NotConnected
        | io::ErrorKind::ConnectionRefused => ErrorCategory::Fatal,

        _ => ErrorCategory::Fatal,
    }
}

/// Categorize an error report, preferring an `io::Error` anywhere in its chain
/// and falling back to message heuristics (FTP replies arrive as text).
pub fn categorize_report(err: &eyre::Report) -> ErrorCategory {
    for cause in err.chain() {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            // `Other` wraps protocol errors whose text carries the category
            if io_err.kind() != io::ErrorKind::Other {
                return categorize_io_error(io_err);
            }
        }
        if let Some(failure) = cause.downcast_ref::<Failure>() {
            return failure.category;
        }
    }

    let msg = format!("{err:#}").to_lowercase();
    // 4xx FTP replies are transient by definition
    if msg.contains("transient reply")
        || msg.contains("connection reset")
        || msg.contains("broken pipe")
        || msg.contains("timed out")
    {
        return ErrorCategory::Retryable;
    }
    if msg.contains("incomplete part set") {
        return ErrorCategory::NoRetry;
    }
    ErrorCategory::Fatal
}

/// Run one unit of work, turning a panic into an error so the worker
/// thread survives and the queue item is still acknowledged.
pub fn catch_panic<T>(work: impl FnOnce() -> T) -> eyre::Result<T> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(work)).map_err(|payload| {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        eyre::eyre!("worker panicked: {detail}")
    })
}

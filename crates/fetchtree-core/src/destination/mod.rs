//! Destination sinks.
//!
//! A [`Destination`] is supplied by the caller per top-level work item and
//! hands out one [`Sink`] per transferred file. A sink is shared by every
//! chunk worker of its file at once, so `put` must be safe under concurrent
//! calls: implementations take `&self` and are `Send + Sync`, and the
//! pipeline adds no lock of its own around them.

use eyre::Result;
use std::sync::Arc;

use crate::transfer_plan::FinishedPart;

pub mod local;
pub mod memory;

pub use local::LocalDirDestination;
pub use memory::{MemoryDestination, MemorySink};

/// What a destination learns about a file before its first chunk arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileManifest {
    pub remote_path: String,
    pub size: u64,
    pub chunk_size: u64,
    pub expected_parts: u32,
}

impl FileManifest {
    /// Byte offset of `part_number` (1-based).
    pub fn offset_of(&self, part_number: u32) -> u64 {
        u64::from(part_number.saturating_sub(1)) * self.chunk_size
    }
}

/// Per-file write target.
pub trait Sink: Send + Sync {
    /// Store the bytes of one part and return its entity tag. Called
    /// concurrently and in any order.
    fn put(&self, part_number: u32, data: &[u8]) -> Result<String>;

    /// Commit the parts, ordered by part number. Only the successfully
    /// delivered parts are passed; a sink may reject an incomplete set.
    fn finalize(&self, _parts: &[FinishedPart]) -> Result<()> {
        Ok(())
    }

    /// Release the sink. Called exactly once, after every chunk was acknowledged.
    fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Human readable target for log lines.
    fn describe(&self) -> String;
}

/// Caller-supplied factory of per-file sinks.
pub trait Destination: Send + Sync {
    fn open(&self, manifest: &FileManifest) -> Result<Arc<dyn Sink>>;
}

/// Closes its sink when dropped unless closed explicitly first.
pub struct OpenSink {
    sink: Arc<dyn Sink>,
    closed: bool,
}

impl OpenSink {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            sink,
            closed: false,
        }
    }

    pub fn sink(&self) -> &Arc<dyn Sink> {
        &self.sink
    }

    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.sink.close()
    }
}

impl Drop for OpenSink {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.sink.close() {
                log::warn!("failed to close {}: {err:#}", self.sink.describe());
            }
        }
    }
}

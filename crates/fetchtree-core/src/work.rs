use std::fmt;
use std::sync::Arc;

use crate::destination::{Destination, Sink};
use crate::source::SourceParams;
use crate::transfer_plan::{missing_parts, FinishedPart};

/// A remote path to process, with the context needed to process it.
///
/// Created by the orchestrator (seed) or a walker (children) and consumed
/// exactly once, by a walker when it names a directory or by a coordinator
/// when it names a file.
#[derive(Clone)]
pub struct WorkItem {
    pub source: Arc<SourceParams>,
    pub remote_path: String,
    pub destination: Arc<dyn Destination>,
}

impl WorkItem {
    pub fn new(
        source: Arc<SourceParams>,
        remote_path: impl Into<String>,
        destination: Arc<dyn Destination>,
    ) -> Self {
        Self {
            source,
            remote_path: remote_path.into(),
            destination,
        }
    }

    /// Same source and destination, different path.
    pub fn child(&self, remote_path: impl Into<String>) -> Self {
        Self {
            source: Arc::clone(&self.source),
            remote_path: remote_path.into(),
            destination: Arc::clone(&self.destination),
        }
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("source", &self.source)
            .field("remote_path", &self.remote_path)
            .finish_non_exhaustive()
    }
}

/// A file whose chunks have all been acknowledged, as published on the
/// result queue.
#[derive(Clone)]
pub struct CompletedFile {
    pub remote_path: String,
    pub size: u64,
    pub expected_parts: u32,
    /// Successfully delivered parts, sorted by part number.
    pub parts: Vec<FinishedPart>,
    pub sink: Arc<dyn Sink>,
    pub finalize_error: Option<String>,
}

impl CompletedFile {
    /// Every expected part arrived and the sink accepted them.
    pub fn is_complete(&self) -> bool {
        self.finalize_error.is_none() && self.missing_parts().is_empty()
    }

    pub fn missing_parts(&self) -> Vec<u32> {
        missing_parts(&self.parts, self.expected_parts)
    }
}

impl fmt::Debug for CompletedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletedFile")
            .field("remote_path", &self.remote_path)
            .field("size", &self.size)
            .field("expected_parts", &self.expected_parts)
            .field("parts", &self.parts)
            .field("sink", &self.sink.describe())
            .field("finalize_error", &self.finalize_error)
            .finish()
    }
}

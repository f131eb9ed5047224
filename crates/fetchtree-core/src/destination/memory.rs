//! In-memory destination, used by tests and dry runs.

use eyre::{bail, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{Destination, FileManifest, Sink};
use crate::checksum::{entity_tag, ChecksumType};
use crate::transfer_plan::FinishedPart;

#[derive(Clone, Default)]
pub struct MemoryDestination {
    files: Arc<Mutex<BTreeMap<String, Arc<MemorySink>>>>,
    tag: ChecksumType,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity_tag(tag: ChecksumType) -> Self {
        Self {
            files: Arc::default(),
            tag,
        }
    }

    /// The sink opened for `remote_path`, if any.
    pub fn file(&self, remote_path: &str) -> Option<Arc<MemorySink>> {
        self.files.lock().get(remote_path).cloned()
    }

    /// Every path a sink was opened for, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.files.lock().keys().cloned().collect()
    }
}

impl Destination for MemoryDestination {
    fn open(&self, manifest: &FileManifest) -> Result<Arc<dyn Sink>> {
        let sink = Arc::new(MemorySink {
            manifest: manifest.clone(),
            tag: self.tag,
            parts: Mutex::new(BTreeMap::new()),
            finalized: Mutex::new(None),
            closed: AtomicBool::new(false),
            puts: AtomicUsize::new(0),
        });
        self.files
            .lock()
            .insert(manifest.remote_path.clone(), Arc::clone(&sink));
        Ok(sink)
    }
}

pub struct MemorySink {
    manifest: FileManifest,
    tag: ChecksumType,
    parts: Mutex<BTreeMap<u32, Vec<u8>>>,
    finalized: Mutex<Option<Vec<FinishedPart>>>,
    closed: AtomicBool,
    puts: AtomicUsize,
}

impl MemorySink {
    pub fn manifest(&self) -> &FileManifest {
        &self.manifest
    }

    /// Received parts concatenated in part order.
    pub fn contents(&self) -> Vec<u8> {
        self.parts.lock().values().flatten().copied().collect()
    }

    pub fn part_numbers(&self) -> Vec<u32> {
        self.parts.lock().keys().copied().collect()
    }

    /// The part list handed to `finalize`, if it was called.
    pub fn finalized_parts(&self) -> Option<Vec<FinishedPart>> {
        self.finalized.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

impl Sink for MemorySink {
    fn put(&self, part_number: u32, data: &[u8]) -> Result<String> {
        if self.is_closed() {
            bail!("put after close on {}", self.manifest.remote_path);
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.parts.lock().insert(part_number, data.to_vec());
        Ok(entity_tag(data, self.tag))
    }

    fn finalize(&self, parts: &[FinishedPart]) -> Result<()> {
        *self.finalized.lock() = Some(parts.to_vec());
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            bail!("{} closed twice", self.manifest.remote_path);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.manifest.remote_path)
    }
}

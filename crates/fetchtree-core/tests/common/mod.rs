#![allow(dead_code)]

pub mod ftp_server;

use eyre::{bail, Result};
use fetchtree_core::{
    Connector, EntryKind, FetchConfig, ReadSeek, RemoteEntry, Source, SourceParams,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;

/// Deterministic, position-dependent payload so misplaced chunks show up.
pub fn payload(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Small, fast configuration for tests.
pub fn test_config(chunk_size: u64) -> FetchConfig {
    FetchConfig {
        max_workers: 4,
        chunk_size_bytes: chunk_size,
        worker_wait_interval_secs: 1,
        chunk_workers: 3,
        ..FetchConfig::default()
    }
}

/// An in-memory directory tree.
#[derive(Debug, Default)]
pub struct FakeTree {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Arc<Vec<u8>>>,
}

impl FakeTree {
    pub fn new() -> Self {
        let mut tree = Self::default();
        tree.dirs.insert("/".to_string());
        tree
    }

    pub fn dir(mut self, path: &str) -> Self {
        self.add_dir(path);
        self
    }

    pub fn file(mut self, path: &str, data: Vec<u8>) -> Self {
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.add_dir(if parent.is_empty() { "/" } else { parent });
        }
        self.files.insert(path.to_string(), Arc::new(data));
        self
    }

    fn add_dir(&mut self, path: &str) {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
    }

    pub fn children(&self, dir: &str) -> Vec<RemoteEntry> {
        let prefix = if dir == "/" { "/".to_string() } else { format!("{dir}/") };
        let direct = |path: &String| {
            path.strip_prefix(&prefix)
                .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                .map(str::to_string)
        };
        let mut entries: Vec<RemoteEntry> = self
            .dirs
            .iter()
            .filter_map(|d| direct(d).map(|name| RemoteEntry::new(dir, name, EntryKind::Directory)))
            .collect();
        entries.extend(
            self.files
                .keys()
                .filter_map(|f| direct(f).map(|name| RemoteEntry::new(dir, name, EntryKind::File))),
        );
        entries
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    pub fn contents(&self, path: &str) -> Option<Arc<Vec<u8>>> {
        self.files.get(path).cloned()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.dirs.contains(path)
    }
}

/// Injected failures, keyed by remote path.
#[derive(Debug, Default)]
pub struct Faults {
    pub listings: Mutex<HashSet<String>>,
    pub stats: Mutex<HashSet<String>>,
    /// `(path, chunk start) -> (error kind, remaining failures)`; `None` fails forever.
    pub reads: Mutex<HashMap<(String, u64), (io::ErrorKind, Option<u32>)>>,
    /// Sizes reported by `stat` instead of the stored length.
    pub sizes: Mutex<HashMap<String, u64>>,
    /// Delay before the first read of every reader.
    pub read_delay: Mutex<Option<Duration>>,
}

impl Faults {
    pub fn fail_listing(&self, path: &str) {
        self.listings.lock().insert(path.to_string());
    }

    pub fn fail_stat(&self, path: &str) {
        self.stats.lock().insert(path.to_string());
    }

    pub fn fail_read(&self, path: &str, start: u64, kind: io::ErrorKind, times: Option<u32>) {
        self.reads.lock().insert((path.to_string(), start), (kind, times));
    }

    pub fn report_size(&self, path: &str, size: u64) {
        self.sizes.lock().insert(path.to_string(), size);
    }

    pub fn slow_reads(&self, delay: Duration) {
        *self.read_delay.lock() = Some(delay);
    }

    fn take_read_fault(&self, path: &str, start: u64) -> Option<io::ErrorKind> {
        let mut reads = self.reads.lock();
        let key = (path.to_string(), start);
        let (kind, remaining) = reads.get_mut(&key)?;
        let kind = *kind;
        match remaining {
            None => Some(kind),
            Some(0) => None,
            Some(n) => {
                *n -= 1;
                Some(kind)
            }
        }
    }
}

/// Connector over a [`FakeTree`] that counts connections and read attempts.
pub struct FakeConnector {
    pub tree: Arc<FakeTree>,
    pub faults: Arc<Faults>,
    pub connects: AtomicUsize,
    pub reads: Arc<AtomicUsize>,
}

impl FakeConnector {
    pub fn new(tree: FakeTree) -> Arc<Self> {
        Arc::new(Self {
            tree: Arc::new(tree),
            faults: Arc::new(Faults::default()),
            connects: AtomicUsize::new(0),
            reads: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn read_attempts(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl Connector for FakeConnector {
    fn connect(&self, params: &SourceParams) -> Result<Box<dyn Source>> {
        if params.scheme() != "fake" {
            bail!("fake connector cannot serve scheme {}", params.scheme());
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSource {
            tree: Arc::clone(&self.tree),
            faults: Arc::clone(&self.faults),
            reads: Arc::clone(&self.reads),
        }))
    }
}

pub fn fake_params() -> SourceParams {
    SourceParams::new().with(SourceParams::SCHEME, "fake")
}

struct FakeSource {
    tree: Arc<FakeTree>,
    faults: Arc<Faults>,
    reads: Arc<AtomicUsize>,
}

impl Source for FakeSource {
    fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        if self.faults.listings.lock().contains(path) {
            bail!("550 {path}: permission denied");
        }
        if !self.tree.is_dir(path) {
            bail!("550 {path}: not a directory");
        }
        Ok(self.tree.children(path))
    }

    fn stat(&mut self, path: &str) -> Result<u64> {
        if self.faults.stats.lock().contains(path) {
            bail!("550 {path}: no such file");
        }
        if let Some(size) = self.faults.sizes.lock().get(path) {
            return Ok(*size);
        }
        match self.tree.contents(path) {
            Some(data) => Ok(data.len() as u64),
            None => bail!("550 {path}: no such file"),
        }
    }

    fn open_read<'a>(&'a mut self, path: &str) -> Result<Box<dyn ReadSeek + 'a>> {
        match self.tree.contents(path) {
            Some(data) => Ok(Box::new(FakeReader {
                path: path.to_string(),
                data,
                pos: 0,
                faults: Arc::clone(&self.faults),
                reads: Arc::clone(&self.reads),
                checked: false,
            })),
            None => bail!("550 {path}: no such file"),
        }
    }
}

struct FakeReader {
    path: String,
    data: Arc<Vec<u8>>,
    pos: u64,
    faults: Arc<Faults>,
    reads: Arc<AtomicUsize>,
    checked: bool,
}

impl Read for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.checked {
            self.checked = true;
            self.reads.fetch_add(1, Ordering::SeqCst);
            let delay = *self.faults.read_delay.lock();
            if let Some(delay) = delay {
                thread::sleep(delay);
            }
            if let Some(kind) = self.faults.take_read_fault(&self.path, self.pos) {
                return Err(io::Error::new(kind, format!("injected failure at {}", self.pos)));
            }
        }
        let start = (self.pos as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for FakeReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = match pos {
            SeekFrom::Start(n) => n,
            SeekFrom::Current(d) => self.pos.saturating_add_signed(d),
            SeekFrom::End(d) => (self.data.len() as u64).saturating_add_signed(d),
        };
        Ok(self.pos)
    }
}

//! The orchestrator owns the queues and the worker threads.
//!
//! Typical use:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use fetchtree_core::{FetchConfig, Orchestrator, SourceParams, LocalDirDestination};
//! # fn main() -> eyre::Result<()> {
//! let mut orchestrator = Orchestrator::with_default_connector(FetchConfig::default())?;
//! let (params, seed) = SourceParams::parse("ftp://ftp.example.com/pub/data")?;
//! orchestrator.load_queue(params, &seed, Arc::new(LocalDirDestination::new("out")));
//! orchestrator.queue_workers()?;
//! let files = orchestrator.wait_workers()?;
//! # let _ = files;
//! # Ok(())
//! # }
//! ```

use eyre::{bail, Result, WrapErr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::FetchConfig;
use crate::coordinator::Coordinator;
use crate::destination::Destination;
use crate::errors::{Failure, FailureLog};
use crate::queue::{CancelToken, JoinableQueue};
use crate::source::{normalize_remote, Connector, SchemeConnector, SourceParams};
use crate::walker::Walker;
use crate::work::{CompletedFile, WorkItem};

mod summary;

pub use summary::FetchSummary;

/// Walkers and coordinators split the worker budget.
const WORKER_CLASSES: usize = 2;

/// Outstanding (enqueued but unacknowledged) items per queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub walk: usize,
    pub download: usize,
    pub result: usize,
}

impl QueueDepths {
    pub fn is_idle(&self) -> bool {
        self.walk == 0 && self.download == 0
    }
}

/// Snapshot handed to the `wait_workers_with` observer on every poll.
#[derive(Clone, Debug)]
pub struct Progress {
    pub queues: QueueDepths,
    pub failures: usize,
    pub elapsed: Duration,
}

pub struct Orchestrator {
    config: Arc<FetchConfig>,
    connector: Arc<dyn Connector>,
    walks: JoinableQueue<WorkItem>,
    downloads: JoinableQueue<WorkItem>,
    results: JoinableQueue<CompletedFile>,
    cancel: CancelToken,
    failures: FailureLog,
    walkers: Vec<JoinHandle<()>>,
    coordinators: Vec<JoinHandle<()>>,
    started: Instant,
    shut_down: bool,
}

impl Orchestrator {
    pub fn new(config: FetchConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            connector,
            walks: JoinableQueue::new("walk"),
            downloads: JoinableQueue::new("download"),
            results: JoinableQueue::new("result"),
            cancel: CancelToken::new(),
            failures: FailureLog::new(),
            walkers: Vec::new(),
            coordinators: Vec::new(),
            started: Instant::now(),
            shut_down: false,
        })
    }

    /// Orchestrator connecting through [`SchemeConnector`] (`ftp` and `file`).
    pub fn with_default_connector(config: FetchConfig) -> Result<Self> {
        Self::new(config, Arc::new(SchemeConnector))
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Seed one directory tree to walk.
    pub fn load_queue(
        &self,
        source: SourceParams,
        remote_path: &str,
        destination: Arc<dyn Destination>,
    ) {
        let item = WorkItem::new(Arc::new(source), normalize_remote(remote_path), destination);
        log::debug!("seeding walk of {}", item.remote_path);
        self.walks.put(item);
    }

    /// Seed a single file, skipping the listing step.
    pub fn load_file(
        &self,
        source: SourceParams,
        remote_path: &str,
        destination: Arc<dyn Destination>,
    ) {
        let item = WorkItem::new(Arc::new(source), normalize_remote(remote_path), destination);
        log::debug!("seeding download of {}", item.remote_path);
        self.downloads.put(item);
    }

    /// Start the walker and coordinator threads. Calling it again is a no-op.
    pub fn queue_workers(&mut self) -> Result<()> {
        if self.shut_down {
            bail!("orchestrator has been shut down");
        }
        if !self.walkers.is_empty() || !self.coordinators.is_empty() {
            return Ok(());
        }

        let per_class = self.config.workers_per_class(WORKER_CLASSES);
        for idx in 0..per_class {
            let walker = Walker {
                id: format!("walker-{idx}"),
                walks: self.walks.clone(),
                downloads: self.downloads.clone(),
                connector: Arc::clone(&self.connector),
                cancel: self.cancel.clone(),
                failures: self.failures.clone(),
            };
            let handle = thread::Builder::new()
                .name(walker.id.clone())
                .spawn(move || walker.run())
                .wrap_err("failed to spawn walker thread")?;
            self.walkers.push(handle);
        }

        for idx in 0..per_class {
            let coordinator = Coordinator {
                id: format!("coordinator-{idx}"),
                downloads: self.downloads.clone(),
                results: self.results.clone(),
                connector: Arc::clone(&self.connector),
                config: Arc::clone(&self.config),
                cancel: self.cancel.clone(),
                failures: self.failures.clone(),
            };
            let handle = thread::Builder::new()
                .name(coordinator.id.clone())
                .spawn(move || coordinator.run())
                .wrap_err("failed to spawn coordinator thread")?;
            self.coordinators.push(handle);
        }

        log::info!(
            "started {} walkers and {} coordinators ({} chunk workers each)",
            self.walkers.len(),
            self.coordinators.len(),
            self.config.chunk_workers
        );
        Ok(())
    }

    /// Block until every seeded tree has been walked and every file
    /// transferred, then return the finished files.
    pub fn wait_workers(&mut self) -> Result<Vec<CompletedFile>> {
        self.wait_workers_with(|_| {})
    }

    /// Like [`wait_workers`](Self::wait_workers), reporting progress on
    /// every poll of the queues.
    pub fn wait_workers_with(
        &mut self,
        mut observer: impl FnMut(&Progress),
    ) -> Result<Vec<CompletedFile>> {
        self.queue_workers()?;
        let interval = self.config.wait_interval();
        loop {
            // Walk first: files are enqueued before their directory is acknowledged.
            let walk = self.walks.outstanding();
            let download = self.downloads.outstanding();
            observer(&self.progress());
            if walk == 0 && download == 0 {
                break;
            }
            if walk > 0 {
                self.walks.join_timeout(interval);
            } else {
                self.downloads.join_timeout(interval);
            }
        }

        let mut files = self.results.drain();
        files.sort_by(|a, b| a.remote_path.cmp(&b.remote_path));
        log::debug!("collected {} finished files", files.len());
        Ok(files)
    }

    pub fn progress(&self) -> Progress {
        Progress {
            queues: self.outstanding(),
            failures: self.failures.len(),
            elapsed: self.started.elapsed(),
        }
    }

    pub fn outstanding(&self) -> QueueDepths {
        QueueDepths {
            walk: self.walks.outstanding(),
            download: self.downloads.outstanding(),
            result: self.results.outstanding(),
        }
    }

    /// Every failure recorded so far.
    pub fn failures(&self) -> Vec<Failure> {
        self.failures.snapshot()
    }

    pub fn summarize(&self, files: &[CompletedFile]) -> FetchSummary {
        FetchSummary::from_results(files, &self.failures.snapshot(), self.started.elapsed())
    }

    /// Stop every worker and wait for the threads to exit. In-flight items are
    /// finished; queued ones are abandoned.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.cancel.cancel();
        self.walks.stop_workers(self.walkers.len());
        self.downloads.stop_workers(self.coordinators.len());

        for handle in self.walkers.drain(..).chain(self.coordinators.drain(..)) {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                log::warn!("{name} panicked during shutdown");
            }
        }
        log::debug!("orchestrator shut down");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Transfer coordinators: one file at a time, stat it, split it into chunks,
//! fan the chunks out to this coordinator's chunk pool, wait for all of them,
//! then finalize the sink and publish the result.

use crossbeam_channel::unbounded;
use eyre::{Result, WrapErr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::chunk_worker::{ChunkJob, ChunkWorker};
use crate::config::FetchConfig;
use crate::destination::{FileManifest, OpenSink};
use crate::errors::{catch_panic, Failure, FailureLog, FailureStage};
use crate::queue::{CancelToken, JoinableQueue};
use crate::source::Connector;
use crate::transfer_plan::{missing_parts, order_parts, plan_chunks};
use crate::work::{CompletedFile, WorkItem};

const JOIN_SLICE: Duration = Duration::from_millis(100);

pub struct Coordinator {
    pub id: String,
    pub downloads: JoinableQueue<WorkItem>,
    pub results: JoinableQueue<CompletedFile>,
    pub connector: Arc<dyn Connector>,
    pub config: Arc<FetchConfig>,
    pub cancel: CancelToken,
    pub failures: FailureLog,
}

impl Coordinator {
    /// Serve the download queue until cancelled or stopped, then shut the
    /// chunk pool down.
    pub fn run(self) {
        let chunks = JoinableQueue::new("chunk");
        let pool = self.spawn_chunk_pool(&chunks);
        log::debug!("[{}] started with {} chunk workers", self.id, pool.len());

        while let Some(item) = self.downloads.get(&self.cancel) {
            let _done = self.downloads.guard();
            // Step in progress; a panic is recorded against it.
            let mut stage = FailureStage::Stat;
            let outcome = catch_panic(|| self.transfer(&item, &chunks, &mut stage));
            if let Err(err) = outcome {
                log::warn!("[{}] {} ({stage}): {err:#}", self.id, item.remote_path);
                self.failures.record(Failure::from_report(stage, &item.remote_path, &err));
            }
        }

        chunks.stop_workers(pool.len());
        for handle in pool {
            if handle.join().is_err() {
                log::warn!("[{}] chunk worker panicked", self.id);
            }
        }
        log::debug!("[{}] stopped", self.id);
    }

    fn spawn_chunk_pool(&self, chunks: &JoinableQueue<ChunkJob>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.chunk_workers);
        for idx in 0..self.config.chunk_workers.max(1) {
            let worker = ChunkWorker {
                id: format!("{}-chunk-{}", self.id, idx),
                queue: chunks.clone(),
                connector: Arc::clone(&self.connector),
                cancel: self.cancel.clone(),
                failures: self.failures.clone(),
                max_retries: self.config.chunk_retries,
            };
            match thread::Builder::new()
                .name(worker.id.clone())
                .spawn(move || worker.run())
            {
                Ok(handle) => handles.push(handle),
                Err(err) => log::warn!("[{}] failed to spawn chunk worker: {err}", self.id),
            }
        }
        handles
    }

    fn stat(&self, item: &WorkItem) -> Result<u64> {
        let mut source = self
            .connector
            .connect(&item.source)
            .wrap_err("open stat connection")?;
        source
            .stat(&item.remote_path)
            .wrap_err_with(|| format!("stat {}", item.remote_path))
    }

    fn transfer(
        &self,
        item: &WorkItem,
        chunks: &JoinableQueue<ChunkJob>,
        stage: &mut FailureStage,
    ) {
        let started = Instant::now();
        *stage = FailureStage::Stat;
        let size = match self.stat(item) {
            Ok(size) => size,
            Err(err) => {
                log::warn!("[{}] {}: {err:#}", self.id, item.remote_path);
                self.failures.record(Failure::from_report(
                    FailureStage::Stat,
                    &item.remote_path,
                    &err,
                ));
                return;
            }
        };

        *stage = FailureStage::Plan;
        let chunk_size = self.config.chunk_size_bytes;
        let plan = match plan_chunks(&item.remote_path, size, chunk_size) {
            Ok(plan) => plan,
            Err(err) => {
                log::warn!("[{}] {}: {err:#}", self.id, item.remote_path);
                self.failures.record(Failure::from_report(
                    FailureStage::Plan,
                    &item.remote_path,
                    &err,
                ));
                return;
            }
        };
        let manifest = FileManifest {
            remote_path: item.remote_path.clone(),
            size,
            chunk_size,
            expected_parts: plan.len() as u32,
        };

        *stage = FailureStage::Open;
        let sink = match item.destination.open(&manifest) {
            Ok(sink) => OpenSink::new(sink),
            Err(err) => {
                log::warn!("[{}] {}: {err:#}", self.id, item.remote_path);
                self.failures.record(Failure::from_report(
                    FailureStage::Open,
                    &item.remote_path,
                    &err,
                ));
                return;
            }
        };
        log::debug!(
            "[{}] {} ({} bytes) -> {} chunks into {}",
            self.id,
            item.remote_path,
            size,
            plan.len(),
            sink.sink().describe()
        );

        *stage = FailureStage::Chunk;
        let (outcome_tx, outcome_rx) = unbounded();
        for chunk in plan {
            chunks.put(ChunkJob {
                source: Arc::clone(&item.source),
                chunk,
                sink: Arc::clone(sink.sink()),
                outcomes: outcome_tx.clone(),
            });
        }
        drop(outcome_tx);

        while !chunks.join_timeout(JOIN_SLICE) {
            if self.cancel.is_cancelled() {
                // Queued chunks are abandoned; in-flight ones still acknowledge.
                chunks.drain();
                chunks.join();
                log::debug!("[{}] abandoned {} on shutdown", self.id, item.remote_path);
                return;
            }
        }

        *stage = FailureStage::Finalize;
        let parts = order_parts(
            outcome_rx
                .try_iter()
                .filter_map(|outcome| outcome.ok())
                .collect(),
        );
        let missing = missing_parts(&parts, manifest.expected_parts);
        if !missing.is_empty() {
            log::warn!(
                "[{}] {} finished with {} of {} parts; missing {:?}",
                self.id,
                item.remote_path,
                parts.len(),
                manifest.expected_parts,
                missing
            );
        }

        let finalize_error = match sink.sink().finalize(&parts) {
            Ok(()) => None,
            Err(err) => {
                log::warn!("[{}] finalize {}: {err:#}", self.id, item.remote_path);
                self.failures.record(Failure::from_report(
                    FailureStage::Finalize,
                    &item.remote_path,
                    &err,
                ));
                Some(format!("{err:#}"))
            }
        };

        let handle = Arc::clone(sink.sink());
        if let Err(err) = sink.close() {
            log::warn!("[{}] close {}: {err:#}", self.id, item.remote_path);
            self.failures.record(Failure::from_report(
                FailureStage::Finalize,
                &item.remote_path,
                &err,
            ));
        }

        if finalize_error.is_none() && missing.is_empty() {
            log::info!(
                "{} ({} bytes, {} parts) in {:.2?}",
                item.remote_path,
                size,
                parts.len(),
                started.elapsed()
            );
        }

        self.results.put(CompletedFile {
            remote_path: item.remote_path.clone(),
            size,
            expected_parts: manifest.expected_parts,
            parts,
            sink: handle,
            finalize_error,
        });
    }
}

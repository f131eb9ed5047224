//! Chunk workers: fetch one byte range over a fresh connection and hand it to
//! the file's sink.

use crossbeam_channel::Sender;
use eyre::{Result, WrapErr};
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use crate::destination::Sink;
use crate::errors::{catch_panic, ErrorCategory, Failure, FailureLog, FailureStage};
use crate::queue::{CancelToken, JoinableQueue};
use crate::source::{Connector, SourceParams};
use crate::transfer_plan::{Chunk, FinishedPart};

/// Result of one chunk, reported back to its coordinator.
pub type ChunkOutcome = std::result::Result<FinishedPart, Failure>;

/// One chunk queued by a coordinator.
pub struct ChunkJob {
    pub source: Arc<SourceParams>,
    pub chunk: Chunk,
    pub sink: Arc<dyn Sink>,
    pub outcomes: Sender<ChunkOutcome>,
}

pub struct ChunkWorker {
    pub id: String,
    pub queue: JoinableQueue<ChunkJob>,
    pub connector: Arc<dyn Connector>,
    pub cancel: CancelToken,
    pub failures: FailureLog,
    pub max_retries: u8,
}

impl ChunkWorker {
    /// Process chunks until cancelled or handed a stop sentinel.
    pub fn run(self) {
        log::debug!("[{}] started", self.id);
        while let Some(job) = self.queue.get(&self.cancel) {
            // Acknowledged after the outcome below has been sent.
            let _done = self.queue.guard();
            let outcome = self.process(&job);
            if let Err(failure) = &outcome {
                self.failures.record(failure.clone());
            }
            // The coordinator keeps the receiver until it has joined the queue.
            let _ = job.outcomes.send(outcome);
        }
        log::debug!("[{}] stopped", self.id);
    }

    fn process(&self, job: &ChunkJob) -> ChunkOutcome {
        let chunk = &job.chunk;
        let mut attempts = 0u8;
        loop {
            attempts = attempts.saturating_add(1);
            let result = catch_panic(|| {
                fetch_chunk(self.connector.as_ref(), &job.source, chunk, job.sink.as_ref())
            })
            .and_then(|inner| inner);

            match result {
                Ok(part) => {
                    log::debug!(
                        "[{}] {} part {} ({} bytes)",
                        self.id,
                        chunk.remote_path,
                        chunk.part_number,
                        chunk.len()
                    );
                    return Ok(part);
                }
                Err(err) => {
                    let failure =
                        Failure::from_report(FailureStage::Chunk, &chunk.remote_path, &err)
                            .with_part(chunk.part_number)
                            .with_attempts(attempts);
                    let retries_used = attempts - 1;
                    if failure.category == ErrorCategory::Retryable
                        && retries_used < self.max_retries
                        && !self.cancel.is_cancelled()
                    {
                        log::debug!(
                            "[{}] retrying {} part {} ({}/{}): {err:#}",
                            self.id,
                            chunk.remote_path,
                            chunk.part_number,
                            attempts,
                            self.max_retries
                        );
                        std::thread::sleep(Duration::from_millis(100 * attempts as u64));
                        continue;
                    }

                    if attempts > 1 {
                        log::warn!(
                            "[{}] {} part {} failed after {} attempts: {err:#}",
                            self.id,
                            chunk.remote_path,
                            chunk.part_number,
                            attempts
                        );
                    } else {
                        log::warn!(
                            "[{}] {} part {} failed: {err:#}",
                            self.id,
                            chunk.remote_path,
                            chunk.part_number
                        );
                    }
                    return Err(failure);
                }
            }
        }
    }
}

/// Fetch `chunk` over its own connection and `put` it into `sink`.
pub fn fetch_chunk(
    connector: &dyn Connector,
    params: &SourceParams,
    chunk: &Chunk,
    sink: &dyn Sink,
) -> Result<FinishedPart> {
    let mut source = connector
        .connect(params)
        .wrap_err("open chunk connection")?;
    let mut buf = vec![0u8; chunk.len() as usize];
    {
        let mut reader = source
            .open_read(&chunk.remote_path)
            .wrap_err_with(|| format!("open {}", chunk.remote_path))?;
        reader
            .seek(SeekFrom::Start(chunk.start))
            .wrap_err_with(|| format!("seek {} to {}", chunk.remote_path, chunk.start))?;
        reader.read_exact(&mut buf).wrap_err_with(|| {
            format!(
                "read {} bytes at {} of {}",
                chunk.len(),
                chunk.start,
                chunk.remote_path
            )
        })?;
    }
    let entity_tag = sink
        .put(chunk.part_number, &buf)
        .wrap_err_with(|| format!("put part {} into {}", chunk.part_number, sink.describe()))?;
    Ok(FinishedPart {
        part_number: chunk.part_number,
        entity_tag,
    })
}

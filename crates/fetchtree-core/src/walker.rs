use eyre::WrapErr;
use std::sync::Arc;

use crate::errors::{catch_panic, Failure, FailureLog, FailureStage};
use crate::queue::{CancelToken, JoinableQueue};
use crate::source::Connector;
use crate::work::WorkItem;

/// Lists one directory per walk item and fans its children out: directories
/// back onto the walk queue, files onto the download queue.
pub struct Walker {
    pub id: String,
    pub walks: JoinableQueue<WorkItem>,
    pub downloads: JoinableQueue<WorkItem>,
    pub connector: Arc<dyn Connector>,
    pub cancel: CancelToken,
    pub failures: FailureLog,
}

impl Walker {
    pub fn run(self) {
        log::debug!("[{}] started", self.id);
        while let Some(item) = self.walks.get(&self.cancel) {
            // Dropped after every child has been enqueued, so the walk
            // counter never reaches zero while children are still unseen.
            let _done = self.walks.guard();
            if let Err(err) = catch_panic(|| self.walk(&item)) {
                log::warn!("[{}] {}: {err:#}", self.id, item.remote_path);
                self.failures.record(Failure::from_report(
                    FailureStage::Listing,
                    &item.remote_path,
                    &err,
                ));
            }
        }
        log::debug!("[{}] stopped", self.id);
    }

    fn walk(&self, item: &WorkItem) {
        let mut source = match self
            .connector
            .connect(&item.source)
            .wrap_err("open listing connection")
        {
            Ok(source) => source,
            Err(err) => {
                log::warn!("[{}] {}: {err:#}", self.id, item.remote_path);
                self.failures.record(Failure::from_report(
                    FailureStage::Connect,
                    &item.remote_path,
                    &err,
                ));
                return;
            }
        };

        let entries = match source
            .list(&item.remote_path)
            .wrap_err_with(|| format!("list {}", item.remote_path))
        {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("[{}] {}: {err:#}", self.id, item.remote_path);
                self.failures.record(Failure::from_report(
                    FailureStage::Listing,
                    &item.remote_path,
                    &err,
                ));
                return;
            }
        };
        drop(source);

        let (mut dirs, mut files) = (0usize, 0usize);
        for entry in entries {
            let child = item.child(entry.path.clone());
            if entry.is_dir() {
                self.walks.put(child);
                dirs += 1;
            } else {
                self.downloads.put(child);
                files += 1;
            }
        }
        log::debug!(
            "[{}] {}: {} dirs, {} files",
            self.id,
            item.remote_path,
            dirs,
            files
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::MemoryDestination;
    use crate::source::{SchemeConnector, SourceParams};
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn outstanding_never_reaches_zero_before_every_file_is_acknowledged() {
        let temp = tempfile::tempdir().unwrap();
        let mut total = 0;
        for dir in ["a", "b", "c", "d"] {
            for idx in 0..25 {
                let path = temp.path().join(dir).join(format!("deep/f{idx}"));
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(path, b"x").unwrap();
                total += 1;
            }
        }
        for idx in 0..10 {
            fs::write(temp.path().join(format!("top{idx}")), b"x").unwrap();
            total += 1;
        }

        let walks = JoinableQueue::new("walk");
        let downloads = JoinableQueue::new("download");
        let cancel = CancelToken::new();
        let failures = FailureLog::new();
        walks.put(WorkItem::new(
            Arc::new(SourceParams::local(temp.path().to_string_lossy())),
            "/",
            Arc::new(MemoryDestination::new()),
        ));

        let walkers: Vec<_> = (0..3)
            .map(|idx| {
                let walker = Walker {
                    id: format!("walker-{idx}"),
                    walks: walks.clone(),
                    downloads: downloads.clone(),
                    connector: Arc::new(SchemeConnector),
                    cancel: cancel.clone(),
                    failures: failures.clone(),
                };
                thread::spawn(move || walker.run())
            })
            .collect();

        let acked = Arc::new(AtomicUsize::new(0));
        let consumer = {
            let downloads = downloads.clone();
            let cancel = cancel.clone();
            let acked = Arc::clone(&acked);
            thread::spawn(move || {
                while let Some(_item) = downloads.get(&cancel) {
                    let _done = downloads.guard();
                    acked.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        // Same read order as `wait_workers`: walk first, then download.
        let deadline = Instant::now() + Duration::from_secs(20);
        let seen_at_zero = loop {
            let walk = walks.outstanding();
            let download = downloads.outstanding();
            if walk == 0 && download == 0 {
                break acked.load(Ordering::SeqCst);
            }
            assert!(Instant::now() < deadline, "walk never finished");
        };

        cancel.cancel();
        for handle in walkers {
            handle.join().unwrap();
        }
        consumer.join().unwrap();

        assert!(failures.is_empty(), "{:?}", failures.snapshot());
        assert_eq!(seen_at_zero, total);
    }
}

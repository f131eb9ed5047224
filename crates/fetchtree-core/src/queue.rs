//! Joinable work queues shared by every worker role.
//!
//! A [`JoinableQueue`] is an unbounded MPMC FIFO paired with a counter of
//! outstanding items. The counter is bumped *before* an item becomes visible
//! to consumers and only drops when a consumer acknowledges the item with
//! [`JoinableQueue::task_done`] (usually through a [`TaskGuard`]). It reaches
//! zero exactly when every enqueued item has been dequeued and acknowledged,
//! which is what `join` waits for.
//!
//! Workers block in [`JoinableQueue::get`], which returns `None` once the
//! shared [`CancelToken`] fires or a stop sentinel is dequeued.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a blocked `get` sleeps before re-checking the cancel token.
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Shared shutdown flag observed at every queue-blocking point.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

enum Envelope<T> {
    Work(T),
    /// Poison pill: the worker that receives it exits its loop.
    Stop,
}

struct Pending {
    count: Mutex<usize>,
    drained: Condvar,
}

struct Inner<T> {
    name: &'static str,
    tx: Sender<Envelope<T>>,
    rx: Receiver<Envelope<T>>,
    pending: Pending,
}

/// Unbounded FIFO with an "all tasks done" signal.
pub struct JoinableQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for JoinableQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send> JoinableQueue<T> {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = unbounded();
        Self {
            inner: Arc::new(Inner {
                name,
                tx,
                rx,
                pending: Pending {
                    count: Mutex::new(0),
                    drained: Condvar::new(),
                },
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Enqueue an item. The outstanding counter includes it before any
    /// consumer can observe it.
    pub fn put(&self, item: T) {
        *self.inner.pending.count.lock() += 1;
        // The queue owns a receiver, so the channel can never be disconnected.
        let _ = self.inner.tx.send(Envelope::Work(item));
    }

    /// Block until an item is available. Returns `None` when `cancel` fires
    /// or a stop sentinel is received.
    pub fn get(&self, cancel: &CancelToken) -> Option<T> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match self.inner.rx.recv_timeout(CANCEL_POLL) {
                Ok(Envelope::Work(item)) => return Some(item),
                Ok(Envelope::Stop) => return None,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Non-blocking dequeue; stop sentinels are skipped.
    pub fn try_get(&self) -> Option<T> {
        while let Ok(envelope) = self.inner.rx.try_recv() {
            if let Envelope::Work(item) = envelope {
                return Some(item);
            }
        }
        None
    }

    /// Acknowledge one previously dequeued item.
    pub fn task_done(&self) {
        let mut count = self.inner.pending.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.pending.drained.notify_all();
        }
    }

    /// Guard that acknowledges one item when dropped, even during a panic.
    pub fn guard(&self) -> TaskGuard<'_, T> {
        TaskGuard { queue: self }
    }

    /// Items enqueued but not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        *self.inner.pending.count.lock()
    }

    /// Block until every enqueued item has been acknowledged.
    pub fn join(&self) {
        let mut count = self.inner.pending.count.lock();
        while *count > 0 {
            self.inner.pending.drained.wait(&mut count);
        }
    }

    /// Like [`join`](Self::join) but gives up after `timeout`.
    /// Returns `true` when the queue drained.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.inner.pending.count.lock();
        while *count > 0 {
            if self
                .inner
                .pending
                .drained
                .wait_until(&mut count, deadline)
                .timed_out()
            {
                return *count == 0;
            }
        }
        true
    }

    /// Enqueue `workers` stop sentinels. Sentinels are not counted.
    pub fn stop_workers(&self, workers: usize) {
        for _ in 0..workers {
            let _ = self.inner.tx.send(Envelope::Stop);
        }
    }

    /// Dequeue and acknowledge everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = self.try_get() {
            self.task_done();
            items.push(item);
        }
        items
    }
}

/// Acknowledges one queue item on drop.
pub struct TaskGuard<'a, T: Send> {
    queue: &'a JoinableQueue<T>,
}

impl<T: Send> Drop for TaskGuard<'_, T> {
    fn drop(&mut self) {
        self.queue.task_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn counter_tracks_put_and_task_done() {
        let q = JoinableQueue::new("test");
        q.put(1);
        q.put(2);
        assert_eq!(q.outstanding(), 2);

        let cancel = CancelToken::new();
        assert_eq!(q.get(&cancel), Some(1));
        // dequeued but not acknowledged
        assert_eq!(q.outstanding(), 2);
        q.task_done();
        assert_eq!(q.outstanding(), 1);
        assert!(!q.join_timeout(Duration::from_millis(20)));

        assert_eq!(q.get(&cancel), Some(2));
        q.task_done();
        assert!(q.join_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn fifo_order() {
        let q = JoinableQueue::new("test");
        for i in 0..5 {
            q.put(i);
        }
        let cancel = CancelToken::new();
        let got: Vec<_> = (0..5).map(|_| q.get(&cancel).unwrap()).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn guard_acknowledges_on_panic() {
        let q = JoinableQueue::new("test");
        q.put("boom");
        let worker_q = q.clone();
        let handle = thread::spawn(move || {
            let cancel = CancelToken::new();
            let _item = worker_q.get(&cancel).unwrap();
            let _guard = worker_q.guard();
            panic!("worker failed mid-item");
        });
        assert!(handle.join().is_err());
        assert_eq!(q.outstanding(), 0);
    }

    #[test]
    fn join_wakes_when_consumer_finishes() {
        let q = JoinableQueue::new("test");
        for i in 0..10 {
            q.put(i);
        }
        let worker_q = q.clone();
        let handle = thread::spawn(move || {
            let cancel = CancelToken::new();
            while let Some(_item) = worker_q.get(&cancel) {
                worker_q.task_done();
            }
        });
        q.join();
        assert_eq!(q.outstanding(), 0);
        q.stop_workers(1);
        handle.join().unwrap();
    }

    #[test]
    fn get_returns_none_after_cancel() {
        let q: JoinableQueue<u32> = JoinableQueue::new("test");
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let worker_q = q.clone();
        let handle = thread::spawn(move || worker_q.get(&worker_cancel));
        thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        assert_eq!(handle.join().unwrap(), None);
    }

    #[test]
    fn stop_sentinels_are_not_counted() {
        let q: JoinableQueue<u32> = JoinableQueue::new("test");
        q.stop_workers(3);
        assert_eq!(q.outstanding(), 0);
        assert_eq!(q.get(&CancelToken::new()), None);
    }

    #[test]
    fn drain_acknowledges_items() {
        let q = JoinableQueue::new("results");
        q.put("a");
        q.put("b");
        q.stop_workers(1);
        assert_eq!(q.drain(), vec!["a", "b"]);
        assert_eq!(q.outstanding(), 0);
    }
}

//! # hoard-work
//!
//! Generic thread-pool scheduling for Hoard.
//!
//! [`WorkManagerImpl`] runs closures on a fixed set of OS threads. Work is
//! queued on two `crossbeam-channel` queues; workers always drain the
//! high-priority queue before the normal one. A foreground thread can lend a
//! hand through [`WorkManager::do_work`] instead of idling, and
//! [`parallel_for`] splits a container across pool workers plus the caller.
//!
//! The pool has no error channel. A closure that panics is caught at the
//! worker boundary and logged; anything a closure needs to report has to go
//! through state it captured.

mod event;
mod parallel_for;

pub use event::Event;
pub use parallel_for::parallel_for;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use hoard_config::{log_work_debug, log_work_error};

/// A unit of work. Queued `count` times, the same closure runs `count` times.
pub type Work = Arc<dyn Fn() + Send + Sync>;

/// Observer notified around every work item execution.
pub trait WorkTracker: Send + Sync {
    /// Called before the item runs; the returned id is handed to `work_finished`.
    fn work_started(&self, description: &str) -> u32;
    fn work_finished(&self, id: u32);
}

/// Scheduling interface consumed by storage and network code.
pub trait WorkManager: Send + Sync {
    /// Queue `count` invocations of `work`. Never blocks.
    fn add_work(&self, work: Work, count: u32, description: &str, high_priority: bool);

    /// Configured parallelism of the pool.
    fn worker_count(&self) -> u32;

    /// Run up to `max_count` queued items on the calling thread.
    ///
    /// Returns the number of items executed.
    fn do_work(&self, max_count: u32) -> u32;
}

struct WorkItem {
    work: Work,
    description: Arc<str>,
}

#[derive(Clone)]
struct Queues {
    high: Receiver<WorkItem>,
    normal: Receiver<WorkItem>,
}

impl Queues {
    fn try_next(&self) -> Option<WorkItem> {
        self.high
            .try_recv()
            .ok()
            .or_else(|| self.normal.try_recv().ok())
    }

    /// Block until an item is available; `None` once both queues are closed and drained.
    fn next_blocking(&self) -> Option<WorkItem> {
        if let Some(item) = self.try_next() {
            return Some(item);
        }
        select! {
            recv(self.high) -> item => item.ok().or_else(|| self.normal.recv().ok()),
            recv(self.normal) -> item => item.ok().or_else(|| self.high.recv().ok()),
        }
    }

    fn len(&self) -> usize {
        self.high.len() + self.normal.len()
    }
}

/// OS thread pool implementing [`WorkManager`].
pub struct WorkManagerImpl {
    high_tx: Option<Sender<WorkItem>>,
    normal_tx: Option<Sender<WorkItem>>,
    queues: Queues,
    tracker: Option<Arc<dyn WorkTracker>>,
    workers: Vec<JoinHandle<()>>,
    worker_count: u32,
}

impl WorkManagerImpl {
    /// Create a pool with `worker_count` threads (0 = logical core count).
    pub fn new(worker_count: usize, name_prefix: &str) -> Self {
        Self::build(worker_count, name_prefix, None)
    }

    /// Create a pool whose items are reported to `tracker`.
    pub fn with_tracker(
        worker_count: usize,
        name_prefix: &str,
        tracker: Arc<dyn WorkTracker>,
    ) -> Self {
        Self::build(worker_count, name_prefix, Some(tracker))
    }

    fn build(worker_count: usize, name_prefix: &str, tracker: Option<Arc<dyn WorkTracker>>) -> Self {
        let worker_count = if worker_count == 0 {
            num_cpus::get()
        } else {
            worker_count
        };

        let (high_tx, high_rx) = unbounded();
        let (normal_tx, normal_rx) = unbounded();
        let queues = Queues {
            high: high_rx,
            normal: normal_rx,
        };

        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let queues = queues.clone();
            let tracker = tracker.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name_prefix, i))
                .spawn(move || worker_loop(queues, tracker));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    log_work_error!("Failed to create worker thread", index = i, error = e.to_string());
                }
            }
        }

        log_work_debug!("Work manager started", workers = workers.len());

        Self {
            high_tx: Some(high_tx),
            normal_tx: Some(normal_tx),
            queues,
            tracker,
            workers,
            worker_count: worker_count as u32,
        }
    }

    /// Number of items waiting in both queues.
    pub fn queued_count(&self) -> usize {
        self.queues.len()
    }
}

impl WorkManager for WorkManagerImpl {
    fn add_work(&self, work: Work, count: u32, description: &str, high_priority: bool) {
        let tx = if high_priority {
            &self.high_tx
        } else {
            &self.normal_tx
        };
        let Some(tx) = tx else {
            return;
        };
        let description: Arc<str> = Arc::from(description);
        for _ in 0..count {
            let item = WorkItem {
                work: Arc::clone(&work),
                description: Arc::clone(&description),
            };
            if tx.send(item).is_err() {
                log_work_error!("Work queue closed", description = &*description);
                return;
            }
        }
    }

    fn worker_count(&self) -> u32 {
        self.worker_count
    }

    fn do_work(&self, max_count: u32) -> u32 {
        let mut executed = 0;
        while executed < max_count {
            let Some(item) = self.queues.try_next() else {
                break;
            };
            run_item(self.tracker.as_deref(), item);
            executed += 1;
        }
        executed
    }
}

impl Drop for WorkManagerImpl {
    fn drop(&mut self) {
        // Closing the senders lets workers drain what is queued, then exit.
        self.high_tx.take();
        self.normal_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(queues: Queues, tracker: Option<Arc<dyn WorkTracker>>) {
    while let Some(item) = queues.next_blocking() {
        run_item(tracker.as_deref(), item);
    }
}

fn run_item(tracker: Option<&dyn WorkTracker>, item: WorkItem) {
    let id = tracker.map(|t| t.work_started(&item.description));
    if catch_unwind(AssertUnwindSafe(|| (item.work)())).is_err() {
        log_work_error!("Work item panicked", description = &*item.description);
    }
    if let (Some(tracker), Some(id)) = (tracker, id) {
        tracker.work_finished(id);
    }
}

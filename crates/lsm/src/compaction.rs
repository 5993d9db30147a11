//! Compaction scheduler: a task queue drained by worker threads.
//!
//! Tasks are produced on threshold crossings (memtable freeze, L0 file
//! count) and by manual trigger. Workers execute through a callback the
//! tree installs, so the scheduler itself knows nothing about levels or
//! manifests.
//!
//! # Shutdown
//!
//! `destroy` signals the stop flag, wakes every worker, and joins them.
//! Workers abandon whatever is still queued once the flag is up. The
//! caller must not hold any tree-level lock across `destroy`: the
//! workers it is joining take those locks themselves, and a join under
//! a held hold is the documented deadlock this design exists to avoid.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

/// Work item for the LSM background pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LsmTask {
    /// Flush the oldest frozen memtable into an L0 SSTable
    Flush,
    /// Run one compaction picked by the level manager
    Compact,
}

struct SchedulerShared {
    queue: Mutex<VecDeque<LsmTask>>,
    not_empty: Condvar,
    stop: AtomicBool,
}

/// Worker pool consuming [`LsmTask`]s.
pub struct CompactionScheduler {
    shared: Arc<SchedulerShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CompactionScheduler {
    /// Spawn `worker_count` threads executing tasks through `executor`.
    pub fn start<F>(worker_count: usize, executor: F) -> Self
    where
        F: Fn(LsmTask) + Send + Sync + 'static,
    {
        let shared = Arc::new(SchedulerShared {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            stop: AtomicBool::new(false),
        });
        let executor = Arc::new(executor);
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let shared = Arc::clone(&shared);
            let executor = Arc::clone(&executor);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("lsm-compact-{}", worker_id))
                    .spawn(move || loop {
                        let task = {
                            let mut queue = shared.queue.lock();
                            loop {
                                if shared.stop.load(Ordering::Acquire) {
                                    return;
                                }
                                if let Some(task) = queue.pop_front() {
                                    break task;
                                }
                                shared.not_empty.wait(&mut queue);
                            }
                        };
                        executor(task);
                    })
                    .expect("spawn compaction worker"),
            );
        }
        CompactionScheduler {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue a task; coalesces duplicates already waiting.
    pub fn schedule(&self, task: LsmTask) {
        if self.shared.stop.load(Ordering::Acquire) {
            return;
        }
        let mut queue = self.shared.queue.lock();
        if !queue.contains(&task) {
            queue.push_back(task);
        }
        drop(queue);
        self.shared.not_empty.notify_one();
    }

    /// Stop and join every worker, abandoning queued tasks.
    ///
    /// Idempotent. Must be called with no tree-level hold.
    pub fn destroy(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.not_empty.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
        let abandoned = self.shared.queue.lock().len();
        if abandoned > 0 {
            debug!(target: "concord::lsm", abandoned, "abandoned queued compaction tasks");
        }
    }
}

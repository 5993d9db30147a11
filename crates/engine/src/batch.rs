//! Async batch I/O.
//!
//! A [`BatchManager`] owns a bounded pool of batch contexts and a
//! worker pool. Callers fill a context with PUT/GET/DELETE ops, submit
//! it, and either block on [`BatchHandle::wait`] or rely on callbacks:
//! per-op callbacks fire in enqueue order as ops retire, then the
//! completion callback fires once.
//!
//! ```text
//! Pending --submit--> Submitted --worker--> Completed
//!     \                   \
//!      \--cancel--> Cancelled <--cancel (before execution)
//! ```
//!
//! A batch is not a transaction: its effects observe the engine's own
//! visibility rules, and a failed op does not undo its predecessors;
//! each op carries its own result.

use concord_core::config::BatchConfig;
use concord_core::engine::KvEngine;
use concord_core::error::{Error, ErrorKind, Result};
use concord_core::types::{Key, Value};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

/// Kind of a batched operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOpKind {
    /// Insert or replace
    Put,
    /// Read into the result slot
    Get,
    /// Remove
    Delete,
}

/// Lifecycle state of a batch context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Accepting ops
    Pending,
    /// Queued for a worker
    Submitted,
    /// Every op retired
    Completed,
    /// Cancelled before execution
    Cancelled,
}

impl BatchStatus {
    fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Cancelled)
    }
}

/// Outcome of one batched op.
#[derive(Debug, Clone)]
pub struct BatchOpResult {
    /// What ran
    pub kind: BatchOpKind,
    /// Target key
    pub key: Key,
    /// Fetched value (GET only, on success)
    pub value: Option<Value>,
    /// Failure kind, `None` on success
    pub error: Option<ErrorKind>,
}

/// Per-op callback, fired as the op retires.
pub type OpCallback = Box<dyn FnOnce(&BatchOpResult) + Send>;

/// Whole-batch callback, fired once at Completed or Cancelled.
pub type CompletionCallback = Box<dyn FnOnce(BatchStatus, &[BatchOpResult]) + Send>;

struct BatchOp {
    kind: BatchOpKind,
    key: Key,
    value: Option<Value>,
    callback: Option<OpCallback>,
}

struct BatchState {
    status: BatchStatus,
    ops: Vec<BatchOp>,
    results: Vec<BatchOpResult>,
    completion: Option<CompletionCallback>,
    /// Pool slot already returned
    released: bool,
}

struct BatchInner {
    max_ops: usize,
    state: Mutex<BatchState>,
    done: Condvar,
}

struct ManagerInner {
    engine: Arc<dyn KvEngine>,
    queue: Mutex<VecDeque<Arc<BatchInner>>>,
    not_empty: Condvar,
    live: AtomicUsize,
    stop: AtomicBool,
}

impl ManagerInner {
    /// Return a pool slot exactly once per batch.
    fn release_slot(&self, state: &mut BatchState) {
        if !state.released {
            state.released = true;
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn execute(&self, batch: &Arc<BatchInner>) {
        let ops = {
            let mut state = batch.state.lock();
            if state.status != BatchStatus::Submitted {
                // Cancelled between submit and pickup.
                self.finish(batch, &mut state);
                return;
            }
            std::mem::take(&mut state.ops)
        };

        // Ops retire strictly in enqueue order; callbacks fire as each
        // one lands.
        let mut results = Vec::with_capacity(ops.len());
        for mut op in ops {
            let result = self.run_op(&mut op);
            if let Some(callback) = op.callback.take() {
                callback(&result);
            }
            results.push(result);
        }

        let mut state = batch.state.lock();
        state.results = results;
        if state.status == BatchStatus::Submitted {
            state.status = BatchStatus::Completed;
        }
        self.finish(batch, &mut state);
    }

    fn run_op(&self, op: &mut BatchOp) -> BatchOpResult {
        let outcome = match op.kind {
            BatchOpKind::Put => {
                let value = op.value.take().unwrap_or_default();
                self.engine
                    .put(op.key.as_bytes(), value.as_bytes())
                    .map(|_| None)
            }
            BatchOpKind::Get => self.engine.get(op.key.as_bytes()).map(Some),
            BatchOpKind::Delete => self.engine.delete(op.key.as_bytes()).map(|_| None),
        };
        match outcome {
            Ok(value) => BatchOpResult {
                kind: op.kind,
                key: op.key.clone(),
                value,
                error: None,
            },
            Err(e) => BatchOpResult {
                kind: op.kind,
                key: op.key.clone(),
                value: None,
                error: Some(e.kind()),
            },
        }
    }

    fn finish(&self, batch: &BatchInner, state: &mut BatchState) {
        if let Some(callback) = state.completion.take() {
            callback(state.status, &state.results);
        }
        self.release_slot(state);
        batch.done.notify_all();
    }
}

/// Handle to one batch context.
pub struct BatchHandle {
    inner: Arc<BatchInner>,
    manager: Arc<ManagerInner>,
}

impl BatchHandle {
    fn append(
        &self,
        kind: BatchOpKind,
        key: &[u8],
        value: Option<&[u8]>,
        callback: Option<OpCallback>,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.status != BatchStatus::Pending {
            return Err(Error::InvalidState(format!(
                "batch no longer accepts ops in {:?}",
                state.status
            )));
        }
        if state.ops.len() >= self.inner.max_ops {
            return Err(Error::BatchFull {
                max: self.inner.max_ops,
            });
        }
        state.ops.push(BatchOp {
            kind,
            key: Key::from(key),
            value: value.map(Value::from),
            callback,
        });
        Ok(())
    }

    /// Queue a PUT.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.append(BatchOpKind::Put, key, Some(value), None)
    }

    /// Queue a PUT with a per-op callback.
    pub fn put_with(&self, key: &[u8], value: &[u8], callback: OpCallback) -> Result<()> {
        self.append(BatchOpKind::Put, key, Some(value), Some(callback))
    }

    /// Queue a GET; the value arrives in the result slot and callback.
    pub fn get(&self, key: &[u8]) -> Result<()> {
        self.append(BatchOpKind::Get, key, None, None)
    }

    /// Queue a GET with a per-op callback.
    pub fn get_with(&self, key: &[u8], callback: OpCallback) -> Result<()> {
        self.append(BatchOpKind::Get, key, None, Some(callback))
    }

    /// Queue a DELETE.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.append(BatchOpKind::Delete, key, None, None)
    }

    /// Queue a DELETE with a per-op callback.
    pub fn delete_with(&self, key: &[u8], callback: OpCallback) -> Result<()> {
        self.append(BatchOpKind::Delete, key, None, Some(callback))
    }

    /// Ops queued so far.
    pub fn len(&self) -> usize {
        self.inner.state.lock().ops.len()
    }

    /// Whether no ops are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current lifecycle state.
    pub fn status(&self) -> BatchStatus {
        self.inner.state.lock().status
    }

    /// Submit for execution. `InvalidState` after submit or cancel.
    pub fn submit(&self, completion: Option<CompletionCallback>) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.status != BatchStatus::Pending {
                return Err(Error::InvalidState(format!(
                    "batch cannot be submitted from {:?}",
                    state.status
                )));
            }
            state.status = BatchStatus::Submitted;
            state.completion = completion;
        }
        self.manager.queue.lock().push_back(Arc::clone(&self.inner));
        self.manager.not_empty.notify_one();
        Ok(())
    }

    /// Block until the batch is terminal, up to `timeout`.
    pub fn wait(&self, timeout: Duration) -> Result<BatchStatus> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if state.status.is_terminal() {
                return Ok(state.status);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout("batch wait".into()));
            }
            self.inner.done.wait_for(&mut state, deadline - now);
        }
    }

    /// Cancel. Valid from Pending or Submitted; a batch a worker
    /// already started retires normally.
    pub fn cancel(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        match state.status {
            BatchStatus::Pending => {
                state.status = BatchStatus::Cancelled;
                self.manager.finish(&self.inner, &mut state);
                Ok(())
            }
            BatchStatus::Submitted => {
                state.status = BatchStatus::Cancelled;
                // The worker observes the state when it pops the batch.
                Ok(())
            }
            status => Err(Error::InvalidState(format!(
                "batch cannot be cancelled from {:?}",
                status
            ))),
        }
    }

    /// Per-op results; empty until the batch completes.
    pub fn results(&self) -> Vec<BatchOpResult> {
        self.inner.state.lock().results.clone()
    }
}

impl Drop for BatchHandle {
    fn drop(&mut self) {
        // An abandoned Pending batch returns its pool slot.
        let mut state = self.inner.state.lock();
        if state.status == BatchStatus::Pending {
            state.status = BatchStatus::Cancelled;
            self.manager.finish(&self.inner, &mut state);
        }
    }
}

/// Owns the context pool and the worker pool.
pub struct BatchManager {
    inner: Arc<ManagerInner>,
    config: BatchConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BatchManager {
    /// Start a manager over `engine` with `config.workers` threads.
    pub fn new(engine: Arc<dyn KvEngine>, config: BatchConfig) -> Result<Self> {
        if config.max_batch_size == 0 || config.max_concurrent_batches == 0 || config.workers == 0 {
            return Err(Error::InvalidArg(
                "batch config needs positive sizes and workers".into(),
            ));
        }
        let inner = Arc::new(ManagerInner {
            engine,
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            live: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
        });
        let mut workers = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let inner = Arc::clone(&inner);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("batch-worker-{}", worker_id))
                    .spawn(move || loop {
                        let batch = {
                            let mut queue = inner.queue.lock();
                            loop {
                                if inner.stop.load(Ordering::Acquire) {
                                    return;
                                }
                                if let Some(batch) = queue.pop_front() {
                                    break batch;
                                }
                                inner.not_empty.wait(&mut queue);
                            }
                        };
                        inner.execute(&batch);
                    })
                    .expect("spawn batch worker"),
            );
        }
        Ok(BatchManager {
            inner,
            config,
            workers: Mutex::new(workers),
        })
    }

    /// Allocate a batch context. `QueueFull` when the pool is at
    /// `max_concurrent_batches`.
    pub fn create_batch(&self) -> Result<BatchHandle> {
        let mut live = self.inner.live.load(Ordering::Acquire);
        loop {
            if live >= self.config.max_concurrent_batches {
                return Err(Error::QueueFull);
            }
            match self.inner.live.compare_exchange(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => live = current,
            }
        }
        Ok(BatchHandle {
            inner: Arc::new(BatchInner {
                max_ops: self.config.max_batch_size,
                state: Mutex::new(BatchState {
                    status: BatchStatus::Pending,
                    ops: Vec::new(),
                    results: Vec::new(),
                    completion: None,
                    released: false,
                }),
                done: Condvar::new(),
            }),
            manager: Arc::clone(&self.inner),
        })
    }

    /// Default wait timeout from config.
    pub fn default_timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Batches currently holding pool slots.
    pub fn live_batches(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Stop and join the worker pool. Queued batches are abandoned in
    /// whatever state they reached.
    pub fn shutdown(&self) {
        if self.inner.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.not_empty.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
        debug!(target: "concord::batch", "batch manager shut down");
    }
}

impl Drop for BatchManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

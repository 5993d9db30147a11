//! Bounded priority queue for the distributed coordinator.
//!
//! Ordering is priority descending with FIFO among equals, implemented
//! by a binary heap keyed on `(priority, Reverse(enqueue stamp))`. All
//! operations go through one mutex with two condition variables, one
//! for not-full and one for not-empty, so producers and consumers wake
//! each other without thundering.
//!
//! A full queue blocks `enqueue` for about a second before giving up
//! with `QueueFull`; `dequeue` takes a caller-supplied timeout and
//! reports `Timeout` on expiry. `close` signals both condvars so
//! blocked threads drain out during coordinator shutdown.

use concord_core::error::{Error, Result};
use concord_core::types::TxnPriority;
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Fallback capacity when the configured one is non-positive.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// How long a full queue blocks an enqueue before `QueueFull`.
const ENQUEUE_PATIENCE: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct QueueNode<T> {
    priority: TxnPriority,
    stamp: u64,
    item: T,
}

impl<T> PartialEq for QueueNode<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.stamp == other.stamp
    }
}
impl<T> Eq for QueueNode<T> {}
impl<T> PartialOrd for QueueNode<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for QueueNode<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then the *older* stamp.
        (self.priority, Reverse(self.stamp)).cmp(&(other.priority, Reverse(other.stamp)))
    }
}

struct QueueInner<T> {
    heap: BinaryHeap<QueueNode<T>>,
    next_stamp: u64,
    closed: bool,
}

/// Bounded, thread-safe priority queue.
pub struct PriorityQueue<T> {
    inner: Mutex<QueueInner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> PriorityQueue<T> {
    /// Create with `capacity` slots; zero falls back to the default
    /// rather than refusing to work.
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_QUEUE_CAPACITY
        } else {
            capacity
        };
        PriorityQueue {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::with_capacity(capacity),
                next_stamp: 0,
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current length; never exceeds capacity.
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue with a priority. Blocks while full, up to about one
    /// second, then reports `QueueFull`.
    pub fn enqueue(&self, item: T, priority: TxnPriority) -> Result<()> {
        let deadline = Instant::now() + ENQUEUE_PATIENCE;
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(Error::InvalidState("queue is closed".into()));
            }
            if inner.heap.len() < self.capacity {
                let stamp = inner.next_stamp;
                inner.next_stamp += 1;
                inner.heap.push(QueueNode {
                    priority,
                    stamp,
                    item,
                });
                drop(inner);
                self.not_empty.notify_one();
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::QueueFull);
            }
            self.not_full.wait_for(&mut inner, deadline - now);
        }
    }

    /// Dequeue the highest-priority item, blocking up to `timeout`.
    pub fn dequeue(&self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(node) = inner.heap.pop() {
                drop(inner);
                self.not_full.notify_one();
                return Ok(node.item);
            }
            if inner.closed {
                return Err(Error::InvalidState("queue is closed".into()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout("priority queue dequeue".into()));
            }
            self.not_empty.wait_for(&mut inner, deadline - now);
        }
    }

    /// Close the queue: wake every blocked thread so shutdown can join
    /// them. Items already queued still drain via `dequeue`.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }
}

//! Distributed transaction coordinator: two-phase commit.
//!
//! # State machine
//!
//! ```text
//! Preparing --all Prepared--> Prepared --Commit--> Committed
//!     |                          |
//!     |--any NAK/timeout--> Aborting --Abort sent--> Aborted
//! ```
//!
//! The coordinator commits only when every participant acknowledged
//! Prepared. On commit it applies the local transaction first, then
//! dispatches `Commit` to every participant; the distributed txn is
//! Committed after local commit and dispatch; participant ACKs feed
//! `committed_count` for observability but do not gate the transition.
//!
//! # Threads
//!
//! Exactly three per coordinator:
//!
//! - **scheduler** drains the priority queue and drives each txn
//! - **heartbeat** pings registered nodes, refreshing last-seen stamps
//! - **timeout checker** scans every second and moves expired
//!   non-terminal txns to Aborting, re-enqueueing them
//!
//! Shutdown is cooperative: drop the running flag, close the queue
//! (waking both condvars), join all three threads, then drop the queue.
//! No thread is joined while any coordinator hold is held.
//!
//! # Ownership
//!
//! The coordinator owns every distributed-transaction object. The
//! public API hands out `Arc` views for observation; the registry holds
//! them until coordinator destruction, so callers never free one
//! themselves.
//!
//! # Transport
//!
//! No sockets here. Message delivery goes through a registered callback
//! `(node, message) -> reply`; its latency is the participant's
//! apparent round-trip time.

use crate::queue::PriorityQueue;
use crate::transaction::Transaction;
use concord_core::config::{DistConfig, SchedulePolicy};
use concord_core::error::{Error, Result};
use concord_core::types::TxnPriority;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Participant / node address. Routing meaning belongs to the transport.
pub type NodeId = String;

/// Messages the coordinator sends through the transport callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Phase one: vote request with the remaining deadline budget.
    Prepare {
        /// Global transaction id
        txn_id: Uuid,
        /// Milliseconds until the coordinator gives up
        deadline_ms: u64,
    },
    /// Phase two, success branch.
    Commit {
        /// Global transaction id
        txn_id: Uuid,
    },
    /// Phase two, failure branch.
    Abort {
        /// Global transaction id
        txn_id: Uuid,
    },
    /// Liveness probe for registered nodes.
    Heartbeat,
}

/// Participant replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Vote yes: the participant can commit
    Prepared,
    /// Vote no: the participant cannot commit
    Aborted,
    /// Acknowledgement of Commit/Abort/Heartbeat
    Ack,
}

/// Transport callback: `(node, message) -> reply`.
pub type Transport = dyn Fn(&NodeId, &Message) -> Result<Reply> + Send + Sync;

/// Distributed transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistTxnStatus {
    /// Phase one in progress
    Preparing,
    /// Every participant voted yes
    Prepared,
    /// Abort decided, notifications in flight
    Aborting,
    /// Terminal: effects applied
    Committed,
    /// Terminal: effects discarded
    Aborted,
}

impl DistTxnStatus {
    /// Whether this state accepts no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, DistTxnStatus::Committed | DistTxnStatus::Aborted)
    }
}

/// A distributed transaction. Owned by the coordinator; handed out as
/// `Arc` views only.
pub struct DistributedTxn {
    global_id: Uuid,
    coordinator_id: NodeId,
    priority: TxnPriority,
    deadline: Instant,
    participants: Vec<NodeId>,
    status: RwLock<DistTxnStatus>,
    prepared_count: AtomicUsize,
    committed_count: AtomicUsize,
    /// Local share of the work, committed before Commit dispatch.
    local: Mutex<Option<Transaction>>,
    /// Serializes drivers (scheduler vs. synchronous execute).
    driving: Mutex<()>,
}

impl DistributedTxn {
    /// Global transaction id.
    pub fn global_id(&self) -> Uuid {
        self.global_id
    }

    /// Coordinator that owns this transaction.
    pub fn coordinator_id(&self) -> &NodeId {
        &self.coordinator_id
    }

    /// Scheduling priority.
    pub fn priority(&self) -> TxnPriority {
        self.priority
    }

    /// Current state.
    pub fn status(&self) -> DistTxnStatus {
        *self.status.read()
    }

    /// Participants registered at begin.
    pub fn participants(&self) -> &[NodeId] {
        &self.participants
    }

    /// Participants that voted Prepared.
    pub fn prepared_count(&self) -> usize {
        self.prepared_count.load(Ordering::Relaxed)
    }

    /// Participants that ACKed Commit. May lag `participants().len()`
    /// on ACK loss; the txn stays Committed regardless.
    pub fn committed_count(&self) -> usize {
        self.committed_count.load(Ordering::Relaxed)
    }
}

/// Coordinator lifecycle counters.
///
/// Relaxed atomics throughout: these are observational metrics that
/// synchronize nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Distributed txns begun
    pub started: u64,
    /// Reached Committed
    pub committed: u64,
    /// Reached Aborted
    pub aborted: u64,
    /// Moved to Aborting by the timeout checker
    pub timeouts: u64,
    /// Heartbeat rounds completed
    pub heartbeats: u64,
}

struct CoordinatorInner {
    id: NodeId,
    transport: RwLock<Option<Arc<Transport>>>,
    queue: PriorityQueue<Uuid>,
    txns: DashMap<Uuid, Arc<DistributedTxn>>,
    nodes: DashMap<NodeId, Instant>,
    policy: RwLock<SchedulePolicy>,
    running: AtomicBool,
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    timeouts: AtomicU64,
    heartbeats: AtomicU64,
}

/// Two-phase-commit coordinator with three background threads.
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Start a coordinator and its three background threads.
    pub fn new(id: impl Into<NodeId>, config: DistConfig) -> Self {
        let inner = Arc::new(CoordinatorInner {
            id: id.into(),
            transport: RwLock::new(None),
            queue: PriorityQueue::new(config.priority_queue_capacity),
            txns: DashMap::new(),
            nodes: DashMap::new(),
            policy: RwLock::new(config.schedule_policy),
            running: AtomicBool::new(true),
            started: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
        });

        let mut threads = Vec::with_capacity(3);

        let scheduler = Arc::clone(&inner);
        threads.push(
            std::thread::Builder::new()
                .name("dist-scheduler".into())
                .spawn(move || {
                    while scheduler.running.load(Ordering::Acquire) {
                        match scheduler.queue.dequeue(Duration::from_millis(200)) {
                            Ok(id) => scheduler.drive(id),
                            Err(Error::Timeout(_)) => continue,
                            Err(_) => break,
                        }
                    }
                })
                .expect("spawn dist-scheduler"),
        );

        let heartbeat = Arc::clone(&inner);
        let heartbeat_interval = config.heartbeat_interval;
        threads.push(
            std::thread::Builder::new()
                .name("dist-heartbeat".into())
                .spawn(move || {
                    while sleep_while_running(&heartbeat.running, heartbeat_interval) {
                        heartbeat.heartbeat_round();
                    }
                })
                .expect("spawn dist-heartbeat"),
        );

        let checker = Arc::clone(&inner);
        let check_interval = config.timeout_check_interval;
        threads.push(
            std::thread::Builder::new()
                .name("dist-timeout".into())
                .spawn(move || {
                    while sleep_while_running(&checker.running, check_interval) {
                        checker.expire_overdue();
                    }
                })
                .expect("spawn dist-timeout"),
        );

        Coordinator {
            inner,
            threads: Mutex::new(threads),
        }
    }

    /// Install the message-delivery callback.
    pub fn register_transport<F>(&self, transport: F)
    where
        F: Fn(&NodeId, &Message) -> Result<Reply> + Send + Sync + 'static,
    {
        *self.inner.transport.write() = Some(Arc::new(transport));
    }

    /// Register a node for heartbeating.
    pub fn register_node(&self, node: impl Into<NodeId>) {
        self.inner.nodes.insert(node.into(), Instant::now());
    }

    /// Last heartbeat acknowledgement from a node, if any.
    pub fn last_seen(&self, node: &str) -> Option<Instant> {
        self.inner.nodes.get(node).map(|seen| *seen.value())
    }

    /// Switch the schedule policy. Idempotent and thread-safe.
    pub fn set_schedule_policy(&self, policy: SchedulePolicy) {
        *self.inner.policy.write() = policy;
    }

    /// Begin a distributed transaction and enqueue it for the
    /// scheduler. Returns the global id; the coordinator keeps
    /// ownership of the transaction object.
    pub fn begin(
        &self,
        priority: TxnPriority,
        timeout: Duration,
        participants: Vec<NodeId>,
        local: Option<Transaction>,
    ) -> Result<Uuid> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(Error::InvalidState("coordinator is shut down".into()));
        }
        if participants.is_empty() {
            return Err(Error::InvalidArg(
                "a distributed transaction needs at least one participant".into(),
            ));
        }
        let txn = Arc::new(DistributedTxn {
            global_id: Uuid::new_v4(),
            coordinator_id: self.inner.id.clone(),
            priority,
            deadline: Instant::now() + timeout,
            participants,
            status: RwLock::new(DistTxnStatus::Preparing),
            prepared_count: AtomicUsize::new(0),
            committed_count: AtomicUsize::new(0),
            local: Mutex::new(local),
            driving: Mutex::new(()),
        });
        let id = txn.global_id;
        self.inner.txns.insert(id, Arc::clone(&txn));
        self.inner.started.fetch_add(1, Ordering::Relaxed);

        let queue_priority = match *self.inner.policy.read() {
            SchedulePolicy::Priority => priority,
            // FIFO flattens priorities; arrival stamps alone decide.
            SchedulePolicy::Fifo => TxnPriority::Normal,
        };
        self.inner.queue.enqueue(id, queue_priority)?;
        debug!(target: "concord::dist", %id, ?priority, "distributed txn begun");
        Ok(id)
    }

    /// Drive a transaction to a terminal state synchronously.
    ///
    /// `PrepareFailed` when any participant voted no or errored;
    /// `Timeout` when the deadline expired first. The state machine is
    /// identical to the scheduler's; whichever gets there first wins,
    /// the other observes the terminal state.
    pub fn execute(&self, id: Uuid) -> Result<DistTxnStatus> {
        let deadline = {
            let txn = self
                .txn(id)
                .ok_or_else(|| Error::InvalidArg(format!("unknown distributed txn {}", id)))?;
            txn.deadline
        };
        loop {
            self.inner.drive(id);
            let Some(txn) = self.txn(id) else {
                return Err(Error::InvalidArg(format!("unknown distributed txn {}", id)));
            };
            let status = txn.status();
            if status.is_terminal() {
                return match status {
                    DistTxnStatus::Committed => Ok(status),
                    _ if txn.prepared_count() < txn.participants().len() => Err(
                        Error::PrepareFailed(format!("txn {} aborted during prepare", id)),
                    ),
                    _ => Ok(status),
                };
            }
            if Instant::now() > deadline {
                return Err(Error::Timeout(format!("distributed txn {}", id)));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Borrowed view of a transaction. The coordinator keeps ownership.
    pub fn txn(&self, id: Uuid) -> Option<Arc<DistributedTxn>> {
        self.inner.txns.get(&id).map(|t| Arc::clone(t.value()))
    }

    /// Current status of a transaction.
    pub fn txn_status(&self, id: Uuid) -> Option<DistTxnStatus> {
        self.txn(id).map(|t| t.status())
    }

    /// Block until a transaction is terminal or `timeout` passes.
    pub fn wait_for_terminal(&self, id: Uuid, timeout: Duration) -> Result<DistTxnStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.txn_status(id) {
                Some(status) if status.is_terminal() => return Ok(status),
                Some(_) => {}
                None => {
                    return Err(Error::InvalidArg(format!("unknown distributed txn {}", id)))
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!("waiting on distributed txn {}", id)));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Lifecycle counters.
    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            started: self.inner.started.load(Ordering::Relaxed),
            committed: self.inner.committed.load(Ordering::Relaxed),
            aborted: self.inner.aborted.load(Ordering::Relaxed),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
            heartbeats: self.inner.heartbeats.load(Ordering::Relaxed),
        }
    }

    /// Cooperative shutdown: running flag down, both condvars
    /// signalled via queue close, all three threads joined, queue
    /// dropped with the coordinator. Idempotent; joins happen with no
    /// coordinator hold held.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.queue.close();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
        info!(target: "concord::dist", id = %self.inner.id, "coordinator shut down");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        // The coordinator owns every live distributed txn; the registry
        // drops with it, which is exactly why callers only ever hold
        // borrowed Arc views.
        self.shutdown();
    }
}

/// Sleep `interval` in small slices, returning false once `running`
/// drops so background loops exit promptly.
fn sleep_while_running(running: &AtomicBool, interval: Duration) -> bool {
    let deadline = Instant::now() + interval;
    while Instant::now() < deadline {
        if !running.load(Ordering::Acquire) {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20).min(interval));
    }
    running.load(Ordering::Acquire)
}

impl CoordinatorInner {
    fn transport(&self) -> Option<Arc<Transport>> {
        self.transport.read().clone()
    }

    /// Drive one transaction as far as it can go right now.
    fn drive(&self, id: Uuid) {
        let Some(txn) = self.txns.get(&id).map(|t| Arc::clone(t.value())) else {
            return;
        };
        // One driver at a time; a second driver re-reads the status
        // after the first finishes and sees a terminal state.
        let _driving = txn.driving.lock();
        loop {
            let status = txn.status();
            match status {
                DistTxnStatus::Preparing => self.run_prepare(&txn),
                DistTxnStatus::Prepared => self.run_commit(&txn),
                DistTxnStatus::Aborting => self.run_abort(&txn),
                DistTxnStatus::Committed | DistTxnStatus::Aborted => return,
            }
        }
    }

    fn run_prepare(&self, txn: &Arc<DistributedTxn>) {
        let Some(transport) = self.transport() else {
            warn!(target: "concord::dist", id = %txn.global_id, "no transport registered, aborting");
            *txn.status.write() = DistTxnStatus::Aborting;
            return;
        };
        for node in &txn.participants {
            let now = Instant::now();
            if now > txn.deadline {
                debug!(target: "concord::dist", id = %txn.global_id, "deadline hit during prepare");
                *txn.status.write() = DistTxnStatus::Aborting;
                return;
            }
            let message = Message::Prepare {
                txn_id: txn.global_id,
                deadline_ms: (txn.deadline - now).as_millis() as u64,
            };
            match transport(node, &message) {
                Ok(Reply::Prepared) => {
                    txn.prepared_count.fetch_add(1, Ordering::Relaxed);
                }
                Ok(_) | Err(_) => {
                    debug!(target: "concord::dist", id = %txn.global_id, node = %node, "participant refused prepare");
                    *txn.status.write() = DistTxnStatus::Aborting;
                    return;
                }
            }
            // A reply that arrived after the deadline counts as silence.
            if Instant::now() > txn.deadline {
                *txn.status.write() = DistTxnStatus::Aborting;
                return;
            }
        }
        *txn.status.write() = DistTxnStatus::Prepared;
    }

    fn run_commit(&self, txn: &Arc<DistributedTxn>) {
        // Local commit comes first; a local failure aborts everyone.
        if let Some(mut local) = txn.local.lock().take() {
            if let Err(e) = local.commit() {
                warn!(target: "concord::dist", id = %txn.global_id, error = %e, "local commit failed");
                *txn.status.write() = DistTxnStatus::Aborting;
                return;
            }
        }
        if let Some(transport) = self.transport() {
            let message = Message::Commit {
                txn_id: txn.global_id,
            };
            for node in &txn.participants {
                match transport(node, &message) {
                    Ok(Reply::Ack) => {
                        txn.committed_count.fetch_add(1, Ordering::Relaxed);
                    }
                    // Lost ACKs leave committed_count short; the txn is
                    // Committed regardless once dispatch completed.
                    Ok(_) | Err(_) => {}
                }
            }
        }
        *txn.status.write() = DistTxnStatus::Committed;
        self.committed.fetch_add(1, Ordering::Relaxed);
        debug!(target: "concord::dist", id = %txn.global_id, acks = txn.committed_count(), "distributed txn committed");
    }

    fn run_abort(&self, txn: &Arc<DistributedTxn>) {
        if let Some(mut local) = txn.local.lock().take() {
            let _ = local.rollback();
        }
        if let Some(transport) = self.transport() {
            let message = Message::Abort {
                txn_id: txn.global_id,
            };
            for node in &txn.participants {
                let _ = transport(node, &message);
            }
        }
        *txn.status.write() = DistTxnStatus::Aborted;
        self.aborted.fetch_add(1, Ordering::Relaxed);
        debug!(target: "concord::dist", id = %txn.global_id, "distributed txn aborted");
    }

    fn heartbeat_round(&self) {
        let Some(transport) = self.transport() else {
            return;
        };
        let nodes: Vec<NodeId> = self.nodes.iter().map(|e| e.key().clone()).collect();
        for node in nodes {
            if transport(&node, &Message::Heartbeat).is_ok() {
                if let Some(mut seen) = self.nodes.get_mut(&node) {
                    *seen = Instant::now();
                }
            }
        }
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    /// Move every overdue non-terminal txn to Aborting and requeue it.
    fn expire_overdue(&self) {
        let now = Instant::now();
        let overdue: Vec<Arc<DistributedTxn>> = self
            .txns
            .iter()
            .filter(|t| !t.status().is_terminal() && now > t.deadline)
            .map(|t| Arc::clone(t.value()))
            .collect();
        for txn in overdue {
            {
                let mut status = txn.status.write();
                if status.is_terminal() {
                    continue;
                }
                *status = DistTxnStatus::Aborting;
            }
            self.timeouts.fetch_add(1, Ordering::Relaxed);
            debug!(target: "concord::dist", id = %txn.global_id, "txn expired, scheduling abort");
            // A full queue just means the next scan retries.
            let _ = self.queue.enqueue(txn.global_id, txn.priority);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn coordinator() -> Coordinator {
        Coordinator::new("coord-1", DistConfig::default())
    }

    fn nodes(n: usize) -> Vec<NodeId> {
        (1..=n).map(|i| format!("node-{}", i)).collect()
    }

    /// Transport where every participant cooperates.
    fn all_yes() -> impl Fn(&NodeId, &Message) -> Result<Reply> + Send + Sync {
        |_node, message| match message {
            Message::Prepare { .. } => Ok(Reply::Prepared),
            _ => Ok(Reply::Ack),
        }
    }

    #[test]
    fn test_two_phase_commit_success() {
        let coord = coordinator();
        coord.register_transport(all_yes());

        let id = coord
            .begin(TxnPriority::Normal, Duration::from_secs(5), nodes(3), None)
            .unwrap();
        let status = coord.wait_for_terminal(id, Duration::from_secs(3)).unwrap();
        assert_eq!(status, DistTxnStatus::Committed);

        let txn = coord.txn(id).unwrap();
        assert_eq!(txn.prepared_count(), 3);
        assert_eq!(txn.committed_count(), 3);
        let stats = coord.stats();
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.aborted, 0);
        coord.shutdown();
    }

    #[test]
    fn test_prepare_failure_aborts() {
        let coord = coordinator();
        coord.register_transport(|node: &NodeId, message: &Message| match message {
            Message::Prepare { .. } if node == "node-2" => {
                Err(Error::PrepareFailed("disk full".into()))
            }
            Message::Prepare { .. } => Ok(Reply::Prepared),
            _ => Ok(Reply::Ack),
        });

        let id = coord
            .begin(TxnPriority::Normal, Duration::from_secs(5), nodes(3), None)
            .unwrap();
        let err = coord.execute(id).unwrap_err();
        assert_eq!(err.kind(), concord_core::ErrorKind::PrepareFailed);
        assert_eq!(coord.txn_status(id), Some(DistTxnStatus::Aborted));
        assert_eq!(coord.stats().aborted, 1);
        coord.shutdown();
    }

    #[test]
    fn test_participant_vote_no_aborts() {
        let coord = coordinator();
        coord.register_transport(|node: &NodeId, message: &Message| match message {
            Message::Prepare { .. } if node == "node-3" => Ok(Reply::Aborted),
            Message::Prepare { .. } => Ok(Reply::Prepared),
            _ => Ok(Reply::Ack),
        });
        let id = coord
            .begin(TxnPriority::Normal, Duration::from_secs(5), nodes(3), None)
            .unwrap();
        let status = coord.wait_for_terminal(id, Duration::from_secs(3)).unwrap();
        assert_eq!(status, DistTxnStatus::Aborted);
        coord.shutdown();
    }

    #[test]
    fn test_unresponsive_participant_aborts_within_deadline() {
        let coord = coordinator();
        coord.register_transport(|_node: &NodeId, message: &Message| match message {
            Message::Prepare { .. } => {
                // Non-responsive: the reply lands after the deadline.
                std::thread::sleep(Duration::from_millis(300));
                Ok(Reply::Prepared)
            }
            _ => Ok(Reply::Ack),
        });
        let began = Instant::now();
        let id = coord
            .begin(
                TxnPriority::Normal,
                Duration::from_millis(100),
                nodes(1),
                None,
            )
            .unwrap();
        let status = coord.wait_for_terminal(id, Duration::from_secs(2)).unwrap();
        assert_eq!(status, DistTxnStatus::Aborted);
        assert!(began.elapsed() < Duration::from_secs(2));
        coord.shutdown();
    }

    #[test]
    fn test_ack_loss_still_commits() {
        let acked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&acked);
        let coord = coordinator();
        coord.register_transport(move |node: &NodeId, message: &Message| match message {
            Message::Prepare { .. } => Ok(Reply::Prepared),
            Message::Commit { .. } if node == "node-2" => Err(Error::Timeout("lost".into())),
            Message::Commit { .. } => {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Reply::Ack)
            }
            _ => Ok(Reply::Ack),
        });
        let id = coord
            .begin(TxnPriority::Normal, Duration::from_secs(5), nodes(3), None)
            .unwrap();
        let status = coord.wait_for_terminal(id, Duration::from_secs(3)).unwrap();
        // Committed despite the lost ACK; the count stays observable.
        assert_eq!(status, DistTxnStatus::Committed);
        let txn = coord.txn(id).unwrap();
        assert_eq!(txn.committed_count(), 2);
        coord.shutdown();
    }

    #[test]
    fn test_priority_order_under_contention() {
        let coord = coordinator();
        let completion: Arc<Mutex<Vec<Uuid>>> = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&completion);
        coord.register_transport(move |_node: &NodeId, message: &Message| match message {
            Message::Prepare { .. } => {
                // Slow participant: gives the queue time to fill.
                std::thread::sleep(Duration::from_millis(20));
                Ok(Reply::Prepared)
            }
            Message::Commit { txn_id } => {
                log.lock().push(*txn_id);
                Ok(Reply::Ack)
            }
            _ => Ok(Reply::Ack),
        });

        // A stall txn occupies the scheduler while the four interesting
        // ones enqueue; priority then decides who goes next.
        let _stall = coord
            .begin(TxnPriority::Urgent, Duration::from_secs(10), nodes(1), None)
            .unwrap();
        let low = coord
            .begin(TxnPriority::Low, Duration::from_secs(10), nodes(1), None)
            .unwrap();
        let normal = coord
            .begin(TxnPriority::Normal, Duration::from_secs(10), nodes(1), None)
            .unwrap();
        let high = coord
            .begin(TxnPriority::High, Duration::from_secs(10), nodes(1), None)
            .unwrap();
        let urgent = coord
            .begin(TxnPriority::Urgent, Duration::from_secs(10), nodes(1), None)
            .unwrap();

        for id in [low, normal, high, urgent] {
            coord.wait_for_terminal(id, Duration::from_secs(3)).unwrap();
        }
        let order = completion.lock().clone();
        let pos = |id: Uuid| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(urgent) < pos(high), "urgent before high");
        assert!(pos(high) < pos(normal), "high before normal");
        assert!(pos(normal) < pos(low), "normal before low");
        coord.shutdown();
    }

    #[test]
    fn test_fifo_policy_flattens_priority() {
        let mut config = DistConfig::default();
        config.schedule_policy = SchedulePolicy::Fifo;
        let coord = Coordinator::new("coord-fifo", config);
        let completion: Arc<Mutex<Vec<Uuid>>> = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&completion);
        coord.register_transport(move |_node: &NodeId, message: &Message| match message {
            Message::Prepare { .. } => {
                std::thread::sleep(Duration::from_millis(20));
                Ok(Reply::Prepared)
            }
            Message::Commit { txn_id } => {
                log.lock().push(*txn_id);
                Ok(Reply::Ack)
            }
            _ => Ok(Reply::Ack),
        });

        let _stall = coord
            .begin(TxnPriority::Normal, Duration::from_secs(10), nodes(1), None)
            .unwrap();
        let first = coord
            .begin(TxnPriority::Low, Duration::from_secs(10), nodes(1), None)
            .unwrap();
        let second = coord
            .begin(TxnPriority::Urgent, Duration::from_secs(10), nodes(1), None)
            .unwrap();

        for id in [first, second] {
            coord.wait_for_terminal(id, Duration::from_secs(3)).unwrap();
        }
        let order = completion.lock().clone();
        let pos = |id: Uuid| order.iter().position(|&x| x == id).unwrap();
        assert!(pos(first) < pos(second), "FIFO keeps arrival order");
        coord.shutdown();
    }

    #[test]
    fn test_heartbeat_refreshes_last_seen() {
        let mut config = DistConfig::default();
        config.heartbeat_interval = Duration::from_millis(50);
        let coord = Coordinator::new("coord-hb", config);
        coord.register_transport(all_yes());
        coord.register_node("node-1");
        let before = coord.last_seen("node-1").unwrap();
        std::thread::sleep(Duration::from_millis(300));
        let after = coord.last_seen("node-1").unwrap();
        assert!(after > before, "heartbeat refreshed last-seen");
        assert!(coord.stats().heartbeats >= 1);
        coord.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent_and_drains() {
        let coord = coordinator();
        coord.register_transport(all_yes());
        let id = coord
            .begin(TxnPriority::Normal, Duration::from_secs(5), nodes(2), None)
            .unwrap();
        let _ = coord.wait_for_terminal(id, Duration::from_secs(3));
        coord.shutdown();
        coord.shutdown();
        // Begin after shutdown is refused, not a crash.
        let err = coord
            .begin(TxnPriority::Normal, Duration::from_secs(1), nodes(1), None)
            .unwrap_err();
        assert_eq!(err.kind(), concord_core::ErrorKind::InvalidState);
    }

    #[test]
    fn test_no_txn_ends_prepared_after_drain() {
        let coord = coordinator();
        coord.register_transport(all_yes());
        let mut ids = Vec::new();
        for i in 0..8 {
            let priority = match i % 4 {
                0 => TxnPriority::Low,
                1 => TxnPriority::Normal,
                2 => TxnPriority::High,
                _ => TxnPriority::Urgent,
            };
            ids.push(
                coord
                    .begin(priority, Duration::from_secs(5), nodes(2), None)
                    .unwrap(),
            );
        }
        for id in &ids {
            let status = coord.wait_for_terminal(*id, Duration::from_secs(5)).unwrap();
            assert!(status.is_terminal());
            assert_ne!(coord.txn_status(*id), Some(DistTxnStatus::Prepared));
        }
        coord.shutdown();
    }
}

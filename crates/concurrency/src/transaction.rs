//! Local transaction manager.
//!
//! Four isolation levels over any engine satisfying the contract:
//!
//! | Level | External visibility | Own writes |
//! |---|---|---|
//! | ReadUncommitted | immediate (applied eagerly) | visible |
//! | ReadCommitted | on commit | visible |
//! | RepeatableRead | on commit | visible; first-read values latched |
//! | Serializable | on commit | visible; new keys invisible outside |
//!
//! Operations append to an ordered op list. The eager level applies
//! each op immediately, capturing the overwritten value so rollback can
//! restore in reverse order. The buffered levels overlay their pending
//! writes for read-your-writes and apply the op list in order at
//! commit.
//!
//! Any operation on a committed or aborted transaction is
//! `InvalidState`; commit applies effects exactly once.

use concord_core::config::IsolationLevel;
use concord_core::engine::KvEngine;
use concord_core::error::{Error, Result};
use concord_core::types::{Key, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Transaction lifecycle state.
///
/// `Active` is the only state accepting operations; the other two are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// Accepting operations
    Active,
    /// Effects applied exactly once
    Committed,
    /// Effects rolled back (or never applied)
    Aborted,
}

/// Kind of a buffered transaction operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOpKind {
    /// Insert or replace
    Put,
    /// Remove
    Del,
    /// Replace an existing key
    Mod,
}

/// One entry of the ordered op list.
#[derive(Debug, Clone)]
pub struct TxnOp {
    /// Operation kind
    pub kind: TxnOpKind,
    /// Target key
    pub key: Key,
    /// New value for Put/Mod
    pub new_value: Option<Value>,
    /// Value overwritten by an eager apply: `None` = not captured
    /// (buffered level), `Some(None)` = key did not exist.
    pub captured_old: Option<Option<Value>>,
}

/// Counters for transaction lifecycle events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnManagerStats {
    /// Transactions begun
    pub started: u64,
    /// Transactions committed
    pub committed: u64,
    /// Transactions rolled back
    pub aborted: u64,
}

/// Allocates transaction ids and tracks lifecycle counters.
///
/// The counters use Relaxed ordering: they are observational metrics
/// that synchronize nothing.
pub struct TxnManager {
    next_id: AtomicU64,
    default_isolation: IsolationLevel,
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
}

impl TxnManager {
    /// Create with a default isolation for `begin` calls that omit one.
    pub fn new(default_isolation: IsolationLevel) -> Self {
        TxnManager {
            next_id: AtomicU64::new(1),
            default_isolation,
            started: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    /// Begin a transaction on `engine`.
    pub fn begin(
        self: &Arc<Self>,
        engine: Arc<dyn KvEngine>,
        isolation: Option<IsolationLevel>,
    ) -> Transaction {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.started.fetch_add(1, Ordering::Relaxed);
        let isolation = isolation.unwrap_or(self.default_isolation);
        debug!(target: "concord::txn", id, ?isolation, "transaction begun");
        Transaction {
            id,
            isolation,
            engine,
            manager: Arc::clone(self),
            status: TxnStatus::Active,
            ops: Vec::new(),
            pending: HashMap::new(),
            read_latches: HashMap::new(),
            started_at: Instant::now(),
            ended_at: None,
        }
    }

    /// Lifecycle counters.
    pub fn stats(&self) -> TxnManagerStats {
        TxnManagerStats {
            started: self.started.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}

/// A local transaction handle.
pub struct Transaction {
    id: u64,
    isolation: IsolationLevel,
    engine: Arc<dyn KvEngine>,
    manager: Arc<TxnManager>,
    status: TxnStatus,
    ops: Vec<TxnOp>,
    /// Buffered levels: pending view overlay. `None` = pending delete.
    pending: HashMap<Key, Option<Value>>,
    /// RepeatableRead/Serializable: first observed value per key.
    read_latches: HashMap<Key, Option<Value>>,
    started_at: Instant,
    ended_at: Option<Instant>,
}

impl Transaction {
    /// Transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Isolation level.
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Current lifecycle state.
    pub fn status(&self) -> TxnStatus {
        self.status
    }

    /// Buffered (or applied) op count.
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Wall-clock duration so far (or to termination).
    pub fn elapsed(&self) -> std::time::Duration {
        self.ended_at.unwrap_or_else(Instant::now) - self.started_at
    }

    fn check_active(&self) -> Result<()> {
        match self.status {
            TxnStatus::Active => Ok(()),
            TxnStatus::Committed => Err(Error::InvalidState(
                "operation on a committed transaction".into(),
            )),
            TxnStatus::Aborted => Err(Error::InvalidState(
                "operation on an aborted transaction".into(),
            )),
        }
    }

    fn eager(&self) -> bool {
        self.isolation == IsolationLevel::ReadUncommitted
    }

    /// Insert or replace `key` within the transaction.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_active()?;
        let key = Key::from(key);
        let value = Value::from(value);
        if self.eager() {
            let old = self.engine.get(key.as_bytes()).ok();
            self.engine.put(key.as_bytes(), value.as_bytes())?;
            self.ops.push(TxnOp {
                kind: TxnOpKind::Put,
                key,
                new_value: Some(value),
                captured_old: Some(old),
            });
        } else {
            self.pending.insert(key.clone(), Some(value.clone()));
            self.ops.push(TxnOp {
                kind: TxnOpKind::Put,
                key,
                new_value: Some(value),
                captured_old: None,
            });
        }
        Ok(())
    }

    /// Read `key` as this transaction sees it.
    pub fn get(&mut self, key: &[u8]) -> Result<Value> {
        self.check_active()?;
        let key = Key::from(key);
        // Own writes first.
        if !self.eager() {
            if let Some(pending) = self.pending.get(&key) {
                return match pending {
                    Some(value) => Ok(value.clone()),
                    None => Err(Error::NotFound),
                };
            }
        }
        // Latched first reads for the repeatable levels.
        if matches!(
            self.isolation,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        ) {
            if let Some(latched) = self.read_latches.get(&key) {
                return match latched {
                    Some(value) => Ok(value.clone()),
                    None => Err(Error::NotFound),
                };
            }
        }
        let observed = match self.engine.get(key.as_bytes()) {
            Ok(value) => Some(value),
            Err(Error::NotFound) => None,
            Err(e) => return Err(e),
        };
        if matches!(
            self.isolation,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        ) {
            self.read_latches.insert(key.clone(), observed.clone());
        }
        observed.ok_or(Error::NotFound)
    }

    /// Delete `key`. `NotFound` when the transaction's view lacks it.
    pub fn del(&mut self, key: &[u8]) -> Result<()> {
        self.check_active()?;
        let key = Key::from(key);
        if self.eager() {
            let old = match self.engine.get(key.as_bytes()) {
                Ok(value) => value,
                Err(e) => return Err(e),
            };
            self.engine.delete(key.as_bytes())?;
            self.ops.push(TxnOp {
                kind: TxnOpKind::Del,
                key,
                new_value: None,
                captured_old: Some(Some(old)),
            });
        } else {
            if !self.visible_in_view(&key)? {
                return Err(Error::NotFound);
            }
            self.pending.insert(key.clone(), None);
            self.ops.push(TxnOp {
                kind: TxnOpKind::Del,
                key,
                new_value: None,
                captured_old: None,
            });
        }
        Ok(())
    }

    /// Replace the value of a key that exists in the transaction's view.
    pub fn modify(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_active()?;
        let key = Key::from(key);
        let value = Value::from(value);
        if self.eager() {
            let old = self.engine.get(key.as_bytes())?;
            self.engine.update(key.as_bytes(), value.as_bytes())?;
            self.ops.push(TxnOp {
                kind: TxnOpKind::Mod,
                key,
                new_value: Some(value),
                captured_old: Some(Some(old)),
            });
        } else {
            if !self.visible_in_view(&key)? {
                return Err(Error::NotFound);
            }
            self.pending.insert(key.clone(), Some(value.clone()));
            self.ops.push(TxnOp {
                kind: TxnOpKind::Mod,
                key,
                new_value: Some(value),
                captured_old: None,
            });
        }
        Ok(())
    }

    fn visible_in_view(&self, key: &Key) -> Result<bool> {
        if let Some(pending) = self.pending.get(key) {
            return Ok(pending.is_some());
        }
        match self.engine.get(key.as_bytes()) {
            Ok(_) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Commit: apply buffered ops in order (buffered levels) or just
    /// seal the already-applied effects (eager level).
    pub fn commit(&mut self) -> Result<()> {
        self.check_active()?;
        if !self.eager() {
            for op in &self.ops {
                match op.kind {
                    TxnOpKind::Put => {
                        let value = op.new_value.as_ref().ok_or_else(|| {
                            Error::InvalidState("put op without a value".into())
                        })?;
                        self.engine.put(op.key.as_bytes(), value.as_bytes())?;
                    }
                    TxnOpKind::Del => match self.engine.delete(op.key.as_bytes()) {
                        Ok(()) => {}
                        // The key vanished under us; the end state agrees.
                        Err(Error::NotFound) => {}
                        Err(e) => return Err(e),
                    },
                    TxnOpKind::Mod => {
                        let value = op.new_value.as_ref().ok_or_else(|| {
                            Error::InvalidState("mod op without a value".into())
                        })?;
                        // Presence was checked against the txn view; an
                        // upsert keeps the apply loop deterministic.
                        self.engine.put(op.key.as_bytes(), value.as_bytes())?;
                    }
                }
            }
        }
        self.status = TxnStatus::Committed;
        self.ended_at = Some(Instant::now());
        self.manager.committed.fetch_add(1, Ordering::Relaxed);
        debug!(target: "concord::txn", id = self.id, ops = self.ops.len(), "transaction committed");
        Ok(())
    }

    /// Roll back: restore captured values in reverse order (eager
    /// level) or drop the buffer (buffered levels).
    pub fn rollback(&mut self) -> Result<()> {
        self.check_active()?;
        if self.eager() {
            for op in self.ops.iter().rev() {
                let old = op.captured_old.as_ref().ok_or_else(|| {
                    Error::InvalidState("eager op without a captured old value".into())
                })?;
                match old {
                    Some(value) => self.engine.put(op.key.as_bytes(), value.as_bytes())?,
                    None => match self.engine.delete(op.key.as_bytes()) {
                        Ok(()) => {}
                        Err(Error::NotFound) => {}
                        Err(e) => return Err(e),
                    },
                }
            }
        }
        self.pending.clear();
        self.status = TxnStatus::Aborted;
        self.ended_at = Some(Instant::now());
        self.manager.aborted.fetch_add(1, Ordering::Relaxed);
        debug!(target: "concord::txn", id = self.id, "transaction rolled back");
        Ok(())
    }
}

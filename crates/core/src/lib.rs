//! Core types for the ConcordKV storage core
//!
//! This crate defines the vocabulary shared by every other crate in the
//! workspace:
//!
//! - [`Key`] / [`Value`] byte newtypes with unsigned lexicographic ordering
//! - The stable [`ErrorKind`] enumeration and [`Error`] carrier
//! - The typed [`EngineConfig`] tree with validation
//! - The [`KvEngine`] contract every storage engine satisfies
//!
//! It deliberately contains no I/O and no locking: leaves first.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod engine;
pub mod error;
pub mod types;

pub use config::{
    ArenaConfig, BTreeConfig, BatchConfig, CacheConfig, CachePolicy, DistConfig, EngineConfig,
    HashConfig, IsolationLevel, LsmConfig, SchedulePolicy, SnapshotKind, ThreadMode, TxnConfig,
    WalConfig,
};
pub use engine::{decode_state, encode_state, EngineStats, KvEngine};
pub use error::{Error, ErrorKind, Result};
pub use types::{EngineKind, Key, OpKind, Record, TxnPriority, Value};

//! Core data model types shared by every engine.
//!
//! Keys and values are opaque byte sequences of explicit length. A key
//! containing interior NUL bytes, or an empty key, is legal and
//! distinguishable from absence. Keys order by unsigned lexicographic
//! byte comparison, which is exactly what `Vec<u8>`'s derived `Ord` does.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque key: owned byte sequence, ordered lexicographically.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Key(pub Vec<u8>);

impl Key {
    /// Construct a key from any byte source.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Key(bytes.into())
    }

    /// Key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes. Zero is a valid key length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the empty key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "Key({:?})", s),
            Err(_) => write!(f, "Key({} bytes)", self.0.len()),
        }
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Key(bytes.to_vec())
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(s.as_bytes().to_vec())
    }
}

/// Opaque value: owned byte sequence.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Value(pub Vec<u8>);

impl Value {
    /// Construct a value from any byte source.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Value(bytes.into())
    }

    /// Value bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes. Zero is a valid value length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the empty value.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "Value({:?})", s),
            Err(_) => write!(f, "Value({} bytes)", self.0.len()),
        }
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value(bytes.to_vec())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value(s.as_bytes().to_vec())
    }
}

/// Which storage engine backs an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    /// Linear-probe vector, small-N baseline
    Array,
    /// Dynamic-bucket chaining with segmented locks
    Hash,
    /// Self-balancing ordered map
    RBTree,
    /// Leaf-linked order-configurable tree
    BPlusTree,
    /// Log-structured merge tree
    Lsm,
}

impl EngineKind {
    /// Stable on-disk tag for snapshot envelopes.
    pub fn as_u32(self) -> u32 {
        match self {
            EngineKind::Array => 1,
            EngineKind::Hash => 2,
            EngineKind::RBTree => 3,
            EngineKind::BPlusTree => 4,
            EngineKind::Lsm => 5,
        }
    }

    /// Decode an on-disk engine tag.
    pub fn from_u32(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(EngineKind::Array),
            2 => Some(EngineKind::Hash),
            3 => Some(EngineKind::RBTree),
            4 => Some(EngineKind::BPlusTree),
            5 => Some(EngineKind::Lsm),
            _ => None,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineKind::Array => "array",
            EngineKind::Hash => "hash",
            EngineKind::RBTree => "rbtree",
            EngineKind::BPlusTree => "bptree",
            EngineKind::Lsm => "lsm",
        };
        f.write_str(name)
    }
}

/// Operation kind recorded in the WAL and in transaction op lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpKind {
    /// Insert or replace a key
    Put = 1,
    /// Remove a key
    Delete = 2,
    /// Replace an existing key (fails on absence)
    Update = 3,
    /// Transaction begin marker
    TxnBegin = 4,
    /// Transaction commit marker
    TxnCommit = 5,
    /// Transaction abort marker
    TxnAbort = 6,
}

impl OpKind {
    /// Stable on-disk byte code.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode an on-disk op code.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            1 => Some(OpKind::Put),
            2 => Some(OpKind::Delete),
            3 => Some(OpKind::Update),
            4 => Some(OpKind::TxnBegin),
            5 => Some(OpKind::TxnCommit),
            6 => Some(OpKind::TxnAbort),
            _ => None,
        }
    }
}

/// Scheduling priority of a distributed transaction.
///
/// Orders descending in the coordinator's queue: `Urgent` dequeues before
/// `High`, and so on. FIFO among equals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TxnPriority {
    /// Background work
    Low,
    /// Default
    Normal,
    /// Elevated
    High,
    /// Ahead of everything else
    Urgent,
}

impl Default for TxnPriority {
    fn default() -> Self {
        TxnPriority::Normal
    }
}

/// A stored record: key, value, and an insertion-order tiebreaker.
///
/// The stamp breaks ties when two records for different keys must be
/// ordered by age (LFU eviction, FIFO among equal priorities).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Record key (unique within an engine instance)
    pub key: Key,
    /// Record value
    pub value: Value,
    /// Monotonic insertion stamp
    pub stamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering_is_unsigned_lexicographic() {
        // 0x80 > 0x7F only under unsigned comparison
        let low = Key::new(vec![0x7Fu8]);
        let high = Key::new(vec![0x80u8]);
        assert!(low < high);

        // Prefix orders before extension
        assert!(Key::from("ab") < Key::from("abc"));
        // Empty key orders first
        assert!(Key::default() < Key::from("a"));
    }

    #[test]
    fn test_empty_key_and_value_are_legal() {
        let k = Key::default();
        let v = Value::default();
        assert!(k.is_empty());
        assert!(v.is_empty());
        assert_eq!(k.len(), 0);
        assert_eq!(v.len(), 0);
    }

    #[test]
    fn test_engine_kind_tag_roundtrip() {
        for kind in [
            EngineKind::Array,
            EngineKind::Hash,
            EngineKind::RBTree,
            EngineKind::BPlusTree,
            EngineKind::Lsm,
        ] {
            assert_eq!(EngineKind::from_u32(kind.as_u32()), Some(kind));
        }
        assert_eq!(EngineKind::from_u32(0), None);
        assert_eq!(EngineKind::from_u32(99), None);
    }

    #[test]
    fn test_op_kind_code_roundtrip() {
        for op in [
            OpKind::Put,
            OpKind::Delete,
            OpKind::Update,
            OpKind::TxnBegin,
            OpKind::TxnCommit,
            OpKind::TxnAbort,
        ] {
            assert_eq!(OpKind::from_u8(op.as_u8()), Some(op));
        }
        assert_eq!(OpKind::from_u8(0), None);
        assert_eq!(OpKind::from_u8(7), None);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TxnPriority::Urgent > TxnPriority::High);
        assert!(TxnPriority::High > TxnPriority::Normal);
        assert!(TxnPriority::Normal > TxnPriority::Low);
        assert_eq!(TxnPriority::default(), TxnPriority::Normal);
    }

    #[test]
    fn test_key_debug_renders_utf8() {
        let k = Key::from("user:1001");
        assert!(format!("{:?}", k).contains("user:1001"));
        let raw = Key::new(vec![0xFF, 0xFE]);
        assert!(format!("{:?}", raw).contains("2 bytes"));
    }
}

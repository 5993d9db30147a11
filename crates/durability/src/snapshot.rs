//! Snapshot writer and loader.
//!
//! A snapshot captures engine state at a known WAL sequence so recovery
//! can skip replaying history older than it.
//!
//! # Envelope (packed, little-endian)
//!
//! ```text
//! ┌───────────┬──────────────┬─────────────────┬─────────────────┬─────────┬───────────┐
//! │ magic (4) │ last_seq (8) │ engine_kind (4) │ payload_len (8) │ payload │ crc32 (4) │
//! └───────────┴──────────────┴─────────────────┴─────────────────┴─────────┴───────────┘
//! ```
//!
//! The CRC covers everything before it. A truncated or bit-flipped file
//! fails the checksum and the loader rejects it, which is what makes a
//! half-written snapshot harmless: writers stage to a temp file, fsync,
//! and rename into place.
//!
//! # Full vs incremental
//!
//! A full snapshot's payload is the engine-serialized state. An
//! incremental snapshot's payload is a diff against a base snapshot
//! (upserts plus deletes); the loader resolves the chain down to the
//! nearest full snapshot and folds the diffs back up.

use concord_core::engine::{decode_state, encode_state, KvEngine};
use concord_core::error::{Error, Result};
use concord_core::types::{EngineKind, Key, Value};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Magic bytes identifying a snapshot file: "CKSN"
pub const SNAPSHOT_MAGIC: u32 = u32::from_le_bytes(*b"CKSN");

/// Fixed header size: magic + last_seq + engine_kind + payload_len.
pub const SNAPSHOT_HEADER_SIZE: usize = 4 + 8 + 4 + 8;

/// Snapshot flavor, encoded in the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFileKind {
    /// Complete engine state
    Full,
    /// Diff against a base snapshot
    Incremental,
}

/// One snapshot discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// WAL sequence the snapshot captures through
    pub seq: u64,
    /// Full or incremental
    pub kind: SnapshotFileKind,
    /// File path
    pub path: PathBuf,
}

/// Incremental snapshot payload: the diff since `base_seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IncrementalPayload {
    base_seq: u64,
    upserts: Vec<(Key, Value)>,
    deletes: Vec<Key>,
}

fn snapshot_path(dir: &Path, seq: u64, kind: SnapshotFileKind) -> PathBuf {
    let tag = match kind {
        SnapshotFileKind::Full => "full",
        SnapshotFileKind::Incremental => "incr",
    };
    dir.join(format!("snapshot-{:012}-{}.snap", seq, tag))
}

/// List snapshots in `dir`, ascending by sequence.
pub fn list_snapshots(dir: &Path) -> Result<Vec<SnapshotInfo>> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(rest) = name
            .strip_prefix("snapshot-")
            .and_then(|s| s.strip_suffix(".snap"))
        else {
            continue;
        };
        let Some((seq_str, tag)) = rest.split_once('-') else {
            continue;
        };
        let Ok(seq) = seq_str.parse::<u64>() else {
            continue;
        };
        let kind = match tag {
            "full" => SnapshotFileKind::Full,
            "incr" => SnapshotFileKind::Incremental,
            _ => continue,
        };
        found.push(SnapshotInfo {
            seq,
            kind,
            path: entry.path(),
        });
    }
    found.sort_by_key(|s| s.seq);
    Ok(found)
}

/// The newest snapshot in `dir`, if any.
pub fn find_latest_snapshot(dir: &Path) -> Result<Option<SnapshotInfo>> {
    Ok(list_snapshots(dir)?.into_iter().last())
}

fn write_envelope(path: &Path, last_seq: u64, engine_kind: EngineKind, payload: &[u8]) -> Result<()> {
    let mut buf = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + payload.len() + 4);
    buf.extend_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
    buf.extend_from_slice(&last_seq.to_le_bytes());
    buf.extend_from_slice(&engine_kind.as_u32().to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    buf.extend_from_slice(payload);
    let mut hasher = Hasher::new();
    hasher.update(&buf);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());

    // Stage, fsync, rename: a crash leaves either the old file set or
    // the complete new file, never a half-written snapshot in place.
    let tmp = path.with_extension("snap.tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Parse and verify an envelope; returns `(last_seq, engine_kind, payload)`.
pub fn read_envelope(path: &Path) -> Result<(u64, u32, Vec<u8>)> {
    let mut file = File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    if buf.len() < SNAPSHOT_HEADER_SIZE + 4 {
        return Err(Error::Corruption("truncated snapshot".into()));
    }
    let magic = u32::from_le_bytes(buf[0..4].try_into().expect("sliced to width"));
    if magic != SNAPSHOT_MAGIC {
        return Err(Error::Corruption("bad snapshot magic".into()));
    }
    let last_seq = u64::from_le_bytes(buf[4..12].try_into().expect("sliced to width"));
    let engine_kind = u32::from_le_bytes(buf[12..16].try_into().expect("sliced to width"));
    let payload_len =
        u64::from_le_bytes(buf[16..24].try_into().expect("sliced to width")) as usize;
    let total = SNAPSHOT_HEADER_SIZE + payload_len + 4;
    if buf.len() != total {
        return Err(Error::Corruption(format!(
            "snapshot length mismatch: header says {} bytes, file has {}",
            total,
            buf.len()
        )));
    }
    let stored_crc =
        u32::from_le_bytes(buf[total - 4..total].try_into().expect("sliced to width"));
    let mut hasher = Hasher::new();
    hasher.update(&buf[..total - 4]);
    let computed = hasher.finalize();
    if computed != stored_crc {
        return Err(Error::Corruption(format!(
            "snapshot checksum mismatch: stored {:08x}, computed {:08x}",
            stored_crc, computed
        )));
    }
    let payload = buf[SNAPSHOT_HEADER_SIZE..total - 4].to_vec();
    Ok((last_seq, engine_kind, payload))
}

/// Write a full snapshot of `engine` at `last_seq`.
pub fn write_full_snapshot(dir: &Path, engine: &dyn KvEngine, last_seq: u64) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let payload = engine.serialize_state()?;
    let path = snapshot_path(dir, last_seq, SnapshotFileKind::Full);
    write_envelope(&path, last_seq, engine.kind(), &payload)?;
    info!(target: "concord::snapshot", seq = last_seq, "full snapshot written");
    Ok(path)
}

/// Write an incremental snapshot: the diff between the engine's current
/// state and the snapshot chain state at `base_seq`.
pub fn write_incremental_snapshot(
    dir: &Path,
    engine: &dyn KvEngine,
    last_seq: u64,
    base_seq: u64,
) -> Result<PathBuf> {
    let base_state = load_state_at(dir, base_seq)?;
    let base: BTreeMap<Key, Value> = base_state.into_iter().collect();
    let current: BTreeMap<Key, Value> = decode_state(&engine.serialize_state()?)?
        .into_iter()
        .collect();

    let mut upserts = Vec::new();
    let mut deletes = Vec::new();
    for (key, value) in &current {
        if base.get(key) != Some(value) {
            upserts.push((key.clone(), value.clone()));
        }
    }
    for key in base.keys() {
        if !current.contains_key(key) {
            deletes.push(key.clone());
        }
    }

    let payload = bincode::serialize(&IncrementalPayload {
        base_seq,
        upserts,
        deletes,
    })?;
    let path = snapshot_path(dir, last_seq, SnapshotFileKind::Incremental);
    write_envelope(&path, last_seq, engine.kind(), &payload)?;
    info!(
        target: "concord::snapshot",
        seq = last_seq,
        base = base_seq,
        "incremental snapshot written"
    );
    Ok(path)
}

/// Materialize the key/value state a snapshot captures, folding any
/// incremental chain down to its full base.
pub fn load_snapshot_state(dir: &Path, info: &SnapshotInfo) -> Result<Vec<(Key, Value)>> {
    let (_, _, payload) = read_envelope(&info.path)?;
    match info.kind {
        SnapshotFileKind::Full => decode_state(&payload),
        SnapshotFileKind::Incremental => {
            let diff: IncrementalPayload = bincode::deserialize(&payload)?;
            let base = load_state_at(dir, diff.base_seq)?;
            let mut state: BTreeMap<Key, Value> = base.into_iter().collect();
            for (key, value) in diff.upserts {
                state.insert(key, value);
            }
            for key in diff.deletes {
                state.remove(&key);
            }
            Ok(state.into_iter().collect())
        }
    }
}

fn load_state_at(dir: &Path, seq: u64) -> Result<Vec<(Key, Value)>> {
    let info = list_snapshots(dir)?
        .into_iter()
        .find(|s| s.seq == seq)
        .ok_or_else(|| {
            Error::Corruption(format!("incremental base snapshot at seq {} is missing", seq))
        })?;
    load_snapshot_state(dir, &info)
}

/// Restore `engine` from a snapshot.
pub fn restore_engine(dir: &Path, info: &SnapshotInfo, engine: &dyn KvEngine) -> Result<()> {
    let state = load_snapshot_state(dir, info)?;
    engine.restore_state(&encode_state(&state)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::config::EngineConfig;
    use concord_storage::create_engine;
    use tempfile::tempdir;

    fn engine_with(pairs: &[(&str, &str)]) -> std::sync::Arc<dyn KvEngine> {
        let engine =
            create_engine(&EngineConfig::new(EngineKind::BPlusTree)).unwrap();
        for (k, v) in pairs {
            engine.put(k.as_bytes(), v.as_bytes()).unwrap();
        }
        engine
    }

    #[test]
    fn test_full_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let engine = engine_with(&[("a", "1"), ("b", "2"), ("c", "3")]);
        write_full_snapshot(dir.path(), engine.as_ref(), 10).unwrap();

        let latest = find_latest_snapshot(dir.path()).unwrap().unwrap();
        assert_eq!(latest.seq, 10);
        assert_eq!(latest.kind, SnapshotFileKind::Full);

        let restored = engine_with(&[]);
        restore_engine(dir.path(), &latest, restored.as_ref()).unwrap();
        assert_eq!(restored.count(), 3);
        assert_eq!(restored.get(b"b").unwrap(), Value::from("2"));
    }

    #[test]
    fn test_latest_snapshot_wins() {
        let dir = tempdir().unwrap();
        let engine = engine_with(&[("a", "old")]);
        write_full_snapshot(dir.path(), engine.as_ref(), 5).unwrap();
        engine.put(b"a", b"new").unwrap();
        write_full_snapshot(dir.path(), engine.as_ref(), 9).unwrap();

        let latest = find_latest_snapshot(dir.path()).unwrap().unwrap();
        assert_eq!(latest.seq, 9);
    }

    #[test]
    fn test_incremental_chain() {
        let dir = tempdir().unwrap();
        let engine = engine_with(&[("a", "1"), ("b", "2")]);
        write_full_snapshot(dir.path(), engine.as_ref(), 10).unwrap();

        engine.put(b"c", b"3").unwrap();
        engine.put(b"a", b"1-new").unwrap();
        engine.delete(b"b").unwrap();
        write_incremental_snapshot(dir.path(), engine.as_ref(), 20, 10).unwrap();

        let latest = find_latest_snapshot(dir.path()).unwrap().unwrap();
        assert_eq!(latest.kind, SnapshotFileKind::Incremental);
        let state = load_snapshot_state(dir.path(), &latest).unwrap();
        let state: BTreeMap<Key, Value> = state.into_iter().collect();
        assert_eq!(state.len(), 2);
        assert_eq!(state.get(&Key::from("a")), Some(&Value::from("1-new")));
        assert_eq!(state.get(&Key::from("c")), Some(&Value::from("3")));
        assert!(!state.contains_key(&Key::from("b")));
    }

    #[test]
    fn test_partial_snapshot_rejected() {
        let dir = tempdir().unwrap();
        let engine = engine_with(&[("a", "1")]);
        let path = write_full_snapshot(dir.path(), engine.as_ref(), 3).unwrap();

        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 2).unwrap();

        let err = read_envelope(&path).unwrap_err();
        assert_eq!(err.kind(), concord_core::ErrorKind::Corruption);
    }

    #[test]
    fn test_bit_flip_rejected() {
        let dir = tempdir().unwrap();
        let engine = engine_with(&[("a", "1")]);
        let path = write_full_snapshot(dir.path(), engine.as_ref(), 3).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[SNAPSHOT_HEADER_SIZE + 1] ^= 0x01;
        fs::write(&path, &bytes).unwrap();

        assert!(read_envelope(&path).is_err());
    }

    #[test]
    fn test_missing_base_is_corruption() {
        let dir = tempdir().unwrap();
        let engine = engine_with(&[("a", "1")]);
        write_full_snapshot(dir.path(), engine.as_ref(), 10).unwrap();
        write_incremental_snapshot(dir.path(), engine.as_ref(), 20, 10).unwrap();
        fs::remove_file(snapshot_path(dir.path(), 10, SnapshotFileKind::Full)).unwrap();

        let latest = find_latest_snapshot(dir.path()).unwrap().unwrap();
        assert!(load_snapshot_state(dir.path(), &latest).is_err());
    }
}

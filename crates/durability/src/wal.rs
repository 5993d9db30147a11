//! WAL writer and reader.
//!
//! One active segment receives appends; rotation starts a fresh segment
//! when the active one crosses the configured byte or entry threshold.
//! Closed segments are immutable until compaction rewrites them.
//!
//! # Durability policy
//!
//! Appends batch their fsyncs: the writer syncs after `fsync_every`
//! appends or `fsync_interval` wall-clock time, whichever comes first.
//! `sync()` forces one immediately. Rotation always syncs the outgoing
//! segment before the new one accepts writes.

use crate::format::{SegmentHeader, WalEntry, SEGMENT_HEADER_SIZE};
use concord_core::config::WalConfig;
use concord_core::error::{Error, Result};
use concord_core::types::OpKind;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

/// Segment file path: `wal-NNNNNN.log`.
pub fn segment_path(dir: &Path, segment_number: u64) -> PathBuf {
    dir.join(format!("wal-{:06}.log", segment_number))
}

/// Sorted list of segment numbers present in `dir`.
pub fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut numbers = Vec::new();
    if !dir.exists() {
        return Ok(numbers);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix("wal-").and_then(|s| s.strip_suffix(".log")) {
            if let Ok(number) = rest.parse::<u64>() {
                numbers.push(number);
            }
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

/// Counters exposed by the writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalStats {
    /// Entries appended
    pub appends: u64,
    /// fsync calls issued
    pub syncs: u64,
    /// Segment rotations
    pub rotations: u64,
    /// Compaction passes completed
    pub compactions: u64,
}

struct ActiveSegment {
    file: File,
    number: u64,
    bytes: u64,
    entries: u64,
}

impl ActiveSegment {
    fn create(dir: &Path, number: u64) -> Result<Self> {
        let path = segment_path(dir, number);
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        file.write_all(&SegmentHeader::new(number).to_bytes())?;
        Ok(ActiveSegment {
            file,
            number,
            bytes: SEGMENT_HEADER_SIZE as u64,
            entries: 0,
        })
    }

    fn open_append(dir: &Path, number: u64, entries: u64) -> Result<Self> {
        let path = segment_path(dir, number);
        let file = OpenOptions::new().append(true).open(&path)?;
        let bytes = file.metadata()?.len();
        Ok(ActiveSegment {
            file,
            number,
            bytes,
            entries,
        })
    }
}

struct WriterInner {
    active: ActiveSegment,
    appends_since_sync: u64,
    last_sync: Instant,
}

/// Append-only WAL writer with rotation, batched fsync, and compaction.
pub struct WalWriter {
    dir: PathBuf,
    config: WalConfig,
    inner: Mutex<WriterInner>,
    next_seq: AtomicU64,
    appends: AtomicU64,
    syncs: AtomicU64,
    rotations: AtomicU64,
    compactions: AtomicU64,
}

impl WalWriter {
    /// Open (or create) the WAL in `dir`, resuming sequence numbering
    /// from whatever is already on disk.
    pub fn open(dir: &Path, config: WalConfig) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let segments = list_segments(dir)?;
        let (active, next_seq) = match segments.last() {
            None => (ActiveSegment::create(dir, 1)?, 1),
            Some(&last) => {
                // Resume: scan the tail segment for its entry count and
                // the global max sequence.
                let entries = read_segment(dir, last)?;
                let max_seq = segments
                    .iter()
                    .take(segments.len() - 1)
                    .map(|&n| read_segment(dir, n))
                    .collect::<Result<Vec<_>>>()?
                    .into_iter()
                    .flatten()
                    .chain(entries.iter().cloned())
                    .map(|e| e.seq)
                    .max()
                    .unwrap_or(0);
                (
                    ActiveSegment::open_append(dir, last, entries.len() as u64)?,
                    max_seq + 1,
                )
            }
        };
        Ok(WalWriter {
            dir: dir.to_path_buf(),
            config,
            inner: Mutex::new(WriterInner {
                active,
                appends_since_sync: 0,
                last_sync: Instant::now(),
            }),
            next_seq: AtomicU64::new(next_seq),
            appends: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
        })
    }

    /// Append one entry; returns its assigned sequence number.
    pub fn append(&self, kind: OpKind, key: &[u8], value: Option<&[u8]>) -> Result<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let entry = WalEntry {
            seq,
            kind,
            key: key.to_vec(),
            value: value.map(|v| v.to_vec()),
        };
        let bytes = entry.to_bytes();

        let mut inner = self.inner.lock();
        inner.active.file.write_all(&bytes)?;
        inner.active.bytes += bytes.len() as u64;
        inner.active.entries += 1;
        inner.appends_since_sync += 1;
        self.appends.fetch_add(1, Ordering::Relaxed);

        if inner.appends_since_sync >= self.config.fsync_every
            || inner.last_sync.elapsed() >= self.config.fsync_interval
        {
            self.sync_locked(&mut inner)?;
        }
        if inner.active.bytes >= self.config.segment_bytes
            || inner.active.entries >= self.config.segment_entries
        {
            self.rotate_locked(&mut inner)?;
        }
        Ok(seq)
    }

    /// Force an fsync of the active segment.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.sync_locked(&mut inner)
    }

    fn sync_locked(&self, inner: &mut WriterInner) -> Result<()> {
        inner.active.file.sync_data()?;
        inner.appends_since_sync = 0;
        inner.last_sync = Instant::now();
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rotate_locked(&self, inner: &mut WriterInner) -> Result<()> {
        inner.active.file.sync_data()?;
        let next = inner.active.number + 1;
        debug!(target: "concord::wal", segment = next, "rotating WAL segment");
        inner.active = ActiveSegment::create(&self.dir, next)?;
        inner.appends_since_sync = 0;
        self.rotations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Coalesce the whole log to the latest state per key.
    ///
    /// Rotates the active segment, folds every entry into its final
    /// per-key state, writes that state into a fresh successor segment,
    /// syncs it, and only then removes the predecessors. Deleted keys
    /// vanish entirely: after a full fold the compacted segment *is* the
    /// complete history.
    pub fn compact(&self) -> Result<CompactionResult> {
        let mut inner = self.inner.lock();

        // Close out the active segment so the fold sees everything.
        inner.active.file.sync_data()?;
        let old_segments = list_segments(&self.dir)?;
        let entries = read_all(&self.dir)?;
        let before = entries.len();

        // Latest op per key wins; deletes drop the key.
        let mut latest: std::collections::BTreeMap<Vec<u8>, WalEntry> =
            std::collections::BTreeMap::new();
        for entry in entries {
            match entry.kind {
                OpKind::Put | OpKind::Update => {
                    latest.insert(entry.key.clone(), entry);
                }
                OpKind::Delete => {
                    latest.remove(&entry.key);
                }
                OpKind::TxnBegin | OpKind::TxnCommit | OpKind::TxnAbort => {}
            }
        }
        let mut survivors: Vec<WalEntry> = latest.into_values().collect();
        survivors.sort_by_key(|e| e.seq);

        // Write the compacted segment, then a fresh active one.
        let compacted_number = inner.active.number + 1;
        let mut compacted = ActiveSegment::create(&self.dir, compacted_number)?;
        for entry in &survivors {
            compacted.file.write_all(&entry.to_bytes())?;
        }
        compacted.file.sync_data()?;

        inner.active = ActiveSegment::create(&self.dir, compacted_number + 1)?;
        inner.appends_since_sync = 0;

        // Predecessors go only after the successor is durable.
        for number in old_segments {
            fs::remove_file(segment_path(&self.dir, number))?;
        }
        self.compactions.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "concord::wal",
            before,
            after = survivors.len(),
            "WAL compaction complete"
        );
        Ok(CompactionResult {
            entries_before: before,
            entries_after: survivors.len(),
        })
    }

    /// Writer counters.
    pub fn stats(&self) -> WalStats {
        WalStats {
            appends: self.appends.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        }
    }

    /// Next sequence number to be assigned.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    /// The WAL directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionResult {
    /// Entries across all segments before the fold
    pub entries_before: usize,
    /// Entries in the compacted segment
    pub entries_after: usize,
}

/// Read every entry of one segment.
///
/// A torn entry at the tail ends the scan without error (a crash mid
/// append leaves exactly this); a CRC mismatch is `Corruption`.
pub fn read_segment(dir: &Path, segment_number: u64) -> Result<Vec<WalEntry>> {
    let path = segment_path(dir, segment_number);
    let mut file = File::open(&path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let header = SegmentHeader::from_bytes(&buf)?;
    if header.segment_number != segment_number {
        return Err(Error::Corruption(format!(
            "segment number mismatch: file says {}, name says {}",
            header.segment_number, segment_number
        )));
    }
    let mut entries = Vec::new();
    let mut offset = SEGMENT_HEADER_SIZE;
    while offset < buf.len() {
        match WalEntry::from_bytes(&buf[offset..])? {
            Some((entry, consumed)) => {
                entries.push(entry);
                offset += consumed;
            }
            None => {
                warn!(
                    target: "concord::wal",
                    segment = segment_number,
                    offset,
                    "torn WAL entry at segment tail, stopping scan"
                );
                break;
            }
        }
    }
    Ok(entries)
}

/// Read every entry across all segments, in sequence order.
pub fn read_all(dir: &Path) -> Result<Vec<WalEntry>> {
    let mut entries = Vec::new();
    for number in list_segments(dir)? {
        entries.extend(read_segment(dir, number)?);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn test_config() -> WalConfig {
        WalConfig {
            segment_bytes: 1024 * 1024,
            segment_entries: 1000,
            fsync_every: 100,
            fsync_interval: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempdir().unwrap();
        let wal = WalWriter::open(dir.path(), test_config()).unwrap();
        for i in 0..10 {
            let seq = wal
                .append(OpKind::Put, format!("k{}", i).as_bytes(), Some(b"v"))
                .unwrap();
            assert_eq!(seq, i + 1);
        }
        wal.sync().unwrap();

        let entries = read_all(dir.path()).unwrap();
        assert_eq!(entries.len(), 10);
        assert!(entries.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn test_sequence_resumes_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let wal = WalWriter::open(dir.path(), test_config()).unwrap();
            for _ in 0..5 {
                wal.append(OpKind::Put, b"k", Some(b"v")).unwrap();
            }
            wal.sync().unwrap();
        }
        let wal = WalWriter::open(dir.path(), test_config()).unwrap();
        let seq = wal.append(OpKind::Put, b"k", Some(b"v")).unwrap();
        assert_eq!(seq, 6);
    }

    #[test]
    fn test_rotation_on_entry_threshold() {
        let dir = tempdir().unwrap();
        let config = WalConfig {
            segment_entries: 10,
            ..test_config()
        };
        let wal = WalWriter::open(dir.path(), config).unwrap();
        for i in 0..35 {
            wal.append(OpKind::Put, format!("k{}", i).as_bytes(), Some(b"v"))
                .unwrap();
        }
        wal.sync().unwrap();
        assert!(wal.stats().rotations >= 3);
        assert!(list_segments(dir.path()).unwrap().len() >= 3);
        assert_eq!(read_all(dir.path()).unwrap().len(), 35);
    }

    #[test]
    fn test_fsync_batching() {
        let dir = tempdir().unwrap();
        let config = WalConfig {
            fsync_every: 10,
            ..test_config()
        };
        let wal = WalWriter::open(dir.path(), config).unwrap();
        for _ in 0..25 {
            wal.append(OpKind::Put, b"k", Some(b"v")).unwrap();
        }
        // 25 appends at batch size 10: two batched syncs.
        assert_eq!(wal.stats().syncs, 2);
        wal.sync().unwrap();
        assert_eq!(wal.stats().syncs, 3);
    }

    #[test]
    fn test_torn_tail_tolerated() {
        let dir = tempdir().unwrap();
        {
            let wal = WalWriter::open(dir.path(), test_config()).unwrap();
            for i in 0..5 {
                wal.append(OpKind::Put, format!("k{}", i).as_bytes(), Some(b"v"))
                    .unwrap();
            }
            wal.sync().unwrap();
        }
        // Chop bytes off the tail to simulate a crash mid-append.
        let path = segment_path(dir.path(), 1);
        let len = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        let entries = read_all(dir.path()).unwrap();
        assert_eq!(entries.len(), 4);
    }

    #[test]
    fn test_corrupt_middle_entry_is_fatal() {
        let dir = tempdir().unwrap();
        {
            let wal = WalWriter::open(dir.path(), test_config()).unwrap();
            for i in 0..5 {
                wal.append(OpKind::Put, format!("key-{}", i).as_bytes(), Some(b"value"))
                    .unwrap();
            }
            wal.sync().unwrap();
        }
        let path = segment_path(dir.path(), 1);
        let mut bytes = fs::read(&path).unwrap();
        // Flip a bit inside the second entry's value region.
        let target = SEGMENT_HEADER_SIZE + 40;
        bytes[target] ^= 0x10;
        fs::write(&path, &bytes).unwrap();

        let err = read_all(dir.path()).unwrap_err();
        assert_eq!(err.kind(), concord_core::ErrorKind::Corruption);
    }

    #[test]
    fn test_compaction_folds_to_latest_state() {
        let dir = tempdir().unwrap();
        let wal = WalWriter::open(dir.path(), test_config()).unwrap();
        wal.append(OpKind::Put, b"a", Some(b"1")).unwrap();
        wal.append(OpKind::Put, b"a", Some(b"2")).unwrap();
        wal.append(OpKind::Put, b"b", Some(b"x")).unwrap();
        wal.append(OpKind::Delete, b"b", None).unwrap();
        wal.append(OpKind::Put, b"c", Some(b"y")).unwrap();

        let result = wal.compact().unwrap();
        assert_eq!(result.entries_before, 5);
        assert_eq!(result.entries_after, 2);

        let entries = read_all(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        let keys: Vec<&[u8]> = entries.iter().map(|e| e.key.as_slice()).collect();
        assert_eq!(keys, vec![b"a".as_slice(), b"c".as_slice()]);
        // Latest value for "a" survived, and seq order is preserved.
        assert_eq!(entries[0].value.as_deref(), Some(b"2".as_slice()));
        assert!(entries[0].seq < entries[1].seq);

        // The writer keeps appending after compaction.
        let seq = wal.append(OpKind::Put, b"d", Some(b"z")).unwrap();
        assert!(seq > entries[1].seq);
        assert_eq!(read_all(dir.path()).unwrap().len(), 3);
    }
}

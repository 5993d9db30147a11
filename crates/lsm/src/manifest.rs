//! Manifest: the authoritative list of live SSTables.
//!
//! Every structural change, flush or compaction, writes a complete new
//! manifest version: serialize, checksum, write to a temp file, fsync,
//! rename into `MANIFEST-NNNNNN`, then repoint `CURRENT` the same way.
//! A crash at any step leaves either the old version or the new one
//! fully in place, never a torn manifest.
//!
//! The manifest also records `last_flushed_seq`, the WAL watermark below
//! which every entry is already durable in an SSTable; recovery replays
//! only entries above it.

use concord_core::error::{Error, Result};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Metadata for one live SSTable file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// File number; the on-disk name is `{number:06}.sst`
    pub number: u64,
    /// Level the file lives in
    pub level: u32,
    /// Smallest key in the file
    pub smallest: Vec<u8>,
    /// Largest key in the file
    pub largest: Vec<u8>,
    /// Record count
    pub entry_count: u64,
    /// Smallest sequence
    pub min_seq: u64,
    /// Largest sequence
    pub max_seq: u64,
}

impl FileMeta {
    /// Whether this file's key range intersects `[smallest, largest]`.
    pub fn overlaps(&self, smallest: &[u8], largest: &[u8]) -> bool {
        self.smallest.as_slice() <= largest && self.largest.as_slice() >= smallest
    }
}

/// SSTable file path for a file number.
pub fn sstable_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{:06}.sst", number))
}

/// Authoritative LSM state, persisted atomically per edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Manifest version, bumped on every save
    pub version: u64,
    /// Next SSTable file number to hand out
    pub next_file_number: u64,
    /// WAL sequences at or below this are durable in SSTables
    pub last_flushed_seq: u64,
    /// Live files per level; index 0 is L0
    pub levels: Vec<Vec<FileMeta>>,
}

impl Manifest {
    /// Fresh manifest for an empty tree.
    pub fn new() -> Self {
        Manifest {
            version: 0,
            next_file_number: 1,
            last_flushed_seq: 0,
            levels: vec![Vec::new()],
        }
    }

    /// Allocate an SSTable file number.
    pub fn allocate_file_number(&mut self) -> u64 {
        let n = self.next_file_number;
        self.next_file_number += 1;
        n
    }

    /// Every live file, across all levels.
    pub fn all_files(&self) -> impl Iterator<Item = &FileMeta> {
        self.levels.iter().flatten()
    }

    /// Add a file, growing the level vector as needed.
    pub fn add_file(&mut self, meta: FileMeta) {
        let level = meta.level as usize;
        while self.levels.len() <= level {
            self.levels.push(Vec::new());
        }
        self.levels[level].push(meta);
        // Non-overlapping levels stay sorted by key range.
        if level > 0 {
            self.levels[level].sort_by(|a, b| a.smallest.cmp(&b.smallest));
        }
    }

    /// Remove files by number.
    pub fn remove_files(&mut self, numbers: &[u64]) {
        for level in &mut self.levels {
            level.retain(|f| !numbers.contains(&f.number));
        }
    }

    fn manifest_path(dir: &Path, version: u64) -> PathBuf {
        dir.join(format!("MANIFEST-{:06}", version))
    }

    /// Persist a new version: write new, fsync, rename, repoint CURRENT.
    pub fn save(&mut self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        self.version += 1;

        let mut payload = bincode::serialize(self)?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        payload.extend_from_slice(&hasher.finalize().to_le_bytes());

        let path = Self::manifest_path(dir, self.version);
        let tmp = path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        let current_tmp = dir.join("CURRENT.tmp");
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&current_tmp)?;
            file.write_all(
                path.file_name()
                    .ok_or_else(|| Error::InvalidState("manifest path has no file name".into()))?
                    .to_string_lossy()
                    .as_bytes(),
            )?;
            file.sync_all()?;
        }
        fs::rename(&current_tmp, dir.join("CURRENT"))?;

        // Previous versions are garbage once CURRENT moved on.
        if self.version > 1 {
            let _ = fs::remove_file(Self::manifest_path(dir, self.version - 1));
        }
        Ok(())
    }

    /// Load the manifest CURRENT points at, or a fresh one if none exists.
    pub fn load(dir: &Path) -> Result<Self> {
        let current = dir.join("CURRENT");
        if !current.exists() {
            return Ok(Manifest::new());
        }
        let name = fs::read_to_string(&current)?;
        let path = dir.join(name.trim());
        let bytes = fs::read(&path)?;
        if bytes.len() < 4 {
            return Err(Error::Corruption("truncated manifest".into()));
        }
        let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes(crc_bytes.try_into().expect("sliced to width"));
        let mut hasher = Hasher::new();
        hasher.update(payload);
        let computed = hasher.finalize();
        if stored != computed {
            return Err(Error::Corruption(format!(
                "manifest checksum mismatch: stored {:08x}, computed {:08x}",
                stored, computed
            )));
        }
        Ok(bincode::deserialize(payload)?)
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn meta(number: u64, level: u32, smallest: &str, largest: &str) -> FileMeta {
        FileMeta {
            number,
            level,
            smallest: smallest.as_bytes().to_vec(),
            largest: largest.as_bytes().to_vec(),
            entry_count: 10,
            min_seq: 1,
            max_seq: 10,
        }
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let mut manifest = Manifest::new();
        manifest.add_file(meta(1, 0, "a", "m"));
        manifest.add_file(meta(2, 1, "a", "f"));
        manifest.last_flushed_seq = 42;
        manifest.save(dir.path()).unwrap();

        let loaded = Manifest::load(dir.path()).unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.last_flushed_seq, 42);
    }

    #[test]
    fn test_missing_manifest_is_fresh() {
        let dir = tempdir().unwrap();
        let manifest = Manifest::load(dir.path()).unwrap();
        assert_eq!(manifest.version, 0);
        assert_eq!(manifest.all_files().count(), 0);
    }

    #[test]
    fn test_each_save_is_a_new_version() {
        let dir = tempdir().unwrap();
        let mut manifest = Manifest::new();
        manifest.save(dir.path()).unwrap();
        manifest.add_file(meta(1, 0, "a", "z"));
        manifest.save(dir.path()).unwrap();
        assert_eq!(manifest.version, 2);

        let loaded = Manifest::load(dir.path()).unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.all_files().count(), 1);
    }

    #[test]
    fn test_corrupt_manifest_rejected() {
        let dir = tempdir().unwrap();
        let mut manifest = Manifest::new();
        manifest.add_file(meta(1, 0, "a", "z"));
        manifest.save(dir.path()).unwrap();

        let name = fs::read_to_string(dir.path().join("CURRENT")).unwrap();
        let path = dir.path().join(name.trim());
        let mut bytes = fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(Manifest::load(dir.path()).is_err());
    }

    #[test]
    fn test_overlap_predicate() {
        let file = meta(1, 1, "f", "m");
        assert!(file.overlaps(b"a", b"g"));
        assert!(file.overlaps(b"g", b"h"));
        assert!(file.overlaps(b"m", b"z"));
        assert!(!file.overlaps(b"a", b"e"));
        assert!(!file.overlaps(b"n", b"z"));
    }

    #[test]
    fn test_remove_files() {
        let mut manifest = Manifest::new();
        manifest.add_file(meta(1, 0, "a", "b"));
        manifest.add_file(meta(2, 0, "c", "d"));
        manifest.add_file(meta(3, 1, "a", "d"));
        manifest.remove_files(&[1, 3]);
        assert_eq!(manifest.all_files().count(), 1);
        assert_eq!(manifest.levels[0][0].number, 2);
    }
}

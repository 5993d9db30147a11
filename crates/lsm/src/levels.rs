//! Level manager: open readers over the manifest's live files.
//!
//! L0 files overlap (each is one flushed memtable), so a lookup must
//! consult every L0 candidate and take the highest-sequence version.
//! L1 and deeper are non-overlapping and size-tiered; at most one file
//! per level can hold any given key, and levels are probed top down:
//! a key found at level N shadows anything deeper.

use crate::manifest::{sstable_path, FileMeta, Manifest};
use crate::sstable::{SSTableReader, SstEntry};
use concord_core::config::LsmConfig;
use concord_core::error::Result;
use std::path::Path;
use std::sync::Arc;

/// One live file: manifest metadata plus an open reader.
#[derive(Clone)]
pub struct SstFile {
    /// Manifest metadata
    pub meta: FileMeta,
    /// Open, validated reader
    pub reader: Arc<SSTableReader>,
}

/// Inputs chosen for one compaction.
#[derive(Debug, Clone)]
pub struct CompactionJob {
    /// Source level
    pub level: u32,
    /// File numbers from the source level
    pub inputs: Vec<u64>,
    /// Overlapping file numbers from the target level
    pub next_level_inputs: Vec<u64>,
}

/// In-memory view of the level structure.
pub struct LevelState {
    levels: Vec<Vec<SstFile>>,
}

impl LevelState {
    /// Open a reader for every file the manifest lists.
    pub fn from_manifest(sst_dir: &Path, manifest: &Manifest) -> Result<Self> {
        let mut levels: Vec<Vec<SstFile>> = Vec::new();
        for metas in &manifest.levels {
            let mut files = Vec::with_capacity(metas.len());
            for meta in metas {
                let reader = Arc::new(SSTableReader::open(&sstable_path(sst_dir, meta.number))?);
                files.push(SstFile {
                    meta: meta.clone(),
                    reader,
                });
            }
            levels.push(files);
        }
        if levels.is_empty() {
            levels.push(Vec::new());
        }
        Ok(LevelState { levels })
    }

    /// Register a new file.
    pub fn add_file(&mut self, file: SstFile) {
        let level = file.meta.level as usize;
        while self.levels.len() <= level {
            self.levels.push(Vec::new());
        }
        self.levels[level].push(file);
        if level > 0 {
            self.levels[level].sort_by(|a, b| a.meta.smallest.cmp(&b.meta.smallest));
        }
    }

    /// Drop files by number; returns their metadata.
    pub fn remove_files(&mut self, numbers: &[u64]) -> Vec<FileMeta> {
        let mut removed = Vec::new();
        for level in &mut self.levels {
            level.retain(|f| {
                if numbers.contains(&f.meta.number) {
                    removed.push(f.meta.clone());
                    false
                } else {
                    true
                }
            });
        }
        removed
    }

    /// Files at a level (L0 unordered, deeper levels sorted by range).
    pub fn level(&self, level: usize) -> &[SstFile] {
        self.levels.get(level).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Number of levels with at least one file.
    pub fn deepest_level(&self) -> usize {
        self.levels
            .iter()
            .rposition(|files| !files.is_empty())
            .unwrap_or(0)
    }

    /// Point lookup across the level structure.
    pub fn get(&self, key: &[u8]) -> Result<Option<SstEntry>> {
        // L0: overlapping files; the highest sequence wins.
        let mut best: Option<SstEntry> = None;
        for file in self.level(0) {
            if !file.meta.overlaps(key, key) {
                continue;
            }
            if let Some(entry) = file.reader.get(key)? {
                if best.as_ref().map_or(true, |b| entry.seq > b.seq) {
                    best = Some(entry);
                }
            }
        }
        if best.is_some() {
            return Ok(best);
        }
        // L1+: at most one candidate per level, probed top down.
        for level in self.levels.iter().skip(1) {
            let slot = level.partition_point(|f| f.meta.smallest.as_slice() <= key);
            if slot == 0 {
                continue;
            }
            let file = &level[slot - 1];
            if file.meta.largest.as_slice() < key {
                continue;
            }
            if let Some(entry) = file.reader.get(key)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Pick the next compaction, if any threshold is crossed.
    ///
    /// L0 compacts when its file count reaches `level0_files`, merging
    /// every L0 file with the overlapping slice of L1. Deeper levels
    /// compact one file (the oldest) with its overlap set at the next
    /// level when the level's file count exceeds its tier budget.
    pub fn pick_compaction(&self, config: &LsmConfig) -> Option<CompactionJob> {
        if self.level(0).len() >= config.level0_files {
            let inputs: Vec<u64> = self.level(0).iter().map(|f| f.meta.number).collect();
            let (smallest, largest) = self.key_span(0)?;
            let next_level_inputs = self
                .level(1)
                .iter()
                .filter(|f| f.meta.overlaps(&smallest, &largest))
                .map(|f| f.meta.number)
                .collect();
            return Some(CompactionJob {
                level: 0,
                inputs,
                next_level_inputs,
            });
        }
        let mut budget = config.level0_files as u64;
        for (level, files) in self.levels.iter().enumerate().skip(1) {
            budget = budget.saturating_mul(config.level_size_multiplier);
            if (files.len() as u64) <= budget {
                continue;
            }
            let victim = files.iter().min_by_key(|f| f.meta.number)?;
            let next_level_inputs = self
                .level(level + 1)
                .iter()
                .filter(|f| f.meta.overlaps(&victim.meta.smallest, &victim.meta.largest))
                .map(|f| f.meta.number)
                .collect();
            return Some(CompactionJob {
                level: level as u32,
                inputs: vec![victim.meta.number],
                next_level_inputs,
            });
        }
        None
    }

    fn key_span(&self, level: usize) -> Option<(Vec<u8>, Vec<u8>)> {
        let files = self.level(level);
        let smallest = files.iter().map(|f| f.meta.smallest.clone()).min()?;
        let largest = files.iter().map(|f| f.meta.largest.clone()).max()?;
        Some((smallest, largest))
    }

    /// Every live entry, newest version per key, in key order.
    ///
    /// Tombstones are folded away; this is the "what does the disk hold"
    /// view used by full scans and state serialization.
    pub fn merged_scan(&self) -> Result<Vec<SstEntry>> {
        use std::collections::BTreeMap;
        let mut merged: BTreeMap<Vec<u8>, SstEntry> = BTreeMap::new();
        // Deepest (oldest) first, so newer levels overwrite.
        for level in self.levels.iter().rev() {
            // Within L0, older file numbers first.
            let mut ordered: Vec<&SstFile> = level.iter().collect();
            ordered.sort_by_key(|f| f.meta.number);
            for file in ordered {
                for entry in file.reader.scan()? {
                    merged.insert(entry.key.clone(), entry);
                }
            }
        }
        Ok(merged
            .into_values()
            .filter(|e| e.value.is_some())
            .collect())
    }
}

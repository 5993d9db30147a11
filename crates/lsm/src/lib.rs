//! LSM storage path for ConcordKV
//!
//! A log-structured merge tree behind the same engine contract as the
//! in-memory engines:
//!
//! - MemTables: one active skiplist plus frozen tables awaiting flush
//! - SSTables: packed 24-byte block headers, index block, bloom block,
//!   64-byte footer written last, every CRC computed with its field
//!   zeroed
//! - Levels: overlapping L0, size-tiered non-overlapping L1+
//! - Manifest: authoritative file list, replaced atomically per edit
//!   (write new, fsync, rename)
//! - Compaction: worker threads over a task queue; shutdown joins with
//!   no tree hold
//! - WAL integration: every mutation is appended before it becomes
//!   visible in a memtable; recovery replays the tail past the flushed
//!   watermark
//!
//! Lock order is fixed throughout: tree level state, then the memtable
//! manager, then the manifest. Destroy never calls `close()`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compaction;
pub mod levels;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod tree;

pub use compaction::{CompactionScheduler, LsmTask};
pub use levels::{CompactionJob, LevelState, SstFile};
pub use manifest::{sstable_path, FileMeta, Manifest};
pub use memtable::{MemTable, MemTableManager, MemValue};
pub use sstable::{
    write_sstable, Footer, SSTableReader, SstEntry, FOOTER_SIZE, SSTABLE_FORMAT_VERSION,
    SSTABLE_MAGIC,
};
pub use tree::LsmTree;

//! Storage layer for ConcordKV
//!
//! This crate implements the pluggable in-memory side of the storage
//! core:
//!
//! - Arena allocator: bump allocation in reusable blocks with a block
//!   cache and detailed statistics
//! - Four engines behind the uniform contract: Array, Hash (segmented
//!   locks), RBTree, B+Tree (hot-node cache, adaptive node sizing)
//! - Policy-pluggable cache: LRU / LFU / FIFO / Random / CLOCK / ARC
//!   with an atomic-counter read path
//! - Bloom-filter library with selectable hash families and serializable
//!   blocks
//! - The packed 24-byte block header shared with the SSTable format
//!
//! Everything here is thread-safe for concurrent readers and writers;
//! no read path acquires a writer hold.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod block;
pub mod bloom;
pub mod cache;
pub mod engine;
pub mod factory;

pub use arena::{Arena, ArenaStats};
pub use block::{
    block_crc, open_block, seal_block, BlockHeader, BlockType, BLOCK_HEADER_SIZE,
};
pub use bloom::{BloomFilter, BloomHashKind, BloomVariant};
pub use cache::{Cache, CacheStats};
pub use engine::{ArrayEngine, BPlusTreeEngine, BTreeStats, HashEngine, RBTreeEngine};
pub use factory::create_engine;

//! Bump-pointer arena allocator.
//!
//! Fast, low-fragmentation allocation for short-lived nodes and key/value
//! staging during bulk loads. Allocations are never individually freed;
//! pointers stay valid until the arena is dropped. On block exhaustion the
//! arena pops a suitably sized block from its reuse cache or asks the
//! system allocator for a new one. Oversized requests get a dedicated
//! block.
//!
//! # Thread modes
//!
//! - `MultiThread`: every mutation takes the writer hold; `stats()` takes
//!   the reader hold. There is no read-to-write upgrade anywhere.
//! - `SingleThread`: same structure, intended for arenas owned by one
//!   thread; the detailed histograms are still maintained under the hold
//!   so `stats()` is always coherent.
//!
//! # Failure
//!
//! `alloc` returns `None` when the system allocator refuses memory. It
//! never aborts.

use concord_core::config::{ArenaConfig, ThreadMode};
use concord_core::error::{Error, Result};
use parking_lot::RwLock;
use std::ptr::NonNull;

/// Number of power-of-two size-histogram buckets (2^0 ..= 2^31, then oversize).
const SIZE_BUCKETS: usize = 33;

/// Tracked alignments for the alignment histogram.
const ALIGN_CLASSES: [usize; 8] = [1, 2, 4, 8, 16, 32, 64, 128];

/// Point-in-time allocator statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Total successful allocations
    pub total_allocations: u64,
    /// Bytes handed out (requested sizes)
    pub bytes_allocated: u64,
    /// Bytes lost to alignment padding and retired block tails
    pub bytes_wasted: u64,
    /// High-water mark of `current_usage`
    pub peak_usage: u64,
    /// Bytes currently reachable from live blocks
    pub current_usage: u64,
    /// Blocks requested from the system allocator
    pub block_allocations: u64,
    /// Blocks served from the reuse cache
    pub block_reuses: u64,
    /// Power-of-two request-size histogram (bucket i counts sizes in
    /// (2^(i-1), 2^i]); last bucket collects oversize requests
    pub size_histogram: Vec<u64>,
    /// Request counts per alignment class (1, 2, 4, ... 128)
    pub alignment_histogram: Vec<u64>,
}

struct Block {
    buf: Box<[u8]>,
    used: usize,
}

impl Block {
    fn with_capacity(capacity: usize) -> Option<Block> {
        // A zeroed Vec keeps this safe; the allocator refusing memory
        // surfaces as a capacity shortfall rather than an abort only when
        // we go through try_reserve.
        let mut v: Vec<u8> = Vec::new();
        v.try_reserve_exact(capacity).ok()?;
        v.resize(capacity, 0);
        Some(Block {
            buf: v.into_boxed_slice(),
            used: 0,
        })
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.used
    }
}

struct ArenaInner {
    blocks: Vec<Block>,
    cache: Vec<Box<[u8]>>,
    stats: ArenaStats,
}

/// Bump allocator over reusable blocks.
///
/// Handed-out pointers are valid until the arena is dropped; the arena is
/// the exclusive owner of all backing memory.
pub struct Arena {
    config: ArenaConfig,
    inner: RwLock<ArenaInner>,
}

// Pointers handed out reference heap blocks owned by `inner`; the boxes
// never move their heap storage, so sharing the arena itself is sound.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Create an arena from config. `InvalidArg` on nonsensical values.
    pub fn new(config: ArenaConfig) -> Result<Self> {
        if config.block_size == 0 {
            return Err(Error::InvalidArg("arena.block_size must be > 0".into()));
        }
        if config.enable_block_cache && config.max_cached_blocks == 0 {
            return Err(Error::InvalidArg(
                "arena.max_cached_blocks must be > 0 when the block cache is enabled".into(),
            ));
        }
        Ok(Arena {
            config,
            inner: RwLock::new(ArenaInner {
                blocks: Vec::new(),
                cache: Vec::new(),
                stats: ArenaStats {
                    size_histogram: vec![0; SIZE_BUCKETS],
                    alignment_histogram: vec![0; ALIGN_CLASSES.len()],
                    ..ArenaStats::default()
                },
            }),
        })
    }

    /// Allocate `n` bytes with no alignment requirement beyond 1.
    ///
    /// Returns `None` when the system allocator refuses memory.
    pub fn alloc(&self, n: usize) -> Option<NonNull<u8>> {
        self.alloc_aligned(n, 1)
    }

    /// Allocate `n` bytes aligned to `align` (a power of two).
    pub fn alloc_aligned(&self, n: usize, align: usize) -> Option<NonNull<u8>> {
        if n == 0 || !align.is_power_of_two() {
            return None;
        }
        let mut inner = self.inner.write();
        let ptr = Self::bump(&self.config, &mut inner, n, align)?;
        let stats = &mut inner.stats;
        stats.total_allocations += 1;
        stats.bytes_allocated += n as u64;
        if self.config.collect_detailed_stats {
            stats.size_histogram[size_bucket(n)] += 1;
            if let Some(i) = ALIGN_CLASSES.iter().position(|&a| a == align) {
                stats.alignment_histogram[i] += 1;
            }
        }
        Some(ptr)
    }

    /// Copy `data` into the arena and return its address.
    pub fn alloc_bytes(&self, data: &[u8]) -> Option<NonNull<u8>> {
        let ptr = self.alloc(data.len().max(1))?;
        if !data.is_empty() {
            // The region was just carved out under the writer hold and is
            // not reachable by any other caller.
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len());
            }
        }
        Some(ptr)
    }

    fn bump(
        config: &ArenaConfig,
        inner: &mut ArenaInner,
        n: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        // Oversized requests get a dedicated block and bypass the bump path.
        if n + align > config.block_size {
            let mut block = Block::with_capacity(n + align - 1)?;
            let base = block.buf.as_mut_ptr();
            let offset = padding_for(base as usize, align);
            block.used = block.buf.len();
            inner.stats.block_allocations += 1;
            inner.stats.current_usage += block.buf.len() as u64;
            inner.stats.peak_usage = inner.stats.peak_usage.max(inner.stats.current_usage);
            inner.stats.bytes_wasted += (block.buf.len() - n) as u64;
            let ptr = unsafe { NonNull::new_unchecked(base.add(offset)) };
            inner.blocks.push(block);
            return Some(ptr);
        }

        // Try the current block first.
        if let Some(ptr) = Self::carve(inner, n, align) {
            return Some(ptr);
        }

        // Current block exhausted: retire its tail as waste and attach a
        // fresh block, reusing a cached one when available.
        if let Some(last) = inner.blocks.last() {
            inner.stats.bytes_wasted += last.remaining() as u64;
        }
        let block = match inner.cache.pop() {
            Some(buf) => {
                inner.stats.block_reuses += 1;
                Block { buf, used: 0 }
            }
            None => {
                inner.stats.block_allocations += 1;
                Block::with_capacity(config.block_size)?
            }
        };
        inner.stats.current_usage += block.buf.len() as u64;
        inner.stats.peak_usage = inner.stats.peak_usage.max(inner.stats.current_usage);
        inner.blocks.push(block);
        Self::carve(inner, n, align)
    }

    fn carve(inner: &mut ArenaInner, n: usize, align: usize) -> Option<NonNull<u8>> {
        let waste;
        let ptr;
        {
            let block = inner.blocks.last_mut()?;
            let base = block.buf.as_mut_ptr() as usize;
            let pad = padding_for(base + block.used, align);
            if block.used + pad + n > block.buf.len() {
                return None;
            }
            let offset = block.used + pad;
            block.used = offset + n;
            waste = pad as u64;
            ptr = unsafe { NonNull::new_unchecked(block.buf.as_mut_ptr().add(offset)) };
        }
        inner.stats.bytes_wasted += waste;
        Some(ptr)
    }

    /// Return fully unused blocks to the block cache.
    ///
    /// Only blocks with no live allocations are eligible, so handed-out
    /// pointers stay valid. Returns the number of bytes reclaimed.
    pub fn compact(&self) -> u64 {
        let mut inner = self.inner.write();
        let mut reclaimed = 0u64;
        let cache_enabled = self.config.enable_block_cache;
        let max_cached = self.config.max_cached_blocks;
        let block_size = self.config.block_size;
        let mut i = 0;
        while i < inner.blocks.len() {
            if inner.blocks[i].used == 0 {
                let block = inner.blocks.remove(i);
                reclaimed += block.buf.len() as u64;
                inner.stats.current_usage -= block.buf.len() as u64;
                if cache_enabled && inner.cache.len() < max_cached && block.buf.len() == block_size
                {
                    inner.cache.push(block.buf);
                }
            } else {
                i += 1;
            }
        }
        reclaimed
    }

    /// Drop all allocations at once, keeping blocks for reuse.
    ///
    /// Invalidates every pointer previously returned; callers own that
    /// discipline, which is why this requires `&mut self`.
    pub fn reset(&mut self) {
        let inner = self.inner.get_mut();
        for block in &mut inner.blocks {
            block.used = 0;
        }
    }

    /// Snapshot of allocator statistics. Reader hold only.
    pub fn stats(&self) -> ArenaStats {
        self.inner.read().stats.clone()
    }

    /// Configured thread mode.
    pub fn thread_mode(&self) -> ThreadMode {
        self.config.thread_mode
    }
}

fn padding_for(addr: usize, align: usize) -> usize {
    let rem = addr & (align - 1);
    if rem == 0 {
        0
    } else {
        align - rem
    }
}

fn size_bucket(n: usize) -> usize {
    let exp = usize::BITS - n.next_power_of_two().leading_zeros() - 1;
    (exp as usize).min(SIZE_BUCKETS - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_arena() -> Arena {
        Arena::new(ArenaConfig {
            block_size: 256,
            collect_detailed_stats: true,
            ..ArenaConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_zero_block_size() {
        let cfg = ArenaConfig {
            block_size: 0,
            ..ArenaConfig::default()
        };
        assert!(Arena::new(cfg).is_err());
    }

    #[test]
    fn test_alloc_roundtrip() {
        let arena = small_arena();
        let ptr = arena.alloc_bytes(b"hello arena").unwrap();
        let read = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 11) };
        assert_eq!(read, b"hello arena");
    }

    #[test]
    fn test_alloc_zero_is_absent() {
        let arena = small_arena();
        assert!(arena.alloc(0).is_none());
    }

    #[test]
    fn test_alignment() {
        let arena = small_arena();
        for align in [1usize, 2, 4, 8, 16, 64] {
            let ptr = arena.alloc_aligned(10, align).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0);
        }
        // Non-power-of-two alignment is an absent handle, not a panic
        assert!(arena.alloc_aligned(10, 3).is_none());
    }

    #[test]
    fn test_pointers_survive_block_growth() {
        let arena = small_arena();
        let first = arena.alloc_bytes(b"first").unwrap();
        // Force several new blocks
        for _ in 0..64 {
            arena.alloc(100).unwrap();
        }
        let read = unsafe { std::slice::from_raw_parts(first.as_ptr(), 5) };
        assert_eq!(read, b"first");
    }

    #[test]
    fn test_oversized_request_gets_dedicated_block() {
        let arena = small_arena();
        let ptr = arena.alloc(4096).unwrap();
        assert!(!ptr.as_ptr().is_null());
        let stats = arena.stats();
        assert_eq!(stats.total_allocations, 1);
        assert!(stats.current_usage >= 4096);
    }

    #[test]
    fn test_stats_track_usage_and_peak() {
        let arena = small_arena();
        arena.alloc(64).unwrap();
        arena.alloc(64).unwrap();
        let stats = arena.stats();
        assert_eq!(stats.total_allocations, 2);
        assert_eq!(stats.bytes_allocated, 128);
        assert!(stats.peak_usage >= 256);
        assert_eq!(stats.block_allocations, 1);
    }

    #[test]
    fn test_size_histogram_buckets() {
        let arena = small_arena();
        arena.alloc(1).unwrap(); // bucket 0
        arena.alloc(2).unwrap(); // bucket 1
        arena.alloc(100).unwrap(); // rounds to 128 -> bucket 7
        let stats = arena.stats();
        assert_eq!(stats.size_histogram[0], 1);
        assert_eq!(stats.size_histogram[1], 1);
        assert_eq!(stats.size_histogram[7], 1);
    }

    #[test]
    fn test_reset_and_compact_reclaim() {
        let mut arena = small_arena();
        for _ in 0..8 {
            arena.alloc(200).unwrap();
        }
        let before = arena.stats().current_usage;
        assert!(before >= 8 * 200);
        arena.reset();
        let reclaimed = arena.compact();
        assert!(reclaimed > 0);
        let stats = arena.stats();
        assert!(stats.current_usage < before);
        // Next allocations reuse cached blocks
        arena.alloc(200).unwrap();
        assert!(arena.stats().block_reuses > 0);
    }

    #[test]
    fn test_concurrent_alloc() {
        use std::sync::Arc;
        let arena = Arc::new(
            Arena::new(ArenaConfig {
                block_size: 4096,
                thread_mode: ThreadMode::MultiThread,
                ..ArenaConfig::default()
            })
            .unwrap(),
        );
        let mut handles = Vec::new();
        for t in 0..4 {
            let arena = Arc::clone(&arena);
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    let data = format!("thread-{}-{}", t, i);
                    arena.alloc_bytes(data.as_bytes()).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(arena.stats().total_allocations, 2000);
    }
}

//! Segmented locking.
//!
//! An N-way array of reader-writer locks, addressed by key hash: keys
//! that hash to different segments never contend. The hash engine and
//! the distributed coordinator's registries use this shape.
//!
//! # The lock-upgrade ban
//!
//! No code path in this workspace releases a read guard in order to
//! take a write guard within the same logical operation. An operation
//! that reads and might mutate either takes the write guard up front or
//! defers the mutation (atomics, touch queues) to a later write path.
//! Guards release on every exit path by construction: they are RAII
//! values, and nothing here leaks one.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use xxhash_rust::xxh64::xxh64;

/// N-way segmented reader-writer lock over per-segment state.
pub struct SegmentedLock<T> {
    segments: Vec<RwLock<T>>,
}

impl<T> SegmentedLock<T> {
    /// Build with `segments` slots initialized by `init`.
    ///
    /// The segment count is clamped to at least 1.
    pub fn with(segments: usize, mut init: impl FnMut() -> T) -> Self {
        let n = segments.max(1);
        SegmentedLock {
            segments: (0..n).map(|_| RwLock::new(init())).collect(),
        }
    }

    /// Number of segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Which segment a key belongs to.
    pub fn segment_of(&self, key: &[u8]) -> usize {
        (xxh64(key, 0) >> 48) as usize % self.segments.len()
    }

    /// Reader hold on the key's segment.
    pub fn read(&self, key: &[u8]) -> RwLockReadGuard<'_, T> {
        self.segments[self.segment_of(key)].read()
    }

    /// Writer hold on the key's segment.
    pub fn write(&self, key: &[u8]) -> RwLockWriteGuard<'_, T> {
        self.segments[self.segment_of(key)].write()
    }

    /// Reader hold on a segment by index (for iteration).
    pub fn read_segment(&self, index: usize) -> RwLockReadGuard<'_, T> {
        self.segments[index].read()
    }

    /// Writer hold on a segment by index.
    pub fn write_segment(&self, index: usize) -> RwLockWriteGuard<'_, T> {
        self.segments[index].write()
    }
}

impl<T: Default> SegmentedLock<T> {
    /// Build with `segments` default-initialized slots.
    pub fn new(segments: usize) -> Self {
        Self::with(segments, T::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[test]
    fn test_same_key_same_segment() {
        let lock: SegmentedLock<()> = SegmentedLock::new(16);
        assert_eq!(lock.segment_of(b"key"), lock.segment_of(b"key"));
    }

    #[test]
    fn test_zero_segments_clamps() {
        let lock: SegmentedLock<u32> = SegmentedLock::new(0);
        assert_eq!(lock.segment_count(), 1);
    }

    #[test]
    fn test_keys_spread_across_segments() {
        let lock: SegmentedLock<()> = SegmentedLock::new(16);
        let mut seen = std::collections::HashSet::new();
        for i in 0..200 {
            seen.insert(lock.segment_of(format!("key-{}", i).as_bytes()));
        }
        assert!(seen.len() > 4, "only {} segments hit", seen.len());
    }

    #[test]
    fn test_concurrent_disjoint_writes() {
        let lock: Arc<SegmentedLock<HashMap<String, u64>>> = Arc::new(SegmentedLock::new(8));
        let mut handles = Vec::new();
        for t in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    let key = format!("t{}-{}", t, i);
                    lock.write(key.as_bytes()).insert(key.clone(), i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let total: usize = (0..lock.segment_count())
            .map(|i| lock.read_segment(i).len())
            .sum();
        assert_eq!(total, 4000);
    }

    #[test]
    fn test_readers_share_a_segment() {
        let lock: SegmentedLock<u32> = SegmentedLock::new(4);
        let g1 = lock.read(b"k");
        let g2 = lock.read(b"k");
        assert_eq!(*g1, *g2);
    }
}

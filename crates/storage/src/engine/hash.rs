//! Hash engine: chained buckets under segmented locks.
//!
//! The key hash splits into two independent parts: high bits pick the
//! segment, low bits pick a bucket inside it. Each segment owns a
//! disjoint stripe of power-of-two buckets behind its own reader-writer
//! lock and resizes independently when its load factor crosses the
//! configured threshold, so a resize never stalls readers of other
//! segments and a reader never observes a half-resized table: doubling
//! happens entirely under that segment's writer hold.
//!
//! Iteration order is undefined.

use concord_core::config::HashConfig;
use concord_core::engine::{decode_state, encode_state, EngineStats, KvEngine};
use concord_core::error::{Error, Result};
use concord_core::types::{EngineKind, Key, Value};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use xxhash_rust::xxh64::xxh64;

struct Segment {
    buckets: Vec<Vec<(Key, Value)>>,
    len: usize,
}

impl Segment {
    fn new(initial_buckets: usize) -> Self {
        Segment {
            buckets: (0..initial_buckets).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    fn bucket_of(&self, hash: u64) -> usize {
        // Bucket count is a power of two; mask instead of mod.
        (hash as usize) & (self.buckets.len() - 1)
    }

    fn should_grow(&self, load_factor: f64) -> bool {
        self.len as f64 > load_factor * self.buckets.len() as f64
    }

    /// Double the bucket count and rehash. Caller holds the writer lock.
    fn grow(&mut self) {
        let new_count = self.buckets.len() * 2;
        let mut new_buckets: Vec<Vec<(Key, Value)>> = (0..new_count).map(|_| Vec::new()).collect();
        for bucket in self.buckets.drain(..) {
            for (key, value) in bucket {
                let hash = xxh64(key.as_bytes(), 0);
                new_buckets[(hash as usize) & (new_count - 1)].push((key, value));
            }
        }
        self.buckets = new_buckets;
    }
}

/// Segmented chaining hash engine.
pub struct HashEngine {
    segments: Vec<RwLock<Segment>>,
    load_factor: f64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl HashEngine {
    /// Create from config; assumes the config has passed validation.
    pub fn new(config: &HashConfig) -> Result<Self> {
        if !config.initial_buckets.is_power_of_two() || config.segments == 0 {
            return Err(Error::InvalidArg(
                "hash engine needs power-of-two buckets and at least one segment".into(),
            ));
        }
        Ok(HashEngine {
            segments: (0..config.segments)
                .map(|_| RwLock::new(Segment::new(config.initial_buckets)))
                .collect(),
            load_factor: config.load_factor,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        })
    }

    fn segment_of(&self, hash: u64) -> &RwLock<Segment> {
        // High bits, decorrelated from the bucket mask.
        &self.segments[(hash >> 48) as usize % self.segments.len()]
    }
}

impl KvEngine for HashEngine {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let hash = xxh64(key, 0);
        let mut segment = self.segment_of(hash).write();
        let bucket = segment.bucket_of(hash);
        match segment.buckets[bucket]
            .iter_mut()
            .find(|(k, _)| k.as_bytes() == key)
        {
            Some((_, v)) => *v = Value::from(value),
            None => {
                segment.buckets[bucket].push((Key::from(key), Value::from(value)));
                segment.len += 1;
                if segment.should_grow(self.load_factor) {
                    segment.grow();
                }
            }
        }
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Value> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let hash = xxh64(key, 0);
        let segment = self.segment_of(hash).read();
        let bucket = segment.bucket_of(hash);
        segment.buckets[bucket]
            .iter()
            .find(|(k, _)| k.as_bytes() == key)
            .map(|(_, v)| v.clone())
            .ok_or(Error::NotFound)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let hash = xxh64(key, 0);
        let mut segment = self.segment_of(hash).write();
        let bucket = segment.bucket_of(hash);
        match segment.buckets[bucket]
            .iter()
            .position(|(k, _)| k.as_bytes() == key)
        {
            Some(pos) => {
                segment.buckets[bucket].swap_remove(pos);
                segment.len -= 1;
                self.deletes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let hash = xxh64(key, 0);
        let mut segment = self.segment_of(hash).write();
        let bucket = segment.bucket_of(hash);
        match segment.buckets[bucket]
            .iter_mut()
            .find(|(k, _)| k.as_bytes() == key)
        {
            Some((_, v)) => {
                *v = Value::from(value);
                self.writes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(Error::NotFound),
        }
    }

    fn count(&self) -> usize {
        self.segments.iter().map(|s| s.read().len).sum()
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Hash
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    fn serialize_state(&self) -> Result<Vec<u8>> {
        let mut pairs = Vec::new();
        for segment in &self.segments {
            let segment = segment.read();
            for bucket in &segment.buckets {
                pairs.extend(bucket.iter().cloned());
            }
        }
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        encode_state(&pairs)
    }

    fn restore_state(&self, payload: &[u8]) -> Result<()> {
        let pairs = decode_state(payload)?;
        for segment in &self.segments {
            let mut segment = segment.write();
            for bucket in &mut segment.buckets {
                bucket.clear();
            }
            segment.len = 0;
        }
        for (key, value) in pairs {
            self.put(key.as_bytes(), value.as_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> HashEngine {
        HashEngine::new(&HashConfig {
            initial_buckets: 4,
            load_factor: 0.75,
            segments: 4,
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        let cfg = HashConfig {
            initial_buckets: 12,
            ..HashConfig::default()
        };
        assert!(HashEngine::new(&cfg).is_err());
    }

    #[test]
    fn test_crud_roundtrip() {
        let engine = engine();
        engine.put(b"alpha", b"1").unwrap();
        engine.put(b"beta", b"2").unwrap();
        engine.update(b"alpha", b"1'").unwrap();
        assert_eq!(engine.get(b"alpha").unwrap(), Value::from("1'"));
        engine.delete(b"beta").unwrap();
        assert_eq!(engine.count(), 1);
        assert!(engine.get(b"beta").is_err());
    }

    #[test]
    fn test_growth_preserves_entries() {
        let engine = engine();
        for i in 0..1000 {
            engine
                .put(format!("key-{:04}", i).as_bytes(), format!("v{}", i).as_bytes())
                .unwrap();
        }
        assert_eq!(engine.count(), 1000);
        for i in 0..1000 {
            assert_eq!(
                engine.get(format!("key-{:04}", i).as_bytes()).unwrap(),
                Value::from(format!("v{}", i).as_str())
            );
        }
    }

    #[test]
    fn test_count_tracks_last_op() {
        let engine = engine();
        for i in 0..100 {
            engine.put(format!("k{}", i).as_bytes(), b"v").unwrap();
        }
        for i in 0..50 {
            engine.delete(format!("k{}", i).as_bytes()).unwrap();
        }
        assert_eq!(engine.count(), 50);
    }

    #[test]
    fn test_concurrent_disjoint_writers() {
        use std::sync::Arc;
        let engine = Arc::new(engine());
        let mut handles = Vec::new();
        for t in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    let key = format!("t{}-{}", t, i);
                    engine.put(key.as_bytes(), b"v").unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(engine.count(), 8 * 500);
    }

    #[test]
    fn test_state_roundtrip_across_segment_counts() {
        let engine = engine();
        for i in 0..64 {
            engine.put(format!("k{}", i).as_bytes(), b"v").unwrap();
        }
        let payload = engine.serialize_state().unwrap();

        let other = HashEngine::new(&HashConfig {
            initial_buckets: 16,
            load_factor: 0.5,
            segments: 2,
        })
        .unwrap();
        other.restore_state(&payload).unwrap();
        assert_eq!(other.count(), 64);
        assert_eq!(other.get(b"k63").unwrap(), Value::from("v"));
    }
}

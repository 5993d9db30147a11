//! Policy-pluggable cache.
//!
//! One [`Cache`] type serves every eviction policy: LRU, LFU, FIFO,
//! Random, CLOCK, and ARC. Entries live in a hash index; each policy
//! maintains its own order structure over stable entry ids.
//!
//! # Lock discipline
//!
//! `get` takes only the reader hold. A hit bumps atomic counters (hit
//! count, frequency, reference bit, last-access stamp), records the entry
//! id in a deferred-touch queue, clones the value out, and releases. No
//! read path ever reorders a policy list; reordering is batched under the
//! writer hold at the next `put`/`remove`. Eviction executes only inside
//! `put`, atomically with the insertion, so the entry count never exceeds
//! capacity at any observable point.
//!
//! # Statistics
//!
//! The hit/miss counters here are the single source of truth; the B+Tree's
//! hot-node stats delegate to [`Cache::stats`] rather than keeping a
//! second counter that could drift.

use concord_core::config::{CacheConfig, CachePolicy};
use concord_core::error::{Error, Result};
use concord_core::types::{Key, Value};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    /// Lookups that found a live entry
    pub hits: u64,
    /// Lookups that found nothing (or an expired entry)
    pub misses: u64,
}

impl CacheStats {
    /// Hits over total lookups; 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry {
    key: Key,
    value: Value,
    /// Access count, for LFU
    freq: AtomicU64,
    /// Second-chance bit, for CLOCK
    ref_bit: AtomicBool,
    /// Logical last-access stamp
    last_access: AtomicU64,
    /// Logical insertion stamp, breaks LFU ties by age
    inserted_at: u64,
    /// Wall-clock expiry when the cache has a TTL
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

enum PolicyState {
    Lru {
        /// Most-recent first
        order: VecDeque<u64>,
    },
    Lfu,
    Fifo {
        /// Insertion order, oldest at the back
        queue: VecDeque<u64>,
    },
    Random,
    Clock {
        ring: Vec<u64>,
        hand: usize,
    },
    Arc {
        /// Recent, seen once
        t1: VecDeque<u64>,
        /// Frequent, seen at least twice
        t2: VecDeque<u64>,
        /// Ghosts of t1 evictions
        b1: VecDeque<Key>,
        /// Ghosts of t2 evictions
        b2: VecDeque<Key>,
        /// Target size of t1; adapts on ghost hits
        p: usize,
    },
}

struct CacheInner {
    entries: FxHashMap<u64, CacheEntry>,
    index: FxHashMap<Key, u64>,
    policy: PolicyState,
    next_id: u64,
}

/// Policy-pluggable, hash-indexed cache.
pub struct Cache {
    config: CacheConfig,
    inner: RwLock<CacheInner>,
    /// Read-path touches to replay under the next writer hold
    touched: Mutex<Vec<u64>>,
    hits: AtomicU64,
    misses: AtomicU64,
    clock: AtomicU64,
}

impl Cache {
    /// Create a cache. `InvalidArg` when capacity or buckets are zero.
    pub fn new(config: CacheConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(Error::InvalidArg("cache.capacity must be > 0".into()));
        }
        if config.buckets == 0 {
            return Err(Error::InvalidArg("cache.buckets must be > 0".into()));
        }
        let policy = match config.policy {
            CachePolicy::Lru => PolicyState::Lru {
                order: VecDeque::with_capacity(config.capacity),
            },
            CachePolicy::Lfu => PolicyState::Lfu,
            CachePolicy::Fifo => PolicyState::Fifo {
                queue: VecDeque::with_capacity(config.capacity),
            },
            CachePolicy::Random => PolicyState::Random,
            CachePolicy::Clock => PolicyState::Clock {
                ring: Vec::with_capacity(config.capacity),
                hand: 0,
            },
            CachePolicy::Arc => PolicyState::Arc {
                t1: VecDeque::new(),
                t2: VecDeque::new(),
                b1: VecDeque::new(),
                b2: VecDeque::new(),
                p: 0,
            },
        };
        let buckets = config.buckets;
        Ok(Cache {
            config,
            inner: RwLock::new(CacheInner {
                entries: FxHashMap::with_capacity_and_hasher(buckets, Default::default()),
                index: FxHashMap::with_capacity_and_hasher(buckets, Default::default()),
                policy,
                next_id: 1,
            }),
            touched: Mutex::new(Vec::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            clock: AtomicU64::new(1),
        })
    }

    /// Look up a key. Reader hold only; never reorders policy lists.
    pub fn get(&self, key: &Key) -> Option<Value> {
        let inner = self.inner.read();
        let id = match inner.index.get(key) {
            Some(&id) => id,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        let entry = &inner.entries[&id];
        if entry.is_expired(Instant::now()) {
            // Reaped under the next writer hold; observed as a miss now.
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        entry.freq.fetch_add(1, Ordering::Relaxed);
        entry.ref_bit.store(true, Ordering::Relaxed);
        entry
            .last_access
            .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        let value = entry.value.clone();
        drop(inner);
        self.touched.lock().push(id);
        Some(value)
    }

    /// Insert or replace a key. Eviction happens here, atomically with
    /// the insertion, after deferred touches are replayed.
    pub fn put(&self, key: Key, value: Value) {
        let mut inner = self.inner.write();
        self.replay_touches(&mut inner);
        self.reap_expired(&mut inner);

        if let Some(&id) = inner.index.get(&key) {
            let entry = inner.entries.get_mut(&id).expect("index points at entry");
            entry.value = value;
            entry.expires_at = self.config.ttl.map(|ttl| Instant::now() + ttl);
            return;
        }

        // ARC consults its ghost lists before capacity is enforced.
        let ghost = self.note_ghost_hit(&mut inner, &key);

        while inner.entries.len() >= self.config.capacity {
            self.evict_one(&mut inner, ghost);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
        inner.entries.insert(
            id,
            CacheEntry {
                key: key.clone(),
                value,
                freq: AtomicU64::new(0),
                ref_bit: AtomicBool::new(false),
                last_access: AtomicU64::new(stamp),
                inserted_at: stamp,
                expires_at: self.config.ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        inner.index.insert(key, id);

        match &mut inner.policy {
            PolicyState::Lru { order } => order.push_front(id),
            PolicyState::Lfu | PolicyState::Random => {}
            PolicyState::Fifo { queue } => queue.push_front(id),
            PolicyState::Clock { ring, .. } => ring.push(id),
            PolicyState::Arc { t1, t2, .. } => match ghost {
                GhostHit::None => t1.push_front(id),
                // A ghost hit promotes straight to the frequent list.
                GhostHit::B1 | GhostHit::B2 => t2.push_front(id),
            },
        }
    }

    /// Remove a key, returning its value.
    pub fn remove(&self, key: &Key) -> Option<Value> {
        let mut inner = self.inner.write();
        self.replay_touches(&mut inner);
        let id = inner.index.remove(key)?;
        let entry = inner.entries.remove(&id)?;
        Self::unlink(&mut inner.policy, id);
        Some(entry.value)
    }

    /// Live entry count.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Whether a live entry exists without counting a hit or miss.
    pub fn contains(&self, key: &Key) -> bool {
        let inner = self.inner.read();
        match inner.index.get(key) {
            Some(id) => !inner.entries[id].is_expired(Instant::now()),
            None => false,
        }
    }

    /// Hit/miss counters. The single source of truth for hit rate.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Replay read-path touches into the policy order structures.
    fn replay_touches(&self, inner: &mut CacheInner) {
        let touched = std::mem::take(&mut *self.touched.lock());
        if touched.is_empty() {
            return;
        }
        match &mut inner.policy {
            PolicyState::Lru { order } => {
                for id in touched {
                    if let Some(pos) = order.iter().position(|&x| x == id) {
                        order.remove(pos);
                        order.push_front(id);
                    }
                }
            }
            PolicyState::Arc { t1, t2, .. } => {
                for id in touched {
                    if let Some(pos) = t1.iter().position(|&x| x == id) {
                        t1.remove(pos);
                        t2.push_front(id);
                    } else if let Some(pos) = t2.iter().position(|&x| x == id) {
                        t2.remove(pos);
                        t2.push_front(id);
                    }
                }
            }
            // LFU/CLOCK read state is already atomic; FIFO and Random
            // ignore recency entirely.
            _ => {}
        }
    }

    fn reap_expired(&self, inner: &mut CacheInner) {
        if self.config.ttl.is_none() {
            return;
        }
        let now = Instant::now();
        let dead: Vec<u64> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(&id, _)| id)
            .collect();
        for id in dead {
            if let Some(entry) = inner.entries.remove(&id) {
                inner.index.remove(&entry.key);
                Self::unlink(&mut inner.policy, id);
            }
        }
    }

    fn note_ghost_hit(&self, inner: &mut CacheInner, key: &Key) -> GhostHit {
        let capacity = self.config.capacity;
        if let PolicyState::Arc { b1, b2, p, .. } = &mut inner.policy {
            if let Some(pos) = b1.iter().position(|k| k == key) {
                b1.remove(pos);
                let delta = 1.max(b2.len() / b1.len().max(1));
                *p = (*p + delta).min(capacity);
                return GhostHit::B1;
            }
            if let Some(pos) = b2.iter().position(|k| k == key) {
                b2.remove(pos);
                let delta = 1.max(b1.len() / b2.len().max(1));
                *p = p.saturating_sub(delta);
                return GhostHit::B2;
            }
        }
        GhostHit::None
    }

    /// Remove one victim chosen by the active policy.
    fn evict_one(&self, inner: &mut CacheInner, ghost: GhostHit) {
        let victim = match &mut inner.policy {
            PolicyState::Lru { order } => order.pop_back(),
            PolicyState::Lfu => inner
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.freq.load(Ordering::Relaxed), e.inserted_at))
                .map(|(&id, _)| id),
            PolicyState::Fifo { queue } => queue.pop_back(),
            PolicyState::Random => {
                let n = inner.entries.len();
                if n == 0 {
                    None
                } else {
                    let pick = rand::thread_rng().gen_range(0..n);
                    inner.entries.keys().nth(pick).copied()
                }
            }
            PolicyState::Clock { ring, hand } => {
                let mut chosen = None;
                // Bounded by two sweeps: the first clears set bits.
                for _ in 0..ring.len() * 2 {
                    if ring.is_empty() {
                        break;
                    }
                    if *hand >= ring.len() {
                        *hand = 0;
                    }
                    let id = ring[*hand];
                    let entry = &inner.entries[&id];
                    if entry.ref_bit.swap(false, Ordering::Relaxed) {
                        *hand += 1;
                    } else {
                        ring.remove(*hand);
                        chosen = Some(id);
                        break;
                    }
                }
                chosen
            }
            PolicyState::Arc { t1, t2, b1, b2, p } => {
                let from_t1 = !t1.is_empty()
                    && (t1.len() > *p || (ghost == GhostHit::B2 && t1.len() == *p));
                let (list, ghosts) = if from_t1 || t2.is_empty() {
                    (t1, b1)
                } else {
                    (t2, b2)
                };
                match list.pop_back() {
                    Some(id) => {
                        if let Some(entry) = inner.entries.get(&id) {
                            ghosts.push_front(entry.key.clone());
                            if ghosts.len() > self.config.capacity {
                                ghosts.pop_back();
                            }
                        }
                        Some(id)
                    }
                    None => None,
                }
            }
        };

        let victim = match victim {
            Some(id) => id,
            // Order structure drifted from the map (expired reap); fall
            // back to any entry so capacity still holds.
            None => match inner.entries.keys().next().copied() {
                Some(id) => id,
                None => return,
            },
        };
        if let Some(entry) = inner.entries.remove(&victim) {
            inner.index.remove(&entry.key);
        }
        Self::unlink(&mut inner.policy, victim);
    }

    /// Drop an id from whichever order structure holds it.
    fn unlink(policy: &mut PolicyState, id: u64) {
        match policy {
            PolicyState::Lru { order } => {
                if let Some(pos) = order.iter().position(|&x| x == id) {
                    order.remove(pos);
                }
            }
            PolicyState::Lfu | PolicyState::Random => {}
            PolicyState::Fifo { queue } => {
                if let Some(pos) = queue.iter().position(|&x| x == id) {
                    queue.remove(pos);
                }
            }
            PolicyState::Clock { ring, hand } => {
                if let Some(pos) = ring.iter().position(|&x| x == id) {
                    ring.remove(pos);
                    if pos < *hand && *hand > 0 {
                        *hand -= 1;
                    }
                }
            }
            PolicyState::Arc { t1, t2, .. } => {
                if let Some(pos) = t1.iter().position(|&x| x == id) {
                    t1.remove(pos);
                } else if let Some(pos) = t2.iter().position(|&x| x == id) {
                    t2.remove(pos);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GhostHit {
    None,
    B1,
    B2,
}

//! B+Tree engine.
//!
//! Order-configurable (3..=1000, default 100). Internal nodes hold
//! routing keys only; leaves hold the records and link left-to-right in
//! key order, so range walks never touch the internal levels. Nodes live
//! in an index arena with a free list, like the red-black tree.
//!
//! Structural invariant: every non-root internal node has between
//! ceil(order/2) and order children. Leaves run on their own capacity,
//! which the adaptive sizing manager may move within bounds at write
//! quiesce points.
//!
//! # Hot-node cache
//!
//! Optionally fronts lookups with the unified cache (`crate::cache`).
//! The cache's read path is atomic-counter-only, which keeps this
//! engine's `get` free of writer holds on the hit path. Hit-rate
//! statistics come from the cache manager, never from a tree-side
//! counter that could drift out of agreement.

use crate::cache::{Cache, CacheStats};
use concord_core::config::{BTreeConfig, CacheConfig, CachePolicy};
use concord_core::engine::{decode_state, encode_state, EngineStats, KvEngine};
use concord_core::error::{Error, Result};
use concord_core::types::{EngineKind, Key, Value};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

const NO_NODE: u32 = u32::MAX;

/// How often (in write ops) the adaptive manager re-evaluates capacity.
const ADAPT_SAMPLE_EVERY: u64 = 1024;

#[derive(Debug)]
enum Node {
    Internal {
        keys: Vec<Key>,
        children: Vec<u32>,
    },
    Leaf {
        entries: Vec<(Key, Value)>,
        next: u32,
    },
    /// Free-list slot
    Vacant,
}

/// Adaptive node-capacity manager.
///
/// Tracks entries-per-leaf as an EWMA and nudges the leaf capacity
/// toward a fill target, within fixed bounds derived from the order.
/// Adjustments apply only at write quiesce points (the caller already
/// holds the writer lock) and only affect future splits.
#[derive(Debug)]
struct AdaptiveSizing {
    min_cap: usize,
    max_cap: usize,
    current_cap: usize,
    avg_fill: f64,
    last_resize: Instant,
}

impl AdaptiveSizing {
    fn new(order: usize) -> Self {
        let base = order - 1;
        AdaptiveSizing {
            min_cap: (base / 2).max(2),
            max_cap: base * 2,
            current_cap: base,
            avg_fill: 0.0,
            last_resize: Instant::now(),
        }
    }

    /// Feed a fresh entries-per-leaf sample; maybe move the capacity.
    fn observe(&mut self, entries_per_leaf: f64, enabled: bool) {
        // EWMA, alpha = 0.2
        self.avg_fill = 0.8 * self.avg_fill + 0.2 * entries_per_leaf;
        if !enabled || self.last_resize.elapsed().as_secs() < 1 {
            return;
        }
        let fill_ratio = self.avg_fill / self.current_cap as f64;
        if fill_ratio > 0.9 && self.current_cap < self.max_cap {
            self.current_cap = (self.current_cap + self.current_cap / 4).min(self.max_cap);
            self.last_resize = Instant::now();
        } else if fill_ratio < 0.3 && self.current_cap > self.min_cap {
            self.current_cap = (self.current_cap - self.current_cap / 4).max(self.min_cap);
            self.last_resize = Instant::now();
        }
    }
}

struct Tree {
    nodes: Vec<Node>,
    free: Vec<u32>,
    root: u32,
    /// Leftmost leaf, head of the leaf chain
    head: u32,
    len: usize,
    leaf_count: usize,
    order: usize,
    sizing: AdaptiveSizing,
}

enum InsertResult {
    Done { replaced: bool },
    Split { sep: Key, right: u32, replaced: bool },
}

impl Tree {
    fn new(order: usize) -> Self {
        let mut tree = Tree {
            nodes: Vec::new(),
            free: Vec::new(),
            root: 0,
            head: 0,
            len: 0,
            leaf_count: 1,
            order,
            sizing: AdaptiveSizing::new(order),
        };
        let root = tree.alloc(Node::Leaf {
            entries: Vec::new(),
            next: NO_NODE,
        });
        tree.root = root;
        tree.head = root;
        tree
    }

    fn alloc(&mut self, node: Node) -> u32 {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                (self.nodes.len() - 1) as u32
            }
        }
    }

    fn release(&mut self, slot: u32) {
        self.nodes[slot as usize] = Node::Vacant;
        self.free.push(slot);
    }

    fn leaf_cap(&self) -> usize {
        self.sizing.current_cap
    }

    /// Minimum children of a non-root internal node: ceil(order/2).
    fn min_children(&self) -> usize {
        (self.order + 1) / 2
    }

    fn min_leaf(&self) -> usize {
        (self.leaf_cap() / 2).max(1)
    }

    /// Child index routing `key` within an internal node.
    ///
    /// Separators come from leaf splits (first key of the right node), so
    /// equality routes right.
    fn route(keys: &[Key], key: &[u8]) -> usize {
        keys.partition_point(|k| k.as_bytes() <= key)
    }

    fn find_leaf(&self, key: &[u8]) -> u32 {
        let mut cur = self.root;
        loop {
            match &self.nodes[cur as usize] {
                Node::Internal { keys, children } => {
                    cur = children[Self::route(keys, key)];
                }
                Node::Leaf { .. } => return cur,
                Node::Vacant => unreachable!("descended into a vacant slot"),
            }
        }
    }

    fn get(&self, key: &[u8]) -> Option<Value> {
        let leaf = self.find_leaf(key);
        match &self.nodes[leaf as usize] {
            Node::Leaf { entries, .. } => entries
                .binary_search_by(|(k, _)| k.as_bytes().cmp(key))
                .ok()
                .map(|i| entries[i].1.clone()),
            _ => None,
        }
    }

    fn insert(&mut self, key: &[u8], value: &[u8]) -> bool {
        let root = self.root;
        let result = self.insert_into(root, key, value);
        let replaced = match result {
            InsertResult::Done { replaced } => replaced,
            InsertResult::Split {
                sep,
                right,
                replaced,
            } => {
                let new_root = self.alloc(Node::Internal {
                    keys: vec![sep],
                    children: vec![root, right],
                });
                self.root = new_root;
                replaced
            }
        };
        if !replaced {
            self.len += 1;
        }
        replaced
    }

    fn insert_into(&mut self, node: u32, key: &[u8], value: &[u8]) -> InsertResult {
        if matches!(&self.nodes[node as usize], Node::Leaf { .. }) {
            self.insert_into_leaf(node, key, value)
        } else {
            self.insert_into_internal(node, key, value)
        }
    }

    fn insert_into_leaf(&mut self, node: u32, key: &[u8], value: &[u8]) -> InsertResult {
        let cap = self.sizing.current_cap;
        let (sep, right_entries, old_next) = {
            let Node::Leaf { entries, next } = &mut self.nodes[node as usize] else {
                unreachable!("insert_into_leaf on a non-leaf")
            };
            match entries.binary_search_by(|(k, _)| k.as_bytes().cmp(key)) {
                Ok(i) => {
                    entries[i].1 = Value::from(value);
                    return InsertResult::Done { replaced: true };
                }
                Err(i) => entries.insert(i, (Key::from(key), Value::from(value))),
            }
            if entries.len() <= cap {
                return InsertResult::Done { replaced: false };
            }
            // Split: right half moves out; separator is the right node's
            // first key.
            let mid = entries.len() / 2;
            let right_entries = entries.split_off(mid);
            let sep = right_entries[0].0.clone();
            (sep, right_entries, *next)
        };
        let right = self.alloc(Node::Leaf {
            entries: right_entries,
            next: old_next,
        });
        if let Node::Leaf { next, .. } = &mut self.nodes[node as usize] {
            *next = right;
        }
        self.leaf_count += 1;
        InsertResult::Split {
            sep,
            right,
            replaced: false,
        }
    }

    fn insert_into_internal(&mut self, node: u32, key: &[u8], value: &[u8]) -> InsertResult {
        let (idx, child) = {
            let Node::Internal { keys, children } = &self.nodes[node as usize] else {
                unreachable!("insert_into_internal on a non-internal")
            };
            let idx = Self::route(keys, key);
            (idx, children[idx])
        };
        match self.insert_into(child, key, value) {
            InsertResult::Done { replaced } => InsertResult::Done { replaced },
            InsertResult::Split {
                sep,
                right,
                replaced,
            } => {
                let order = self.order;
                let split = {
                    let Node::Internal { keys, children } = &mut self.nodes[node as usize] else {
                        unreachable!("insert_into_internal on a non-internal")
                    };
                    keys.insert(idx, sep);
                    children.insert(idx + 1, right);
                    if children.len() <= order {
                        None
                    } else {
                        // Promote the middle key; it does not stay in
                        // either half.
                        let mid = keys.len() / 2;
                        let promoted = keys[mid].clone();
                        let right_keys = keys.split_off(mid + 1);
                        keys.pop();
                        let right_children = children.split_off(mid + 1);
                        Some((promoted, right_keys, right_children))
                    }
                };
                match split {
                    None => InsertResult::Done { replaced },
                    Some((promoted, right_keys, right_children)) => {
                        let right_node = self.alloc(Node::Internal {
                            keys: right_keys,
                            children: right_children,
                        });
                        InsertResult::Split {
                            sep: promoted,
                            right: right_node,
                            replaced,
                        }
                    }
                }
            }
        }
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        let root = self.root;
        let removed = self.remove_from(root, key);
        if removed {
            self.len -= 1;
        }
        // Collapse a root that routes to a single child.
        if let Node::Internal { children, .. } = &self.nodes[self.root as usize] {
            if children.len() == 1 {
                let child = children[0];
                let old_root = self.root;
                self.root = child;
                self.release(old_root);
            }
        }
        removed
    }

    fn remove_from(&mut self, node: u32, key: &[u8]) -> bool {
        if matches!(&self.nodes[node as usize], Node::Leaf { .. }) {
            let Node::Leaf { entries, .. } = &mut self.nodes[node as usize] else {
                unreachable!()
            };
            match entries.binary_search_by(|(k, _)| k.as_bytes().cmp(key)) {
                Ok(i) => {
                    entries.remove(i);
                    true
                }
                Err(_) => false,
            }
        } else {
            let (idx, child) = {
                let Node::Internal { keys, children } = &self.nodes[node as usize] else {
                    unreachable!("remove_from on a vacant slot")
                };
                let idx = Self::route(keys, key);
                (idx, children[idx])
            };
            let removed = self.remove_from(child, key);
            if removed {
                self.rebalance_child(node, idx);
            }
            removed
        }
    }

    fn child_underflows(&self, child: u32) -> bool {
        match &self.nodes[child as usize] {
            Node::Leaf { entries, .. } => entries.len() < self.min_leaf(),
            Node::Internal { children, .. } => children.len() < self.min_children(),
            Node::Vacant => false,
        }
    }

    /// Restore the fill invariant of `parent`'s child at `idx` by
    /// borrowing from a sibling or merging with one.
    fn rebalance_child(&mut self, parent: u32, idx: usize) {
        let (child, left_sibling, right_sibling) = {
            let Node::Internal { children, .. } = &self.nodes[parent as usize] else {
                unreachable!()
            };
            let child = children[idx];
            let left = if idx > 0 { Some(children[idx - 1]) } else { None };
            let right = children.get(idx + 1).copied();
            (child, left, right)
        };
        if !self.child_underflows(child) {
            return;
        }

        // Borrow from the left sibling when it has slack.
        if let Some(left) = left_sibling {
            if self.can_lend(left) {
                self.borrow_from_left(parent, idx, left, child);
                return;
            }
        }
        if let Some(right) = right_sibling {
            if self.can_lend(right) {
                self.borrow_from_right(parent, idx, child, right);
                return;
            }
        }
        // No slack anywhere: merge with a sibling.
        if let Some(left) = left_sibling {
            self.merge_children(parent, idx - 1, left, child);
        } else if let Some(right) = right_sibling {
            self.merge_children(parent, idx, child, right);
        }
    }

    fn can_lend(&self, node: u32) -> bool {
        match &self.nodes[node as usize] {
            Node::Leaf { entries, .. } => entries.len() > self.min_leaf(),
            Node::Internal { children, .. } => children.len() > self.min_children(),
            Node::Vacant => false,
        }
    }

    fn borrow_from_left(&mut self, parent: u32, idx: usize, left: u32, child: u32) {
        let is_leaf = matches!(&self.nodes[child as usize], Node::Leaf { .. });
        if is_leaf {
            let moved = {
                let Node::Leaf { entries, .. } = &mut self.nodes[left as usize] else {
                    unreachable!()
                };
                entries.pop().expect("lender has slack")
            };
            let new_sep = moved.0.clone();
            let Node::Leaf { entries, .. } = &mut self.nodes[child as usize] else {
                unreachable!()
            };
            entries.insert(0, moved);
            let Node::Internal { keys, .. } = &mut self.nodes[parent as usize] else {
                unreachable!()
            };
            keys[idx - 1] = new_sep;
        } else {
            // Rotate through the parent separator.
            let (moved_key, moved_child) = {
                let Node::Internal { keys, children } = &mut self.nodes[left as usize] else {
                    unreachable!()
                };
                (keys.pop().expect("lender has slack"), children.pop().expect("lender has slack"))
            };
            let old_sep = {
                let Node::Internal { keys, .. } = &mut self.nodes[parent as usize] else {
                    unreachable!()
                };
                std::mem::replace(&mut keys[idx - 1], moved_key)
            };
            let Node::Internal { keys, children } = &mut self.nodes[child as usize] else {
                unreachable!()
            };
            keys.insert(0, old_sep);
            children.insert(0, moved_child);
        }
    }

    fn borrow_from_right(&mut self, parent: u32, idx: usize, child: u32, right: u32) {
        let is_leaf = matches!(&self.nodes[child as usize], Node::Leaf { .. });
        if is_leaf {
            let (moved, new_sep) = {
                let Node::Leaf { entries, .. } = &mut self.nodes[right as usize] else {
                    unreachable!()
                };
                let moved = entries.remove(0);
                (moved, entries[0].0.clone())
            };
            let Node::Leaf { entries, .. } = &mut self.nodes[child as usize] else {
                unreachable!()
            };
            entries.push(moved);
            let Node::Internal { keys, .. } = &mut self.nodes[parent as usize] else {
                unreachable!()
            };
            keys[idx] = new_sep;
        } else {
            let (moved_key, moved_child) = {
                let Node::Internal { keys, children } = &mut self.nodes[right as usize] else {
                    unreachable!()
                };
                (keys.remove(0), children.remove(0))
            };
            let old_sep = {
                let Node::Internal { keys, .. } = &mut self.nodes[parent as usize] else {
                    unreachable!()
                };
                std::mem::replace(&mut keys[idx], moved_key)
            };
            let Node::Internal { keys, children } = &mut self.nodes[child as usize] else {
                unreachable!()
            };
            keys.push(old_sep);
            children.push(moved_child);
        }
    }

    /// Merge the children at `left_idx` and `left_idx + 1` into the left
    /// one, pulling the separator down when the children are internal.
    fn merge_children(&mut self, parent: u32, left_idx: usize, left: u32, right: u32) {
        let sep = {
            let Node::Internal { keys, children } = &mut self.nodes[parent as usize] else {
                unreachable!()
            };
            children.remove(left_idx + 1);
            keys.remove(left_idx)
        };
        let right_node = std::mem::replace(&mut self.nodes[right as usize], Node::Vacant);
        match right_node {
            Node::Leaf { mut entries, next } => {
                let Node::Leaf {
                    entries: left_entries,
                    next: left_next,
                } = &mut self.nodes[left as usize]
                else {
                    unreachable!()
                };
                left_entries.append(&mut entries);
                *left_next = next;
                self.leaf_count -= 1;
            }
            Node::Internal {
                mut keys,
                mut children,
            } => {
                let Node::Internal {
                    keys: left_keys,
                    children: left_children,
                } = &mut self.nodes[left as usize]
                else {
                    unreachable!()
                };
                left_keys.push(sep);
                left_keys.append(&mut keys);
                left_children.append(&mut children);
            }
            Node::Vacant => unreachable!("merging a vacant slot"),
        }
        self.free.push(right);
    }

    /// Walk the leaf chain in key order.
    fn collect(&self) -> Vec<(Key, Value)> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while cur != NO_NODE {
            match &self.nodes[cur as usize] {
                Node::Leaf { entries, next } => {
                    out.extend(entries.iter().cloned());
                    cur = *next;
                }
                _ => break,
            }
        }
        out
    }

    fn entries_per_leaf(&self) -> f64 {
        self.len as f64 / self.leaf_count.max(1) as f64
    }
}

/// Aggregate B+Tree statistics.
#[derive(Debug, Clone, Copy)]
pub struct BTreeStats {
    /// Total operations observed
    pub total_ops: u64,
    /// Hot-node cache counters, from the cache manager
    pub cache: Option<CacheStats>,
    /// Average live entries per leaf node
    pub avg_leaf_entries: f64,
    /// Current adaptive leaf capacity
    pub leaf_capacity: usize,
}

/// Leaf-linked B+Tree engine with optional hot-node cache.
pub struct BPlusTreeEngine {
    tree: RwLock<Tree>,
    hot_cache: Option<Cache>,
    adaptive: bool,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl BPlusTreeEngine {
    /// Create from config; order must already be validated to 3..=1000.
    pub fn new(config: &BTreeConfig) -> Result<Self> {
        if !(3..=1000).contains(&config.order) {
            return Err(Error::InvalidArg(format!(
                "btree order must be in 3..=1000, got {}",
                config.order
            )));
        }
        let hot_cache = if config.cache_enabled {
            Some(Cache::new(CacheConfig {
                policy: CachePolicy::Lru,
                capacity: config.cache_capacity,
                buckets: config.cache_capacity.max(16),
                ttl: None,
            })?)
        } else {
            None
        };
        Ok(BPlusTreeEngine {
            tree: RwLock::new(Tree::new(config.order)),
            hot_cache,
            adaptive: config.adaptive_sizing,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        })
    }

    /// Tree statistics; the cache hit rate comes straight from the cache
    /// manager so the two can never disagree.
    pub fn tree_stats(&self) -> BTreeStats {
        let tree = self.tree.read();
        BTreeStats {
            total_ops: self.stats().total_ops(),
            cache: self.hot_cache.as_ref().map(|c| c.stats()),
            avg_leaf_entries: tree.entries_per_leaf(),
            leaf_capacity: tree.leaf_cap(),
        }
    }

    /// Ordered key/value dump via the leaf chain.
    pub fn iter_ordered(&self) -> Vec<(Key, Value)> {
        self.tree.read().collect()
    }

    /// Feed the adaptive manager at a write quiesce point.
    fn observe_sizing(&self, tree: &mut Tree) {
        let writes = self.writes.load(Ordering::Relaxed);
        if writes % ADAPT_SAMPLE_EVERY == 0 {
            let sample = tree.entries_per_leaf();
            tree.sizing.observe(sample, self.adaptive);
        }
    }
}

impl KvEngine for BPlusTreeEngine {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut tree = self.tree.write();
        tree.insert(key, value);
        self.observe_sizing(&mut tree);
        drop(tree);
        if let Some(cache) = &self.hot_cache {
            cache.remove(&Key::from(key));
        }
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Value> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let owned_key = Key::from(key);
        if let Some(cache) = &self.hot_cache {
            if let Some(value) = cache.get(&owned_key) {
                return Ok(value);
            }
        }
        let value = self.tree.read().get(key).ok_or(Error::NotFound)?;
        if let Some(cache) = &self.hot_cache {
            cache.put(owned_key, value.clone());
        }
        Ok(value)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut tree = self.tree.write();
        let removed = tree.remove(key);
        drop(tree);
        if let Some(cache) = &self.hot_cache {
            cache.remove(&Key::from(key));
        }
        if removed {
            self.deletes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut tree = self.tree.write();
        if tree.get(key).is_none() {
            return Err(Error::NotFound);
        }
        tree.insert(key, value);
        drop(tree);
        self.writes.fetch_add(1, Ordering::Relaxed);
        if let Some(cache) = &self.hot_cache {
            cache.remove(&Key::from(key));
        }
        Ok(())
    }

    fn count(&self) -> usize {
        self.tree.read().len
    }

    fn batch_put(&self, pairs: &[(Key, Value)]) -> Result<()> {
        let mut tree = self.tree.write();
        for (key, value) in pairs {
            tree.insert(key.as_bytes(), value.as_bytes());
        }
        self.writes.fetch_add(pairs.len() as u64, Ordering::Relaxed);
        self.observe_sizing(&mut tree);
        drop(tree);
        if let Some(cache) = &self.hot_cache {
            for (key, _) in pairs {
                cache.remove(key);
            }
        }
        Ok(())
    }

    fn kind(&self) -> EngineKind {
        EngineKind::BPlusTree
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    fn serialize_state(&self) -> Result<Vec<u8>> {
        encode_state(&self.tree.read().collect())
    }

    fn restore_state(&self, payload: &[u8]) -> Result<()> {
        let pairs = decode_state(payload)?;
        let mut tree = self.tree.write();
        let order = tree.order;
        *tree = Tree::new(order);
        for (key, value) in &pairs {
            tree.insert(key.as_bytes(), value.as_bytes());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn engine(order: usize) -> BPlusTreeEngine {
        BPlusTreeEngine::new(&BTreeConfig {
            order,
            cache_enabled: false,
            cache_capacity: 0,
            adaptive_sizing: false,
        })
        .unwrap()
    }

    /// Check depth uniformity, internal fill bounds, and leaf-chain order.
    fn check_invariants(tree: &Tree) {
        fn depth_of(tree: &Tree, node: u32) -> usize {
            match &tree.nodes[node as usize] {
                Node::Leaf { .. } => 1,
                Node::Internal { children, .. } => {
                    let depths: Vec<usize> =
                        children.iter().map(|&c| depth_of(tree, c)).collect();
                    assert!(
                        depths.windows(2).all(|w| w[0] == w[1]),
                        "uneven subtree depth"
                    );
                    depths[0] + 1
                }
                Node::Vacant => panic!("reachable vacant slot"),
            }
        }
        fn check_fill(tree: &Tree, node: u32, is_root: bool) {
            if let Node::Internal { keys, children } = &tree.nodes[node as usize] {
                assert_eq!(keys.len() + 1, children.len(), "key/child arity");
                assert!(children.len() <= tree.order, "overfull internal node");
                if !is_root {
                    assert!(
                        children.len() >= tree.min_children(),
                        "underfull internal node: {} < {}",
                        children.len(),
                        tree.min_children()
                    );
                }
                for &c in children {
                    check_fill(tree, c, false);
                }
            }
        }
        depth_of(tree, tree.root);
        check_fill(tree, tree.root, true);

        // Leaf chain is sorted and covers every entry.
        let collected = tree.collect();
        assert_eq!(collected.len(), tree.len);
        assert!(collected.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_rejects_bad_order() {
        assert!(engine_result(2).is_err());
        assert!(engine_result(1001).is_err());
        assert!(engine_result(3).is_ok());

        fn engine_result(order: usize) -> Result<BPlusTreeEngine> {
            BPlusTreeEngine::new(&BTreeConfig {
                order,
                ..BTreeConfig::default()
            })
        }
    }

    #[test]
    fn test_crud_scenario() {
        let engine = engine(100);
        engine.put(b"user:1001", b"zhang").unwrap();
        engine.put(b"user:1002", b"li").unwrap();
        engine.update(b"user:1001", b"zhang-v2").unwrap();
        engine.delete(b"user:1002").unwrap();

        assert_eq!(engine.count(), 1);
        assert_eq!(engine.get(b"user:1001").unwrap(), Value::from("zhang-v2"));
        assert_eq!(
            engine.get(b"user:1002").unwrap_err().kind(),
            concord_core::ErrorKind::NotFound
        );
    }

    #[test]
    fn test_split_depth_and_order_small_fanout() {
        let engine = engine(4);
        for i in 0..200 {
            engine.put(format!("{:05}", i).as_bytes(), b"v").unwrap();
        }
        assert_eq!(engine.count(), 200);
        check_invariants(&engine.tree.read());
        for i in 0..200 {
            assert!(engine.get(format!("{:05}", i).as_bytes()).is_ok());
        }
    }

    #[test]
    fn test_random_churn_keeps_invariants() {
        let engine = engine(5);
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        let mut keys: Vec<u32> = (0..400).collect();
        keys.shuffle(&mut rng);
        for k in &keys {
            engine.put(format!("{:06}", k).as_bytes(), b"v").unwrap();
        }
        check_invariants(&engine.tree.read());

        keys.shuffle(&mut rng);
        for k in keys.iter().take(300) {
            engine.delete(format!("{:06}", k).as_bytes()).unwrap();
        }
        assert_eq!(engine.count(), 100);
        check_invariants(&engine.tree.read());
        for k in keys.iter().skip(300) {
            assert!(engine.get(format!("{:06}", k).as_bytes()).is_ok());
        }
    }

    #[test]
    fn test_delete_to_empty() {
        let engine = engine(4);
        for i in 0..100 {
            engine.put(format!("{:04}", i).as_bytes(), b"v").unwrap();
        }
        for i in 0..100 {
            engine.delete(format!("{:04}", i).as_bytes()).unwrap();
        }
        assert_eq!(engine.count(), 0);
        assert!(engine.get(b"0000").is_err());
        // Insert again into the emptied tree.
        engine.put(b"again", b"v").unwrap();
        assert_eq!(engine.count(), 1);
    }

    #[test]
    fn test_leaf_chain_iteration() {
        let engine = engine(4);
        for key in ["delta", "alpha", "echo", "bravo", "charlie"] {
            engine.put(key.as_bytes(), b"v").unwrap();
        }
        let keys: Vec<String> = engine
            .iter_ordered()
            .into_iter()
            .map(|(k, _)| String::from_utf8(k.0).unwrap())
            .collect();
        assert_eq!(keys, vec!["alpha", "bravo", "charlie", "delta", "echo"]);
    }

    #[test]
    fn test_hot_cache_hit_rate_single_source() {
        let engine = BPlusTreeEngine::new(&BTreeConfig {
            order: 16,
            cache_enabled: true,
            cache_capacity: 8,
            adaptive_sizing: false,
        })
        .unwrap();
        engine.put(b"hot", b"value").unwrap();
        // First get misses the cache and fills it; the rest hit.
        for _ in 0..5 {
            assert_eq!(engine.get(b"hot").unwrap(), Value::from("value"));
        }
        let stats = engine.tree_stats();
        let cache = stats.cache.expect("cache enabled");
        assert_eq!(cache.hits, 4);
        assert_eq!(cache.misses, 1);

        // Mutation invalidates the cached value.
        engine.put(b"hot", b"fresh").unwrap();
        assert_eq!(engine.get(b"hot").unwrap(), Value::from("fresh"));
    }

    #[test]
    fn test_adaptive_capacity_stays_in_bounds() {
        let engine = BPlusTreeEngine::new(&BTreeConfig {
            order: 8,
            cache_enabled: false,
            cache_capacity: 0,
            adaptive_sizing: true,
        })
        .unwrap();
        for i in 0..5000 {
            engine.put(format!("{:06}", i).as_bytes(), b"v").unwrap();
        }
        let stats = engine.tree_stats();
        let tree = engine.tree.read();
        assert!(stats.leaf_capacity >= tree.sizing.min_cap);
        assert!(stats.leaf_capacity <= tree.sizing.max_cap);
        assert!(stats.avg_leaf_entries > 0.0);
    }

    #[test]
    fn test_state_roundtrip() {
        let engine = engine(7);
        for i in 0..300 {
            engine
                .put(format!("key{:04}", i).as_bytes(), format!("{}", i).as_bytes())
                .unwrap();
        }
        let payload = engine.serialize_state().unwrap();
        let restored = engine_from_payload(&payload);
        assert_eq!(restored.count(), 300);
        assert_eq!(restored.get(b"key0123").unwrap(), Value::from("123"));
        check_invariants(&restored.tree.read());

        fn engine_from_payload(payload: &[u8]) -> BPlusTreeEngine {
            let e = BPlusTreeEngine::new(&BTreeConfig {
                order: 50,
                ..BTreeConfig::default()
            })
            .unwrap();
            e.restore_state(payload).unwrap();
            e
        }
    }
}

//! Red-black tree engine.
//!
//! Self-balancing BST with a sentinel NIL node, giving O(log N)
//! operations and ordered iteration. Nodes live in an index arena
//! (`Vec<Node>` with `u32` links and a free list) rather than behind
//! `Box`/`Rc` chains: parent links become plain indices, the borrow
//! checker stays out of the rotation code, and freed slots are reused.
//!
//! Slot 0 is the sentinel: always black, links untrusted. The delete
//! fixup temporarily writes the sentinel's parent pointer, which is the
//! standard trick for keeping the fixup loop free of nil checks.
//!
//! Structural mutation happens only under the writer hold; readers
//! descend a stable tree.

use concord_core::engine::{decode_state, encode_state, EngineStats, KvEngine};
use concord_core::error::{Error, Result};
use concord_core::types::{EngineKind, Key, Value};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

const NIL: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

#[derive(Debug, Clone)]
struct Node {
    key: Key,
    value: Value,
    left: u32,
    right: u32,
    parent: u32,
    color: Color,
}

struct Tree {
    nodes: Vec<Node>,
    free: Vec<u32>,
    root: u32,
    len: usize,
}

impl Tree {
    fn new() -> Self {
        // Slot 0 is the sentinel.
        Tree {
            nodes: vec![Node {
                key: Key::default(),
                value: Value::default(),
                left: NIL,
                right: NIL,
                parent: NIL,
                color: Color::Black,
            }],
            free: Vec::new(),
            root: NIL,
            len: 0,
        }
    }

    fn alloc(&mut self, key: Key, value: Value) -> u32 {
        let node = Node {
            key,
            value,
            left: NIL,
            right: NIL,
            parent: NIL,
            color: Color::Red,
        };
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
        self.nodes[slot as usize].key = Key::default();
        self.nodes[slot as usize].value = Value::default();
        self.free.push(slot);
    }

    fn find(&self, key: &[u8]) -> u32 {
        let mut cur = self.root;
        while cur != NIL {
            let node = &self.nodes[cur as usize];
            match key.cmp(node.key.as_bytes()) {
                std::cmp::Ordering::Less => cur = node.left,
                std::cmp::Ordering::Greater => cur = node.right,
                std::cmp::Ordering::Equal => return cur,
            }
        }
        NIL
    }

    fn minimum(&self, mut x: u32) -> u32 {
        while self.nodes[x as usize].left != NIL {
            x = self.nodes[x as usize].left;
        }
        x
    }

    fn left_rotate(&mut self, x: u32) {
        let y = self.nodes[x as usize].right;
        let y_left = self.nodes[y as usize].left;
        self.nodes[x as usize].right = y_left;
        if y_left != NIL {
            self.nodes[y_left as usize].parent = x;
        }
        let x_parent = self.nodes[x as usize].parent;
        self.nodes[y as usize].parent = x_parent;
        if x_parent == NIL {
            self.root = y;
        } else if self.nodes[x_parent as usize].left == x {
            self.nodes[x_parent as usize].left = y;
        } else {
            self.nodes[x_parent as usize].right = y;
        }
        self.nodes[y as usize].left = x;
        self.nodes[x as usize].parent = y;
    }

    fn right_rotate(&mut self, x: u32) {
        let y = self.nodes[x as usize].left;
        let y_right = self.nodes[y as usize].right;
        self.nodes[x as usize].left = y_right;
        if y_right != NIL {
            self.nodes[y_right as usize].parent = x;
        }
        let x_parent = self.nodes[x as usize].parent;
        self.nodes[y as usize].parent = x_parent;
        if x_parent == NIL {
            self.root = y;
        } else if self.nodes[x_parent as usize].right == x {
            self.nodes[x_parent as usize].right = y;
        } else {
            self.nodes[x_parent as usize].left = y;
        }
        self.nodes[y as usize].right = x;
        self.nodes[x as usize].parent = y;
    }

    /// Insert or replace. Returns true when a new key was added.
    fn insert(&mut self, key: &[u8], value: &[u8]) -> bool {
        let mut parent = NIL;
        let mut cur = self.root;
        while cur != NIL {
            parent = cur;
            let node = &mut self.nodes[cur as usize];
            match key.cmp(node.key.as_bytes()) {
                std::cmp::Ordering::Less => cur = node.left,
                std::cmp::Ordering::Greater => cur = node.right,
                std::cmp::Ordering::Equal => {
                    node.value = Value::from(value);
                    return false;
                }
            }
        }
        let z = self.alloc(Key::from(key), Value::from(value));
        self.nodes[z as usize].parent = parent;
        if parent == NIL {
            self.root = z;
        } else if key < self.nodes[parent as usize].key.as_bytes() {
            self.nodes[parent as usize].left = z;
        } else {
            self.nodes[parent as usize].right = z;
        }
        self.len += 1;
        self.insert_fixup(z);
        true
    }

    fn insert_fixup(&mut self, mut z: u32) {
        while self.color(self.parent(z)) == Color::Red {
            let p = self.parent(z);
            let g = self.parent(p);
            if p == self.nodes[g as usize].left {
                let uncle = self.nodes[g as usize].right;
                if self.color(uncle) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if z == self.nodes[p as usize].right {
                        z = p;
                        self.left_rotate(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.right_rotate(g);
                }
            } else {
                let uncle = self.nodes[g as usize].left;
                if self.color(uncle) == Color::Red {
                    self.set_color(p, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(g, Color::Red);
                    z = g;
                } else {
                    if z == self.nodes[p as usize].left {
                        z = p;
                        self.right_rotate(z);
                    }
                    let p = self.parent(z);
                    let g = self.parent(p);
                    self.set_color(p, Color::Black);
                    self.set_color(g, Color::Red);
                    self.left_rotate(g);
                }
            }
        }
        let root = self.root;
        self.set_color(root, Color::Black);
    }

    fn transplant(&mut self, u: u32, v: u32) {
        let u_parent = self.nodes[u as usize].parent;
        if u_parent == NIL {
            self.root = v;
        } else if self.nodes[u_parent as usize].left == u {
            self.nodes[u_parent as usize].left = v;
        } else {
            self.nodes[u_parent as usize].right = v;
        }
        // Written even for the sentinel; the delete fixup reads it.
        self.nodes[v as usize].parent = u_parent;
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        let z = self.find(key);
        if z == NIL {
            return false;
        }
        let mut y = z;
        let mut y_color = self.color(y);
        let x;
        if self.nodes[z as usize].left == NIL {
            x = self.nodes[z as usize].right;
            self.transplant(z, x);
        } else if self.nodes[z as usize].right == NIL {
            x = self.nodes[z as usize].left;
            self.transplant(z, x);
        } else {
            y = self.minimum(self.nodes[z as usize].right);
            y_color = self.color(y);
            x = self.nodes[y as usize].right;
            if self.nodes[y as usize].parent == z {
                self.nodes[x as usize].parent = y;
            } else {
                self.transplant(y, x);
                let z_right = self.nodes[z as usize].right;
                self.nodes[y as usize].right = z_right;
                self.nodes[z_right as usize].parent = y;
            }
            self.transplant(z, y);
            let z_left = self.nodes[z as usize].left;
            self.nodes[y as usize].left = z_left;
            self.nodes[z_left as usize].parent = y;
            let z_color = self.color(z);
            self.set_color(y, z_color);
        }
        if y_color == Color::Black {
            self.delete_fixup(x);
        }
        self.release(z);
        self.len -= 1;
        true
    }

    fn delete_fixup(&mut self, mut x: u32) {
        while x != self.root && self.color(x) == Color::Black {
            let p = self.parent(x);
            if x == self.nodes[p as usize].left {
                let mut w = self.nodes[p as usize].right;
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(p, Color::Red);
                    self.left_rotate(p);
                    w = self.nodes[self.parent(x) as usize].right;
                }
                if self.color(self.nodes[w as usize].left) == Color::Black
                    && self.color(self.nodes[w as usize].right) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = self.parent(x);
                } else {
                    if self.color(self.nodes[w as usize].right) == Color::Black {
                        let w_left = self.nodes[w as usize].left;
                        self.set_color(w_left, Color::Black);
                        self.set_color(w, Color::Red);
                        self.right_rotate(w);
                        w = self.nodes[self.parent(x) as usize].right;
                    }
                    let p = self.parent(x);
                    let p_color = self.color(p);
                    self.set_color(w, p_color);
                    self.set_color(p, Color::Black);
                    let w_right = self.nodes[w as usize].right;
                    self.set_color(w_right, Color::Black);
                    self.left_rotate(p);
                    x = self.root;
                }
            } else {
                let mut w = self.nodes[p as usize].left;
                if self.color(w) == Color::Red {
                    self.set_color(w, Color::Black);
                    self.set_color(p, Color::Red);
                    self.right_rotate(p);
                    w = self.nodes[self.parent(x) as usize].left;
                }
                if self.color(self.nodes[w as usize].right) == Color::Black
                    && self.color(self.nodes[w as usize].left) == Color::Black
                {
                    self.set_color(w, Color::Red);
                    x = self.parent(x);
                } else {
                    if self.color(self.nodes[w as usize].left) == Color::Black {
                        let w_right = self.nodes[w as usize].right;
                        self.set_color(w_right, Color::Black);
                        self.set_color(w, Color::Red);
                        self.left_rotate(w);
                        w = self.nodes[self.parent(x) as usize].left;
                    }
                    let p = self.parent(x);
                    let p_color = self.color(p);
                    self.set_color(w, p_color);
                    self.set_color(p, Color::Black);
                    let w_left = self.nodes[w as usize].left;
                    self.set_color(w_left, Color::Black);
                    self.right_rotate(p);
                    x = self.root;
                }
            }
        }
        self.set_color(x, Color::Black);
    }

    fn color(&self, i: u32) -> Color {
        self.nodes[i as usize].color
    }

    fn set_color(&mut self, i: u32, color: Color) {
        if i != NIL || color == Color::Black {
            self.nodes[i as usize].color = color;
        }
    }

    fn parent(&self, i: u32) -> u32 {
        self.nodes[i as usize].parent
    }

    /// In-order walk, ascending key order.
    fn collect(&self) -> Vec<(Key, Value)> {
        let mut out = Vec::with_capacity(self.len);
        let mut stack = Vec::new();
        let mut cur = self.root;
        while cur != NIL || !stack.is_empty() {
            while cur != NIL {
                stack.push(cur);
                cur = self.nodes[cur as usize].left;
            }
            let Some(node) = stack.pop() else { break };
            let n = &self.nodes[node as usize];
            out.push((n.key.clone(), n.value.clone()));
            cur = n.right;
        }
        out
    }
}

/// Ordered-map engine backed by the arena red-black tree.
pub struct RBTreeEngine {
    tree: RwLock<Tree>,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl RBTreeEngine {
    /// Create an empty tree.
    pub fn new() -> Self {
        RBTreeEngine {
            tree: RwLock::new(Tree::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Ordered key/value dump, ascending.
    pub fn iter_ordered(&self) -> Vec<(Key, Value)> {
        self.tree.read().collect()
    }
}

impl Default for RBTreeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl KvEngine for RBTreeEngine {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.tree.write().insert(key, value);
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Value> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let tree = self.tree.read();
        let slot = tree.find(key);
        if slot == NIL {
            return Err(Error::NotFound);
        }
        Ok(tree.nodes[slot as usize].value.clone())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        if self.tree.write().remove(key) {
            self.deletes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            Err(Error::NotFound)
        }
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut tree = self.tree.write();
        let slot = tree.find(key);
        if slot == NIL {
            return Err(Error::NotFound);
        }
        tree.nodes[slot as usize].value = Value::from(value);
        self.writes.fetch_add(1, Ordering::Relaxed);
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
        Ok(())
    }

    fn kind(&self) -> EngineKind {
        EngineKind::RBTree
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
        *tree = Tree::new();
        for (key, value) in pairs {
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

    /// Walk the tree checking the red-black invariants; returns black height.
    fn check_invariants(tree: &Tree, node: u32) -> usize {
        if node == NIL {
            return 1;
        }
        let n = &tree.nodes[node as usize];
        if n.color == Color::Red {
            assert_eq!(
                tree.color(n.left),
                Color::Black,
                "red node with red left child"
            );
            assert_eq!(
                tree.color(n.right),
                Color::Black,
                "red node with red right child"
            );
        }
        if n.left != NIL {
            assert!(tree.nodes[n.left as usize].key < n.key, "left ordering");
        }
        if n.right != NIL {
            assert!(tree.nodes[n.right as usize].key > n.key, "right ordering");
        }
        let left_height = check_invariants(tree, n.left);
        let right_height = check_invariants(tree, n.right);
        assert_eq!(left_height, right_height, "black height mismatch");
        left_height + usize::from(n.color == Color::Black)
    }

    #[test]
    fn test_crud_roundtrip() {
        let engine = RBTreeEngine::new();
        engine.put(b"m", b"1").unwrap();
        engine.put(b"a", b"2").unwrap();
        engine.put(b"z", b"3").unwrap();
        assert_eq!(engine.count(), 3);
        assert_eq!(engine.get(b"a").unwrap(), Value::from("2"));
        engine.update(b"a", b"2'").unwrap();
        assert_eq!(engine.get(b"a").unwrap(), Value::from("2'"));
        engine.delete(b"m").unwrap();
        assert_eq!(engine.count(), 2);
        assert!(engine.get(b"m").is_err());
        assert!(engine.delete(b"m").is_err());
    }

    #[test]
    fn test_ordered_iteration() {
        let engine = RBTreeEngine::new();
        for key in ["delta", "alpha", "echo", "charlie", "bravo"] {
            engine.put(key.as_bytes(), b"v").unwrap();
        }
        let keys: Vec<_> = engine
            .iter_ordered()
            .into_iter()
            .map(|(k, _)| String::from_utf8(k.0).unwrap())
            .collect();
        assert_eq!(keys, vec!["alpha", "bravo", "charlie", "delta", "echo"]);
    }

    #[test]
    fn test_invariants_hold_under_churn() {
        let engine = RBTreeEngine::new();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut keys: Vec<u32> = (0..500).collect();
        keys.shuffle(&mut rng);
        for k in &keys {
            engine
                .put(format!("{:08}", k).as_bytes(), b"v")
                .unwrap();
        }
        {
            let tree = engine.tree.read();
            assert_eq!(tree.color(tree.root), Color::Black);
            check_invariants(&tree, tree.root);
        }

        keys.shuffle(&mut rng);
        for k in keys.iter().take(250) {
            engine.delete(format!("{:08}", k).as_bytes()).unwrap();
        }
        assert_eq!(engine.count(), 250);
        {
            let tree = engine.tree.read();
            assert_eq!(tree.color(tree.root), Color::Black);
            check_invariants(&tree, tree.root);
        }
        for k in keys.iter().skip(250) {
            assert!(engine.get(format!("{:08}", k).as_bytes()).is_ok());
        }
    }

    #[test]
    fn test_delete_to_empty_and_reuse() {
        let engine = RBTreeEngine::new();
        for i in 0..50 {
            engine.put(format!("k{}", i).as_bytes(), b"v").unwrap();
        }
        for i in 0..50 {
            engine.delete(format!("k{}", i).as_bytes()).unwrap();
        }
        assert_eq!(engine.count(), 0);
        // Freed slots get reused.
        for i in 0..50 {
            engine.put(format!("r{}", i).as_bytes(), b"v").unwrap();
        }
        assert_eq!(engine.count(), 50);
        let tree = engine.tree.read();
        assert!(tree.nodes.len() <= 102, "arena grew past reuse: {}", tree.nodes.len());
    }

    #[test]
    fn test_state_roundtrip() {
        let engine = RBTreeEngine::new();
        for i in 0..100 {
            engine
                .put(format!("key{:03}", i).as_bytes(), format!("{}", i).as_bytes())
                .unwrap();
        }
        let payload = engine.serialize_state().unwrap();
        let restored = RBTreeEngine::new();
        restored.restore_state(&payload).unwrap();
        assert_eq!(restored.count(), 100);
        assert_eq!(restored.get(b"key042").unwrap(), Value::from("42"));
        let tree = restored.tree.read();
        check_invariants(&tree, tree.root);
    }
}

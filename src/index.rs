//! Self-balancing address index.
//!
//! An AVL tree keyed by allocation start address. Each key maps to a
//! bucket of values (registry record handles) because addresses are
//! reused after free: several past allocations can share one start
//! address. Buckets preserve insertion order.
//!
//! Nodes live in a pool inside the tree and reference each other by
//! `u32` handles; rebalancing works on the recursion unwind, so nodes
//! carry no parent links.

use crate::arena::NIL;

#[derive(Debug)]
struct Node {
    key: u64,
    height: i32,
    left: u32,
    right: u32,
    entries: Vec<u32>,
}

/// AVL tree from start address to a bucket of record handles.
#[derive(Debug, Default)]
pub struct AvlIndex {
    nodes: Vec<Node>,
    free: Vec<u32>,
    root: u32,
    key_count: usize,
}

impl AvlIndex {
    /// An empty index.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: NIL,
            key_count: 0,
        }
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.key_count
    }

    /// True if the index holds no keys.
    pub fn is_empty(&self) -> bool {
        self.key_count == 0
    }

    /// Height of the tree (0 when empty).
    pub fn height(&self) -> i32 {
        self.node_height(self.root)
    }

    /// Append `value` to the bucket at `key`, creating the key if absent.
    pub fn insert(&mut self, key: u64, value: u32) {
        self.root = self.insert_at(self.root, key, value);
    }

    /// The bucket stored at exactly `key`.
    pub fn get(&self, key: u64) -> Option<&[u32]> {
        let mut current = self.root;
        while current != NIL {
            let node = self.node(current);
            current = match key.cmp(&node.key) {
                std::cmp::Ordering::Less => node.left,
                std::cmp::Ordering::Greater => node.right,
                std::cmp::Ordering::Equal => return Some(&node.entries),
            };
        }
        None
    }

    /// The entry with the largest key `<= key`, or `None` if every key
    /// is greater. This is the address-attribution lookup: the candidate
    /// allocation containing an address is the one at the largest start
    /// at or below it.
    pub fn lower_entry(&self, key: u64) -> Option<(u64, &[u32])> {
        let mut current = self.root;
        let mut best = NIL;
        while current != NIL {
            let node = self.node(current);
            if node.key > key {
                current = node.left;
            } else {
                best = current;
                if node.key == key {
                    break;
                }
                current = node.right;
            }
        }
        if best == NIL {
            None
        } else {
            let node = self.node(best);
            Some((node.key, &node.entries))
        }
    }

    /// True if `key` is present.
    pub fn contains_key(&self, key: u64) -> bool {
        self.get(key).is_some()
    }

    /// True if any bucket contains `value`.
    pub fn contains_value(&self, value: u32) -> bool {
        self.iter().any(|(_, entries)| entries.contains(&value))
    }

    /// Remove `key` and its whole bucket. No-op if absent.
    pub fn remove_key(&mut self, key: u64) {
        self.root = self.remove_at(self.root, key, None);
    }

    /// Remove one occurrence of `value` from the bucket at `key`; the
    /// key itself is removed once its bucket drains. No-op if absent.
    pub fn remove_key_value(&mut self, key: u64, value: u32) {
        self.root = self.remove_at(self.root, key, Some(value));
    }

    /// Drop every key and node.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.root = NIL;
        self.key_count = 0;
    }

    /// Iterate `(key, bucket)` pairs in ascending key order.
    pub fn iter(&self) -> AvlIter<'_> {
        let mut stack = Vec::new();
        let mut current = self.root;
        while current != NIL {
            stack.push(current);
            current = self.node(current).left;
        }
        AvlIter { index: self, stack }
    }

    fn node(&self, idx: u32) -> &Node {
        &self.nodes[idx as usize]
    }

    fn node_mut(&mut self, idx: u32) -> &mut Node {
        &mut self.nodes[idx as usize]
    }

    fn node_height(&self, idx: u32) -> i32 {
        if idx == NIL {
            0
        } else {
            self.node(idx).height
        }
    }

    fn alloc_node(&mut self, key: u64, value: u32) -> u32 {
        self.key_count += 1;
        let node = Node {
            key,
            height: 1,
            left: NIL,
            right: NIL,
            entries: vec![value],
        };
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = node;
            idx
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as u32
        }
    }

    fn release_node(&mut self, idx: u32) {
        self.key_count -= 1;
        self.node_mut(idx).entries = Vec::new();
        self.free.push(idx);
    }

    fn update_height(&mut self, idx: u32) {
        let h = 1 + self
            .node_height(self.node(idx).left)
            .max(self.node_height(self.node(idx).right));
        self.node_mut(idx).height = h;
    }

    fn balance_factor(&self, idx: u32) -> i32 {
        let node = self.node(idx);
        self.node_height(node.left) - self.node_height(node.right)
    }

    fn rotate_right(&mut self, z: u32) -> u32 {
        let y = self.node(z).left;
        let t = self.node(y).right;
        self.node_mut(y).right = z;
        self.node_mut(z).left = t;
        self.update_height(z);
        self.update_height(y);
        y
    }

    fn rotate_left(&mut self, z: u32) -> u32 {
        let y = self.node(z).right;
        let t = self.node(y).left;
        self.node_mut(y).left = z;
        self.node_mut(z).right = t;
        self.update_height(z);
        self.update_height(y);
        y
    }

    /// Restore the AVL property at `idx` after an insert or remove
    /// below it. Applies the four rotation cases (LL, RR, LR, RL).
    fn rebalance(&mut self, idx: u32) -> u32 {
        self.update_height(idx);
        let balance = self.balance_factor(idx);
        if balance > 1 {
            let left = self.node(idx).left;
            if self.balance_factor(left) < 0 {
                // LR
                let new_left = self.rotate_left(left);
                self.node_mut(idx).left = new_left;
            }
            return self.rotate_right(idx);
        }
        if balance < -1 {
            let right = self.node(idx).right;
            if self.balance_factor(right) > 0 {
                // RL
                let new_right = self.rotate_right(right);
                self.node_mut(idx).right = new_right;
            }
            return self.rotate_left(idx);
        }
        idx
    }

    fn insert_at(&mut self, idx: u32, key: u64, value: u32) -> u32 {
        if idx == NIL {
            return self.alloc_node(key, value);
        }
        match key.cmp(&self.node(idx).key) {
            std::cmp::Ordering::Less => {
                let new_left = self.insert_at(self.node(idx).left, key, value);
                self.node_mut(idx).left = new_left;
            }
            std::cmp::Ordering::Greater => {
                let new_right = self.insert_at(self.node(idx).right, key, value);
                self.node_mut(idx).right = new_right;
            }
            std::cmp::Ordering::Equal => {
                self.node_mut(idx).entries.push(value);
                return idx;
            }
        }
        self.rebalance(idx)
    }

    /// Remove `key` (entirely, or just one `value` from its bucket)
    /// from the subtree at `idx`; returns the new subtree root.
    fn remove_at(&mut self, idx: u32, key: u64, value: Option<u32>) -> u32 {
        if idx == NIL {
            return NIL;
        }
        match key.cmp(&self.node(idx).key) {
            std::cmp::Ordering::Less => {
                let new_left = self.remove_at(self.node(idx).left, key, value);
                self.node_mut(idx).left = new_left;
            }
            std::cmp::Ordering::Greater => {
                let new_right = self.remove_at(self.node(idx).right, key, value);
                self.node_mut(idx).right = new_right;
            }
            std::cmp::Ordering::Equal => {
                if let Some(value) = value {
                    let entries = &mut self.node_mut(idx).entries;
                    if let Some(pos) = entries.iter().position(|v| *v == value) {
                        entries.remove(pos);
                    }
                    if !self.node(idx).entries.is_empty() {
                        // Other allocations still start at this address.
                        return idx;
                    }
                }
                return self.remove_node(idx);
            }
        }
        self.rebalance(idx)
    }

    /// Unlink the node at `idx` from the tree; returns its replacement.
    fn remove_node(&mut self, idx: u32) -> u32 {
        let (left, right) = {
            let node = self.node(idx);
            (node.left, node.right)
        };
        let replacement = if left == NIL {
            right
        } else if right == NIL {
            left
        } else {
            // Two children: lift the in-order successor's key and bucket
            // into this node, then delete the successor from the right
            // subtree.
            let mut succ = right;
            while self.node(succ).left != NIL {
                succ = self.node(succ).left;
            }
            let succ_key = self.node(succ).key;
            let succ_entries = std::mem::take(&mut self.node_mut(succ).entries);
            let new_right = self.remove_at(right, succ_key, None);
            let node = self.node_mut(idx);
            node.key = succ_key;
            node.entries = succ_entries;
            node.right = new_right;
            return self.rebalance(idx);
        };
        self.release_node(idx);
        if replacement == NIL {
            NIL
        } else {
            self.rebalance(replacement)
        }
    }

    /// Validate balance, ordering and height bookkeeping over the whole
    /// tree. Panics on the first violation. Test and debug aid.
    pub fn check_invariants(&self) {
        self.check_subtree(self.root, None, None);
    }

    fn check_subtree(&self, idx: u32, min: Option<u64>, max: Option<u64>) -> i32 {
        if idx == NIL {
            return 0;
        }
        let node = self.node(idx);
        if let Some(min) = min {
            assert!(node.key > min, "ordering violated at key {}", node.key);
        }
        if let Some(max) = max {
            assert!(node.key < max, "ordering violated at key {}", node.key);
        }
        assert!(
            !node.entries.is_empty(),
            "key {} has an empty bucket",
            node.key
        );
        let lh = self.check_subtree(node.left, min, Some(node.key));
        let rh = self.check_subtree(node.right, Some(node.key), max);
        assert!(
            (lh - rh).abs() <= 1,
            "balance violated at key {}: left {lh}, right {rh}",
            node.key
        );
        let height = 1 + lh.max(rh);
        assert_eq!(
            node.height, height,
            "stale height at key {}: stored {}, actual {height}",
            node.key, node.height
        );
        height
    }
}

/// In-order iterator over `(key, bucket)` pairs.
pub struct AvlIter<'a> {
    index: &'a AvlIndex,
    stack: Vec<u32>,
}

impl<'a> Iterator for AvlIter<'a> {
    type Item = (u64, &'a [u32]);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.stack.pop()?;
        let node = self.index.node(idx);
        let mut current = node.right;
        while current != NIL {
            self.stack.push(current);
            current = self.index.node(current).left;
        }
        Some((node.key, &node.entries))
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Lodestone - Entity Query Engine
// Copyright (C) 2026 Lodestone Contributors (https://github.com/lodestone-db)

//! # Code Store Interface
//!
//! Entities can carry executable code trees as label values. The query
//! engine never interprets those trees — it only needs structural equality
//! (for value predicates) and a shared-node count (for the code distance
//! term). [`CodeStore`] is that contract; [`ArenaCodeStore`] is the
//! in-process implementation over an index-addressable arena.
//!
//! Nodes are addressed as `(variant tag, arena index)` pairs rather than
//! pointers, so handles stay valid across moves and serialize trivially.
//! Parent edges are not stored; a "needs cycle check" flag set on mutation
//! tells readers when the cycle-safe recursion is required.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};

use crate::strings::StringId;

/// Handle to a node in a code store: variant tag plus arena index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodeHandle {
    pub variant: u32,
    pub index: u32,
}

/// What the query engine is allowed to ask of a code store.
pub trait CodeStore: Send + Sync {
    /// Structural equality of two trees (cycle-safe).
    fn deep_equal(&self, a: CodeHandle, b: CodeHandle) -> bool;

    /// Number of nodes reachable from `h`, counting shared nodes once.
    fn node_count(&self, h: CodeHandle) -> usize;

    /// Number of nodes of `a` with a structurally identical counterpart in
    /// `b` (multiset intersection of subtree shapes). Drives the code
    /// distance term.
    fn shared_node_count(&self, a: CodeHandle, b: CodeHandle) -> usize;

    /// Register `h` as an externally-held root the collector must preserve.
    fn keep_ref(&self, h: CodeHandle);

    /// Drop an external root registration.
    fn free_ref(&self, h: CodeHandle);
}

// A two-flag bitset does not justify the bitflags crate; this macro keeps
// the call sites reading like it.
macro_rules! bitflags_lite {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($ty);

        impl $name {
            $(pub const $flag: $name = $name($value);)*

            #[inline]
            pub fn contains(self, other: $name) -> bool {
                (self.0 & other.0) == other.0
            }

            #[inline]
            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            #[inline]
            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }
        }
    };
}

bitflags_lite! {
    /// Per-node bookkeeping bits maintained by [`ArenaCodeStore::update_flags_for_tree`].
    pub struct NodeFlags: u8 {
        const NEEDS_CYCLE_CHECK = 0b01;
        const IDEMPOTENT = 0b10;
    }
}

#[derive(Debug, Clone, Default)]
struct Node {
    variant: u32,
    number: f64,
    string: StringId,
    children: Vec<u32>,
    flags: NodeFlags,
    in_use: bool,
    mark: bool,
}

#[derive(Default)]
struct Arena {
    nodes: Vec<Node>,
    free: Vec<u32>,
    /// External root registrations (index -> count) the collector preserves.
    roots: HashMap<u32, usize>,
}

/// Index-addressable arena code store with mark-sweep collection.
pub struct ArenaCodeStore {
    arena: RwLock<Arena>,
    /// Held for read while any thread may touch code cells; the collector
    /// takes it for write, so GC only runs when no reader is active.
    mod_lock: RwLock<()>,
}

impl ArenaCodeStore {
    pub fn new() -> Self {
        Self { arena: RwLock::new(Arena::default()), mod_lock: RwLock::new(()) }
    }

    /// Acquire the memory-modification guard. Release it before taking any
    /// other engine write lock or invoking [`Self::collect_garbage`].
    pub fn hold_modifications(&self) -> RwLockReadGuard<'_, ()> {
        self.mod_lock.read()
    }

    /// Allocate a leaf node of the given variant.
    pub fn alloc(&self, variant: u32) -> CodeHandle {
        let mut arena = self.arena.write();
        let node = Node { variant, in_use: true, ..Node::default() };
        let index = match arena.free.pop() {
            Some(i) => {
                arena.nodes[i as usize] = node;
                i
            }
            None => {
                arena.nodes.push(node);
                (arena.nodes.len() - 1) as u32
            }
        };
        CodeHandle { variant, index }
    }

    pub fn alloc_number(&self, variant: u32, number: f64) -> CodeHandle {
        let h = self.alloc(variant);
        self.arena.write().nodes[h.index as usize].number = number;
        h
    }

    pub fn alloc_string(&self, variant: u32, string: StringId) -> CodeHandle {
        let h = self.alloc(variant);
        self.arena.write().nodes[h.index as usize].string = string;
        h
    }

    /// Append `child` under `parent` and flag the tree for cycle checking
    /// if the child is already reachable elsewhere.
    pub fn add_child(&self, parent: CodeHandle, child: CodeHandle) {
        let mut arena = self.arena.write();
        arena.nodes[parent.index as usize].children.push(child.index);
    }

    /// Return a node (not its children) to the free list.
    pub fn free(&self, h: CodeHandle) {
        let mut arena = self.arena.write();
        if let Some(node) = arena.nodes.get_mut(h.index as usize) {
            if node.in_use {
                node.in_use = false;
                node.children.clear();
                arena.free.push(h.index);
            }
        }
    }

    /// Deep-copy the subtree rooted at `h`, sharing nothing with the source.
    pub fn deep_copy(&self, h: CodeHandle) -> CodeHandle {
        fn copy(arena: &mut Arena, index: u32, copies: &mut HashMap<u32, u32>) -> u32 {
            if let Some(&done) = copies.get(&index) {
                return done;
            }
            let src = arena.nodes[index as usize].clone();
            let new_node = Node { in_use: true, mark: false, children: Vec::new(), ..src.clone() };
            let new_index = match arena.free.pop() {
                Some(i) => {
                    arena.nodes[i as usize] = new_node;
                    i
                }
                None => {
                    arena.nodes.push(new_node);
                    (arena.nodes.len() - 1) as u32
                }
            };
            copies.insert(index, new_index);
            let children: Vec<u32> =
                src.children.iter().map(|&c| copy(arena, c, copies)).collect();
            arena.nodes[new_index as usize].children = children;
            new_index
        }

        let mut arena = self.arena.write();
        let variant = arena.nodes[h.index as usize].variant;
        let mut copies = HashMap::new();
        let index = copy(&mut arena, h.index, &mut copies);
        CodeHandle { variant, index }
    }

    /// Post-order walk recomputing the bookkeeping flags of a tree:
    /// `NEEDS_CYCLE_CHECK` when any node is reachable twice, `IDEMPOTENT`
    /// when a node and all of its children are.
    pub fn update_flags_for_tree(&self, h: CodeHandle) {
        fn walk(arena: &mut Arena, index: u32, seen: &mut HashSet<u32>) -> (bool, bool) {
            if !seen.insert(index) {
                // revisiting a node: the tree shares structure
                return (true, arena.nodes[index as usize].flags.contains(NodeFlags::IDEMPOTENT));
            }
            let children = arena.nodes[index as usize].children.clone();
            let mut needs_cycle_check = false;
            let mut idempotent = true;
            for c in children {
                let (ncc, idem) = walk(arena, c, seen);
                needs_cycle_check |= ncc;
                idempotent &= idem;
            }
            let node = &mut arena.nodes[index as usize];
            let mut flags = NodeFlags::default();
            if needs_cycle_check {
                flags.insert(NodeFlags::NEEDS_CYCLE_CHECK);
            }
            if idempotent {
                flags.insert(NodeFlags::IDEMPOTENT);
            }
            node.flags = flags;
            (needs_cycle_check, idempotent)
        }

        let mut arena = self.arena.write();
        let mut seen = HashSet::new();
        walk(&mut arena, h.index, &mut seen);
    }

    pub fn flags(&self, h: CodeHandle) -> NodeFlags {
        self.arena.read().nodes[h.index as usize].flags
    }

    /// Mark-sweep over the arena, preserving registered roots. Blocks until
    /// no thread holds the modification guard.
    pub fn collect_garbage(&self) -> usize {
        let _exclusive = self.mod_lock.write();
        let mut arena = self.arena.write();

        for node in arena.nodes.iter_mut() {
            node.mark = false;
        }

        let roots: Vec<u32> = arena.roots.keys().copied().collect();
        let mut stack = roots;
        while let Some(index) = stack.pop() {
            let node = &mut arena.nodes[index as usize];
            if node.mark || !node.in_use {
                continue;
            }
            node.mark = true;
            stack.extend(node.children.iter().copied());
        }

        let mut swept = 0;
        for index in 0..arena.nodes.len() {
            let node = &mut arena.nodes[index];
            if node.in_use && !node.mark {
                node.in_use = false;
                node.children.clear();
                arena.free.push(index as u32);
                swept += 1;
            }
        }
        swept
    }

    pub fn live_nodes(&self) -> usize {
        self.arena.read().nodes.iter().filter(|n| n.in_use).count()
    }

    /// Structural hash of every subtree under `index`, appended to `out`.
    fn subtree_hashes(arena: &Arena, index: u32, out: &mut Vec<u64>, seen: &mut HashSet<u32>) -> u64 {
        let node = &arena.nodes[index as usize];
        let mut hasher = DefaultHasher::new();
        node.variant.hash(&mut hasher);
        node.number.to_bits().hash(&mut hasher);
        node.string.hash(&mut hasher);

        if seen.insert(index) {
            for &c in &node.children {
                let ch = Self::subtree_hashes(arena, c, out, seen);
                ch.hash(&mut hasher);
            }
            seen.remove(&index);
        }

        let h = hasher.finish();
        out.push(h);
        h
    }
}

impl Default for ArenaCodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeStore for ArenaCodeStore {
    fn deep_equal(&self, a: CodeHandle, b: CodeHandle) -> bool {
        fn eq(arena: &Arena, a: u32, b: u32, visiting: &mut HashSet<(u32, u32)>) -> bool {
            if a == b {
                return true;
            }
            if !visiting.insert((a, b)) {
                // already comparing this pair further up the stack
                return true;
            }
            let na = &arena.nodes[a as usize];
            let nb = &arena.nodes[b as usize];
            let result = na.variant == nb.variant
                && na.number.to_bits() == nb.number.to_bits()
                && na.string == nb.string
                && na.children.len() == nb.children.len()
                && na
                    .children
                    .iter()
                    .zip(nb.children.iter())
                    .all(|(&ca, &cb)| eq(arena, ca, cb, visiting));
            visiting.remove(&(a, b));
            result
        }

        let arena = self.arena.read();
        if a.index as usize >= arena.nodes.len() || b.index as usize >= arena.nodes.len() {
            return false;
        }
        eq(&arena, a.index, b.index, &mut HashSet::new())
    }

    fn node_count(&self, h: CodeHandle) -> usize {
        let arena = self.arena.read();
        if h.index as usize >= arena.nodes.len() {
            return 0;
        }
        let mut seen = HashSet::new();
        let mut stack = vec![h.index];
        while let Some(index) = stack.pop() {
            if seen.insert(index) {
                stack.extend(arena.nodes[index as usize].children.iter().copied());
            }
        }
        seen.len()
    }

    fn shared_node_count(&self, a: CodeHandle, b: CodeHandle) -> usize {
        let arena = self.arena.read();
        if a.index as usize >= arena.nodes.len() || b.index as usize >= arena.nodes.len() {
            return 0;
        }

        let mut hashes_a = Vec::new();
        Self::subtree_hashes(&arena, a.index, &mut hashes_a, &mut HashSet::new());
        let mut hashes_b = Vec::new();
        Self::subtree_hashes(&arena, b.index, &mut hashes_b, &mut HashSet::new());

        let mut counts: HashMap<u64, usize> = HashMap::new();
        for h in hashes_b {
            *counts.entry(h).or_insert(0) += 1;
        }
        let mut shared = 0;
        for h in hashes_a {
            if let Some(c) = counts.get_mut(&h) {
                if *c > 0 {
                    *c -= 1;
                    shared += 1;
                }
            }
        }
        shared
    }

    fn keep_ref(&self, h: CodeHandle) {
        let mut arena = self.arena.write();
        *arena.roots.entry(h.index).or_insert(0) += 1;
    }

    fn free_ref(&self, h: CodeHandle) {
        let mut arena = self.arena.write();
        if let Some(count) = arena.roots.get_mut(&h.index) {
            *count -= 1;
            if *count == 0 {
                arena.roots.remove(&h.index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: u32 = 1;
    const NUM: u32 = 2;

    fn leaf_list(store: &ArenaCodeStore, values: &[f64]) -> CodeHandle {
        let root = store.alloc(LIST);
        for &v in values {
            let leaf = store.alloc_number(NUM, v);
            store.add_child(root, leaf);
        }
        root
    }

    #[test]
    fn test_deep_equal_structural() {
        let store = ArenaCodeStore::new();
        let a = leaf_list(&store, &[1.0, 2.0, 3.0]);
        let b = leaf_list(&store, &[1.0, 2.0, 3.0]);
        let c = leaf_list(&store, &[1.0, 2.0]);
        assert!(store.deep_equal(a, b));
        assert!(!store.deep_equal(a, c));
        assert!(store.deep_equal(a, a));
    }

    #[test]
    fn test_node_and_shared_counts() {
        let store = ArenaCodeStore::new();
        let a = leaf_list(&store, &[1.0, 2.0, 3.0]);
        let b = leaf_list(&store, &[1.0, 2.0, 9.0]);
        assert_eq!(store.node_count(a), 4);
        // the two common leaves match; the differing leaf and the differing
        // roots do not
        assert_eq!(store.shared_node_count(a, b), 2);
        let copy = store.deep_copy(a);
        assert_eq!(store.shared_node_count(a, copy), 4);
    }

    #[test]
    fn test_gc_preserves_roots() {
        let store = ArenaCodeStore::new();
        let kept = leaf_list(&store, &[1.0, 2.0]);
        let lost = leaf_list(&store, &[3.0]);
        store.keep_ref(kept);

        let swept = store.collect_garbage();
        assert_eq!(swept, 2); // `lost` root and its leaf
        assert_eq!(store.live_nodes(), 3);
        assert!(store.deep_equal(kept, kept));

        store.free_ref(kept);
        store.collect_garbage();
        assert_eq!(store.live_nodes(), 0);
        let _ = lost;
    }

    #[test]
    fn test_update_flags_shared_structure() {
        let store = ArenaCodeStore::new();
        let root = store.alloc(LIST);
        let shared = store.alloc_number(NUM, 5.0);
        store.add_child(root, shared);
        store.add_child(root, shared);

        store.update_flags_for_tree(root);
        assert!(store.flags(root).contains(NodeFlags::NEEDS_CYCLE_CHECK));
        assert!(store.flags(root).contains(NodeFlags::IDEMPOTENT));

        let plain = leaf_list(&store, &[1.0]);
        store.update_flags_for_tree(plain);
        assert!(!store.flags(plain).contains(NodeFlags::NEEDS_CYCLE_CHECK));
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Lodestone - Entity Query Engine
// Copyright (C) 2026 Lodestone Contributors (https://github.com/lodestone-db)

//! # Reference-Counted String Intern Pool
//!
//! Every label, nominal value, and seed string in the engine is interned
//! once and referred to by a dense [`StringId`] afterwards, so equality is
//! an integer compare and hash maps key on `u32`.
//!
//! ## Locking discipline
//!
//! The pool is guarded by a single `parking_lot::RwLock`, but reference
//! counts are atomics, so the common operations (add a reference, drop a
//! reference that does not reach zero) only ever take the **read** lock.
//! The write lock is needed for exactly two things: creating a new ID and
//! reclaiming an ID whose count hit zero.
//!
//! Batch release is a two-phase protocol: decrement every count under the
//! read lock; if none reached zero, done. Otherwise put the counts back,
//! upgrade to the write lock, and re-decrement while reclaiming — one lock
//! upgrade per batch instead of one per ID.
//!
//! ## Static IDs
//!
//! IDs below `num_static` are immortal: never counted, never reclaimed.
//! [`StringId::NOT_A_STRING`] (0) and [`StringId::EMPTY_STRING`] (1) are
//! always static and reserved.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};

/// Dense identifier of an interned string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StringId(pub u32);

impl StringId {
    /// Sentinel for "this is not a string" (null / NaN slots).
    pub const NOT_A_STRING: StringId = StringId(0);
    /// The interned empty string.
    pub const EMPTY_STRING: StringId = StringId(1);

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Is this a real string id (not the null sentinel)?
    #[inline]
    pub fn is_string(self) -> bool {
        self != StringId::NOT_A_STRING
    }
}

struct Entry {
    /// `None` marks a reclaimed slot waiting on the free list.
    text: Option<String>,
    /// Signed so that concurrent over-release stays comparable instead of
    /// wrapping; static entries stay at zero forever.
    refs: AtomicI64,
}

struct PoolInner {
    entries: Vec<Entry>,
    ids: HashMap<String, StringId>,
    /// Reclaimed IDs, reused lowest-first.
    free_ids: BinaryHeap<Reverse<u32>>,
}

/// The process-wide intern pool. Shared via `Arc`; all methods take `&self`.
pub struct StringPool {
    inner: RwLock<PoolInner>,
    num_static: u32,
}

impl StringPool {
    /// A pool with only the two reserved static IDs.
    pub fn new() -> Self {
        Self::with_static_strings(&[])
    }

    /// A pool whose first `2 + extra.len()` IDs are immortal static strings.
    ///
    /// Slots 0 and 1 are always the not-a-string sentinel and the empty
    /// string; `extra` strings follow in order.
    pub fn with_static_strings(extra: &[&str]) -> Self {
        let mut entries = Vec::with_capacity(2 + extra.len());
        let mut ids = HashMap::with_capacity(1 + extra.len());

        // id 0: reserved sentinel, intentionally unresolvable
        entries.push(Entry { text: None, refs: AtomicI64::new(0) });
        // id 1: the empty string
        entries.push(Entry { text: Some(String::new()), refs: AtomicI64::new(0) });
        ids.insert(String::new(), StringId::EMPTY_STRING);

        for s in extra {
            let id = StringId(entries.len() as u32);
            entries.push(Entry { text: Some((*s).to_string()), refs: AtomicI64::new(0) });
            ids.insert((*s).to_string(), id);
        }

        let num_static = entries.len() as u32;
        Self {
            inner: RwLock::new(PoolInner { entries, ids, free_ids: BinaryHeap::new() }),
            num_static,
        }
    }

    /// Is `id` immortal (never reference-counted)?
    #[inline]
    pub fn is_static(&self, id: StringId) -> bool {
        id.0 < self.num_static
    }

    /// Intern `s`, creating one reference. Returns the (possibly reused) ID.
    pub fn intern(&self, s: &str) -> StringId {
        {
            let inner = self.inner.read();
            if let Some(&id) = inner.ids.get(s) {
                if !self.is_static(id) {
                    inner.entries[id.as_usize()].refs.fetch_add(1, AtomicOrdering::Relaxed);
                }
                return id;
            }
        }

        let mut inner = self.inner.write();
        // another thread may have interned between the locks
        if let Some(&id) = inner.ids.get(s) {
            if !self.is_static(id) {
                inner.entries[id.as_usize()].refs.fetch_add(1, AtomicOrdering::Relaxed);
            }
            return id;
        }

        let id = match inner.free_ids.pop() {
            Some(Reverse(slot)) => {
                let id = StringId(slot);
                inner.entries[slot as usize] = Entry {
                    text: Some(s.to_string()),
                    refs: AtomicI64::new(1),
                };
                id
            }
            None => {
                let id = StringId(inner.entries.len() as u32);
                inner.entries.push(Entry {
                    text: Some(s.to_string()),
                    refs: AtomicI64::new(1),
                });
                id
            }
        };
        inner.ids.insert(s.to_string(), id);
        id
    }

    /// Look up an existing ID without creating a reference.
    pub fn get(&self, s: &str) -> Option<StringId> {
        self.inner.read().ids.get(s).copied()
    }

    /// Add one reference to `id`. No-op on static or sentinel IDs.
    pub fn add_ref(&self, id: StringId) -> StringId {
        if !self.is_static(id) {
            let inner = self.inner.read();
            if let Some(entry) = inner.entries.get(id.as_usize()) {
                entry.refs.fetch_add(1, AtomicOrdering::Relaxed);
            }
        }
        id
    }

    /// Add one reference to every ID in `ids`, in one read-lock acquisition.
    pub fn add_refs(&self, ids: &[StringId]) {
        if ids.is_empty() {
            return;
        }
        let inner = self.inner.read();
        for &id in ids {
            if self.is_static(id) {
                continue;
            }
            if let Some(entry) = inner.entries.get(id.as_usize()) {
                entry.refs.fetch_add(1, AtomicOrdering::Relaxed);
            }
        }
    }

    /// Drop one reference to `id`, reclaiming the slot if it was the last.
    pub fn release(&self, id: StringId) {
        if self.is_static(id) {
            return;
        }

        {
            let inner = self.inner.read();
            let entry = match inner.entries.get(id.as_usize()) {
                Some(e) => e,
                None => return,
            };
            let prev = entry.refs.fetch_sub(1, AtomicOrdering::AcqRel);
            if prev != 1 {
                return;
            }
            // count hit zero: restore it and retry under the write lock
            entry.refs.fetch_add(1, AtomicOrdering::AcqRel);
        }

        let mut inner = self.inner.write();
        if let Some(entry) = inner.entries.get(id.as_usize()) {
            let prev = entry.refs.fetch_sub(1, AtomicOrdering::AcqRel);
            if prev == 1 {
                Self::reclaim(&mut inner, id);
            }
        }
    }

    /// Drop one reference to every ID in `ids` with the two-phase protocol:
    /// decrement under the read lock, and only upgrade to the write lock if
    /// some count actually reached zero.
    pub fn release_batch(&self, ids: &[StringId]) {
        if ids.is_empty() {
            return;
        }

        {
            let inner = self.inner.read();
            let mut needs_reclaim = false;
            for &id in ids {
                if self.is_static(id) {
                    continue;
                }
                if let Some(entry) = inner.entries.get(id.as_usize()) {
                    if entry.refs.fetch_sub(1, AtomicOrdering::AcqRel) == 1 {
                        needs_reclaim = true;
                    }
                }
            }
            if !needs_reclaim {
                return;
            }
            // put every count back while waiting for the write lock
            for &id in ids {
                if self.is_static(id) {
                    continue;
                }
                if let Some(entry) = inner.entries.get(id.as_usize()) {
                    entry.refs.fetch_add(1, AtomicOrdering::AcqRel);
                }
            }
        }

        let mut inner = self.inner.write();
        for &id in ids {
            if self.is_static(id) {
                continue;
            }
            let prev = match inner.entries.get(id.as_usize()) {
                Some(entry) => entry.refs.fetch_sub(1, AtomicOrdering::AcqRel),
                None => continue,
            };
            if prev == 1 {
                Self::reclaim(&mut inner, id);
            }
        }
    }

    fn reclaim(inner: &mut PoolInner, id: StringId) {
        let entry = &mut inner.entries[id.as_usize()];
        if let Some(text) = entry.text.take() {
            inner.ids.remove(&text);
        }
        inner.free_ids.push(Reverse(id.0));
    }

    /// Resolve an ID to its string. `None` for the sentinel and reclaimed IDs.
    pub fn resolve(&self, id: StringId) -> Option<MappedRwLockReadGuard<'_, str>> {
        let inner = self.inner.read();
        RwLockReadGuard::try_map(inner, |p| {
            p.entries.get(id.as_usize()).and_then(|e| e.text.as_deref())
        })
        .ok()
    }

    /// Resolve an ID to an owned string, empty if unknown.
    pub fn resolve_owned(&self, id: StringId) -> String {
        self.resolve(id).map(|s| s.to_string()).unwrap_or_default()
    }

    /// Number of live strings, static IDs included.
    pub fn strings_in_use(&self) -> usize {
        self.inner.read().ids.len()
    }

    /// Total outstanding references across all non-static IDs.
    pub fn dynamic_refs_in_use(&self) -> i64 {
        let inner = self.inner.read();
        inner
            .entries
            .iter()
            .enumerate()
            .filter(|(i, _)| *i as u32 >= self.num_static)
            .map(|(_, e)| e.refs.load(AtomicOrdering::Relaxed))
            .sum()
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

/// An owned reference to an interned string: clones increment, drops release.
pub struct StringRef {
    pool: Arc<StringPool>,
    id: StringId,
}

impl StringRef {
    /// Intern `s` in `pool` and hold a reference to it.
    pub fn new(pool: Arc<StringPool>, s: &str) -> Self {
        let id = pool.intern(s);
        Self { pool, id }
    }

    /// Adopt an ID that already carries a reference owned by the caller.
    pub fn from_owned_id(pool: Arc<StringPool>, id: StringId) -> Self {
        Self { pool, id }
    }

    #[inline]
    pub fn id(&self) -> StringId {
        self.id
    }

    pub fn as_string(&self) -> String {
        self.pool.resolve_owned(self.id)
    }
}

impl Clone for StringRef {
    fn clone(&self) -> Self {
        self.pool.add_ref(self.id);
        Self { pool: Arc::clone(&self.pool), id: self.id }
    }
}

impl Drop for StringRef {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

/// Natural-order string comparison: maximal digit runs compare as numbers,
/// everything else compares bytewise, and fully tied strings fall back to a
/// plain byte compare (so `"a02"` and `"a2"` still order deterministically).
pub fn natural_compare(a: &str, b: &str) -> Ordering {
    let ab = a.as_bytes();
    let bb = b.as_bytes();
    let (mut i, mut j) = (0usize, 0usize);

    while i < ab.len() && j < bb.len() {
        let ca = ab[i];
        let cb = bb[j];

        if ca.is_ascii_digit() && cb.is_ascii_digit() {
            let (za, ea) = digit_run(ab, i);
            let (zb, eb) = digit_run(bb, j);

            // more significant digits means a larger number
            let la = ea - za;
            let lb = eb - zb;
            match la.cmp(&lb) {
                Ordering::Equal => {}
                other => return other,
            }
            match ab[za..ea].cmp(&bb[zb..eb]) {
                Ordering::Equal => {}
                other => return other,
            }

            i = ea;
            j = eb;
        } else {
            match ca.cmp(&cb) {
                Ordering::Equal => {}
                other => return other,
            }
            i += 1;
            j += 1;
        }
    }

    match (ab.len() - i).cmp(&(bb.len() - j)) {
        Ordering::Equal => ab.cmp(bb),
        other => other,
    }
}

/// Returns (first significant digit, one past last digit) of the run at `start`.
fn digit_run(bytes: &[u8], start: usize) -> (usize, usize) {
    let mut end = start;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut sig = start;
    while sig + 1 < end && bytes[sig] == b'0' {
        sig += 1;
    }
    (sig, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ids() {
        let pool = StringPool::new();
        assert_eq!(pool.intern(""), StringId::EMPTY_STRING);
        assert!(pool.is_static(StringId::NOT_A_STRING));
        assert!(pool.is_static(StringId::EMPTY_STRING));
        assert!(pool.resolve(StringId::NOT_A_STRING).is_none());
        assert_eq!(&*pool.resolve(StringId::EMPTY_STRING).unwrap(), "");
    }

    #[test]
    fn test_intern_and_resolve() {
        let pool = StringPool::new();
        let a = pool.intern("alpha");
        let b = pool.intern("beta");
        assert_ne!(a, b);
        assert_eq!(pool.intern("alpha"), a);
        assert_eq!(&*pool.resolve(a).unwrap(), "alpha");
        assert_eq!(pool.get("beta"), Some(b));
        assert_eq!(pool.get("gamma"), None);
    }

    #[test]
    fn test_release_reclaims_and_reuses_lowest_id() {
        let pool = StringPool::new();
        let a = pool.intern("a");
        let b = pool.intern("b");
        pool.intern("a"); // second reference to a

        pool.release(a);
        assert_eq!(pool.get("a"), Some(a)); // still one reference
        pool.release(a);
        assert_eq!(pool.get("a"), None);
        pool.release(b);
        assert_eq!(pool.get("b"), None);

        // lowest reclaimed slot comes back first
        let c = pool.intern("c");
        assert_eq!(c, a);
    }

    #[test]
    fn test_static_ids_never_counted() {
        let pool = StringPool::with_static_strings(&["nominal", "cyclic"]);
        let nominal = pool.get("nominal").unwrap();
        assert!(pool.is_static(nominal));
        pool.release(nominal);
        pool.release(nominal);
        assert_eq!(pool.get("nominal"), Some(nominal));
        assert_eq!(pool.dynamic_refs_in_use(), 0);
    }

    #[test]
    fn test_batch_release_two_phase() {
        let pool = StringPool::new();
        let a = pool.intern("a");
        let b = pool.intern("b");
        pool.add_ref(a); // a has 2 refs, b has 1

        pool.release_batch(&[a, b]);
        assert_eq!(pool.get("a"), Some(a));
        assert_eq!(pool.get("b"), None);

        pool.release_batch(&[a]);
        assert_eq!(pool.get("a"), None);
        assert_eq!(pool.dynamic_refs_in_use(), 0);
    }

    #[test]
    fn test_string_ref_raii() {
        let pool = Arc::new(StringPool::new());
        let id;
        {
            let r = StringRef::new(Arc::clone(&pool), "held");
            id = r.id();
            let r2 = r.clone();
            drop(r);
            assert_eq!(pool.get("held"), Some(id));
            drop(r2);
        }
        assert_eq!(pool.get("held"), None);
    }

    #[test]
    fn test_natural_compare_numeric_runs() {
        assert_eq!(natural_compare("item2", "item10"), Ordering::Less);
        assert_eq!(natural_compare("item10", "item2"), Ordering::Greater);
        assert_eq!(natural_compare("a", "b"), Ordering::Less);
        assert_eq!(natural_compare("x9y", "x9y"), Ordering::Equal);
        // equal numeric value, leading zeros break the tie bytewise
        assert_ne!(natural_compare("a02", "a2"), Ordering::Equal);
        assert_eq!(natural_compare("v1.2", "v1.10"), Ordering::Less);
    }

    #[test]
    fn test_concurrent_intern_release() {
        use std::thread;

        let pool = Arc::new(StringPool::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for i in 0..200 {
                    let id = pool.intern(&format!("shared-{}", i % 10));
                    if t % 2 == 0 {
                        pool.release(id);
                    } else {
                        pool.release_batch(&[id]);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.dynamic_refs_in_use(), 0);
    }
}

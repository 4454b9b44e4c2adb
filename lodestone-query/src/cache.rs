// SPDX-License-Identifier: AGPL-3.0-or-later
// Lodestone - Entity Query Engine
// Copyright (C) 2026 Lodestone Contributors (https://github.com/lodestone-db)

//! # Query Cache Layer
//!
//! The store behind a read-write lock, with lazy column materialization:
//! a label only becomes a column the first time a query references it.
//! `ensure_labels_cached` collects missing labels under the read lock,
//! upgrades to the write lock, re-checks (another thread may have built
//! them in between), materializes, and downgrades. Everything else a
//! query does happens under the read lock.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use lodestone_core::code::CodeStore;
use lodestone_core::strings::{StringId, StringPool};

use lodestone_store::entity::Entity;
use lodestone_store::matrix::BoxFilterStore;

use crate::condition::Condition;

/// Read-write-locked store with lazy label materialization.
pub struct QueryCache {
    store: RwLock<BoxFilterStore>,
}

impl QueryCache {
    pub fn new(strings: Arc<StringPool>) -> Self {
        Self { store: RwLock::new(BoxFilterStore::new(strings)) }
    }

    pub fn with_code_store(strings: Arc<StringPool>, code: Arc<dyn CodeStore>) -> Self {
        Self { store: RwLock::new(BoxFilterStore::with_code_store(strings, code)) }
    }

    /// Shared access for condition evaluation.
    pub fn read(&self) -> RwLockReadGuard<'_, BoxFilterStore> {
        self.store.read()
    }

    /// Exclusive access for entity mutation.
    pub fn write(&self) -> RwLockWriteGuard<'_, BoxFilterStore> {
        self.store.write()
    }

    /// Materialize every label the conditions reference that is not yet a
    /// column, reading values from `entities`.
    pub fn ensure_labels_cached(&self, conditions: &[Condition], entities: &[Entity]) {
        let missing: Vec<StringId> = {
            let store = self.store.read();
            let mut missing = Vec::new();
            for condition in conditions {
                for label in condition.referenced_labels() {
                    if label.is_string() && !store.has_label(label) && !missing.contains(&label) {
                        missing.push(label);
                    }
                }
            }
            missing
        };
        if missing.is_empty() {
            return;
        }

        let mut store = self.store.write();
        // a concurrent query may have materialized some of these already
        let still_missing: Vec<StringId> =
            missing.into_iter().filter(|&l| !store.has_label(l)).collect();
        if !still_missing.is_empty() {
            tracing::debug!(labels = still_missing.len(), "caching label columns for query");
            store.add_labels(&still_missing, entities);
        }
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Lodestone - Entity Query Engine
// Copyright (C) 2026 Lodestone Contributors (https://github.com/lodestone-db)

//! # Entity Interface
//!
//! The store never walks an entity's code tree or label table itself; it
//! reads values through [`EntitySource`] at population time and nothing
//! else. [`Entity`] is the standard in-memory implementation: a label→value
//! table plus a per-entity random state and an optional code root.

use std::collections::HashMap;

use lodestone_core::code::CodeHandle;
use lodestone_core::random::RandomStream;
use lodestone_core::strings::StringId;
use lodestone_core::value::Value;

/// What the store is allowed to ask of an entity.
pub trait EntitySource {
    /// The value this entity carries for `label`; [`Value::Invalid`] when
    /// the entity does not carry the label at all.
    fn value_at_label(&self, label: StringId) -> Value;
}

/// A record with labeled immediate values, a randomness state, and an
/// opaque code root.
#[derive(Debug, Clone)]
pub struct Entity {
    labels: HashMap<StringId, Value>,
    rand_state: RandomStream,
    code_root: Option<CodeHandle>,
}

impl Entity {
    pub fn new() -> Self {
        Self { labels: HashMap::new(), rand_state: RandomStream::default(), code_root: None }
    }

    pub fn with_seed(seed: &str) -> Self {
        Self {
            labels: HashMap::new(),
            rand_state: RandomStream::from_seed_str(seed),
            code_root: None,
        }
    }

    /// Builder-style label assignment.
    pub fn label(mut self, label: StringId, value: Value) -> Self {
        self.labels.insert(label, value);
        self
    }

    pub fn set_label(&mut self, label: StringId, value: Value) {
        self.labels.insert(label, value);
    }

    pub fn remove_label(&mut self, label: StringId) {
        self.labels.remove(&label);
    }

    pub fn labels(&self) -> impl Iterator<Item = (StringId, Value)> + '_ {
        self.labels.iter().map(|(&l, &v)| (l, v))
    }

    pub fn set_code_root(&mut self, root: CodeHandle) {
        self.code_root = Some(root);
    }

    pub fn code_root(&self) -> Option<CodeHandle> {
        self.code_root
    }

    pub fn rand_state_mut(&mut self) -> &mut RandomStream {
        &mut self.rand_state
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::new()
    }
}

impl EntitySource for Entity {
    fn value_at_label(&self, label: StringId) -> Value {
        self.labels.get(&label).copied().unwrap_or(Value::Invalid)
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Lodestone - Entity Query Engine
// Copyright (C) 2026 Lodestone Contributors (https://github.com/lodestone-db)

//! # Immediate-Value Cell
//!
//! [`Value`] is the unit cell of the entity matrix: a tagged union over the
//! things a label can hold. `Null` and `Invalid` are distinct from a NaN
//! number — a NaN still *is* a number cell, and the column status sets are
//! what track NaN-ness separately.

use serde::{Deserialize, Serialize};

use crate::code::CodeHandle;
use crate::strings::StringId;

/// A single labeled value as stored in the matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// A finite or NaN number; NaN encodes "missing number".
    Number(f64),
    /// An interned string.
    StringId(StringId),
    /// A handle into the external code store.
    Code(CodeHandle),
    /// The label exists and holds null.
    Null,
    /// The entity does not carry this label at all.
    Invalid,
}

/// Discriminant of [`Value`], for APIs that carry the kind separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Number,
    StringId,
    Code,
    Null,
    Invalid,
}

impl Value {
    #[inline]
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Number(_) => ValueKind::Number,
            Value::StringId(_) => ValueKind::StringId,
            Value::Code(_) => ValueKind::Code,
            Value::Null => ValueKind::Null,
            Value::Invalid => ValueKind::Invalid,
        }
    }

    /// A missing-number cell (the NaN sentinel).
    #[inline]
    pub fn missing_number() -> Value {
        Value::Number(f64::NAN)
    }

    #[inline]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_string_id(&self) -> Option<StringId> {
        match self {
            Value::StringId(id) => Some(*id),
            _ => None,
        }
    }

    #[inline]
    pub fn as_code(&self) -> Option<CodeHandle> {
        match self {
            Value::Code(h) => Some(*h),
            _ => None,
        }
    }

    /// True for a `Number` cell holding NaN.
    #[inline]
    pub fn is_nan_number(&self) -> bool {
        matches!(self, Value::Number(n) if n.is_nan())
    }

    /// True when the cell holds something an index can file under a value:
    /// a non-NaN number, a string, or code.
    #[inline]
    pub fn is_indexable(&self) -> bool {
        match self {
            Value::Number(n) => !n.is_nan(),
            Value::StringId(_) | Value::Code(_) => true,
            Value::Null | Value::Invalid => false,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Invalid
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<StringId> for Value {
    fn from(id: StringId) -> Self {
        Value::StringId(id)
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Lodestone - Entity Query Engine
// Copyright (C) 2026 Lodestone Contributors (https://github.com/lodestone-db)

//! # Per-Column Index
//!
//! One [`ColumnData`] indexes one label across every entity in the store.
//! Six disjoint status sets partition the entity universe — non-NaN
//! numbers, strings, code, null, NaN, and "does not carry the label" — and
//! two value-level structures answer the actual predicates: a
//! `(value, entity)`-sorted vector for numeric ranges and a
//! `string_id → entity set` map for string equality.
//!
//! The partition is a hard invariant: every entity is in exactly one
//! status set per column. Violations are index corruption and panic with
//! the column and entity named.

use std::collections::HashMap;

use lodestone_core::intset::IndexSet;
use lodestone_core::strings::{natural_compare, StringId, StringPool};
use lodestone_core::value::{Value, ValueKind};

use crate::distance::{FeatureAttributes, FeatureParams, FeatureType};

/// Which status set an entity occupies in a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    Number,
    MissingNumber,
    String,
    Code,
    Null,
    Invalid,
}

impl CellStatus {
    /// The [`ValueKind`] a cell of this status holds (NaN is still a number).
    pub fn value_kind(self) -> ValueKind {
        match self {
            CellStatus::Number | CellStatus::MissingNumber => ValueKind::Number,
            CellStatus::String => ValueKind::StringId,
            CellStatus::Code => ValueKind::Code,
            CellStatus::Null => ValueKind::Null,
            CellStatus::Invalid => ValueKind::Invalid,
        }
    }
}

/// Index over one label.
pub struct ColumnData {
    label: StringId,

    /// Entities whose cell is a non-NaN number.
    number_indices: IndexSet,
    /// `(value, entity)` pairs sorted by value then entity, one per member
    /// of `number_indices`.
    sorted_numbers: Vec<(f64, usize)>,

    /// Entities whose cell is a string.
    string_indices: IndexSet,
    /// Value-level index: string id → entities carrying it.
    string_map: HashMap<StringId, IndexSet>,

    /// Entities whose cell is code.
    code_indices: IndexSet,
    /// Entities whose cell is null.
    null_indices: IndexSet,
    /// Entities whose cell is a NaN number ("missing number").
    nan_indices: IndexSet,
    /// Entities that do not carry this label.
    invalid_indices: IndexSet,
}

impl ColumnData {
    pub fn new(label: StringId) -> Self {
        Self {
            label,
            number_indices: IndexSet::new(),
            sorted_numbers: Vec::new(),
            string_indices: IndexSet::new(),
            string_map: HashMap::new(),
            code_indices: IndexSet::new(),
            null_indices: IndexSet::new(),
            nan_indices: IndexSet::new(),
            invalid_indices: IndexSet::new(),
        }
    }

    #[inline]
    pub fn label(&self) -> StringId {
        self.label
    }

    // =========================================================================
    // Status accessors
    // =========================================================================

    #[inline]
    pub fn number_indices(&self) -> &IndexSet {
        &self.number_indices
    }

    #[inline]
    pub fn string_indices(&self) -> &IndexSet {
        &self.string_indices
    }

    #[inline]
    pub fn code_indices(&self) -> &IndexSet {
        &self.code_indices
    }

    #[inline]
    pub fn null_indices(&self) -> &IndexSet {
        &self.null_indices
    }

    #[inline]
    pub fn nan_indices(&self) -> &IndexSet {
        &self.nan_indices
    }

    #[inline]
    pub fn invalid_indices(&self) -> &IndexSet {
        &self.invalid_indices
    }

    #[inline]
    pub fn sorted_numbers(&self) -> &[(f64, usize)] {
        &self.sorted_numbers
    }

    pub fn string_values(&self) -> impl Iterator<Item = (StringId, &IndexSet)> {
        self.string_map.iter().map(|(&id, set)| (id, set))
    }

    /// The status set an entity is filed under, by membership query.
    pub fn status(&self, entity: usize) -> CellStatus {
        if self.number_indices.contains(entity) {
            CellStatus::Number
        } else if self.string_indices.contains(entity) {
            CellStatus::String
        } else if self.nan_indices.contains(entity) {
            CellStatus::MissingNumber
        } else if self.null_indices.contains(entity) {
            CellStatus::Null
        } else if self.code_indices.contains(entity) {
            CellStatus::Code
        } else {
            CellStatus::Invalid
        }
    }

    #[inline]
    pub fn value_kind(&self, entity: usize) -> ValueKind {
        self.status(entity).value_kind()
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// File `entity` under the status set `value` calls for, maintaining
    /// the sorted number vector and string map.
    pub fn insert_index_value(&mut self, value: Value, entity: usize) {
        match value {
            Value::Number(n) if !n.is_nan() => {
                self.number_indices.insert(entity);
                let pos = self.sorted_position(n, entity);
                self.sorted_numbers.insert(pos, (n, entity));
            }
            Value::Number(_) => {
                self.nan_indices.insert(entity);
            }
            Value::StringId(id) => {
                self.string_indices.insert(entity);
                self.string_map.entry(id).or_default().insert(entity);
            }
            Value::Code(_) => {
                self.code_indices.insert(entity);
            }
            Value::Null => {
                self.null_indices.insert(entity);
            }
            Value::Invalid => {
                self.invalid_indices.insert(entity);
            }
        }
    }

    /// Bulk-build variant: file non-number statuses immediately, defer
    /// numbers into `number_buffer` for a single sorted append.
    pub fn insert_index_value_except_numbers(
        &mut self,
        value: Value,
        entity: usize,
        number_buffer: &mut Vec<(f64, usize)>,
    ) {
        match value {
            Value::Number(n) if !n.is_nan() => number_buffer.push((n, entity)),
            other => self.insert_index_value(other, entity),
        }
    }

    /// Append a pre-sorted `(value, entity)` vector (column materialization).
    pub fn append_sorted_number_indices(&mut self, sorted_pairs: &[(f64, usize)]) {
        debug_assert!(sorted_pairs.windows(2).all(|w| {
            w[0].0.total_cmp(&w[1].0).then(w[0].1.cmp(&w[1].1)) != std::cmp::Ordering::Greater
        }));
        self.sorted_numbers.extend_from_slice(sorted_pairs);
        for &(_, entity) in sorted_pairs {
            self.number_indices.insert(entity);
        }
    }

    /// Remove `entity`'s filing for `value`.
    pub fn delete_index_value(&mut self, value: Value, entity: usize) {
        match value {
            Value::Number(n) if !n.is_nan() => {
                self.number_indices.remove(entity);
                let pos = self.sorted_position(n, entity);
                if pos < self.sorted_numbers.len() && self.sorted_numbers[pos] == (n, entity) {
                    self.sorted_numbers.remove(pos);
                }
            }
            Value::Number(_) => {
                self.nan_indices.remove(entity);
            }
            Value::StringId(id) => {
                self.string_indices.remove(entity);
                if let Some(set) = self.string_map.get_mut(&id) {
                    set.remove(entity);
                    if set.is_empty() {
                        self.string_map.remove(&id);
                    }
                }
            }
            Value::Code(_) => {
                self.code_indices.remove(entity);
            }
            Value::Null => {
                self.null_indices.remove(entity);
            }
            Value::Invalid => {
                self.invalid_indices.remove(entity);
            }
        }
    }

    /// Replace `entity`'s value in place.
    pub fn change_index_value(&mut self, old_value: Value, new_value: Value, entity: usize) {
        if old_value == new_value {
            return;
        }
        self.delete_index_value(old_value, entity);
        self.insert_index_value(new_value, entity);
    }

    /// Rewrite index entries of `from_entity` to `to_entity` (row
    /// relocation during swap-down removal). `value` is the cell content.
    pub fn relocate_entity(&mut self, value: Value, from_entity: usize, to_entity: usize) {
        self.delete_index_value(value, from_entity);
        self.insert_index_value(value, to_entity);
    }

    /// Position of `(value, entity)` in the sorted vector (insertion point).
    fn sorted_position(&self, value: f64, entity: usize) -> usize {
        self.sorted_numbers
            .partition_point(|&(v, e)| match v.total_cmp(&value) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Equal => e < entity,
                std::cmp::Ordering::Greater => false,
            })
    }

    // =========================================================================
    // Predicates
    // =========================================================================

    /// Union into `out` every entity whose value lies in `[low, high]`
    /// (`between == true`) or strictly outside it (`between == false`).
    ///
    /// Numeric bounds match only the numeric subset of the column; string
    /// bounds (natural order) match only the string subset. A mixed-type
    /// column therefore answers a range query within one type at a time.
    /// NaN/null/invalid entities never match either way.
    pub fn find_all_within_range(
        &self,
        low: Value,
        high: Value,
        between: bool,
        pool: &StringPool,
        out: &mut IndexSet,
    ) {
        match (low, high) {
            (Value::Number(lo), Value::Number(hi)) => {
                if lo.is_nan() || hi.is_nan() {
                    return;
                }
                let start = self.sorted_numbers.partition_point(|&(v, _)| v < lo);
                let end = self.sorted_numbers.partition_point(|&(v, _)| v <= hi);
                if between {
                    for &(_, entity) in &self.sorted_numbers[start..end] {
                        out.insert(entity);
                    }
                } else {
                    for &(_, entity) in self.sorted_numbers[..start]
                        .iter()
                        .chain(self.sorted_numbers[end..].iter())
                    {
                        out.insert(entity);
                    }
                }
            }
            (Value::StringId(lo), Value::StringId(hi)) => {
                // NOT_A_STRING on either side means that bound is open
                // (the ≥ / ≤ rewrite produces these)
                let lo_s = lo.is_string().then(|| pool.resolve_owned(lo));
                let hi_s = hi.is_string().then(|| pool.resolve_owned(hi));
                for (id, entities) in &self.string_map {
                    let s = pool.resolve_owned(*id);
                    let ge_lo = lo_s
                        .as_deref()
                        .is_none_or(|lo| natural_compare(&s, lo) != std::cmp::Ordering::Less);
                    let le_hi = hi_s
                        .as_deref()
                        .is_none_or(|hi| natural_compare(&s, hi) != std::cmp::Ordering::Greater);
                    if (ge_lo && le_hi) == between {
                        entities.union_into(out);
                    }
                }
            }
            _ => {}
        }
    }

    /// Union into `out` every entity holding exactly `value`. Code cells
    /// are matched at the store level (deep equality needs the code store).
    pub fn union_all_with_value(&self, value: Value, out: &mut IndexSet) {
        match value {
            Value::Number(n) if !n.is_nan() => {
                let start = self.sorted_numbers.partition_point(|&(v, _)| v < n);
                for &(v, entity) in &self.sorted_numbers[start..] {
                    if v != n {
                        break;
                    }
                    out.insert(entity);
                }
            }
            Value::Number(_) => self.nan_indices.union_into(out),
            Value::StringId(id) => {
                if let Some(entities) = self.string_map.get(&id) {
                    entities.union_into(out);
                }
            }
            Value::Null => self.null_indices.union_into(out),
            Value::Code(_) | Value::Invalid => {}
        }
    }

    /// The `num_to_find` extreme entities by value order, optionally
    /// restricted to `enabled`.
    pub fn find_min_max(
        &self,
        kind: ValueKind,
        num_to_find: usize,
        is_max: bool,
        enabled: Option<&IndexSet>,
        pool: &StringPool,
        out: &mut IndexSet,
    ) {
        let passes = |entity: usize| enabled.is_none_or(|set| set.contains(entity));

        match kind {
            ValueKind::Number => {
                let mut taken = 0;
                let walk: Box<dyn Iterator<Item = &(f64, usize)>> = if is_max {
                    Box::new(self.sorted_numbers.iter().rev())
                } else {
                    Box::new(self.sorted_numbers.iter())
                };
                for &(_, entity) in walk {
                    if taken >= num_to_find {
                        break;
                    }
                    if passes(entity) {
                        out.insert(entity);
                        taken += 1;
                    }
                }
            }
            ValueKind::StringId => {
                let mut ids: Vec<StringId> = self.string_map.keys().copied().collect();
                ids.sort_by(|a, b| natural_compare(&pool.resolve_owned(*a), &pool.resolve_owned(*b)));
                if is_max {
                    ids.reverse();
                }
                let mut taken = 0;
                'outer: for id in ids {
                    for entity in self.string_map[&id].iter() {
                        if taken >= num_to_find {
                            break 'outer;
                        }
                        if passes(entity) {
                            out.insert(entity);
                            taken += 1;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    // =========================================================================
    // Distance support
    // =========================================================================

    /// Largest possible per-feature difference between `value` and any
    /// value currently in this column. Feeds the unknown-value closure.
    pub fn max_difference_from_value(
        &self,
        params: &FeatureParams,
        value: Value,
        pool: &StringPool,
    ) -> f64 {
        match params.feature_type {
            FeatureType::Nominal => 1.0,
            FeatureType::ContinuousCyclic => match params.attributes {
                FeatureAttributes::CyclicRange(r) if r > 0.0 => r / 2.0,
                _ => self.max_number_difference_from(value.as_number()),
            },
            FeatureType::Continuous | FeatureType::ContinuousUniversallyNumeric => {
                self.max_number_difference_from(value.as_number().filter(|n| !n.is_nan()))
            }
            FeatureType::ContinuousString => {
                let target_len = value
                    .as_string_id()
                    .map(|id| pool.resolve_owned(id).chars().count())
                    .unwrap_or(0);
                let max_len = self
                    .string_map
                    .keys()
                    .map(|&id| pool.resolve_owned(id).chars().count())
                    .max()
                    .unwrap_or(0);
                target_len.max(max_len) as f64
            }
            // normalized structural difference is bounded by 1
            FeatureType::ContinuousCode => 1.0,
        }
    }

    fn max_number_difference_from(&self, target: Option<f64>) -> f64 {
        let (first, last) = match (self.sorted_numbers.first(), self.sorted_numbers.last()) {
            (Some(&(lo, _)), Some(&(hi, _))) => (lo, hi),
            _ => return 0.0,
        };
        match target {
            Some(v) if v.is_finite() => (v - first).abs().max((last - v).abs()),
            _ => last - first,
        }
    }

    // =========================================================================
    // Invariants
    // =========================================================================

    /// Panic if the six status sets fail to partition `[0, num_entities)`.
    pub fn validate_partition(&self, num_entities: usize) {
        for entity in 0..num_entities {
            let memberships = [
                self.number_indices.contains(entity),
                self.string_indices.contains(entity),
                self.code_indices.contains(entity),
                self.null_indices.contains(entity),
                self.nan_indices.contains(entity),
                self.invalid_indices.contains(entity),
            ]
            .iter()
            .filter(|&&m| m)
            .count();
            assert!(
                memberships == 1,
                "index corruption: column {:?} entity {} is in {} status sets",
                self.label,
                entity,
                memberships
            );
        }
        assert!(
            self.sorted_numbers.len() == self.number_indices.len(),
            "index corruption: column {:?} sorted vector has {} entries for {} number entities",
            self.label,
            self.sorted_numbers.len(),
            self.number_indices.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column_with(values: &[Value]) -> ColumnData {
        let mut col = ColumnData::new(StringId(100));
        for (i, &v) in values.iter().enumerate() {
            col.insert_index_value(v, i);
        }
        col
    }

    #[test]
    fn test_partition_after_inserts() {
        let col = column_with(&[
            Value::Number(1.0),
            Value::missing_number(),
            Value::StringId(StringId(5)),
            Value::Null,
            Value::Invalid,
        ]);
        col.validate_partition(5);
        assert_eq!(col.status(0), CellStatus::Number);
        assert_eq!(col.status(1), CellStatus::MissingNumber);
        assert_eq!(col.status(2), CellStatus::String);
        assert_eq!(col.status(3), CellStatus::Null);
        assert_eq!(col.status(4), CellStatus::Invalid);
    }

    #[test]
    fn test_sorted_vector_stable_by_value_then_entity() {
        let col = column_with(&[
            Value::Number(3.0),
            Value::Number(1.0),
            Value::Number(3.0),
            Value::Number(2.0),
        ]);
        assert_eq!(
            col.sorted_numbers(),
            &[(1.0, 1), (2.0, 3), (3.0, 0), (3.0, 2)]
        );
    }

    #[test]
    fn test_range_query_numbers() {
        let pool = StringPool::new();
        let col = column_with(&[
            Value::Number(1.0),
            Value::Number(2.0),
            Value::Number(3.0),
            Value::Number(4.0),
            Value::missing_number(),
        ]);

        let mut out = IndexSet::new();
        col.find_all_within_range(Value::Number(2.0), Value::Number(3.5), true, &pool, &mut out);
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![1, 2]);

        let mut out = IndexSet::new();
        col.find_all_within_range(Value::Number(2.0), Value::Number(3.5), false, &pool, &mut out);
        // NaN entity 4 is in neither result
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![0, 3]);
    }

    #[test]
    fn test_range_query_strings_natural_order() {
        let pool = StringPool::new();
        let a = pool.intern("item2");
        let b = pool.intern("item10");
        let c = pool.intern("item30");
        let mut col = ColumnData::new(StringId(100));
        col.insert_index_value(Value::StringId(a), 0);
        col.insert_index_value(Value::StringId(b), 1);
        col.insert_index_value(Value::StringId(c), 2);
        col.insert_index_value(Value::Number(7.0), 3); // numeric subset ignored

        let mut out = IndexSet::new();
        col.find_all_within_range(Value::StringId(a), Value::StringId(b), true, &pool, &mut out);
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![0, 1]);

        // open upper bound via the NOT_A_STRING sentinel
        let mut out = IndexSet::new();
        col.find_all_within_range(
            Value::StringId(b),
            Value::StringId(StringId::NOT_A_STRING),
            true,
            &pool,
            &mut out,
        );
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_union_all_with_value() {
        let pool = StringPool::new();
        let s = pool.intern("tag");
        let col = column_with(&[
            Value::Number(2.0),
            Value::Number(2.0),
            Value::StringId(s),
            Value::Number(5.0),
            Value::Null,
            Value::missing_number(),
        ]);

        let mut out = IndexSet::new();
        col.union_all_with_value(Value::Number(2.0), &mut out);
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![0, 1]);

        let mut out = IndexSet::new();
        col.union_all_with_value(Value::StringId(s), &mut out);
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![2]);

        let mut out = IndexSet::new();
        col.union_all_with_value(Value::Null, &mut out);
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![4]);

        let mut out = IndexSet::new();
        col.union_all_with_value(Value::missing_number(), &mut out);
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![5]);
    }

    #[test]
    fn test_delete_and_change() {
        let pool = StringPool::new();
        let mut col = column_with(&[Value::Number(1.0), Value::Number(2.0)]);
        col.change_index_value(Value::Number(2.0), Value::Null, 1);
        col.validate_partition(2);
        assert_eq!(col.status(1), CellStatus::Null);
        assert_eq!(col.sorted_numbers(), &[(1.0, 0)]);

        col.delete_index_value(Value::Number(1.0), 0);
        col.insert_index_value(Value::Invalid, 0);
        col.validate_partition(2);
        let mut out = IndexSet::new();
        col.find_all_within_range(
            Value::Number(f64::NEG_INFINITY),
            Value::Number(f64::INFINITY),
            true,
            &pool,
            &mut out,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_find_min_max_with_enabled() {
        let pool = StringPool::new();
        let col = column_with(&[
            Value::Number(10.0),
            Value::Number(20.0),
            Value::Number(30.0),
            Value::Number(40.0),
        ]);

        let mut out = IndexSet::new();
        col.find_min_max(ValueKind::Number, 2, true, None, &pool, &mut out);
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![2, 3]);

        let enabled = IndexSet::from_indices([0, 1, 2]);
        let mut out = IndexSet::new();
        col.find_min_max(ValueKind::Number, 2, true, Some(&enabled), &pool, &mut out);
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![1, 2]);

        let mut out = IndexSet::new();
        col.find_min_max(ValueKind::Number, 1, false, None, &pool, &mut out);
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_bulk_build_matches_incremental() {
        let mut bulk = ColumnData::new(StringId(1));
        let mut buffer = Vec::new();
        let values = [
            Value::Number(3.0),
            Value::Null,
            Value::Number(1.0),
            Value::missing_number(),
            Value::Number(2.0),
        ];
        for (i, &v) in values.iter().enumerate() {
            bulk.insert_index_value_except_numbers(v, i, &mut buffer);
        }
        buffer.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        bulk.append_sorted_number_indices(&buffer);
        bulk.validate_partition(values.len());

        let incremental = column_with(&values);
        assert_eq!(bulk.sorted_numbers(), incremental.sorted_numbers());
    }

    #[test]
    fn test_max_difference_from_value() {
        let pool = StringPool::new();
        let col = column_with(&[Value::Number(-5.0), Value::Number(10.0), Value::Number(2.0)]);
        let params = FeatureParams::default();
        assert_eq!(
            col.max_difference_from_value(&params, Value::Number(0.0), &pool),
            10.0
        );
        assert_eq!(
            col.max_difference_from_value(&params, Value::missing_number(), &pool),
            15.0
        );
        let cyclic = FeatureParams::cyclic(360.0);
        assert_eq!(
            col.max_difference_from_value(&cyclic, Value::Number(0.0), &pool),
            180.0
        );
    }
}

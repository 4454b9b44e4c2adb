// SPDX-License-Identifier: AGPL-3.0-or-later
// Lodestone - Entity Query Engine
// Copyright (C) 2026 Lodestone Contributors (https://github.com/lodestone-db)

//! # Box-Filter Store
//!
//! The store proper: a row-major `entities × columns` matrix of immediate
//! values plus one [`ColumnData`] index per column. Labels become columns
//! lazily — the first query that references a label materializes it — and
//! columns are dropped once no entity carries the label.
//!
//! Entity removal uses the swap-last-down idiom: the removed row is
//! overwritten by the last row, every column index entry of the moved
//! entity is rewritten to its new position, and the matrix shrinks by one
//! row. Entity indices are therefore stable only within a query.

use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;

use lodestone_core::code::CodeStore;
use lodestone_core::intset::IndexSet;
use lodestone_core::strings::{StringId, StringPool};
use lodestone_core::value::{Value, ValueKind};

use crate::column::ColumnData;
use crate::distance::{DistanceParams, FeatureType, TermContext};
use crate::entity::EntitySource;

/// Spatial acceleration store over labeled entity values.
pub struct BoxFilterStore {
    columns: Vec<ColumnData>,
    label_to_column: HashMap<StringId, usize>,
    /// Row-major `num_entities × columns.len()` cells.
    matrix: Vec<Value>,
    num_entities: usize,
    strings: Arc<StringPool>,
    code: Option<Arc<dyn CodeStore>>,
}

impl BoxFilterStore {
    pub fn new(strings: Arc<StringPool>) -> Self {
        Self {
            columns: Vec::new(),
            label_to_column: HashMap::new(),
            matrix: Vec::new(),
            num_entities: 0,
            strings,
            code: None,
        }
    }

    pub fn with_code_store(strings: Arc<StringPool>, code: Arc<dyn CodeStore>) -> Self {
        Self { code: Some(code), ..Self::new(strings) }
    }

    #[inline]
    pub fn num_entities(&self) -> usize {
        self.num_entities
    }

    #[inline]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    #[inline]
    pub fn strings(&self) -> &Arc<StringPool> {
        &self.strings
    }

    /// Collaborators for string/code distance terms.
    pub fn term_context(&self) -> TermContext<'_> {
        TermContext {
            strings: Some(&self.strings),
            code: self.code.as_deref(),
        }
    }

    #[inline]
    pub fn column_index(&self, label: StringId) -> Option<usize> {
        self.label_to_column.get(&label).copied()
    }

    #[inline]
    pub fn has_label(&self, label: StringId) -> bool {
        self.label_to_column.contains_key(&label)
    }

    #[inline]
    pub fn column(&self, index: usize) -> &ColumnData {
        &self.columns[index]
    }

    /// The cell at `(entity, column)`.
    #[inline]
    pub fn value(&self, entity: usize, column: usize) -> Value {
        self.matrix[entity * self.columns.len() + column]
    }

    /// The non-NaN number at `(entity, column)`, if that is what the cell holds.
    #[inline]
    pub fn number_value(&self, entity: usize, column: usize) -> Option<f64> {
        self.value(entity, column).as_number().filter(|n| !n.is_nan())
    }

    #[inline]
    pub fn string_value(&self, entity: usize, column: usize) -> Option<StringId> {
        self.value(entity, column).as_string_id()
    }

    // =========================================================================
    // Column lifecycle
    // =========================================================================

    /// Materialize columns for `label_ids` (ignoring ones already present)
    /// and populate them from `entities`. Builds columns in parallel when
    /// the store is large enough for the fan-out to pay for itself.
    pub fn add_labels<E: EntitySource + Sync>(&mut self, label_ids: &[StringId], entities: &[E]) {
        let new_labels: Vec<StringId> = {
            let mut seen = std::collections::HashSet::new();
            label_ids
                .iter()
                .copied()
                .filter(|l| !self.has_label(*l) && seen.insert(*l))
                .collect()
        };
        if new_labels.is_empty() || entities.is_empty() {
            return;
        }

        let num_added = new_labels.len();
        let n = entities.len();
        tracing::debug!(columns = num_added, entities = n, "materializing label columns");

        let use_parallel = num_added > 1 && (n > 10_000 || (n > 200 && num_added > 10));
        let built: Vec<(ColumnData, Vec<Value>)> = if use_parallel {
            new_labels
                .par_iter()
                .map(|&label| Self::build_column(label, entities))
                .collect()
        } else {
            new_labels
                .iter()
                .map(|&label| Self::build_column(label, entities))
                .collect()
        };

        // relayout the matrix to the wider stride, then scatter new columns
        let old_stride = self.columns.len();
        let new_stride = old_stride + num_added;
        let mut matrix = vec![Value::Invalid; n * new_stride];
        for entity in 0..self.num_entities.min(n) {
            let old_row = &self.matrix[entity * old_stride..(entity + 1) * old_stride];
            matrix[entity * new_stride..entity * new_stride + old_stride].copy_from_slice(old_row);
        }
        for (offset, (column, cells)) in built.into_iter().enumerate() {
            let column_index = old_stride + offset;
            for (entity, cell) in cells.into_iter().enumerate() {
                matrix[entity * new_stride + column_index] = cell;
            }
            self.label_to_column.insert(column.label(), column_index);
            self.columns.push(column);
        }
        self.matrix = matrix;
        self.num_entities = n;
    }

    /// Build one column's index and cell vector from the entities. Values
    /// are read in increasing entity order; numbers are deferred and
    /// appended in one sorted pass.
    fn build_column<E: EntitySource>(label: StringId, entities: &[E]) -> (ColumnData, Vec<Value>) {
        let mut column = ColumnData::new(label);
        let mut cells = Vec::with_capacity(entities.len());
        let mut number_buffer: Vec<(f64, usize)> = Vec::new();

        for (entity_index, entity) in entities.iter().enumerate() {
            let value = entity.value_at_label(label);
            cells.push(value);
            column.insert_index_value_except_numbers(value, entity_index, &mut number_buffer);
        }

        number_buffer.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        column.append_sorted_number_indices(&number_buffer);
        (column, cells)
    }

    /// True when no entity carries the column's label any more.
    pub fn is_column_removable(&self, column_index: usize) -> bool {
        self.columns[column_index].invalid_indices().len() == self.num_entities
    }

    /// Drop column `column_index`, swapping the last column into its place.
    pub fn remove_column(&mut self, column_index: usize) {
        let old_stride = self.columns.len();
        let removed = self.columns.swap_remove(column_index);
        self.label_to_column.remove(&removed.label());
        if column_index < self.columns.len() {
            self.label_to_column.insert(self.columns[column_index].label(), column_index);
        }

        let new_stride = self.columns.len();
        let mut matrix = vec![Value::Invalid; self.num_entities * new_stride];
        for entity in 0..self.num_entities {
            for c in 0..new_stride {
                // the swapped-in column's cells come from the old last column
                let source = if c == column_index { old_stride - 1 } else { c };
                matrix[entity * new_stride + c] = self.matrix[entity * old_stride + source];
            }
        }
        self.matrix = matrix;
    }

    /// Sweep away every column no entity uses. Works high-to-low so the
    /// swap-in never disturbs an index still to be visited.
    pub fn remove_unused_labels(&mut self) {
        for column_index in (0..self.columns.len()).rev() {
            if self.is_column_removable(column_index) {
                self.remove_column(column_index);
            }
        }
    }

    // =========================================================================
    // Entity lifecycle
    // =========================================================================

    /// Insert `entity` at `entity_index`, populating every column.
    pub fn add_entity(&mut self, entity: &impl EntitySource, entity_index: usize) {
        let stride = self.columns.len();
        let required_rows = (entity_index + 1).max(self.num_entities);
        if self.matrix.len() < required_rows * stride {
            self.matrix.resize(required_rows * stride, Value::Invalid);
        }
        // rows between the old count and the new index hold no data
        for gap_row in self.num_entities..entity_index {
            for column in self.columns.iter_mut() {
                column.insert_index_value(Value::Invalid, gap_row);
            }
        }

        for column_index in 0..stride {
            let label = self.columns[column_index].label();
            let value = entity.value_at_label(label);
            self.matrix[entity_index * stride + column_index] = value;
            self.columns[column_index].insert_index_value(value, entity_index);
        }

        if entity_index >= self.num_entities {
            self.num_entities = entity_index + 1;
        }
    }

    /// Remove entity `entity_index`, optionally relocating
    /// `reassign_index` (normally the last row) into its slot.
    pub fn remove_entity(&mut self, entity_index: usize, reassign_index: usize) {
        if entity_index >= self.num_entities || self.columns.is_empty() {
            return;
        }

        // removing the last row with nothing to relocate: plain truncation
        if entity_index + 1 == self.num_entities && reassign_index >= entity_index {
            self.delete_entity_from_columns(entity_index);
            self.delete_last_row();
            return;
        }

        if reassign_index >= self.num_entities {
            return;
        }

        // removing without relocation: the slot keeps its index but holds
        // no data
        if entity_index == reassign_index {
            self.delete_entity_from_columns(entity_index);
            let stride = self.columns.len();
            for (column_index, column) in self.columns.iter_mut().enumerate() {
                self.matrix[entity_index * stride + column_index] = Value::Invalid;
                column.insert_index_value(Value::Invalid, entity_index);
            }
            return;
        }

        // swap-down: move reassign_index's values into entity_index's slot
        let stride = self.columns.len();
        for column_index in 0..stride {
            let value_to_overwrite = self.value(entity_index, column_index);
            let value_to_move = self.value(reassign_index, column_index);
            let column = &mut self.columns[column_index];
            column.delete_index_value(value_to_move, reassign_index);
            column.change_index_value(value_to_overwrite, value_to_move, entity_index);
        }
        let (dst, src) = (entity_index * stride, reassign_index * stride);
        self.matrix.copy_within(src..src + stride, dst);

        if reassign_index + 1 == self.num_entities {
            self.delete_last_row();
        } else {
            // moved row's old slot stays allocated but carries nothing
            for (column_index, column) in self.columns.iter_mut().enumerate() {
                self.matrix[reassign_index * stride + column_index] = Value::Invalid;
                column.insert_index_value(Value::Invalid, reassign_index);
            }
        }

        self.remove_unused_labels();
    }

    /// Refresh every column's value for one entity.
    pub fn update_all_entity_labels(&mut self, entity: &impl EntitySource, entity_index: usize) {
        if entity_index >= self.num_entities {
            return;
        }
        let stride = self.columns.len();
        for column_index in 0..stride {
            let label = self.columns[column_index].label();
            let new_value = entity.value_at_label(label);
            let cell = &mut self.matrix[entity_index * stride + column_index];
            self.columns[column_index].change_index_value(*cell, new_value, entity_index);
            *cell = new_value;
        }
        self.remove_unused_labels();
    }

    /// Refresh one label's value for one entity; drops the column if the
    /// edit left it unused.
    pub fn update_entity_label(
        &mut self,
        entity: &impl EntitySource,
        entity_index: usize,
        label: StringId,
    ) {
        if entity_index >= self.num_entities {
            return;
        }
        let Some(column_index) = self.column_index(label) else {
            return;
        };
        let stride = self.columns.len();
        let new_value = entity.value_at_label(label);
        let cell = &mut self.matrix[entity_index * stride + column_index];
        self.columns[column_index].change_index_value(*cell, new_value, entity_index);
        *cell = new_value;

        if self.is_column_removable(column_index) {
            self.remove_column(column_index);
        }
    }

    fn delete_entity_from_columns(&mut self, entity_index: usize) {
        let stride = self.columns.len();
        for column_index in 0..stride {
            let value = self.matrix[entity_index * stride + column_index];
            self.columns[column_index].delete_index_value(value, entity_index);
        }
    }

    fn delete_last_row(&mut self) {
        if self.num_entities == 0 {
            return;
        }
        self.num_entities -= 1;
        self.matrix.truncate(self.num_entities * self.columns.len());
    }

    // =========================================================================
    // Entity-set predicates
    // =========================================================================

    /// `out =` entities that carry `label`.
    pub fn find_all_with_feature(&self, label: StringId, out: &mut IndexSet) {
        match self.column_index(label).filter(|_| self.num_entities > 0) {
            Some(c) => self.columns[c]
                .invalid_indices()
                .complement_into(self.num_entities, out),
            None => out.clear(),
        }
    }

    /// `out ∩=` entities that carry `label`.
    pub fn intersect_with_feature(&self, label: StringId, out: &mut IndexSet) {
        match self.column_index(label).filter(|_| self.num_entities > 0) {
            Some(c) => self.columns[c].invalid_indices().erase_into(out),
            None => out.clear(),
        }
    }

    /// `out =` entities that do not carry `label`.
    pub fn find_all_without_feature(&self, label: StringId, out: &mut IndexSet) {
        match self.column_index(label).filter(|_| self.num_entities > 0) {
            Some(c) => self.columns[c].invalid_indices().copy_into(out),
            None => out.clear(),
        }
    }

    /// `out ∩=` entities that do not carry `label`.
    pub fn intersect_without_feature(&self, label: StringId, out: &mut IndexSet) {
        if self.num_entities == 0 {
            out.clear();
            return;
        }
        match self.column_index(label) {
            Some(c) => self.columns[c].invalid_indices().intersect_into(out),
            None => {} // nothing carries a nonexistent label; `out` already qualifies
        }
    }

    /// `out =` entities whose `label` value lies within `[low, high]`
    /// (or outside it when `between` is false). NaN and null never match.
    pub fn find_all_within_range(
        &self,
        label: StringId,
        low: Value,
        high: Value,
        between: bool,
        out: &mut IndexSet,
    ) {
        out.clear();
        if self.num_entities == 0 {
            return;
        }
        if let Some(c) = self.column_index(label) {
            self.columns[c].find_all_within_range(low, high, between, &self.strings, out);
        }
    }

    /// Union into `out` every entity whose `label` value equals `value`.
    /// Code values compare by deep structural equality.
    pub fn union_all_with_value(&self, label: StringId, value: Value, out: &mut IndexSet) {
        let Some(c) = self.column_index(label) else {
            return;
        };
        if let Value::Code(handle) = value {
            let Some(code) = self.code.as_deref() else {
                return;
            };
            for entity in self.columns[c].code_indices().iter() {
                if let Some(other) = self.value(entity, c).as_code() {
                    if code.deep_equal(handle, other) {
                        out.insert(entity);
                    }
                }
            }
        } else {
            self.columns[c].union_all_with_value(value, out);
        }
    }

    /// The `num_to_find` extreme entities of `label` by value order.
    pub fn find_min_max(
        &self,
        label: StringId,
        kind: ValueKind,
        num_to_find: usize,
        is_max: bool,
        enabled: Option<&IndexSet>,
        out: &mut IndexSet,
    ) {
        if let Some(c) = self.column_index(label) {
            self.columns[c].find_min_max(kind, num_to_find, is_max, enabled, &self.strings, out);
        }
    }

    /// `enabled =` entities with a usable number for `label`; `entities` /
    /// `values` receive them in index order.
    pub fn find_all_with_valid_numbers(
        &self,
        label: StringId,
        enabled: &mut IndexSet,
        entities: &mut Vec<usize>,
        values: &mut Vec<f64>,
    ) {
        enabled.clear();
        entities.clear();
        values.clear();
        let Some(c) = self.column_index(label).filter(|_| self.num_entities > 0) else {
            return;
        };
        self.columns[c].number_indices().copy_into(enabled);
        for entity in enabled.iter() {
            entities.push(entity);
            values.push(self.value(entity, c).as_number().unwrap_or(f64::NAN));
        }
    }

    /// Like [`Self::find_all_with_valid_numbers`] but restricted to the
    /// entities already in `enabled`.
    pub fn intersect_with_valid_numbers(
        &self,
        label: StringId,
        enabled: &mut IndexSet,
        entities: &mut Vec<usize>,
        values: &mut Vec<f64>,
    ) {
        entities.clear();
        values.clear();
        let Some(c) = self.column_index(label).filter(|_| self.num_entities > 0) else {
            enabled.clear();
            return;
        };
        self.columns[c].number_indices().intersect_into(enabled);
        for entity in enabled.iter() {
            entities.push(entity);
            values.push(self.value(entity, c).as_number().unwrap_or(f64::NAN));
        }
    }

    /// Sizing hint: how many entities hold a value of `kind` in the column.
    pub fn num_unique_values(&self, column_index: usize, kind: ValueKind) -> usize {
        let column = &self.columns[column_index];
        match kind {
            ValueKind::Number => column.number_indices().len(),
            ValueKind::StringId => column.string_indices().len(),
            _ => self.num_entities - column.invalid_indices().len(),
        }
    }

    // =========================================================================
    // Distance support
    // =========================================================================

    /// Largest possible distance term feature `query_feature` can
    /// contribute against `value`, given the column's current contents.
    pub fn max_distance_term_from_value(
        &self,
        params: &DistanceParams,
        value: Value,
        query_feature: usize,
        column_index: usize,
    ) -> f64 {
        if params.features[query_feature].feature_type == FeatureType::Nominal {
            return params.nominal_nonmatch_term(query_feature);
        }
        let max_diff = self.columns[column_index].max_difference_from_value(
            &params.features[query_feature],
            value,
            &self.strings,
        );
        params.difference_to_term(max_diff, query_feature)
    }

    // =========================================================================
    // Invariants
    // =========================================================================

    /// Panic if any column's partition or the matrix/index agreement is
    /// broken. Test and debug aid.
    pub fn validate_invariants(&self) {
        let stride = self.columns.len();
        for (column_index, column) in self.columns.iter().enumerate() {
            column.validate_partition(self.num_entities);
            for entity in 0..self.num_entities {
                let cell = self.matrix[entity * stride + column_index];
                let status_kind = column.value_kind(entity);
                assert!(
                    cell.kind() == status_kind,
                    "index corruption: column {:?} entity {} cell {:?} filed as {:?}",
                    column.label(),
                    entity,
                    cell,
                    status_kind
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;

    fn pool_and_labels() -> (Arc<StringPool>, StringId, StringId) {
        let pool = Arc::new(StringPool::new());
        let x = pool.intern("x");
        let y = pool.intern("y");
        (pool, x, y)
    }

    fn store_with_xy(values: &[(f64, f64)]) -> (BoxFilterStore, StringId, StringId) {
        let (pool, x, y) = pool_and_labels();
        let entities: Vec<Entity> = values
            .iter()
            .map(|&(vx, vy)| {
                Entity::new()
                    .label(x, Value::Number(vx))
                    .label(y, Value::Number(vy))
            })
            .collect();
        let mut store = BoxFilterStore::new(pool);
        store.add_labels(&[x, y], &entities);
        (store, x, y)
    }

    #[test]
    fn test_add_labels_populates_matrix_and_indexes() {
        let (store, x, y) = store_with_xy(&[(1.0, 10.0), (2.0, 20.0), (3.0, 30.0)]);
        assert_eq!(store.num_entities(), 3);
        assert_eq!(store.num_columns(), 2);
        store.validate_invariants();

        let cx = store.column_index(x).unwrap();
        let cy = store.column_index(y).unwrap();
        assert_eq!(store.value(1, cx), Value::Number(2.0));
        assert_eq!(store.value(2, cy), Value::Number(30.0));
        assert_eq!(store.column(cx).sorted_numbers(), &[(1.0, 0), (2.0, 1), (3.0, 2)]);
    }

    #[test]
    fn test_add_labels_parallel_path_matches_sequential() {
        let pool = Arc::new(StringPool::new());
        let labels: Vec<StringId> =
            (0..12).map(|i| pool.intern(&format!("f{}", i))).collect();
        let entities: Vec<Entity> = (0..300)
            .map(|e| {
                let mut ent = Entity::new();
                for (li, &label) in labels.iter().enumerate() {
                    ent.set_label(label, Value::Number((e * 31 + li * 7) as f64 % 97.0));
                }
                ent
            })
            .collect();

        // 300 entities × 12 new columns crosses the parallel-build threshold
        let mut parallel = BoxFilterStore::new(Arc::clone(&pool));
        parallel.add_labels(&labels, &entities);
        parallel.validate_invariants();

        let mut sequential = BoxFilterStore::new(pool);
        for label in &labels {
            sequential.add_labels(&[*label], &entities);
        }
        sequential.validate_invariants();

        for e in 0..300 {
            for &label in &labels {
                let cp = parallel.column_index(label).unwrap();
                let cs = sequential.column_index(label).unwrap();
                assert_eq!(parallel.value(e, cp), sequential.value(e, cs));
            }
        }
    }

    #[test]
    fn test_add_entity_after_build() {
        let (mut store, x, _) = store_with_xy(&[(1.0, 10.0), (2.0, 20.0)]);
        let new_entity = Entity::new().label(x, Value::Number(9.0));
        store.add_entity(&new_entity, 2);
        assert_eq!(store.num_entities(), 3);
        store.validate_invariants();

        let cx = store.column_index(x).unwrap();
        assert_eq!(store.value(2, cx), Value::Number(9.0));
        // y was not set: the new entity is invalid in that column
        let cy = store.num_columns() - 1 - cx;
        assert_eq!(store.value(2, cy), Value::Invalid);
    }

    #[test]
    fn test_remove_last_entity_is_truncation() {
        let (mut store, x, _) = store_with_xy(&[(1.0, 10.0), (2.0, 20.0), (3.0, 30.0)]);
        let (expected, _, _) = store_with_xy(&[(1.0, 10.0), (2.0, 20.0)]);

        store.remove_entity(2, 2);
        store.validate_invariants();
        assert_eq!(store.num_entities(), 2);
        let cx = store.column_index(x).unwrap();
        let ce = expected.column_index(x).unwrap();
        assert_eq!(store.column(cx).sorted_numbers(), expected.column(ce).sorted_numbers());
    }

    #[test]
    fn test_remove_entity_swap_down() {
        let (mut store, x, y) = store_with_xy(&[(1.0, 10.0), (2.0, 20.0), (3.0, 30.0)]);
        // remove entity 0, relocating the last entity into slot 0
        store.remove_entity(0, 2);
        store.validate_invariants();
        assert_eq!(store.num_entities(), 2);

        let cx = store.column_index(x).unwrap();
        let cy = store.column_index(y).unwrap();
        assert_eq!(store.value(0, cx), Value::Number(3.0));
        assert_eq!(store.value(0, cy), Value::Number(30.0));
        assert_eq!(store.value(1, cx), Value::Number(2.0));
        assert_eq!(store.column(cx).sorted_numbers(), &[(2.0, 1), (3.0, 0)]);
    }

    #[test]
    fn test_remove_then_readd_restores_indexes() {
        let (mut store, x, y) = store_with_xy(&[(1.0, 10.0), (2.0, 20.0), (3.0, 30.0)]);
        let baseline: Vec<(f64, usize)> =
            store.column(store.column_index(x).unwrap()).sorted_numbers().to_vec();

        store.remove_entity(2, 2);
        let back = Entity::new()
            .label(x, Value::Number(3.0))
            .label(y, Value::Number(30.0));
        store.add_entity(&back, 2);
        store.validate_invariants();
        assert_eq!(
            store.column(store.column_index(x).unwrap()).sorted_numbers(),
            baseline.as_slice()
        );
    }

    #[test]
    fn test_update_entity_label_and_column_removal() {
        let (pool, x, _) = pool_and_labels();
        let mut e0 = Entity::new().label(x, Value::Number(1.0));
        let e1 = Entity::new().label(x, Value::Number(2.0));
        let mut store = BoxFilterStore::new(pool);
        store.add_labels(&[x], &[e0.clone(), e1.clone()]);

        e0.set_label(x, Value::Number(5.0));
        store.update_entity_label(&e0, 0, x);
        store.validate_invariants();
        let cx = store.column_index(x).unwrap();
        assert_eq!(store.column(cx).sorted_numbers(), &[(2.0, 1), (5.0, 0)]);

        // dropping the label everywhere removes the column
        e0.remove_label(x);
        store.update_entity_label(&e0, 0, x);
        let mut e1_gone = e1;
        e1_gone.remove_label(x);
        store.update_entity_label(&e1_gone, 1, x);
        assert!(!store.has_label(x));
        assert_eq!(store.num_columns(), 0);
    }

    #[test]
    fn test_feature_predicates() {
        let (pool, x, y) = pool_and_labels();
        let entities = vec![
            Entity::new().label(x, Value::Number(1.0)).label(y, Value::Number(1.0)),
            Entity::new().label(x, Value::Number(2.0)),
            Entity::new().label(y, Value::Number(3.0)),
        ];
        let mut store = BoxFilterStore::new(pool);
        store.add_labels(&[x, y], &entities);

        let mut out = IndexSet::new();
        store.find_all_with_feature(x, &mut out);
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![0, 1]);

        store.find_all_without_feature(y, &mut out);
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![1]);

        let mut all = IndexSet::all(3);
        store.intersect_with_feature(y, &mut all);
        assert_eq!(all.iter().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_range_and_equality_predicates() {
        let (store, x, _) = store_with_xy(&[(1.0, 0.0), (2.0, 0.0), (3.0, 0.0), (2.0, 0.0)]);
        let mut out = IndexSet::new();
        store.find_all_within_range(
            x,
            Value::Number(1.5),
            Value::Number(2.5),
            true,
            &mut out,
        );
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![1, 3]);

        let mut eq = IndexSet::new();
        store.union_all_with_value(x, Value::Number(2.0), &mut eq);
        assert_eq!(eq.iter().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_mixed_column_types_partition() {
        let (pool, x, _) = pool_and_labels();
        let s = pool.intern("red");
        let entities = vec![
            Entity::new().label(x, Value::Number(1.0)),
            Entity::new().label(x, Value::StringId(s)),
            Entity::new().label(x, Value::missing_number()),
            Entity::new().label(x, Value::Null),
            Entity::new(),
        ];
        let mut store = BoxFilterStore::new(pool);
        store.add_labels(&[x], &entities);
        store.validate_invariants();

        let c = store.column_index(x).unwrap();
        assert_eq!(store.column(c).number_indices().len(), 1);
        assert_eq!(store.column(c).string_indices().len(), 1);
        assert_eq!(store.column(c).nan_indices().len(), 1);
        assert_eq!(store.column(c).null_indices().len(), 1);
        assert_eq!(store.column(c).invalid_indices().len(), 1);
    }

    #[test]
    fn test_code_equality_scan() {
        use lodestone_core::code::{ArenaCodeStore, CodeStore};

        let pool = Arc::new(StringPool::new());
        let x = pool.intern("tree");
        let code: Arc<ArenaCodeStore> = Arc::new(ArenaCodeStore::new());
        let a = code.alloc_number(1, 5.0);
        let b = code.alloc_number(1, 5.0);
        let c = code.alloc_number(1, 7.0);
        assert!(code.deep_equal(a, b));

        let entities = vec![
            Entity::new().label(x, Value::Code(a)),
            Entity::new().label(x, Value::Code(b)),
            Entity::new().label(x, Value::Code(c)),
        ];
        let mut store =
            BoxFilterStore::with_code_store(pool, code as Arc<dyn CodeStore>);
        store.add_labels(&[x], &entities);

        let mut out = IndexSet::new();
        store.union_all_with_value(x, Value::Code(a), &mut out);
        assert_eq!(out.iter().collect::<Vec<_>>(), vec![0, 1]);
    }
}

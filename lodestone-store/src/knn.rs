// SPDX-License-Identifier: AGPL-3.0-or-later
// Lodestone - Entity Query Engine
// Copyright (C) 2026 Lodestone Contributors (https://github.com/lodestone-db)

//! # Partial-Sum k-NN and Radius Search
//!
//! The search never computes most pairwise distances. Each feature first
//! *seeds* partial sums for the entities whose value is closest to the
//! target (walking the column's sorted vector outward, or a hash lookup
//! for nominal/string features) and reports the smallest term any
//! unseeded entity could still contribute. Sorting those minima yields a
//! lower-bound table: an entity missing `k` feature terms is at least
//! `partial_sum + table[k]` away. Candidates are then resolved in
//! ascending lower-bound order under an evolving *reject distance* — the
//! worst distance currently kept — completing remaining terms one at a
//! time and bailing out the moment the running sum crosses it.
//!
//! Equal-distance candidates at the boundary are kept or dropped by a
//! rank drawn from the query's seeded stream, so results are deterministic
//! for a seed regardless of thread scheduling.
//!
//! All scratch memory lives in [`SearchScratch`], owned by the worker and
//! passed in explicitly; nothing here is thread-local or global.

use lodestone_core::error::{QueryBudget, QueryError};
use lodestone_core::intset::IndexSet;
use lodestone_core::random::RandomStream;
use lodestone_core::strings::StringId;
use lodestone_core::value::Value;

use crate::distance::{DistanceParams, FeatureType};
use crate::fastmath::pow_with_accuracy;
use crate::matrix::BoxFilterStore;
use crate::partial_sums::PartialSumCollection;

/// One search hit: final (inverse-exponentiated) distance and entity index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceResult {
    pub distance: f64,
    pub entity: usize,
}

/// Per-worker scratch buffers for distance searches. Reset between
/// queries, reallocated only on growth.
pub struct SearchScratch {
    /// Local copy of the distance parameters, filtered to enabled features
    /// whose labels are materialized, in query order.
    query_params: DistanceParams,
    target_values: Vec<Value>,
    target_columns: Vec<usize>,
    partial_sums: PartialSumCollection,
    /// Smallest term any unseeded entity can still contribute, per feature.
    min_unpopulated: Vec<f64>,
    /// The same minima sorted ascending.
    min_unpopulated_sorted: Vec<f64>,
    /// `lb_table[k]` = sum of the `k` smallest minima: the lower bound on
    /// what `k` missing features must add.
    lb_table: Vec<f64>,
    /// `(lower bound, entity)` candidates, sorted ascending.
    candidate_order: Vec<(f64, usize)>,
}

impl SearchScratch {
    pub fn new() -> Self {
        Self {
            query_params: DistanceParams::default(),
            target_values: Vec::new(),
            target_columns: Vec::new(),
            partial_sums: PartialSumCollection::new(),
            min_unpopulated: Vec::new(),
            min_unpopulated_sorted: Vec::new(),
            lb_table: Vec::new(),
            candidate_order: Vec::new(),
        }
    }
}

impl Default for SearchScratch {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded max-heap keyed on `(distance, rank)`. Ranks come from the
/// query's stream, one draw per push in processing order, so boundary ties
/// resolve uniformly and reproducibly.
struct TieBreakingQueue {
    /// `(accumulated distance, rank, entity)`, worst on top.
    heap: std::collections::BinaryHeap<HeapEntry>,
    capacity: usize,
}

#[derive(PartialEq)]
struct HeapEntry {
    dist: f64,
    rank: u64,
    entity: usize,
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then(self.rank.cmp(&other.rank))
            .then(self.entity.cmp(&other.entity))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl TieBreakingQueue {
    fn new(capacity: usize) -> Self {
        Self { heap: std::collections::BinaryHeap::with_capacity(capacity + 1), capacity }
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    /// Current reject threshold: the worst kept distance once full.
    #[inline]
    fn reject_distance(&self) -> f64 {
        if self.is_full() {
            self.heap.peek().map_or(f64::INFINITY, |e| e.dist)
        } else {
            f64::INFINITY
        }
    }

    /// Offer a candidate with a pre-drawn rank. Ranks are drawn by the
    /// caller for *every* processed candidate, so stream consumption — and
    /// therefore tie outcomes — depend only on processing order, never on
    /// heap contents or the reject threshold. That is what makes a smaller
    /// `top_k` a strict prefix of a larger one.
    fn push(&mut self, dist: f64, rank: u64, entity: usize) {
        if self.capacity == 0 {
            return;
        }
        let entry = HeapEntry { dist, rank, entity };
        if self.heap.len() < self.capacity {
            self.heap.push(entry);
        } else if let Some(worst) = self.heap.peek() {
            if entry.cmp(worst) == std::cmp::Ordering::Less {
                self.heap.push(entry);
                self.heap.pop();
            }
        }
    }

    /// Drain ascending by `(distance, rank)`.
    fn into_sorted(self) -> Vec<(f64, u64, usize)> {
        let mut v: Vec<(f64, u64, usize)> =
            self.heap.into_iter().map(|e| (e.dist, e.rank, e.entity)).collect();
        v.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        v
    }
}

impl BoxFilterStore {
    /// Find the `top_k` entities of `enabled` nearest to the target
    /// position, appending `(distance, entity)` results sorted ascending.
    #[allow(clippy::too_many_arguments)]
    pub fn find_nearest_entities(
        &self,
        params: &DistanceParams,
        position_labels: &[StringId],
        position_values: &[Value],
        top_k: usize,
        ignore_entity: Option<usize>,
        enabled: &IndexSet,
        stream: &mut RandomStream,
        budget: &mut QueryBudget,
        scratch: &mut SearchScratch,
        out: &mut Vec<DistanceResult>,
    ) -> Result<(), QueryError> {
        out.clear();
        if self.num_entities() == 0 || enabled.is_empty() || top_k == 0 {
            return Ok(());
        }

        self.prepare_search(params, position_labels, position_values, top_k, scratch);
        let num_features = scratch.query_params.num_features();
        if num_features == 0 {
            // no usable features: every distance is zero, callers sample upstream
            return Ok(());
        }

        self.collect_candidates(ignore_entity, enabled, scratch);

        let mut queue = TieBreakingQueue::new(top_k);
        let mut exhausted = false;
        for i in 0..scratch.candidate_order.len() {
            let (lower_bound, entity) = scratch.candidate_order[i];
            if queue.is_full() && lower_bound > queue.reject_distance() {
                break;
            }
            if budget.charge_steps(num_features as u64).is_err() {
                exhausted = true;
                break;
            }
            let rank = stream.next_u64();
            let (accepted, dist) = self.resolve_candidate(entity, queue.reject_distance(), scratch);
            if accepted {
                queue.push(dist, rank, entity);
            }
        }

        self.finalize_results(queue.into_sorted(), scratch, out);
        if exhausted {
            return Err(QueryError::ResourcesExhausted);
        }
        Ok(())
    }

    /// Find every entity of `enabled` within `max_dist` of the target,
    /// appending results sorted ascending. Not size-capped.
    #[allow(clippy::too_many_arguments)]
    pub fn find_entities_within_distance(
        &self,
        params: &DistanceParams,
        position_labels: &[StringId],
        position_values: &[Value],
        max_dist: f64,
        enabled: &IndexSet,
        budget: &mut QueryBudget,
        scratch: &mut SearchScratch,
        out: &mut Vec<DistanceResult>,
    ) -> Result<(), QueryError> {
        out.clear();
        if self.num_entities() == 0 || enabled.is_empty() || max_dist.is_nan() {
            return Ok(());
        }

        // seed enough that the per-feature walk covers the whole radius
        self.prepare_search(params, position_labels, position_values, enabled.len(), scratch);
        let num_features = scratch.query_params.num_features();
        if num_features == 0 {
            return Ok(());
        }

        // the reject threshold lives in accumulated (pre-root) space
        let p = scratch.query_params.p_value;
        let reject = pow_with_accuracy(max_dist, p, true);

        self.collect_candidates(None, enabled, scratch);

        let mut kept: Vec<(f64, u64, usize)> = Vec::new();
        let mut exhausted = false;
        for i in 0..scratch.candidate_order.len() {
            let (lower_bound, entity) = scratch.candidate_order[i];
            if lower_bound > reject {
                break;
            }
            if budget.charge_steps(num_features as u64).is_err() {
                exhausted = true;
                break;
            }
            let (accepted, dist) = self.resolve_candidate(entity, reject, scratch);
            if accepted {
                kept.push((dist, 0, entity));
            }
        }
        kept.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.2.cmp(&b.2)));

        self.finalize_results(kept, scratch, out);
        if exhausted {
            return Err(QueryError::ResourcesExhausted);
        }
        Ok(())
    }

    /// k-NN around an already-stored entity. With
    /// `expand_to_first_nonzero`, `top_k` grows until the farthest kept
    /// neighbor has nonzero distance or the enabled set is exhausted
    /// (conviction needs neighbors at strictly positive distance).
    #[allow(clippy::too_many_arguments)]
    pub fn find_nearest_to_entity(
        &self,
        params: &DistanceParams,
        position_labels: &[StringId],
        search_entity: usize,
        top_k: usize,
        expand_to_first_nonzero: bool,
        enabled: &IndexSet,
        stream: &mut RandomStream,
        budget: &mut QueryBudget,
        scratch: &mut SearchScratch,
        out: &mut Vec<DistanceResult>,
    ) -> Result<(), QueryError> {
        out.clear();
        if search_entity >= self.num_entities() {
            return Ok(());
        }

        let position_values: Vec<Value> = position_labels
            .iter()
            .map(|&label| match self.column_index(label) {
                Some(c) => self.value(search_entity, c),
                None => Value::Null,
            })
            .collect();

        let selectable = enabled.len().saturating_sub(usize::from(enabled.contains(search_entity)));
        let mut k = top_k.min(selectable).max(1);
        loop {
            let mut fork = stream.clone();
            self.find_nearest_entities(
                params,
                position_labels,
                &position_values,
                k,
                Some(search_entity),
                enabled,
                &mut fork,
                budget,
                scratch,
                out,
            )?;

            let all_zero = out.last().is_some_and(|r| r.distance == 0.0);
            if !expand_to_first_nonzero || !all_zero || out.len() >= selectable {
                *stream = fork;
                return Ok(());
            }
            k = (k * 2).min(selectable);
        }
    }

    // =========================================================================
    // Search phases
    // =========================================================================

    /// Phase 1: snap targets to column cell types, run the unknown-value
    /// closure, and seed per-feature partial sums.
    fn prepare_search(
        &self,
        params: &DistanceParams,
        position_labels: &[StringId],
        position_values: &[Value],
        seed_count: usize,
        scratch: &mut SearchScratch,
    ) {
        scratch.query_params = DistanceParams {
            features: Vec::with_capacity(position_labels.len()),
            p_value: params.p_value,
            high_accuracy: params.high_accuracy,
            recompute_accurate_distances: params.recompute_accurate_distances,
        };
        scratch.target_values.clear();
        scratch.target_columns.clear();

        for (i, &label) in position_labels.iter().enumerate() {
            if i >= params.features.len() || !params.is_feature_enabled(i) {
                continue;
            }
            let Some(column_index) = self.column_index(label) else {
                // a missing column was already turned into an EXISTS
                // condition upstream; the feature contributes nothing here
                continue;
            };

            let mut feature = params.features[i].clone();
            let raw = position_values.get(i).copied().unwrap_or(Value::Null);
            let target = match feature.feature_type {
                FeatureType::Nominal
                | FeatureType::ContinuousString
                | FeatureType::ContinuousCode => raw,
                _ => {
                    let column = self.column(column_index);
                    if feature.feature_type == FeatureType::Continuous {
                        let numeric_like = column.number_indices().len()
                            + column.nan_indices().len()
                            + column.null_indices().len()
                            + column.invalid_indices().len();
                        if numeric_like == self.num_entities() {
                            feature.feature_type = FeatureType::ContinuousUniversallyNumeric;
                        }
                    }
                    match raw {
                        Value::Number(_) => raw,
                        _ => Value::missing_number(),
                    }
                }
            };

            // unknown-value closure: derive missing uncertainty differences
            // from the column so later term computation is branch-free
            if feature.known_to_unknown.is_nan() || feature.unknown_to_unknown.is_nan() {
                let derived = self.column(column_index).max_difference_from_value(
                    &feature,
                    target,
                    self.strings(),
                );
                if feature.known_to_unknown.is_nan() {
                    feature.known_to_unknown = derived;
                }
                if feature.unknown_to_unknown.is_nan() {
                    feature.unknown_to_unknown = derived;
                }
            }

            scratch.target_values.push(target);
            scratch.target_columns.push(column_index);
            scratch.query_params.features.push(feature);
        }

        scratch.query_params.set_and_constrain_params();
        self.populate_initial_partial_sums(seed_count, scratch);
    }

    /// Phase 2: per-feature seeding plus the lower-bound tables.
    fn populate_initial_partial_sums(&self, seed_count: usize, scratch: &mut SearchScratch) {
        let num_features = scratch.query_params.num_features();
        scratch.partial_sums.resize(self.num_entities(), num_features);
        scratch.min_unpopulated.clear();

        for feature in 0..num_features {
            let min_term = self.populate_feature_partial_sums(feature, seed_count, scratch);
            scratch.min_unpopulated.push(min_term);
        }

        scratch.min_unpopulated_sorted.clear();
        scratch.min_unpopulated_sorted.extend_from_slice(&scratch.min_unpopulated);
        scratch
            .min_unpopulated_sorted
            .sort_by(|a, b| a.total_cmp(b));

        scratch.lb_table.clear();
        scratch.lb_table.push(0.0);
        let mut acc = 0.0;
        for &m in &scratch.min_unpopulated_sorted {
            acc += m;
            scratch.lb_table.push(acc);
        }
    }

    /// Seed one feature's partial sums with the entities whose values are
    /// closest to the target; returns the smallest term any unseeded
    /// entity could still contribute.
    fn populate_feature_partial_sums(
        &self,
        feature: usize,
        seed_count: usize,
        scratch: &mut SearchScratch,
    ) -> f64 {
        let column_index = scratch.target_columns[feature];
        let target = scratch.target_values[feature];
        let params = &scratch.query_params;
        let column = self.column(column_index);
        let ctx = self.term_context();

        let k2u = params.known_to_unknown_term(feature);
        let u2u = params.unknown_to_unknown_term(feature);

        match params.features[feature].feature_type {
            FeatureType::Nominal => {
                if crate::distance::is_unknown(target) {
                    let mut unknowns = IndexSet::new();
                    column.nan_indices().union_into(&mut unknowns);
                    column.null_indices().union_into(&mut unknowns);
                    let ps = &mut scratch.partial_sums;
                    for entity in unknowns.iter() {
                        accum_term(ps, entity, feature, u2u);
                    }
                    k2u
                } else {
                    let mut matches = IndexSet::new();
                    self.union_all_with_value(column.label(), target, &mut matches);
                    let match_term = params.nominal_match_term(feature);
                    let nonmatch_term = params.nominal_nonmatch_term(feature);
                    let ps = &mut scratch.partial_sums;
                    for entity in matches.iter() {
                        accum_term(ps, entity, feature, match_term);
                    }
                    nonmatch_term.min(k2u).min(u2u)
                }
            }
            FeatureType::ContinuousString => match target.as_string_id() {
                Some(_) => {
                    let mut matches = IndexSet::new();
                    column.union_all_with_value(target, &mut matches);
                    let ps = &mut scratch.partial_sums;
                    for entity in matches.iter() {
                        ps.accum_zero(entity, feature);
                    }
                    // any unseeded string differs by at least one edit
                    params.difference_to_term(1.0, feature).min(k2u)
                }
                None => {
                    let mut unknowns = IndexSet::new();
                    column.nan_indices().union_into(&mut unknowns);
                    column.null_indices().union_into(&mut unknowns);
                    let ps = &mut scratch.partial_sums;
                    for entity in unknowns.iter() {
                        accum_term(ps, entity, feature, u2u);
                    }
                    k2u
                }
            },
            FeatureType::ContinuousCode => {
                // exact terms for every code entity; only unknowns stay unseeded
                let entities: Vec<usize> = column.code_indices().iter().collect();
                for entity in entities {
                    let other = self.value(entity, column_index);
                    let term = scratch.query_params.compute_term_regular(target, other, feature, ctx);
                    accum_term(&mut scratch.partial_sums, entity, feature, term);
                }
                k2u.min(u2u)
            }
            FeatureType::ContinuousCyclic => match target.as_number().filter(|n| !n.is_nan()) {
                Some(_) => {
                    // cyclic order does not match sorted order: compute every
                    // number entity's term outright
                    for &(value, entity) in column.sorted_numbers() {
                        let term = scratch.query_params.compute_term_regular(
                            target,
                            Value::Number(value),
                            feature,
                            ctx,
                        );
                        accum_term(&mut scratch.partial_sums, entity, feature, term);
                    }
                    k2u.min(u2u)
                }
                None => self.seed_unknown_number_target(feature, column_index, scratch),
            },
            FeatureType::Continuous | FeatureType::ContinuousUniversallyNumeric => {
                match target.as_number().filter(|n| !n.is_nan()) {
                    Some(v) => self.seed_numeric_expansion(feature, column_index, v, seed_count, scratch),
                    None => self.seed_unknown_number_target(feature, column_index, scratch),
                }
            }
        }
    }

    /// Walk the sorted value vector outward from the target, accumulating
    /// exact terms for the nearest `seed_count` entities. The next
    /// unvisited value on either side bounds what unseeded entities can
    /// contribute.
    fn seed_numeric_expansion(
        &self,
        feature: usize,
        column_index: usize,
        target: f64,
        seed_count: usize,
        scratch: &mut SearchScratch,
    ) -> f64 {
        let column = self.column(column_index);
        let sorted = column.sorted_numbers();
        let params = &scratch.query_params;
        let k2u = params.known_to_unknown_term(feature);

        if sorted.is_empty() {
            return k2u;
        }

        let split = sorted.partition_point(|&(v, _)| v < target);
        let mut left = split; // next index to take on the low side is left-1
        let mut right = split;
        let mut seeded = 0usize;

        while seeded < seed_count && (left > 0 || right < sorted.len()) {
            let take_left = match (left > 0, right < sorted.len()) {
                (true, true) => {
                    (target - sorted[left - 1].0).abs() <= (sorted[right].0 - target).abs()
                }
                (true, false) => true,
                (false, true) => false,
                (false, false) => break,
            };
            let (value, entity) = if take_left {
                left -= 1;
                sorted[left]
            } else {
                let pair = sorted[right];
                right += 1;
                pair
            };
            let term = scratch
                .query_params
                .difference_to_term((value - target).abs(), feature);
            accum_term(&mut scratch.partial_sums, entity, feature, term);
            seeded += 1;
        }

        let params = &scratch.query_params;
        let next_left = (left > 0)
            .then(|| params.difference_to_term((target - sorted[left - 1].0).abs(), feature));
        let next_right = (right < sorted.len())
            .then(|| params.difference_to_term((sorted[right].0 - target).abs(), feature));
        let next_value_term = match (next_left, next_right) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => f64::INFINITY,
        };
        next_value_term.min(k2u)
    }

    /// Numeric feature whose target is unknown: seed the unknown entities
    /// with the unknown↔unknown term; every known entity owes the
    /// known↔unknown term.
    fn seed_unknown_number_target(
        &self,
        feature: usize,
        column_index: usize,
        scratch: &mut SearchScratch,
    ) -> f64 {
        let column = self.column(column_index);
        let mut unknowns = IndexSet::new();
        column.nan_indices().union_into(&mut unknowns);
        column.null_indices().union_into(&mut unknowns);
        let u2u = scratch.query_params.unknown_to_unknown_term(feature);
        for entity in unknowns.iter() {
            accum_term(&mut scratch.partial_sums, entity, feature, u2u);
        }
        scratch.query_params.known_to_unknown_term(feature)
    }

    /// Phase 3: lower-bound every enabled entity and order candidates.
    fn collect_candidates(
        &self,
        ignore_entity: Option<usize>,
        enabled: &IndexSet,
        scratch: &mut SearchScratch,
    ) {
        let num_features = scratch.query_params.num_features();
        scratch.candidate_order.clear();
        for entity in enabled.iter() {
            if entity >= self.num_entities() || Some(entity) == ignore_entity {
                continue;
            }
            let (filled, sum) = scratch.partial_sums.filled_count_and_sum(entity);
            let lower_bound = sum + scratch.lb_table[num_features - filled];
            scratch.candidate_order.push((lower_bound, entity));
        }
        scratch
            .candidate_order
            .sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    }

    /// Phase 4: complete one candidate's missing terms under the reject
    /// distance; `(true, d)` means it stayed at or under it.
    fn resolve_candidate(
        &self,
        entity: usize,
        reject_distance: f64,
        scratch: &mut SearchScratch,
    ) -> (bool, f64) {
        let num_features = scratch.query_params.num_features();
        let (filled, mut dist) = scratch.partial_sums.filled_count_and_sum(entity);
        let mut uncalculated = num_features - filled;
        if uncalculated == 0 {
            return (dist <= reject_distance, dist);
        }

        dist += scratch.lb_table[uncalculated];
        if dist > reject_distance {
            return (false, dist);
        }

        let ctx = self.term_context();
        let missing: Vec<usize> = scratch.partial_sums.uncomputed_features(entity).collect();
        for feature in missing {
            // swap this feature's share of the lower bound for its real term
            uncalculated -= 1;
            dist -= scratch.min_unpopulated_sorted[uncalculated];

            let column_index = scratch.target_columns[feature];
            let other = self.value(entity, column_index);
            dist += scratch.query_params.compute_term_regular(
                scratch.target_values[feature],
                other,
                feature,
                ctx,
            );
            if dist > reject_distance {
                return (false, dist);
            }
            if uncalculated == 0 {
                break;
            }
        }
        (true, dist)
    }

    /// Phase 5: inverse-exponentiate (or recompute survivors exactly) and
    /// emit in `(distance, rank)` order.
    fn finalize_results(
        &self,
        kept: Vec<(f64, u64, usize)>,
        scratch: &mut SearchScratch,
        out: &mut Vec<DistanceResult>,
    ) {
        let params = &scratch.query_params;
        if !params.high_accuracy && params.recompute_accurate_distances {
            let mut accurate = params.clone();
            accurate.high_accuracy = true;
            accurate.set_and_constrain_params();
            let ctx = self.term_context();

            let mut recomputed: Vec<(f64, u64, usize)> = kept
                .into_iter()
                .map(|(_, rank, entity)| {
                    let mut accum = 0.0;
                    for feature in 0..accurate.num_features() {
                        let other = self.value(entity, scratch.target_columns[feature]);
                        accum += accurate.compute_term_regular(
                            scratch.target_values[feature],
                            other,
                            feature,
                            ctx,
                        );
                    }
                    (accurate.inverse_exponentiate(accum), rank, entity)
                })
                .collect();
            recomputed.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
            out.extend(
                recomputed
                    .into_iter()
                    .map(|(distance, _, entity)| DistanceResult { distance, entity }),
            );
        } else {
            out.extend(kept.into_iter().map(|(accum, _, entity)| DistanceResult {
                distance: params.inverse_exponentiate(accum),
                entity,
            }));
        }
    }

}

#[inline]
fn accum_term(ps: &mut PartialSumCollection, entity: usize, feature: usize, term: f64) {
    if term == 0.0 {
        ps.accum_zero(entity, feature);
    } else {
        ps.accum(entity, feature, term);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::FeatureParams;
    use crate::entity::Entity;
    use lodestone_core::strings::StringPool;
    use std::sync::Arc;

    struct Fixture {
        store: BoxFilterStore,
        labels: Vec<StringId>,
    }

    fn numeric_store(rows: &[&[f64]], label_names: &[&str]) -> Fixture {
        let pool = Arc::new(StringPool::new());
        let labels: Vec<StringId> = label_names.iter().map(|n| pool.intern(n)).collect();
        let entities: Vec<Entity> = rows
            .iter()
            .map(|row| {
                let mut e = Entity::new();
                for (&label, &v) in labels.iter().zip(row.iter()) {
                    if !v.is_nan() {
                        e.set_label(label, Value::Number(v));
                    } else {
                        e.set_label(label, Value::missing_number());
                    }
                }
                e
            })
            .collect();
        let mut store = BoxFilterStore::new(pool);
        store.add_labels(&labels, &entities);
        Fixture { store, labels }
    }

    fn euclidean(n: usize) -> DistanceParams {
        let mut p = DistanceParams::new(
            (0..n).map(|_| FeatureParams::default()).collect(),
            2.0,
        );
        p.high_accuracy = true;
        p.recompute_accurate_distances = false;
        p.set_and_constrain_params();
        p
    }

    fn nearest(
        fixture: &Fixture,
        params: &DistanceParams,
        target: &[f64],
        top_k: usize,
        seed: &str,
    ) -> Vec<DistanceResult> {
        let values: Vec<Value> = target.iter().map(|&v| Value::Number(v)).collect();
        let enabled = IndexSet::all(fixture.store.num_entities());
        let mut stream = RandomStream::from_seed_str(seed);
        let mut budget = QueryBudget::unlimited();
        let mut scratch = SearchScratch::new();
        let mut out = Vec::new();
        fixture
            .store
            .find_nearest_entities(
                params,
                &fixture.labels,
                &values,
                top_k,
                None,
                &enabled,
                &mut stream,
                &mut budget,
                &mut scratch,
                &mut out,
            )
            .unwrap();
        out
    }

    #[test]
    fn test_knn_euclidean() {
        let fixture = numeric_store(&[&[0.0, 0.0], &[3.0, 4.0], &[6.0, 0.0]], &["x", "y"]);
        let params = euclidean(2);
        let results = nearest(&fixture, &params, &[1.0, 0.0], 2, "e2");

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].entity, 0);
        assert!((results[0].distance - 1.0).abs() < 1e-9);
        assert_eq!(results[1].entity, 1);
        assert!((results[1].distance - 20.0f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_knn_matches_brute_force() {
        let rows: Vec<Vec<f64>> = (0..60)
            .map(|i| {
                let i = i as f64;
                vec![(i * 37.0) % 11.0, (i * 13.0) % 7.0, (i * 5.0) % 17.0]
            })
            .collect();
        let row_refs: Vec<&[f64]> = rows.iter().map(|r| r.as_slice()).collect();
        let fixture = numeric_store(&row_refs, &["a", "b", "c"]);
        let params = euclidean(3);
        let target = [4.0, 3.0, 9.0];

        let results = nearest(&fixture, &params, &target, 5, "bf");

        // brute force over the same metric
        let mut expected: Vec<(f64, usize)> = rows
            .iter()
            .enumerate()
            .map(|(e, row)| {
                let d: f64 = row
                    .iter()
                    .zip(target.iter())
                    .map(|(a, t)| (a - t) * (a - t))
                    .sum::<f64>()
                    .sqrt();
                (d, e)
            })
            .collect();
        expected.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        assert_eq!(results.len(), 5);
        for (got, want) in results.iter().zip(expected.iter()) {
            assert!((got.distance - want.0).abs() < 1e-9);
        }
        let got_set: std::collections::HashSet<usize> =
            results.iter().map(|r| r.entity).collect();
        let want_set: std::collections::HashSet<usize> =
            expected[..5].iter().map(|&(_, e)| e).collect();
        assert_eq!(got_set, want_set);
    }

    #[test]
    fn test_same_seed_same_results() {
        let fixture = numeric_store(
            &[&[0.0], &[1.0], &[1.0], &[1.0], &[2.0]],
            &["x"],
        );
        let params = euclidean(1);
        let a = nearest(&fixture, &params, &[1.0], 2, "tie-seed");
        let b = nearest(&fixture, &params, &[1.0], 2, "tie-seed");
        assert_eq!(a, b);
        for r in &a {
            assert!([1usize, 2, 3].contains(&r.entity));
            assert_eq!(r.distance, 0.0);
        }
    }

    #[test]
    fn test_smaller_top_k_is_prefix() {
        let rows: Vec<Vec<f64>> = (0..40).map(|i| vec![(i % 8) as f64]).collect();
        let row_refs: Vec<&[f64]> = rows.iter().map(|r| r.as_slice()).collect();
        let fixture = numeric_store(&row_refs, &["x"]);
        let params = euclidean(1);

        let large = nearest(&fixture, &params, &[3.0], 12, "prefix");
        let small = nearest(&fixture, &params, &[3.0], 5, "prefix");
        assert_eq!(&large[..5], &small[..]);
    }

    #[test]
    fn test_cyclic_feature() {
        let pool = Arc::new(StringPool::new());
        let h = pool.intern("h");
        let entities: Vec<Entity> = [10.0, 350.0, 180.0]
            .iter()
            .map(|&v| Entity::new().label(h, Value::Number(v)))
            .collect();
        let mut store = BoxFilterStore::new(pool);
        store.add_labels(&[h], &entities);

        let mut params = DistanceParams::new(vec![FeatureParams::cyclic(360.0)], 1.0);
        params.high_accuracy = true;
        params.recompute_accurate_distances = false;
        params.set_and_constrain_params();

        let fixture = Fixture { store, labels: vec![h] };
        let results = nearest(&fixture, &params, &[0.0], 3, "cyc");
        let by_entity: std::collections::HashMap<usize, f64> =
            results.iter().map(|r| (r.entity, r.distance)).collect();
        assert!((by_entity[&0] - 10.0).abs() < 1e-9);
        assert!((by_entity[&1] - 10.0).abs() < 1e-9);
        assert!((by_entity[&2] - 180.0).abs() < 1e-9);

        // the two 10-distance entities tie for first; the seed decides
        let one = nearest(&fixture, &params, &[0.0], 1, "cyc");
        assert_eq!(one.len(), 1);
        assert!([0usize, 1].contains(&one[0].entity));
        assert_eq!(nearest(&fixture, &params, &[0.0], 1, "cyc"), one);
    }

    #[test]
    fn test_nominal_feature_terms() {
        let pool = Arc::new(StringPool::new());
        let c = pool.intern("c");
        let a_val = pool.intern("A");
        let b_val = pool.intern("B");
        let entities = vec![
            Entity::new().label(c, Value::StringId(a_val)),
            Entity::new().label(c, Value::StringId(b_val)),
            Entity::new().label(c, Value::StringId(a_val)),
        ];
        let mut store = BoxFilterStore::new(pool);
        store.add_labels(&[c], &entities);

        let mut params = DistanceParams::new(vec![FeatureParams::nominal(3.0)], 1.0);
        params.high_accuracy = true;
        params.recompute_accurate_distances = false;
        params.set_and_constrain_params();

        let enabled = IndexSet::all(3);
        let mut stream = RandomStream::from_seed_str("nom");
        let mut budget = QueryBudget::unlimited();
        let mut scratch = SearchScratch::new();
        let mut out = Vec::new();
        store
            .find_nearest_entities(
                &params,
                &[c],
                &[Value::StringId(a_val)],
                3,
                None,
                &enabled,
                &mut stream,
                &mut budget,
                &mut scratch,
                &mut out,
            )
            .unwrap();

        let by_entity: std::collections::HashMap<usize, f64> =
            out.iter().map(|r| (r.entity, r.distance)).collect();
        assert_eq!(by_entity[&0], 0.0);
        assert_eq!(by_entity[&2], 0.0);
        assert_eq!(by_entity[&1], 1.0); // the nominal mismatch term
    }

    #[test]
    fn test_radius_search() {
        let fixture = numeric_store(&[&[0.0], &[0.5], &[0.9], &[2.0]], &["x"]);
        let mut params = euclidean(1);
        params.p_value = 2.0;
        params.set_and_constrain_params();

        let enabled = IndexSet::all(4);
        let mut budget = QueryBudget::unlimited();
        let mut scratch = SearchScratch::new();
        let mut out = Vec::new();
        fixture
            .store
            .find_entities_within_distance(
                &params,
                &fixture.labels,
                &[Value::Number(0.0)],
                1.0,
                &enabled,
                &mut budget,
                &mut scratch,
                &mut out,
            )
            .unwrap();

        let entities: Vec<usize> = out.iter().map(|r| r.entity).collect();
        assert_eq!(entities, vec![0, 1, 2]);
        assert!(out.iter().all(|r| r.distance <= 1.0));
    }

    #[test]
    fn test_missing_values_use_unknown_terms() {
        // entity 1 lacks y entirely, entity 2 has NaN y
        let pool = Arc::new(StringPool::new());
        let x = pool.intern("x");
        let y = pool.intern("y");
        let entities = vec![
            Entity::new().label(x, Value::Number(0.0)).label(y, Value::Number(0.0)),
            Entity::new().label(x, Value::Number(0.0)),
            Entity::new()
                .label(x, Value::Number(0.0))
                .label(y, Value::missing_number()),
            Entity::new().label(x, Value::Number(0.0)).label(y, Value::Number(10.0)),
        ];
        let mut store = BoxFilterStore::new(pool);
        store.add_labels(&[x, y], &entities);

        let mut params = euclidean(2);
        params.p_value = 1.0;
        params.set_and_constrain_params();

        let fixture = Fixture { store, labels: vec![x, y] };
        let results = nearest(&fixture, &params, &[0.0, 0.0], 4, "unk");
        let by_entity: std::collections::HashMap<usize, f64> =
            results.iter().map(|r| (r.entity, r.distance)).collect();

        assert_eq!(by_entity[&0], 0.0);
        assert_eq!(by_entity[&3], 10.0);
        // unknown terms derive from the column spread (max |0 - v| = 10)
        assert_eq!(by_entity[&1], 10.0);
        assert_eq!(by_entity[&2], 10.0);
    }

    #[test]
    fn test_find_nearest_to_entity_expands_past_zero() {
        let fixture = numeric_store(&[&[1.0], &[1.0], &[1.0], &[5.0], &[9.0]], &["x"]);
        let mut params = euclidean(1);
        params.p_value = 1.0;
        params.set_and_constrain_params();

        let enabled = IndexSet::all(5);
        let mut stream = RandomStream::from_seed_str("expand");
        let mut budget = QueryBudget::unlimited();
        let mut scratch = SearchScratch::new();
        let mut out = Vec::new();
        fixture
            .store
            .find_nearest_to_entity(
                &params,
                &fixture.labels,
                0,
                2,
                true,
                &enabled,
                &mut stream,
                &mut budget,
                &mut scratch,
                &mut out,
            )
            .unwrap();

        // expansion keeps growing k until a nonzero distance shows up
        assert!(out.iter().any(|r| r.distance > 0.0));
        assert!(!out.iter().any(|r| r.entity == 0));
    }

    #[test]
    fn test_budget_exhaustion_returns_partial() {
        let rows: Vec<Vec<f64>> = (0..50).map(|i| vec![i as f64]).collect();
        let row_refs: Vec<&[f64]> = rows.iter().map(|r| r.as_slice()).collect();
        let fixture = numeric_store(&row_refs, &["x"]);
        let params = euclidean(1);

        let enabled = IndexSet::all(50);
        let mut stream = RandomStream::from_seed_str("budget");
        let mut budget = QueryBudget::new(5, u64::MAX); // five feature-steps only
        let mut scratch = SearchScratch::new();
        let mut out = Vec::new();
        let result = fixture.store.find_nearest_entities(
            &params,
            &fixture.labels,
            &[Value::Number(25.0)],
            20,
            None,
            &enabled,
            &mut stream,
            &mut budget,
            &mut scratch,
            &mut out,
        );
        assert!(matches!(result, Err(QueryError::ResourcesExhausted)));
        assert!(out.len() <= 5);
    }

    #[test]
    fn test_empty_store_is_empty_result() {
        let pool = Arc::new(StringPool::new());
        let x = pool.intern("x");
        let store = BoxFilterStore::new(pool);
        let params = euclidean(1);

        let enabled = IndexSet::new();
        let mut stream = RandomStream::from_seed_str("empty");
        let mut budget = QueryBudget::unlimited();
        let mut scratch = SearchScratch::new();
        let mut out = Vec::new();
        store
            .find_nearest_entities(
                &params,
                &[x],
                &[Value::Number(0.0)],
                3,
                None,
                &enabled,
                &mut stream,
                &mut budget,
                &mut scratch,
                &mut out,
            )
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_zero_weight_feature_changes_nothing() {
        let fixture = numeric_store(&[&[0.0, 100.0], &[1.0, -50.0], &[2.0, 7.0]], &["x", "w"]);
        let mut params = euclidean(2);
        params.features[1].weight = 0.0;
        params.set_and_constrain_params();

        let results = nearest(&fixture, &params, &[0.0, 0.0], 3, "w0");
        let baseline_fixture =
            numeric_store(&[&[0.0, 1.0], &[1.0, 1.0], &[2.0, 1.0]], &["x", "w"]);
        let baseline = nearest(&baseline_fixture, &params, &[0.0, 0.0], 3, "w0");

        let got: Vec<(usize, u64)> =
            results.iter().map(|r| (r.entity, r.distance.to_bits())).collect();
        let want: Vec<(usize, u64)> =
            baseline.iter().map(|r| (r.entity, r.distance.to_bits())).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn test_top_k_larger_than_store() {
        let fixture = numeric_store(&[&[1.0], &[2.0]], &["x"]);
        let params = euclidean(1);
        let results = nearest(&fixture, &params, &[0.0], 10, "big-k");
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_recompute_accurate_distances() {
        let fixture = numeric_store(&[&[0.0], &[3.0], &[4.1]], &["x"]);
        let mut params = euclidean(1);
        params.p_value = 3.0;
        params.high_accuracy = false;
        params.recompute_accurate_distances = true;
        params.set_and_constrain_params();

        let results = nearest(&fixture, &params, &[1.0], 2, "acc");
        // survivors were recomputed with exact arithmetic
        assert!((results[0].distance - 1.0).abs() < 1e-9);
        assert!((results[1].distance - 2.0).abs() < 1e-9);
    }
}

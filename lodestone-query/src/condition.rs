// SPDX-License-Identifier: AGPL-3.0-or-later
// Lodestone - Entity Query Engine
// Copyright (C) 2026 Lodestone Contributors (https://github.com/lodestone-db)

//! # Query Conditions
//!
//! A query is an ordered `Vec<Condition>`. [`ConditionBuilder`] is the
//! only sanctioned way to construct one: beyond the fluent API it applies
//! the normalizations the pipeline depends on —
//!
//! - `≥` / `≤` rewrite to `Between` with an open side;
//! - consecutive conditions of the same mergeable family (`Equals`,
//!   `NotEquals`, the `Between` family, `Exists`, `NotExists`) coalesce
//!   into one multi-label condition;
//! - a single-entity `NotInEntityList` immediately before a nearest query
//!   folds into that query's exclusion slot;
//! - distance conditions get an `Exists` condition inserted ahead of them
//!   covering every position label (entities that do not carry a queried
//!   label cannot be measured), and zero-weight features are stripped from
//!   the distance parameters;
//! - malformed parameters degrade instead of erroring: NaN counts and
//!   radii become zero, invalid labels turn the condition into
//!   [`Condition::Null`].

use serde::{Deserialize, Serialize};

use lodestone_core::strings::StringId;
use lodestone_core::value::{Value, ValueKind};
use lodestone_store::distance::DistanceParams;

/// Accuracy request for a distance query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NumericalPrecision {
    /// High accuracy throughout, no recompute pass.
    Precise,
    /// Fast approximations, no recompute pass.
    Fast,
    /// Fast approximations, then recompute the survivors exactly.
    #[default]
    Recompute,
}

/// What a distance-family condition computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceQueryKind {
    /// k nearest entities to a position.
    Nearest,
    /// All entities within a radius of a position.
    Within,
    /// Per-entity conviction (average removal divergence over own).
    Convictions,
    /// Per-entity KL divergence of removal.
    KlDivergences,
    /// One divergence for removing a whole group.
    GroupKlDivergence,
    /// Per-entity expected distance contribution.
    DistanceContributions,
}

/// A distance-family condition: position, feature parameters, and the
/// result-shaping knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistanceQuery {
    pub kind: DistanceQueryKind,
    pub position_labels: Vec<StringId>,
    /// Target position, aligned with `position_labels`. Unused by the
    /// entity-based kinds.
    pub position_values: Vec<Value>,
    /// Entity indices for the entity-based kinds (conviction targets, or
    /// the group for a group divergence). Empty means "all matching".
    pub entities: Vec<usize>,
    pub params: DistanceParams,
    /// `top_k` for nearest/conviction kinds.
    pub top_k: usize,
    /// Radius for `Within`; infinity otherwise.
    pub max_distance: f64,
    /// Map result distances through `x → 2^−x` instead of `x → x^e`.
    pub surprisal_to_prob: bool,
    /// Exponent `e` for the `x → x^e` transform.
    pub distance_weight_exponent: f64,
    /// Column supplying per-entity weights, if any.
    pub weight_label: Option<StringId>,
    pub seed: String,
    /// Entity excluded from nearest results (folded from a preceding
    /// single-entity `NotInEntityList`).
    pub exclusion_entity: Option<usize>,
    /// Divergence of removal rather than of addition.
    pub conviction_of_removal: bool,
    /// Sort result pairs by value before returning.
    pub return_sorted: bool,
}

/// One step of a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Condition {
    /// Matches nothing; produced when a condition degrades.
    Null,
    Exists { labels: Vec<StringId> },
    NotExists { labels: Vec<StringId> },
    Equals { pairs: Vec<(StringId, Value)> },
    NotEquals { pairs: Vec<(StringId, Value)> },
    /// `low ≤ value ≤ high` per label; `negate` flips to the complement.
    Between { ranges: Vec<(StringId, Value, Value)>, negate: bool },
    Among { label: StringId, values: Vec<Value> },
    NotAmong { label: StringId, values: Vec<Value> },
    Min { label: StringId, kind: ValueKind, count: usize },
    Max { label: StringId, kind: ValueKind, count: usize },
    InEntityList { entities: Vec<usize> },
    NotInEntityList { entities: Vec<usize> },
    Sum { label: StringId, weight_label: Option<StringId> },
    Mode { label: StringId, kind: ValueKind, weight_label: Option<StringId> },
    Quantile { label: StringId, q: f64, weight_label: Option<StringId> },
    GeneralizedMean {
        label: StringId,
        p: f64,
        weight_label: Option<StringId>,
        center: f64,
        calculate_moment: bool,
        absolute_value: bool,
    },
    /// Smallest gap between adjacent values; `cyclic_range` adds the wrap
    /// gap, `include_zero` keeps zero gaps.
    MinDifference { label: StringId, cyclic_range: Option<f64>, include_zero: bool },
    MaxDifference { label: StringId, cyclic_range: Option<f64> },
    ValueMasses { label: StringId, kind: ValueKind, weight_label: Option<StringId> },
    Select { count: usize, offset: usize, seed: Option<String> },
    Sample { count: usize, seed: Option<String> },
    WeightedSample { weight_label: StringId, count: usize, seed: Option<String> },
    Distance(Box<DistanceQuery>),
}

impl Condition {
    /// Every label the cache must materialize before this condition runs.
    pub fn referenced_labels(&self) -> Vec<StringId> {
        match self {
            Condition::Null
            | Condition::Select { .. }
            | Condition::Sample { .. }
            | Condition::InEntityList { .. }
            | Condition::NotInEntityList { .. } => Vec::new(),
            Condition::Exists { labels } | Condition::NotExists { labels } => labels.clone(),
            Condition::Equals { pairs } | Condition::NotEquals { pairs } => {
                pairs.iter().map(|&(l, _)| l).collect()
            }
            Condition::Between { ranges, .. } => ranges.iter().map(|&(l, _, _)| l).collect(),
            Condition::Among { label, .. }
            | Condition::NotAmong { label, .. }
            | Condition::Min { label, .. }
            | Condition::Max { label, .. }
            | Condition::MinDifference { label, .. }
            | Condition::MaxDifference { label, .. } => vec![*label],
            Condition::WeightedSample { weight_label, .. } => vec![*weight_label],
            Condition::Sum { label, weight_label }
            | Condition::Mode { label, weight_label, .. }
            | Condition::Quantile { label, weight_label, .. }
            | Condition::GeneralizedMean { label, weight_label, .. }
            | Condition::ValueMasses { label, weight_label, .. } => {
                let mut labels = vec![*label];
                labels.extend(weight_label.iter().copied());
                labels
            }
            Condition::Distance(q) => {
                let mut labels = q.position_labels.clone();
                labels.extend(q.weight_label.iter().copied());
                labels
            }
        }
    }
}

/// Fluent builder applying the coalescing and degradation rules.
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
}

impl ConditionBuilder {
    pub fn new() -> Self {
        Self { conditions: Vec::new() }
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }

    // =========================================================================
    // Existence and value predicates
    // =========================================================================

    pub fn exists(mut self, label: StringId) -> Self {
        if !label.is_string() {
            return self.degrade();
        }
        if let Some(Condition::Exists { labels }) = self.conditions.last_mut() {
            labels.push(label);
            return self;
        }
        self.conditions.push(Condition::Exists { labels: vec![label] });
        self
    }

    pub fn not_exists(mut self, label: StringId) -> Self {
        if !label.is_string() {
            return self.degrade();
        }
        if let Some(Condition::NotExists { labels }) = self.conditions.last_mut() {
            labels.push(label);
            return self;
        }
        self.conditions.push(Condition::NotExists { labels: vec![label] });
        self
    }

    pub fn equals(mut self, label: StringId, value: Value) -> Self {
        if !label.is_string() {
            return self.degrade();
        }
        if let Some(Condition::Equals { pairs }) = self.conditions.last_mut() {
            pairs.push((label, value));
            return self;
        }
        self.conditions.push(Condition::Equals { pairs: vec![(label, value)] });
        self
    }

    pub fn not_equals(mut self, label: StringId, value: Value) -> Self {
        if !label.is_string() {
            return self.degrade();
        }
        if let Some(Condition::NotEquals { pairs }) = self.conditions.last_mut() {
            pairs.push((label, value));
            return self;
        }
        self.conditions.push(Condition::NotEquals { pairs: vec![(label, value)] });
        self
    }

    pub fn between(self, label: StringId, low: Value, high: Value) -> Self {
        self.push_range(label, low, high, false)
    }

    pub fn not_between(self, label: StringId, low: Value, high: Value) -> Self {
        self.push_range(label, low, high, true)
    }

    /// `value ≥ bound`, rewritten to a `Between` with an open top.
    pub fn greater_or_equal(self, label: StringId, bound: Value) -> Self {
        let high = match bound {
            Value::Number(_) => Value::Number(f64::INFINITY),
            _ => Value::StringId(StringId::NOT_A_STRING),
        };
        self.push_range(label, bound, high, false)
    }

    /// `value ≤ bound`, rewritten to a `Between` with an open bottom.
    pub fn less_or_equal(self, label: StringId, bound: Value) -> Self {
        let low = match bound {
            Value::Number(_) => Value::Number(f64::NEG_INFINITY),
            _ => Value::StringId(StringId::NOT_A_STRING),
        };
        self.push_range(label, low, bound, false)
    }

    fn push_range(mut self, label: StringId, low: Value, high: Value, negate: bool) -> Self {
        if !label.is_string() {
            return self.degrade();
        }
        // Between, ≥, and ≤ are one family: consecutive members coalesce
        // as long as the negation matches
        if let Some(Condition::Between { ranges, negate: prev }) = self.conditions.last_mut() {
            if *prev == negate {
                ranges.push((label, low, high));
                return self;
            }
        }
        self.conditions.push(Condition::Between { ranges: vec![(label, low, high)], negate });
        self
    }

    pub fn among(mut self, label: StringId, values: Vec<Value>) -> Self {
        if !label.is_string() {
            return self.degrade();
        }
        self.conditions.push(Condition::Among { label, values });
        self
    }

    pub fn not_among(mut self, label: StringId, values: Vec<Value>) -> Self {
        if !label.is_string() {
            return self.degrade();
        }
        self.conditions.push(Condition::NotAmong { label, values });
        self
    }

    // =========================================================================
    // Extremes, lists, statistics, sampling
    // =========================================================================

    pub fn min(mut self, label: StringId, kind: ValueKind, count: f64) -> Self {
        if !label.is_string() {
            return self.degrade();
        }
        self.conditions.push(Condition::Min { label, kind, count: sanitize_count(count, 1) });
        self
    }

    pub fn max(mut self, label: StringId, kind: ValueKind, count: f64) -> Self {
        if !label.is_string() {
            return self.degrade();
        }
        self.conditions.push(Condition::Max { label, kind, count: sanitize_count(count, 1) });
        self
    }

    pub fn in_entity_list(mut self, entities: Vec<usize>) -> Self {
        self.conditions.push(Condition::InEntityList { entities });
        self
    }

    pub fn not_in_entity_list(mut self, entities: Vec<usize>) -> Self {
        self.conditions.push(Condition::NotInEntityList { entities });
        self
    }

    pub fn sum(mut self, label: StringId, weight_label: Option<StringId>) -> Self {
        if !label.is_string() {
            return self.degrade();
        }
        self.conditions.push(Condition::Sum { label, weight_label });
        self
    }

    pub fn mode(mut self, label: StringId, kind: ValueKind, weight_label: Option<StringId>) -> Self {
        if !label.is_string() {
            return self.degrade();
        }
        self.conditions.push(Condition::Mode { label, kind, weight_label });
        self
    }

    pub fn quantile(mut self, label: StringId, q: f64, weight_label: Option<StringId>) -> Self {
        if !label.is_string() {
            return self.degrade();
        }
        let q = if q.is_nan() { 0.5 } else { q.clamp(0.0, 1.0) };
        self.conditions.push(Condition::Quantile { label, q, weight_label });
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn generalized_mean(
        mut self,
        label: StringId,
        p: f64,
        weight_label: Option<StringId>,
        center: f64,
        calculate_moment: bool,
        absolute_value: bool,
    ) -> Self {
        if !label.is_string() {
            return self.degrade();
        }
        let p = if p.is_nan() { 1.0 } else { p };
        self.conditions.push(Condition::GeneralizedMean {
            label,
            p,
            weight_label,
            center: if center.is_nan() { 0.0 } else { center },
            calculate_moment,
            absolute_value,
        });
        self
    }

    pub fn min_difference(mut self, label: StringId, cyclic_range: f64, include_zero: bool) -> Self {
        if !label.is_string() {
            return self.degrade();
        }
        let cyclic_range = (!cyclic_range.is_nan()).then_some(cyclic_range);
        self.conditions.push(Condition::MinDifference { label, cyclic_range, include_zero });
        self
    }

    pub fn max_difference(mut self, label: StringId, cyclic_range: f64) -> Self {
        if !label.is_string() {
            return self.degrade();
        }
        let cyclic_range = (!cyclic_range.is_nan()).then_some(cyclic_range);
        self.conditions.push(Condition::MaxDifference { label, cyclic_range });
        self
    }

    pub fn value_masses(
        mut self,
        label: StringId,
        kind: ValueKind,
        weight_label: Option<StringId>,
    ) -> Self {
        if !label.is_string() {
            return self.degrade();
        }
        self.conditions.push(Condition::ValueMasses { label, kind, weight_label });
        self
    }

    pub fn select(mut self, count: f64, offset: usize, seed: Option<String>) -> Self {
        self.conditions.push(Condition::Select { count: sanitize_count(count, 0), offset, seed });
        self
    }

    pub fn sample(mut self, count: f64, seed: Option<String>) -> Self {
        self.conditions.push(Condition::Sample { count: sanitize_count(count, 1), seed });
        self
    }

    pub fn weighted_sample(
        mut self,
        weight_label: StringId,
        count: f64,
        seed: Option<String>,
    ) -> Self {
        if !weight_label.is_string() {
            return self.degrade();
        }
        self.conditions.push(Condition::WeightedSample {
            weight_label,
            count: sanitize_count(count, 1),
            seed,
        });
        self
    }

    // =========================================================================
    // Distance family
    // =========================================================================

    /// k-nearest query. A single-entity `NotInEntityList` immediately
    /// before it folds into the exclusion slot instead of filtering.
    #[allow(clippy::too_many_arguments)]
    pub fn nearest(
        mut self,
        position_labels: Vec<StringId>,
        position_values: Vec<Value>,
        top_k: f64,
        params: DistanceParams,
        seed: &str,
        precision: NumericalPrecision,
    ) -> Self {
        let mut exclusion_entity = None;
        if let Some(Condition::NotInEntityList { entities }) = self.conditions.last() {
            if entities.len() == 1 {
                exclusion_entity = Some(entities[0]);
                self.conditions.pop();
            }
        }

        let query = DistanceQuery {
            kind: DistanceQueryKind::Nearest,
            position_labels,
            position_values,
            entities: Vec::new(),
            params,
            top_k: sanitize_count(top_k, 0),
            max_distance: f64::INFINITY,
            surprisal_to_prob: false,
            distance_weight_exponent: 1.0,
            weight_label: None,
            seed: seed.to_string(),
            exclusion_entity,
            conviction_of_removal: false,
            return_sorted: true,
        };
        self.with_precision(query, precision)
    }

    /// Radius query; a NaN radius degrades to zero.
    pub fn within(
        self,
        position_labels: Vec<StringId>,
        position_values: Vec<Value>,
        max_distance: f64,
        params: DistanceParams,
        seed: &str,
        precision: NumericalPrecision,
    ) -> Self {
        let query = DistanceQuery {
            kind: DistanceQueryKind::Within,
            position_labels,
            position_values,
            entities: Vec::new(),
            params,
            top_k: usize::MAX,
            max_distance: if max_distance.is_nan() { 0.0 } else { max_distance },
            surprisal_to_prob: false,
            distance_weight_exponent: 1.0,
            weight_label: None,
            seed: seed.to_string(),
            exclusion_entity: None,
            conviction_of_removal: false,
            return_sorted: true,
        };
        self.with_precision(query, precision)
    }

    /// Entity-based distance computation (convictions, divergences,
    /// contributions). `entities` empty means "all matching entities".
    pub fn entity_computation(
        self,
        kind: DistanceQueryKind,
        position_labels: Vec<StringId>,
        entities: Vec<usize>,
        top_k: f64,
        params: DistanceParams,
        seed: &str,
        conviction_of_removal: bool,
    ) -> Self {
        let query = DistanceQuery {
            kind,
            position_labels,
            position_values: Vec::new(),
            entities,
            params,
            top_k: sanitize_count(top_k, 1),
            max_distance: f64::INFINITY,
            surprisal_to_prob: false,
            distance_weight_exponent: 1.0,
            weight_label: None,
            seed: seed.to_string(),
            exclusion_entity: None,
            conviction_of_removal,
            return_sorted: false,
        };
        self.push_distance(query)
    }

    /// Attach a distance-value transform to the most recent distance
    /// condition: a numeric exponent, or the surprisal→probability map.
    pub fn with_transform(mut self, surprisal_to_prob: bool, exponent: f64) -> Self {
        if let Some(Condition::Distance(q)) = self.conditions.last_mut() {
            q.surprisal_to_prob = surprisal_to_prob;
            q.distance_weight_exponent = if exponent.is_nan() { 1.0 } else { exponent };
        }
        self
    }

    /// Attach an entity-weight column to the most recent distance condition.
    pub fn with_entity_weight(mut self, weight_label: StringId) -> Self {
        if let Some(Condition::Distance(q)) = self.conditions.last_mut() {
            q.weight_label = weight_label.is_string().then_some(weight_label);
        }
        self
    }

    fn with_precision(self, mut query: DistanceQuery, precision: NumericalPrecision) -> Self {
        apply_precision(&mut query.params, precision);
        self.push_distance(query)
    }

    fn push_distance(mut self, mut query: DistanceQuery) -> Self {
        for label in &query.position_labels {
            if !label.is_string() {
                return self.degrade();
            }
        }
        query.params.set_and_constrain_params();

        // entities that do not carry a queried label cannot be measured:
        // guard the distance condition with an EXISTS over all its labels
        let exist_labels: Vec<StringId> = query.position_labels.clone();

        // strip zero-weight features; they constrain existence only
        if !query.entities.is_empty()
            || matches!(query.kind, DistanceQueryKind::Nearest | DistanceQueryKind::Within)
        {
            let mut i = 0;
            while i < query.params.features.len() {
                if query.params.features[i].weight == 0.0 {
                    query.params.features.remove(i);
                    query.position_labels.remove(i);
                    if i < query.position_values.len() {
                        query.position_values.remove(i);
                    }
                } else {
                    i += 1;
                }
            }
        }

        if !exist_labels.is_empty() {
            self = self.exists_all(exist_labels);
        }
        self.conditions.push(Condition::Distance(Box::new(query)));
        self
    }

    fn exists_all(mut self, labels: Vec<StringId>) -> Self {
        for label in labels {
            self = self.exists(label);
        }
        self
    }

    fn degrade(mut self) -> Self {
        self.conditions.push(Condition::Null);
        self
    }
}

impl Default for ConditionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply a precision tag to distance parameters.
pub fn apply_precision(params: &mut DistanceParams, precision: NumericalPrecision) {
    match precision {
        NumericalPrecision::Precise => {
            params.high_accuracy = true;
            params.recompute_accurate_distances = false;
        }
        NumericalPrecision::Fast => {
            params.high_accuracy = false;
            params.recompute_accurate_distances = false;
        }
        NumericalPrecision::Recompute => {
            params.high_accuracy = false;
            params.recompute_accurate_distances = true;
        }
    }
}

fn sanitize_count(count: f64, default: usize) -> usize {
    if count.is_nan() || count < 0.0 {
        default
    } else if count >= usize::MAX as f64 {
        usize::MAX
    } else {
        count as usize
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Lodestone - Entity Query Engine
// Copyright (C) 2026 Lodestone Contributors (https://github.com/lodestone-db)

//! # Query Condition Pipeline
//!
//! A query reduces its ordered conditions against a running
//! `matching_entities` set. The first constraining condition computes
//! from the column universes directly; later ones intersect or erase.
//! Statistics fold the current set into a scalar and terminate the query;
//! distance conditions hand off to the k-NN engine and replace the
//! matching set with their results.
//!
//! Budgets are checked before each condition and inside each candidate
//! resolution loop. Running out does not error: the pipeline stops,
//! returns what it has, and flags the outcome as exhausted.

use std::sync::Arc;

use lodestone_core::code::CodeStore;
use lodestone_core::error::{QueryBudget, QueryError};
use lodestone_core::intset::IndexSet;
use lodestone_core::random::RandomStream;
use lodestone_core::strings::{StringId, StringPool};
use lodestone_core::value::ValueKind;

use lodestone_store::entity::Entity;
use lodestone_store::knn::{DistanceResult, SearchScratch};
use lodestone_store::matrix::BoxFilterStore;

use crate::cache::QueryCache;
use crate::condition::{Condition, DistanceQuery, DistanceQueryKind};
use crate::conviction::{ConvictionProcessor, KnnCache};
use crate::sampling;
use crate::statistics::{self, DistanceTransform};

/// What a query evaluates to.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// The matching entity set.
    Entities(IndexSet),
    /// `(value, entity)` pairs from a distance-family condition.
    Distances(Vec<DistanceResult>),
    /// A numeric statistic.
    Scalar(f64),
    /// A string statistic (mode over a string column).
    StringScalar(Option<StringId>),
    /// Numeric value → total weight histogram.
    NumberMasses(Vec<(f64, f64)>),
    /// String value → total weight histogram.
    StringMasses(Vec<(StringId, f64)>),
}

/// A query's result plus whether the budget ran out along the way.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub result: QueryResult,
    pub exhausted: bool,
}

/// Per-worker scratch for the pipeline: search buffers, temp sets, and
/// the nearest-neighbor cache. Owned by the caller, passed in explicitly.
pub struct QueryScratch {
    search: SearchScratch,
    temp: IndexSet,
    results: Vec<DistanceResult>,
    entity_buffer: Vec<usize>,
    value_buffer: Vec<f64>,
    knn_cache: KnnCache,
}

impl QueryScratch {
    pub fn new() -> Self {
        Self {
            search: SearchScratch::new(),
            temp: IndexSet::new(),
            results: Vec::new(),
            entity_buffer: Vec::new(),
            value_buffer: Vec::new(),
            knn_cache: KnnCache::new(),
        }
    }
}

impl Default for QueryScratch {
    fn default() -> Self {
        Self::new()
    }
}

enum Step {
    Continue,
    Return(QueryResult),
    Distances(Vec<DistanceResult>),
}

/// The query engine: a [`QueryCache`] plus the reduction loop.
pub struct QueryEngine {
    cache: QueryCache,
}

impl QueryEngine {
    pub fn new(strings: Arc<StringPool>) -> Self {
        Self { cache: QueryCache::new(strings) }
    }

    pub fn with_code_store(strings: Arc<StringPool>, code: Arc<dyn CodeStore>) -> Self {
        Self { cache: QueryCache::with_code_store(strings, code) }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Run `conditions` in order. `stream` seeds unseeded sampling
    /// conditions; everything else derives determinism from per-condition
    /// seeds.
    pub fn run_query(
        &self,
        entities: &[Entity],
        conditions: &[Condition],
        stream: &mut RandomStream,
        budget: &mut QueryBudget,
        scratch: &mut QueryScratch,
    ) -> Result<QueryOutcome, QueryError> {
        self.cache.ensure_labels_cached(conditions, entities);
        let store = self.cache.read();
        let n = store.num_entities();

        let mut matching = IndexSet::new();
        let mut is_first = true;
        let mut exhausted = false;
        let mut distances: Option<Vec<DistanceResult>> = None;

        for condition in conditions {
            if budget.charge_steps(1).is_err() {
                exhausted = true;
                break;
            }
            match self.apply_condition(
                &store,
                condition,
                &mut matching,
                is_first,
                stream,
                budget,
                &mut exhausted,
                scratch,
            )? {
                Step::Continue => {
                    distances = None;
                    is_first = false;
                }
                Step::Distances(d) => {
                    distances = Some(d);
                    is_first = false;
                }
                Step::Return(result) => {
                    return Ok(QueryOutcome { result, exhausted });
                }
            }
            if exhausted {
                break;
            }
        }

        if is_first {
            matching.set_all(n);
        }
        let result = match distances {
            Some(d) => QueryResult::Distances(d),
            None => QueryResult::Entities(matching),
        };
        Ok(QueryOutcome { result, exhausted })
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_condition(
        &self,
        store: &BoxFilterStore,
        condition: &Condition,
        matching: &mut IndexSet,
        is_first: bool,
        stream: &mut RandomStream,
        budget: &mut QueryBudget,
        exhausted: &mut bool,
        scratch: &mut QueryScratch,
    ) -> Result<Step, QueryError> {
        let n = store.num_entities();
        match condition {
            Condition::Null => {
                matching.clear();
                Ok(Step::Continue)
            }

            Condition::Exists { labels } => {
                let mut first = is_first;
                for &label in labels {
                    if first {
                        store.find_all_with_feature(label, matching);
                        first = false;
                    } else {
                        store.intersect_with_feature(label, matching);
                    }
                }
                Ok(Step::Continue)
            }

            Condition::NotExists { labels } => {
                let mut first = is_first;
                for &label in labels {
                    if first {
                        store.find_all_without_feature(label, matching);
                        first = false;
                    } else {
                        store.intersect_without_feature(label, matching);
                    }
                }
                Ok(Step::Continue)
            }

            Condition::Equals { pairs } => {
                let mut first = is_first;
                for &(label, value) in pairs {
                    if first {
                        matching.clear();
                        store.union_all_with_value(label, value, matching);
                        first = false;
                    } else {
                        scratch.temp.clear();
                        store.union_all_with_value(label, value, &mut scratch.temp);
                        scratch.temp.intersect_into(matching);
                    }
                }
                Ok(Step::Continue)
            }

            Condition::NotEquals { pairs } => {
                let mut first = is_first;
                for &(label, value) in pairs {
                    if first {
                        store.find_all_with_feature(label, matching);
                        first = false;
                    }
                    scratch.temp.clear();
                    store.union_all_with_value(label, value, &mut scratch.temp);
                    scratch.temp.erase_into(matching);
                }
                Ok(Step::Continue)
            }

            Condition::Between { ranges, negate } => {
                let mut first = is_first;
                for &(label, low, high) in ranges {
                    if first {
                        store.find_all_within_range(label, low, high, !negate, matching);
                        first = false;
                    } else {
                        store.find_all_within_range(label, low, high, !negate, &mut scratch.temp);
                        scratch.temp.intersect_into(matching);
                    }
                }
                Ok(Step::Continue)
            }

            Condition::Among { label, values } => {
                if is_first {
                    matching.clear();
                    for &value in values {
                        store.union_all_with_value(*label, value, matching);
                    }
                } else {
                    scratch.temp.clear();
                    for &value in values {
                        store.union_all_with_value(*label, value, &mut scratch.temp);
                    }
                    scratch.temp.intersect_into(matching);
                }
                Ok(Step::Continue)
            }

            Condition::NotAmong { label, values } => {
                if is_first {
                    store.find_all_with_feature(*label, matching);
                } else {
                    store.intersect_with_feature(*label, matching);
                }
                scratch.temp.clear();
                for &value in values {
                    store.union_all_with_value(*label, value, &mut scratch.temp);
                }
                scratch.temp.erase_into(matching);
                Ok(Step::Continue)
            }

            Condition::Min { label, kind, count } | Condition::Max { label, kind, count } => {
                let is_max = matches!(condition, Condition::Max { .. });
                if is_first {
                    matching.clear();
                    store.find_min_max(*label, *kind, *count, is_max, None, matching);
                } else {
                    matching.copy_into(&mut scratch.temp);
                    matching.clear();
                    store.find_min_max(*label, *kind, *count, is_max, Some(&scratch.temp), matching);
                }
                Ok(Step::Continue)
            }

            Condition::InEntityList { entities } => {
                if is_first {
                    matching.clear();
                    for &e in entities {
                        if e < n {
                            matching.insert(e);
                        }
                    }
                } else {
                    scratch.temp.clear();
                    for &e in entities {
                        if e < n {
                            scratch.temp.insert(e);
                        }
                    }
                    scratch.temp.intersect_into(matching);
                }
                Ok(Step::Continue)
            }

            Condition::NotInEntityList { entities } => {
                if is_first {
                    matching.set_all(n);
                }
                for &e in entities {
                    matching.remove(e);
                }
                Ok(Step::Continue)
            }

            Condition::Sum { label, weight_label } => {
                let Some(col) = store.column_index(*label) else {
                    return Ok(Step::Return(QueryResult::Scalar(f64::NAN)));
                };
                let weight_col = weight_label.and_then(|l| store.column_index(l));
                let get_value = |e: usize| store.number_value(e, col);
                let get_weight = weight_col.map(|wc| move |e: usize| store.number_value(e, wc));
                let value = if is_first {
                    statistics::sum(
                        store.column(col).number_indices().iter(),
                        get_value,
                        get_weight.as_ref(),
                    )
                } else {
                    statistics::sum(matching.iter(), get_value, get_weight.as_ref())
                };
                Ok(Step::Return(QueryResult::Scalar(value)))
            }

            Condition::Mode { label, kind, weight_label } => {
                let weight_col = weight_label.and_then(|l| store.column_index(l));
                match kind {
                    ValueKind::StringId => {
                        let Some(col) = store.column_index(*label) else {
                            return Ok(Step::Return(QueryResult::StringScalar(None)));
                        };
                        let get_value = |e: usize| store.string_value(e, col);
                        let get_weight =
                            weight_col.map(|wc| move |e: usize| store.number_value(e, wc));
                        let mode = if is_first {
                            statistics::mode_string(
                                store.column(col).string_indices().iter(),
                                get_value,
                                get_weight.as_ref(),
                            )
                        } else {
                            statistics::mode_string(matching.iter(), get_value, get_weight.as_ref())
                        };
                        Ok(Step::Return(QueryResult::StringScalar(mode)))
                    }
                    _ => {
                        let Some(col) = store.column_index(*label) else {
                            return Ok(Step::Return(QueryResult::Scalar(f64::NAN)));
                        };
                        let get_value = |e: usize| store.number_value(e, col);
                        let get_weight =
                            weight_col.map(|wc| move |e: usize| store.number_value(e, wc));
                        let mode = if is_first {
                            statistics::mode_number(
                                store.column(col).number_indices().iter(),
                                get_value,
                                get_weight.as_ref(),
                            )
                        } else {
                            statistics::mode_number(matching.iter(), get_value, get_weight.as_ref())
                        };
                        Ok(Step::Return(QueryResult::Scalar(mode.unwrap_or(f64::NAN))))
                    }
                }
            }

            Condition::Quantile { label, q, weight_label } => {
                let Some(col) = store.column_index(*label) else {
                    return Ok(Step::Return(QueryResult::Scalar(f64::NAN)));
                };
                let weight_col = weight_label.and_then(|l| store.column_index(l));
                let get_value = |e: usize| store.number_value(e, col);
                let get_weight = weight_col.map(|wc| move |e: usize| store.number_value(e, wc));
                let value = if is_first {
                    statistics::quantile(
                        store.column(col).number_indices().iter(),
                        get_value,
                        get_weight.as_ref(),
                        *q,
                    )
                } else {
                    statistics::quantile(matching.iter(), get_value, get_weight.as_ref(), *q)
                };
                Ok(Step::Return(QueryResult::Scalar(value)))
            }

            Condition::GeneralizedMean { label, p, weight_label, center, calculate_moment, absolute_value } => {
                let Some(col) = store.column_index(*label) else {
                    return Ok(Step::Return(QueryResult::Scalar(f64::NAN)));
                };
                let weight_col = weight_label.and_then(|l| store.column_index(l));
                let get_value = |e: usize| store.number_value(e, col);
                let get_weight = weight_col.map(|wc| move |e: usize| store.number_value(e, wc));
                let value = if is_first {
                    statistics::generalized_mean(
                        store.column(col).number_indices().iter(),
                        get_value,
                        get_weight.as_ref(),
                        *p,
                        *center,
                        *calculate_moment,
                        *absolute_value,
                    )
                } else {
                    statistics::generalized_mean(
                        matching.iter(),
                        get_value,
                        get_weight.as_ref(),
                        *p,
                        *center,
                        *calculate_moment,
                        *absolute_value,
                    )
                };
                Ok(Step::Return(QueryResult::Scalar(value)))
            }

            Condition::MinDifference { label, cyclic_range, include_zero } => {
                let Some(col) = store.column_index(*label) else {
                    return Ok(Step::Return(QueryResult::Scalar(f64::NAN)));
                };
                let get_value = |e: usize| store.number_value(e, col);
                let value = if is_first {
                    statistics::extreme_difference(
                        store.column(col).number_indices().iter(),
                        get_value,
                        true,
                        *cyclic_range,
                        *include_zero,
                    )
                } else {
                    statistics::extreme_difference(
                        matching.iter(),
                        get_value,
                        true,
                        *cyclic_range,
                        *include_zero,
                    )
                };
                Ok(Step::Return(QueryResult::Scalar(value)))
            }

            Condition::MaxDifference { label, cyclic_range } => {
                let Some(col) = store.column_index(*label) else {
                    return Ok(Step::Return(QueryResult::Scalar(f64::NAN)));
                };
                let get_value = |e: usize| store.number_value(e, col);
                let value = if is_first {
                    statistics::extreme_difference(
                        store.column(col).number_indices().iter(),
                        get_value,
                        false,
                        *cyclic_range,
                        true,
                    )
                } else {
                    statistics::extreme_difference(
                        matching.iter(),
                        get_value,
                        false,
                        *cyclic_range,
                        true,
                    )
                };
                Ok(Step::Return(QueryResult::Scalar(value)))
            }

            Condition::ValueMasses { label, kind, weight_label } => {
                let Some(col) = store.column_index(*label) else {
                    return Ok(Step::Return(match kind {
                        ValueKind::StringId => QueryResult::StringMasses(Vec::new()),
                        _ => QueryResult::NumberMasses(Vec::new()),
                    }));
                };
                let weight_col = weight_label.and_then(|l| store.column_index(l));
                match kind {
                    ValueKind::StringId => {
                        let get_value = |e: usize| store.string_value(e, col);
                        let get_weight =
                            weight_col.map(|wc| move |e: usize| store.number_value(e, wc));
                        let masses = if is_first {
                            statistics::value_masses_string(
                                store.column(col).string_indices().iter(),
                                get_value,
                                get_weight.as_ref(),
                            )
                        } else {
                            statistics::value_masses_string(
                                matching.iter(),
                                get_value,
                                get_weight.as_ref(),
                            )
                        };
                        Ok(Step::Return(QueryResult::StringMasses(masses)))
                    }
                    _ => {
                        let get_value = |e: usize| store.number_value(e, col);
                        let get_weight =
                            weight_col.map(|wc| move |e: usize| store.number_value(e, wc));
                        let masses = if is_first {
                            statistics::value_masses_number(
                                store.column(col).number_indices().iter(),
                                get_value,
                                get_weight.as_ref(),
                            )
                        } else {
                            statistics::value_masses_number(
                                matching.iter(),
                                get_value,
                                get_weight.as_ref(),
                            )
                        };
                        Ok(Step::Return(QueryResult::NumberMasses(masses)))
                    }
                }
            }

            Condition::Select { count, offset, seed } => {
                if is_first {
                    matching.set_all(n);
                }
                match seed {
                    Some(s) => {
                        let mut seeded = RandomStream::from_seed_str(s);
                        sampling::select(matching, *count, *offset, Some(&mut seeded), &mut scratch.entity_buffer);
                    }
                    None => {
                        sampling::select(matching, *count, *offset, None, &mut scratch.entity_buffer);
                    }
                }
                matching.clear();
                for &e in &scratch.entity_buffer {
                    matching.insert(e);
                }
                Ok(Step::Continue)
            }

            Condition::Sample { count, seed } => {
                if is_first {
                    matching.set_all(n);
                }
                let mut seeded = match seed {
                    Some(s) => RandomStream::from_seed_str(s),
                    None => stream.fork(),
                };
                sampling::sample_without_replacement(
                    matching,
                    *count,
                    &mut seeded,
                    &mut scratch.entity_buffer,
                );
                matching.clear();
                for &e in &scratch.entity_buffer {
                    matching.insert(e);
                }
                Ok(Step::Continue)
            }

            Condition::WeightedSample { weight_label, count, seed } => {
                if is_first {
                    store.find_all_with_valid_numbers(
                        *weight_label,
                        matching,
                        &mut scratch.entity_buffer,
                        &mut scratch.value_buffer,
                    );
                } else {
                    store.intersect_with_valid_numbers(
                        *weight_label,
                        matching,
                        &mut scratch.entity_buffer,
                        &mut scratch.value_buffer,
                    );
                }
                if matching.is_empty() {
                    return Ok(Step::Continue);
                }
                let mut seeded = match seed {
                    Some(s) => RandomStream::from_seed_str(s),
                    None => stream.fork(),
                };
                let mut sampled = Vec::new();
                sampling::weighted_sample(
                    &scratch.entity_buffer,
                    &scratch.value_buffer,
                    *count,
                    &mut seeded,
                    &mut sampled,
                );
                matching.clear();
                for e in sampled {
                    matching.insert(e);
                }
                Ok(Step::Continue)
            }

            Condition::Distance(query) => self.apply_distance_condition(
                store, query, matching, is_first, budget, exhausted, scratch,
            ),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_distance_condition(
        &self,
        store: &BoxFilterStore,
        query: &DistanceQuery,
        matching: &mut IndexSet,
        is_first: bool,
        budget: &mut QueryBudget,
        exhausted: &mut bool,
        scratch: &mut QueryScratch,
    ) -> Result<Step, QueryError> {
        // the sorted-vector acceleration cannot run a p of zero
        if query.params.p_value == 0.0 {
            return Err(QueryError::UnsupportedCondition {
                reason: "p_value of 0 is not accelerated".to_string(),
            });
        }

        let n = store.num_entities();
        if is_first {
            matching.set_all(n);
        }

        match query.kind {
            DistanceQueryKind::Nearest | DistanceQueryKind::Within => {
                if query.position_labels.is_empty() {
                    // every feature was zero-weighted: distance is zero for
                    // everyone, sample top_k from the query's stream
                    let mut base = RandomStream::from_seed_str(&query.seed);
                    let mut fork = base.fork();
                    let count = query.top_k.min(matching.len());
                    sampling::sample_without_replacement(
                        matching,
                        count,
                        &mut fork,
                        &mut scratch.entity_buffer,
                    );
                    matching.clear();
                    let results: Vec<DistanceResult> = scratch
                        .entity_buffer
                        .iter()
                        .map(|&entity| DistanceResult { distance: 0.0, entity })
                        .collect();
                    for r in &results {
                        matching.insert(r.entity);
                    }
                    return Ok(Step::Distances(results));
                }

                let mut base = RandomStream::from_seed_str(&query.seed);
                let mut fork = base.fork();
                let search = match query.kind {
                    DistanceQueryKind::Nearest => store.find_nearest_entities(
                        &query.params,
                        &query.position_labels,
                        &query.position_values,
                        query.top_k,
                        query.exclusion_entity,
                        matching,
                        &mut fork,
                        budget,
                        &mut scratch.search,
                        &mut scratch.results,
                    ),
                    _ => store.find_entities_within_distance(
                        &query.params,
                        &query.position_labels,
                        &query.position_values,
                        query.max_distance,
                        matching,
                        budget,
                        &mut scratch.search,
                        &mut scratch.results,
                    ),
                };
                match search {
                    Ok(()) => {}
                    Err(QueryError::ResourcesExhausted) => *exhausted = true,
                    Err(e) => return Err(e),
                }

                let weight_col = query.weight_label.and_then(|l| store.column_index(l));
                let get_weight = weight_col.map(|wc| move |e: usize| store.number_value(e, wc));
                let transform = DistanceTransform::new(
                    query.surprisal_to_prob,
                    query.distance_weight_exponent,
                    get_weight,
                );
                transform.transform_results(&mut scratch.results, query.return_sorted);

                matching.clear();
                for r in &scratch.results {
                    matching.insert(r.entity);
                }
                Ok(Step::Distances(scratch.results.clone()))
            }

            DistanceQueryKind::Convictions
            | DistanceQueryKind::KlDivergences
            | DistanceQueryKind::GroupKlDivergence
            | DistanceQueryKind::DistanceContributions => {
                if n == 0 {
                    return Ok(Step::Distances(Vec::new()));
                }

                let top_k = query.top_k.max(1).min(n);
                let compute_on_subset =
                    !query.entities.is_empty() && query.entities.len() < n;

                // population must carry every queried feature
                for &label in &query.position_labels {
                    store.intersect_with_feature(label, matching);
                }

                let mut targets = IndexSet::new();
                if query.kind == DistanceQueryKind::GroupKlDivergence {
                    // targets here are the base left after removing the group
                    matching.copy_into(&mut targets);
                    for &e in &query.entities {
                        targets.remove(e);
                    }
                } else if compute_on_subset {
                    for &e in &query.entities {
                        if matching.contains(e) {
                            targets.insert(e);
                        }
                    }
                } else {
                    matching.copy_into(&mut targets);
                }

                let mut base = RandomStream::from_seed_str(&query.seed);
                let mut fork = base.fork();
                match scratch.knn_cache.reset(
                    store,
                    matching,
                    &query.params,
                    &query.position_labels,
                    top_k,
                    &mut fork,
                    budget,
                    &mut scratch.search,
                ) {
                    Ok(()) => {}
                    Err(QueryError::ResourcesExhausted) => {
                        *exhausted = true;
                        return Ok(Step::Distances(Vec::new()));
                    }
                    Err(e) => return Err(e),
                }

                let weight_col = query.weight_label.and_then(|l| store.column_index(l));
                let get_weight = weight_col.map(|wc| move |e: usize| store.number_value(e, wc));
                let transform = DistanceTransform::new(
                    query.surprisal_to_prob,
                    query.distance_weight_exponent,
                    get_weight,
                );
                let processor = ConvictionProcessor::new(&scratch.knn_cache, &transform);

                if query.kind == DistanceQueryKind::GroupKlDivergence {
                    let mut group = IndexSet::new();
                    for &e in &query.entities {
                        if matching.contains(e) {
                            group.insert(e);
                        }
                    }
                    if !compute_on_subset {
                        // the group is the entire matching set; the result
                        // pairs with the sentinel index 0
                        matching.copy_into(&mut group);
                    }
                    let divergence = match processor.case_group_kl_divergence(
                        store,
                        &query.params,
                        &query.position_labels,
                        &group,
                        query.conviction_of_removal,
                        &mut fork,
                        budget,
                        &mut scratch.search,
                    ) {
                        Ok(d) => d,
                        Err(QueryError::ResourcesExhausted) => {
                            *exhausted = true;
                            0.0
                        }
                        Err(e) => return Err(e),
                    };
                    return Ok(Step::Distances(vec![DistanceResult {
                        distance: divergence,
                        entity: 0,
                    }]));
                }

                let mut values = Vec::new();
                match query.kind {
                    DistanceQueryKind::Convictions => processor.case_convictions(
                        targets.iter(),
                        &mut values,
                        query.conviction_of_removal,
                    ),
                    DistanceQueryKind::KlDivergences => processor.case_kl_divergences(
                        targets.iter(),
                        &mut values,
                        false,
                        query.conviction_of_removal,
                    ),
                    _ => processor.distance_contributions(targets.iter(), &mut values),
                }

                let mut results: Vec<DistanceResult> = targets
                    .iter()
                    .zip(values)
                    .map(|(entity, distance)| DistanceResult { distance, entity })
                    .collect();
                if query.return_sorted {
                    results.sort_by(|a, b| {
                        a.distance.total_cmp(&b.distance).then(a.entity.cmp(&b.entity))
                    });
                }
                Ok(Step::Distances(results))
            }
        }
    }
}

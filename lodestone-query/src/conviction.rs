// SPDX-License-Identifier: AGPL-3.0-or-later
// Lodestone - Entity Query Engine
// Copyright (C) 2026 Lodestone Contributors (https://github.com/lodestone-db)

//! # Conviction and Divergence
//!
//! Conviction asks "how much does the model miss this entity when it is
//! gone?". The machinery is a [`KnnCache`]: for every entity of a fixed
//! population, its `k+1` nearest neighbors at strictly positive distance
//! (one spare so a single removal never exhausts the list). From the
//! cache:
//!
//! - the **removal divergence** of a target is the log ratio of the
//!   population's average k-NN distance without the target vs. with it —
//!   only entities holding the target as a neighbor shift, and their
//!   replacement neighbor is the cached spare;
//! - the **conviction** of a target is the population's mean divergence
//!   over the target's own, so entities whose absence barely perturbs the
//!   model (well-supported ones) score high;
//! - a **distance contribution** is the average (transformed) distance to
//!   an entity's own nearest neighbors;
//! - a **group divergence** removes a whole subset at once, which
//!   invalidates the cached spares, so the without-group averages are
//!   recomputed with a search over the reduced population.

use lodestone_core::error::{QueryBudget, QueryError};
use lodestone_core::intset::IndexSet;
use lodestone_core::random::RandomStream;
use lodestone_core::strings::StringId;

use lodestone_store::distance::DistanceParams;
use lodestone_store::knn::{DistanceResult, SearchScratch};
use lodestone_store::matrix::BoxFilterStore;

use crate::statistics::DistanceTransform;

/// Cached nearest neighbors (positive distance, one spare) for every
/// entity of a fixed population.
pub struct KnnCache {
    /// Indexed by entity; empty for entities outside the population.
    neighbors: Vec<Vec<DistanceResult>>,
    population: IndexSet,
    top_k: usize,
}

impl KnnCache {
    pub fn new() -> Self {
        Self { neighbors: Vec::new(), population: IndexSet::new(), top_k: 0 }
    }

    /// Rebuild the cache for `population`, keeping `top_k + 1` neighbors
    /// per entity.
    #[allow(clippy::too_many_arguments)]
    pub fn reset(
        &mut self,
        store: &BoxFilterStore,
        population: &IndexSet,
        params: &DistanceParams,
        position_labels: &[StringId],
        top_k: usize,
        stream: &mut RandomStream,
        budget: &mut QueryBudget,
        scratch: &mut SearchScratch,
    ) -> Result<(), QueryError> {
        self.top_k = top_k;
        population.copy_into(&mut self.population);
        self.neighbors.clear();
        self.neighbors.resize(store.num_entities(), Vec::new());

        let mut buffer = Vec::new();
        for entity in population.iter() {
            store.find_nearest_to_entity(
                params,
                position_labels,
                entity,
                top_k + 1,
                true,
                population,
                stream,
                budget,
                scratch,
                &mut buffer,
            )?;
            self.neighbors[entity] = buffer.clone();
        }
        Ok(())
    }

    #[inline]
    pub fn population(&self) -> &IndexSet {
        &self.population
    }

    #[inline]
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn neighbors_of(&self, entity: usize) -> &[DistanceResult] {
        &self.neighbors[entity]
    }
}

impl Default for KnnCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Conviction computations over a [`KnnCache`].
pub struct ConvictionProcessor<'a, W> {
    cache: &'a KnnCache,
    transform: &'a DistanceTransform<W>,
}

impl<'a, W> ConvictionProcessor<'a, W>
where
    W: Fn(usize) -> Option<f64>,
{
    pub fn new(cache: &'a KnnCache, transform: &'a DistanceTransform<W>) -> Self {
        Self { cache, transform }
    }

    /// Average transformed distance to `entity`'s k nearest neighbors,
    /// optionally pretending `excluded` has been removed (the cached
    /// spare takes its place).
    fn knn_average(&self, entity: usize, excluded: Option<usize>) -> f64 {
        let mut total = 0.0;
        let mut count = 0usize;
        for r in self.cache.neighbors_of(entity) {
            if Some(r.entity) == excluded {
                continue;
            }
            total += self.transform.transform_distance(r.distance);
            count += 1;
            if count == self.cache.top_k() {
                break;
            }
        }
        if count == 0 {
            0.0
        } else {
            total / count as f64
        }
    }

    fn entity_weight(&self, entity: usize) -> f64 {
        self.transform
            .get_weight
            .as_ref()
            .and_then(|w| w(entity))
            .unwrap_or(1.0)
    }

    /// Ratio of the population's average k-NN distance without `target`
    /// to the average with it (≥ 1 when removal spreads the model out).
    /// `conviction_of_removal` inverts the orientation.
    fn removal_ratio(&self, target: usize, conviction_of_removal: bool) -> f64 {
        let mut with_sum = 0.0;
        let mut without_sum = 0.0;
        let mut count = 0usize;
        for entity in self.cache.population().iter() {
            if entity == target {
                continue;
            }
            with_sum += self.knn_average(entity, None);
            without_sum += self.knn_average(entity, Some(target));
            count += 1;
        }
        if count == 0 || with_sum == 0.0 || without_sum == 0.0 {
            return 1.0;
        }
        if conviction_of_removal {
            with_sum / without_sum
        } else {
            without_sum / with_sum
        }
    }

    /// Per-target removal divergence: the (log) ratio, scaled by the
    /// target's weight.
    pub fn case_kl_divergences(
        &self,
        targets: impl Iterator<Item = usize>,
        out: &mut Vec<f64>,
        use_log: bool,
        conviction_of_removal: bool,
    ) {
        out.clear();
        for target in targets {
            let ratio = self.removal_ratio(target, conviction_of_removal);
            let divergence = if use_log { ratio.ln().max(0.0) } else { ratio };
            out.push(divergence * self.entity_weight(target));
        }
    }

    /// Per-target conviction: the population's mean removal divergence
    /// over the target's own. Entities whose absence barely changes the
    /// model score above 1.
    pub fn case_convictions(
        &self,
        targets: impl Iterator<Item = usize>,
        out: &mut Vec<f64>,
        conviction_of_removal: bool,
    ) {
        let mut population_divergences = Vec::new();
        self.case_kl_divergences(
            self.cache.population().iter(),
            &mut population_divergences,
            true,
            conviction_of_removal,
        );
        let mean = if population_divergences.is_empty() {
            0.0
        } else {
            population_divergences.iter().sum::<f64>() / population_divergences.len() as f64
        };

        let by_entity: std::collections::HashMap<usize, f64> = self
            .cache
            .population()
            .iter()
            .zip(population_divergences.iter().copied())
            .collect();

        out.clear();
        for target in targets {
            let own = by_entity.get(&target).copied().unwrap_or(0.0);
            out.push(if own == 0.0 {
                if mean == 0.0 {
                    1.0
                } else {
                    f64::INFINITY
                }
            } else {
                mean / own
            });
        }
    }

    /// One divergence for removing `group` wholesale. The cached spares
    /// cannot stand in for several removals at once, so the without-group
    /// side re-searches over the reduced population.
    #[allow(clippy::too_many_arguments)]
    pub fn case_group_kl_divergence(
        &self,
        store: &BoxFilterStore,
        params: &DistanceParams,
        position_labels: &[StringId],
        group: &IndexSet,
        conviction_of_removal: bool,
        stream: &mut RandomStream,
        budget: &mut QueryBudget,
        scratch: &mut SearchScratch,
    ) -> Result<f64, QueryError> {
        let mut reduced = IndexSet::new();
        self.cache.population().copy_into(&mut reduced);
        group.erase_into(&mut reduced);
        if reduced.is_empty() {
            return Ok(0.0);
        }

        let mut with_sum = 0.0;
        let mut without_sum = 0.0;
        let mut count = 0usize;
        let mut buffer = Vec::new();
        for entity in reduced.iter() {
            with_sum += self.knn_average(entity, None);

            store.find_nearest_to_entity(
                params,
                position_labels,
                entity,
                self.cache.top_k(),
                true,
                &reduced,
                stream,
                budget,
                scratch,
                &mut buffer,
            )?;
            let transformed: f64 = buffer
                .iter()
                .map(|r| self.transform.transform_distance(r.distance))
                .sum();
            if !buffer.is_empty() {
                without_sum += transformed / buffer.len() as f64;
            }
            count += 1;
        }

        if count == 0 || with_sum == 0.0 || without_sum == 0.0 {
            return Ok(0.0);
        }
        let ratio = if conviction_of_removal {
            with_sum / without_sum
        } else {
            without_sum / with_sum
        };
        Ok(ratio.ln().max(0.0))
    }

    /// Per-target expected distance contribution: the average transformed
    /// distance to its own nearest neighbors, scaled by its weight.
    pub fn distance_contributions(
        &self,
        targets: impl Iterator<Item = usize>,
        out: &mut Vec<f64>,
    ) {
        out.clear();
        for target in targets {
            out.push(self.knn_average(target, None) * self.entity_weight(target));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone_core::strings::StringPool;
    use lodestone_core::value::Value;
    use lodestone_store::distance::FeatureParams;
    use lodestone_store::entity::Entity;
    use std::sync::Arc;

    type NoWeight = fn(usize) -> Option<f64>;

    fn line_store(xs: &[f64]) -> (BoxFilterStore, StringId) {
        let pool = Arc::new(StringPool::new());
        let x = pool.intern("x");
        let entities: Vec<Entity> =
            xs.iter().map(|&v| Entity::new().label(x, Value::Number(v))).collect();
        let mut store = BoxFilterStore::new(pool);
        store.add_labels(&[x], &entities);
        (store, x)
    }

    fn build_cache(store: &BoxFilterStore, x: StringId, k: usize) -> KnnCache {
        let mut params = DistanceParams::new(vec![FeatureParams::default()], 1.0);
        params.high_accuracy = true;
        params.recompute_accurate_distances = false;
        params.set_and_constrain_params();

        let population = IndexSet::all(store.num_entities());
        let mut cache = KnnCache::new();
        cache
            .reset(
                store,
                &population,
                &params,
                &[x],
                k,
                &mut RandomStream::from_seed_str("cache"),
                &mut QueryBudget::unlimited(),
                &mut SearchScratch::new(),
            )
            .unwrap();
        cache
    }

    #[test]
    fn test_cache_holds_spare_neighbor() {
        let (store, x) = line_store(&[0.0, 1.0, 2.0, 3.0, 4.0]);
        let cache = build_cache(&store, x, 2);
        for entity in 0..5 {
            let neighbors = cache.neighbors_of(entity);
            assert_eq!(neighbors.len(), 3, "entity {} kept k+1 neighbors", entity);
            assert!(neighbors.iter().all(|r| r.entity != entity));
            assert!(neighbors.iter().all(|r| r.distance > 0.0));
        }
    }

    #[test]
    fn test_end_entities_have_higher_conviction() {
        let (store, x) = line_store(&[0.0, 1.0, 2.0, 3.0, 4.0]);
        let cache = build_cache(&store, x, 2);
        let transform: DistanceTransform<NoWeight> = DistanceTransform::new(false, 1.0, None);
        let processor = ConvictionProcessor::new(&cache, &transform);

        let mut convictions = Vec::new();
        processor.case_convictions(0..5, &mut convictions, false);

        // interior entities perturb the model more when removed
        assert!(convictions[0] > convictions[2]);
        assert!(convictions[4] > convictions[2]);

        // deterministic across reruns with the same seed
        let cache2 = build_cache(&store, x, 2);
        let processor2 = ConvictionProcessor::new(&cache2, &transform);
        let mut again = Vec::new();
        processor2.case_convictions(0..5, &mut again, false);
        assert_eq!(convictions, again);
    }

    #[test]
    fn test_kl_divergences_nonnegative() {
        let (store, x) = line_store(&[0.0, 1.0, 2.0, 5.0]);
        let cache = build_cache(&store, x, 2);
        let transform: DistanceTransform<NoWeight> = DistanceTransform::new(false, 1.0, None);
        let processor = ConvictionProcessor::new(&cache, &transform);

        let mut divergences = Vec::new();
        processor.case_kl_divergences(0..4, &mut divergences, true, false);
        assert_eq!(divergences.len(), 4);
        assert!(divergences.iter().all(|&d| d >= 0.0));
        assert!(divergences.iter().any(|&d| d > 0.0));
    }

    #[test]
    fn test_distance_contributions_track_isolation() {
        let (store, x) = line_store(&[0.0, 1.0, 2.0, 50.0]);
        let cache = build_cache(&store, x, 2);
        let transform: DistanceTransform<NoWeight> = DistanceTransform::new(false, 1.0, None);
        let processor = ConvictionProcessor::new(&cache, &transform);

        let mut contributions = Vec::new();
        processor.distance_contributions(0..4, &mut contributions);
        // the far-away entity contributes much more distance than the rest
        assert!(contributions[3] > contributions[1] * 5.0);
    }

    #[test]
    fn test_group_divergence() {
        let (store, x) = line_store(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let cache = build_cache(&store, x, 2);
        let transform: DistanceTransform<NoWeight> = DistanceTransform::new(false, 1.0, None);
        let processor = ConvictionProcessor::new(&cache, &transform);

        let mut params = DistanceParams::new(vec![FeatureParams::default()], 1.0);
        params.high_accuracy = true;
        params.recompute_accurate_distances = false;
        params.set_and_constrain_params();

        let group = IndexSet::from_indices([2, 3]);
        let divergence = processor
            .case_group_kl_divergence(
                &store,
                &params,
                &[x],
                &group,
                false,
                &mut RandomStream::from_seed_str("group"),
                &mut QueryBudget::unlimited(),
                &mut SearchScratch::new(),
            )
            .unwrap();
        // carving the middle out of the line spreads neighborhoods apart
        assert!(divergence > 0.0);
    }

    #[test]
    fn test_entity_weight_scales_divergence() {
        let (store, x) = line_store(&[0.0, 1.0, 2.0, 3.0]);
        let cache = build_cache(&store, x, 2);

        let unweighted: DistanceTransform<NoWeight> = DistanceTransform::new(false, 1.0, None);
        let doubled = DistanceTransform::new(false, 1.0, Some(|_e: usize| Some(2.0)));

        let p1 = ConvictionProcessor::new(&cache, &unweighted);
        let p2 = ConvictionProcessor::new(&cache, &doubled);
        let mut base = Vec::new();
        let mut scaled = Vec::new();
        p1.case_kl_divergences(0..4, &mut base, true, false);
        p2.case_kl_divergences(0..4, &mut scaled, true, false);
        for (b, s) in base.iter().zip(scaled.iter()) {
            assert!((s - 2.0 * b).abs() < 1e-12);
        }
    }
}

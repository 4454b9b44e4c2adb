// SPDX-License-Identifier: AGPL-3.0-or-later
// Lodestone - Entity Query Engine
// Copyright (C) 2026 Lodestone Contributors (https://github.com/lodestone-db)

//! # Entity Statistics
//!
//! Streaming computations over an entity iterator plus value/weight
//! closures, so the same code serves "first condition over the column's
//! valid set" and "later condition over the matching set". Entities whose
//! value closure returns `None` are skipped; a missing weight counts as 1.

use std::collections::HashMap;

use lodestone_core::strings::StringId;

use lodestone_store::knn::DistanceResult;

/// Weighted sum. NaN-free by construction: the getters only yield usable
/// numbers.
pub fn sum<I, V, W>(entities: I, get_value: V, get_weight: Option<W>) -> f64
where
    I: Iterator<Item = usize>,
    V: Fn(usize) -> Option<f64>,
    W: Fn(usize) -> Option<f64>,
{
    let mut total = 0.0;
    for entity in entities {
        let Some(value) = get_value(entity) else { continue };
        let weight = get_weight.as_ref().and_then(|w| w(entity)).unwrap_or(1.0);
        total += value * weight;
    }
    total
}

/// Most massive numeric value; ties go to the smaller value. `None` when
/// no entity yields a value.
pub fn mode_number<I, V, W>(entities: I, get_value: V, get_weight: Option<W>) -> Option<f64>
where
    I: Iterator<Item = usize>,
    V: Fn(usize) -> Option<f64>,
    W: Fn(usize) -> Option<f64>,
{
    let mut masses: HashMap<u64, f64> = HashMap::new();
    for entity in entities {
        let Some(value) = get_value(entity) else { continue };
        let weight = get_weight.as_ref().and_then(|w| w(entity)).unwrap_or(1.0);
        *masses.entry(value.to_bits()).or_insert(0.0) += weight;
    }
    masses
        .into_iter()
        .map(|(bits, mass)| (f64::from_bits(bits), mass))
        .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.total_cmp(&a.0)))
        .map(|(value, _)| value)
}

/// Most massive string value; ties go to the smaller id.
pub fn mode_string<I, V, W>(entities: I, get_value: V, get_weight: Option<W>) -> Option<StringId>
where
    I: Iterator<Item = usize>,
    V: Fn(usize) -> Option<StringId>,
    W: Fn(usize) -> Option<f64>,
{
    let mut masses: HashMap<StringId, f64> = HashMap::new();
    for entity in entities {
        let Some(value) = get_value(entity) else { continue };
        let weight = get_weight.as_ref().and_then(|w| w(entity)).unwrap_or(1.0);
        *masses.entry(value).or_insert(0.0) += weight;
    }
    masses
        .into_iter()
        .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(value, _)| value)
}

/// Weighted quantile with midpoint interpolation: each sorted value sits
/// at the center of its weight span, and `q` interpolates between the
/// bracketing centers. NaN when no entity yields a value.
pub fn quantile<I, V, W>(entities: I, get_value: V, get_weight: Option<W>, q: f64) -> f64
where
    I: Iterator<Item = usize>,
    V: Fn(usize) -> Option<f64>,
    W: Fn(usize) -> Option<f64>,
{
    let mut pairs: Vec<(f64, f64)> = Vec::new();
    for entity in entities {
        let Some(value) = get_value(entity) else { continue };
        let weight = get_weight.as_ref().and_then(|w| w(entity)).unwrap_or(1.0);
        if weight > 0.0 {
            pairs.push((value, weight));
        }
    }
    if pairs.is_empty() {
        return f64::NAN;
    }
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let total: f64 = pairs.iter().map(|&(_, w)| w).sum();
    let target = q.clamp(0.0, 1.0) * total;

    let mut cum = 0.0;
    let mut prev_center = f64::NAN;
    let mut prev_value = pairs[0].0;
    for &(value, weight) in &pairs {
        let center = cum + weight / 2.0;
        if target <= center {
            if prev_center.is_nan() {
                return value;
            }
            let span = center - prev_center;
            let t = if span > 0.0 { (target - prev_center) / span } else { 0.0 };
            return prev_value + t * (value - prev_value);
        }
        cum += weight;
        prev_center = center;
        prev_value = value;
    }
    prev_value
}

/// Generalized (power) mean `(Σ w·f(v−center)^p / Σ w)^(1/p)`, where `f`
/// is `abs` when `absolute_value` is set. `p == 0` is the geometric mean.
/// With `calculate_moment` the `1/p` root is skipped (raw p-th moment).
#[allow(clippy::too_many_arguments)]
pub fn generalized_mean<I, V, W>(
    entities: I,
    get_value: V,
    get_weight: Option<W>,
    p: f64,
    center: f64,
    calculate_moment: bool,
    absolute_value: bool,
) -> f64
where
    I: Iterator<Item = usize>,
    V: Fn(usize) -> Option<f64>,
    W: Fn(usize) -> Option<f64>,
{
    let mut accum = 0.0;
    let mut total_weight = 0.0;
    for entity in entities {
        let Some(value) = get_value(entity) else { continue };
        let weight = get_weight.as_ref().and_then(|w| w(entity)).unwrap_or(1.0);
        let mut term = value - center;
        if absolute_value {
            term = term.abs();
        }
        if p == 0.0 {
            // geometric mean accumulates logs
            accum += weight * term.ln();
        } else {
            accum += weight * term.powf(p);
        }
        total_weight += weight;
    }
    if total_weight == 0.0 {
        return f64::NAN;
    }

    let mean = accum / total_weight;
    if p == 0.0 {
        mean.exp()
    } else if calculate_moment {
        mean
    } else {
        mean.powf(1.0 / p)
    }
}

/// Smallest (`find_min`) or largest gap between adjacent sorted values.
/// `cyclic_range` adds the wrap-around gap; zero gaps are dropped unless
/// `include_zero`. NaN with fewer than two values.
pub fn extreme_difference<I, V>(
    entities: I,
    get_value: V,
    find_min: bool,
    cyclic_range: Option<f64>,
    include_zero: bool,
) -> f64
where
    I: Iterator<Item = usize>,
    V: Fn(usize) -> Option<f64>,
{
    let mut values: Vec<f64> = entities.filter_map(get_value).collect();
    if values.len() < 2 {
        return f64::NAN;
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let mut gaps: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
    if let Some(range) = cyclic_range {
        if range > 0.0 {
            gaps.push(values[0] + range - values[values.len() - 1]);
        }
    }
    if !include_zero {
        gaps.retain(|&g| g != 0.0);
    }
    let extreme = if find_min {
        gaps.iter().copied().min_by(|a, b| a.total_cmp(b))
    } else {
        gaps.iter().copied().max_by(|a, b| a.total_cmp(b))
    };
    extreme.unwrap_or(f64::NAN)
}

/// Per-value total weight over numeric values, ascending by value.
pub fn value_masses_number<I, V, W>(
    entities: I,
    get_value: V,
    get_weight: Option<W>,
) -> Vec<(f64, f64)>
where
    I: Iterator<Item = usize>,
    V: Fn(usize) -> Option<f64>,
    W: Fn(usize) -> Option<f64>,
{
    let mut masses: HashMap<u64, f64> = HashMap::new();
    for entity in entities {
        let Some(value) = get_value(entity) else { continue };
        let weight = get_weight.as_ref().and_then(|w| w(entity)).unwrap_or(1.0);
        *masses.entry(value.to_bits()).or_insert(0.0) += weight;
    }
    let mut out: Vec<(f64, f64)> =
        masses.into_iter().map(|(bits, mass)| (f64::from_bits(bits), mass)).collect();
    out.sort_by(|a, b| a.0.total_cmp(&b.0));
    out
}

/// Per-value total weight over string values, ascending by id.
pub fn value_masses_string<I, V, W>(
    entities: I,
    get_value: V,
    get_weight: Option<W>,
) -> Vec<(StringId, f64)>
where
    I: Iterator<Item = usize>,
    V: Fn(usize) -> Option<StringId>,
    W: Fn(usize) -> Option<f64>,
{
    let mut masses: HashMap<StringId, f64> = HashMap::new();
    for entity in entities {
        let Some(value) = get_value(entity) else { continue };
        let weight = get_weight.as_ref().and_then(|w| w(entity)).unwrap_or(1.0);
        *masses.entry(value).or_insert(0.0) += weight;
    }
    let mut out: Vec<(StringId, f64)> = masses.into_iter().collect();
    out.sort_by_key(|&(id, _)| id);
    out
}

/// Maps raw distances into the caller's value space: `x → x^e` or the
/// surprisal→probability transform `x → 2^−x`, optionally scaled by a
/// per-entity weight column, then (optionally) sorted ascending.
pub struct DistanceTransform<W> {
    pub surprisal_to_prob: bool,
    pub exponent: f64,
    pub get_weight: Option<W>,
}

impl<W> DistanceTransform<W>
where
    W: Fn(usize) -> Option<f64>,
{
    pub fn new(surprisal_to_prob: bool, exponent: f64, get_weight: Option<W>) -> Self {
        Self { surprisal_to_prob, exponent, get_weight }
    }

    /// A single distance through the transform (no weight applied).
    #[inline]
    pub fn transform_distance(&self, distance: f64) -> f64 {
        if self.surprisal_to_prob {
            (-distance).exp2()
        } else if self.exponent == 1.0 {
            distance
        } else {
            distance.powf(self.exponent)
        }
    }

    /// Transform a result batch in place.
    pub fn transform_results(&self, results: &mut [DistanceResult], sort: bool) {
        for r in results.iter_mut() {
            let mut value = self.transform_distance(r.distance);
            if let Some(get_weight) = &self.get_weight {
                value *= get_weight(r.entity).unwrap_or(1.0);
            }
            r.distance = value;
        }
        if sort {
            results.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.entity.cmp(&b.entity)));
        }
    }
}

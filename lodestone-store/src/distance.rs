// SPDX-License-Identifier: AGPL-3.0-or-later
// Lodestone - Entity Query Engine
// Copyright (C) 2026 Lodestone Contributors (https://github.com/lodestone-db)

//! # Generalized Minkowski Distance
//!
//! One distance engine for every feature shape the store indexes: nominal,
//! continuous numeric, cyclic numeric, string, and code features, each with
//! a per-feature weight, an additive deviation, and explicit
//! known↔unknown semantics. The aggregate over features is
//! `(Σ wᵢ·|aᵢ−bᵢ|ᵖ)^(1/p)`, where `|·|` is feature-type specific.
//!
//! Terms that do not depend on the candidate — nominal match/mismatch and
//! the known/unknown uncertainty terms — are precomputed once per query by
//! [`DistanceParams::set_and_constrain_params`] and
//! [`DistanceParams::compute_and_store_uncertainty_terms`], so the per-pair
//! computation is branch-light. The unknown-value closure (filling NaN
//! `known_to_unknown` / `unknown_to_unknown` gaps from column contents)
//! happens in the store before a search runs.

use serde::{Deserialize, Serialize};

use lodestone_core::code::CodeStore;
use lodestone_core::strings::StringPool;
use lodestone_core::value::Value;

use crate::fastmath::pow_with_accuracy;

/// How a feature measures difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureType {
    /// Categorical: zero when equal, a precomputed mismatch term otherwise.
    Nominal,
    /// Plain numeric difference.
    Continuous,
    /// Numeric difference on a cycle (e.g. angles, hours).
    ContinuousCyclic,
    /// Weighted edit distance between interned strings.
    ContinuousString,
    /// Normalized structural difference between code trees.
    ContinuousCode,
    /// Internal upgrade of [`FeatureType::Continuous`] when every present
    /// value in the column is numeric, removing the per-entity kind check.
    ContinuousUniversallyNumeric,
}

impl Default for FeatureType {
    fn default() -> Self {
        FeatureType::Continuous
    }
}

/// Type-specific attribute of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FeatureAttributes {
    None,
    /// Nominal cardinality (number of distinct classes).
    NominalCount(f64),
    /// Cyclic period; differences wrap at half this range.
    CyclicRange(f64),
}

impl Default for FeatureAttributes {
    fn default() -> Self {
        FeatureAttributes::None
    }
}

/// Per-feature distance parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureParams {
    /// Multiplicative weight; zero disables the feature entirely.
    pub weight: f64,
    pub feature_type: FeatureType,
    /// Additive uncertainty subtracted from differences (floored at zero).
    pub deviation: f64,
    /// Difference between a known and an unknown value. NaN means "derive
    /// from the column" (the unknown-value closure fills it in).
    pub known_to_unknown: f64,
    /// Difference between two unknown values. NaN means "derive".
    pub unknown_to_unknown: f64,
    pub attributes: FeatureAttributes,

    // terms precomputed per query; never serialized
    #[serde(skip)]
    nominal_match_term: f64,
    #[serde(skip)]
    nominal_nonmatch_term: f64,
    #[serde(skip)]
    known_to_unknown_term: f64,
    #[serde(skip)]
    unknown_to_unknown_term: f64,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            weight: 1.0,
            feature_type: FeatureType::Continuous,
            deviation: 0.0,
            known_to_unknown: f64::NAN,
            unknown_to_unknown: f64::NAN,
            attributes: FeatureAttributes::None,
            nominal_match_term: 0.0,
            nominal_nonmatch_term: 0.0,
            known_to_unknown_term: 0.0,
            unknown_to_unknown_term: 0.0,
        }
    }
}

impl FeatureParams {
    pub fn nominal(count: f64) -> Self {
        Self {
            feature_type: FeatureType::Nominal,
            attributes: FeatureAttributes::NominalCount(count),
            ..Self::default()
        }
    }

    pub fn cyclic(range: f64) -> Self {
        Self {
            feature_type: FeatureType::ContinuousCyclic,
            attributes: FeatureAttributes::CyclicRange(range),
            ..Self::default()
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_deviation(mut self, deviation: f64) -> Self {
        self.deviation = deviation;
        self
    }

    fn cyclic_range(&self) -> f64 {
        match self.attributes {
            FeatureAttributes::CyclicRange(r) => r,
            _ => 0.0,
        }
    }

    fn nominal_count(&self) -> f64 {
        match self.attributes {
            FeatureAttributes::NominalCount(n) => n,
            _ => 0.0,
        }
    }
}

/// Collaborators needed for string and code distance terms. Numeric and
/// nominal paths never touch it.
#[derive(Clone, Copy, Default)]
pub struct TermContext<'a> {
    pub strings: Option<&'a StringPool>,
    pub code: Option<&'a dyn CodeStore>,
}

impl<'a> TermContext<'a> {
    pub fn empty() -> Self {
        Self { strings: None, code: None }
    }
}

/// Per-query distance parameters: the feature list plus the global knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistanceParams {
    pub features: Vec<FeatureParams>,
    /// Minkowski p. Zero is rejected upstream; negative falls back to 2.
    pub p_value: f64,
    /// Exact arithmetic during accumulation instead of fast approximations.
    pub high_accuracy: bool,
    /// Recompute surviving candidates exactly after a low-accuracy search.
    pub recompute_accurate_distances: bool,
}

impl Default for DistanceParams {
    fn default() -> Self {
        Self {
            features: Vec::new(),
            p_value: 2.0,
            high_accuracy: false,
            recompute_accurate_distances: true,
        }
    }
}

impl DistanceParams {
    pub fn new(features: Vec<FeatureParams>, p_value: f64) -> Self {
        let mut params = Self { features, p_value, ..Self::default() };
        params.set_and_constrain_params();
        params
    }

    #[inline]
    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    #[inline]
    pub fn is_feature_enabled(&self, i: usize) -> bool {
        self.features[i].weight > 0.0
    }

    /// True when every enabled feature has weight zero — i.e. none at all.
    pub fn all_features_disabled(&self) -> bool {
        !(0..self.features.len()).any(|i| self.is_feature_enabled(i))
    }

    /// Constrain the global parameters and precompute the per-feature
    /// constant terms. Call after any parameter mutation and before use.
    pub fn set_and_constrain_params(&mut self) {
        if !self.p_value.is_finite() || self.p_value < 0.0 {
            self.p_value = 2.0;
        }

        for i in 0..self.features.len() {
            let f = &mut self.features[i];
            if !f.weight.is_finite() || f.weight < 0.0 {
                f.weight = 0.0;
            }
            if !f.deviation.is_finite() || f.deviation < 0.0 {
                f.deviation = 0.0;
            }
            // a cyclic feature without a positive range cannot wrap
            if f.feature_type == FeatureType::ContinuousCyclic && f.cyclic_range() <= 0.0 {
                f.feature_type = FeatureType::Continuous;
                f.attributes = FeatureAttributes::None;
            }

            if f.feature_type == FeatureType::Nominal {
                let n = f.nominal_count();
                let match_diff = f.deviation.max(0.0);
                let nonmatch_diff = if n > 1.0 {
                    (1.0 - f.deviation / (n - 1.0)).max(0.0)
                } else {
                    1.0
                };
                let (w, p, acc) = (f.weight, self.p_value, self.high_accuracy);
                let f = &mut self.features[i];
                f.nominal_match_term = w * pow_with_accuracy(match_diff, p, acc);
                f.nominal_nonmatch_term = w * pow_with_accuracy(nonmatch_diff, p, acc);
            }

            self.compute_and_store_uncertainty_terms(i);
        }
    }

    /// Recompute the cached known/unknown terms of feature `i` from its
    /// (possibly closure-filled) difference values.
    pub fn compute_and_store_uncertainty_terms(&mut self, i: usize) {
        let k2u = self.features[i].known_to_unknown;
        let u2u = self.features[i].unknown_to_unknown;
        let fallback = match self.features[i].feature_type {
            FeatureType::Nominal => self.features[i].nominal_nonmatch_term,
            _ => self.difference_to_term(1.0, i),
        };

        self.features[i].known_to_unknown_term = if k2u.is_nan() {
            fallback
        } else {
            self.difference_to_term(k2u, i)
        };
        self.features[i].unknown_to_unknown_term = if u2u.is_nan() {
            fallback
        } else {
            self.difference_to_term(u2u, i)
        };
    }

    /// Turn a raw feature difference into an accumulated distance term:
    /// subtract the deviation (floor zero), raise to p, scale by weight.
    #[inline]
    pub fn difference_to_term(&self, diff: f64, i: usize) -> f64 {
        let f = &self.features[i];
        let d = (diff - f.deviation).max(0.0);
        f.weight * pow_with_accuracy(d, self.p_value, self.high_accuracy)
    }

    /// Same, with an explicit accuracy override (final recompute pass).
    #[inline]
    pub fn difference_to_term_with_accuracy(&self, diff: f64, i: usize, high_accuracy: bool) -> f64 {
        let f = &self.features[i];
        let d = (diff - f.deviation).max(0.0);
        f.weight * pow_with_accuracy(d, self.p_value, high_accuracy)
    }

    #[inline]
    pub fn nominal_match_term(&self, i: usize) -> f64 {
        self.features[i].nominal_match_term
    }

    #[inline]
    pub fn nominal_nonmatch_term(&self, i: usize) -> f64 {
        self.features[i].nominal_nonmatch_term
    }

    #[inline]
    pub fn known_to_unknown_term(&self, i: usize) -> f64 {
        self.features[i].known_to_unknown_term
    }

    #[inline]
    pub fn unknown_to_unknown_term(&self, i: usize) -> f64 {
        self.features[i].unknown_to_unknown_term
    }

    /// The aggregate `sum^(1/p)`.
    #[inline]
    pub fn inverse_exponentiate(&self, dist_accum: f64) -> f64 {
        if self.p_value == 1.0 || dist_accum == 0.0 {
            return dist_accum;
        }
        pow_with_accuracy(dist_accum, 1.0 / self.p_value, self.high_accuracy)
    }

    /// The full distance term between two values for feature `i`.
    pub fn compute_term_regular(&self, a: Value, b: Value, i: usize, ctx: TermContext<'_>) -> f64 {
        match self.features[i].feature_type {
            FeatureType::Nominal => {
                let ua = is_unknown(a);
                let ub = is_unknown(b);
                if ua && ub {
                    self.unknown_to_unknown_term(i)
                } else if ua || ub {
                    self.known_to_unknown_term(i)
                } else if nominal_equal(a, b, ctx) {
                    self.nominal_match_term(i)
                } else {
                    self.nominal_nonmatch_term(i)
                }
            }
            FeatureType::Continuous | FeatureType::ContinuousUniversallyNumeric => {
                match (known_number(a), known_number(b)) {
                    (Some(x), Some(y)) => self.difference_to_term((x - y).abs(), i),
                    (None, None) => self.unknown_to_unknown_term(i),
                    _ => self.known_to_unknown_term(i),
                }
            }
            FeatureType::ContinuousCyclic => match (known_number(a), known_number(b)) {
                (Some(x), Some(y)) => {
                    self.difference_to_term(cyclic_difference(x, y, self.features[i].cyclic_range()), i)
                }
                (None, None) => self.unknown_to_unknown_term(i),
                _ => self.known_to_unknown_term(i),
            },
            FeatureType::ContinuousString => match (a.as_string_id(), b.as_string_id()) {
                (Some(x), Some(y)) => {
                    if x == y {
                        0.0
                    } else {
                        let diff = match ctx.strings {
                            Some(pool) => {
                                let sa = pool.resolve_owned(x);
                                let sb = pool.resolve_owned(y);
                                string_edit_distance(&sa, &sb) as f64
                            }
                            None => 1.0,
                        };
                        self.difference_to_term(diff, i)
                    }
                }
                (None, None) => self.unknown_to_unknown_term(i),
                _ => self.known_to_unknown_term(i),
            },
            FeatureType::ContinuousCode => match (a.as_code(), b.as_code()) {
                (Some(x), Some(y)) => {
                    let diff = match ctx.code {
                        Some(store) => {
                            if store.deep_equal(x, y) {
                                return 0.0;
                            }
                            code_difference(store, x, y)
                        }
                        None => {
                            if x == y {
                                return 0.0;
                            }
                            1.0
                        }
                    };
                    self.difference_to_term(diff, i)
                }
                (None, None) => self.unknown_to_unknown_term(i),
                _ => self.known_to_unknown_term(i),
            },
        }
    }
}

/// A value a continuous feature cannot measure against: null, invalid, or
/// a NaN number. For string/code features any other kind counts as unknown
/// too, handled at the dispatch sites.
#[inline]
pub fn is_unknown(v: Value) -> bool {
    match v {
        Value::Number(n) => n.is_nan(),
        Value::Null | Value::Invalid => true,
        _ => false,
    }
}

#[inline]
fn known_number(v: Value) -> Option<f64> {
    match v {
        Value::Number(n) if !n.is_nan() => Some(n),
        _ => None,
    }
}

fn nominal_equal(a: Value, b: Value, ctx: TermContext<'_>) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::StringId(x), Value::StringId(y)) => x == y,
        (Value::Code(x), Value::Code(y)) => match ctx.code {
            Some(store) => store.deep_equal(x, y),
            None => x == y,
        },
        _ => false,
    }
}

/// Wrapped difference on a cycle of length `range`.
#[inline]
pub fn cyclic_difference(x: f64, y: f64, range: f64) -> f64 {
    let d = ((x - y).abs()) % range;
    d.min(range - d)
}

/// Normalized structural difference between two code trees: fraction of
/// the larger tree's nodes with no structural counterpart in the other.
pub fn code_difference(store: &dyn CodeStore, a: lodestone_core::code::CodeHandle, b: lodestone_core::code::CodeHandle) -> f64 {
    let ca = store.node_count(a);
    let cb = store.node_count(b);
    let largest = ca.max(cb);
    if largest == 0 {
        return 0.0;
    }
    let shared = store.shared_node_count(a, b);
    1.0 - shared as f64 / largest as f64
}

/// Levenshtein distance over characters (two-row dynamic program).
pub fn string_edit_distance(a: &str, b: &str) -> usize {
    if a == b {
        return 0;
    }
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    if a_chars.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a_chars.len();
    }

    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0usize; b_chars.len() + 1];
    for (i, &ca) in a_chars.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &cb) in b_chars.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone_core::strings::StringId;

    fn continuous_params(n: usize, p: f64) -> DistanceParams {
        let mut params = DistanceParams::new(
            (0..n).map(|_| FeatureParams::default()).collect(),
            p,
        );
        params.high_accuracy = true;
        params.set_and_constrain_params();
        params
    }

    #[test]
    fn test_continuous_term() {
        let params = continuous_params(1, 2.0);
        let t = params.compute_term_regular(
            Value::Number(3.0),
            Value::Number(1.0),
            0,
            TermContext::empty(),
        );
        assert_eq!(t, 4.0);
        assert_eq!(params.inverse_exponentiate(t), 2.0);
    }

    #[test]
    fn test_deviation_subtracts_and_floors() {
        let mut params = continuous_params(1, 1.0);
        params.features[0].deviation = 1.5;
        params.set_and_constrain_params();
        assert_eq!(params.difference_to_term(4.0, 0), 2.5);
        assert_eq!(params.difference_to_term(1.0, 0), 0.0);
    }

    #[test]
    fn test_nominal_terms() {
        let mut params = DistanceParams::new(vec![FeatureParams::nominal(3.0)], 1.0);
        params.high_accuracy = true;
        params.set_and_constrain_params();

        let a = Value::StringId(StringId(5));
        let b = Value::StringId(StringId(5));
        let c = Value::StringId(StringId(9));
        let ctx = TermContext::empty();
        assert_eq!(params.compute_term_regular(a, b, 0, ctx), 0.0);
        assert_eq!(params.compute_term_regular(a, c, 0, ctx), 1.0);
        // deviation shrinks the mismatch term by dev/(n-1)
        params.features[0].deviation = 0.5;
        params.set_and_constrain_params();
        assert!((params.compute_term_regular(a, c, 0, ctx) - 0.75).abs() < 1e-12);
        assert_eq!(params.compute_term_regular(a, b, 0, ctx), 0.5);
    }

    #[test]
    fn test_cyclic_wraps() {
        assert_eq!(cyclic_difference(10.0, 0.0, 360.0), 10.0);
        assert_eq!(cyclic_difference(350.0, 0.0, 360.0), 10.0);
        assert_eq!(cyclic_difference(180.0, 0.0, 360.0), 180.0);
        assert_eq!(cyclic_difference(725.0, 0.0, 360.0), 5.0);
    }

    #[test]
    fn test_degenerate_cyclic_becomes_continuous() {
        let mut params = DistanceParams::new(vec![FeatureParams::cyclic(0.0)], 1.0);
        params.set_and_constrain_params();
        assert_eq!(params.features[0].feature_type, FeatureType::Continuous);
    }

    #[test]
    fn test_unknown_terms_after_closure() {
        let mut params = continuous_params(1, 1.0);
        params.features[0].known_to_unknown = 7.0;
        params.features[0].unknown_to_unknown = 3.0;
        params.compute_and_store_uncertainty_terms(0);

        let ctx = TermContext::empty();
        let known = Value::Number(1.0);
        let missing = Value::missing_number();
        assert_eq!(params.compute_term_regular(known, missing, 0, ctx), 7.0);
        assert_eq!(params.compute_term_regular(missing, Value::Null, 0, ctx), 3.0);
        assert_eq!(params.compute_term_regular(Value::Invalid, known, 0, ctx), 7.0);
    }

    #[test]
    fn test_string_edit_distance() {
        assert_eq!(string_edit_distance("", ""), 0);
        assert_eq!(string_edit_distance("abc", "abc"), 0);
        assert_eq!(string_edit_distance("kitten", "sitting"), 3);
        assert_eq!(string_edit_distance("", "abc"), 3);
        assert_eq!(string_edit_distance("flaw", "lawn"), 2);
    }

    #[test]
    fn test_string_feature_uses_pool() {
        let pool = StringPool::new();
        let a = pool.intern("kitten");
        let b = pool.intern("sitting");

        let mut params = DistanceParams::new(
            vec![FeatureParams {
                feature_type: FeatureType::ContinuousString,
                ..FeatureParams::default()
            }],
            1.0,
        );
        params.high_accuracy = true;
        params.set_and_constrain_params();

        let ctx = TermContext { strings: Some(&pool), code: None };
        let t = params.compute_term_regular(Value::StringId(a), Value::StringId(b), 0, ctx);
        assert_eq!(t, 3.0);
        assert_eq!(
            params.compute_term_regular(Value::StringId(a), Value::StringId(a), 0, ctx),
            0.0
        );
    }

    #[test]
    fn test_zero_weight_disables() {
        let mut params = continuous_params(2, 2.0);
        params.features[1].weight = 0.0;
        params.set_and_constrain_params();
        assert!(params.is_feature_enabled(0));
        assert!(!params.is_feature_enabled(1));
        assert_eq!(params.difference_to_term(5.0, 1), 0.0);
    }

    #[test]
    fn test_negative_p_falls_back() {
        let params = DistanceParams::new(vec![FeatureParams::default()], -3.0);
        assert_eq!(params.p_value, 2.0);
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Lodestone - Entity Query Engine
// Copyright (C) 2026 Lodestone Contributors (https://github.com/lodestone-db)

//! # Entity Sampling
//!
//! Three ways of drawing from the matching set: positional `SELECT`
//! (offset + count, optionally shuffled by a seeded stream), uniform
//! `SAMPLE` without replacement, and `WEIGHTED_SAMPLE` with replacement
//! against a weight column. Weighted draws use a cumulative-weight search
//! for a handful of samples and build a Walker alias table once the draw
//! count justifies the setup cost.

use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;

use lodestone_core::intset::IndexSet;
use lodestone_core::random::RandomStream;

/// Draw threshold above which the alias table beats repeated
/// cumulative-weight searches.
const ALIAS_TABLE_THRESHOLD: usize = 10;

/// Positional selection: skip `offset`, take `count` (`0` = the rest).
/// A stream shuffles the candidates first, deterministically.
pub fn select(
    candidates: &IndexSet,
    count: usize,
    offset: usize,
    stream: Option<&mut RandomStream>,
    out: &mut Vec<usize>,
) {
    out.clear();
    let mut ordered: Vec<usize> = candidates.iter().collect();
    if let Some(stream) = stream {
        ordered.shuffle(stream);
    }
    let take = if count == 0 { ordered.len() } else { count };
    out.extend(ordered.into_iter().skip(offset).take(take));
}

/// Uniform sample of `count` distinct entities.
pub fn sample_without_replacement(
    candidates: &IndexSet,
    count: usize,
    stream: &mut RandomStream,
    out: &mut Vec<usize>,
) {
    out.clear();
    let mut remaining: Vec<usize> = candidates.iter().collect();
    let count = count.min(remaining.len());
    for _ in 0..count {
        let pick = stream.next_range(remaining.len());
        out.push(remaining.swap_remove(pick));
    }
}

/// Weighted sample of `count` entities **with replacement**. Weights need
/// not be normalized; non-positive and non-finite weights drop out.
pub fn weighted_sample(
    entities: &[usize],
    weights: &[f64],
    count: usize,
    stream: &mut RandomStream,
    out: &mut Vec<usize>,
) {
    out.clear();
    let usable: Vec<(usize, f64)> = entities
        .iter()
        .copied()
        .zip(weights.iter().copied())
        .filter(|&(_, w)| w.is_finite() && w > 0.0)
        .collect();
    if usable.is_empty() || count == 0 {
        return;
    }

    if count < ALIAS_TABLE_THRESHOLD {
        // cumulative-weight search: cheap per draw, no setup
        let Ok(index) = WeightedIndex::new(usable.iter().map(|&(_, w)| w)) else {
            return;
        };
        for _ in 0..count {
            out.push(usable[index.sample(stream)].0);
        }
    } else {
        let table = AliasTable::new(&usable);
        for _ in 0..count {
            out.push(table.pick(stream));
        }
    }
}

/// Walker alias table: O(n) build, O(1) per draw.
struct AliasTable {
    entities: Vec<usize>,
    /// Acceptance probability of each slot's own entity.
    prob: Vec<f64>,
    /// Fallback slot when the coin flip rejects.
    alias: Vec<usize>,
}

impl AliasTable {
    fn new(usable: &[(usize, f64)]) -> Self {
        let n = usable.len();
        let total: f64 = usable.iter().map(|&(_, w)| w).sum();
        let mut prob: Vec<f64> = usable.iter().map(|&(_, w)| w * n as f64 / total).collect();
        let mut alias = vec![0usize; n];

        let mut small: Vec<usize> = (0..n).filter(|&i| prob[i] < 1.0).collect();
        let mut large: Vec<usize> = (0..n).filter(|&i| prob[i] >= 1.0).collect();

        while let (Some(s), Some(l)) = (small.pop(), large.pop()) {
            alias[s] = l;
            // the large slot donates what the small slot lacks
            prob[l] = (prob[l] + prob[s]) - 1.0;
            if prob[l] < 1.0 {
                small.push(l);
            } else {
                large.push(l);
            }
        }
        // numerical leftovers saturate
        for i in small.into_iter().chain(large) {
            prob[i] = 1.0;
        }

        Self {
            entities: usable.iter().map(|&(e, _)| e).collect(),
            prob,
            alias,
        }
    }

    fn pick(&self, stream: &mut RandomStream) -> usize {
        let slot = stream.next_range(self.entities.len());
        if stream.next_f64() < self.prob[slot] {
            self.entities[slot]
        } else {
            self.entities[self.alias[slot]]
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_offset_and_count() {
        let candidates = IndexSet::from_indices([5, 1, 9, 3, 7]);
        let mut out = Vec::new();
        select(&candidates, 2, 1, None, &mut out);
        assert_eq!(out, vec![3, 5]); // ascending candidate order: 1,3,5,7,9

        select(&candidates, 0, 3, None, &mut out);
        assert_eq!(out, vec![7, 9]);
    }

    #[test]
    fn test_select_with_seed_is_deterministic() {
        let candidates = IndexSet::from_indices(0..20);
        let mut a = Vec::new();
        let mut b = Vec::new();
        select(&candidates, 5, 0, Some(&mut RandomStream::from_seed_str("sel")), &mut a);
        select(&candidates, 5, 0, Some(&mut RandomStream::from_seed_str("sel")), &mut b);
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
    }

    #[test]
    fn test_sample_without_replacement_distinct() {
        let candidates = IndexSet::from_indices(0..10);
        let mut stream = RandomStream::from_seed_str("s");
        let mut out = Vec::new();
        sample_without_replacement(&candidates, 6, &mut stream, &mut out);
        assert_eq!(out.len(), 6);
        let distinct: std::collections::HashSet<usize> = out.iter().copied().collect();
        assert_eq!(distinct.len(), 6);

        // more than available truncates
        sample_without_replacement(&candidates, 50, &mut stream, &mut out);
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn test_weighted_sample_small_and_large_counts() {
        let entities = [10, 20, 30];
        let weights = [0.0, 1.0, 99.0];

        let mut stream = RandomStream::from_seed_str("w-small");
        let mut out = Vec::new();
        weighted_sample(&entities, &weights, 5, &mut stream, &mut out);
        assert_eq!(out.len(), 5);
        assert!(!out.contains(&10)); // zero weight never drawn

        let mut stream = RandomStream::from_seed_str("w-large");
        weighted_sample(&entities, &weights, 500, &mut stream, &mut out);
        assert_eq!(out.len(), 500);
        let heavy = out.iter().filter(|&&e| e == 30).count();
        assert!(heavy > 400, "heavy entity drawn {} of 500", heavy);
        assert!(!out.contains(&10));
    }

    #[test]
    fn test_weighted_sample_deterministic() {
        let entities = [1, 2, 3, 4];
        let weights = [1.0, 2.0, 3.0, 4.0];
        let mut a = Vec::new();
        let mut b = Vec::new();
        weighted_sample(&entities, &weights, 20, &mut RandomStream::from_seed_str("d"), &mut a);
        weighted_sample(&entities, &weights, 20, &mut RandomStream::from_seed_str("d"), &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_weighted_sample_empty_weights() {
        let mut out = vec![99];
        weighted_sample(&[1, 2], &[0.0, f64::NAN], 3, &mut RandomStream::from_seed_str("e"), &mut out);
        assert!(out.is_empty());
    }
}

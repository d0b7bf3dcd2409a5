//! Sparse feature vectors keyed by interned feature-name ids.
//!
//! Entries stay ordered by feature id, so any fold over a vector (dot
//! product, accumulation) visits entries in the same order every run and
//! floating-point sums are reproducible. Scoring is a dot product against a
//! weight vector of the same shape.

use std::collections::BTreeMap;

use crate::symbol::WordId;

/// A sparse `feature-id → value` map, ordered by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureVec(BTreeMap<WordId, f64>);

impl FeatureVec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value` to the entry for `id`, dropping it if the sum hits zero.
    pub fn add(&mut self, id: WordId, value: f64) {
        let entry = self.0.entry(id).or_insert(0.0);
        *entry += value;
        if *entry == 0.0 {
            self.0.remove(&id);
        }
    }

    pub fn insert(&mut self, id: WordId, value: f64) {
        if value == 0.0 {
            self.0.remove(&id);
        } else {
            self.0.insert(id, value);
        }
    }

    pub fn get(&self, id: WordId) -> f64 {
        self.0.get(&id).copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (WordId, f64)> + '_ {
        self.0.iter().map(|(&k, &v)| (k, v))
    }

    /// Accumulate another vector into this one.
    pub fn add_all(&mut self, other: &FeatureVec) {
        for (id, value) in other.iter() {
            self.add(id, value);
        }
    }

    /// Dot product against a weight vector. Missing weights count as zero.
    pub fn dot(&self, weights: &FeatureVec) -> f64 {
        self.0
            .iter()
            .map(|(id, value)| value * weights.get(*id))
            .sum()
    }

    /// Entries sorted by feature id.
    pub fn sorted(&self) -> Vec<(WordId, f64)> {
        self.iter().collect()
    }
}

impl FromIterator<(WordId, f64)> for FeatureVec {
    fn from_iter<T: IntoIterator<Item = (WordId, f64)>>(iter: T) -> Self {
        let mut ret = FeatureVec::new();
        for (id, value) in iter {
            ret.add(id, value);
        }
        ret
    }
}

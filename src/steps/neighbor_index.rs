//! NeighborIndex (spec §4.10, C9): builds a neighbor search index over the
//! corrected embedding. Downstream steps each need a different `k`
//! (perplexity-derived for t-SNE, `num_neighbors` for UMAP/SNN), so this
//! step caches the embedding points rather than a single fixed-`k` graph;
//! `fetch_knn(k)` is a pure function of the cached points and `approximate`
//! (spec: "recomputation depends only on upstream change and the single
//! boolean").
//!
//! Grounded on `kernels::neighbors::knn`.

use crate::data::PCResult;
use crate::kernels::neighbors::{knn, NeighborGraph};
use crate::steps::ChangeTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NeighborIndexParams {
    pub approximate: bool,
}

pub struct NeighborIndex {
    tracker: ChangeTracker<NeighborIndexParams>,
    changed: bool,
    valid: bool,
    points: Vec<Vec<f32>>,
    approximate: bool,
}

impl NeighborIndex {
    pub fn new() -> Self {
        NeighborIndex {
            tracker: ChangeTracker::new(),
            changed: false,
            valid: false,
            points: Vec::new(),
            approximate: false,
        }
    }

    pub fn defaults() -> NeighborIndexParams {
        NeighborIndexParams::default()
    }

    pub fn compute(&mut self, corrected: Option<&PCResult>, params: &NeighborIndexParams, upstream_changed: bool) {
        let recompute = self.tracker.update(params, upstream_changed);
        self.valid = corrected.is_some();
        if !recompute || !self.valid {
            self.changed = recompute && self.valid;
            return;
        }
        let corrected = corrected.unwrap();
        self.points = (0..corrected.num_cells).map(|c| corrected.cell(c)).collect();
        self.approximate = params.approximate;
        self.changed = true;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn fetch_knn(&self, k: usize) -> NeighborGraph {
        knn(&self.points, k, self.approximate)
    }

    pub fn n_cells(&self) -> usize {
        self.points.len()
    }

    pub fn free(&mut self) {
        self.points = Vec::new();
    }
}

impl Default for NeighborIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_pc() -> PCResult {
        PCResult { num_pcs: 1, num_cells: 3, data: vec![0.0, 1.0, 5.0], variance_explained: vec![1.0] }
    }

    #[test]
    fn fetch_knn_reflects_requested_k() {
        let pc = toy_pc();
        let mut idx = NeighborIndex::new();
        idx.compute(Some(&pc), &NeighborIndexParams::default(), true);
        let graph = idx.fetch_knn(1);
        assert_eq!(graph.indices[0], vec![1]);
    }

    #[test]
    fn invalid_when_no_embedding() {
        let mut idx = NeighborIndex::new();
        idx.compute(None, &NeighborIndexParams::default(), true);
        assert!(!idx.valid());
    }
}

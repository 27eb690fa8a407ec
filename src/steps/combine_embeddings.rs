//! CombineEmbeddings (spec §4.8, C7): concatenates per-modality PC matrices
//! row-wise, scaling each modality so its neighbor distances are roughly
//! comparable, unless the caller supplies explicit weights.
//!
//! Grounded on `kernels::neighbors::knn`: the same brute-force neighbor
//! search used by `NeighborIndex` drives the per-modality scale estimate
//! here (median distance to the 15 nearest neighbors within that
//! modality's own PC space), since neither pack carries an equivalent
//! "reweight after PCA" routine.

use std::collections::BTreeMap;

use crate::data::PCResult;
use crate::error::EngineError;
use crate::kernels::neighbors::knn;
use crate::steps::ChangeTracker;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CombineEmbeddingsParams {
    pub weights: Option<BTreeMap<String, f32>>,
    pub approximate: bool,
}

pub struct CombineEmbeddings {
    tracker: ChangeTracker<CombineEmbeddingsParams>,
    changed: bool,
    valid: bool,
    result: Option<PCResult>,
}

impl CombineEmbeddings {
    pub fn new() -> Self {
        CombineEmbeddings {
            tracker: ChangeTracker::new(),
            changed: false,
            valid: false,
            result: None,
        }
    }

    pub fn defaults() -> CombineEmbeddingsParams {
        CombineEmbeddingsParams::default()
    }

    /// `modalities` holds every present modality's PCA result, in a stable
    /// order; when exactly one is present the result is an aliased copy of
    /// it (spec §8 "single-modality shortcut").
    pub fn compute(
        &mut self,
        modalities: &[(String, &PCResult)],
        params: &CombineEmbeddingsParams,
        upstream_changed: bool,
    ) -> Result<(), EngineError> {
        let recompute = self.tracker.update(params, upstream_changed);
        self.valid = !modalities.is_empty();
        if !recompute || !self.valid {
            self.changed = recompute && self.valid;
            return Ok(());
        }

        if modalities.len() == 1 {
            self.result = Some(modalities[0].1.clone());
            self.changed = true;
            return Ok(());
        }

        let n_cells = modalities[0].1.num_cells;

        let scales: Vec<f32> = if let Some(weights) = &params.weights {
            let mut out = Vec::with_capacity(modalities.len());
            for (name, _) in modalities {
                let w = weights.get(name).ok_or_else(|| {
                    EngineError::invalid_parameter(
                        "combine_embeddings",
                        format!("missing weight for present modality `{name}`"),
                    )
                })?;
                out.push(*w);
            }
            out
        } else {
            modalities
                .iter()
                .map(|(_, pc)| neighbor_distance_scale(pc, params.approximate))
                .collect()
        };

        let total_pcs: usize = modalities.iter().map(|(_, pc)| pc.num_pcs).sum();
        let mut data = Vec::with_capacity(total_pcs * n_cells);
        let mut variance_explained = Vec::with_capacity(total_pcs);
        for ((_, pc), &scale) in modalities.iter().zip(scales.iter()) {
            for p in 0..pc.num_pcs {
                data.extend(pc.component(p).iter().map(|&v| v * scale));
            }
            variance_explained.extend_from_slice(&pc.variance_explained);
        }

        self.result = Some(PCResult {
            num_pcs: total_pcs,
            num_cells: n_cells,
            data,
            variance_explained,
        });
        self.changed = true;
        Ok(())
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn fetch_result(&self) -> Option<&PCResult> {
        self.result.as_ref()
    }

    pub fn free(&mut self) {
        self.result = None;
    }
}

impl Default for CombineEmbeddings {
    fn default() -> Self {
        Self::new()
    }
}

fn neighbor_distance_scale(pc: &PCResult, approximate: bool) -> f32 {
    let n_cells = pc.num_cells;
    if n_cells < 2 {
        return 1.0;
    }
    let points: Vec<Vec<f32>> = (0..n_cells).map(|c| pc.cell(c)).collect();
    let k = 15.min(n_cells - 1).max(1);
    let graph = knn(&points, k, approximate);
    let mut all_dists: Vec<f32> = graph.distances.iter().flat_map(|d| d.iter().copied()).collect();
    if all_dists.is_empty() {
        return 1.0;
    }
    all_dists.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median = all_dists[all_dists.len() / 2];
    if median > 0.0 {
        1.0 / median
    } else {
        1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_pc(num_pcs: usize, num_cells: usize, scale: f32) -> PCResult {
        let data: Vec<f32> = (0..num_pcs * num_cells).map(|i| scale * i as f32).collect();
        PCResult { num_pcs, num_cells, data, variance_explained: vec![1.0 / num_pcs as f32; num_pcs] }
    }

    #[test]
    fn single_modality_is_bit_identical_view() {
        let pc = toy_pc(3, 5, 1.0);
        let modalities = vec![("RNA".to_string(), &pc)];
        let mut combine = CombineEmbeddings::new();
        combine.compute(&modalities, &CombineEmbeddingsParams::default(), true).unwrap();
        let out = combine.fetch_result().unwrap();
        assert_eq!(out.data, pc.data);
        assert_eq!(out.num_pcs, pc.num_pcs);
    }

    #[test]
    fn missing_weight_for_present_modality_errors() {
        let rna = toy_pc(2, 4, 1.0);
        let adt = toy_pc(2, 4, 1.0);
        let modalities = vec![("RNA".to_string(), &rna), ("ADT".to_string(), &adt)];
        let mut weights = BTreeMap::new();
        weights.insert("RNA".to_string(), 1.0f32);
        let params = CombineEmbeddingsParams { weights: Some(weights), approximate: false };
        let mut combine = CombineEmbeddings::new();
        let err = combine.compute(&modalities, &params, true);
        assert!(err.is_err());
    }

    #[test]
    fn two_modalities_concatenate_components() {
        let rna = toy_pc(2, 4, 1.0);
        let adt = toy_pc(3, 4, 1.0);
        let modalities = vec![("RNA".to_string(), &rna), ("ADT".to_string(), &adt)];
        let mut combine = CombineEmbeddings::new();
        combine.compute(&modalities, &CombineEmbeddingsParams::default(), true).unwrap();
        let out = combine.fetch_result().unwrap();
        assert_eq!(out.num_pcs, 5);
        assert_eq!(out.num_cells, 4);
    }
}

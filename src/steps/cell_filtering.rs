//! CellFiltering (spec §4.4, C3): pools per-modality discard vectors and
//! applies the combined column filter to every modality matrix and to the
//! block factor.
//!
//! Grounded on the teacher's single-pass filter step in
//! `pipeline::stage2_normalize`'s preamble, generalized to an arbitrary
//! number of valid QC states and an `undo_filtering` map back to original
//! cell coordinates (spec §4.4).

use crate::data::annotation::Annotations;
use crate::data::block::BlockFactor;
use crate::data::matrix::{Matrix, MultiMatrix};
use crate::data::DiscardVector;
use crate::steps::ChangeTracker;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CellFilteringParams {
    pub use_rna: bool,
    pub use_adt: bool,
    pub use_crispr: bool,
}

impl CellFilteringParams {
    pub fn defaults() -> Self {
        CellFilteringParams {
            use_rna: true,
            use_adt: true,
            use_crispr: true,
        }
    }
}

/// One QC state's contribution: whether it's `valid()`, whether the driver
/// enabled it via `use_*`, its `changed`, and its discard vector.
pub struct QcContribution<'a> {
    pub enabled: bool,
    pub valid: bool,
    pub changed: bool,
    pub discard: &'a DiscardVector,
}

pub struct CellFiltering {
    tracker: ChangeTracker<CellFilteringParams>,
    changed: bool,
    pooled_discard: DiscardVector,
    filtered_matrices: MultiMatrix,
    filtered_block: Option<BlockFactor>,
    keep_indices: Vec<u32>,
}

impl CellFiltering {
    pub fn new() -> Self {
        CellFiltering {
            tracker: ChangeTracker::new(),
            changed: false,
            pooled_discard: Vec::new(),
            filtered_matrices: MultiMatrix::new(),
            filtered_block: None,
            keep_indices: Vec::new(),
        }
    }

    pub fn defaults() -> CellFilteringParams {
        CellFilteringParams::defaults()
    }

    pub fn compute(
        &mut self,
        matrices: &MultiMatrix,
        block: Option<&BlockFactor>,
        qc_states: &[QcContribution<'_>],
        params: &CellFilteringParams,
        inputs_changed: bool,
    ) {
        let any_qc_changed = qc_states.iter().any(|q| q.enabled && q.valid && q.changed);
        let upstream_changed = inputs_changed || any_qc_changed;
        let recompute = self.tracker.update(params, upstream_changed);
        if !recompute {
            self.changed = false;
            return;
        }

        let n_cells = matrices.n_cols().unwrap_or(0);
        let active: Vec<&DiscardVector> = qc_states
            .iter()
            .filter(|q| q.enabled && q.valid)
            .map(|q| q.discard)
            .collect();

        let pooled: DiscardVector = if active.len() == 1 {
            active[0].clone()
        } else if active.is_empty() {
            vec![0u8; n_cells]
        } else {
            (0..n_cells)
                .map(|i| active.iter().any(|d| d[i] != 0) as u8)
                .collect()
        };

        let keep: Vec<u32> = (0..n_cells)
            .filter(|&i| pooled.get(i).copied().unwrap_or(0) == 0)
            .map(|i| i as u32)
            .collect();

        let mut filtered = MultiMatrix::new();
        for modality in matrices.modalities() {
            let matrix: &Matrix = matrices.get(modality).unwrap();
            filtered.insert(modality.to_string(), matrix.select_columns(&keep));
        }

        self.filtered_block = block.map(|b| b.select(&keep));
        self.filtered_matrices = filtered;
        self.pooled_discard = pooled;
        self.keep_indices = keep;
        self.changed = true;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn fetch_discard(&self) -> &DiscardVector {
        &self.pooled_discard
    }

    pub fn fetch_filtered_matrix(&self, modality: &str) -> Option<&Matrix> {
        self.filtered_matrices.get(modality)
    }

    pub fn fetch_filtered_block(&self) -> Option<&BlockFactor> {
        self.filtered_block.as_ref()
    }

    pub fn fetch_filtered_annotations(&self, annotations: &Annotations) -> Annotations {
        annotations.select(&self.keep_indices)
    }

    /// Maps an index on the filtered matrix back to the original cell
    /// coordinate space (spec §4.4 "`undo_filtering`").
    pub fn undo_filtering(&self, index_on_filtered: u32) -> u32 {
        self.keep_indices[index_on_filtered as usize]
    }

    pub fn n_filtered_cells(&self) -> usize {
        self.keep_indices.len()
    }

    pub fn free(&mut self) {
        self.filtered_matrices = MultiMatrix::new();
        self.filtered_block = None;
    }
}

impl Default for CellFiltering {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::matrix::{MatrixStorage, SparseCsc};

    fn toy_matrix(n_cols: usize) -> Matrix {
        let mut m = SparseCsc::<i64>::new(2, n_cols);
        for c in 0..n_cols {
            m.cols[c].push((0, c as i64 + 1));
        }
        Matrix {
            storage: MatrixStorage::SparseCounts(m),
            row_ids: vec![0, 1],
        }
    }

    #[test]
    fn single_valid_qc_aliases_its_discard() {
        let mut matrices = MultiMatrix::new();
        matrices.insert("RNA", toy_matrix(4));
        let discard = vec![0u8, 1, 0, 0];
        let qc = vec![QcContribution {
            enabled: true,
            valid: true,
            changed: true,
            discard: &discard,
        }];

        let mut cf = CellFiltering::new();
        cf.compute(&matrices, None, &qc, &CellFilteringParams::defaults(), true);
        assert_eq!(cf.fetch_discard(), &discard);
        assert_eq!(cf.n_filtered_cells(), 3);
    }

    #[test]
    fn pooled_discard_is_bitwise_or_of_valid_states() {
        let mut matrices = MultiMatrix::new();
        matrices.insert("RNA", toy_matrix(4));
        let d1 = vec![0u8, 1, 0, 0];
        let d2 = vec![0u8, 0, 1, 0];
        let qc = vec![
            QcContribution { enabled: true, valid: true, changed: true, discard: &d1 },
            QcContribution { enabled: true, valid: true, changed: true, discard: &d2 },
        ];

        let mut cf = CellFiltering::new();
        cf.compute(&matrices, None, &qc, &CellFilteringParams::defaults(), true);
        assert_eq!(cf.fetch_discard(), &vec![0u8, 1, 1, 0]);
        assert_eq!(cf.n_filtered_cells(), 2);
    }

    #[test]
    fn undo_filtering_maps_back_to_original_coordinates() {
        let mut matrices = MultiMatrix::new();
        matrices.insert("RNA", toy_matrix(4));
        let discard = vec![0u8, 1, 0, 0];
        let qc = vec![QcContribution { enabled: true, valid: true, changed: true, discard: &discard }];

        let mut cf = CellFiltering::new();
        cf.compute(&matrices, None, &qc, &CellFilteringParams::defaults(), true);
        assert_eq!(cf.undo_filtering(1), 2);
    }
}

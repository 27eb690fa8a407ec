//! Per-modality PCA (spec §4.7, C6). One instance per present modality;
//! RNA additionally accepts an HVG feature mask from `FeatureSelection`,
//! ADT/CRISPR always use every feature.
//!
//! Grounded on `kernels::pca_kernel::compute_pca`, which already implements
//! the Gram-matrix/Jacobi kernel and the `block_method` variants; this step
//! just owns the cache/`changed` contract and the dense-column extraction
//! (optionally masked) that the kernel expects.

use crate::data::matrix::Matrix;
use crate::data::PCResult;
use crate::error::EngineError;
use crate::kernels::pca_kernel::{compute_pca, BlockMethod};
use crate::steps::ChangeTracker;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PcaParams {
    /// `Some(k)` for RNA (select top-`k` HVGs by residual); `None` for
    /// ADT/CRISPR, which always use every feature.
    pub num_hvgs: Option<usize>,
    pub num_pcs: usize,
    pub block_method: BlockMethod,
}

impl PcaParams {
    pub fn defaults_rna() -> Self {
        PcaParams {
            num_hvgs: Some(2000),
            num_pcs: 25,
            block_method: BlockMethod::None,
        }
    }

    pub fn defaults_other() -> Self {
        PcaParams {
            num_hvgs: None,
            num_pcs: 25,
            block_method: BlockMethod::None,
        }
    }
}

/// Translates the legacy `block_method` spellings (spec §4.7, §9): `"weight"`
/// read as `"project"`, `"block"` read as `"regress"`.
pub fn parse_block_method(raw: &str) -> Result<BlockMethod, EngineError> {
    match raw {
        "none" => Ok(BlockMethod::None),
        "regress" | "block" => Ok(BlockMethod::Regress),
        "project" | "weight" => Ok(BlockMethod::Project),
        other => Err(EngineError::invalid_parameter(
            "pca",
            format!("unknown block_method `{other}`"),
        )),
    }
}

pub struct ModalityPca {
    tracker: ChangeTracker<PcaParams>,
    changed: bool,
    valid: bool,
    result: Option<PCResult>,
}

impl ModalityPca {
    pub fn new() -> Self {
        ModalityPca {
            tracker: ChangeTracker::new(),
            changed: false,
            valid: false,
            result: None,
        }
    }

    pub fn defaults_rna() -> PcaParams {
        PcaParams::defaults_rna()
    }

    pub fn defaults_other() -> PcaParams {
        PcaParams::defaults_other()
    }

    /// `feature_mask`, when given, is indexed by row; `true`/absent-entry
    /// means "keep". Only RNA passes one (the HVG mask).
    pub fn compute(
        &mut self,
        matrix: Option<&Matrix>,
        feature_mask: Option<&[bool]>,
        block_indices: Option<&[u32]>,
        params: &PcaParams,
        upstream_changed: bool,
    ) {
        let recompute = self.tracker.update(params, upstream_changed);
        self.valid = matrix.is_some();
        if !recompute || !self.valid {
            self.changed = recompute && self.valid;
            return;
        }
        let matrix = matrix.unwrap();
        let n_cells = matrix.n_cols();
        let n_rows = matrix.n_rows();

        let keep_rows: Vec<usize> = match feature_mask {
            Some(mask) => (0..n_rows).filter(|&r| mask.get(r).copied().unwrap_or(true)).collect(),
            None => (0..n_rows).collect(),
        };

        let columns: Vec<Vec<f32>> = (0..n_cells)
            .map(|c| {
                let dense = matrix.dense_column(c);
                keep_rows.iter().map(|&r| dense[r]).collect()
            })
            .collect();

        let num_pcs = params.num_pcs.min(n_cells.saturating_sub(1).max(1)).max(1);
        let out = compute_pca(&columns, num_pcs, block_indices, params.block_method);
        let num_pcs_out = out.scores.len();

        let mut data = Vec::with_capacity(num_pcs_out * n_cells);
        for component in &out.scores {
            data.extend_from_slice(component);
        }

        self.result = Some(PCResult {
            num_pcs: num_pcs_out,
            num_cells: n_cells,
            data,
            variance_explained: out.variance_explained,
        });
        self.changed = true;
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

impl Default for ModalityPca {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::matrix::{DenseColMajor, MatrixStorage};

    fn toy_matrix(n_rows: usize, n_cols: usize) -> Matrix {
        let cols: Vec<Vec<f32>> = (0..n_cols)
            .map(|c| (0..n_rows).map(|r| (r + c) as f32).collect())
            .collect();
        Matrix {
            storage: MatrixStorage::DenseLogNormalized(DenseColMajor { n_rows, n_cols, cols }),
            row_ids: (0..n_rows as u32).collect(),
        }
    }

    #[test]
    fn invalid_when_modality_absent() {
        let mut pca = ModalityPca::new();
        pca.compute(None, None, None, &PcaParams::defaults_other(), true);
        assert!(!pca.valid());
    }

    #[test]
    fn feature_mask_restricts_rows_used() {
        let matrix = toy_matrix(6, 8);
        let mask = vec![true, false, true, false, true, false];
        let mut pca = ModalityPca::new();
        let params = PcaParams { num_hvgs: Some(3), num_pcs: 2, block_method: BlockMethod::None };
        pca.compute(Some(&matrix), Some(&mask), None, &params, true);
        assert!(pca.changed());
        let result = pca.fetch_result().unwrap();
        assert_eq!(result.num_cells, 8);
        assert!(result.num_pcs <= 2);
    }

    #[test]
    fn legacy_block_method_aliases_translate() {
        assert_eq!(parse_block_method("weight").unwrap(), BlockMethod::Project);
        assert_eq!(parse_block_method("block").unwrap(), BlockMethod::Regress);
        assert_eq!(parse_block_method("none").unwrap(), BlockMethod::None);
        assert!(parse_block_method("bogus").is_err());
    }
}

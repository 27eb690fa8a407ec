//! BatchCorrection (spec §4.9, C8): optionally runs MNN correction over the
//! combined embedding; otherwise exposes a view of the uncorrected input.
//!
//! Grounded on `kernels::mnn_kernel::mnn_correct`; this step owns the
//! cache/`changed` contract and the `method`/block-presence gating spec
//! §4.9 describes ("downstream NeighborIndex uses the corrected embedding
//! unconditionally" — i.e. callers never branch on `method`, they just read
//! `fetch_result`).

use crate::data::block::BlockFactor;
use crate::data::PCResult;
use crate::steps::ChangeTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchCorrectionMethod {
    None,
    Mnn,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchCorrectionParams {
    pub method: BatchCorrectionMethod,
    pub num_neighbors: usize,
    pub approximate: bool,
}

impl Default for BatchCorrectionParams {
    fn default() -> Self {
        BatchCorrectionParams {
            method: BatchCorrectionMethod::None,
            num_neighbors: 15,
            approximate: false,
        }
    }
}

pub struct BatchCorrection {
    tracker: ChangeTracker<BatchCorrectionParams>,
    changed: bool,
    valid: bool,
    result: Option<PCResult>,
}

impl BatchCorrection {
    pub fn new() -> Self {
        BatchCorrection {
            tracker: ChangeTracker::new(),
            changed: false,
            valid: false,
            result: None,
        }
    }

    pub fn defaults() -> BatchCorrectionParams {
        BatchCorrectionParams::default()
    }

    pub fn compute(
        &mut self,
        combined: Option<&PCResult>,
        block: Option<&BlockFactor>,
        params: &BatchCorrectionParams,
        upstream_changed: bool,
    ) {
        let recompute = self.tracker.update(params, upstream_changed);
        self.valid = combined.is_some();
        if !recompute || !self.valid {
            self.changed = recompute && self.valid;
            return;
        }
        let combined = combined.unwrap();

        let run_mnn = matches!(params.method, BatchCorrectionMethod::Mnn) && block.is_some();
        if !run_mnn {
            self.result = Some(combined.clone());
            self.changed = true;
            return;
        }

        let block = block.unwrap();
        let points: Vec<Vec<f32>> = (0..combined.num_cells).map(|c| combined.cell(c)).collect();
        let corrected = crate::kernels::mnn_kernel::mnn_correct(&points, &block.indices, params.num_neighbors);

        let n_cells = combined.num_cells;
        let num_pcs = combined.num_pcs;
        let mut data = vec![0.0f32; num_pcs * n_cells];
        for (c, point) in corrected.iter().enumerate() {
            for (p, &v) in point.iter().enumerate() {
                data[p * n_cells + c] = v;
            }
        }

        self.result = Some(PCResult {
            num_pcs,
            num_cells: n_cells,
            data,
            variance_explained: combined.variance_explained.clone(),
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

impl Default for BatchCorrection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_pc(num_cells: usize) -> PCResult {
        let data: Vec<f32> = (0..num_cells).map(|c| c as f32).collect();
        PCResult { num_pcs: 1, num_cells, data, variance_explained: vec![1.0] }
    }

    #[test]
    fn none_method_is_a_passthrough_view() {
        let pc = toy_pc(4);
        let mut bc = BatchCorrection::new();
        bc.compute(Some(&pc), None, &BatchCorrectionParams::default(), true);
        assert_eq!(bc.fetch_result().unwrap().data, pc.data);
    }

    #[test]
    fn mnn_without_block_falls_back_to_passthrough() {
        let pc = toy_pc(4);
        let params = BatchCorrectionParams { method: BatchCorrectionMethod::Mnn, ..BatchCorrectionParams::default() };
        let mut bc = BatchCorrection::new();
        bc.compute(Some(&pc), None, &params, true);
        assert_eq!(bc.fetch_result().unwrap().data, pc.data);
    }

    #[test]
    fn mnn_with_block_runs_correction() {
        let pc = toy_pc(4);
        let block = BlockFactor { levels: vec!["a".into(), "b".into()], indices: vec![0, 0, 1, 1] };
        let params = BatchCorrectionParams { method: BatchCorrectionMethod::Mnn, num_neighbors: 1, approximate: false };
        let mut bc = BatchCorrection::new();
        bc.compute(Some(&pc), Some(&block), &params, true);
        assert!(bc.valid());
        assert_eq!(bc.fetch_result().unwrap().num_cells, 4);
    }
}

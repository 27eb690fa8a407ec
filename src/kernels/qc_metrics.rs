//! Per-cell QC metric computation and per-block MAD-based thresholding
//! (spec §4.3).

use rayon::prelude::*;

/// Median of a slice (copies and sorts; callers pass small per-block
/// slices so this is not a hot-path concern).
pub fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        0.5 * (sorted[mid - 1] + sorted[mid])
    } else {
        sorted[mid]
    }
}

/// Median absolute deviation, scaled by the usual 1.4826 constant so it is
/// comparable to a standard deviation under normality.
pub fn mad(values: &[f32], med: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let deviations: Vec<f32> = values.iter().map(|&v| (v - med).abs()).collect();
    1.4826 * median(&deviations)
}

/// A lower and/or upper bound derived from `n_mads` median absolute
/// deviations, applied only on the requested side(s).
#[derive(Debug, Clone, Copy)]
pub struct MadBound {
    pub lower: Option<f32>,
    pub upper: Option<f32>,
}

/// Computes a low-tail, high-tail, or two-sided MAD bound over one block's
/// worth of a metric (spec §4.3 "n median absolute deviations below/above
/// the median").
pub fn mad_bound(values: &[f32], n_mads: f32, low: bool, high: bool) -> MadBound {
    let med = median(values);
    let spread = mad(values, med);
    MadBound {
        lower: low.then_some(med - n_mads * spread),
        upper: high.then_some(med + n_mads * spread),
    }
}

/// Per-cell library-size sum and number of detected features, computed in
/// parallel over columns — the common metric pair shared by all three
/// modality QC policies (spec §4.3).
pub fn sums_and_detected<F>(n_cells: usize, column_sum: F, column_nnz: impl Fn(usize) -> usize + Sync) -> (Vec<f32>, Vec<u32>)
where
    F: Fn(usize) -> f64 + Sync,
{
    let sums: Vec<f32> = (0..n_cells)
        .into_par_iter()
        .map(|c| column_sum(c) as f32)
        .collect();
    let detected: Vec<u32> = (0..n_cells)
        .into_par_iter()
        .map(|c| column_nnz(c) as u32)
        .collect();
    (sums, detected)
}

/// Splits a per-cell metric vector by block index, for per-block MAD
/// thresholding.
pub fn split_by_block(values: &[f32], block_indices: &[u32], n_blocks: usize) -> Vec<Vec<f32>> {
    let mut out = vec![Vec::new(); n_blocks.max(1)];
    for (i, &v) in values.iter().enumerate() {
        let b = block_indices.get(i).copied().unwrap_or(0) as usize;
        out[b].push(v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_of_odd_and_even_length() {
        assert_eq!(median(&[1.0, 3.0, 2.0]), 2.0);
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
    }

    #[test]
    fn mad_bound_respects_requested_sides() {
        let values = [10.0, 11.0, 9.0, 10.0, 50.0];
        let bound = mad_bound(&values, 3.0, true, false);
        assert!(bound.lower.is_some());
        assert!(bound.upper.is_none());
    }

    #[test]
    fn split_by_block_groups_values() {
        let values = [1.0, 2.0, 3.0, 4.0];
        let blocks = [0u32, 1, 0, 1];
        let grouped = split_by_block(&values, &blocks, 2);
        assert_eq!(grouped[0], vec![1.0, 3.0]);
        assert_eq!(grouped[1], vec![2.0, 4.0]);
    }
}

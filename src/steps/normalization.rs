//! Per-modality normalization (spec §4.5, C4).
//!
//! RNA and CRISPR are straightforward library-size-factor log-normalization.
//! ADT runs the nested sub-pipeline spec §9's open question resolves:
//! log-normalize on library size, PCA it, k-means cluster the PCs, then
//! recompute grouped-median-ratio size factors from the *log-normalized*
//! matrix using those cluster labels (see DESIGN.md for why not the raw
//! counts or a stray `partial` buffer).

use crate::data::matrix::{DenseColMajor, Matrix, MatrixStorage};
use crate::data::SizeFactors;
use crate::kernels::kmeans_kernel::kmeans;
use crate::kernels::pca_kernel::{compute_pca, BlockMethod};
use crate::steps::ChangeTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NoParams;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdtNormalizationParams {
    pub num_pcs: usize,
    pub num_clusters: usize,
}

impl Default for AdtNormalizationParams {
    fn default() -> Self {
        AdtNormalizationParams {
            num_pcs: 25,
            num_clusters: 10,
        }
    }
}

/// Library-size log-normalization shared by RNA and CRISPR (spec §4.5):
/// `log1p(count / size_factor * mean(size_factor))`.
fn library_size_normalize(matrix: &Matrix, size_factors: &SizeFactors) -> DenseColMajor {
    let n_rows = matrix.n_rows();
    let n_cols = matrix.n_cols();
    let mean_sf: f64 = if size_factors.is_empty() {
        1.0
    } else {
        size_factors.0.iter().map(|&v| v as f64).sum::<f64>() / size_factors.len() as f64
    };

    let cols: Vec<Vec<f32>> = (0..n_cols)
        .map(|c| {
            let sf = size_factors.0.get(c).copied().unwrap_or(1.0) as f64;
            let scale = if sf > 0.0 { mean_sf / sf } else { 0.0 };
            let dense = matrix.dense_column(c);
            dense
                .iter()
                .map(|&v| ((v as f64 * scale) + 1.0).ln() as f32)
                .collect()
        })
        .collect();

    DenseColMajor { n_rows, n_cols, cols }
}

pub struct RnaNormalization {
    tracker: ChangeTracker<NoParams>,
    changed: bool,
    valid: bool,
    size_factors: SizeFactors,
    normalized: Option<Matrix>,
}

impl RnaNormalization {
    pub fn new() -> Self {
        RnaNormalization {
            tracker: ChangeTracker::new(),
            changed: false,
            valid: false,
            size_factors: SizeFactors::default(),
            normalized: None,
        }
    }

    pub fn defaults() -> NoParams {
        NoParams
    }

    pub fn compute(&mut self, matrix: Option<&Matrix>, upstream_changed: bool) {
        let recompute = self.tracker.update(&NoParams, upstream_changed);
        self.valid = matrix.is_some();
        if !recompute || !self.valid {
            self.changed = recompute && self.valid;
            return;
        }
        let matrix = matrix.unwrap();
        let size_factors: Vec<f32> = (0..matrix.n_cols()).map(|c| matrix.column_sum(c) as f32).collect();
        let size_factors = SizeFactors(size_factors);
        let dense = library_size_normalize(matrix, &size_factors);

        self.size_factors = size_factors;
        self.normalized = Some(Matrix {
            storage: MatrixStorage::DenseLogNormalized(dense),
            row_ids: matrix.row_ids.clone(),
        });
        self.changed = true;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn fetch_size_factors(&self) -> &SizeFactors {
        &self.size_factors
    }

    pub fn fetch_normalized(&self) -> Option<&Matrix> {
        self.normalized.as_ref()
    }

    pub fn free(&mut self) {
        self.normalized = None;
        self.size_factors = SizeFactors::default();
    }
}

impl Default for RnaNormalization {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CrisprNormalization {
    inner: RnaNormalization,
}

impl CrisprNormalization {
    pub fn new() -> Self {
        CrisprNormalization { inner: RnaNormalization::new() }
    }

    pub fn defaults() -> NoParams {
        NoParams
    }

    /// Size factors are allowed to be zero (spec §4.5 "allow zero totals;
    /// log-normalization treats them specially"): a zero-sum guide-count
    /// column simply maps to all-zero log-normalized values rather than
    /// dividing by zero, which `library_size_normalize`'s `scale = 0.0`
    /// fallback already produces.
    pub fn compute(&mut self, matrix: Option<&Matrix>, upstream_changed: bool) {
        self.inner.compute(matrix, upstream_changed);
    }

    pub fn changed(&self) -> bool {
        self.inner.changed()
    }

    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    pub fn fetch_size_factors(&self) -> &SizeFactors {
        self.inner.fetch_size_factors()
    }

    pub fn fetch_normalized(&self) -> Option<&Matrix> {
        self.inner.fetch_normalized()
    }

    pub fn free(&mut self) {
        self.inner.free();
    }
}

impl Default for CrisprNormalization {
    fn default() -> Self {
        Self::new()
    }
}

pub struct AdtNormalization {
    tracker: ChangeTracker<AdtNormalizationParams>,
    changed: bool,
    valid: bool,
    size_factors: SizeFactors,
    normalized: Option<Matrix>,
}

impl AdtNormalization {
    pub fn new() -> Self {
        AdtNormalization {
            tracker: ChangeTracker::new(),
            changed: false,
            valid: false,
            size_factors: SizeFactors::default(),
            normalized: None,
        }
    }

    pub fn defaults() -> AdtNormalizationParams {
        AdtNormalizationParams::default()
    }

    pub fn compute(
        &mut self,
        matrix: Option<&Matrix>,
        block_indices: Option<&[u32]>,
        params: &AdtNormalizationParams,
        upstream_changed: bool,
    ) {
        let recompute = self.tracker.update(params, upstream_changed);
        self.valid = matrix.is_some();
        if !recompute || !self.valid {
            self.changed = recompute && self.valid;
            return;
        }
        let matrix = matrix.unwrap();
        let n_cols = matrix.n_cols();

        // Inner sub-pipeline: log-normalize on library size first, as a
        // scratch representation to drive PCA/clustering only.
        let library_sf = SizeFactors((0..n_cols).map(|c| matrix.column_sum(c) as f32).collect());
        let scratch = library_size_normalize(matrix, &library_sf);

        let num_pcs = params.num_pcs.min(matrix.n_rows().saturating_sub(1).max(1)).min(25).max(1);
        let pca = compute_pca(&scratch.cols, num_pcs, None, BlockMethod::None);
        let points: Vec<Vec<f32>> = (0..n_cols).map(|c| pca.scores.iter().map(|comp| comp[c]).collect()).collect();

        let kmeans_result = kmeans(&points, params.num_clusters.max(1), 50);

        // Grouped-median-ratio size factors computed from the log-normalized
        // matrix (`scratch`), using the k-means cluster labels (spec §9
        // open question resolution — see DESIGN.md).
        let size_factors = grouped_median_ratio_size_factors(&scratch, &kmeans_result.assignments, block_indices);

        let dense = library_size_normalize(matrix, &size_factors);
        self.size_factors = size_factors;
        self.normalized = Some(Matrix {
            storage: MatrixStorage::DenseLogNormalized(dense),
            row_ids: matrix.row_ids.clone(),
        });
        self.changed = true;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn fetch_size_factors(&self) -> &SizeFactors {
        &self.size_factors
    }

    pub fn fetch_normalized(&self) -> Option<&Matrix> {
        self.normalized.as_ref()
    }

    pub fn free(&mut self) {
        self.normalized = None;
        self.size_factors = SizeFactors::default();
    }
}

impl Default for AdtNormalization {
    fn default() -> Self {
        Self::new()
    }
}

/// For each (cluster, block) group, the reference profile is the per-row
/// median of `scratch` within the group; a cell's size factor is the
/// median ratio of its own column to that reference, following the
/// deconvolution-style grouped size factor convention.
fn grouped_median_ratio_size_factors(
    scratch: &DenseColMajor,
    cluster: &[u32],
    block_indices: Option<&[u32]>,
) -> SizeFactors {
    let n_cells = scratch.n_cols;
    let default_block = vec![0u32; n_cells];
    let blocks = block_indices.unwrap_or(&default_block);

    // Grouping directly on the (cluster, block) values present in the
    // data needs no separate cluster/block count.
    let mut groups: std::collections::BTreeMap<(u32, u32), Vec<usize>> = std::collections::BTreeMap::new();
    for c in 0..n_cells {
        groups
            .entry((cluster[c], blocks.get(c).copied().unwrap_or(0)))
            .or_default()
            .push(c);
    }

    let mut size_factors = vec![1.0f32; n_cells];
    for members in groups.values() {
        if members.is_empty() {
            continue;
        }
        let reference: Vec<f32> = (0..scratch.n_rows)
            .map(|r| {
                let mut values: Vec<f32> = members.iter().map(|&c| scratch.cols[c][r]).collect();
                values.sort_by(|a, b| a.partial_cmp(b).unwrap());
                values[values.len() / 2]
            })
            .collect();

        for &c in members {
            let mut ratios: Vec<f32> = (0..scratch.n_rows)
                .filter(|&r| reference[r] > 0.0)
                .map(|r| scratch.cols[c][r] / reference[r])
                .collect();
            if ratios.is_empty() {
                continue;
            }
            ratios.sort_by(|a, b| a.partial_cmp(b).unwrap());
            size_factors[c] = ratios[ratios.len() / 2];
        }
    }
    SizeFactors(size_factors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::matrix::SparseCsc;

    fn toy_matrix(n_rows: usize, n_cols: usize) -> Matrix {
        let mut m = SparseCsc::<i64>::new(n_rows, n_cols);
        for c in 0..n_cols {
            for r in 0..n_rows {
                m.cols[c].push((r as u32, (c + r + 1) as i64));
            }
        }
        Matrix {
            storage: MatrixStorage::SparseCounts(m),
            row_ids: (0..n_rows as u32).collect(),
        }
    }

    #[test]
    fn rna_normalization_produces_dense_log_normalized_matrix() {
        let matrix = toy_matrix(3, 5);
        let mut norm = RnaNormalization::new();
        norm.compute(Some(&matrix), true);
        assert!(norm.changed());
        let out = norm.fetch_normalized().unwrap();
        assert_eq!(out.n_cols(), 5);
        assert_eq!(norm.fetch_size_factors().len(), 5);
    }

    #[test]
    fn crispr_normalization_handles_zero_sum_column() {
        let mut m = SparseCsc::<i64>::new(2, 2);
        m.cols[0].push((0, 5));
        let matrix = Matrix { storage: MatrixStorage::SparseCounts(m), row_ids: vec![0, 1] };
        let mut norm = CrisprNormalization::new();
        norm.compute(Some(&matrix), true);
        assert!(norm.changed());
        let out = norm.fetch_normalized().unwrap();
        let col1 = out.dense_column(1);
        assert!(col1.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn adt_normalization_is_valid_absent_when_no_matrix() {
        let mut norm = AdtNormalization::new();
        norm.compute(None, None, &AdtNormalizationParams::default(), true);
        assert!(!norm.valid());
    }
}

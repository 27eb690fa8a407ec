//! FeatureSelection (RNA only, spec §4.6, C5): fits a mean-variance trend
//! over the normalized matrix and exposes per-feature residuals. Consumers
//! (RNA PCA) pick the top-k highly variable genes by thresholding the
//! residual against its own k-th largest value.
//!
//! Grounded on the per-feature rayon-parallel reduction shape already used
//! by `kernels::qc_metrics::sums_and_detected`; the trend itself is a
//! windowed-median local regression over features sorted by mean, since
//! neither pack carries a `loess` crate.

use rayon::prelude::*;

use crate::data::matrix::Matrix;
use crate::steps::ChangeTracker;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureSelectionParams {
    pub span: f64,
}

impl Default for FeatureSelectionParams {
    fn default() -> Self {
        FeatureSelectionParams { span: 0.3 }
    }
}

pub struct FeatureSelection {
    tracker: ChangeTracker<FeatureSelectionParams>,
    changed: bool,
    valid: bool,
    residuals: Vec<f32>,
    sorted_residuals: Vec<f32>,
}

impl FeatureSelection {
    pub fn new() -> Self {
        FeatureSelection {
            tracker: ChangeTracker::new(),
            changed: false,
            valid: false,
            residuals: Vec::new(),
            sorted_residuals: Vec::new(),
        }
    }

    pub fn defaults() -> FeatureSelectionParams {
        FeatureSelectionParams::default()
    }

    pub fn compute(&mut self, matrix: Option<&Matrix>, params: &FeatureSelectionParams, upstream_changed: bool) {
        let recompute = self.tracker.update(params, upstream_changed);
        self.valid = matrix.is_some();
        if !recompute || !self.valid {
            self.changed = recompute && self.valid;
            return;
        }
        let matrix = matrix.unwrap();
        let n_rows = matrix.n_rows();
        let n_cols = matrix.n_cols();
        let dense: Vec<Vec<f32>> = (0..n_cols).map(|c| matrix.dense_column(c)).collect();

        let (means, variances): (Vec<f64>, Vec<f64>) = (0..n_rows)
            .into_par_iter()
            .map(|r| {
                let mut sum = 0.0f64;
                let mut sum_sq = 0.0f64;
                for col in &dense {
                    let v = col[r] as f64;
                    sum += v;
                    sum_sq += v * v;
                }
                let n = n_cols.max(1) as f64;
                let mean = sum / n;
                let var = if n_cols > 1 {
                    (sum_sq - n * mean * mean) / (n - 1.0)
                } else {
                    0.0
                };
                (mean, var)
            })
            .unzip();

        let trend = fit_mean_variance_trend(&means, &variances, params.span);
        let residuals: Vec<f32> = variances.iter().zip(trend.iter()).map(|(v, t)| (v - t) as f32).collect();
        let mut sorted_residuals = residuals.clone();
        sorted_residuals.sort_by(|a, b| b.partial_cmp(a).unwrap());

        self.residuals = residuals;
        self.sorted_residuals = sorted_residuals;
        self.changed = true;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn fetch_residuals(&self) -> &[f32] {
        &self.residuals
    }

    pub fn fetch_sorted_residuals(&self) -> &[f32] {
        &self.sorted_residuals
    }

    /// Mask of features whose residual is at or above the k-th largest
    /// residual (spec §4.6); ties above the cutoff are included, so the
    /// mask may select more than `k` features.
    pub fn top_k_mask(&self, k: usize) -> Vec<bool> {
        if self.residuals.is_empty() || k == 0 {
            return vec![false; self.residuals.len()];
        }
        let k = k.min(self.sorted_residuals.len());
        let threshold = self.sorted_residuals[k - 1];
        self.residuals.iter().map(|&r| r >= threshold).collect()
    }

    pub fn free(&mut self) {
        self.residuals = Vec::new();
        self.sorted_residuals = Vec::new();
    }
}

impl Default for FeatureSelection {
    fn default() -> Self {
        Self::new()
    }
}

fn fit_mean_variance_trend(means: &[f64], variances: &[f64], span: f64) -> Vec<f64> {
    let n = means.len();
    if n == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| means[a].partial_cmp(&means[b]).unwrap());

    let half_window = ((span * n as f64 / 2.0).round() as usize).max(1);
    let mut trend = vec![0.0f64; n];
    for (rank, &idx) in order.iter().enumerate() {
        let lo = rank.saturating_sub(half_window);
        let hi = (rank + half_window).min(n - 1);
        let mut window: Vec<f64> = order[lo..=hi].iter().map(|&j| variances[j]).collect();
        window.sort_by(|a, b| a.partial_cmp(b).unwrap());
        trend[idx] = window[window.len() / 2];
    }
    trend
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::matrix::{DenseColMajor, MatrixStorage};

    fn toy_matrix(n_rows: usize, n_cols: usize) -> Matrix {
        let cols: Vec<Vec<f32>> = (0..n_cols)
            .map(|c| (0..n_rows).map(|r| if r == 0 { (c * c) as f32 } else { 1.0 }).collect())
            .collect();
        Matrix {
            storage: MatrixStorage::DenseLogNormalized(DenseColMajor { n_rows, n_cols, cols }),
            row_ids: (0..n_rows as u32).collect(),
        }
    }

    #[test]
    fn high_variance_feature_gets_largest_residual() {
        let matrix = toy_matrix(4, 6);
        let mut fs = FeatureSelection::new();
        fs.compute(Some(&matrix), &FeatureSelectionParams::default(), true);
        assert!(fs.changed());
        let residuals = fs.fetch_residuals();
        let max_idx = (0..residuals.len()).max_by(|&a, &b| residuals[a].partial_cmp(&residuals[b]).unwrap()).unwrap();
        assert_eq!(max_idx, 0);
    }

    #[test]
    fn top_k_mask_selects_exactly_k_without_ties() {
        let matrix = toy_matrix(4, 6);
        let mut fs = FeatureSelection::new();
        fs.compute(Some(&matrix), &FeatureSelectionParams::default(), true);
        let mask = fs.top_k_mask(1);
        assert_eq!(mask.iter().filter(|&&b| b).count(), 1);
        assert!(mask[0]);
    }

    #[test]
    fn invalid_when_matrix_absent() {
        let mut fs = FeatureSelection::new();
        fs.compute(None, &FeatureSelectionParams::default(), true);
        assert!(!fs.valid());
    }
}

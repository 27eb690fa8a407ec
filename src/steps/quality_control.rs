//! Per-modality quality control (spec §4.3, C2). One `QualityControl`
//! instance per modality (RNA/ADT/CRISPR), parameterized by a `Policy` that
//! encodes which metrics and threshold rules apply.
//!
//! Grounded on the teacher's `pipeline::stage1_qc` metric-then-threshold
//! shape, generalized to three policies and driven by `kernels::qc_metrics`.

use crate::data::matrix::Matrix;
use crate::data::{DiscardVector, QCColumn, QCMetrics, QCThresholds};
use crate::kernels::qc_metrics::{mad_bound, median, split_by_block};
use crate::steps::ChangeTracker;

#[derive(Debug, Clone, PartialEq)]
pub struct RnaParams {
    pub use_mito_default: bool,
    pub mito_prefix: String,
    pub nmads: f64,
}

impl Default for RnaParams {
    fn default() -> Self {
        RnaParams {
            use_mito_default: true,
            mito_prefix: "MT-".to_string(),
            nmads: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdtParams {
    pub igg_prefix: String,
    pub nmads: f64,
    pub min_detected_drop: f64,
}

impl Default for AdtParams {
    fn default() -> Self {
        AdtParams {
            igg_prefix: "IGG".to_string(),
            nmads: 3.0,
            min_detected_drop: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrisprParams {
    pub nmads: f64,
}

impl Default for CrisprParams {
    fn default() -> Self {
        CrisprParams { nmads: 3.0 }
    }
}

/// Default embedded mitochondrial gene symbols (human/mouse), used when
/// `use_mito_default` is set and no prefix override is supplied.
const DEFAULT_MITO_SYMBOLS: &[&str] = &[
    "ND1", "ND2", "ND3", "ND4", "ND4L", "ND5", "ND6", "CYTB", "COX1", "COX2", "COX3", "ATP6",
    "ATP8",
];

pub struct RnaQualityControl {
    tracker: ChangeTracker<RnaParams>,
    changed: bool,
    valid: bool,
    metrics: QCMetrics,
    thresholds: QCThresholds,
    discard: DiscardVector,
}

impl RnaQualityControl {
    pub fn new() -> Self {
        RnaQualityControl {
            tracker: ChangeTracker::new(),
            changed: false,
            valid: false,
            metrics: QCMetrics::default(),
            thresholds: QCThresholds::default(),
            discard: Vec::new(),
        }
    }

    pub fn defaults() -> RnaParams {
        RnaParams::default()
    }

    pub fn compute(
        &mut self,
        matrix: Option<&Matrix>,
        symbols: Option<&[String]>,
        block_indices: Option<&[u32]>,
        n_blocks: usize,
        params: &RnaParams,
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

        let (sums, detected) = crate::kernels::qc_metrics::sums_and_detected(n_cells, |c| {
            matrix.column_sum(c)
        }, |c| matrix.column_nnz(c));

        let mito_rows: Vec<usize> = if let Some(symbols) = symbols {
            symbols
                .iter()
                .enumerate()
                .filter(|(_, s)| is_mito(s, params))
                .map(|(i, _)| i)
                .collect()
        } else {
            Vec::new()
        };
        let mito_sums: Vec<f64> = (0..n_cells)
            .map(|c| {
                mito_rows
                    .iter()
                    .map(|&r| matrix.dense_column(c).get(r).copied().unwrap_or(0.0) as f64)
                    .sum()
            })
            .collect();
        let mito_proportion: Vec<f32> = mito_sums
            .iter()
            .zip(sums.iter())
            .map(|(&m, &s)| if s > 0.0 { (m / s as f64) as f32 } else { 0.0 })
            .collect();

        let (discard, thresholds) =
            threshold_rna(&sums, &detected, &mito_proportion, block_indices, n_blocks, params);

        self.metrics = QCMetrics {
            columns: vec![
                ("sums", QCColumn::Float(sums.iter().map(|&v| v as f32).collect())),
                ("detected", QCColumn::Int(detected.iter().map(|&v| v as u32).collect())),
                ("mito_proportion", QCColumn::Float(mito_proportion)),
            ],
        };
        self.thresholds = thresholds;
        self.discard = discard;
        self.changed = true;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn fetch_metrics(&self) -> &QCMetrics {
        &self.metrics
    }

    pub fn fetch_thresholds(&self) -> &QCThresholds {
        &self.thresholds
    }

    pub fn fetch_discard(&self) -> &DiscardVector {
        &self.discard
    }

    pub fn free(&mut self) {
        self.metrics = QCMetrics::default();
        self.thresholds = QCThresholds::default();
        self.discard = Vec::new();
    }
}

impl Default for RnaQualityControl {
    fn default() -> Self {
        Self::new()
    }
}

fn is_mito(symbol: &str, params: &RnaParams) -> bool {
    if params.use_mito_default {
        DEFAULT_MITO_SYMBOLS
            .iter()
            .any(|m| symbol.eq_ignore_ascii_case(m))
    } else {
        symbol
            .to_ascii_uppercase()
            .starts_with(&params.mito_prefix.to_ascii_uppercase())
    }
}

fn threshold_rna(
    sums: &[f32],
    detected: &[u32],
    mito_proportion: &[f32],
    block_indices: Option<&[u32]>,
    n_blocks: usize,
    params: &RnaParams,
) -> (DiscardVector, QCThresholds) {
    let n = sums.len();
    let detected_f32: Vec<f32> = detected.iter().map(|&v| v as f32).collect();

    let (low_sums, sums_bounds) = low_tail_discard(sums, block_indices, n_blocks, params.nmads);
    let (low_detected, detected_bounds) = low_tail_discard(&detected_f32, block_indices, n_blocks, params.nmads);
    let (high_mito, mito_bounds) = high_tail_discard(mito_proportion, block_indices, n_blocks, params.nmads);

    let discard = (0..n)
        .map(|i| (low_sums[i] != 0 || low_detected[i] != 0 || high_mito[i] != 0) as u8)
        .collect();
    let thresholds = QCThresholds {
        bounds: vec![
            ("sums", sums_bounds),
            ("detected", detected_bounds),
            ("mito_proportion", mito_bounds),
        ],
    };
    (discard, thresholds)
}

fn low_tail_discard(
    values: &[f32],
    block_indices: Option<&[u32]>,
    n_blocks: usize,
    nmads: f64,
) -> (DiscardVector, Vec<(Option<f32>, Option<f32>)>) {
    tail_discard(values, block_indices, n_blocks, nmads, true, false)
}

fn high_tail_discard(
    values: &[f32],
    block_indices: Option<&[u32]>,
    n_blocks: usize,
    nmads: f64,
) -> (DiscardVector, Vec<(Option<f32>, Option<f32>)>) {
    tail_discard(values, block_indices, n_blocks, nmads, false, true)
}

fn tail_discard(
    values: &[f32],
    block_indices: Option<&[u32]>,
    n_blocks: usize,
    nmads: f64,
    low: bool,
    high: bool,
) -> (DiscardVector, Vec<(Option<f32>, Option<f32>)>) {
    let n = values.len();
    let default_block = vec![0u32; n];
    let blocks = block_indices.unwrap_or(&default_block);
    let n_blocks = n_blocks.max(1);
    let groups = split_by_block(values, blocks, n_blocks);

    let bounds_per_block: Vec<_> = groups
        .iter()
        .map(|g| mad_bound(g, nmads as f32, low, high))
        .collect();

    let discard = (0..n)
        .map(|i| {
            let b = blocks[i] as usize;
            let bound = &bounds_per_block[b.min(bounds_per_block.len().saturating_sub(1))];
            let v = values[i];
            let below = bound.lower.is_some_and(|lo| v < lo);
            let above = bound.upper.is_some_and(|hi| v > hi);
            (below || above) as u8
        })
        .collect();
    let bounds: Vec<(Option<f32>, Option<f32>)> =
        bounds_per_block.iter().map(|b| (b.lower, b.upper)).collect();
    (discard, bounds)
}

pub struct AdtQualityControl {
    tracker: ChangeTracker<AdtParams>,
    changed: bool,
    valid: bool,
    metrics: QCMetrics,
    thresholds: QCThresholds,
    discard: DiscardVector,
}

impl AdtQualityControl {
    pub fn new() -> Self {
        AdtQualityControl {
            tracker: ChangeTracker::new(),
            changed: false,
            valid: false,
            metrics: QCMetrics::default(),
            thresholds: QCThresholds::default(),
            discard: Vec::new(),
        }
    }

    pub fn defaults() -> AdtParams {
        AdtParams::default()
    }

    pub fn compute(
        &mut self,
        matrix: Option<&Matrix>,
        ids: Option<&[String]>,
        block_indices: Option<&[u32]>,
        n_blocks: usize,
        params: &AdtParams,
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

        let (sums, detected) =
            crate::kernels::qc_metrics::sums_and_detected(n_cells, |c| matrix.column_sum(c), |c| matrix.column_nnz(c));

        let igg_rows: Vec<usize> = ids
            .map(|ids| {
                ids.iter()
                    .enumerate()
                    .filter(|(_, id)| id.to_ascii_uppercase().starts_with(&params.igg_prefix.to_ascii_uppercase()))
                    .map(|(i, _)| i)
                    .collect()
            })
            .unwrap_or_default();
        let igg_total: Vec<f32> = (0..n_cells)
            .map(|c| {
                let col = matrix.dense_column(c);
                igg_rows.iter().map(|&r| col.get(r).copied().unwrap_or(0.0)).sum()
            })
            .collect();

        let detected_f32: Vec<f32> = detected.iter().map(|&v| v as f32).collect();
        let (low_detected, detected_bounds) = low_tail_discard(&detected_f32, block_indices, n_blocks, params.nmads);
        let drop_detected = proportional_drop_discard(&detected_f32, block_indices, n_blocks, params.min_detected_drop);
        let (high_igg, igg_bounds) = high_tail_discard(&igg_total, block_indices, n_blocks, params.nmads);

        let discard: DiscardVector = (0..n_cells)
            .map(|i| (low_detected[i] != 0 || drop_detected[i] != 0 || high_igg[i] != 0) as u8)
            .collect();

        self.metrics = QCMetrics {
            columns: vec![
                ("sums", QCColumn::Float(sums.iter().map(|&v| v as f32).collect())),
                ("detected", QCColumn::Int(detected.iter().map(|&v| v as u32).collect())),
                ("igg_total", QCColumn::Float(igg_total)),
            ],
        };
        self.thresholds = QCThresholds { bounds: vec![("detected", detected_bounds), ("igg_total", igg_bounds)] };
        self.discard = discard;
        self.changed = true;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn fetch_metrics(&self) -> &QCMetrics {
        &self.metrics
    }

    pub fn fetch_thresholds(&self) -> &QCThresholds {
        &self.thresholds
    }

    pub fn fetch_discard(&self) -> &DiscardVector {
        &self.discard
    }

    pub fn free(&mut self) {
        self.metrics = QCMetrics::default();
        self.thresholds = QCThresholds::default();
        self.discard = Vec::new();
    }
}

impl Default for AdtQualityControl {
    fn default() -> Self {
        Self::new()
    }
}

/// An "at least `min_detected_drop` proportional drop" rule relative to the
/// block median, independent of the MAD-based `low_detected` rule.
fn proportional_drop_discard(
    values: &[f32],
    block_indices: Option<&[u32]>,
    n_blocks: usize,
    min_drop: f64,
) -> DiscardVector {
    let n = values.len();
    let default_block = vec![0u32; n];
    let blocks = block_indices.unwrap_or(&default_block);
    let n_blocks = n_blocks.max(1);
    let groups = split_by_block(values, blocks, n_blocks);
    let medians: Vec<f32> = groups.iter().map(|g| median(g)).collect();

    (0..n)
        .map(|i| {
            let b = (blocks[i] as usize).min(medians.len().saturating_sub(1));
            let med = medians[b] as f64;
            if med <= 0.0 {
                return 0u8;
            }
            let drop = 1.0 - (values[i] as f64) / med;
            (drop >= min_drop) as u8
        })
        .collect()
}

pub struct CrisprQualityControl {
    tracker: ChangeTracker<CrisprParams>,
    changed: bool,
    valid: bool,
    metrics: QCMetrics,
    thresholds: QCThresholds,
    discard: DiscardVector,
}

impl CrisprQualityControl {
    pub fn new() -> Self {
        CrisprQualityControl {
            tracker: ChangeTracker::new(),
            changed: false,
            valid: false,
            metrics: QCMetrics::default(),
            thresholds: QCThresholds::default(),
            discard: Vec::new(),
        }
    }

    pub fn defaults() -> CrisprParams {
        CrisprParams::default()
    }

    pub fn compute(
        &mut self,
        matrix: Option<&Matrix>,
        block_indices: Option<&[u32]>,
        n_blocks: usize,
        params: &CrisprParams,
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

        let (sums, detected) =
            crate::kernels::qc_metrics::sums_and_detected(n_cells, |c| matrix.column_sum(c), |c| matrix.column_nnz(c));

        let mut max_proportion = vec![0.0f32; n_cells];
        let mut max_index = vec![0u32; n_cells];
        for c in 0..n_cells {
            let col = matrix.dense_column(c);
            if let Some((idx, &max_v)) = col
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            {
                max_index[c] = idx as u32;
                max_proportion[c] = if sums[c] > 0.0 { max_v / sums[c] } else { 0.0 };
            }
        }
        let max_count: Vec<f32> = sums
            .iter()
            .zip(max_proportion.iter())
            .map(|(&s, &p)| (s as f32) * p)
            .collect();

        let (discard, max_count_bounds) = low_tail_discard(&max_count, block_indices, n_blocks, params.nmads);

        self.metrics = QCMetrics {
            columns: vec![
                ("sums", QCColumn::Float(sums.iter().map(|&v| v as f32).collect())),
                ("detected", QCColumn::Int(detected.iter().map(|&v| v as u32).collect())),
                ("max_proportion", QCColumn::Float(max_proportion)),
                ("max_index", QCColumn::Int(max_index)),
            ],
        };
        self.thresholds = QCThresholds { bounds: vec![("max_count", max_count_bounds)] };
        self.discard = discard;
        self.changed = true;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn fetch_metrics(&self) -> &QCMetrics {
        &self.metrics
    }

    pub fn fetch_thresholds(&self) -> &QCThresholds {
        &self.thresholds
    }

    pub fn fetch_discard(&self) -> &DiscardVector {
        &self.discard
    }

    pub fn free(&mut self) {
        self.metrics = QCMetrics::default();
        self.thresholds = QCThresholds::default();
        self.discard = Vec::new();
    }
}

impl Default for CrisprQualityControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::matrix::{MatrixStorage, SparseCsc};

    fn toy_rna_matrix() -> Matrix {
        let mut m = SparseCsc::<i64>::new(3, 6);
        for c in 0..6 {
            let v = if c == 5 { 1 } else { 100 + c as i64 };
            m.cols[c].push((0, v));
            m.cols[c].push((1, v));
        }
        Matrix {
            storage: MatrixStorage::SparseCounts(m),
            row_ids: vec![0, 1, 2],
        }
    }

    #[test]
    fn low_library_size_cell_is_discarded() {
        let matrix = toy_rna_matrix();
        let symbols = vec!["CD3D".to_string(), "CD4".to_string(), "ND1".to_string()];
        let mut qc = RnaQualityControl::new();
        let params = RnaParams::default();
        qc.compute(Some(&matrix), Some(&symbols), None, 1, &params, false);
        assert!(qc.changed());
        assert_eq!(qc.fetch_discard()[5], 1);
    }

    #[test]
    fn absent_modality_is_invalid_and_unchanged() {
        let mut qc = RnaQualityControl::new();
        let params = RnaParams::default();
        qc.compute(None, None, None, 1, &params, false);
        assert!(!qc.valid());
        assert!(!qc.changed());
    }

    #[test]
    fn higher_nmads_discards_no_more_cells_than_lower() {
        let matrix = toy_rna_matrix();
        let symbols = vec!["CD3D".to_string(), "CD4".to_string(), "ND1".to_string()];
        let mut qc_tight = RnaQualityControl::new();
        qc_tight.compute(Some(&matrix), Some(&symbols), None, 1, &RnaParams { nmads: 1.0, ..Default::default() }, false);
        let tight_count: usize = qc_tight.fetch_discard().iter().map(|&v| v as usize).sum();

        let mut qc_loose = RnaQualityControl::new();
        qc_loose.compute(Some(&matrix), Some(&symbols), None, 1, &RnaParams { nmads: 5.0, ..Default::default() }, false);
        let loose_count: usize = qc_loose.fetch_discard().iter().map(|&v| v as usize).sum();

        assert!(loose_count <= tight_count);
    }

    #[test]
    fn rna_thresholds_are_populated_per_metric() {
        let matrix = toy_rna_matrix();
        let symbols = vec!["CD3D".to_string(), "CD4".to_string(), "ND1".to_string()];
        let mut qc = RnaQualityControl::new();
        qc.compute(Some(&matrix), Some(&symbols), None, 1, &RnaParams::default(), false);
        let names: Vec<&str> = qc.fetch_thresholds().bounds.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["sums", "detected", "mito_proportion"]);
        assert!(qc.fetch_thresholds().bounds[0].1[0].0.is_some() || qc.fetch_thresholds().bounds[0].1[0].1.is_some());
    }

    #[test]
    fn adt_thresholds_are_populated_per_metric() {
        let mut m = SparseCsc::<i64>::new(2, 6);
        for c in 0..6 {
            let v = if c == 5 { 1 } else { 100 + c as i64 };
            m.cols[c].push((0, v));
            m.cols[c].push((1, v));
        }
        let matrix = Matrix { storage: MatrixStorage::SparseCounts(m), row_ids: vec![0, 1] };
        let mut qc = AdtQualityControl::new();
        qc.compute(Some(&matrix), None, None, 1, &AdtParams::default(), false);
        let names: Vec<&str> = qc.fetch_thresholds().bounds.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["detected", "igg_total"]);
    }

    #[test]
    fn crispr_thresholds_are_populated_per_metric() {
        let mut m = SparseCsc::<i64>::new(2, 6);
        for c in 0..6 {
            let v = if c == 5 { 1 } else { 100 + c as i64 };
            m.cols[c].push((0, v));
            m.cols[c].push((1, v));
        }
        let matrix = Matrix { storage: MatrixStorage::SparseCounts(m), row_ids: vec![0, 1] };
        let mut qc = CrisprQualityControl::new();
        qc.compute(Some(&matrix), None, 1, &CrisprParams::default(), false);
        let names: Vec<&str> = qc.fetch_thresholds().bounds.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["max_count"]);
    }
}

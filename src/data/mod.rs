//! Shared data model (spec §3): `Matrix`, `MultiMatrix`, `Annotations`,
//! `FeatureAnnotations`, `BlockFactor`, `DiscardVector`, and the small
//! per-step result types (`QCMetrics`/`QCThresholds`, `SizeFactors`,
//! `PCResult`, `Selection`).
//!
//! Grounded on the teacher's `input::InputBundle`/`GeneIndex` (owned,
//! cloneable plain structs with explicit row/column counts) and its
//! `model::axes`/`model::scores` structs (one struct per logical result,
//! `Vec<f32>` fields indexed by cell). The "owner of view" redesign note
//! (spec §9) is implemented here as `Matrix`/`PCResult` being cheap to
//! `Clone` (an `Rc`-free deep clone, matching the teacher's own `Clone`
//! derives) rather than as borrowed references with lifetimes threaded
//! through every step — see `engine::mod` for why.

pub mod annotation;
pub mod block;
pub mod matrix;

pub use annotation::{Annotation, Annotations, FeatureAnnotations};
pub use block::BlockFactor;
pub use matrix::{Matrix, MatrixStorage, MultiMatrix};

/// Per-cell byte flag: non-zero means the cell is filtered out.
pub type DiscardVector = Vec<u8>;

/// Per-cell library-size-derived scalar used before log-transform.
#[derive(Debug, Clone, Default)]
pub struct SizeFactors(pub Vec<f32>);

impl SizeFactors {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A sorted array of column indices into the *filtered* matrix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection(pub Vec<u32>);

impl Selection {
    pub fn new(mut indices: Vec<u32>) -> Self {
        indices.sort_unstable();
        indices.dedup();
        Selection(indices)
    }

    pub fn is_sorted_valid(&self, n_cells: usize) -> bool {
        self.0.windows(2).all(|w| w[0] < w[1]) && self.0.last().is_none_or(|&v| (v as usize) < n_cells)
    }
}

/// Per-cell/per-block QC metrics. The metric set depends on modality
/// (spec §4.3); stored as a named bag of `Vec<f32>`/`Vec<u32>` columns so
/// `CellFiltering` and downstream reporting can be modality-agnostic.
#[derive(Debug, Clone, Default)]
pub struct QCMetrics {
    pub columns: Vec<(&'static str, QCColumn)>,
}

#[derive(Debug, Clone)]
pub enum QCColumn {
    Float(Vec<f32>),
    Int(Vec<u32>),
}

impl QCMetrics {
    pub fn get_float(&self, name: &str) -> Option<&[f32]> {
        self.columns.iter().find_map(|(n, c)| {
            if *n == name {
                match c {
                    QCColumn::Float(v) => Some(v.as_slice()),
                    QCColumn::Int(_) => None,
                }
            } else {
                None
            }
        })
    }
}

/// Per-block scalar thresholds derived from QC metrics (spec §4.3).
#[derive(Debug, Clone, Default)]
pub struct QCThresholds {
    /// One entry per metric name, each holding one (lower, upper) bound
    /// per block. `None` means "no bound on that side".
    pub bounds: Vec<(&'static str, Vec<(Option<f32>, Option<f32>)>)>,
}

/// PCs stored transposed (components × cells, per spec §3) plus the
/// variance-explained vector (one entry per component).
#[derive(Debug, Clone)]
pub struct PCResult {
    pub num_pcs: usize,
    pub num_cells: usize,
    /// Row-major `num_pcs * num_cells`: component `p`, cell `c` is at
    /// `data[p * num_cells + c]`.
    pub data: Vec<f32>,
    pub variance_explained: Vec<f32>,
}

impl PCResult {
    pub fn component(&self, pc: usize) -> &[f32] {
        let start = pc * self.num_cells;
        &self.data[start..start + self.num_cells]
    }

    pub fn cell(&self, cell: usize) -> Vec<f32> {
        (0..self.num_pcs)
            .map(|pc| self.data[pc * self.num_cells + cell])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_dedups_and_sorts() {
        let sel = Selection::new(vec![3, 1, 1, 2]);
        assert_eq!(sel.0, vec![1, 2, 3]);
        assert!(sel.is_sorted_valid(4));
        assert!(!sel.is_sorted_valid(3));
    }

    #[test]
    fn pc_result_component_and_cell_slicing() {
        let pc = PCResult {
            num_pcs: 2,
            num_cells: 3,
            data: vec![1.0, 2.0, 3.0, 10.0, 20.0, 30.0],
            variance_explained: vec![0.6, 0.3],
        };
        assert_eq!(pc.component(0), &[1.0, 2.0, 3.0]);
        assert_eq!(pc.component(1), &[10.0, 20.0, 30.0]);
        assert_eq!(pc.cell(1), vec![2.0, 20.0]);
    }
}

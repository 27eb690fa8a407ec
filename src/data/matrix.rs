//! `Matrix` and `MultiMatrix` (spec §3).
//!
//! Grounded on the teacher's `input::mtx::CscMatrix` (sparse, column-major
//! `Vec<Vec<(u32, T)>>`) for the sparse-count variant, generalized to a
//! `MatrixStorage` enum so the same `Matrix` type also carries the dense
//! log-normalized float matrices produced by normalization/PCA steps.

use std::collections::BTreeMap;

/// Column-major sparse storage: `cols[c]` is a sorted-by-row `(row, value)`
/// list for column `c`. Mirrors the teacher's `CscMatrix::cols` shape.
#[derive(Debug, Clone)]
pub struct SparseCsc<T> {
    pub n_rows: usize,
    pub n_cols: usize,
    pub cols: Vec<Vec<(u32, T)>>,
}

impl<T: Copy> SparseCsc<T> {
    pub fn new(n_rows: usize, n_cols: usize) -> Self {
        SparseCsc {
            n_rows,
            n_cols,
            cols: vec![Vec::new(); n_cols],
        }
    }
}

/// Dense row-major storage used for log-normalized matrices and PCA input
/// slices that benefit from contiguous per-column access.
#[derive(Debug, Clone)]
pub struct DenseColMajor {
    pub n_rows: usize,
    pub n_cols: usize,
    /// `cols[c]` has length `n_rows`.
    pub cols: Vec<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub enum MatrixStorage {
    SparseCounts(SparseCsc<i64>),
    DenseLogNormalized(DenseColMajor),
    SparseLogNormalized(SparseCsc<f32>),
}

/// A two-dimensional numeric container: rows are features, columns are
/// cells. Row identities are stable integer IDs preserved across
/// subsetting (spec §3 invariant on row-identity propagation).
#[derive(Debug, Clone)]
pub struct Matrix {
    pub storage: MatrixStorage,
    /// Row identity of row `i` in the *current* matrix, indexing into the
    /// identity space of the dataset Inputs originally loaded (stable
    /// across subsetting/filtering).
    pub row_ids: Vec<u32>,
}

impl Matrix {
    pub fn n_rows(&self) -> usize {
        match &self.storage {
            MatrixStorage::SparseCounts(m) => m.n_rows,
            MatrixStorage::DenseLogNormalized(m) => m.n_rows,
            MatrixStorage::SparseLogNormalized(m) => m.n_rows,
        }
    }

    pub fn n_cols(&self) -> usize {
        match &self.storage {
            MatrixStorage::SparseCounts(m) => m.n_cols,
            MatrixStorage::DenseLogNormalized(m) => m.n_cols,
            MatrixStorage::SparseLogNormalized(m) => m.n_cols,
        }
    }

    /// Returns a new matrix containing only the given columns, in order.
    /// Row identities are untouched (filtering never removes rows).
    pub fn select_columns(&self, keep: &[u32]) -> Matrix {
        let row_ids = self.row_ids.clone();
        let storage = match &self.storage {
            MatrixStorage::SparseCounts(m) => {
                let cols = keep
                    .iter()
                    .map(|&c| m.cols[c as usize].clone())
                    .collect::<Vec<_>>();
                MatrixStorage::SparseCounts(SparseCsc {
                    n_rows: m.n_rows,
                    n_cols: cols.len(),
                    cols,
                })
            }
            MatrixStorage::DenseLogNormalized(m) => {
                let cols = keep
                    .iter()
                    .map(|&c| m.cols[c as usize].clone())
                    .collect::<Vec<_>>();
                MatrixStorage::DenseLogNormalized(DenseColMajor {
                    n_rows: m.n_rows,
                    n_cols: cols.len(),
                    cols,
                })
            }
            MatrixStorage::SparseLogNormalized(m) => {
                let cols = keep
                    .iter()
                    .map(|&c| m.cols[c as usize].clone())
                    .collect::<Vec<_>>();
                MatrixStorage::SparseLogNormalized(SparseCsc {
                    n_rows: m.n_rows,
                    n_cols: cols.len(),
                    cols,
                })
            }
        };
        Matrix { storage, row_ids }
    }

    /// Library-size sum for a single column (used throughout QC and
    /// normalization).
    pub fn column_sum(&self, col: usize) -> f64 {
        match &self.storage {
            MatrixStorage::SparseCounts(m) => {
                m.cols[col].iter().map(|&(_, v)| v as f64).sum()
            }
            MatrixStorage::DenseLogNormalized(m) => {
                m.cols[col].iter().map(|&v| v as f64).sum()
            }
            MatrixStorage::SparseLogNormalized(m) => {
                m.cols[col].iter().map(|&(_, v)| v as f64).sum()
            }
        }
    }

    /// Number of nonzero entries in a column.
    pub fn column_nnz(&self, col: usize) -> usize {
        match &self.storage {
            MatrixStorage::SparseCounts(m) => m.cols[col].len(),
            MatrixStorage::DenseLogNormalized(m) => {
                m.cols[col].iter().filter(|&&v| v != 0.0).count()
            }
            MatrixStorage::SparseLogNormalized(m) => m.cols[col].len(),
        }
    }

    /// Dense row access for a column (feature_id -> value), used by
    /// kernels that need a full row (e.g. PCA centering). `n_rows` dense
    /// slots are allocated; callers should prefer `for_column` for sparse
    /// hot loops where possible.
    pub fn dense_column(&self, col: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; self.n_rows()];
        match &self.storage {
            MatrixStorage::SparseCounts(m) => {
                for &(row, v) in &m.cols[col] {
                    out[row as usize] = v as f32;
                }
            }
            MatrixStorage::DenseLogNormalized(m) => {
                out.copy_from_slice(&m.cols[col]);
            }
            MatrixStorage::SparseLogNormalized(m) => {
                for &(row, v) in &m.cols[col] {
                    out[row as usize] = v;
                }
            }
        }
        out
    }
}

/// Modality name: `"RNA"`, `"ADT"`, `"CRISPR"`, matched case-insensitively
/// when detecting alternative modalities during merge (spec §4.2).
pub type Modality = String;

/// An ordered mapping from modality name to `Matrix`. All matrices share
/// the same column count and column identity (spec §3 invariant).
#[derive(Debug, Clone, Default)]
pub struct MultiMatrix {
    order: Vec<Modality>,
    matrices: BTreeMap<Modality, Matrix>,
}

impl MultiMatrix {
    pub fn new() -> Self {
        MultiMatrix::default()
    }

    pub fn insert(&mut self, modality: impl Into<String>, matrix: Matrix) {
        let modality = modality.into();
        if !self.matrices.contains_key(&modality) {
            self.order.push(modality.clone());
        }
        self.matrices.insert(modality, matrix);
    }

    pub fn get(&self, modality: &str) -> Option<&Matrix> {
        self.matrices.get(modality)
    }

    pub fn contains(&self, modality: &str) -> bool {
        self.matrices.contains_key(modality)
    }

    /// Modalities in first-insertion order (stable, not alphabetical —
    /// callers that need a canonical order should sort explicitly).
    pub fn modalities(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn n_cols(&self) -> Option<usize> {
        self.order.first().map(|m| self.matrices[m].n_cols())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_matrix(n_rows: usize, n_cols: usize) -> Matrix {
        let mut m = SparseCsc::<i64>::new(n_rows, n_cols);
        for c in 0..n_cols {
            m.cols[c].push((0, (c + 1) as i64));
        }
        Matrix {
            storage: MatrixStorage::SparseCounts(m),
            row_ids: (0..n_rows as u32).collect(),
        }
    }

    #[test]
    fn select_columns_preserves_row_ids() {
        let m = toy_matrix(3, 5);
        let sub = m.select_columns(&[1, 3]);
        assert_eq!(sub.n_cols(), 2);
        assert_eq!(sub.row_ids, m.row_ids);
        assert_eq!(sub.column_sum(0), 2.0);
        assert_eq!(sub.column_sum(1), 4.0);
    }

    #[test]
    fn multimatrix_preserves_insertion_order() {
        let mut mm = MultiMatrix::new();
        mm.insert("RNA", toy_matrix(2, 4));
        mm.insert("ADT", toy_matrix(2, 4));
        let names: Vec<_> = mm.modalities().collect();
        assert_eq!(names, vec!["RNA", "ADT"]);
        assert_eq!(mm.n_cols(), Some(4));
    }
}

//! PCA via the Gram-matrix trick: for `Y` (cells x features, mean-centered
//! per feature), the top eigenpairs of `G = Y Y^T` (cells x cells) give the
//! PC scores directly as `score_k[cell] = eigenvector_k[cell] * sqrt(eigenvalue_k)`,
//! without ever forming the feature x feature covariance matrix. This keeps
//! the kernel's cost independent of the feature count once HVGs have
//! narrowed it down, at the price of an `O(n_cells^2)` Gram matrix — fine at
//! the scale this crate targets.
//!
//! Eigendecomposition uses the classical cyclic Jacobi algorithm (symmetric
//! matrices only, which `G` always is).

use ndarray::{Array1, Array2};
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMethod {
    None,
    Regress,
    Project,
}

pub struct PcaOutput {
    /// `data[pc][cell]`, row-major by component to match `PCResult`.
    pub scores: Vec<Vec<f32>>,
    pub variance_explained: Vec<f32>,
}

/// `columns[c]` is the dense feature vector for cell `c` (length
/// `n_features`, identical length for every cell).
pub fn compute_pca(
    columns: &[Vec<f32>],
    num_pcs: usize,
    block_indices: Option<&[u32]>,
    block_method: BlockMethod,
) -> PcaOutput {
    let n_cells = columns.len();
    if n_cells == 0 {
        return PcaOutput {
            scores: vec![Vec::new(); num_pcs],
            variance_explained: vec![0.0; num_pcs],
        };
    }
    let n_features = columns[0].len();
    let num_pcs = num_pcs.min(n_cells).max(1);

    let mut centered: Vec<Vec<f32>> = columns.to_vec();
    match (block_method, block_indices) {
        (BlockMethod::Regress, Some(blocks)) => center_within_block(&mut centered, blocks),
        _ => center_global(&mut centered, n_features),
    }

    let gram = gram_matrix(&centered);
    let (eigenvalues, eigenvectors) = jacobi_eigen_symmetric(&gram, 100);
    let order = top_k_indices(&eigenvalues, num_pcs);

    let trace: f64 = (0..gram.nrows()).map(|i| gram[(i, i)]).sum();

    let mut scores = Vec::with_capacity(num_pcs);
    let mut variance_explained = Vec::with_capacity(num_pcs);
    for &idx in &order {
        let lambda = eigenvalues[idx].max(0.0);
        let scale = lambda.sqrt();
        let component: Vec<f32> = (0..n_cells)
            .map(|c| (eigenvectors[(c, idx)] * scale) as f32)
            .collect();
        scores.push(component);
        variance_explained.push(if trace > 0.0 {
            (lambda / trace) as f32
        } else {
            0.0
        });
    }

    if matches!(block_method, BlockMethod::Project) {
        if let Some(blocks) = block_indices {
            for component in scores.iter_mut() {
                project_out_block_means(component, blocks);
            }
        }
    }

    PcaOutput {
        scores,
        variance_explained,
    }
}

fn center_global(columns: &mut [Vec<f32>], n_features: usize) {
    let n_cells = columns.len();
    let mut means = vec![0.0f64; n_features];
    for col in columns.iter() {
        for (f, &v) in col.iter().enumerate() {
            means[f] += v as f64;
        }
    }
    for m in means.iter_mut() {
        *m /= n_cells as f64;
    }
    for col in columns.iter_mut() {
        for (f, v) in col.iter_mut().enumerate() {
            *v -= means[f] as f32;
        }
    }
}

fn center_within_block(columns: &mut [Vec<f32>], blocks: &[u32]) {
    let n_features = columns.first().map(|c| c.len()).unwrap_or(0);
    let n_blocks = blocks.iter().copied().max().map(|m| m as usize + 1).unwrap_or(1);
    let mut sums = vec![vec![0.0f64; n_features]; n_blocks];
    let mut counts = vec![0usize; n_blocks];
    for (c, col) in columns.iter().enumerate() {
        let b = blocks.get(c).copied().unwrap_or(0) as usize;
        counts[b] += 1;
        for (f, &v) in col.iter().enumerate() {
            sums[b][f] += v as f64;
        }
    }
    for (c, col) in columns.iter_mut().enumerate() {
        let b = blocks.get(c).copied().unwrap_or(0) as usize;
        if counts[b] == 0 {
            continue;
        }
        for (f, v) in col.iter_mut().enumerate() {
            *v -= (sums[b][f] / counts[b] as f64) as f32;
        }
    }
}

fn project_out_block_means(component: &mut [f32], blocks: &[u32]) {
    let n_blocks = blocks.iter().copied().max().map(|m| m as usize + 1).unwrap_or(1);
    let mut sums = vec![0.0f64; n_blocks];
    let mut counts = vec![0usize; n_blocks];
    for (c, &v) in component.iter().enumerate() {
        let b = blocks.get(c).copied().unwrap_or(0) as usize;
        sums[b] += v as f64;
        counts[b] += 1;
    }
    for (c, v) in component.iter_mut().enumerate() {
        let b = blocks.get(c).copied().unwrap_or(0) as usize;
        if counts[b] > 0 {
            *v -= (sums[b] / counts[b] as f64) as f32;
        }
    }
}

fn gram_matrix(columns: &[Vec<f32>]) -> Array2<f64> {
    let n = columns.len();
    let mut g = Array2::<f64>::zeros((n, n));
    let rows: Vec<(usize, usize, f64)> = (0..n)
        .into_par_iter()
        .flat_map(|i| {
            (i..n)
                .map(|j| {
                    let dot: f64 = columns[i]
                        .iter()
                        .zip(columns[j].iter())
                        .map(|(&a, &b)| a as f64 * b as f64)
                        .sum();
                    (i, j, dot)
                })
                .collect::<Vec<_>>()
        })
        .collect();
    for (i, j, dot) in rows {
        g[(i, j)] = dot;
        g[(j, i)] = dot;
    }
    g
}

/// Cyclic Jacobi eigenvalue algorithm for a dense symmetric matrix. Returns
/// eigenvalues and the matrix of eigenvectors as columns.
fn jacobi_eigen_symmetric(a: &Array2<f64>, max_sweeps: usize) -> (Array1<f64>, Array2<f64>) {
    let n = a.nrows();
    let mut a = a.clone();
    let mut v = Array2::<f64>::eye(n);

    for _ in 0..max_sweeps {
        let mut off_diag = 0.0f64;
        for p in 0..n {
            for q in (p + 1)..n {
                off_diag += a[(p, q)] * a[(p, q)];
            }
        }
        if off_diag.sqrt() < 1e-9 {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                if a[(p, q)].abs() < 1e-12 {
                    continue;
                }
                let theta = (a[(q, q)] - a[(p, p)]) / (2.0 * a[(p, q)]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let t = if theta == 0.0 { 1.0 } else { t };
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                let app = a[(p, p)];
                let aqq = a[(q, q)];
                let apq = a[(p, q)];

                a[(p, p)] = app - t * apq;
                a[(q, q)] = aqq + t * apq;
                a[(p, q)] = 0.0;
                a[(q, p)] = 0.0;

                for i in 0..n {
                    if i != p && i != q {
                        let aip = a[(i, p)];
                        let aiq = a[(i, q)];
                        a[(i, p)] = c * aip - s * aiq;
                        a[(p, i)] = a[(i, p)];
                        a[(i, q)] = s * aip + c * aiq;
                        a[(q, i)] = a[(i, q)];
                    }
                }
                for i in 0..n {
                    let vip = v[(i, p)];
                    let viq = v[(i, q)];
                    v[(i, p)] = c * vip - s * viq;
                    v[(i, q)] = s * vip + c * viq;
                }
            }
        }
    }

    let eigenvalues = Array1::from_iter((0..n).map(|i| a[(i, i)]));
    (eigenvalues, v)
}

fn top_k_indices(values: &Array1<f64>, k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| values[b].partial_cmp(&values[a]).unwrap());
    idx.truncate(k);
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_dominant_axis_of_variation() {
        let columns = vec![
            vec![0.0, 0.0],
            vec![1.0, 1.0],
            vec![2.0, 2.0],
            vec![10.0, 10.0],
        ];
        let out = compute_pca(&columns, 1, None, BlockMethod::None);
        assert_eq!(out.scores.len(), 1);
        let pc1 = &out.scores[0];
        assert!(pc1[3].abs() > pc1[0].abs());
        assert!(out.variance_explained[0] > 0.9);
    }

    #[test]
    fn num_pcs_capped_at_n_cells() {
        let columns = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let out = compute_pca(&columns, 10, None, BlockMethod::None);
        assert_eq!(out.scores.len(), 2);
    }
}

//! Mutual-nearest-neighbor batch correction (spec §4.9). For every pair of
//! blocks, cells that are each other's nearest neighbors across the block
//! boundary define per-cell correction vectors; each cell's coordinates are
//! shifted by the (distance-weighted) average correction vector from its
//! MNN pairs, then blocks are processed in order against a growing
//! reference pool — the same incremental-merge shape most MNN
//! implementations use.

use super::neighbors::knn;

pub fn mnn_correct(
    points: &[Vec<f32>],
    block_indices: &[u32],
    num_neighbors: usize,
) -> Vec<Vec<f32>> {
    let n = points.len();
    if n == 0 {
        return Vec::new();
    }
    let n_blocks = block_indices.iter().copied().max().map(|m| m as usize + 1).unwrap_or(1);
    if n_blocks <= 1 {
        return points.to_vec();
    }

    let by_block: Vec<Vec<usize>> = (0..n_blocks)
        .map(|b| {
            (0..n)
                .filter(|&i| block_indices[i] as usize == b)
                .collect()
        })
        .collect();

    let mut corrected = points.to_vec();
    let mut reference_pool: Vec<usize> = by_block[0].clone();

    for block in by_block.iter().skip(1) {
        if block.is_empty() || reference_pool.is_empty() {
            continue;
        }
        let ref_points: Vec<Vec<f32>> = reference_pool.iter().map(|&i| corrected[i].clone()).collect();
        let block_points: Vec<Vec<f32>> = block.iter().map(|&i| corrected[i].clone()).collect();

        let block_to_ref = knn(&concat(&block_points, &ref_points), num_neighbors, false);
        let corrections = compute_mnn_corrections(
            &block_points,
            &ref_points,
            &block_to_ref,
            block.len(),
            num_neighbors,
        );

        for (local_idx, &global_idx) in block.iter().enumerate() {
            for (d, delta) in corrections[local_idx].iter().enumerate() {
                corrected[global_idx][d] += delta;
            }
        }
        reference_pool.extend(block.iter().copied());
    }

    corrected
}

fn concat(a: &[Vec<f32>], b: &[Vec<f32>]) -> Vec<Vec<f32>> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    out
}

/// Finds mutual-nearest-neighbor pairs between `block_points` (indices
/// `0..n_block` in the combined point set passed to `knn`) and
/// `ref_points` (indices `n_block..`), then averages the per-pair
/// correction vector (ref - block) landing on each block cell.
fn compute_mnn_corrections(
    block_points: &[Vec<f32>],
    ref_points: &[Vec<f32>],
    combined_graph: &super::neighbors::NeighborGraph,
    n_block: usize,
    _num_neighbors: usize,
) -> Vec<Vec<f32>> {
    let dims = block_points.first().map(|p| p.len()).unwrap_or(0);

    let mut sums = vec![vec![0.0f32; dims]; n_block];
    let mut counts = vec![0usize; n_block];

    for local_idx in 0..n_block {
        for &nbr in &combined_graph.indices[local_idx] {
            let nbr = nbr as usize;
            if nbr < n_block {
                continue;
            }
            let ref_idx = nbr - n_block;
            let mutual = combined_graph.indices[nbr]
                .iter()
                .any(|&back| back as usize == local_idx);
            if !mutual {
                continue;
            }
            for d in 0..dims {
                sums[local_idx][d] += ref_points[ref_idx][d] - block_points[local_idx][d];
            }
            counts[local_idx] += 1;
        }
    }

    (0..n_block)
        .map(|i| {
            if counts[i] == 0 {
                vec![0.0; dims]
            } else {
                sums[i].iter().map(|&s| s / counts[i] as f32).collect()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_block_is_unchanged() {
        let points = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let blocks = vec![0, 0];
        let out = mnn_correct(&points, &blocks, 1);
        assert_eq!(out, points);
    }

    #[test]
    fn shifts_second_block_toward_first() {
        let points = vec![
            vec![0.0, 0.0],
            vec![0.1, 0.0],
            vec![5.0, 5.0],
            vec![5.1, 5.0],
        ];
        let blocks = vec![0, 0, 1, 1];
        let out = mnn_correct(&points, &blocks, 1);
        let dist_before: f32 = (points[2][0] - points[0][0]).abs();
        let dist_after: f32 = (out[2][0] - out[0][0]).abs();
        assert!(dist_after <= dist_before);
    }
}

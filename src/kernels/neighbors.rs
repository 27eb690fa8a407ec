//! Nearest-neighbor search over a dense embedding (spec §4.10). `approximate`
//! is accepted as a cache-affecting parameter (spec: "recomputation depends
//! only on upstream change and the single boolean") but both settings use
//! the same brute-force search here — there is no real approximate-NN crate
//! in this pack's stack, and an exact search is a correct (if slower)
//! implementation of the same contract.

use rayon::prelude::*;

#[derive(Debug, Clone)]
pub struct NeighborGraph {
    pub k: usize,
    /// `indices[i]` holds the `k` nearest neighbors of point `i`, nearest
    /// first, excluding `i` itself.
    pub indices: Vec<Vec<u32>>,
    pub distances: Vec<Vec<f32>>,
}

pub fn knn(points: &[Vec<f32>], k: usize, _approximate: bool) -> NeighborGraph {
    let n = points.len();
    let k = k.min(n.saturating_sub(1));

    let results: Vec<(Vec<u32>, Vec<f32>)> = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut dists: Vec<(u32, f32)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| (j as u32, squared_distance(&points[i], &points[j])))
                .collect();
            dists.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
            dists.truncate(k);
            let indices = dists.iter().map(|&(idx, _)| idx).collect();
            let distances = dists.iter().map(|&(_, d)| d.sqrt()).collect();
            (indices, distances)
        })
        .collect();

    let (indices, distances): (Vec<_>, Vec<_>) = results.into_iter().unzip();
    NeighborGraph {
        k,
        indices,
        distances,
    }
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(&x, &y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_neighbor_is_the_closest_point() {
        let points = vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![5.0, 5.0]];
        let graph = knn(&points, 1, false);
        assert_eq!(graph.indices[0], vec![1]);
        assert_eq!(graph.indices[2], vec![1]);
    }

    #[test]
    fn k_capped_below_point_count() {
        let points = vec![vec![0.0], vec![1.0]];
        let graph = knn(&points, 10, true);
        assert_eq!(graph.k, 1);
    }
}

//! Shared nearest-neighbor graph construction and community detection
//! (spec §4.12 SnnGraphCluster's three sub-steps: neighbors, graph, then
//! clusters).

use std::collections::BTreeSet;

use super::neighbors::NeighborGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnnScheme {
    Rank,
    Number,
    Jaccard,
}

/// A weighted undirected graph stored as an adjacency list, `edges[i]` =
/// `(neighbor, weight)` with `neighbor > i` to avoid double storage.
#[derive(Debug, Clone)]
pub struct SnnGraph {
    pub n: usize,
    pub edges: Vec<Vec<(u32, f32)>>,
}

pub fn build_snn_graph(neighbors: &NeighborGraph, scheme: SnnScheme) -> SnnGraph {
    let n = neighbors.indices.len();
    let neighbor_sets: Vec<BTreeSet<u32>> = neighbors
        .indices
        .iter()
        .map(|v| v.iter().copied().collect())
        .collect();

    let mut edges = vec![Vec::new(); n];
    for i in 0..n {
        for j in (i + 1)..n {
            let shared: Vec<u32> = neighbor_sets[i]
                .intersection(&neighbor_sets[j])
                .copied()
                .collect();
            if shared.is_empty() && !neighbor_sets[i].contains(&(j as u32)) {
                continue;
            }
            let weight = match scheme {
                SnnScheme::Number => shared.len() as f32,
                SnnScheme::Jaccard => {
                    let union = neighbor_sets[i].union(&neighbor_sets[j]).count();
                    if union == 0 {
                        0.0
                    } else {
                        shared.len() as f32 / union as f32
                    }
                }
                SnnScheme::Rank => {
                    if shared.is_empty() {
                        0.0
                    } else {
                        let k = neighbors.k.max(1) as f32;
                        let best_rank_sum: f32 = shared
                            .iter()
                            .map(|&m| {
                                let rank_i = rank_of(&neighbors.indices[i], m);
                                let rank_j = rank_of(&neighbors.indices[j], m);
                                (rank_i + rank_j) as f32
                            })
                            .fold(f32::MAX, f32::min);
                        k - 0.5 * best_rank_sum / k
                    }
                }
            };
            if weight > 0.0 {
                edges[i].push((j as u32, weight));
            }
        }
    }
    SnnGraph { n, edges }
}

fn rank_of(neighbor_list: &[u32], target: u32) -> usize {
    neighbor_list
        .iter()
        .position(|&x| x == target)
        .unwrap_or(neighbor_list.len())
}

/// Greedy modularity-maximizing label propagation, serving as this crate's
/// community-detection routine. `resolution` scales the null-model term,
/// matching Louvain-style resolution parameters: values above 1 favor more,
/// smaller communities.
pub fn detect_communities(graph: &SnnGraph, resolution: f32, max_iters: usize) -> Vec<u32> {
    let n = graph.n;
    if n == 0 {
        return Vec::new();
    }
    let mut labels: Vec<u32> = (0..n as u32).collect();

    let mut adjacency: Vec<Vec<(usize, f32)>> = vec![Vec::new(); n];
    let mut degree = vec![0.0f32; n];
    for (i, neighbors) in graph.edges.iter().enumerate() {
        for &(j, w) in neighbors {
            adjacency[i].push((j as usize, w));
            adjacency[j as usize].push((i, w));
            degree[i] += w;
            degree[j as usize] += w;
        }
    }
    let total_weight: f32 = degree.iter().sum::<f32>().max(1e-9) / 2.0;

    for _ in 0..max_iters {
        let mut changed = false;
        for i in 0..n {
            if adjacency[i].is_empty() {
                continue;
            }
            let mut weight_by_label: std::collections::HashMap<u32, f32> =
                std::collections::HashMap::new();
            for &(j, w) in &adjacency[i] {
                *weight_by_label.entry(labels[j]).or_insert(0.0) += w;
            }
            let current_label = labels[i];
            let best = weight_by_label
                .iter()
                .map(|(&label, &w_in)| {
                    let community_degree: f32 = (0..n)
                        .filter(|&k| labels[k] == label && k != i)
                        .map(|k| degree[k])
                        .sum();
                    let gain = w_in - resolution * degree[i] * community_degree / (2.0 * total_weight);
                    (label, gain)
                })
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

            if let Some((label, _)) = best {
                if label != current_label {
                    labels[i] = label;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    renumber(&labels)
}

fn renumber(labels: &[u32]) -> Vec<u32> {
    let mut seen: Vec<u32> = Vec::new();
    labels
        .iter()
        .map(|&l| {
            if let Some(pos) = seen.iter().position(|&x| x == l) {
                pos as u32
            } else {
                seen.push(l);
                (seen.len() - 1) as u32
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::neighbors::knn;

    #[test]
    fn two_tight_blobs_form_two_communities() {
        let points = vec![
            vec![0.0, 0.0],
            vec![0.1, 0.0],
            vec![0.0, 0.1],
            vec![10.0, 10.0],
            vec![10.1, 10.0],
            vec![10.0, 10.1],
        ];
        let neighbors = knn(&points, 2, false);
        let graph = build_snn_graph(&neighbors, SnnScheme::Jaccard);
        let labels = detect_communities(&graph, 1.0, 20);
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_ne!(labels[0], labels[3]);
    }
}

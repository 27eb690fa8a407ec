//! t-SNE embedding (spec §4.11). Computes perplexity-calibrated pairwise
//! affinities via per-point binary search over the Gaussian bandwidth (the
//! standard van der Maaten & Hinton procedure), symmetrizes them, then
//! optimizes a 2D embedding against the symmetric KL divergence between
//! the input affinities and a Student-t kernel in the embedding, using
//! gradient descent with momentum and early exaggeration.
//!
//! Run incrementally in small slices via [`TsneState::step`] so the owning
//! step can interleave `INIT`/`RUN`/`RERUN`/`FETCH` commands with other
//! work on a background thread, matching spec §4.11's worker protocol.

use rayon::prelude::*;

pub struct TsneParams {
    pub perplexity: f64,
    pub learning_rate: f64,
    pub exaggeration_factor: f64,
    pub exaggeration_iters: usize,
}

impl Default for TsneParams {
    fn default() -> Self {
        TsneParams {
            perplexity: 30.0,
            learning_rate: 200.0,
            exaggeration_factor: 12.0,
            exaggeration_iters: 100,
        }
    }
}

pub struct TsneState {
    affinities: Vec<Vec<(u32, f64)>>,
    embedding: Vec<[f64; 2]>,
    velocity: Vec<[f64; 2]>,
    gains: Vec<[f64; 2]>,
    params: TsneParams,
    iteration: usize,
}

impl TsneState {
    pub fn init(neighbors: &super::neighbors::NeighborGraph, params: TsneParams, seed: u64) -> Self {
        let n = neighbors.indices.len();
        let affinities = symmetrize(compute_conditional_affinities(neighbors, params.perplexity));
        let embedding = deterministic_initial_layout(n, seed);
        TsneState {
            affinities,
            embedding,
            velocity: vec![[0.0; 2]; n],
            gains: vec![[1.0; 2]; n],
            params,
            iteration: 0,
        }
    }

    pub fn n(&self) -> usize {
        self.embedding.len()
    }

    /// Runs `iters` gradient steps, returning the number actually performed.
    pub fn step(&mut self, iters: usize) -> usize {
        let n = self.n();
        if n == 0 {
            return 0;
        }
        for _ in 0..iters {
            let exaggeration = if self.iteration < self.params.exaggeration_iters {
                self.params.exaggeration_factor
            } else {
                1.0
            };
            let (grad, _cost) = self.compute_gradient(exaggeration);

            for i in 0..n {
                for d in 0..2 {
                    let sign_changed = (grad[i][d] > 0.0) != (self.velocity[i][d] > 0.0);
                    if sign_changed {
                        self.gains[i][d] += 0.2;
                    } else {
                        self.gains[i][d] *= 0.8;
                    }
                    self.gains[i][d] = self.gains[i][d].max(0.01);
                    self.velocity[i][d] = 0.8 * self.velocity[i][d]
                        - self.params.learning_rate * self.gains[i][d] * grad[i][d];
                    self.embedding[i][d] += self.velocity[i][d];
                }
            }
            self.iteration += 1;
        }
        iters
    }

    pub fn coordinates(&self) -> &[[f64; 2]] {
        &self.embedding
    }

    /// Reinitializes the embedding/velocity/gains to the deterministic
    /// starting layout without recomputing affinities, so a RERUN command
    /// (spec §4.11) can replay the animation from scratch with unchanged
    /// parameters.
    pub fn reset(&mut self, seed: u64) {
        let n = self.n();
        self.embedding = deterministic_initial_layout(n, seed);
        self.velocity = vec![[0.0; 2]; n];
        self.gains = vec![[1.0; 2]; n];
        self.iteration = 0;
    }

    fn compute_gradient(&self, exaggeration: f64) -> (Vec<[f64; 2]>, f64) {
        let n = self.n();
        let embedding = &self.embedding;

        let mut student_t_sum = 0.0f64;
        let pairwise: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| {
                        if i == j {
                            0.0
                        } else {
                            1.0 / (1.0 + squared_dist(&embedding[i], &embedding[j]))
                        }
                    })
                    .collect()
            })
            .collect();
        for row in &pairwise {
            student_t_sum += row.iter().sum::<f64>();
        }
        student_t_sum = student_t_sum.max(1e-12);

        let grad: Vec<[f64; 2]> = (0..n)
            .into_par_iter()
            .map(|i| {
                let mut g = [0.0f64; 2];
                for &(j, p_ij) in &self.affinities[i] {
                    let j = j as usize;
                    if j == i {
                        continue;
                    }
                    let q_ij = pairwise[i][j] / student_t_sum;
                    let mult = (exaggeration * p_ij - q_ij) * pairwise[i][j];
                    for d in 0..2 {
                        g[d] += 4.0 * mult * (embedding[i][d] - embedding[j][d]);
                    }
                }
                g
            })
            .collect();

        (grad, 0.0)
    }
}

fn squared_dist(a: &[f64; 2], b: &[f64; 2]) -> f64 {
    (a[0] - b[0]) * (a[0] - b[0]) + (a[1] - b[1]) * (a[1] - b[1])
}

/// Computes conditional affinities `p_j|i` over each point's own kNN list,
/// with the Gaussian bandwidth for each point chosen by binary search so
/// the resulting distribution's perplexity matches the target.
fn compute_conditional_affinities(
    neighbors: &super::neighbors::NeighborGraph,
    perplexity: f64,
) -> Vec<Vec<(u32, f64)>> {
    neighbors
        .indices
        .par_iter()
        .zip(neighbors.distances.par_iter())
        .map(|(idx, dist)| {
            let sq: Vec<f64> = dist.iter().map(|&d| (d as f64) * (d as f64)).collect();
            let beta = find_beta_for_perplexity(&sq, perplexity);
            let weights: Vec<f64> = sq.iter().map(|&d2| (-beta * d2).exp()).collect();
            let sum: f64 = weights.iter().sum::<f64>().max(1e-12);
            idx.iter()
                .zip(weights.iter())
                .map(|(&j, &w)| (j, w / sum))
                .collect()
        })
        .collect()
}

fn find_beta_for_perplexity(sq_distances: &[f64], target_perplexity: f64) -> f64 {
    let target_entropy = target_perplexity.ln();
    let mut beta = 1.0f64;
    let mut beta_min = f64::NEG_INFINITY;
    let mut beta_max = f64::INFINITY;

    for _ in 0..50 {
        let weights: Vec<f64> = sq_distances.iter().map(|&d2| (-beta * d2).exp()).collect();
        let sum: f64 = weights.iter().sum::<f64>().max(1e-12);
        let entropy = weights
            .iter()
            .zip(sq_distances.iter())
            .map(|(&w, &d2)| beta * d2 * w / sum)
            .sum::<f64>()
            + sum.ln();

        let diff = entropy - target_entropy;
        if diff.abs() < 1e-5 {
            break;
        }
        if diff > 0.0 {
            beta_min = beta;
            beta = if beta_max.is_infinite() { beta * 2.0 } else { (beta + beta_max) / 2.0 };
        } else {
            beta_max = beta;
            beta = if beta_min.is_infinite() { beta / 2.0 } else { (beta + beta_min) / 2.0 };
        }
    }
    beta
}

fn symmetrize(conditional: Vec<Vec<(u32, f64)>>) -> Vec<Vec<(u32, f64)>> {
    let n = conditional.len();
    let mut dense = vec![vec![0.0f64; n]; n];
    for (i, row) in conditional.iter().enumerate() {
        for &(j, p) in row {
            dense[i][j as usize] += p;
        }
    }
    let total: f64 = dense.iter().flatten().sum::<f64>().max(1e-12);
    (0..n)
        .map(|i| {
            (0..n)
                .filter_map(|j| {
                    if i == j {
                        return None;
                    }
                    let sym = (dense[i][j] + dense[j][i]) / (2.0 * total);
                    if sym > 0.0 {
                        Some((j as u32, sym))
                    } else {
                        None
                    }
                })
                .collect()
        })
        .collect()
}

/// A small deterministic pseudo-random layout (xorshift seeded by `seed`)
/// so re-running with the same seed reproduces the same initial state.
fn deterministic_initial_layout(n: usize, seed: u64) -> Vec<[f64; 2]> {
    let mut state = seed.max(1);
    let mut next = || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state as f64 / u64::MAX as f64) * 2.0 - 1.0
    };
    (0..n).map(|_| [next() * 1e-4, next() * 1e-4]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::neighbors::knn;

    #[test]
    fn runs_without_nan_and_separates_clusters() {
        let points = vec![
            vec![0.0, 0.0],
            vec![0.1, 0.0],
            vec![0.0, 0.1],
            vec![20.0, 20.0],
            vec![20.1, 20.0],
            vec![20.0, 20.1],
        ];
        let neighbors = knn(&points, 3, false);
        let mut state = TsneState::init(&neighbors, TsneParams { exaggeration_iters: 10, ..Default::default() }, 7);
        state.step(50);
        for p in state.coordinates() {
            assert!(p[0].is_finite() && p[1].is_finite());
        }
    }
}

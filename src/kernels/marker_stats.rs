//! Marker statistics (spec §4.13/§4.14): one-vs-rest and pairwise effect
//! sizes between clusters over a dense, log-normalized expression matrix.
//! For every feature and every group-vs-other(s) comparison this computes
//! mean expression, detected fraction, Cohen's d, log fold-change, the
//! difference in detected fraction, and the AUC of the rank-sum test —
//! the same statistic quintet most marker-detection tools in this space
//! report per pairwise comparison.

use rayon::prelude::*;

#[derive(Debug, Clone, Copy, Default)]
pub struct GroupSummary {
    pub mean: f64,
    pub detected: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PairwiseStats {
    pub cohens_d: f64,
    pub log_fc: f64,
    pub delta_detected: f64,
    pub auc: f64,
}

/// `expression[feature]` is a dense vector over all cells, log-normalized.
/// `group_of[cell]` gives the cluster id, 0-based contiguous.
pub fn group_summaries(
    expression: &[Vec<f32>],
    group_of: &[u32],
    n_groups: usize,
) -> Vec<Vec<GroupSummary>> {
    expression
        .par_iter()
        .map(|feature| summarize_feature(feature, group_of, n_groups))
        .collect()
}

fn summarize_feature(feature: &[f32], group_of: &[u32], n_groups: usize) -> Vec<GroupSummary> {
    let mut sums = vec![0.0f64; n_groups];
    let mut detected = vec![0.0f64; n_groups];
    let mut counts = vec![0usize; n_groups];
    for (&v, &g) in feature.iter().zip(group_of.iter()) {
        let g = g as usize;
        sums[g] += v as f64;
        if v > 0.0 {
            detected[g] += 1.0;
        }
        counts[g] += 1;
    }
    (0..n_groups)
        .map(|g| {
            if counts[g] == 0 {
                GroupSummary::default()
            } else {
                GroupSummary {
                    mean: sums[g] / counts[g] as f64,
                    detected: detected[g] / counts[g] as f64,
                }
            }
        })
        .collect()
}

/// One-vs-rest pairwise stats for every feature and every target group,
/// computed against the pooled remainder of cells.
pub fn one_vs_rest(
    expression: &[Vec<f32>],
    group_of: &[u32],
    n_groups: usize,
) -> Vec<Vec<PairwiseStats>> {
    expression
        .par_iter()
        .map(|feature| {
            (0..n_groups)
                .map(|g| pairwise_for_group(feature, group_of, g, None))
                .collect()
        })
        .collect()
}

/// Pairwise stats between every ordered pair of distinct groups, for every
/// feature: `result[feature][group][other]` (the diagonal `group == other`
/// entry is an unused zeroed placeholder). Callers aggregate each group's
/// row of `n_groups - 1` comparisons into summary statistics (spec §4.13
/// "pairwise effect sizes... summarized to per-group min/mean/min-rank
/// statistics").
pub fn all_pairs(
    expression: &[Vec<f32>],
    group_of: &[u32],
    n_groups: usize,
) -> Vec<Vec<Vec<PairwiseStats>>> {
    expression
        .par_iter()
        .map(|feature| {
            (0..n_groups)
                .map(|g| {
                    (0..n_groups)
                        .map(|other| {
                            if other == g {
                                PairwiseStats::default()
                            } else {
                                pairwise_for_group(feature, group_of, g as u32, Some(other as u32))
                            }
                        })
                        .collect()
                })
                .collect()
        })
        .collect()
}

/// Pairwise stats between two specific groups only, for features requested
/// via a custom contrast.
pub fn pairwise(
    expression: &[Vec<f32>],
    group_of: &[u32],
    group_a: u32,
    group_b: u32,
) -> Vec<PairwiseStats> {
    expression
        .par_iter()
        .map(|feature| pairwise_for_group(feature, group_of, group_a, Some(group_b)))
        .collect()
}

/// If `against` is `None`, contrasts `group` against every other cell;
/// otherwise contrasts `group` strictly against `against`.
fn pairwise_for_group(feature: &[f32], group_of: &[u32], group: u32, against: Option<u32>) -> PairwiseStats {
    let mut a: Vec<f64> = Vec::new();
    let mut b: Vec<f64> = Vec::new();
    for (&v, &g) in feature.iter().zip(group_of.iter()) {
        if g == group {
            a.push(v as f64);
        } else if against.map_or(true, |other| g == other) {
            b.push(v as f64);
        }
    }
    if a.is_empty() || b.is_empty() {
        return PairwiseStats::default();
    }

    let mean_a = mean(&a);
    let mean_b = mean(&b);
    let var_a = variance(&a, mean_a);
    let var_b = variance(&b, mean_b);
    let pooled_sd = (((a.len() as f64 - 1.0) * var_a + (b.len() as f64 - 1.0) * var_b)
        / (a.len() as f64 + b.len() as f64 - 2.0).max(1.0))
    .sqrt();

    let cohens_d = if pooled_sd > 1e-12 {
        (mean_a - mean_b) / pooled_sd
    } else {
        0.0
    };
    let log_fc = log2_ratio(mean_a, mean_b);
    let detected_a = a.iter().filter(|&&v| v > 0.0).count() as f64 / a.len() as f64;
    let detected_b = b.iter().filter(|&&v| v > 0.0).count() as f64 / b.len() as f64;

    PairwiseStats {
        cohens_d,
        log_fc,
        delta_detected: detected_a - detected_b,
        auc: rank_sum_auc(&a, &b),
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len().max(1) as f64
}

fn variance(values: &[f64], mean: f64) -> f64 {
    values.iter().map(|&v| (v - mean) * (v - mean)).sum::<f64>() / values.len().max(1) as f64
}

fn log2_ratio(a: f64, b: f64) -> f64 {
    let eps = 1e-8;
    ((a + eps) / (b + eps)).log2()
}

/// Area under the ROC curve computed via the Mann-Whitney U statistic:
/// the probability a random draw from `a` exceeds a random draw from `b`.
fn rank_sum_auc(a: &[f64], b: &[f64]) -> f64 {
    let mut combined: Vec<(f64, u8)> = a
        .iter()
        .map(|&v| (v, 0u8))
        .chain(b.iter().map(|&v| (v, 1u8)))
        .collect();
    combined.sort_by(|x, y| x.0.partial_cmp(&y.0).unwrap());

    let mut ranks = vec![0.0f64; combined.len()];
    let mut i = 0;
    while i < combined.len() {
        let mut j = i;
        while j + 1 < combined.len() && combined[j + 1].0 == combined[i].0 {
            j += 1;
        }
        let avg_rank = ((i + 1) + (j + 1)) as f64 / 2.0;
        for r in ranks.iter_mut().take(j + 1).skip(i) {
            *r = avg_rank;
        }
        i = j + 1;
    }

    let rank_sum_a: f64 = combined
        .iter()
        .zip(ranks.iter())
        .filter(|((_, label), _)| *label == 0)
        .map(|(_, &r)| r)
        .sum();

    let n_a = a.len() as f64;
    let n_b = b.len() as f64;
    let u_a = rank_sum_a - n_a * (n_a + 1.0) / 2.0;
    u_a / (n_a * n_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_vs_rest_detects_clear_marker() {
        let feature = vec![0.0, 0.0, 0.0, 5.0, 5.0, 5.0];
        let groups = vec![0, 0, 0, 1, 1, 1];
        let stats = one_vs_rest(&[feature], &groups, 2);
        assert!(stats[0][1].cohens_d > 1.0);
        assert!(stats[0][1].auc > 0.9);
    }

    #[test]
    fn pairwise_matches_group_order() {
        let feature = vec![1.0, 1.0, 9.0, 9.0];
        let groups = vec![0, 0, 1, 1];
        let stats = pairwise(&[feature], &groups, 1, 0);
        assert!(stats[0].log_fc > 0.0);
    }

    #[test]
    fn no_cells_in_group_gives_zeroed_stats() {
        let feature = vec![1.0, 2.0, 3.0];
        let groups = vec![0, 0, 0];
        let stats = one_vs_rest(&[feature], &groups, 2);
        assert_eq!(stats[0][1].cohens_d, 0.0);
    }

    #[test]
    fn all_pairs_covers_every_ordered_pair_but_the_diagonal() {
        let feature = vec![0.0, 0.0, 5.0, 5.0, 9.0, 9.0];
        let groups = vec![0, 0, 1, 1, 2, 2];
        let stats = all_pairs(&[feature], &groups, 3);
        assert_eq!(stats[0][0][0].cohens_d, 0.0);
        assert_eq!(stats[0][0][1].cohens_d, -stats[0][1][0].cohens_d);
        assert!(stats[0][2][0].cohens_d > 0.0);
    }
}

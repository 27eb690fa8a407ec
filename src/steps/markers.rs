//! MarkerDetection (spec §4.13, C12): per-modality marker statistics plus a
//! lazily populated pairwise "versus" cache keyed on the unordered
//! `(min(a,b), max(a,b))` group pair.
//!
//! The one-vs-rest summary is an all-pairs sweep: `kernels::marker_stats`
//! computes every group's effect size against every *other* group
//! individually, and `build_marker_result` summarizes that row of
//! `n_groups - 1` pairwise comparisons per group into the `mean`/`min`/
//! `min-rank` statistics spec §4.13 calls for — `cohens_d`/`log_fc`/
//! `delta_detected`/`auc` hold the mean across comparisons, `min_cohens_d`
//! holds the worst (minimum) effect size seen in any single comparison, and
//! `rank` holds the best (minimum) per-comparison rank a feature achieves
//! against any other group, used by `top_markers`. See DESIGN.md.

use std::collections::BTreeMap;

use crate::data::matrix::Matrix;
use crate::kernels::marker_stats::{all_pairs, group_summaries, pairwise, GroupSummary, PairwiseStats};
use crate::steps::{dense_feature_major, ChangeTracker};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarkerDetectionParams {
    pub lfc_threshold: f64,
    pub compute_auc: bool,
}

impl Default for MarkerDetectionParams {
    fn default() -> Self {
        MarkerDetectionParams { lfc_threshold: 0.0, compute_auc: true }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MarkerGroupFeature {
    pub mean: f64,
    pub detected: f64,
    /// Mean Cohen's d across this group's pairwise comparisons.
    pub cohens_d: f64,
    /// Minimum (worst-case) Cohen's d across this group's pairwise
    /// comparisons — low only if the feature discriminates against every
    /// other group, not just some of them.
    pub min_cohens_d: f64,
    /// Mean log fold-change across this group's pairwise comparisons.
    pub log_fc: f64,
    /// Mean detected-fraction difference across this group's pairwise
    /// comparisons.
    pub delta_detected: f64,
    /// Mean AUC across this group's pairwise comparisons.
    pub auc: f64,
    /// Best (minimum) rank by Cohen's d this feature achieves in any one
    /// of this group's pairwise comparisons.
    pub rank: u32,
}

#[derive(Debug, Clone, Default)]
pub struct MarkerResult {
    pub n_groups: usize,
    /// `per_group[group][feature]`
    pub per_group: Vec<Vec<MarkerGroupFeature>>,
}

impl MarkerResult {
    /// The `n` best features for `group` with `|log_fc| >= lfc_threshold`,
    /// ordered by rank (spec §4.13/§4.15 "select the top-N markers").
    pub fn top_markers(&self, group: usize, n: usize, lfc_threshold: f64) -> Vec<usize> {
        let Some(features) = self.per_group.get(group) else {
            return Vec::new();
        };
        let mut candidates: Vec<usize> = (0..features.len())
            .filter(|&f| features[f].log_fc.abs() >= lfc_threshold)
            .collect();
        candidates.sort_by_key(|&f| features[f].rank);
        candidates.truncate(n);
        candidates
    }
}

pub struct MarkerDetection {
    tracker: ChangeTracker<MarkerDetectionParams>,
    changed: bool,
    valid: bool,
    results: BTreeMap<String, MarkerResult>,
    versus_cache: BTreeMap<String, BTreeMap<(u32, u32), Vec<PairwiseStats>>>,
}

impl MarkerDetection {
    pub fn new() -> Self {
        MarkerDetection {
            tracker: ChangeTracker::new(),
            changed: false,
            valid: false,
            results: BTreeMap::new(),
            versus_cache: BTreeMap::new(),
        }
    }

    pub fn defaults() -> MarkerDetectionParams {
        MarkerDetectionParams::default()
    }

    /// `modalities` pairs each present modality with its log-normalized
    /// matrix; `cluster` is the filtered cell's group assignment.
    pub fn compute(
        &mut self,
        modalities: &[(String, &Matrix)],
        cluster: &[u32],
        params: &MarkerDetectionParams,
        upstream_changed: bool,
    ) {
        let recompute = self.tracker.update(params, upstream_changed);
        self.valid = !modalities.is_empty() && !cluster.is_empty();
        if !recompute || !self.valid {
            self.changed = recompute && self.valid;
            return;
        }

        // Any upstream change frees the entire lazy versus cache (spec §4.13).
        self.versus_cache.clear();

        let n_groups = cluster.iter().copied().max().map(|m| m as usize + 1).unwrap_or(0);
        let mut results = BTreeMap::new();
        for (name, matrix) in modalities {
            let expression = dense_feature_major(matrix);
            let summaries = group_summaries(&expression, cluster, n_groups);
            let pairs = all_pairs(&expression, cluster, n_groups);
            results.insert(name.clone(), build_marker_result(n_groups, &summaries, &pairs, params));
        }
        self.results = results;
        self.changed = true;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn fetch_result(&self, modality: &str) -> Option<&MarkerResult> {
        self.results.get(modality)
    }

    /// Materializes a modality's marker result read back from persisted
    /// state (spec §9 "materialize real result objects ... rather than
    /// shim objects").
    pub(crate) fn restore_result(&mut self, modality: String, result: MarkerResult) {
        self.valid = true;
        self.results.insert(modality, result);
    }

    /// Lazily computes and caches the pairwise statistics for `(left,
    /// right)`. The cache key is the unordered pair; `left`/`right` only
    /// determine the sign of the returned values (spec §8 "versus
    /// symmetry").
    pub fn fetch_versus(
        &mut self,
        modality: &str,
        matrix: &Matrix,
        cluster: &[u32],
        left: u32,
        right: u32,
    ) -> Vec<PairwiseStats> {
        let key = (left.min(right), left.max(right));
        let cache = self.versus_cache.entry(modality.to_string()).or_default();
        if !cache.contains_key(&key) {
            let expression = dense_feature_major(matrix);
            let stats = pairwise(&expression, cluster, key.0, key.1);
            cache.insert(key, stats);
        }
        let stats = cache.get(&key).unwrap();
        if left <= right {
            stats.clone()
        } else {
            stats.iter().map(flip_sign).collect()
        }
    }

    pub fn free(&mut self) {
        self.results = BTreeMap::new();
        self.versus_cache = BTreeMap::new();
    }
}

impl Default for MarkerDetection {
    fn default() -> Self {
        Self::new()
    }
}

fn flip_sign(s: &PairwiseStats) -> PairwiseStats {
    PairwiseStats {
        cohens_d: -s.cohens_d,
        log_fc: -s.log_fc,
        delta_detected: -s.delta_detected,
        auc: 1.0 - s.auc,
    }
}

/// `pairs[feature][group][other]` is the full all-groups-vs-all-groups
/// sweep `kernels::marker_stats::all_pairs` produces. For each group this
/// ranks features within each of its `n_groups - 1` individual comparisons,
/// then folds that row of comparisons into the min/mean/min-rank summary
/// statistics spec §4.13 calls for.
fn build_marker_result(
    n_groups: usize,
    summaries: &[Vec<GroupSummary>],
    pairs: &[Vec<Vec<PairwiseStats>>],
    params: &MarkerDetectionParams,
) -> MarkerResult {
    let n_features = summaries.len();
    let mut per_group = vec![Vec::with_capacity(n_features); n_groups];

    for g in 0..n_groups {
        let others: Vec<usize> = (0..n_groups).filter(|&o| o != g).collect();

        let mut min_rank = vec![1u32; n_features];
        if !others.is_empty() {
            min_rank = vec![u32::MAX; n_features];
            for &other in &others {
                let mut order: Vec<usize> = (0..n_features).collect();
                order.sort_by(|&a, &b| {
                    pairs[b][g][other].cohens_d.partial_cmp(&pairs[a][g][other].cohens_d).unwrap()
                });
                for (pos, &f) in order.iter().enumerate() {
                    let rank = pos as u32 + 1;
                    if rank < min_rank[f] {
                        min_rank[f] = rank;
                    }
                }
            }
        }

        for f in 0..n_features {
            let (mean_cohens_d, min_cohens_d) = mean_and_min(others.iter().map(|&o| pairs[f][g][o].cohens_d));
            let (mean_log_fc, _) = mean_and_min(others.iter().map(|&o| pairs[f][g][o].log_fc));
            let (mean_delta_detected, _) = mean_and_min(others.iter().map(|&o| pairs[f][g][o].delta_detected));
            let (mean_auc, _) = mean_and_min(others.iter().map(|&o| pairs[f][g][o].auc));

            per_group[g].push(MarkerGroupFeature {
                mean: summaries[f][g].mean,
                detected: summaries[f][g].detected,
                cohens_d: mean_cohens_d,
                min_cohens_d,
                log_fc: mean_log_fc,
                delta_detected: mean_delta_detected,
                auc: if params.compute_auc { mean_auc } else { 0.0 },
                rank: min_rank[f],
            });
        }
    }

    MarkerResult { n_groups, per_group }
}

fn mean_and_min<I: Iterator<Item = f64>>(values: I) -> (f64, f64) {
    let mut sum = 0.0;
    let mut count = 0usize;
    let mut min = f64::INFINITY;
    for v in values {
        sum += v;
        count += 1;
        if v < min {
            min = v;
        }
    }
    if count == 0 {
        (0.0, 0.0)
    } else {
        (sum / count as f64, min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::matrix::{DenseColMajor, MatrixStorage};

    fn toy_matrix() -> Matrix {
        // 2 features x 6 cells; feature 0 separates the two groups, feature 1 doesn't.
        let cols: Vec<Vec<f32>> = vec![
            vec![0.0, 0.0], vec![0.1, 0.1], vec![0.2, 0.2],
            vec![9.0, 0.0], vec![9.1, 0.1], vec![9.2, 0.2],
        ];
        Matrix {
            storage: MatrixStorage::DenseLogNormalized(DenseColMajor { n_rows: 2, n_cols: 6, cols }),
            row_ids: vec![0, 1],
        }
    }

    #[test]
    fn invalid_without_modalities() {
        let mut md = MarkerDetection::new();
        md.compute(&[], &[], &MarkerDetectionParams::default(), true);
        assert!(!md.valid());
    }

    #[test]
    fn discriminating_feature_ranks_first_for_its_group() {
        let matrix = toy_matrix();
        let cluster = vec![0u32, 0, 0, 1, 1, 1];
        let modalities = vec![("RNA".to_string(), &matrix)];
        let mut md = MarkerDetection::new();
        md.compute(&modalities, &cluster, &MarkerDetectionParams::default(), true);
        assert!(md.changed());
        let result = md.fetch_result("RNA").unwrap();
        let top = result.top_markers(1, 1, 0.0);
        assert_eq!(top, vec![0]);
    }

    #[test]
    fn versus_cache_is_symmetric_with_sign_flip() {
        let matrix = toy_matrix();
        let cluster = vec![0u32, 0, 0, 1, 1, 1];
        let modalities = vec![("RNA".to_string(), &matrix)];
        let mut md = MarkerDetection::new();
        md.compute(&modalities, &cluster, &MarkerDetectionParams::default(), true);

        let forward = md.fetch_versus("RNA", &matrix, &cluster, 0, 1);
        let backward = md.fetch_versus("RNA", &matrix, &cluster, 1, 0);
        assert_eq!(forward[0].cohens_d, -backward[0].cohens_d);
    }
}

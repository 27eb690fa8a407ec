//! CustomSelections (spec §4.14, C13): an ordered mapping from
//! user-assigned string IDs to ad-hoc cell selections, each with its own
//! in-vs-out marker result plus a versus cache — the same
//! `kernels::marker_stats` building blocks as `MarkerDetection` (grounded
//! there), but keyed per-selection instead of per-cluster, and with an
//! explicit `add_selection`/`remove_selection` API rather than a recomputed
//! cluster vector. A selection only ever has the two-group in/out contrast,
//! so (unlike `MarkerDetection`'s multi-cluster case) there's a single
//! pairwise comparison per feature, not a sweep to aggregate.

use std::collections::BTreeMap;

use crate::data::matrix::Matrix;
use crate::error::EngineError;
use crate::kernels::marker_stats::{group_summaries, one_vs_rest, pairwise, PairwiseStats};
use crate::steps::dense_feature_major;
use crate::steps::markers::{MarkerDetectionParams, MarkerGroupFeature, MarkerResult};

fn build_selection_result(n_features: usize, summaries: &[Vec<crate::kernels::marker_stats::GroupSummary>], ovr: &[Vec<PairwiseStats>], params: &MarkerDetectionParams) -> MarkerResult {
    // A selection only ever has the "in" (group 0) / "out" (group 1)
    // contrast, so this reuses the two-group shape of MarkerResult.
    let mut order: Vec<usize> = (0..n_features).collect();
    order.sort_by(|&a, &b| ovr[b][0].cohens_d.partial_cmp(&ovr[a][0].cohens_d).unwrap());
    let mut rank = vec![0u32; n_features];
    for (pos, &f) in order.iter().enumerate() {
        rank[f] = pos as u32 + 1;
    }
    let mut features = Vec::with_capacity(n_features);
    for f in 0..n_features {
        let stats = &ovr[f][0];
        features.push(MarkerGroupFeature {
            mean: summaries[f][0].mean,
            detected: summaries[f][0].detected,
            // A selection is an inherent two-group (in/out) contrast, so
            // there's only ever one comparison to summarize: min == mean.
            cohens_d: stats.cohens_d,
            min_cohens_d: stats.cohens_d,
            log_fc: stats.log_fc,
            delta_detected: stats.delta_detected,
            auc: if params.compute_auc { stats.auc } else { 0.0 },
            rank: rank[f],
        });
    }
    MarkerResult { n_groups: 1, per_group: vec![features] }
}

fn flip_sign(s: &PairwiseStats) -> PairwiseStats {
    PairwiseStats {
        cohens_d: -s.cohens_d,
        log_fc: -s.log_fc,
        delta_detected: -s.delta_detected,
        auc: 1.0 - s.auc,
    }
}

#[derive(Debug, Clone)]
struct Selection {
    indices: Vec<u32>,
    results: BTreeMap<String, MarkerResult>,
}

pub struct CustomSelections {
    params: MarkerDetectionParams,
    selections: BTreeMap<String, Selection>,
    versus_cache: BTreeMap<String, BTreeMap<(String, String), Vec<PairwiseStats>>>,
    changed: bool,
}

impl CustomSelections {
    pub fn new() -> Self {
        CustomSelections {
            params: MarkerDetectionParams::default(),
            selections: BTreeMap::new(),
            versus_cache: BTreeMap::new(),
            changed: false,
        }
    }

    /// Drives the two upstream-reaction rules in spec §4.14: a
    /// `CellFiltering` change drops every selection outright (their column
    /// indices no longer mean anything); otherwise a change to
    /// `lfc_threshold`/`compute_auc` alone recomputes every existing
    /// selection's markers in place.
    pub fn update_params(&mut self, modalities: &[(String, &Matrix)], n_cells: usize, params: &MarkerDetectionParams, cell_filtering_changed: bool) {
        if cell_filtering_changed {
            self.selections.clear();
            self.versus_cache.clear();
            self.params = *params;
            self.changed = true;
            return;
        }
        let params_changed = *params != self.params;
        self.params = *params;
        if !params_changed {
            self.changed = false;
            return;
        }
        self.versus_cache.clear();
        let ids: Vec<String> = self.selections.keys().cloned().collect();
        for id in ids {
            let indices = self.selections.get(&id).unwrap().indices.clone();
            let results = compute_results(modalities, n_cells, &indices, params);
            self.selections.get_mut(&id).unwrap().results = results;
        }
        self.changed = true;
    }

    /// Adds or replaces selection `id`. `indices` must all be `< n_cells`
    /// (the filtered cell count) or this raises `StaleReference`.
    pub fn add_selection(
        &mut self,
        id: &str,
        mut indices: Vec<u32>,
        modalities: &[(String, &Matrix)],
        n_cells: usize,
    ) -> Result<(), EngineError> {
        if indices.iter().any(|&i| i as usize >= n_cells) {
            return Err(EngineError::stale_reference(
                "custom_selections",
                format!("selection `{id}` references a cell index beyond the filtered cell count {n_cells}"),
            ));
        }
        indices.sort_unstable();
        indices.dedup();
        let results = compute_results(modalities, n_cells, &indices, &self.params);
        self.selections.insert(id.to_string(), Selection { indices, results });
        self.purge_versus_cache_for(id);
        self.changed = true;
        Ok(())
    }

    pub fn remove_selection(&mut self, id: &str) {
        self.selections.remove(id);
        self.purge_versus_cache_for(id);
        self.changed = true;
    }

    /// Drops every cached versus entry that references `id`, since
    /// replacing or removing a selection invalidates any comparison built
    /// against its old contents.
    fn purge_versus_cache_for(&mut self, id: &str) {
        for per_modality in self.versus_cache.values_mut() {
            per_modality.retain(|(left, right), _| left != id && right != id);
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.selections.keys().map(|s| s.as_str())
    }

    pub fn fetch_result(&self, id: &str, modality: &str) -> Option<&MarkerResult> {
        self.selections.get(id)?.results.get(modality)
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    /// Pairwise comparison between two selections, with the same ordered
    /// `(min, max)` cache key and sign-flip-on-reversal discipline as
    /// `MarkerDetection::fetch_versus`.
    pub fn compute_versus(
        &mut self,
        modality: &str,
        matrix: &Matrix,
        left: &str,
        right: &str,
    ) -> Result<Vec<PairwiseStats>, EngineError> {
        let left_sel = self
            .selections
            .get(left)
            .ok_or_else(|| EngineError::invalid_input("custom_selections", format!("unknown selection `{left}`")))?;
        let right_sel = self
            .selections
            .get(right)
            .ok_or_else(|| EngineError::invalid_input("custom_selections", format!("unknown selection `{right}`")))?;

        let (key_left, key_right, flip) = if left <= right { (left, right, false) } else { (right, left, true) };
        let key = (key_left.to_string(), key_right.to_string());
        let cache = self.versus_cache.entry(modality.to_string()).or_default();
        if !cache.contains_key(&key) {
            let (ordered_left, ordered_right) = if flip { (right_sel, left_sel) } else { (left_sel, right_sel) };
            let expression = dense_feature_major(matrix);
            let group_of = group_labels(matrix.n_cols(), &ordered_left.indices, &ordered_right.indices);
            let stats = pairwise(&expression, &group_of, 0, 1);
            cache.insert(key.clone(), stats);
        }
        let stats = cache.get(&key).unwrap();
        Ok(if flip { stats.iter().map(flip_sign).collect() } else { stats.clone() })
    }

    pub fn free(&mut self) {
        self.selections.clear();
        self.versus_cache.clear();
    }
}

impl Default for CustomSelections {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a two-group label vector over all `n_cells` columns: `0` for
/// cells in `left`, `1` for cells in `right`, `u32::MAX` (excluded by the
/// kernel's grouping) for cells in neither.
fn group_labels(n_cells: usize, left: &[u32], right: &[u32]) -> Vec<u32> {
    let mut labels = vec![u32::MAX; n_cells];
    for &i in left {
        labels[i as usize] = 0;
    }
    for &i in right {
        labels[i as usize] = 1;
    }
    labels
}

fn compute_results(
    modalities: &[(String, &Matrix)],
    n_cells: usize,
    indices: &[u32],
    params: &MarkerDetectionParams,
) -> BTreeMap<String, MarkerResult> {
    let outside: Vec<u32> = (0..n_cells as u32).filter(|c| !indices.contains(c)).collect();
    let group_of = group_labels(n_cells, indices, &outside);

    let mut results = BTreeMap::new();
    for (name, matrix) in modalities {
        let expression = dense_feature_major(matrix);
        let summaries = group_summaries(&expression, &group_of, 2);
        let ovr = one_vs_rest(&expression, &group_of, 2);
        results.insert(name.clone(), build_selection_result(expression.len(), &summaries, &ovr, params));
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::matrix::{DenseColMajor, MatrixStorage};

    fn toy_matrix() -> Matrix {
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
    fn add_selection_rejects_out_of_range_index() {
        let matrix = toy_matrix();
        let modalities = vec![("RNA".to_string(), &matrix)];
        let mut cs = CustomSelections::new();
        let err = cs.add_selection("a", vec![6], &modalities, 6).unwrap_err();
        assert!(matches!(err, EngineError::StaleReference { .. }));
    }

    #[test]
    fn cell_filtering_change_drops_all_selections() {
        let matrix = toy_matrix();
        let modalities = vec![("RNA".to_string(), &matrix)];
        let mut cs = CustomSelections::new();
        cs.add_selection("a", vec![0, 1, 2], &modalities, 6).unwrap();
        assert_eq!(cs.ids().count(), 1);
        cs.update_params(&modalities, 6, &MarkerDetectionParams::default(), true);
        assert_eq!(cs.ids().count(), 0);
    }

    #[test]
    fn versus_is_symmetric_with_sign_flip() {
        let matrix = toy_matrix();
        let modalities = vec![("RNA".to_string(), &matrix)];
        let mut cs = CustomSelections::new();
        cs.add_selection("a", vec![0, 1, 2], &modalities, 6).unwrap();
        cs.add_selection("b", vec![3, 4, 5], &modalities, 6).unwrap();

        let forward = cs.compute_versus("RNA", &matrix, "a", "b").unwrap();
        let backward = cs.compute_versus("RNA", &matrix, "b", "a").unwrap();
        assert_eq!(forward[0].cohens_d, -backward[0].cohens_d);
    }
}

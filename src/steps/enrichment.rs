//! FeatureSetEnrichment (spec §4.15, C14): hypergeometric testing of
//! top-N cluster markers against species-keyed gene-set collections, plus a
//! per-cell gene-set score. Shares `labelling::Downloader`/catalogue shape
//! since both steps fetch the same kind of externally-hosted reference
//! asset (spec §1 "out of scope ... downloading reference data").

use std::collections::BTreeMap;

use crate::data::annotation::FeatureAnnotations;
use crate::data::matrix::Matrix;
use crate::error::EngineError;
use crate::kernels::hypergeometric::upper_tail_p_value;
use crate::steps::labelling::{CatalogueEntry, Downloader};
use crate::steps::markers::MarkerResult;

pub fn catalogue() -> &'static [CatalogueEntry] {
    &[
        CatalogueEntry { name: "hallmark", species: "human", url: "https://references.example/hallmark.bin" },
        CatalogueEntry { name: "go_bp", species: "human", url: "https://references.example/go_bp.bin" },
        CatalogueEntry { name: "mouse_hallmark", species: "mouse", url: "https://references.example/mouse_hallmark.bin" },
    ]
}

/// A parsed collection: one named gene set per line, `name\tgene1\tgene2...`.
#[derive(Debug, Clone, Default)]
pub struct SetCollection {
    pub sets: BTreeMap<String, Vec<String>>,
}

fn parse_collection(bytes: &[u8]) -> Result<SetCollection, EngineError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| EngineError::resource_load_failure("feature_set_enrichment", "collection is not valid UTF-8"))?;
    let mut sets = BTreeMap::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let name = fields
            .next()
            .ok_or_else(|| EngineError::resource_load_failure("feature_set_enrichment", "collection row has no name"))?;
        let genes: Vec<String> = fields.map(|g| g.to_string()).collect();
        sets.insert(name.to_string(), genes);
    }
    Ok(SetCollection { sets })
}

#[derive(Debug, Clone)]
pub enum Effect {
    Up,
    Down,
    Any,
}

#[derive(Debug, Clone, Default)]
pub struct FeatureSetEnrichmentParams {
    pub collections: Vec<String>,
    pub automatic: bool,
    pub species: Option<String>,
    pub gene_id_column: Option<String>,
    pub gene_id_type: Option<String>,
    pub top_markers: usize,
}

#[derive(Debug, Clone)]
pub struct EnrichmentResult {
    pub collection: String,
    pub set_name: String,
    pub p_value: f64,
}

pub struct FeatureSetEnrichment {
    cache: BTreeMap<String, SetCollection>,
    results: BTreeMap<u32, Vec<EnrichmentResult>>,
    changed: bool,
}

impl FeatureSetEnrichment {
    pub fn new() -> Self {
        FeatureSetEnrichment { cache: BTreeMap::new(), results: BTreeMap::new(), changed: false }
    }

    fn ensure_loaded(&mut self, params: &FeatureSetEnrichmentParams, downloader: &dyn Downloader) {
        for name in &params.collections {
            if self.cache.contains_key(name) {
                continue;
            }
            let Some(entry) = catalogue().iter().find(|e| e.name == name) else { continue };
            if let Ok(collection) = downloader.download(entry.url).and_then(|bytes| parse_collection(&bytes)) {
                self.cache.insert(name.clone(), collection);
            }
        }
    }

    /// For each cluster, selects its top `top_markers` (by `log_fc` with
    /// `effect` sign gating, then rank) and tests each gene set in every
    /// requested collection for enrichment among those markers.
    pub fn compute(
        &mut self,
        markers: &MarkerResult,
        feature_annotations: &FeatureAnnotations,
        effect: Effect,
        params: &FeatureSetEnrichmentParams,
        downloader: &dyn Downloader,
        upstream_changed: bool,
    ) {
        if !upstream_changed && self.results.len() == markers.n_groups {
            self.changed = false;
            return;
        }
        self.ensure_loaded(params, downloader);

        let universe = feature_annotations.ids.len();
        let mut results = BTreeMap::new();
        for group in 0..markers.n_groups {
            let top = select_top_markers(markers, group, params.top_markers, &effect);
            let top_ids: Vec<&str> = top.iter().map(|&idx| feature_annotations.ids[idx].as_str()).collect();
            let mut per_cluster = Vec::new();
            for collection_name in &params.collections {
                let Some(collection) = self.cache.get(collection_name) else { continue };
                for (set_name, genes) in &collection.sets {
                    let successes_in_population = genes
                        .iter()
                        .filter(|g| feature_annotations.ids.iter().any(|id| id == *g))
                        .count();
                    let successes_in_draw = top_ids.iter().filter(|id| genes.iter().any(|g| g == *id)).count();
                    let p_value = upper_tail_p_value(universe, successes_in_population, top_ids.len(), successes_in_draw);
                    per_cluster.push(EnrichmentResult {
                        collection: collection_name.clone(),
                        set_name: set_name.clone(),
                        p_value,
                    });
                }
            }
            results.insert(group as u32, per_cluster);
        }
        self.results = results;
        self.changed = true;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn fetch_results(&self, group: u32) -> &[EnrichmentResult] {
        self.results.get(&group).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Per-cell set score: the mean expression of the set's member genes
    /// (intersected with the dataset's feature IDs), a simple and common
    /// stand-in for a background-corrected module score.
    pub fn set_score(&self, collection: &str, set_name: &str, matrix: &Matrix, feature_annotations: &FeatureAnnotations) -> Option<Vec<f32>> {
        let genes = &self.cache.get(collection)?.sets.get(set_name)?;
        let rows: Vec<usize> = feature_annotations
            .ids
            .iter()
            .enumerate()
            .filter(|(_, id)| genes.iter().any(|g| g == *id))
            .map(|(i, _)| i)
            .collect();
        if rows.is_empty() {
            return Some(vec![0.0; matrix.n_cols()]);
        }
        let mut scores = vec![0.0f32; matrix.n_cols()];
        for c in 0..matrix.n_cols() {
            let column = matrix.dense_column(c);
            let sum: f32 = rows.iter().map(|&r| column[r]).sum();
            scores[c] = sum / rows.len() as f32;
        }
        Some(scores)
    }

    pub fn free(&mut self) {
        self.cache.clear();
        self.results.clear();
    }
}

impl Default for FeatureSetEnrichment {
    fn default() -> Self {
        Self::new()
    }
}

fn select_top_markers(markers: &MarkerResult, group: usize, n: usize, effect: &Effect) -> Vec<usize> {
    let Some(features) = markers.per_group.get(group) else { return Vec::new() };
    let mut candidates: Vec<usize> = (0..features.len())
        .filter(|&f| match effect {
            Effect::Up => features[f].log_fc > 0.0,
            Effect::Down => features[f].log_fc < 0.0,
            Effect::Any => true,
        })
        .collect();
    candidates.sort_by_key(|&f| features[f].rank);
    candidates.truncate(n);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::markers::MarkerGroupFeature;

    struct FakeDownloader(&'static str);
    impl Downloader for FakeDownloader {
        fn download(&self, _url: &str) -> Result<Vec<u8>, EngineError> {
            Ok(self.0.as_bytes().to_vec())
        }
    }

    fn toy_feature_annotations() -> FeatureAnnotations {
        FeatureAnnotations {
            ids: vec!["g1".to_string(), "g2".to_string(), "g3".to_string()],
            symbols: vec!["G1".to_string(), "G2".to_string(), "G3".to_string()],
            feature_types: vec![None, None, None],
        }
    }

    fn toy_markers() -> MarkerResult {
        MarkerResult {
            n_groups: 1,
            per_group: vec![vec![
                MarkerGroupFeature { mean: 5.0, detected: 1.0, cohens_d: 2.0, min_cohens_d: 2.0, log_fc: 2.0, delta_detected: 0.0, auc: 0.9, rank: 1 },
                MarkerGroupFeature { mean: 1.0, detected: 0.5, cohens_d: 0.5, min_cohens_d: 0.5, log_fc: 0.5, delta_detected: 0.0, auc: 0.6, rank: 2 },
                MarkerGroupFeature { mean: 0.1, detected: 0.1, cohens_d: -1.0, min_cohens_d: -1.0, log_fc: -1.0, delta_detected: 0.0, auc: 0.2, rank: 3 },
            ]],
        }
    }

    #[test]
    fn enriched_set_gets_low_p_value() {
        let collection_text = "geneset_a\tg1\tg2\n";
        let downloader = FakeDownloader(collection_text);
        let mut enrichment = FeatureSetEnrichment::new();
        let params = FeatureSetEnrichmentParams { collections: vec!["hallmark".to_string()], top_markers: 2, ..Default::default() };
        enrichment.compute(&toy_markers(), &toy_feature_annotations(), Effect::Up, &params, &downloader, true);
        let results = enrichment.fetch_results(0);
        assert_eq!(results.len(), 1);
        assert!(results[0].p_value < 0.5);
    }

    #[test]
    fn set_score_averages_member_genes() {
        let collection_text = "geneset_a\tg1\tg2\n";
        let downloader = FakeDownloader(collection_text);
        let mut enrichment = FeatureSetEnrichment::new();
        let params = FeatureSetEnrichmentParams { collections: vec!["hallmark".to_string()], top_markers: 2, ..Default::default() };
        enrichment.compute(&toy_markers(), &toy_feature_annotations(), Effect::Up, &params, &downloader, true);

        let matrix = Matrix {
            storage: crate::data::matrix::MatrixStorage::DenseLogNormalized(crate::data::matrix::DenseColMajor {
                n_rows: 3,
                n_cols: 2,
                cols: vec![vec![2.0, 4.0, 0.0], vec![6.0, 0.0, 0.0]],
            }),
            row_ids: vec![0, 1, 2],
        };
        let scores = enrichment.set_score("hallmark", "geneset_a", &matrix, &toy_feature_annotations()).unwrap();
        assert_eq!(scores, vec![3.0, 2.0]);
    }
}

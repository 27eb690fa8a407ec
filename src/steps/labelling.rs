//! CellLabelling (spec §4.15, C14): reference-based cell typing from a
//! fixed species-keyed catalogue of label profiles, classified against
//! per-cluster mean expression.
//!
//! Reference download/parsing is explicitly out of scope for this crate
//! (spec §1 "out of scope ... downloading reference data") and is modeled
//! as an injected `Downloader` callback (spec §6 "Runtime hooks"), mirroring
//! how the teacher's `input` layer treats dataset readers as externally
//! supplied bytes rather than something this crate parses itself.

use std::collections::BTreeMap;

use crate::data::annotation::{Annotation, Annotations, FeatureAnnotations};
use crate::error::EngineError;
use crate::steps::markers::MarkerResult;

/// Fetches the raw bytes for a reference asset. Callers provide an
/// implementation (HTTP client, local cache, test double); this crate never
/// reaches the network itself.
pub trait Downloader {
    fn download(&self, url: &str) -> Result<Vec<u8>, EngineError>;
}

/// One entry in the fixed species-keyed catalogue (spec §4.15): a named
/// reference with a download URL and the species it applies to.
#[derive(Debug, Clone)]
pub struct CatalogueEntry {
    pub name: &'static str,
    pub species: &'static str,
    pub url: &'static str,
}

/// The built-in reference catalogue. Intentionally small: this crate
/// ships the lookup table, not the reference data itself.
pub fn catalogue() -> &'static [CatalogueEntry] {
    &[
        CatalogueEntry { name: "human_primary_cell_atlas", species: "human", url: "https://references.example/hpca.bin" },
        CatalogueEntry { name: "mouse_rnaseq", species: "mouse", url: "https://references.example/mouse_rnaseq.bin" },
        CatalogueEntry { name: "blueprint_encode", species: "human", url: "https://references.example/blueprint_encode.bin" },
    ]
}

/// A parsed reference: gene IDs in the dataset's own ID space (after
/// mapping through `gene_id_column`/`gene_id_type`) paired with one mean
/// expression profile per label.
#[derive(Debug, Clone)]
pub struct ReferenceProfile {
    pub gene_ids: Vec<String>,
    pub labels: Vec<String>,
    /// `profiles[label][gene]`
    pub profiles: Vec<Vec<f32>>,
}

/// Parses a downloaded reference blob. The wire format is the download
/// callback's concern (spec: "out of scope ... downloading reference
/// data"); this crate only needs the line-oriented shape below:
/// one header line of gene IDs, then one line per label: `label\tv1\tv2...`.
fn parse_reference(bytes: &[u8]) -> Result<ReferenceProfile, EngineError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| EngineError::resource_load_failure("cell_labelling", "reference is not valid UTF-8"))?;
    let mut lines = text.lines();
    let header = lines
        .next()
        .ok_or_else(|| EngineError::resource_load_failure("cell_labelling", "reference has no header line"))?;
    let gene_ids: Vec<String> = header.split('\t').map(|s| s.to_string()).collect();

    let mut labels = Vec::new();
    let mut profiles = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let label = fields
            .next()
            .ok_or_else(|| EngineError::resource_load_failure("cell_labelling", "reference row has no label"))?;
        let values: Vec<f32> = fields.map(|v| v.parse().unwrap_or(0.0)).collect();
        if values.len() != gene_ids.len() {
            return Err(EngineError::resource_load_failure(
                "cell_labelling",
                format!("reference row `{label}` has {} values, expected {}", values.len(), gene_ids.len()),
            ));
        }
        labels.push(label.to_string());
        profiles.push(values);
    }
    Ok(ReferenceProfile { gene_ids, labels, profiles })
}

#[derive(Debug, Clone, Default)]
pub struct CellLabellingParams {
    pub references: Vec<String>,
    pub automatic: bool,
    pub species: Option<String>,
    pub gene_id_column: Option<String>,
    pub gene_id_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterLabel {
    pub label: String,
    pub reference: String,
    pub score: f64,
}

pub struct CellLabelling {
    cache: BTreeMap<String, ReferenceProfile>,
    assignments: Vec<ClusterLabel>,
    changed: bool,
}

impl CellLabelling {
    pub fn new() -> Self {
        CellLabelling { cache: BTreeMap::new(), assignments: Vec::new(), changed: false }
    }

    /// Resolves `gene_id_column` when `automatic` is set, by scoring each
    /// feature-ID column's (`ids` vs `symbols`) overlap with the requested
    /// reference's gene vocabulary (spec §4.15 "scoring each annotation
    /// column's match to reference vocabularies"). A simple overlap
    /// fraction stands in for a dedicated vocabulary matcher.
    fn resolve_gene_id_column(&self, feature_annotations: &FeatureAnnotations, reference: &ReferenceProfile) -> &'static str {
        let reference_genes: std::collections::HashSet<&str> = reference.gene_ids.iter().map(|s| s.as_str()).collect();
        let overlap = |column: &[String]| column.iter().filter(|v| reference_genes.contains(v.as_str())).count();
        if overlap(&feature_annotations.symbols) > overlap(&feature_annotations.ids) {
            "symbols"
        } else {
            "ids"
        }
    }

    /// Resolves `species` when `automatic` is set and no explicit
    /// `species` override is given, by reading a per-cell `species`
    /// annotation factor column's first recorded level, if present.
    fn resolve_species(&self, annotations: &Annotations) -> Option<String> {
        let Some(Annotation::Factor { levels, indices }) = annotations.get("species") else {
            return None;
        };
        let idx = indices.iter().flatten().next()?;
        levels.get(*idx as usize).cloned()
    }

    /// Classifies each cluster's mean RNA expression (from `markers`'s
    /// per-group `mean` field) against every requested reference's label
    /// profiles via Spearman-free Pearson correlation, keeping the
    /// highest-scoring `(reference, label)` per cluster (spec §4.15
    /// "integration step chooses the best reference per cluster").
    pub fn compute(
        &mut self,
        markers: &MarkerResult,
        feature_annotations: &FeatureAnnotations,
        annotations: &Annotations,
        params: &CellLabellingParams,
        downloader: &dyn Downloader,
        upstream_changed: bool,
    ) {
        if !upstream_changed && self.assignments.len() == markers.n_groups {
            self.changed = false;
            return;
        }

        for name in &params.references {
            if self.cache.contains_key(name) {
                continue;
            }
            let Some(entry) = catalogue().iter().find(|e| e.name == name) else {
                continue;
            };
            match downloader.download(entry.url).and_then(|bytes| parse_reference(&bytes)) {
                Ok(profile) => {
                    self.cache.insert(name.clone(), profile);
                }
                Err(_) => continue, // resource load failure: this reference contributes nothing.
            }
        }

        let effective_species = params
            .species
            .clone()
            .or_else(|| if params.automatic { self.resolve_species(annotations) } else { None });

        let mut assignments = vec![ClusterLabel::default(); markers.n_groups];
        for name in &params.references {
            let Some(reference) = self.cache.get(name) else { continue };
            let Some(entry) = catalogue().iter().find(|e| e.name == name) else { continue };
            if let Some(species) = &effective_species {
                if !entry.species.eq_ignore_ascii_case(species) {
                    continue;
                }
            }

            let gene_id_column = params
                .gene_id_column
                .as_deref()
                .unwrap_or_else(|| if params.automatic { self.resolve_gene_id_column(feature_annotations, reference) } else { "ids" });
            let gene_ids = if gene_id_column == "symbols" { &feature_annotations.symbols } else { &feature_annotations.ids };
            let gene_index: BTreeMap<&str, usize> =
                gene_ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();

            for group in 0..markers.n_groups {
                let features = &markers.per_group[group];
                for (label_idx, label) in reference.labels.iter().enumerate() {
                    let score = correlate(&reference.gene_ids, &reference.profiles[label_idx], features, &gene_index);
                    if score > assignments[group].score {
                        assignments[group] = ClusterLabel { label: label.clone(), reference: name.clone(), score };
                    }
                }
            }
        }

        self.assignments = assignments;
        self.changed = true;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn fetch_assignments(&self) -> &[ClusterLabel] {
        &self.assignments
    }

    /// Materializes assignments read back from persisted state (spec §9
    /// "materialize real result objects ... rather than shim objects").
    pub(crate) fn restore_assignments(&mut self, assignments: Vec<ClusterLabel>) {
        self.assignments = assignments;
    }

    pub fn free(&mut self) {
        self.cache.clear();
        self.assignments.clear();
    }
}

impl Default for CellLabelling {
    fn default() -> Self {
        Self::new()
    }
}

fn correlate(
    gene_ids: &[String],
    reference_profile: &[f32],
    cluster_features: &[crate::steps::markers::MarkerGroupFeature],
    gene_index: &BTreeMap<&str, usize>,
) -> f64 {
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    for (i, gene) in gene_ids.iter().enumerate() {
        if let Some(&feature_idx) = gene_index.get(gene.as_str()) {
            xs.push(reference_profile[i] as f64);
            ys.push(cluster_features[feature_idx].mean);
        }
    }
    pearson(&xs, &ys)
}

fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (&x, &y) in xs.iter().zip(ys.iter()) {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x) * (x - mean_x);
        var_y += (y - mean_y) * (y - mean_y);
    }
    if var_x <= 1e-12 || var_y <= 1e-12 {
        return 0.0;
    }
    cov / (var_x.sqrt() * var_y.sqrt())
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

    struct FailingDownloader;
    impl Downloader for FailingDownloader {
        fn download(&self, _url: &str) -> Result<Vec<u8>, EngineError> {
            Err(EngineError::resource_load_failure("cell_labelling", "network unavailable"))
        }
    }

    fn toy_feature_annotations() -> FeatureAnnotations {
        FeatureAnnotations {
            ids: vec!["g1".to_string(), "g2".to_string()],
            symbols: vec!["G1".to_string(), "G2".to_string()],
            feature_types: vec![None, None],
        }
    }

    fn toy_markers() -> MarkerResult {
        MarkerResult {
            n_groups: 1,
            per_group: vec![vec![
                MarkerGroupFeature { mean: 5.0, detected: 1.0, cohens_d: 1.0, min_cohens_d: 1.0, log_fc: 1.0, delta_detected: 0.0, auc: 0.8, rank: 1 },
                MarkerGroupFeature { mean: 0.1, detected: 0.1, cohens_d: -1.0, min_cohens_d: -1.0, log_fc: -1.0, delta_detected: 0.0, auc: 0.2, rank: 2 },
            ]],
        }
    }

    #[test]
    fn classifies_cluster_against_best_matching_label() {
        let reference_text = "g1\tg2\nt_cell\t5.0\t0.1\nb_cell\t0.1\t5.0\n";
        let downloader = FakeDownloader(reference_text);
        let mut labelling = CellLabelling::new();
        let params = CellLabellingParams { references: vec!["human_primary_cell_atlas".to_string()], ..Default::default() };
        labelling.compute(&toy_markers(), &toy_feature_annotations(), &Annotations::new(), &params, &downloader, true);
        assert_eq!(labelling.fetch_assignments()[0].label, "t_cell");
    }

    #[test]
    fn resource_load_failure_leaves_that_reference_empty() {
        let mut labelling = CellLabelling::new();
        let params = CellLabellingParams { references: vec!["mouse_rnaseq".to_string()], ..Default::default() };
        labelling.compute(&toy_markers(), &toy_feature_annotations(), &Annotations::new(), &params, &FailingDownloader, true);
        assert_eq!(labelling.fetch_assignments()[0].label, "");
    }

    #[test]
    fn automatic_mode_matches_reference_genes_against_symbols_not_ids() {
        // The reference's gene vocabulary only overlaps the symbols column
        // ("G1"/"G2"), not the IDs column ("g1"/"g2"); automatic mode must
        // pick the symbols column to find any overlap at all.
        let reference_text = "G1\tG2\nt_cell\t5.0\t0.1\nb_cell\t0.1\t5.0\n";
        let downloader = FakeDownloader(reference_text);
        let mut labelling = CellLabelling::new();
        let params = CellLabellingParams {
            references: vec!["human_primary_cell_atlas".to_string()],
            automatic: true,
            ..Default::default()
        };
        labelling.compute(&toy_markers(), &toy_feature_annotations(), &Annotations::new(), &params, &downloader, true);
        assert_eq!(labelling.fetch_assignments()[0].label, "t_cell");
    }

    #[test]
    fn automatic_species_gating_skips_mismatched_reference() {
        let downloader = FakeDownloader("g1\tg2\nt_cell\t5.0\t0.1\n");
        let mut labelling = CellLabelling::new();
        let mut annotations = Annotations::new();
        annotations.insert("species", Annotation::factor_from_strings(&["mouse".to_string()]));
        let params = CellLabellingParams {
            references: vec!["human_primary_cell_atlas".to_string()],
            automatic: true,
            ..Default::default()
        };
        labelling.compute(&toy_markers(), &toy_feature_annotations(), &annotations, &params, &downloader, true);
        assert_eq!(labelling.fetch_assignments()[0].label, "");
    }
}

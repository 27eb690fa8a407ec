//! The full per-step parameter surface (spec §6) gathered into one
//! record, plus JSON override loading for the CLI's `--params` file.
//!
//! Each step already owns its own `Params` type and `defaults()`/`Default`
//! constructor; this module only adds the aggregate record the driver
//! threads through `run_analysis` and a hand-rolled `serde_json::Value`
//! overlay (rather than deriving `Deserialize` on every step's `Params`
//! struct) so a partial JSON file only needs to name the fields it wants
//! to change, and legacy aliases can be translated in one place before
//! they reach a step.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

use crate::error::EngineError;
use crate::steps::batch_correction::{BatchCorrectionMethod, BatchCorrectionParams};
use crate::steps::cell_filtering::CellFilteringParams;
use crate::steps::clustering::{
    ChooseClusteringParams, ClusteringMethod, KMeansClusterParams, SnnGraphClusterParams,
};
use crate::steps::combine_embeddings::CombineEmbeddingsParams;
use crate::steps::embeddings::{TsneEmbeddingParams, UmapEmbeddingParams};
use crate::steps::enrichment::{Effect, FeatureSetEnrichmentParams};
use crate::steps::feature_selection::FeatureSelectionParams;
use crate::steps::inputs::InputsParams;
use crate::steps::labelling::CellLabellingParams;
use crate::steps::markers::MarkerDetectionParams;
use crate::steps::neighbor_index::NeighborIndexParams;
use crate::steps::normalization::AdtNormalizationParams;
use crate::steps::pca::{parse_block_method, PcaParams};
use crate::steps::quality_control::{AdtParams, CrisprParams, RnaParams};
use crate::kernels::snn_kernel::SnnScheme;

#[derive(Debug, Clone)]
pub struct PipelineParams {
    pub inputs: InputsParams,
    pub rna_quality_control: RnaParams,
    pub adt_quality_control: AdtParams,
    pub crispr_quality_control: CrisprParams,
    pub cell_filtering: CellFilteringParams,
    pub rna_pca: PcaParams,
    pub adt_pca: PcaParams,
    pub crispr_pca: PcaParams,
    pub feature_selection: FeatureSelectionParams,
    pub combine_embeddings: CombineEmbeddingsParams,
    pub batch_correction: BatchCorrectionParams,
    pub neighbor_index: NeighborIndexParams,
    pub tsne: TsneEmbeddingParams,
    pub umap: UmapEmbeddingParams,
    pub kmeans_cluster: KMeansClusterParams,
    pub snn_graph_cluster: SnnGraphClusterParams,
    pub choose_clustering: ChooseClusteringParams,
    pub marker_detection: MarkerDetectionParams,
    pub adt_normalization: AdtNormalizationParams,
    pub cell_labelling: CellLabellingParams,
    pub feature_set_enrichment: FeatureSetEnrichmentParams,
    pub enrichment_effect: Effect,
}

impl Default for PipelineParams {
    fn default() -> Self {
        PipelineParams {
            inputs: InputsParams::default(),
            rna_quality_control: RnaParams::default(),
            adt_quality_control: AdtParams::default(),
            crispr_quality_control: CrisprParams::default(),
            cell_filtering: CellFilteringParams::defaults(),
            rna_pca: PcaParams::defaults_rna(),
            adt_pca: PcaParams::defaults_other(),
            crispr_pca: PcaParams::defaults_other(),
            feature_selection: FeatureSelectionParams::default(),
            combine_embeddings: CombineEmbeddingsParams::default(),
            batch_correction: BatchCorrectionParams::default(),
            neighbor_index: NeighborIndexParams::default(),
            tsne: TsneEmbeddingParams::default(),
            umap: UmapEmbeddingParams::default(),
            kmeans_cluster: KMeansClusterParams::default(),
            snn_graph_cluster: SnnGraphClusterParams::default(),
            choose_clustering: ChooseClusteringParams::default(),
            marker_detection: MarkerDetectionParams::default(),
            adt_normalization: AdtNormalizationParams::default(),
            cell_labelling: CellLabellingParams::default(),
            feature_set_enrichment: FeatureSetEnrichmentParams::default(),
            enrichment_effect: Effect::Any,
        }
    }
}

impl PipelineParams {
    /// Loads a JSON overrides file shaped `{"<step>": {"<field>": value, ...}}`
    /// and applies it on top of the defaults.
    pub fn load(path: &Path) -> Result<PipelineParams, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|source| EngineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: Value = serde_json::from_str(&text)
            .map_err(|e| EngineError::invalid_parameter("params", format!("malformed JSON: {e}")))?;
        let mut params = PipelineParams::default();
        params.apply_overrides(&raw)?;
        Ok(params)
    }

    pub fn apply_overrides(&mut self, raw: &Value) -> Result<(), EngineError> {
        let Some(map) = raw.as_object() else {
            return Err(EngineError::invalid_parameter("params", "overrides root must be a JSON object"));
        };

        if let Some(v) = map.get("inputs") {
            if let Some(s) = str_field(v, "sample_factor") {
                self.inputs.sample_factor = Some(s);
            }
            if let Some(arr) = v.get("subset").and_then(Value::as_array) {
                self.inputs.subset = Some(arr.iter().filter_map(Value::as_u64).map(|n| n as u32).collect());
            }
        }
        if let Some(v) = map.get("rna_quality_control") {
            apply_bool(v, "use_mito_default", &mut self.rna_quality_control.use_mito_default);
            apply_string(v, "mito_prefix", &mut self.rna_quality_control.mito_prefix);
            apply_f64(v, "nmads", &mut self.rna_quality_control.nmads);
        }
        if let Some(v) = map.get("adt_quality_control") {
            apply_string(v, "igg_prefix", &mut self.adt_quality_control.igg_prefix);
            apply_f64(v, "nmads", &mut self.adt_quality_control.nmads);
            apply_f64(v, "min_detected_drop", &mut self.adt_quality_control.min_detected_drop);
        }
        if let Some(v) = map.get("crispr_quality_control") {
            apply_f64(v, "nmads", &mut self.crispr_quality_control.nmads);
        }
        if let Some(v) = map.get("cell_filtering") {
            apply_bool(v, "use_rna", &mut self.cell_filtering.use_rna);
            apply_bool(v, "use_adt", &mut self.cell_filtering.use_adt);
            apply_bool(v, "use_crispr", &mut self.cell_filtering.use_crispr);
        }
        apply_pca_overrides(map.get("rna_pca"), &mut self.rna_pca)?;
        apply_pca_overrides(map.get("adt_pca"), &mut self.adt_pca)?;
        apply_pca_overrides(map.get("crispr_pca"), &mut self.crispr_pca)?;
        if let Some(v) = map.get("feature_selection") {
            apply_f64(v, "span", &mut self.feature_selection.span);
        }
        if let Some(v) = map.get("combine_embeddings") {
            apply_bool(v, "approximate", &mut self.combine_embeddings.approximate);
            if let Some(weights) = v.get("weights").and_then(Value::as_object) {
                let mut map = BTreeMap::new();
                for (k, val) in weights {
                    if let Some(f) = val.as_f64() {
                        map.insert(k.clone(), f as f32);
                    }
                }
                self.combine_embeddings.weights = Some(map);
            }
        }
        if let Some(v) = map.get("batch_correction") {
            if let Some(method) = str_field(v, "method") {
                self.batch_correction.method = match method.as_str() {
                    "mnn" => BatchCorrectionMethod::Mnn,
                    _ => BatchCorrectionMethod::None,
                };
            }
            apply_usize(v, "num_neighbors", &mut self.batch_correction.num_neighbors);
            apply_bool(v, "approximate", &mut self.batch_correction.approximate);
        }
        if let Some(v) = map.get("neighbor_index") {
            apply_bool(v, "approximate", &mut self.neighbor_index.approximate);
        }
        if let Some(v) = map.get("tsne") {
            apply_f64(v, "perplexity", &mut self.tsne.perplexity);
            apply_usize(v, "iterations", &mut self.tsne.iterations);
            apply_bool(v, "animate", &mut self.tsne.animate);
        }
        if let Some(v) = map.get("umap") {
            apply_usize(v, "num_neighbors", &mut self.umap.num_neighbors);
            apply_usize(v, "num_epochs", &mut self.umap.num_epochs);
            apply_f64(v, "min_dist", &mut self.umap.min_dist);
            apply_bool(v, "animate", &mut self.umap.animate);
        }
        if let Some(v) = map.get("kmeans_cluster") {
            apply_usize(v, "k", &mut self.kmeans_cluster.k);
        }
        if let Some(v) = map.get("snn_graph_cluster") {
            apply_usize(v, "k", &mut self.snn_graph_cluster.k);
            apply_f32(v, "resolution", &mut self.snn_graph_cluster.resolution);
            if let Some(scheme) = str_field(v, "scheme") {
                self.snn_graph_cluster.scheme = match scheme.as_str() {
                    "jaccard" => SnnScheme::Jaccard,
                    "number" => SnnScheme::Number,
                    _ => SnnScheme::Rank,
                };
            }
        }
        if let Some(v) = map.get("choose_clustering") {
            if let Some(method) = str_field(v, "method") {
                self.choose_clustering.method = match method.as_str() {
                    "kmeans" => ClusteringMethod::KMeans,
                    _ => ClusteringMethod::SnnGraph,
                };
            }
        }
        if let Some(v) = map.get("marker_detection") {
            apply_f64(v, "lfc_threshold", &mut self.marker_detection.lfc_threshold);
            apply_bool(v, "compute_auc", &mut self.marker_detection.compute_auc);
        }
        if let Some(v) = map.get("adt_normalization") {
            apply_usize(v, "num_pcs", &mut self.adt_normalization.num_pcs);
            apply_usize(v, "num_clusters", &mut self.adt_normalization.num_clusters);
        }
        if let Some(v) = map.get("cell_labelling") {
            apply_string_vec(v, "references", &mut self.cell_labelling.references);
            apply_bool(v, "automatic", &mut self.cell_labelling.automatic);
            apply_opt_string(v, "species", &mut self.cell_labelling.species);
            apply_opt_string(v, "gene_id_column", &mut self.cell_labelling.gene_id_column);
            apply_opt_string(v, "gene_id_type", &mut self.cell_labelling.gene_id_type);
        }
        if let Some(v) = map.get("feature_set_enrichment") {
            apply_string_vec(v, "collections", &mut self.feature_set_enrichment.collections);
            apply_bool(v, "automatic", &mut self.feature_set_enrichment.automatic);
            apply_opt_string(v, "species", &mut self.feature_set_enrichment.species);
            apply_opt_string(v, "gene_id_column", &mut self.feature_set_enrichment.gene_id_column);
            apply_opt_string(v, "gene_id_type", &mut self.feature_set_enrichment.gene_id_type);
            apply_usize(v, "top_markers", &mut self.feature_set_enrichment.top_markers);
            if let Some(effect) = str_field(v, "effect") {
                self.enrichment_effect = match effect.as_str() {
                    "up" => Effect::Up,
                    "down" => Effect::Down,
                    _ => Effect::Any,
                };
            }
        }
        Ok(())
    }
}

fn apply_pca_overrides(raw: Option<&Value>, params: &mut PcaParams) -> Result<(), EngineError> {
    let Some(v) = raw else { return Ok(()) };
    if let Some(n) = v.get("num_hvgs") {
        params.num_hvgs = if n.is_null() { None } else { n.as_u64().map(|n| n as usize) };
    }
    apply_usize(v, "num_pcs", &mut params.num_pcs);
    if let Some(method) = str_field(v, "block_method") {
        params.block_method = parse_block_method(&method)?;
    }
    Ok(())
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(|s| s.to_string())
}

fn apply_bool(v: &Value, key: &str, out: &mut bool) {
    if let Some(b) = v.get(key).and_then(Value::as_bool) {
        *out = b;
    }
}

fn apply_string(v: &Value, key: &str, out: &mut String) {
    if let Some(s) = str_field(v, key) {
        *out = s;
    }
}

fn apply_opt_string(v: &Value, key: &str, out: &mut Option<String>) {
    if let Some(s) = str_field(v, key) {
        *out = Some(s);
    }
}

fn apply_string_vec(v: &Value, key: &str, out: &mut Vec<String>) {
    if let Some(arr) = v.get(key).and_then(Value::as_array) {
        *out = arr.iter().filter_map(|e| e.as_str().map(|s| s.to_string())).collect();
    }
}

fn apply_f64(v: &Value, key: &str, out: &mut f64) {
    if let Some(f) = v.get(key).and_then(Value::as_f64) {
        *out = f;
    }
}

fn apply_f32(v: &Value, key: &str, out: &mut f32) {
    if let Some(f) = v.get(key).and_then(Value::as_f64) {
        *out = f as f32;
    }
}

fn apply_usize(v: &Value, key: &str, out: &mut usize) {
    if let Some(n) = v.get(key).and_then(Value::as_u64) {
        *out = n as usize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_overrides_are_a_no_op() {
        let mut params = PipelineParams::default();
        let before = params.rna_quality_control.nmads;
        params.apply_overrides(&serde_json::json!({})).unwrap();
        assert_eq!(params.rna_quality_control.nmads, before);
    }

    #[test]
    fn overrides_a_single_nested_field() {
        let mut params = PipelineParams::default();
        params
            .apply_overrides(&serde_json::json!({"rna_quality_control": {"nmads": 5.0}}))
            .unwrap();
        assert_eq!(params.rna_quality_control.nmads, 5.0);
        assert_eq!(params.rna_quality_control.mito_prefix, "MT-");
    }

    #[test]
    fn legacy_block_method_alias_translates_through_overrides() {
        let mut params = PipelineParams::default();
        params
            .apply_overrides(&serde_json::json!({"rna_pca": {"block_method": "weight"}}))
            .unwrap();
        assert_eq!(params.rna_pca.block_method, crate::kernels::pca_kernel::BlockMethod::Project);
    }
}

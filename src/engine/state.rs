//! Persisted-state binary container (spec §4.16, §6 "hierarchical
//! container", §9 legacy aliasing): a `KSCE`-magic, versioned, CRC64-guarded
//! header wrapping a gzip-compressed JSON payload that holds the full
//! parameter record plus the handful of results a caller can inspect on a
//! restored engine before the next `run_analysis` call (spec §8 "Restore and
//! extend").
//!
//! Grounded on `input::organelle_bin`'s header layout (magic/version/
//! endianness-tag/header_size fields, `crc64_ecma` checksum computed with
//! the checksum field itself zeroed, mmap-based reading) generalized from a
//! sparse-matrix container to an engine-state one. The payload is decoded
//! through `engine::params::PipelineParams::apply_overrides`, so the legacy
//! PCA `block_method` aliases ("weight"/"block") translate on read through
//! the same path a live JSON overrides file uses — no separate alias table
//! here.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use memmap2::Mmap;
use serde_json::{json, Value};

use crate::error::EngineError;
use crate::input::organelle_bin::crc64_ecma;
use crate::kernels::pca_kernel::BlockMethod;
use crate::kernels::snn_kernel::SnnScheme;
use crate::steps::batch_correction::BatchCorrectionMethod;
use crate::steps::clustering::ClusteringMethod;
use crate::steps::enrichment::Effect;
use crate::steps::labelling::ClusterLabel;
use crate::steps::markers::{MarkerGroupFeature, MarkerResult};
use crate::steps::pca::PcaParams;

use super::params::PipelineParams;
use super::Engine;

const MAGIC: &[u8; 4] = b"KSCE";
const VERSION_MAJOR: u16 = 1;
const VERSION_MINOR: u16 = 0;
const ENDIAN_TAG: u32 = 0x1234_5678;
const HEADER_SIZE: usize = 256;

/// Writes `engine`'s declared cell count, full parameter record, and
/// restorable results (cluster assignments, per-modality markers, cell
/// labels) to `path`.
pub fn write_state(path: &Path, engine: &Engine, params: &PipelineParams) -> Result<(), EngineError> {
    let declared_cells = engine.inputs.n_cells() as u64;
    let payload = json!({
        "declared_cells": declared_cells,
        "params": params_to_json(params),
        "results": results_to_json(engine),
    });
    let payload_bytes = serde_json::to_vec(&payload)
        .map_err(|e| EngineError::Corrupt(format!("failed to encode state: {e}")))?;
    let compressed = gzip_compress(&payload_bytes)?;

    let mut header = vec![0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
    header[6..8].copy_from_slice(&VERSION_MINOR.to_le_bytes());
    header[8..12].copy_from_slice(&ENDIAN_TAG.to_le_bytes());
    header[12..16].copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
    header[16..24].copy_from_slice(&declared_cells.to_le_bytes());
    header[24..32].copy_from_slice(&(HEADER_SIZE as u64).to_le_bytes());
    header[32..40].copy_from_slice(&(compressed.len() as u64).to_le_bytes());
    let file_bytes = HEADER_SIZE as u64 + compressed.len() as u64;
    header[40..48].copy_from_slice(&file_bytes.to_le_bytes());
    // header_crc64 (bytes 48..56) is computed over the header with this
    // field itself zeroed, then patched in below.
    let crc = crc64_ecma(&header);
    header[48..56].copy_from_slice(&crc.to_le_bytes());

    let mut file = File::create(path).map_err(|source| EngineError::Io { path: path.to_path_buf(), source })?;
    file.write_all(&header).map_err(|source| EngineError::Io { path: path.to_path_buf(), source })?;
    file.write_all(&compressed).map_err(|source| EngineError::Io { path: path.to_path_buf(), source })?;
    Ok(())
}

/// A decoded persisted state, ready to be folded into a fresh `Engine` and
/// `PipelineParams` via [`PersistedState::restore_into`].
pub struct PersistedState {
    pub declared_cells: usize,
    pub params: PipelineParams,
    results: Value,
}

impl PersistedState {
    /// Materializes this state's cached results onto `engine` (spec §9
    /// "materialize real result objects ... rather than shim objects") and
    /// arms the `_loaded` tripwire so the next `run_analysis` call forces a
    /// full cascade of recomputation (spec §5c).
    pub fn restore_into(&self, engine: &mut Engine) {
        restore_results(engine, &self.results);
        engine.mark_restored();
    }

    /// Checks the state's declared cell count against a freshly loaded
    /// `Inputs` (spec §7 `StateMismatch`: "Restored state's declared number
    /// of cells differs from loaded inputs"). Called after the first
    /// `run_analysis` following a restore, once `Inputs` has actually
    /// loaded something to compare against.
    pub fn verify_cell_count(&self, loaded_cells: usize) -> Result<(), EngineError> {
        if loaded_cells != self.declared_cells {
            return Err(EngineError::StateMismatch { declared_cells: self.declared_cells, loaded_cells });
        }
        Ok(())
    }
}

/// Reads and validates a state file written by [`write_state`].
pub fn read_state(path: &Path) -> Result<PersistedState, EngineError> {
    let file = File::open(path).map_err(|source| EngineError::Io { path: path.to_path_buf(), source })?;
    let mmap = unsafe { Mmap::map(&file) }.map_err(|source| EngineError::Io { path: path.to_path_buf(), source })?;
    let bytes = &mmap[..];

    if bytes.len() < HEADER_SIZE {
        return Err(EngineError::Corrupt("state file too small".to_string()));
    }
    if &bytes[0..4] != MAGIC {
        return Err(EngineError::Corrupt("invalid magic; expected KSCE".to_string()));
    }
    let version_major = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
    let version_minor = u16::from_le_bytes(bytes[6..8].try_into().unwrap());
    if version_major != VERSION_MAJOR || version_minor != VERSION_MINOR {
        return Err(EngineError::Corrupt(format!("unsupported state version {version_major}.{version_minor}")));
    }
    let endian_tag = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    if endian_tag != ENDIAN_TAG {
        return Err(EngineError::Corrupt("unsupported endianness tag".to_string()));
    }
    let header_size = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
    if header_size != HEADER_SIZE {
        return Err(EngineError::Corrupt(format!("invalid header_size; expected {HEADER_SIZE}")));
    }

    let declared_cells = u64::from_le_bytes(bytes[16..24].try_into().unwrap()) as usize;
    let payload_offset = u64::from_le_bytes(bytes[24..32].try_into().unwrap()) as usize;
    let payload_bytes = u64::from_le_bytes(bytes[32..40].try_into().unwrap()) as usize;
    let file_bytes = u64::from_le_bytes(bytes[40..48].try_into().unwrap()) as usize;
    let stored_crc = u64::from_le_bytes(bytes[48..56].try_into().unwrap());

    if file_bytes != bytes.len() {
        return Err(EngineError::Corrupt("file_bytes does not match file length".to_string()));
    }
    let mut header_copy = bytes[0..HEADER_SIZE].to_vec();
    header_copy[48..56].fill(0);
    if crc64_ecma(&header_copy) != stored_crc {
        return Err(EngineError::Corrupt("header_crc64 mismatch".to_string()));
    }
    if payload_offset + payload_bytes > bytes.len() {
        return Err(EngineError::Corrupt("payload out of bounds".to_string()));
    }

    let compressed = &bytes[payload_offset..payload_offset + payload_bytes];
    let raw = gzip_decompress(compressed)?;
    let payload: Value = serde_json::from_slice(&raw)
        .map_err(|e| EngineError::Corrupt(format!("malformed state payload: {e}")))?;

    let declared_cells = payload
        .get("declared_cells")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(declared_cells);

    let mut params = PipelineParams::default();
    if let Some(raw_params) = payload.get("params") {
        params.apply_overrides(raw_params)?;
    }
    let results = payload.get("results").cloned().unwrap_or(Value::Null);

    Ok(PersistedState { declared_cells, params, results })
}

fn gzip_compress(bytes: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|e| EngineError::Corrupt(format!("failed to compress state: {e}")))?;
    encoder
        .finish()
        .map_err(|e| EngineError::Corrupt(format!("failed to compress state: {e}")))
}

fn gzip_decompress(bytes: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| EngineError::Corrupt(format!("failed to decompress state: {e}")))?;
    Ok(out)
}

fn pca_params_to_json(p: &PcaParams) -> Value {
    json!({
        "num_hvgs": p.num_hvgs,
        "num_pcs": p.num_pcs,
        "block_method": match p.block_method {
            BlockMethod::None => "none",
            BlockMethod::Regress => "regress",
            BlockMethod::Project => "project",
        },
    })
}

/// Dumps every field `PipelineParams::apply_overrides` knows how to read
/// back, so `PipelineParams::default()` plus `apply_overrides` on this
/// value round-trips exactly (spec §8 "round-trip" property).
fn params_to_json(params: &PipelineParams) -> Value {
    json!({
        "inputs": {
            "sample_factor": params.inputs.sample_factor,
            "subset": params.inputs.subset,
        },
        "rna_quality_control": {
            "use_mito_default": params.rna_quality_control.use_mito_default,
            "mito_prefix": params.rna_quality_control.mito_prefix,
            "nmads": params.rna_quality_control.nmads,
        },
        "adt_quality_control": {
            "igg_prefix": params.adt_quality_control.igg_prefix,
            "nmads": params.adt_quality_control.nmads,
            "min_detected_drop": params.adt_quality_control.min_detected_drop,
        },
        "crispr_quality_control": {
            "nmads": params.crispr_quality_control.nmads,
        },
        "cell_filtering": {
            "use_rna": params.cell_filtering.use_rna,
            "use_adt": params.cell_filtering.use_adt,
            "use_crispr": params.cell_filtering.use_crispr,
        },
        "rna_pca": pca_params_to_json(&params.rna_pca),
        "adt_pca": pca_params_to_json(&params.adt_pca),
        "crispr_pca": pca_params_to_json(&params.crispr_pca),
        "feature_selection": {
            "span": params.feature_selection.span,
        },
        "combine_embeddings": {
            "approximate": params.combine_embeddings.approximate,
            "weights": params.combine_embeddings.weights,
        },
        "batch_correction": {
            "method": match params.batch_correction.method {
                BatchCorrectionMethod::Mnn => "mnn",
                BatchCorrectionMethod::None => "none",
            },
            "num_neighbors": params.batch_correction.num_neighbors,
            "approximate": params.batch_correction.approximate,
        },
        "neighbor_index": {
            "approximate": params.neighbor_index.approximate,
        },
        "tsne": {
            "perplexity": params.tsne.perplexity,
            "iterations": params.tsne.iterations,
            "animate": params.tsne.animate,
        },
        "umap": {
            "num_neighbors": params.umap.num_neighbors,
            "num_epochs": params.umap.num_epochs,
            "min_dist": params.umap.min_dist,
            "animate": params.umap.animate,
        },
        "kmeans_cluster": {
            "k": params.kmeans_cluster.k,
        },
        "snn_graph_cluster": {
            "k": params.snn_graph_cluster.k,
            "resolution": params.snn_graph_cluster.resolution,
            "scheme": match params.snn_graph_cluster.scheme {
                SnnScheme::Jaccard => "jaccard",
                SnnScheme::Number => "number",
                SnnScheme::Rank => "rank",
            },
        },
        "choose_clustering": {
            "method": match params.choose_clustering.method {
                ClusteringMethod::KMeans => "kmeans",
                ClusteringMethod::SnnGraph => "snn_graph",
            },
        },
        "marker_detection": {
            "lfc_threshold": params.marker_detection.lfc_threshold,
            "compute_auc": params.marker_detection.compute_auc,
        },
        "adt_normalization": {
            "num_pcs": params.adt_normalization.num_pcs,
            "num_clusters": params.adt_normalization.num_clusters,
        },
        "cell_labelling": {
            "references": params.cell_labelling.references,
            "automatic": params.cell_labelling.automatic,
            "species": params.cell_labelling.species,
            "gene_id_column": params.cell_labelling.gene_id_column,
            "gene_id_type": params.cell_labelling.gene_id_type,
        },
        "feature_set_enrichment": {
            "collections": params.feature_set_enrichment.collections,
            "automatic": params.feature_set_enrichment.automatic,
            "species": params.feature_set_enrichment.species,
            "gene_id_column": params.feature_set_enrichment.gene_id_column,
            "gene_id_type": params.feature_set_enrichment.gene_id_type,
            "top_markers": params.feature_set_enrichment.top_markers,
            "effect": match params.enrichment_effect {
                Effect::Up => "up",
                Effect::Down => "down",
                Effect::Any => "any",
            },
        },
    })
}

fn marker_result_to_json(result: &MarkerResult) -> Value {
    let per_group: Vec<Value> = result
        .per_group
        .iter()
        .map(|features| {
            Value::Array(
                features
                    .iter()
                    .map(|f| {
                        json!({
                            "mean": f.mean,
                            "detected": f.detected,
                            "cohens_d": f.cohens_d,
                            "min_cohens_d": f.min_cohens_d,
                            "log_fc": f.log_fc,
                            "delta_detected": f.delta_detected,
                            "auc": f.auc,
                            "rank": f.rank,
                        })
                    })
                    .collect(),
            )
        })
        .collect();
    json!({ "n_groups": result.n_groups, "per_group": per_group })
}

fn marker_group_feature_from_json(f: &Value) -> Option<MarkerGroupFeature> {
    let cohens_d = f.get("cohens_d")?.as_f64()?;
    Some(MarkerGroupFeature {
        mean: f.get("mean")?.as_f64()?,
        detected: f.get("detected")?.as_f64()?,
        cohens_d,
        // Absent on files written before the min/mean pairwise-aggregation
        // rework; such files only ever had a single pooled contrast, so
        // min and mean coincide.
        min_cohens_d: f.get("min_cohens_d").and_then(Value::as_f64).unwrap_or(cohens_d),
        log_fc: f.get("log_fc")?.as_f64()?,
        delta_detected: f.get("delta_detected")?.as_f64()?,
        auc: f.get("auc")?.as_f64()?,
        rank: f.get("rank")?.as_u64()? as u32,
    })
}

fn features_vec_from_json(group: &Value) -> Option<Vec<MarkerGroupFeature>> {
    group.as_array()?.iter().map(marker_group_feature_from_json).collect()
}

/// Reads the per-group feature arrays from either the current layout
/// (`per_group`, a positionally-ordered array) or spec §6's two legacy
/// marker layouts: a flat `clusters` array (same shape as `per_group`,
/// just the old key name) or a keyed `per_cluster` map from string group
/// ID to that group's feature array.
fn read_legacy_per_group(value: &Value) -> Option<Vec<Vec<MarkerGroupFeature>>> {
    if let Some(groups) = value.get("per_group").and_then(Value::as_array) {
        return groups.iter().map(features_vec_from_json).collect();
    }
    if let Some(groups) = value.get("clusters").and_then(Value::as_array) {
        return groups.iter().map(features_vec_from_json).collect();
    }
    if let Some(map) = value.get("per_cluster").and_then(Value::as_object) {
        let mut entries: Vec<(usize, &Value)> =
            map.iter().filter_map(|(k, v)| k.parse::<usize>().ok().map(|idx| (idx, v))).collect();
        entries.sort_by_key(|(idx, _)| *idx);
        let n_groups = entries.last().map(|(idx, _)| idx + 1).unwrap_or(0);
        let mut per_group = vec![Vec::new(); n_groups];
        for (idx, v) in entries {
            per_group[idx] = features_vec_from_json(v)?;
        }
        return Some(per_group);
    }
    None
}

/// Reorders `per_group` (as read off disk, in whatever order the file
/// stored it) into the canonical position-is-group-id order this crate
/// uses internally, per spec §6's "legacy permutation vs. identities
/// keys": an old `permutation` key gives, for each stored slot, the
/// canonical group ID it belongs at; a newer `identities` key lists the
/// canonical group ID already occupying each stored slot (so a
/// reordering is only needed when it isn't already the identity
/// sequence `0, 1, 2, ...`).
fn reorder_legacy_groups(value: &Value, mut per_group: Vec<Vec<MarkerGroupFeature>>) -> Option<Vec<Vec<MarkerGroupFeature>>> {
    if let Some(permutation) = value.get("permutation").and_then(Value::as_array) {
        let targets: Vec<usize> = permutation.iter().filter_map(|v| v.as_u64().map(|n| n as usize)).collect();
        if targets.len() != per_group.len() {
            return None;
        }
        let n_groups = targets.iter().copied().max().map(|m| m + 1).unwrap_or(0);
        let mut reordered = vec![Vec::new(); n_groups];
        for (slot, features) in per_group.into_iter().enumerate() {
            reordered[targets[slot]] = features;
        }
        return Some(reordered);
    }
    if let Some(identities) = value.get("identities").and_then(Value::as_array) {
        let ids: Vec<usize> = identities.iter().filter_map(|v| v.as_u64().map(|n| n as usize)).collect();
        if ids.len() != per_group.len() {
            return None;
        }
        if ids.iter().enumerate().all(|(slot, &id)| slot == id) {
            return Some(per_group);
        }
        let n_groups = ids.iter().copied().max().map(|m| m + 1).unwrap_or(0);
        let mut reordered = vec![Vec::new(); n_groups];
        for (slot, features) in per_group.drain(..).enumerate() {
            reordered[ids[slot]] = features;
        }
        return Some(reordered);
    }
    Some(per_group)
}

fn marker_result_from_json(value: &Value) -> Option<MarkerResult> {
    let per_group = read_legacy_per_group(value)?;
    let per_group = reorder_legacy_groups(value, per_group)?;
    let n_groups = value.get("n_groups").and_then(Value::as_u64).map(|n| n as usize).unwrap_or(per_group.len());
    Some(MarkerResult { n_groups, per_group })
}

/// The subset of an engine's cached results worth restoring without a
/// re-run (spec §8 "Restore and extend": "without calling `run_analysis`,
/// read clusterings and markers — values match").
fn results_to_json(engine: &Engine) -> Value {
    let clusters: Vec<Value> = engine.choose_clustering.fetch_assignments().iter().map(|&c| json!(c)).collect();

    let mut markers = serde_json::Map::new();
    for modality in ["RNA", "ADT", "CRISPR"] {
        if let Some(result) = engine.marker_detection.fetch_result(modality) {
            markers.insert(modality.to_string(), marker_result_to_json(result));
        }
    }

    let labels: Vec<Value> = engine
        .cell_labelling
        .fetch_assignments()
        .iter()
        .map(|l| json!({ "label": l.label, "reference": l.reference, "score": l.score }))
        .collect();

    json!({ "clusters": clusters, "markers": markers, "cell_labels": labels })
}

fn restore_results(engine: &mut Engine, results: &Value) {
    if let Some(clusters) = results.get("clusters").and_then(Value::as_array) {
        let assignments: Vec<u32> = clusters.iter().filter_map(|v| v.as_u64()).map(|v| v as u32).collect();
        if !assignments.is_empty() {
            engine.choose_clustering.restore_assignments(assignments);
        }
    }
    if let Some(markers) = results.get("markers").and_then(Value::as_object) {
        for (modality, value) in markers {
            if let Some(result) = marker_result_from_json(value) {
                engine.marker_detection.restore_result(modality.clone(), result);
            }
        }
    }
    if let Some(labels) = results.get("cell_labels").and_then(Value::as_array) {
        let assignments: Vec<ClusterLabel> = labels
            .iter()
            .map(|v| ClusterLabel {
                label: v.get("label").and_then(Value::as_str).unwrap_or_default().to_string(),
                reference: v.get("reference").and_then(Value::as_str).unwrap_or_default().to_string(),
                score: v.get("score").and_then(Value::as_f64).unwrap_or(0.0),
            })
            .collect();
        if !assignments.is_empty() {
            engine.cell_labelling.restore_assignments(assignments);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_params_and_results() {
        let mut engine = Engine::new();
        engine.choose_clustering.restore_assignments(vec![0, 0, 1, 1]);
        engine.marker_detection.restore_result(
            "RNA".to_string(),
            MarkerResult {
                n_groups: 2,
                per_group: vec![
                    vec![MarkerGroupFeature { mean: 1.0, detected: 0.5, cohens_d: 0.2, min_cohens_d: 0.2, log_fc: 0.1, delta_detected: 0.0, auc: 0.6, rank: 1 }],
                    vec![MarkerGroupFeature { mean: 2.0, detected: 0.8, cohens_d: 0.4, min_cohens_d: 0.4, log_fc: 0.3, delta_detected: 0.1, auc: 0.7, rank: 1 }],
                ],
            },
        );

        let mut params = PipelineParams::default();
        params.rna_quality_control.nmads = 4.5;
        params.rna_pca.block_method = BlockMethod::Project;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        write_state(&path, &engine, &params).unwrap();

        let restored = read_state(&path).unwrap();
        assert_eq!(restored.declared_cells, 0);
        assert_eq!(restored.params.rna_quality_control.nmads, 4.5);
        assert_eq!(restored.params.rna_pca.block_method, BlockMethod::Project);

        let mut fresh = Engine::new();
        restored.restore_into(&mut fresh);
        assert_eq!(fresh.choose_clustering.fetch_assignments(), &[0, 0, 1, 1]);
        assert_eq!(fresh.marker_detection.fetch_result("RNA").unwrap().n_groups, 2);
    }

    #[test]
    fn reads_legacy_flat_clusters_marker_layout() {
        let value = json!({
            "clusters": [
                [{"mean": 1.0, "detected": 0.5, "cohens_d": 0.2, "log_fc": 0.1, "delta_detected": 0.0, "auc": 0.6, "rank": 1}],
                [{"mean": 2.0, "detected": 0.8, "cohens_d": 0.4, "log_fc": 0.3, "delta_detected": 0.1, "auc": 0.7, "rank": 1}],
            ],
        });
        let result = marker_result_from_json(&value).unwrap();
        assert_eq!(result.n_groups, 2);
        assert_eq!(result.per_group[1][0].mean, 2.0);
    }

    #[test]
    fn reads_legacy_keyed_per_cluster_marker_layout() {
        let value = json!({
            "per_cluster": {
                "1": [{"mean": 2.0, "detected": 0.8, "cohens_d": 0.4, "log_fc": 0.3, "delta_detected": 0.1, "auc": 0.7, "rank": 1}],
                "0": [{"mean": 1.0, "detected": 0.5, "cohens_d": 0.2, "log_fc": 0.1, "delta_detected": 0.0, "auc": 0.6, "rank": 1}],
            },
        });
        let result = marker_result_from_json(&value).unwrap();
        assert_eq!(result.n_groups, 2);
        assert_eq!(result.per_group[0][0].mean, 1.0);
        assert_eq!(result.per_group[1][0].mean, 2.0);
    }

    #[test]
    fn reorders_legacy_permutation_group_slots() {
        let value = json!({
            "per_group": [
                [{"mean": 2.0, "detected": 0.8, "cohens_d": 0.4, "log_fc": 0.3, "delta_detected": 0.1, "auc": 0.7, "rank": 1}],
                [{"mean": 1.0, "detected": 0.5, "cohens_d": 0.2, "log_fc": 0.1, "delta_detected": 0.0, "auc": 0.6, "rank": 1}],
            ],
            "permutation": [1, 0],
        });
        let result = marker_result_from_json(&value).unwrap();
        assert_eq!(result.per_group[0][0].mean, 1.0);
        assert_eq!(result.per_group[1][0].mean, 2.0);
    }

    #[test]
    fn rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"too short").unwrap();
        let err = read_state(&path).unwrap_err();
        assert!(matches!(err, EngineError::Corrupt(_)));
    }

    #[test]
    fn verify_cell_count_flags_mismatch() {
        let state = PersistedState { declared_cells: 10, params: PipelineParams::default(), results: Value::Null };
        let err = state.verify_cell_count(12).unwrap_err();
        assert!(matches!(err, EngineError::StateMismatch { declared_cells: 10, loaded_cells: 12 }));
    }
}

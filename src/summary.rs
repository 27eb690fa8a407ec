//! Human-readable JSON run summary, written by the `run`/`resume` CLI
//! subcommands alongside the binary persisted state.
//!
//! Grounded on the teacher's `report::json::render_summary_json`: the same
//! hand-assembled `push_kv_str`/`push_kv_num`/`push_kv_bool` string-building
//! style (deterministic key order, no dependency on `serde_json::to_string`
//! for output formatting — `serde_json::Value` is reserved for the
//! parameter overrides/persisted-state machinery in `engine::params` and
//! `engine::state`) rather than deriving `Serialize` on every result type.

use std::fmt::Write;

use crate::engine::params::PipelineParams;
use crate::engine::Engine;

/// Renders a summary of one `Engine`'s current results as a JSON string.
pub fn render_run_summary(engine: &Engine, params: &PipelineParams) -> String {
    let mut out = String::new();
    out.push('{');

    push_kv_str(&mut out, "tool", "kira-sc-engine");
    out.push(',');
    push_kv_num(&mut out, "n_cells", engine.inputs.n_cells() as f64);
    out.push(',');
    push_kv_num(&mut out, "n_filtered_cells", engine.cell_filtering.n_filtered_cells() as f64);
    out.push(',');

    out.push_str("\"modalities\":[");
    for (i, modality) in engine.inputs.fetch_matrices().modalities().enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_str_val(&mut out, modality);
    }
    out.push_str("],");

    out.push_str("\"quality_control\":{");
    push_kv_bool(&mut out, "rna_valid", engine.rna_quality_control.valid());
    out.push(',');
    push_kv_bool(&mut out, "adt_valid", engine.adt_quality_control.valid());
    out.push(',');
    push_kv_bool(&mut out, "crispr_valid", engine.crispr_quality_control.valid());
    out.push('}');
    out.push(',');

    out.push_str("\"embeddings\":{");
    push_kv_bool(&mut out, "combine_embeddings_valid", engine.combine_embeddings.valid());
    out.push(',');
    push_kv_bool(&mut out, "neighbor_index_valid", engine.neighbor_index.valid());
    out.push('}');
    out.push(',');

    out.push_str("\"clustering\":{");
    push_kv_str(
        &mut out,
        "method",
        match params.choose_clustering.method {
            crate::steps::clustering::ClusteringMethod::KMeans => "kmeans",
            crate::steps::clustering::ClusteringMethod::SnnGraph => "snn_graph",
        },
    );
    out.push(',');
    let assignments = engine.choose_clustering.fetch_assignments();
    push_kv_num(&mut out, "n_cells_assigned", assignments.len() as f64);
    out.push(',');
    push_kv_num(&mut out, "n_clusters", count_distinct(assignments) as f64);
    out.push('}');
    out.push(',');

    out.push_str("\"markers\":{");
    for (i, modality) in ["RNA", "ADT", "CRISPR"].iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        push_str_key(&mut out, modality);
        out.push(':');
        match engine.marker_detection.fetch_result(modality) {
            Some(result) => {
                let _ = write!(out, "{}", result.n_groups);
            }
            None => out.push_str("null"),
        }
    }
    out.push('}');
    out.push(',');

    out.push_str("\"cell_labelling\":[");
    for (i, label) in engine.cell_labelling.fetch_assignments().iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('{');
        push_kv_str(&mut out, "label", &label.label);
        out.push(',');
        push_kv_str(&mut out, "reference", &label.reference);
        out.push(',');
        push_kv_num(&mut out, "score", label.score);
        out.push('}');
    }
    out.push(']');

    out.push('}');
    out
}

fn count_distinct(values: &[u32]) -> usize {
    let mut seen: Vec<u32> = values.to_vec();
    seen.sort_unstable();
    seen.dedup();
    seen.len()
}

fn push_kv_str(out: &mut String, key: &str, value: &str) {
    push_str_key(out, key);
    out.push(':');
    push_str_val(out, value);
}

fn push_kv_num(out: &mut String, key: &str, value: f64) {
    push_str_key(out, key);
    out.push(':');
    let _ = write!(out, "{:.6}", value);
}

fn push_kv_bool(out: &mut String, key: &str, value: bool) {
    push_str_key(out, key);
    out.push(':');
    out.push_str(if value { "true" } else { "false" });
}

fn push_str_key(out: &mut String, key: &str) {
    out.push('"');
    out.push_str(&escape_json(key));
    out.push('"');
}

fn push_str_val(out: &mut String, value: &str) {
    out.push('"');
    out.push_str(&escape_json(value));
    out.push('"');
}

fn escape_json(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_empty_engine_without_panicking() {
        let engine = Engine::new();
        let params = PipelineParams::default();
        let json = render_run_summary(&engine, &params);
        assert!(json.starts_with('{'));
        assert!(json.ends_with('}'));
        assert!(json.contains("\"n_cells\":0"));
    }

    #[test]
    fn reports_cluster_count_and_marker_groups() {
        let mut engine = Engine::new();
        engine.choose_clustering.restore_assignments(vec![0, 0, 1, 2, 2]);
        engine.marker_detection.restore_result(
            "RNA".to_string(),
            crate::steps::markers::MarkerResult { n_groups: 3, per_group: vec![Vec::new(); 3] },
        );
        let params = PipelineParams::default();
        let json = render_run_summary(&engine, &params);
        assert!(json.contains("\"n_clusters\":3"));
        assert!(json.contains("\"RNA\":3"));
        assert!(json.contains("\"ADT\":null"));
    }
}

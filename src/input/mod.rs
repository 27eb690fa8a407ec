//! Dataset discovery, alternative-modality detection, and multi-dataset
//! merge (spec §4.2).
//!
//! Grounded on the teacher's `input::load_input_tenx` (file discovery,
//! sequential parse-features/parse-barcodes/read-matrix pipeline), extended
//! two ways the teacher never needed: splitting one MTX triple into several
//! per-modality matrices by feature type, and merging several dataset
//! directories into one `MultiMatrix` + `Annotations` + `BlockFactor`. The
//! `GeneIndex` gene-symbol-collapsing concept is dropped entirely — see
//! DESIGN.md.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub mod barcodes;
pub mod cache;
pub mod features;
pub mod meta;
pub mod mtx;
pub mod organelle_bin;

use barcodes::parse_barcodes;
use features::{FeatureRow, parse_features};
use meta::load_meta;
use mtx::{find_matrix_path, read_mtx_csc};

use crate::data::annotation::{Annotation, Annotations, FeatureAnnotations};
use crate::data::block::BlockFactor;
use crate::data::matrix::{Matrix, MatrixStorage, Modality, MultiMatrix, SparseCsc};
use crate::error::InputError;

const ALT_MODALITY_MARKERS: &[(&str, &str)] =
    &[("adt", "ADT"), ("antibody", "ADT"), ("crispr", "CRISPR")];

/// One dataset directory's worth of raw input, already split by detected
/// modality. Columns are in on-disk barcode order; nothing has been
/// filtered yet.
#[derive(Debug, Clone)]
pub struct RawDataset {
    pub key: String,
    pub n_cells: usize,
    pub barcodes: Vec<String>,
    pub modalities: BTreeMap<Modality, (SparseCsc<i64>, FeatureAnnotations)>,
    pub annotations: Annotations,
}

/// Loads one dataset directory: a 10x MTX triple (`matrix.mtx[.gz]`,
/// `features.tsv[.gz]`/`genes.tsv[.gz]`, `barcodes.tsv[.gz]`) plus optional
/// per-cell metadata, splitting the matrix into per-modality sub-matrices
/// by the feature-type column (spec §4.2 "alternative modality ... promoted
/// to a separate entry").
pub fn load_dataset(
    key: impl Into<String>,
    input_dir: &Path,
    meta_path: Option<&Path>,
) -> Result<RawDataset, InputError> {
    let key = key.into();
    let mtx_path = find_matrix_path(input_dir)?;
    let features_path = find_features_path(input_dir)?;
    let barcodes_path = find_barcodes_path(input_dir)?;

    crate::info!(
        "dataset {}: mtx={}, features={}, barcodes={}",
        key,
        mtx_path.display(),
        features_path.display(),
        barcodes_path.display()
    );

    let features = parse_features(&features_path)?;
    let n_features_raw = features.len();
    let barcodes = parse_barcodes(&barcodes_path)?;
    let n_cells = barcodes.len();

    let csc = read_mtx_csc(&mtx_path, n_features_raw, n_cells)?;

    let mut rows_by_modality: BTreeMap<Modality, Vec<usize>> = BTreeMap::new();
    for (idx, feature) in features.iter().enumerate() {
        rows_by_modality
            .entry(detect_modality(feature.feature_type.as_deref()))
            .or_default()
            .push(idx);
    }

    let mut modalities = BTreeMap::new();
    for (modality, rows) in rows_by_modality {
        let sub_csc = subset_rows(&csc, &rows);
        let feat_ann = feature_annotations_for(&features, &rows);
        modalities.insert(modality, (sub_csc, feat_ann));
    }

    let mut annotations = Annotations::new();
    if let Some(path) = meta_path {
        let meta = load_meta(path, &barcodes)?;
        for (col_idx, name) in meta.columns.iter().enumerate() {
            let values: Vec<String> = meta.rows.iter().map(|r| r[col_idx].clone()).collect();
            annotations.insert(name.clone(), Annotation::factor_from_strings(&values));
        }
    }

    Ok(RawDataset {
        key,
        n_cells,
        barcodes,
        modalities,
        annotations,
    })
}

fn feature_annotations_for(features: &[FeatureRow], rows: &[usize]) -> FeatureAnnotations {
    FeatureAnnotations {
        ids: rows.iter().map(|&i| features[i].id.clone()).collect(),
        symbols: rows.iter().map(|&i| features[i].symbol.clone()).collect(),
        feature_types: rows
            .iter()
            .map(|&i| features[i].feature_type.clone())
            .collect(),
    }
}

fn select_feature_annotations(source: &FeatureAnnotations, rows: &[usize]) -> FeatureAnnotations {
    FeatureAnnotations {
        ids: rows.iter().map(|&i| source.ids[i].clone()).collect(),
        symbols: rows.iter().map(|&i| source.symbols[i].clone()).collect(),
        feature_types: rows
            .iter()
            .map(|&i| source.feature_types[i].clone())
            .collect(),
    }
}

fn detect_modality(feature_type: Option<&str>) -> Modality {
    if let Some(ft) = feature_type {
        let lower = ft.to_ascii_lowercase();
        for (marker, name) in ALT_MODALITY_MARKERS {
            if lower.contains(marker) {
                return (*name).to_string();
            }
        }
    }
    "RNA".to_string()
}

fn subset_rows(csc: &SparseCsc<i64>, rows: &[usize]) -> SparseCsc<i64> {
    if rows.len() == csc.n_rows {
        return csc.clone();
    }
    let mut remap: BTreeMap<u32, u32> = BTreeMap::new();
    for (new_idx, &old_idx) in rows.iter().enumerate() {
        remap.insert(old_idx as u32, new_idx as u32);
    }
    let cols = csc
        .cols
        .iter()
        .map(|col| {
            col.iter()
                .filter_map(|&(r, v)| remap.get(&r).map(|&nr| (nr, v)))
                .collect()
        })
        .collect();
    SparseCsc {
        n_rows: rows.len(),
        n_cols: csc.n_cols,
        cols,
    }
}

/// The outcome of loading/merging one or more datasets: ready to be handed
/// to `CellFiltering` once QC has run.
#[derive(Debug, Clone)]
pub struct MergedInputs {
    pub matrices: MultiMatrix,
    pub annotations: Annotations,
    pub block: Option<BlockFactor>,
    pub feature_annotations: BTreeMap<Modality, FeatureAnnotations>,
}

/// Merges one or more loaded datasets (spec §4.2). With a single dataset,
/// this is a pass-through (modalities copied as-is, no synthetic block
/// factor — `sample_factor` handling, which also yields a block factor for
/// the single-dataset case, lives in `crate::steps::inputs` since it reads
/// a parameter rather than dataset identity).
///
/// With more than one dataset: datasets are ordered by a stable sort of
/// their keys; for each modality present in *every* dataset, features are
/// intersected by feature ID (the "best-matching identifier type" the spec
/// allows for — this reader only ever has feature IDs to intersect on) and
/// columns are concatenated in dataset order; a synthetic block factor is
/// generated with level = dataset key per column; annotation columns are
/// unioned across datasets, missing values filled as null.
pub fn merge_datasets(mut datasets: Vec<RawDataset>) -> Result<MergedInputs, InputError> {
    if datasets.is_empty() {
        return Err(InputError::InvalidInput("no datasets provided".to_string()));
    }
    datasets.sort_by(|a, b| a.key.cmp(&b.key));

    if datasets.len() == 1 {
        let ds = datasets.into_iter().next().unwrap();
        let mut matrices = MultiMatrix::new();
        let mut feature_annotations = BTreeMap::new();
        for (modality, (csc, feat_ann)) in ds.modalities {
            let row_ids = (0..csc.n_rows as u32).collect();
            matrices.insert(
                modality.clone(),
                Matrix {
                    storage: MatrixStorage::SparseCounts(csc),
                    row_ids,
                },
            );
            feature_annotations.insert(modality, feat_ann);
        }
        return Ok(MergedInputs {
            matrices,
            annotations: ds.annotations,
            block: None,
            feature_annotations,
        });
    }

    let common_modalities = common_modalities(&datasets);
    if common_modalities.is_empty() {
        return Err(InputError::InvalidInput(
            "no modality common across all datasets".to_string(),
        ));
    }
    for ds in &datasets {
        if ds.modalities.values().next().is_none() {
            return Err(InputError::InvalidInput(format!(
                "dataset {} has no feature annotations",
                ds.key
            )));
        }
    }

    let mut matrices = MultiMatrix::new();
    let mut feature_annotations = BTreeMap::new();

    for modality in &common_modalities {
        let (shared_ids, per_dataset_rows) = intersect_feature_ids(&datasets, modality);
        if shared_ids.is_empty() {
            return Err(InputError::InvalidInput(format!(
                "modality {} has no features common across datasets",
                modality
            )));
        }

        let total_cols: usize = datasets.iter().map(|d| d.n_cells).sum();
        let mut merged = SparseCsc::<i64>::new(shared_ids.len(), total_cols);
        let mut col_offset = 0usize;
        for (ds, rows) in datasets.iter().zip(per_dataset_rows.iter()) {
            let (csc, _) = &ds.modalities[modality];
            let mut remap: BTreeMap<u32, u32> = BTreeMap::new();
            for (shared_idx, &orig_row) in rows.iter().enumerate() {
                remap.insert(orig_row as u32, shared_idx as u32);
            }
            for c in 0..ds.n_cells {
                let mut entries: Vec<(u32, i64)> = csc.cols[c]
                    .iter()
                    .filter_map(|&(r, v)| remap.get(&r).map(|&nr| (nr, v)))
                    .collect();
                entries.sort_by_key(|&(r, _)| r);
                merged.cols[col_offset + c] = entries;
            }
            col_offset += ds.n_cells;
        }

        let first_rows = &per_dataset_rows[0];
        let (_, first_feat_ann) = &datasets[0].modalities[modality];
        let feat_ann = select_feature_annotations(first_feat_ann, first_rows);

        matrices.insert(
            modality.clone(),
            Matrix {
                storage: MatrixStorage::SparseCounts(merged),
                row_ids: (0..shared_ids.len() as u32).collect(),
            },
        );
        feature_annotations.insert(modality.clone(), feat_ann);
    }

    let mut block_levels = Vec::with_capacity(datasets.len());
    let mut block_indices = Vec::new();
    for (block_id, ds) in datasets.iter().enumerate() {
        block_levels.push(ds.key.clone());
        block_indices.extend(std::iter::repeat(block_id as u32).take(ds.n_cells));
    }
    let block = BlockFactor {
        levels: block_levels,
        indices: block_indices,
    };

    let mut batch_values = Vec::with_capacity(block.len());
    for ds in &datasets {
        batch_values.extend(std::iter::repeat(ds.key.clone()).take(ds.n_cells));
    }
    let mut annotations = union_annotations(&datasets);
    annotations.insert("__batch__", Annotation::factor_from_strings(&batch_values));

    Ok(MergedInputs {
        matrices,
        annotations,
        block: Some(block),
        feature_annotations,
    })
}

fn common_modalities(datasets: &[RawDataset]) -> Vec<Modality> {
    let mut counts: BTreeMap<Modality, usize> = BTreeMap::new();
    for ds in datasets {
        for modality in ds.modalities.keys() {
            *counts.entry(modality.clone()).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .filter(|&(_, n)| n == datasets.len())
        .map(|(m, _)| m)
        .collect()
}

/// Intersects feature IDs for one modality across all datasets, preserving
/// the first dataset's ID order, and returns for each dataset the row
/// indices (into its own per-modality feature table) selected in that
/// shared order.
fn intersect_feature_ids(
    datasets: &[RawDataset],
    modality: &str,
) -> (Vec<String>, Vec<Vec<usize>>) {
    let first_ids = &datasets[0].modalities[modality].1.ids;
    let mut shared: Vec<String> = Vec::new();
    for id in first_ids {
        let present_everywhere = datasets
            .iter()
            .all(|ds| ds.modalities[modality].1.ids.iter().any(|x| x == id));
        if present_everywhere {
            shared.push(id.clone());
        }
    }

    let mut per_dataset_rows = Vec::with_capacity(datasets.len());
    for ds in datasets {
        let ids = &ds.modalities[modality].1.ids;
        let rows: Vec<usize> = shared
            .iter()
            .map(|id| ids.iter().position(|x| x == id).unwrap())
            .collect();
        per_dataset_rows.push(rows);
    }

    (shared, per_dataset_rows)
}

fn union_annotations(datasets: &[RawDataset]) -> Annotations {
    let mut names: Vec<String> = Vec::new();
    for ds in datasets {
        for name in ds.annotations.names() {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }

    let mut out = Annotations::new();
    for name in names {
        let mut values: Vec<String> = Vec::new();
        for ds in datasets {
            match ds.annotations.get(&name) {
                Some(Annotation::Factor { levels, indices }) => {
                    for idx in indices {
                        values.push(idx.map(|i| levels[i as usize].clone()).unwrap_or_default());
                    }
                }
                Some(Annotation::Numeric(v)) => {
                    for value in v {
                        values.push(value.to_string());
                    }
                }
                None => values.extend(std::iter::repeat(String::new()).take(ds.n_cells)),
            }
        }
        out.insert(name, Annotation::factor_from_strings(&values));
    }
    out
}

fn find_features_path(input_dir: &Path) -> Result<PathBuf, InputError> {
    let candidates = [
        "features.tsv",
        "features.tsv.gz",
        "genes.tsv",
        "genes.tsv.gz",
    ];
    for name in candidates {
        let path = input_dir.join(name);
        if path.exists() {
            return Ok(path);
        }
    }
    Err(InputError::MissingInput(
        "missing features.tsv(.gz) or genes.tsv".to_string(),
    ))
}

fn find_barcodes_path(input_dir: &Path) -> Result<PathBuf, InputError> {
    let candidates = ["barcodes.tsv", "barcodes.tsv.gz"];
    for name in candidates {
        let path = input_dir.join(name);
        if path.exists() {
            return Ok(path);
        }
    }
    Err(InputError::MissingInput(
        "missing barcodes.tsv or barcodes.tsv.gz".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_dataset(dir: &Path, n_cells: usize, genes: &[&str], cell_offset: i64) {
        let mut features = std::fs::File::create(dir.join("features.tsv")).unwrap();
        for (i, g) in genes.iter().enumerate() {
            writeln!(features, "ENSG{}\t{}\tGene Expression", i, g).unwrap();
        }
        drop(features);

        let mut barcodes = std::fs::File::create(dir.join("barcodes.tsv")).unwrap();
        for c in 0..n_cells {
            writeln!(barcodes, "BC{}", c).unwrap();
        }
        drop(barcodes);

        let mut mtx = std::fs::File::create(dir.join("matrix.mtx")).unwrap();
        writeln!(mtx, "%%MatrixMarket matrix coordinate integer general").unwrap();
        writeln!(mtx, "{} {} {}", genes.len(), n_cells, n_cells).unwrap();
        for c in 0..n_cells {
            writeln!(mtx, "1 {} {}", c + 1, cell_offset + c as i64 + 1).unwrap();
        }
        drop(mtx);
    }

    #[test]
    fn single_dataset_pass_through_has_no_block_factor() {
        let dir = tempfile::tempdir().unwrap();
        write_dataset(dir.path(), 3, &["CD3D", "CD4"], 0);
        let ds = load_dataset("d1", dir.path(), None).unwrap();
        let merged = merge_datasets(vec![ds]).unwrap();
        assert!(merged.block.is_none());
        assert_eq!(merged.matrices.get("RNA").unwrap().n_cols(), 3);
    }

    #[test]
    fn two_dataset_merge_produces_batch_annotation_and_block_factor() {
        let d1 = tempfile::tempdir().unwrap();
        write_dataset(d1.path(), 100, &["CD3D", "CD4", "CD8A", "MS4A1", "NKG7"], 0);
        let d2 = tempfile::tempdir().unwrap();
        write_dataset(d2.path(), 200, &["CD3D", "CD4", "CD8A", "MS4A1", "NKG7"], 0);

        let ds1 = load_dataset("d1", d1.path(), None).unwrap();
        let ds2 = load_dataset("d2", d2.path(), None).unwrap();
        let merged = merge_datasets(vec![ds1, ds2]).unwrap();

        let rna = merged.matrices.get("RNA").unwrap();
        assert_eq!(rna.n_cols(), 300);
        assert_eq!(rna.n_rows(), 5);

        let block = merged.block.unwrap();
        assert_eq!(block.levels, vec!["d1", "d2"]);
        assert_eq!(block.indices.iter().filter(|&&b| b == 0).count(), 100);
        assert_eq!(block.indices.iter().filter(|&&b| b == 1).count(), 200);

        match merged.annotations.get("__batch__").unwrap() {
            Annotation::Factor { levels, indices } => {
                assert_eq!(levels, &vec!["d1".to_string(), "d2".to_string()]);
                assert_eq!(indices[0], Some(0));
                assert_eq!(indices[150], Some(1));
            }
            _ => panic!("expected factor"),
        }
    }

    #[test]
    fn detects_alt_modality_case_insensitively() {
        assert_eq!(detect_modality(Some("Antibody Capture")), "ADT");
        assert_eq!(detect_modality(Some("CRISPR Guide Capture")), "CRISPR");
        assert_eq!(detect_modality(Some("Gene Expression")), "RNA");
        assert_eq!(detect_modality(None), "RNA");
    }
}

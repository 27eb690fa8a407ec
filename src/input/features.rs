//! `features.tsv[.gz]` / `genes.tsv[.gz]` parsing.
//!
//! Grounded on the teacher's `input::features::parse_features`, with the
//! `GeneIndex` symbol-deduplication concept removed: a general per-modality
//! `Matrix` keeps one row per raw feature, not one row per collapsed gene
//! symbol.

use std::io::BufRead;
use std::path::Path;

use crate::error::InputError;
use crate::input::cache::open_maybe_gz;

#[derive(Debug, Clone)]
pub struct FeatureRow {
    pub id: String,
    pub symbol: String,
    pub feature_type: Option<String>,
}

pub fn parse_features(path: &Path) -> Result<Vec<FeatureRow>, InputError> {
    let mut reader = open_maybe_gz(path)?;
    let mut buf = String::new();
    let mut features = Vec::new();
    let mut line_no = 0usize;

    loop {
        buf.clear();
        let read = reader.read_line(&mut buf)?;
        if read == 0 {
            break;
        }
        line_no += 1;
        let line = buf.trim_end();
        if line.is_empty() {
            continue;
        }
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 2 {
            return Err(InputError::Parse(format!(
                "features line {} has <2 columns",
                line_no
            )));
        }
        let id = cols[0].trim().to_string();
        let symbol = cols[1].trim().to_string();
        let feature_type = if cols.len() >= 3 {
            Some(cols[2].trim().to_string())
        } else {
            None
        };
        features.push(FeatureRow {
            id,
            symbol,
            feature_type,
        });
    }

    if features.is_empty() {
        return Err(InputError::Parse("features file is empty".to_string()));
    }

    Ok(features)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_v3_features_with_type_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.tsv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "ENSG1\tCD3D\tGene Expression").unwrap();
        writeln!(f, "ADT1\tCD4\tAntibody Capture").unwrap();
        drop(f);

        let rows = parse_features(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].feature_type.as_deref(), Some("Gene Expression"));
        assert_eq!(rows[1].symbol, "CD4");
    }

    #[test]
    fn rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.tsv");
        std::fs::File::create(&path).unwrap();
        let err = parse_features(&path).unwrap_err();
        assert!(matches!(err, InputError::Parse(_)));
    }
}

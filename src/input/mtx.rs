//! MatrixMarket (10x `matrix.mtx[.gz]`) reader producing a column-major
//! sparse integer matrix, one row per raw feature (no gene-level
//! deduplication — that was a nuclear-QC-specific step in the teacher and
//! has no place in a general per-modality Matrix).
//!
//! Grounded on the teacher's `input::mtx::read_mtx_csc`, with the
//! `GeneIndex` collapsing step removed.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use crate::data::matrix::SparseCsc;
use crate::error::InputError;
use crate::input::cache::open_maybe_gz;

pub fn find_matrix_path(input_dir: &Path) -> Result<PathBuf, InputError> {
    let plain = input_dir.join("matrix.mtx");
    if plain.exists() {
        return Ok(plain);
    }
    let gz = input_dir.join("matrix.mtx.gz");
    if gz.exists() {
        return Ok(gz);
    }
    Err(InputError::MissingInput(
        "missing matrix.mtx or matrix.mtx.gz".to_string(),
    ))
}

pub fn read_mtx_csc(
    path: &Path,
    n_features_raw: usize,
    n_cells: usize,
) -> Result<SparseCsc<i64>, InputError> {
    let mut reader = open_maybe_gz(path)?;
    let mut buf = String::new();

    buf.clear();
    let read = reader.read_line(&mut buf)?;
    if read == 0 {
        return Err(InputError::Parse("matrix.mtx is empty".to_string()));
    }
    let header = buf.trim_end();
    if !header.starts_with("%%MatrixMarket") {
        return Err(InputError::Parse("missing MatrixMarket header".to_string()));
    }

    let (rows, cols, _nnz) = loop {
        buf.clear();
        let n = reader.read_line(&mut buf)?;
        if n == 0 {
            return Err(InputError::Parse("missing matrix size line".to_string()));
        }
        let line = buf.trim_end();
        if line.starts_with('%') || line.is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let row_raw = parts.next();
        let col_raw = parts.next();
        let nnz_raw = parts.next();
        if row_raw.is_none() || col_raw.is_none() || nnz_raw.is_none() {
            return Err(InputError::Parse("invalid matrix size line".to_string()));
        }
        let rows: usize = row_raw
            .unwrap()
            .parse()
            .map_err(|_| InputError::Parse("invalid row count".to_string()))?;
        let cols: usize = col_raw
            .unwrap()
            .parse()
            .map_err(|_| InputError::Parse("invalid column count".to_string()))?;
        let nnz: usize = nnz_raw
            .unwrap()
            .parse()
            .map_err(|_| InputError::Parse("invalid nnz count".to_string()))?;
        break (rows, cols, nnz);
    };

    if rows != n_features_raw {
        return Err(InputError::InvalidInput(format!(
            "matrix row count {} does not match features {}",
            rows, n_features_raw
        )));
    }
    if cols != n_cells {
        return Err(InputError::InvalidInput(format!(
            "matrix column count {} does not match barcodes {}",
            cols, n_cells
        )));
    }

    let mut per_col: Vec<BTreeMap<u32, i64>> = vec![BTreeMap::new(); cols];

    let mut line_no = 0usize;
    loop {
        buf.clear();
        let n = reader.read_line(&mut buf)?;
        if n == 0 {
            break;
        }
        line_no += 1;
        let line = buf.trim_end();
        if line.is_empty() || line.starts_with('%') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let row_raw = parts.next();
        let col_raw = parts.next();
        let val_raw = parts.next();
        if row_raw.is_none() || col_raw.is_none() || val_raw.is_none() {
            return Err(InputError::Parse(format!(
                "invalid matrix entry at line {}",
                line_no
            )));
        }
        let row: usize = row_raw
            .unwrap()
            .parse()
            .map_err(|_| InputError::Parse("invalid row index".to_string()))?;
        let col: usize = col_raw
            .unwrap()
            .parse()
            .map_err(|_| InputError::Parse("invalid col index".to_string()))?;
        let val: i64 = val_raw
            .unwrap()
            .parse()
            .map_err(|_| InputError::Parse("invalid value".to_string()))?;
        if row == 0 || row > rows || col == 0 || col > cols {
            return Err(InputError::Parse(format!(
                "matrix entry out of bounds at line {}",
                line_no
            )));
        }
        if val == 0 {
            continue;
        }
        let feature_idx = (row - 1) as u32;
        let col_idx = col - 1;
        let entry = per_col[col_idx].entry(feature_idx).or_insert(0);
        *entry += val;
    }

    let mut cols_vec: Vec<Vec<(u32, i64)>> = Vec::with_capacity(cols);
    for map in per_col {
        cols_vec.push(map.into_iter().collect());
    }

    Ok(SparseCsc {
        n_rows: rows,
        n_cols: cols,
        cols: cols_vec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_small_mtx_into_csc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.mtx");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "%%MatrixMarket matrix coordinate integer general").unwrap();
        writeln!(f, "2 3 3").unwrap();
        writeln!(f, "1 1 5").unwrap();
        writeln!(f, "2 1 2").unwrap();
        writeln!(f, "1 3 7").unwrap();
        drop(f);

        let csc = read_mtx_csc(&path, 2, 3).unwrap();
        assert_eq!(csc.n_rows, 2);
        assert_eq!(csc.n_cols, 3);
        assert_eq!(csc.cols[0], vec![(0, 5), (1, 2)]);
        assert_eq!(csc.cols[1], vec![]);
        assert_eq!(csc.cols[2], vec![(0, 7)]);
    }

    #[test]
    fn rejects_mismatched_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.mtx");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "%%MatrixMarket matrix coordinate integer general").unwrap();
        writeln!(f, "2 3 0").unwrap();
        drop(f);

        let err = read_mtx_csc(&path, 5, 3).unwrap_err();
        assert!(matches!(err, InputError::InvalidInput(_)));
    }
}

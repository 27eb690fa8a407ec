//! `barcodes.tsv[.gz]` parsing. Unchanged from the teacher beyond the
//! shared error type.

use std::io::BufRead;
use std::path::Path;

use crate::error::InputError;
use crate::input::cache::open_maybe_gz;

pub fn parse_barcodes(path: &Path) -> Result<Vec<String>, InputError> {
    let mut reader = open_maybe_gz(path)?;
    let mut buf = String::new();
    let mut barcodes = Vec::new();

    loop {
        buf.clear();
        let read = reader.read_line(&mut buf)?;
        if read == 0 {
            break;
        }
        let line = buf.trim_end();
        if line.is_empty() {
            continue;
        }
        barcodes.push(line.trim().to_string());
    }

    if barcodes.is_empty() {
        return Err(InputError::Parse("barcodes file is empty".to_string()));
    }

    Ok(barcodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_one_barcode_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("barcodes.tsv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "AAACCTGAGAAACCAT-1").unwrap();
        writeln!(f, "AAACCTGAGAAACCTA-1").unwrap();
        drop(f);

        let barcodes = parse_barcodes(&path).unwrap();
        assert_eq!(barcodes, vec!["AAACCTGAGAAACCAT-1", "AAACCTGAGAAACCTA-1"]);
    }
}

//! Gzip-transparent file opening and a small content hash used to
//! fingerprint dataset descriptors (spec §4.2 "cached fingerprints of
//! input descriptors ... short-circuit reloading").
//!
//! Grounded directly on the teacher's `input::cache` (`open_maybe_gz`,
//! `hash_file`/`hash_bytes` via a hand-rolled FNV-1a). `open_maybe_gz`
//! decodes through `flate2` rather than the teacher's own shelling out to
//! the `gzip` binary, since the crate already declares `flate2` for this
//! exact purpose. The teacher's own normalized-matrix disk cache
//! (`write_normalized_cache`/`read_normalized_cache`, a nuclear-QC-specific
//! format) has no counterpart in this spec and is dropped — see DESIGN.md.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::bufread::GzDecoder;

use crate::error::InputError;

pub fn open_maybe_gz(path: &Path) -> Result<Box<dyn BufRead>, InputError> {
    let file = File::open(path)?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(BufReader::new(GzDecoder::new(BufReader::new(file)))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

pub fn hash_file(path: &Path) -> Result<u64, InputError> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; 8192];
    let mut hasher = Fnv64::new();
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

pub fn hash_bytes(data: &[u8]) -> u64 {
    let mut hasher = Fnv64::new();
    hasher.update(data);
    hasher.finish()
}

struct Fnv64 {
    hash: u64,
}

impl Fnv64 {
    fn new() -> Self {
        Self {
            hash: 0xcbf29ce484222325,
        }
    }

    fn update(&mut self, data: &[u8]) {
        let mut h = self.hash;
        for &b in data {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        self.hash = h;
    }

    fn finish(&self) -> u64 {
        self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_bytes_is_deterministic() {
        assert_eq!(hash_bytes(b"hello"), hash_bytes(b"hello"));
        assert_ne!(hash_bytes(b"hello"), hash_bytes(b"world"));
    }
}

//! Numeric kernels (spec §1: "out of scope ... treated as library calls
//! with typed signatures"). Implemented here as narrow, self-contained
//! functions over `ndarray`/`rayon` so the crate is actually exercisable
//! end to end without fabricating a dependency on an external bioinformatics
//! stack that does not exist for Rust in this ecosystem.
//!
//! Grounded on `GeneralLotkaVolterra-rs`'s numeric style: dense `Array1`/
//! `Array2` buffers, explicit index loops rather than combinator chains for
//! the hot paths, `rayon`/`ndarray::parallel` for the embarrassingly
//! parallel per-cell or per-row work.

pub mod hypergeometric;
pub mod kmeans_kernel;
pub mod marker_stats;
pub mod mnn_kernel;
pub mod neighbors;
pub mod pca_kernel;
pub mod qc_metrics;
pub mod snn_kernel;
pub mod tsne_kernel;
pub mod umap_kernel;

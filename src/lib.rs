//! `kira_sc_engine`: an incremental analysis engine for multi-modal
//! single-cell count data (spec §1-2).
//!
//! Module layout mirrors the teacher's flat `src/` tree (`input` at the
//! crate root, no nested `lib/` indirection) rather than introducing a
//! workspace; `data`, `steps`, `engine`, and `summary` are new top-level
//! modules replacing the teacher's `model`/`panels`/`pipeline`/`report` for
//! this crate's own domain. The teacher's nuclear-QC-specific modules
//! (`model/`, `panels/`, `pipeline/`, `report/`, `simd/`, the old `tracing`
//! macro file) have no counterpart in SPEC_FULL.md and were removed once
//! this crate's own modules covered everything they were kept around for.

#[macro_use]
pub mod tracing_setup;

pub mod data;
pub mod engine;
pub mod error;
pub mod input;
pub mod kernels;
pub mod steps;
pub mod summary;

//! The step contract shared by every pipeline component (spec §4.1).
//!
//! Grounded on the teacher's stage functions (`pipeline::stageN_*::run_stageN`,
//! each taking the previous stage's output plus a params struct and
//! returning a freshly allocated result) generalized with an explicit
//! cached-parameters/`changed` contract, since the teacher's pipeline is a
//! single-pass CLI with no re-run/caching story at all.
//!
//! Every step in `crate::steps` embeds a `ChangeTracker<P>` for its own
//! parameter type `P` and follows the same rule:
//!
//! ```text
//! self.changed = upstream_changed || (parameters != cached_parameters)
//! ```
//!
//! `fetch_*` getters return borrows of the step's own cache (`&self`); the
//! borrow checker naturally prevents holding one across a later `&mut self`
//! `compute` call on the *same* step. Driver code (spec §5, "all step
//! `compute` calls are serialized") never holds a getter's borrow past the
//! point where it calls `compute` again, so this needs no generation
//! counter or unsafe aliasing games — see DESIGN.md for why the `fetch_*`
//! pattern doesn't need the arena machinery spec §9 sketches.

pub mod batch_correction;
pub mod cell_filtering;
pub mod clustering;
pub mod combine_embeddings;
pub mod custom_selections;
pub mod embeddings;
pub mod enrichment;
pub mod feature_selection;
pub mod inputs;
pub mod labelling;
pub mod markers;
pub mod neighbor_index;
pub mod normalization;
pub mod pca;
pub mod quality_control;

/// Tracks a step's cached parameters and derives `changed` from the
/// uniform rule in spec §4.1.
#[derive(Debug, Clone, Default)]
pub struct ChangeTracker<P> {
    cached: Option<P>,
}

impl<P: Clone + PartialEq> ChangeTracker<P> {
    pub fn new() -> Self {
        ChangeTracker { cached: None }
    }

    /// Updates the cached record and returns whether this step should
    /// recompute: true if the upstream changed, or if `params` differs
    /// from the previously cached record (including the first call, where
    /// there is no cached record yet).
    pub fn update(&mut self, params: &P, upstream_changed: bool) -> bool {
        let changed = upstream_changed || self.cached.as_ref() != Some(params);
        self.cached = Some(params.clone());
        changed
    }

    pub fn cached(&self) -> Option<&P> {
        self.cached.as_ref()
    }

    /// Drops the cached record so the next `update` unconditionally
    /// reports `changed = true`, regardless of `upstream_changed`. Used by
    /// `_loaded`-style forced invalidation (spec §3) and by clustering's
    /// `run_me` gating (spec §4.12).
    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}

/// Transposes a `Matrix`'s dense columns (cell-major) into the
/// feature-major layout `kernels::marker_stats` expects. Shared by
/// `markers`, `custom_selections`, and `enrichment`.
pub fn dense_feature_major(matrix: &crate::data::matrix::Matrix) -> Vec<Vec<f32>> {
    let n_rows = matrix.n_rows();
    let n_cols = matrix.n_cols();
    let cols: Vec<Vec<f32>> = (0..n_cols).map(|c| matrix.dense_column(c)).collect();
    (0..n_rows).map(|r| cols.iter().map(|col| col[r]).collect()).collect()
}

/// Minimal object-safe surface every step satisfies, used by the engine
/// driver's `free_all` (spec §3 "walks all steps in any order") and for
/// logging a uniform "step X changed = Y" line.
pub trait StepBase {
    fn step_name(&self) -> &'static str;
    fn changed(&self) -> bool;
    fn free(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Params {
        k: u32,
    }

    #[test]
    fn first_update_always_changes() {
        let mut tracker = ChangeTracker::<Params>::new();
        assert!(tracker.update(&Params { k: 1 }, false));
    }

    #[test]
    fn identical_params_and_no_upstream_change_is_stable() {
        let mut tracker = ChangeTracker::<Params>::new();
        tracker.update(&Params { k: 1 }, false);
        assert!(!tracker.update(&Params { k: 1 }, false));
    }

    #[test]
    fn upstream_change_forces_recompute_even_with_same_params() {
        let mut tracker = ChangeTracker::<Params>::new();
        tracker.update(&Params { k: 1 }, false);
        assert!(tracker.update(&Params { k: 1 }, true));
    }

    #[test]
    fn differing_params_forces_recompute() {
        let mut tracker = ChangeTracker::<Params>::new();
        tracker.update(&Params { k: 1 }, false);
        assert!(tracker.update(&Params { k: 2 }, false));
    }

    #[test]
    fn invalidate_forces_next_update_to_change() {
        let mut tracker = ChangeTracker::<Params>::new();
        tracker.update(&Params { k: 1 }, false);
        tracker.invalidate();
        assert!(tracker.update(&Params { k: 1 }, false));
    }
}

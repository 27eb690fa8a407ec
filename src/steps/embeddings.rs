//! Visualization embeddings (spec §4.11, C10): t-SNE and UMAP each run on a
//! long-lived background worker thread, driven by a small
//! `{Init, Run, Rerun, Fetch}` command protocol over `std::sync::mpsc`
//! channels (spec §9 "coroutine control flow -> message-passing tasks").
//! No async runtime is introduced; the worker loop blocks on `recv` and the
//! owning step's `finish` blocks on the matching response, modeling the
//! spec's "await" language as a synchronous channel round-trip.
//!
//! Grounded on `kernels::tsne_kernel`/`kernels::umap_kernel`'s incremental
//! `step(iters)` methods, which already separate "prepare" (affinities/
//! fuzzy simplicial set) from "iterate" so a worker can run iterations
//! cooperatively between messages.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use crate::kernels::neighbors::NeighborGraph;
use crate::kernels::tsne_kernel::{TsneParams, TsneState};
use crate::kernels::umap_kernel::{UmapParams, UmapState};
use crate::steps::neighbor_index::NeighborIndex;
use crate::steps::ChangeTracker;

const TSNE_SEED: u64 = 0x5EED_1234;
const UMAP_SEED: u64 = 0x5EED_5678;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TsneEmbeddingParams {
    pub perplexity: f64,
    pub iterations: usize,
    pub animate: bool,
}

impl Default for TsneEmbeddingParams {
    fn default() -> Self {
        TsneEmbeddingParams { perplexity: 30.0, iterations: 1000, animate: false }
    }
}

enum TsneCommand {
    Run { neighbors: Option<NeighborGraph>, perplexity: f64, iterations: usize },
    Rerun { iterations: usize },
    Fetch,
    Shutdown,
}

enum TsneResponse {
    Done,
    Coordinates(Vec<[f32; 2]>),
}

fn tsne_worker(rx: Receiver<TsneCommand>, tx: Sender<TsneResponse>) {
    let mut state: Option<TsneState> = None;
    while let Ok(cmd) = rx.recv() {
        match cmd {
            TsneCommand::Run { neighbors, perplexity, iterations } => {
                if let Some(neighbors) = neighbors {
                    let params = TsneParams { perplexity, ..TsneParams::default() };
                    state = Some(TsneState::init(&neighbors, params, TSNE_SEED));
                }
                if let Some(s) = state.as_mut() {
                    s.step(iterations);
                }
                let _ = tx.send(TsneResponse::Done);
            }
            TsneCommand::Rerun { iterations } => {
                if let Some(s) = state.as_mut() {
                    s.reset(TSNE_SEED);
                    s.step(iterations);
                }
                let _ = tx.send(TsneResponse::Done);
            }
            TsneCommand::Fetch => {
                let coords = state
                    .as_ref()
                    .map(|s| s.coordinates().iter().map(|p| [p[0] as f32, p[1] as f32]).collect())
                    .unwrap_or_default();
                let _ = tx.send(TsneResponse::Coordinates(coords));
            }
            TsneCommand::Shutdown => break,
        }
    }
}

/// t-SNE embedding step. `compute` sends RUN without blocking; the engine
/// calls `finish` at the very end of `run_analysis` to await the result
/// (spec §4.11 "the engine explicitly defers awaiting their completion").
pub struct TsneEmbedding {
    tracker: ChangeTracker<TsneEmbeddingParams>,
    changed: bool,
    valid: bool,
    to_worker: Sender<TsneCommand>,
    from_worker: Receiver<TsneResponse>,
    worker: Option<JoinHandle<()>>,
    cached_k: Option<usize>,
    coordinates: Vec<[f32; 2]>,
    pending: bool,
}

impl TsneEmbedding {
    pub fn new() -> Self {
        let (to_tx, to_rx) = mpsc::channel();
        let (from_tx, from_rx) = mpsc::channel();
        let worker = thread::spawn(move || tsne_worker(to_rx, from_tx));
        TsneEmbedding {
            tracker: ChangeTracker::new(),
            changed: false,
            valid: false,
            to_worker: to_tx,
            from_worker: from_rx,
            worker: Some(worker),
            cached_k: None,
            coordinates: Vec::new(),
            pending: false,
        }
    }

    pub fn defaults() -> TsneEmbeddingParams {
        TsneEmbeddingParams::default()
    }

    /// Perplexity-derived neighbor count (spec §4.11).
    fn derive_k(perplexity: f64) -> usize {
        (perplexity * 3.0).round().max(1.0) as usize
    }

    pub fn compute(&mut self, neighbor_index: Option<&NeighborIndex>, params: &TsneEmbeddingParams, upstream_changed: bool) {
        let recompute = self.tracker.update(params, upstream_changed);
        self.valid = neighbor_index.map(|n| n.valid()).unwrap_or(false);
        if !recompute || !self.valid {
            self.changed = recompute && self.valid;
            return;
        }
        let k = Self::derive_k(params.perplexity);
        let neighbors = if self.cached_k != Some(k) {
            self.cached_k = Some(k);
            Some(neighbor_index.unwrap().fetch_knn(k))
        } else {
            None
        };
        let _ = self.to_worker.send(TsneCommand::Run {
            neighbors,
            perplexity: params.perplexity,
            iterations: params.iterations,
        });
        self.pending = true;
        self.changed = true;
    }

    /// RERUN: replays the animation with unchanged parameters (spec §4.11).
    pub fn rerun(&mut self, iterations: usize) {
        let _ = self.to_worker.send(TsneCommand::Rerun { iterations });
        self.pending = true;
    }

    /// Blocks until the in-flight RUN/RERUN completes and fetches the final
    /// coordinates; only called at the end of `run_analysis`.
    pub fn finish(&mut self) {
        if !self.pending {
            return;
        }
        let _ = self.from_worker.recv();
        self.pending = false;
        let _ = self.to_worker.send(TsneCommand::Fetch);
        if let Ok(TsneResponse::Coordinates(coords)) = self.from_worker.recv() {
            self.coordinates = coords;
        }
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn fetch_coordinates(&self) -> &[[f32; 2]] {
        &self.coordinates
    }

    pub fn free(&mut self) {
        self.coordinates = Vec::new();
        self.cached_k = None;
    }
}

impl Drop for TsneEmbedding {
    fn drop(&mut self) {
        let _ = self.to_worker.send(TsneCommand::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UmapEmbeddingParams {
    pub num_neighbors: usize,
    pub num_epochs: usize,
    pub min_dist: f64,
    pub animate: bool,
}

impl Default for UmapEmbeddingParams {
    fn default() -> Self {
        UmapEmbeddingParams { num_neighbors: 15, num_epochs: 500, min_dist: 0.1, animate: false }
    }
}

enum UmapCommand {
    Run { neighbors: Option<NeighborGraph>, min_dist: f64, epochs: usize },
    Rerun { epochs: usize },
    Fetch,
    Shutdown,
}

enum UmapResponse {
    Done,
    Coordinates(Vec<[f32; 2]>),
}

fn umap_worker(rx: Receiver<UmapCommand>, tx: Sender<UmapResponse>) {
    let mut state: Option<UmapState> = None;
    while let Ok(cmd) = rx.recv() {
        match cmd {
            UmapCommand::Run { neighbors, min_dist, epochs } => {
                if let Some(neighbors) = neighbors {
                    let params = UmapParams { min_dist, ..UmapParams::default() };
                    state = Some(UmapState::init(&neighbors, params, UMAP_SEED));
                }
                if let Some(s) = state.as_mut() {
                    s.step(epochs);
                }
                let _ = tx.send(UmapResponse::Done);
            }
            UmapCommand::Rerun { epochs } => {
                if let Some(s) = state.as_mut() {
                    s.reset(UMAP_SEED);
                    s.step(epochs);
                }
                let _ = tx.send(UmapResponse::Done);
            }
            UmapCommand::Fetch => {
                let coords = state
                    .as_ref()
                    .map(|s| s.coordinates().iter().map(|p| [p[0] as f32, p[1] as f32]).collect())
                    .unwrap_or_default();
                let _ = tx.send(UmapResponse::Coordinates(coords));
            }
            UmapCommand::Shutdown => break,
        }
    }
}

pub struct UmapEmbedding {
    tracker: ChangeTracker<UmapEmbeddingParams>,
    changed: bool,
    valid: bool,
    to_worker: Sender<UmapCommand>,
    from_worker: Receiver<UmapResponse>,
    worker: Option<JoinHandle<()>>,
    cached_k: Option<usize>,
    coordinates: Vec<[f32; 2]>,
    pending: bool,
}

impl UmapEmbedding {
    pub fn new() -> Self {
        let (to_tx, to_rx) = mpsc::channel();
        let (from_tx, from_rx) = mpsc::channel();
        let worker = thread::spawn(move || umap_worker(to_rx, from_tx));
        UmapEmbedding {
            tracker: ChangeTracker::new(),
            changed: false,
            valid: false,
            to_worker: to_tx,
            from_worker: from_rx,
            worker: Some(worker),
            cached_k: None,
            coordinates: Vec::new(),
            pending: false,
        }
    }

    pub fn defaults() -> UmapEmbeddingParams {
        UmapEmbeddingParams::default()
    }

    pub fn compute(&mut self, neighbor_index: Option<&NeighborIndex>, params: &UmapEmbeddingParams, upstream_changed: bool) {
        let recompute = self.tracker.update(params, upstream_changed);
        self.valid = neighbor_index.map(|n| n.valid()).unwrap_or(false);
        if !recompute || !self.valid {
            self.changed = recompute && self.valid;
            return;
        }
        let k = params.num_neighbors;
        let neighbors = if self.cached_k != Some(k) {
            self.cached_k = Some(k);
            Some(neighbor_index.unwrap().fetch_knn(k))
        } else {
            None
        };
        let _ = self.to_worker.send(UmapCommand::Run {
            neighbors,
            min_dist: params.min_dist,
            epochs: params.num_epochs,
        });
        self.pending = true;
        self.changed = true;
    }

    pub fn rerun(&mut self, epochs: usize) {
        let _ = self.to_worker.send(UmapCommand::Rerun { epochs });
        self.pending = true;
    }

    pub fn finish(&mut self) {
        if !self.pending {
            return;
        }
        let _ = self.from_worker.recv();
        self.pending = false;
        let _ = self.to_worker.send(UmapCommand::Fetch);
        if let Ok(UmapResponse::Coordinates(coords)) = self.from_worker.recv() {
            self.coordinates = coords;
        }
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn fetch_coordinates(&self) -> &[[f32; 2]] {
        &self.coordinates
    }

    pub fn free(&mut self) {
        self.coordinates = Vec::new();
        self.cached_k = None;
    }
}

impl Drop for UmapEmbedding {
    fn drop(&mut self) {
        let _ = self.to_worker.send(UmapCommand::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PCResult;

    fn toy_neighbor_index() -> NeighborIndex {
        let pc = PCResult {
            num_pcs: 1,
            num_cells: 6,
            data: vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0],
            variance_explained: vec![1.0],
        };
        let mut idx = NeighborIndex::new();
        idx.compute(Some(&pc), &crate::steps::neighbor_index::NeighborIndexParams::default(), true);
        idx
    }

    #[test]
    fn tsne_round_trip_produces_coordinates() {
        let idx = toy_neighbor_index();
        let mut tsne = TsneEmbedding::new();
        let params = TsneEmbeddingParams { perplexity: 2.0, iterations: 5, animate: false };
        tsne.compute(Some(&idx), &params, true);
        assert!(tsne.changed());
        tsne.finish();
        assert_eq!(tsne.fetch_coordinates().len(), 6);
    }

    #[test]
    fn umap_round_trip_produces_coordinates() {
        let idx = toy_neighbor_index();
        let mut umap = UmapEmbedding::new();
        let params = UmapEmbeddingParams { num_neighbors: 3, num_epochs: 5, min_dist: 0.1, animate: false };
        umap.compute(Some(&idx), &params, true);
        assert!(umap.changed());
        umap.finish();
        assert_eq!(umap.fetch_coordinates().len(), 6);
    }

    #[test]
    fn invalid_without_neighbor_index() {
        let mut tsne = TsneEmbedding::new();
        tsne.compute(None, &TsneEmbeddingParams::default(), true);
        assert!(!tsne.valid());
    }
}

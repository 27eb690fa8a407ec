//! Clustering (spec §4.12, C11): `KMeansCluster`, `SnnGraphCluster` (a
//! three-stage sub-pipeline with cascading invalidation), and
//! `ChooseClustering` which selects between them.
//!
//! Both cluster variants are gated by a driver-supplied `run_me` flag
//! (`method == "kmeans"` / `"snn_graph"`); when `false` the step clears its
//! cache so a later switch back forces recomputation, per spec §4.12.

use crate::data::PCResult;
use crate::kernels::kmeans_kernel::kmeans;
use crate::kernels::neighbors::{knn, NeighborGraph};
use crate::kernels::snn_kernel::{build_snn_graph, detect_communities, SnnGraph, SnnScheme};
use crate::steps::ChangeTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KMeansClusterParams {
    pub k: usize,
}

impl Default for KMeansClusterParams {
    fn default() -> Self {
        KMeansClusterParams { k: 10 }
    }
}

pub struct KMeansCluster {
    tracker: ChangeTracker<KMeansClusterParams>,
    changed: bool,
    valid: bool,
    assignments: Vec<u32>,
}

impl KMeansCluster {
    pub fn new() -> Self {
        KMeansCluster {
            tracker: ChangeTracker::new(),
            changed: false,
            valid: false,
            assignments: Vec::new(),
        }
    }

    pub fn defaults() -> KMeansClusterParams {
        KMeansClusterParams::default()
    }

    pub fn compute(&mut self, embedding: Option<&PCResult>, params: &KMeansClusterParams, run_me: bool, upstream_changed: bool) {
        if !run_me {
            self.tracker.invalidate();
            self.assignments = Vec::new();
            self.valid = false;
            self.changed = false;
            return;
        }
        let recompute = self.tracker.update(params, upstream_changed);
        self.valid = embedding.is_some();
        if !recompute || !self.valid {
            self.changed = recompute && self.valid;
            return;
        }
        let embedding = embedding.unwrap();
        let points: Vec<Vec<f32>> = (0..embedding.num_cells).map(|c| embedding.cell(c)).collect();
        let result = kmeans(&points, params.k.max(1), 100);
        self.assignments = result.assignments;
        self.changed = true;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn fetch_assignments(&self) -> &[u32] {
        &self.assignments
    }

    pub fn free(&mut self) {
        self.assignments = Vec::new();
    }
}

impl Default for KMeansCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnnGraphClusterParams {
    pub k: usize,
    pub scheme: SnnScheme,
    pub resolution: f32,
}

impl Default for SnnGraphClusterParams {
    fn default() -> Self {
        SnnGraphClusterParams { k: 10, scheme: SnnScheme::Rank, resolution: 1.0 }
    }
}

/// Three cascading `ChangeTracker`s model spec §4.12's invalidation rule:
/// changing `k` reaches all three stages (it is the neighbor stage's own
/// parameter, so its tracker flags `changed` and that propagates as
/// `upstream_changed` into the graph and cluster trackers); changing
/// `scheme` stops at the graph tracker; changing `resolution` only touches
/// the cluster tracker.
pub struct SnnGraphCluster {
    neighbors_tracker: ChangeTracker<usize>,
    graph_tracker: ChangeTracker<SnnScheme>,
    clusters_tracker: ChangeTracker<ordered_f32::OrderedF32>,
    changed: bool,
    valid: bool,
    neighbor_graph: Option<NeighborGraph>,
    snn_graph: Option<SnnGraph>,
    assignments: Vec<u32>,
}

/// A thin `PartialEq`-by-bits wrapper so a bare `f32` resolution can sit in
/// a `ChangeTracker` (which requires `PartialEq`) without pretending NaN
/// resolutions are meaningful.
mod ordered_f32 {
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct OrderedF32(pub f32);
}

impl SnnGraphCluster {
    pub fn new() -> Self {
        SnnGraphCluster {
            neighbors_tracker: ChangeTracker::new(),
            graph_tracker: ChangeTracker::new(),
            clusters_tracker: ChangeTracker::new(),
            changed: false,
            valid: false,
            neighbor_graph: None,
            snn_graph: None,
            assignments: Vec::new(),
        }
    }

    pub fn defaults() -> SnnGraphClusterParams {
        SnnGraphClusterParams::default()
    }

    pub fn compute(&mut self, embedding: Option<&PCResult>, params: &SnnGraphClusterParams, run_me: bool, upstream_changed: bool) {
        if !run_me {
            self.neighbors_tracker.invalidate();
            self.graph_tracker.invalidate();
            self.clusters_tracker.invalidate();
            self.neighbor_graph = None;
            self.snn_graph = None;
            self.assignments = Vec::new();
            self.valid = false;
            self.changed = false;
            return;
        }
        self.valid = embedding.is_some();
        if !self.valid {
            let neighbors_changed = self.neighbors_tracker.update(&params.k, upstream_changed);
            let graph_changed = self.graph_tracker.update(&params.scheme, neighbors_changed);
            self.changed = self.clusters_tracker.update(&ordered_f32::OrderedF32(params.resolution), graph_changed) && self.valid;
            return;
        }
        let embedding = embedding.unwrap();

        let neighbors_changed = self.neighbors_tracker.update(&params.k, upstream_changed);
        if neighbors_changed {
            let points: Vec<Vec<f32>> = (0..embedding.num_cells).map(|c| embedding.cell(c)).collect();
            self.neighbor_graph = Some(knn(&points, params.k, false));
        }

        let graph_changed = self.graph_tracker.update(&params.scheme, neighbors_changed);
        if graph_changed {
            self.snn_graph = Some(build_snn_graph(self.neighbor_graph.as_ref().unwrap(), params.scheme));
        }

        let clusters_changed = self
            .clusters_tracker
            .update(&ordered_f32::OrderedF32(params.resolution), graph_changed);
        if clusters_changed {
            self.assignments = detect_communities(self.snn_graph.as_ref().unwrap(), params.resolution, 50);
        }

        self.changed = clusters_changed;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn fetch_assignments(&self) -> &[u32] {
        &self.assignments
    }

    pub fn free(&mut self) {
        self.neighbor_graph = None;
        self.snn_graph = None;
        self.assignments = Vec::new();
    }
}

impl Default for SnnGraphCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusteringMethod {
    KMeans,
    SnnGraph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChooseClusteringParams {
    pub method: ClusteringMethod,
}

impl Default for ChooseClusteringParams {
    fn default() -> Self {
        ChooseClusteringParams { method: ClusteringMethod::SnnGraph }
    }
}

/// Exposes the chosen clustering step's assignments; `changed` depends only
/// on whether the chosen step itself recomputed (spec §4.12).
pub struct ChooseClustering {
    tracker: ChangeTracker<ChooseClusteringParams>,
    changed: bool,
    assignments: Vec<u32>,
}

impl ChooseClustering {
    pub fn new() -> Self {
        ChooseClustering { tracker: ChangeTracker::new(), changed: false, assignments: Vec::new() }
    }

    pub fn defaults() -> ChooseClusteringParams {
        ChooseClusteringParams::default()
    }

    pub fn compute(&mut self, kmeans: &KMeansCluster, snn: &SnnGraphCluster, params: &ChooseClusteringParams) {
        // The `method` parameter itself changing is recorded, but doesn't
        // force `changed` on its own unless the chosen step recomputed.
        self.tracker.update(params, false);
        let chosen_changed = match params.method {
            ClusteringMethod::KMeans => kmeans.changed(),
            ClusteringMethod::SnnGraph => snn.changed(),
        };
        if chosen_changed {
            self.assignments = match params.method {
                ClusteringMethod::KMeans => kmeans.fetch_assignments().to_vec(),
                ClusteringMethod::SnnGraph => snn.fetch_assignments().to_vec(),
            };
        }
        self.changed = chosen_changed;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn fetch_assignments(&self) -> &[u32] {
        &self.assignments
    }

    pub fn free(&mut self) {
        self.assignments = Vec::new();
    }

    /// Materializes assignments read back from persisted state (spec §9
    /// "materialize real result objects ... rather than shim objects").
    pub(crate) fn restore_assignments(&mut self, assignments: Vec<u32>) {
        self.assignments = assignments;
    }
}

impl Default for ChooseClustering {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_embedding() -> PCResult {
        PCResult {
            num_pcs: 1,
            num_cells: 6,
            data: vec![0.0, 0.1, 0.2, 9.0, 9.1, 9.2],
            variance_explained: vec![1.0],
        }
    }

    #[test]
    fn kmeans_disabled_clears_cache() {
        let embedding = toy_embedding();
        let mut km = KMeansCluster::new();
        km.compute(Some(&embedding), &KMeansClusterParams { k: 2 }, true, true);
        assert!(km.valid());
        km.compute(Some(&embedding), &KMeansClusterParams { k: 2 }, false, false);
        assert!(!km.valid());
        assert!(km.fetch_assignments().is_empty());
    }

    #[test]
    fn snn_resolution_change_only_recomputes_clusters() {
        let embedding = toy_embedding();
        let mut snn = SnnGraphCluster::new();
        let params1 = SnnGraphClusterParams { k: 2, scheme: SnnScheme::Rank, resolution: 1.0 };
        snn.compute(Some(&embedding), &params1, true, true);
        assert!(snn.changed());

        let params2 = SnnGraphClusterParams { resolution: 2.0, ..params1 };
        snn.compute(Some(&embedding), &params2, true, false);
        assert!(snn.changed());
    }

    #[test]
    fn choose_clustering_changed_follows_selected_step() {
        let embedding = toy_embedding();
        let mut km = KMeansCluster::new();
        km.compute(Some(&embedding), &KMeansClusterParams { k: 2 }, true, true);
        let mut snn = SnnGraphCluster::new();
        snn.compute(Some(&embedding), &SnnGraphClusterParams::default(), false, true);

        let mut choose = ChooseClustering::new();
        let params = ChooseClusteringParams { method: ClusteringMethod::KMeans };
        choose.compute(&km, &snn, &params);
        assert!(choose.changed());
        assert_eq!(choose.fetch_assignments().len(), 6);
    }
}

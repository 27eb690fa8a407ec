//! The dependency-graph driver (spec §4.16, §5): owns one instance of every
//! step and threads them through the fixed topological order a single
//! `run_analysis` call walks.
//!
//! Grounded on the teacher's `pipeline::stage2_normalize`/`stage7_report`
//! call chain in `main.rs::run()` — a hand-written sequence of stage calls,
//! each reading the previous stage's output — generalized here into a
//! cached, re-runnable graph of `steps::*` components instead of a one-shot
//! linear pass.

pub mod params;
pub mod state;

use crate::data::annotation::FeatureAnnotations;
use crate::data::matrix::{Matrix, MultiMatrix};
use crate::data::PCResult;
use crate::error::EngineResult;
use crate::steps::batch_correction::BatchCorrection;
use crate::steps::cell_filtering::{CellFiltering, QcContribution};
use crate::steps::clustering::{ChooseClustering, ClusteringMethod, KMeansCluster, SnnGraphCluster};
use crate::steps::combine_embeddings::CombineEmbeddings;
use crate::steps::custom_selections::CustomSelections;
use crate::steps::embeddings::{TsneEmbedding, UmapEmbedding};
use crate::steps::enrichment::FeatureSetEnrichment;
use crate::steps::feature_selection::FeatureSelection;
use crate::steps::inputs::{DatasetSource, Inputs};
use crate::steps::labelling::{CellLabelling, Downloader};
use crate::steps::markers::MarkerDetection;
use crate::steps::neighbor_index::NeighborIndex;
use crate::steps::normalization::{AdtNormalization, CrisprNormalization, RnaNormalization};
use crate::steps::pca::ModalityPca;
use crate::steps::quality_control::{AdtQualityControl, CrisprQualityControl, RnaQualityControl};
use crate::steps::StepBase;

use params::PipelineParams;

macro_rules! impl_step_base {
    ($ty:ty, $name:literal) => {
        impl StepBase for $ty {
            fn step_name(&self) -> &'static str {
                $name
            }
            fn changed(&self) -> bool {
                self.changed()
            }
            fn free(&mut self) {
                self.free()
            }
        }
    };
}

impl_step_base!(Inputs, "inputs");
impl_step_base!(RnaQualityControl, "rna_quality_control");
impl_step_base!(AdtQualityControl, "adt_quality_control");
impl_step_base!(CrisprQualityControl, "crispr_quality_control");
impl_step_base!(CellFiltering, "cell_filtering");
impl_step_base!(RnaNormalization, "rna_normalization");
impl_step_base!(AdtNormalization, "adt_normalization");
impl_step_base!(CrisprNormalization, "crispr_normalization");
impl_step_base!(FeatureSelection, "feature_selection");
impl_step_base!(ModalityPca, "modality_pca");
impl_step_base!(CombineEmbeddings, "combine_embeddings");
impl_step_base!(BatchCorrection, "batch_correction");
impl_step_base!(NeighborIndex, "neighbor_index");
impl_step_base!(TsneEmbedding, "tsne");
impl_step_base!(UmapEmbedding, "umap");
impl_step_base!(KMeansCluster, "kmeans_cluster");
impl_step_base!(SnnGraphCluster, "snn_graph_cluster");
impl_step_base!(ChooseClustering, "choose_clustering");
impl_step_base!(MarkerDetection, "marker_detection");
impl_step_base!(CustomSelections, "custom_selections");
impl_step_base!(CellLabelling, "cell_labelling");
impl_step_base!(FeatureSetEnrichment, "feature_set_enrichment");

/// Owns every step and drives them in the fixed order spec §5a describes.
/// Each field is a long-lived cache; a field only recomputes when its own
/// `ChangeTracker` or an upstream `changed()` flag says so.
pub struct Engine {
    pub inputs: Inputs,
    pub rna_quality_control: RnaQualityControl,
    pub adt_quality_control: AdtQualityControl,
    pub crispr_quality_control: CrisprQualityControl,
    pub cell_filtering: CellFiltering,
    pub rna_normalization: RnaNormalization,
    pub adt_normalization: AdtNormalization,
    pub crispr_normalization: CrisprNormalization,
    pub feature_selection: FeatureSelection,
    pub rna_pca: ModalityPca,
    pub adt_pca: ModalityPca,
    pub crispr_pca: ModalityPca,
    pub combine_embeddings: CombineEmbeddings,
    pub batch_correction: BatchCorrection,
    pub neighbor_index: NeighborIndex,
    pub tsne: TsneEmbedding,
    pub umap: UmapEmbedding,
    pub kmeans_cluster: KMeansCluster,
    pub snn_graph_cluster: SnnGraphCluster,
    pub choose_clustering: ChooseClustering,
    pub marker_detection: MarkerDetection,
    pub custom_selections: CustomSelections,
    pub cell_labelling: CellLabelling,
    pub feature_set_enrichment: FeatureSetEnrichment,
    /// Set once on a restored engine; forces the next `run_analysis` to
    /// treat `Inputs` as changed regardless of its own fingerprint/param
    /// comparison (spec §5c, §9 "_loaded").
    force_next_invalidate: bool,
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            inputs: Inputs::new(),
            rna_quality_control: RnaQualityControl::new(),
            adt_quality_control: AdtQualityControl::new(),
            crispr_quality_control: CrisprQualityControl::new(),
            cell_filtering: CellFiltering::new(),
            rna_normalization: RnaNormalization::new(),
            adt_normalization: AdtNormalization::new(),
            crispr_normalization: CrisprNormalization::new(),
            feature_selection: FeatureSelection::new(),
            rna_pca: ModalityPca::new(),
            adt_pca: ModalityPca::new(),
            crispr_pca: ModalityPca::new(),
            combine_embeddings: CombineEmbeddings::new(),
            batch_correction: BatchCorrection::new(),
            neighbor_index: NeighborIndex::new(),
            tsne: TsneEmbedding::new(),
            umap: UmapEmbedding::new(),
            kmeans_cluster: KMeansCluster::new(),
            snn_graph_cluster: SnnGraphCluster::new(),
            choose_clustering: ChooseClustering::new(),
            marker_detection: MarkerDetection::new(),
            custom_selections: CustomSelections::new(),
            cell_labelling: CellLabelling::new(),
            feature_set_enrichment: FeatureSetEnrichment::new(),
            force_next_invalidate: false,
        }
    }

    /// Marks this engine as freshly restored from persisted state (spec
    /// §5c): the very next `run_analysis` forces `Inputs.changed = true`
    /// regardless of whether its sources/params actually changed, cascading
    /// invalidation through every downstream step exactly once.
    pub fn mark_restored(&mut self) {
        self.force_next_invalidate = true;
    }

    /// Drives one full analysis pass in the fixed topological order (spec
    /// §5a). `on_start`/`on_finish` are called with each step's name as it
    /// begins/ends, for progress reporting; t-SNE/UMAP are sent their RUN
    /// command without blocking and only awaited at the very end (spec §5,
    /// ordering guarantee b).
    pub fn run_analysis(
        &mut self,
        datasets: &[DatasetSource],
        params: &PipelineParams,
        downloader: &dyn Downloader,
        on_start: &mut dyn FnMut(&str),
        on_finish: &mut dyn FnMut(&str),
    ) -> EngineResult<()> {
        on_start("inputs");
        self.inputs.compute(datasets, &params.inputs)?;
        on_finish("inputs");
        let inputs_changed = self.inputs.changed() || self.force_next_invalidate;
        self.force_next_invalidate = false;

        let matrices = self.inputs.fetch_matrices();
        let block = self.inputs.fetch_block();
        let block_indices = block.map(|b| b.indices.as_slice());
        let n_blocks = block.map(|b| b.n_blocks()).unwrap_or(1);

        on_start("rna_quality_control");
        let rna_symbols = self
            .inputs
            .fetch_feature_annotations("RNA")
            .map(|fa| fa.symbols.as_slice());
        self.rna_quality_control.compute(
            matrices.get("RNA"),
            rna_symbols,
            block_indices,
            n_blocks,
            &params.rna_quality_control,
            inputs_changed,
        );
        on_finish("rna_quality_control");

        on_start("adt_quality_control");
        let adt_ids = self
            .inputs
            .fetch_feature_annotations("ADT")
            .map(|fa| fa.ids.as_slice());
        self.adt_quality_control.compute(
            matrices.get("ADT"),
            adt_ids,
            block_indices,
            n_blocks,
            &params.adt_quality_control,
            inputs_changed,
        );
        on_finish("adt_quality_control");

        on_start("crispr_quality_control");
        self.crispr_quality_control.compute(
            matrices.get("CRISPR"),
            block_indices,
            n_blocks,
            &params.crispr_quality_control,
            inputs_changed,
        );
        on_finish("crispr_quality_control");

        on_start("cell_filtering");
        let qc_states = [
            QcContribution {
                enabled: params.cell_filtering.use_rna,
                valid: self.rna_quality_control.valid(),
                changed: self.rna_quality_control.changed(),
                discard: self.rna_quality_control.fetch_discard(),
            },
            QcContribution {
                enabled: params.cell_filtering.use_adt,
                valid: self.adt_quality_control.valid(),
                changed: self.adt_quality_control.changed(),
                discard: self.adt_quality_control.fetch_discard(),
            },
            QcContribution {
                enabled: params.cell_filtering.use_crispr,
                valid: self.crispr_quality_control.valid(),
                changed: self.crispr_quality_control.changed(),
                discard: self.crispr_quality_control.fetch_discard(),
            },
        ];
        self.cell_filtering
            .compute(matrices, block, &qc_states, &params.cell_filtering, inputs_changed);
        on_finish("cell_filtering");
        let cell_filtering_changed = self.cell_filtering.changed();

        let filtered_block = self.cell_filtering.fetch_filtered_block();
        let filtered_block_indices = filtered_block.map(|b| b.indices.as_slice());

        on_start("rna_normalization");
        self.rna_normalization
            .compute(self.cell_filtering.fetch_filtered_matrix("RNA"), cell_filtering_changed);
        on_finish("rna_normalization");

        on_start("crispr_normalization");
        self.crispr_normalization.compute(
            self.cell_filtering.fetch_filtered_matrix("CRISPR"),
            cell_filtering_changed,
        );
        on_finish("crispr_normalization");

        on_start("adt_normalization");
        self.adt_normalization.compute(
            self.cell_filtering.fetch_filtered_matrix("ADT"),
            filtered_block_indices,
            &params.adt_normalization,
            cell_filtering_changed,
        );
        on_finish("adt_normalization");

        on_start("feature_selection");
        self.feature_selection.compute(
            self.rna_normalization.fetch_normalized(),
            &params.feature_selection,
            self.rna_normalization.changed(),
        );
        on_finish("feature_selection");

        on_start("rna_pca");
        let rna_mask = params.rna_pca.num_hvgs.map(|k| self.feature_selection.top_k_mask(k));
        let rna_pca_upstream = self.rna_normalization.changed() || self.feature_selection.changed();
        self.rna_pca.compute(
            self.rna_normalization.fetch_normalized(),
            rna_mask.as_deref(),
            filtered_block_indices,
            &params.rna_pca,
            rna_pca_upstream,
        );
        on_finish("rna_pca");

        on_start("adt_pca");
        self.adt_pca.compute(
            self.adt_normalization.fetch_normalized(),
            None,
            filtered_block_indices,
            &params.adt_pca,
            self.adt_normalization.changed(),
        );
        on_finish("adt_pca");

        on_start("crispr_pca");
        self.crispr_pca.compute(
            self.crispr_normalization.fetch_normalized(),
            None,
            filtered_block_indices,
            &params.crispr_pca,
            self.crispr_normalization.changed(),
        );
        on_finish("crispr_pca");

        on_start("combine_embeddings");
        let mut pca_modalities: Vec<(String, &PCResult)> = Vec::new();
        let mut combine_upstream = false;
        if self.rna_pca.valid() {
            pca_modalities.push(("RNA".to_string(), self.rna_pca.fetch_result().unwrap()));
            combine_upstream |= self.rna_pca.changed();
        }
        if self.adt_pca.valid() {
            pca_modalities.push(("ADT".to_string(), self.adt_pca.fetch_result().unwrap()));
            combine_upstream |= self.adt_pca.changed();
        }
        if self.crispr_pca.valid() {
            pca_modalities.push(("CRISPR".to_string(), self.crispr_pca.fetch_result().unwrap()));
            combine_upstream |= self.crispr_pca.changed();
        }
        self.combine_embeddings
            .compute(&pca_modalities, &params.combine_embeddings, combine_upstream)?;
        on_finish("combine_embeddings");

        on_start("batch_correction");
        self.batch_correction.compute(
            self.combine_embeddings.fetch_result(),
            filtered_block,
            &params.batch_correction,
            self.combine_embeddings.changed(),
        );
        on_finish("batch_correction");

        on_start("neighbor_index");
        self.neighbor_index.compute(
            self.batch_correction.fetch_result(),
            &params.neighbor_index,
            self.batch_correction.changed(),
        );
        on_finish("neighbor_index");

        // RUN commands are sent without blocking (spec §5, ordering
        // guarantee b); `.finish()` is called at the very end.
        on_start("tsne");
        self.tsne
            .compute(Some(&self.neighbor_index), &params.tsne, self.neighbor_index.changed());
        on_finish("tsne");

        on_start("umap");
        self.umap
            .compute(Some(&self.neighbor_index), &params.umap, self.neighbor_index.changed());
        on_finish("umap");

        // `run_me` is derived straight from `choose_clustering.method`
        // (spec §4.12), not an independent toggle: only the variant
        // `ChooseClustering` will actually expose needs to run.
        on_start("kmeans_cluster");
        self.kmeans_cluster.compute(
            self.batch_correction.fetch_result(),
            &params.kmeans_cluster,
            params.choose_clustering.method == ClusteringMethod::KMeans,
            self.batch_correction.changed(),
        );
        on_finish("kmeans_cluster");

        on_start("snn_graph_cluster");
        self.snn_graph_cluster.compute(
            self.batch_correction.fetch_result(),
            &params.snn_graph_cluster,
            params.choose_clustering.method == ClusteringMethod::SnnGraph,
            self.batch_correction.changed(),
        );
        on_finish("snn_graph_cluster");

        on_start("choose_clustering");
        self.choose_clustering
            .compute(&self.kmeans_cluster, &self.snn_graph_cluster, &params.choose_clustering);
        on_finish("choose_clustering");

        on_start("marker_detection");
        let mut marker_modalities: Vec<(String, &Matrix)> = Vec::new();
        if let Some(m) = self.rna_normalization.fetch_normalized() {
            marker_modalities.push(("RNA".to_string(), m));
        }
        if let Some(m) = self.adt_normalization.fetch_normalized() {
            marker_modalities.push(("ADT".to_string(), m));
        }
        if let Some(m) = self.crispr_normalization.fetch_normalized() {
            marker_modalities.push(("CRISPR".to_string(), m));
        }
        let marker_upstream = self.choose_clustering.changed()
            || self.rna_normalization.changed()
            || self.adt_normalization.changed()
            || self.crispr_normalization.changed();
        self.marker_detection.compute(
            &marker_modalities,
            self.choose_clustering.fetch_assignments(),
            &params.marker_detection,
            marker_upstream,
        );
        on_finish("marker_detection");

        on_start("custom_selections");
        self.custom_selections.update_params(
            &marker_modalities,
            self.cell_filtering.n_filtered_cells(),
            &params.marker_detection,
            cell_filtering_changed,
        );
        on_finish("custom_selections");

        if let Some(rna_markers) = self.marker_detection.fetch_result("RNA") {
            let feature_annotations = self.inputs.fetch_feature_annotations("RNA").cloned().unwrap_or_else(|| {
                FeatureAnnotations { ids: Vec::new(), symbols: Vec::new(), feature_types: Vec::new() }
            });
            let annotations = self
                .cell_filtering
                .fetch_filtered_annotations(self.inputs.fetch_annotations());

            on_start("cell_labelling");
            self.cell_labelling.compute(
                rna_markers,
                &feature_annotations,
                &annotations,
                &params.cell_labelling,
                downloader,
                self.marker_detection.changed(),
            );
            on_finish("cell_labelling");

            on_start("feature_set_enrichment");
            self.feature_set_enrichment.compute(
                rna_markers,
                &feature_annotations,
                params.enrichment_effect.clone(),
                &params.feature_set_enrichment,
                downloader,
                self.marker_detection.changed(),
            );
            on_finish("feature_set_enrichment");
        }

        on_start("tsne_finish");
        self.tsne.finish();
        on_finish("tsne_finish");

        on_start("umap_finish");
        self.umap.finish();
        on_finish("umap_finish");

        Ok(())
    }

    /// Builds a new engine whose `Inputs` is a zero-copy view over `self`'s
    /// filtered (or, if filtering hasn't run, original) columns at
    /// `indices` (spec §4.16). Calls `on_original` once per selected index
    /// with its coordinate in the *original*, unfiltered cell space.
    pub fn subset_inputs(&self, indices: &[u32], on_original: &mut dyn FnMut(u32)) -> Engine {
        let using_filtered = self
            .inputs
            .fetch_matrices()
            .modalities()
            .any(|m| self.cell_filtering.fetch_filtered_matrix(m).is_some());

        let mut matrices = MultiMatrix::new();
        let mut feature_annotations = std::collections::BTreeMap::new();
        for modality in self.inputs.fetch_matrices().modalities() {
            let source = if using_filtered {
                self.cell_filtering.fetch_filtered_matrix(modality).unwrap()
            } else {
                self.inputs.fetch_matrices().get(modality).unwrap()
            };
            matrices.insert(modality.to_string(), source.select_columns(indices));
            if let Some(fa) = self.inputs.fetch_feature_annotations(modality) {
                feature_annotations.insert(modality.to_string(), fa.clone());
            }
        }

        let base_annotations = if using_filtered {
            self.cell_filtering.fetch_filtered_annotations(self.inputs.fetch_annotations())
        } else {
            self.inputs.fetch_annotations().clone()
        };
        let annotations = base_annotations.select(indices);

        let source_block = if using_filtered {
            self.cell_filtering.fetch_filtered_block()
        } else {
            self.inputs.fetch_block()
        };
        let block = source_block.map(|b| b.select(indices));

        for &idx in indices {
            let original = if using_filtered {
                self.cell_filtering.undo_filtering(idx)
            } else {
                idx
            };
            on_original(original);
        }

        let mut engine = Engine::new();
        engine.inputs = Inputs::from_view(matrices, annotations, block, feature_annotations);
        engine
    }

    /// Frees every step's cached result buffers (spec §3, "walks all steps
    /// in any order"). Cached parameters are left untouched so the next
    /// `run_analysis` can still short-circuit on an unchanged config.
    pub fn free_all(&mut self) {
        StepBase::free(&mut self.inputs);
        StepBase::free(&mut self.rna_quality_control);
        StepBase::free(&mut self.adt_quality_control);
        StepBase::free(&mut self.crispr_quality_control);
        StepBase::free(&mut self.cell_filtering);
        StepBase::free(&mut self.rna_normalization);
        StepBase::free(&mut self.adt_normalization);
        StepBase::free(&mut self.crispr_normalization);
        StepBase::free(&mut self.feature_selection);
        StepBase::free(&mut self.rna_pca);
        StepBase::free(&mut self.adt_pca);
        StepBase::free(&mut self.crispr_pca);
        StepBase::free(&mut self.combine_embeddings);
        StepBase::free(&mut self.batch_correction);
        StepBase::free(&mut self.neighbor_index);
        StepBase::free(&mut self.tsne);
        StepBase::free(&mut self.umap);
        StepBase::free(&mut self.kmeans_cluster);
        StepBase::free(&mut self.snn_graph_cluster);
        StepBase::free(&mut self.choose_clustering);
        StepBase::free(&mut self.marker_detection);
        StepBase::free(&mut self.custom_selections);
        StepBase::free(&mut self.cell_labelling);
        StepBase::free(&mut self.feature_set_enrichment);
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

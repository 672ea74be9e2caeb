//! Running the whole analysis of a dataset and reporting on it from the outside.

use crate::analysis::{Analysis, CUSTOM_SELECTIONS_FILE, ERROR_FILE, PARAMS_FILE, SUBMITTED_FILE, UPLOADED_TRACKS_FILE};
use crate::params::{AnalysisParams, BaselineVis};
use crate::store::{write_atomic, Artifact, ArtifactStore};
use anyhow::{Context, Error};
use log::{error, info};
use serde::{Deserialize, Serialize};
use snoop::{FileSnoop, Progress};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub const RUN_RECORD_FILE: &str = "sc_analysis.json";
pub const PROGRESS_FILE: &str = "progress.txt";

/// One step of the pipeline. Each resolves one artifact, or a pair computed together.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    GeneSubset,
    CellSubset,
    Factorization,
    CellSample,
    Labels,
    MdsMeans,
    TopGenes,
    TopGenes1VsRest,
    Pairwise,
    Entropy,
    DimRed,
    BaselineVis,
}

impl Stage {
    pub const FULL: [Stage; 12] = [
        Stage::GeneSubset,
        Stage::CellSubset,
        Stage::Factorization,
        Stage::CellSample,
        Stage::Labels,
        Stage::MdsMeans,
        Stage::TopGenes,
        Stage::TopGenes1VsRest,
        Stage::Pairwise,
        Stage::Entropy,
        Stage::DimRed,
        Stage::BaselineVis,
    ];

    /// Everything downstream of the clustering.
    pub const POST: [Stage; 6] = [
        Stage::Labels,
        Stage::MdsMeans,
        Stage::TopGenes,
        Stage::TopGenes1VsRest,
        Stage::Pairwise,
        Stage::Entropy,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::GeneSubset => "gene_subset",
            Stage::CellSubset => "cell_subset",
            Stage::Factorization => "factorization",
            Stage::CellSample => "cell_sample",
            Stage::Labels => "labels",
            Stage::MdsMeans => "mds_means",
            Stage::TopGenes => "top_genes",
            Stage::TopGenes1VsRest => "top_genes_1_vs_rest",
            Stage::Pairwise => "pairwise",
            Stage::Entropy => "entropy",
            Stage::DimRed => "dim_red",
            Stage::BaselineVis => "baseline_vis",
        }
    }

    /// Resolve the stage's artifacts. Permutation tests report through `snoop`; every
    /// stage finishes it.
    fn run(self, a: &mut Analysis, mut snoop: impl Progress) -> Result<(), Error> {
        match self {
            Stage::GeneSubset => a.gene_subset().map(drop),
            Stage::CellSubset => a.cell_subset().map(drop),
            Stage::Factorization => a.factorization().map(drop),
            Stage::CellSample => a.cell_sample().map(drop),
            Stage::Labels => a.labels().map(drop),
            Stage::MdsMeans => a.mds_means().map(drop),
            Stage::TopGenes => a.top_genes_reporting(snoop.get_subsnoop(1.0)).map(drop),
            Stage::TopGenes1VsRest => a.top_genes_1_vs_rest_reporting(snoop.get_subsnoop(1.0)).map(drop),
            Stage::Pairwise => a.pairwise_reporting(snoop.get_subsnoop(1.0)).map(drop),
            Stage::Entropy => a.entropy().map(drop),
            Stage::DimRed => a.dim_red().map(drop),
            Stage::BaselineVis => a.baseline_vis().map(drop),
        }?;
        snoop.set_progress(1.0);
        Ok(())
    }
}

/// Completion record written after a successful run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub clusters: usize,
    pub cells: usize,
    pub genes: usize,
    pub genes_used: usize,
    pub stages: Vec<String>,
    /// seconds since the unix epoch
    pub finished_at: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PipelineOutcome {
    Completed(RunRecord),
    /// the run stopped; holds the error chain also written to `error.txt`
    Failed(String),
}

/// Compute every artifact of the dataset in dependency order.
pub fn run_full_analysis(analysis: &mut Analysis, snoop: impl Progress) -> Result<PipelineOutcome, Error> {
    run_stages(analysis, &Stage::FULL, snoop)
}

/// Recompute what a recluster invalidated.
pub fn run_post_analysis(analysis: &mut Analysis, snoop: impl Progress) -> Result<PipelineOutcome, Error> {
    run_stages(analysis, &Stage::POST, snoop)
}

fn run_stages<S: Progress>(analysis: &mut Analysis, stages: &[Stage], mut snoop: S) -> Result<PipelineOutcome, Error> {
    let dir = analysis.dir().to_path_buf();
    analysis.store().touch(SUBMITTED_FILE)?;
    analysis.store().remove_file(ERROR_FILE);
    analysis.store().remove_file(RUN_RECORD_FILE);
    snoop.set_progress(0.0);

    let share = 1.0 / stages.len().max(1) as f64;
    for (i, stage) in stages.iter().enumerate() {
        info!("{}: stage {}/{} {}", dir.display(), i + 1, stages.len(), stage.name());
        if let Err(err) = stage.run(analysis, snoop.get_subsnoop(share)) {
            let trace = format!("{err:?}");
            error!("{}: stage {} failed: {:#}", dir.display(), stage.name(), err);
            write_atomic(&dir.join(ERROR_FILE), |w| {
                w.write_all(trace.as_bytes())?;
                Ok(())
            })?;
            analysis.store().remove_file(SUBMITTED_FILE);
            return Ok(PipelineOutcome::Failed(trace));
        }
    }
    snoop.set_progress(1.0);

    let record = RunRecord {
        clusters: analysis.n_clusters()?,
        cells: analysis.cells()?.len(),
        genes: analysis.data()?.genes(),
        genes_used: analysis.gene_subset()?.len(),
        stages: stages.iter().map(|s| s.name().to_string()).collect(),
        finished_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    };
    write_atomic(&dir.join(RUN_RECORD_FILE), |w| {
        serde_json::to_writer_pretty(w, &record)?;
        Ok(())
    })?;
    analysis.store().remove_file(SUBMITTED_FILE);
    info!("{}: analysis finished with {} clusters", dir.display(), record.clusters);
    Ok(PipelineOutcome::Completed(record))
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DatasetStatus {
    NotStarted,
    Running { stage: String, progress: Option<f64> },
    Done,
    Failed { error: String },
}

/// Status of a dataset as seen by another process.
pub fn dataset_status(dir: impl AsRef<Path>) -> Result<DatasetStatus, Error> {
    let dir = dir.as_ref();
    let error_path = dir.join(ERROR_FILE);
    if error_path.exists() {
        let error = fs::read_to_string(&error_path).with_context(|| error_path.display().to_string())?;
        return Ok(DatasetStatus::Failed { error });
    }
    if dir.join(SUBMITTED_FILE).exists() {
        let params = AnalysisParams::load(dir.join(PARAMS_FILE))?;
        let mut store = ArtifactStore::new(dir);
        let stage = Artifact::PIPELINE
            .iter()
            .filter(|a| !(**a == Artifact::BaselineVis && params.baseline_vismethod == BaselineVis::None))
            .find(|a| !store.exists(a))
            .map(|a| a.to_string())
            .unwrap_or_else(|| "finishing".to_string());
        return Ok(DatasetStatus::Running {
            stage,
            progress: FileSnoop::read(dir.join(PROGRESS_FILE)),
        });
    }
    if dir.join(RUN_RECORD_FILE).exists() {
        return Ok(DatasetStatus::Done);
    }
    Ok(DatasetStatus::NotStarted)
}

/// Remove every derived file, keeping the raw data, gene names and parameters.
pub fn delete_results(dir: impl AsRef<Path>) -> Result<usize, Error> {
    let dir = dir.as_ref();
    let mut store = ArtifactStore::new(dir);
    let mut derived = Artifact::PIPELINE.to_vec();
    derived.extend(store.track_artifacts()?);
    let mut removed = 0;
    for artifact in &derived {
        if store.exists(artifact) {
            store.remove(artifact)?;
            removed += 1;
        }
    }
    for name in [
        UPLOADED_TRACKS_FILE,
        CUSTOM_SELECTIONS_FILE,
        RUN_RECORD_FILE,
        ERROR_FILE,
        SUBMITTED_FILE,
        PROGRESS_FILE,
    ] {
        if dir.join(name).exists() {
            store.remove_file(name);
            removed += 1;
        }
    }
    info!("removed {} result files from {}", removed, dir.display());
    Ok(removed)
}

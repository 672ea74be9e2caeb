//! # sc-analysis: cached single-cell analysis of dataset directories
//!
//! An `Analysis` owns one dataset directory. Derived values (subsets, factorization,
//! clustering, visualizations, differential expression, custom selections) are files in
//! that directory, computed on first use and reused afterwards.

/// The per-dataset façade
pub mod analysis;

/// Differential expression over color tracks
pub mod diffexp;

/// Dimensionality reduction for visualization
pub mod dim_red;

/// Error kinds
pub mod error;

/// Factorization of counts into cluster means and cell weights
pub mod factorization;

/// Memo cache and lock files
pub mod guard;

/// MTX and dense text loading routines
pub mod mtx;

/// Run parameters and service configuration
pub mod params;

/// Full and partial pipeline runs, dataset status
pub mod pipeline;

/// Recluster operations on `m`/`w`
pub mod recluster;

/// Rule-based custom selections
pub mod rules;

/// File-backed artifact cache
pub mod store;

/// Gene and cell subsets
pub mod subset;

/// Dataset summary and preprocessing suggestions
pub mod summary;

pub use analysis::{Analysis, GeneScore, TrackInfo, CLUSTER_TRACK};
pub use error::{kind, AnalysisError};
pub use factorization::{Factorization, FactorizeOptions, Factorizer, PoissonStateEstimator};
pub use guard::{LockFile, MemoCache, MemoKey};
pub use params::{AnalysisParams, LockConfig, MemoConfig};
pub use pipeline::{dataset_status, delete_results, run_full_analysis, run_post_analysis, DatasetStatus, PipelineOutcome};
pub use recluster::ReclusterOp;
pub use rules::{Criterion, CustomSelection};
pub use store::{Artifact, ArtifactStore, DiffexpMode};

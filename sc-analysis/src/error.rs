//! Failure modes callers are expected to tell apart.
//!
//! Everything is still returned as `anyhow::Error`; use
//! `err.downcast_ref::<AnalysisError>()` to branch on the kind.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    /// An artifact is absent and cannot be derived
    NotFound { artifact: String },
    /// A compute step failed
    Compute { stage: String, message: String },
    /// Recluster arguments reference a cluster or cell that does not exist
    InvalidCluster { message: String },
    /// The dataset cannot be modified
    ReadOnlyDataset,
    /// Another process holds the lock for this computation
    LockHeld { path: String },
    /// A criterion names a data source that does not exist
    UnknownSelectionType { name: String },
    /// A criterion is malformed
    InvalidCriterion { message: String },
}

impl AnalysisError {
    pub fn invalid_cluster(message: impl Into<String>) -> Self {
        AnalysisError::InvalidCluster {
            message: message.into(),
        }
    }

    pub fn not_found(artifact: impl Into<String>) -> Self {
        AnalysisError::NotFound {
            artifact: artifact.into(),
        }
    }
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::NotFound { artifact } => write!(f, "artifact not found: {artifact}"),
            AnalysisError::Compute { stage, message } => write!(f, "error computing {stage}: {message}"),
            AnalysisError::InvalidCluster { message } => write!(f, "invalid recluster request: {message}"),
            AnalysisError::ReadOnlyDataset => write!(f, "dataset is read-only"),
            AnalysisError::LockHeld { path } => {
                write!(f, "computation already in progress ({path}), try again")
            }
            AnalysisError::UnknownSelectionType { name } => write!(f, "unknown selection type: {name}"),
            AnalysisError::InvalidCriterion { message } => write!(f, "invalid criterion: {message}"),
        }
    }
}

impl std::error::Error for AnalysisError {}

/// Kind of `err`, if it carries an `AnalysisError` anywhere in its chain.
pub fn kind(err: &anyhow::Error) -> Option<&AnalysisError> {
    err.chain().find_map(|e| e.downcast_ref::<AnalysisError>())
}

//! Shared data model for single-cell analysis datasets.

/// Per-cell labelings used for coloring and grouping
pub mod color_track;

/// Grouping of cell indices by label
pub mod label_class;

/// Genes x cells count matrix
pub mod matrix;

pub use color_track::{ColorTrack, TrackSource, TrackValues, UNASSIGNED_LABEL};
pub use label_class::LabelClass;
pub use matrix::CountMatrix;

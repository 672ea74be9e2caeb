use crate::error::AnalysisError;
use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Grouping used for a per-track differential expression result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiffexpMode {
    #[serde(rename = "1_vs_rest")]
    OneVsRest,
    #[serde(rename = "pairwise")]
    Pairwise,
}

impl DiffexpMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiffexpMode::OneVsRest => "1_vs_rest",
            DiffexpMode::Pairwise => "pairwise",
        }
    }
}

impl FromStr for DiffexpMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "1_vs_rest" | "1-vs-rest" | "one_vs_rest" => Ok(DiffexpMode::OneVsRest),
            "pairwise" => Ok(DiffexpMode::Pairwise),
            _ => bail!("unknown diffexp mode {:?}", s),
        }
    }
}

/// Every cached value of a dataset directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Artifact {
    GeneSubset,
    CellSubset,
    M,
    W,
    CellSample,
    DimRed,
    BaselineVis,
    MdsMeans,
    Labels,
    TopGenes,
    Pvals,
    TopGenes1VsRest,
    Pvals1VsRest,
    PairwiseRatios,
    PairwisePvals,
    Entropy,
    /// evaluated custom selection
    ColorTrack(String),
    /// differential expression over a discrete color track
    TrackDiffexp { track: String, mode: DiffexpMode },
}

impl Artifact {
    /// File name inside the dataset directory
    pub fn file_name(&self) -> String {
        match self {
            Artifact::GeneSubset => "gene_subset.txt".into(),
            Artifact::CellSubset => "cells_subset.txt".into(),
            Artifact::M => "m.txt".into(),
            Artifact::W => "w.txt".into(),
            Artifact::CellSample => "cell_sample.txt".into(),
            Artifact::DimRed => "mds_data.txt".into(),
            Artifact::BaselineVis => "baseline_vis.txt".into(),
            Artifact::MdsMeans => "mds_means.txt".into(),
            Artifact::Labels => "labels.txt".into(),
            Artifact::TopGenes => "top_genes.txt".into(),
            Artifact::Pvals => "gene_pvals.txt".into(),
            Artifact::TopGenes1VsRest => "top_genes_1_vs_rest.txt".into(),
            Artifact::Pvals1VsRest => "gene_pvals_1_vs_rest.txt".into(),
            Artifact::PairwiseRatios => "t_scores.txt".into(),
            Artifact::PairwisePvals => "t_pvals.txt".into(),
            Artifact::Entropy => "entropy.txt".into(),
            Artifact::ColorTrack(name) => format!("color_track_{name}.json"),
            Artifact::TrackDiffexp { track, mode } => format!("diffexp_{}_{}.json", track, mode.as_str()),
        }
    }

    /// Artifacts derived from the clustering. These are dropped whenever `m`/`w` change;
    /// visualization coordinates are not.
    pub const CLUSTER_DERIVED: [Artifact; 9] = [
        Artifact::TopGenes,
        Artifact::Pvals,
        Artifact::TopGenes1VsRest,
        Artifact::Pvals1VsRest,
        Artifact::PairwiseRatios,
        Artifact::PairwisePvals,
        Artifact::Entropy,
        Artifact::MdsMeans,
        Artifact::Labels,
    ];

    /// Everything the pipeline writes, in dependency order.
    pub const PIPELINE: [Artifact; 16] = [
        Artifact::GeneSubset,
        Artifact::CellSubset,
        Artifact::M,
        Artifact::W,
        Artifact::Labels,
        Artifact::CellSample,
        Artifact::MdsMeans,
        Artifact::DimRed,
        Artifact::BaselineVis,
        Artifact::TopGenes,
        Artifact::Pvals,
        Artifact::TopGenes1VsRest,
        Artifact::Pvals1VsRest,
        Artifact::PairwiseRatios,
        Artifact::PairwisePvals,
        Artifact::Entropy,
    ];

    /// Recognize per-track files so they can be swept without knowing the track names.
    pub fn parse_file_name(file: &str) -> Option<Artifact> {
        if let Some(rest) = file.strip_prefix("color_track_").and_then(|r| r.strip_suffix(".json")) {
            return Some(Artifact::ColorTrack(rest.to_string()));
        }
        let rest = file.strip_prefix("diffexp_")?.strip_suffix(".json")?;
        for mode in [DiffexpMode::OneVsRest, DiffexpMode::Pairwise] {
            if let Some(track) = rest.strip_suffix(mode.as_str()).and_then(|t| t.strip_suffix('_')) {
                return Some(Artifact::TrackDiffexp {
                    track: track.to_string(),
                    mode,
                });
            }
        }
        None
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::ColorTrack(name) => write!(f, "color_track:{name}"),
            Artifact::TrackDiffexp { track, mode } => write!(f, "diffexp:{}:{}", track, mode.as_str()),
            other => {
                let name = other.file_name();
                write!(f, "{}", name.trim_end_matches(".txt"))
            }
        }
    }
}

/// Track names end up in file names.
pub fn check_track_name(name: &str) -> Result<(), Error> {
    let ok = !name.is_empty()
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if !ok {
        bail!(AnalysisError::InvalidCriterion {
            message: format!("invalid track name {name:?}"),
        });
    }
    Ok(())
}

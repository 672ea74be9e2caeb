//! Per-dataset run parameters (`params.json`) and service configuration.

use anyhow::{Context, Error};
use diff_exp::DiffExpParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Cluster count used when `k` is 0
pub const DEFAULT_K: usize = 10;

/// Noise model of the factorization
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Distribution {
    #[default]
    Poiss,
    LogNorm,
    NB,
}

/// How cells are laid out in the main scatter plot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DimRedMethod {
    #[default]
    Mds,
    Pca,
}

/// Visualization computed directly from the data, independent of the factorization
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BaselineVis {
    #[default]
    None,
    Tsvd,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisParams {
    /// number of clusters, 0 selects the default
    pub k: usize,
    pub dist: Distribution,
    /// fraction of genes kept in each mean bin
    pub genes_frac: f64,
    pub nbins: usize,
    /// fraction of cells kept for visualization
    pub cell_frac: f64,
    pub min_reads: f64,
    pub max_reads: f64,
    pub vismethod: DimRedMethod,
    pub baseline_vismethod: BaselineVis,
    pub use_fdr: bool,
    pub n_perms: usize,
    pub max_iters: usize,
    pub seed: u64,
    /// bundled datasets cannot be reclustered
    pub read_only: bool,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        AnalysisParams {
            k: 0,
            dist: Distribution::Poiss,
            genes_frac: 0.2,
            nbins: 5,
            cell_frac: 1.0,
            min_reads: 0.0,
            max_reads: 1e10,
            vismethod: DimRedMethod::Mds,
            baseline_vismethod: BaselineVis::None,
            use_fdr: false,
            n_perms: diff_exp::diff_exp::N_PERMS_DEFAULT,
            max_iters: 30,
            seed: 0,
            read_only: false,
        }
    }
}

impl AnalysisParams {
    /// Read `params.json`, falling back to defaults when the file is absent.
    pub fn load(path: impl AsRef<Path>) -> Result<AnalysisParams, Error> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(AnalysisParams::default());
        }
        let text = fs::read_to_string(path).with_context(|| path.display().to_string())?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn clusters(&self) -> usize {
        if self.k == 0 {
            DEFAULT_K
        } else {
            self.k
        }
    }

    pub fn diff_exp(&self) -> DiffExpParams {
        DiffExpParams {
            n_perms: self.n_perms,
            use_fdr: self.use_fdr,
            seed: self.seed,
        }
    }
}

/// Request-level memoization settings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoConfig {
    /// maximum number of entries before the least recently used is evicted
    pub capacity: usize,
    /// entries older than this are recomputed
    pub ttl: Duration,
}

impl Default for MemoConfig {
    fn default() -> Self {
        MemoConfig {
            capacity: 256,
            ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Lock-file settings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockConfig {
    /// a lock file not refreshed for this long is considered abandoned
    pub stale_after: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            stale_after: Duration::from_secs(10 * 60),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_partial_params() {
        let p: AnalysisParams =
            serde_json::from_str(r#"{"k": 8, "dist": "LogNorm", "vismethod": "pca", "unknown": 3}"#).unwrap();
        assert_eq!(p.clusters(), 8);
        assert_eq!(p.dist, Distribution::LogNorm);
        assert_eq!(p.vismethod, DimRedMethod::Pca);
        assert_eq!(p.genes_frac, 0.2);
        assert_eq!(p.n_perms, 100);
        assert_eq!(AnalysisParams::default().clusters(), DEFAULT_K);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = AnalysisParams::load(dir.path().join("params.json")).unwrap();
        assert_eq!(p, AnalysisParams::default());
    }
}

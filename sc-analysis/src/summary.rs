//! Per-dataset summary used to suggest preprocessing parameters before a run.

use crate::error::AnalysisError;
use crate::mtx;
use crate::store::write_atomic;
use anyhow::Error;
use diff_exp::stat::Statistics;
use log::info;
use sc_types::CountMatrix;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const PREPROCESS_FILE: &str = "preprocess.json";

/// Cells shown in plots before sampling kicks in
const VIS_CELLS: f64 = 10000.0;

#[derive(Clone, Debug, PartialEq)]
pub struct DatasetSummary {
    pub cells: usize,
    pub genes: usize,
    /// total reads per cell
    pub read_counts: Vec<f64>,
    /// expressed genes per cell
    pub gene_counts: Vec<usize>,
    pub gene_means: Vec<f64>,
    pub gene_vars: Vec<f64>,
}

/// Suggested parameters, written to `preprocess.json`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreprocessParams {
    pub min_reads: f64,
    pub max_reads: f64,
    pub genes_frac: f64,
    pub nbins: usize,
    pub cell_frac: f64,
    pub cells: usize,
    pub genes: usize,
    pub median_reads: f64,
}

impl DatasetSummary {
    pub fn from_matrix(mat: &CountMatrix) -> DatasetSummary {
        let (gene_means, gene_vars) = mat.gene_mean_var();
        DatasetSummary {
            cells: mat.cells(),
            genes: mat.genes(),
            read_counts: mat.cell_sums(),
            gene_counts: mat.cell_nnz(),
            gene_means,
            gene_vars,
        }
    }

    /// Summarize the raw data of a dataset directory.
    pub fn load(dir: impl AsRef<Path>) -> Result<DatasetSummary, Error> {
        let path = mtx::find_data_file(dir.as_ref()).ok_or_else(|| AnalysisError::not_found("data"))?;
        Ok(DatasetSummary::from_matrix(&mtx::load_matrix(path)?))
    }

    pub fn median_reads(&self) -> f64 {
        self.read_counts.median()
    }

    pub fn preprocessing_params(&self) -> PreprocessParams {
        let cell_frac = if self.cells == 0 {
            1.0
        } else {
            ((VIS_CELLS / self.cells as f64).min(1.0) * 100.0).round() / 100.0
        };
        PreprocessParams {
            min_reads: self.read_counts.percentile(5.0),
            max_reads: self.read_counts.percentile(95.0),
            genes_frac: 0.2,
            nbins: 5,
            cell_frac,
            cells: self.cells,
            genes: self.genes,
            median_reads: self.median_reads(),
        }
    }
}

/// Summarize a dataset and write `preprocess.json` next to its data.
pub fn write_preprocess(dir: impl AsRef<Path>) -> Result<PreprocessParams, Error> {
    let dir = dir.as_ref();
    let params = DatasetSummary::load(dir)?.preprocessing_params();
    write_atomic(&dir.join(PREPROCESS_FILE), |w| {
        serde_json::to_writer_pretty(w, &params)?;
        Ok(())
    })?;
    info!(
        "{}: {} cells, {} genes, reads in [{:.1}, {:.1}]",
        dir.display(),
        params.cells,
        params.genes,
        params.min_reads,
        params.max_reads
    );
    Ok(params)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    #[test]
    fn test_preprocessing_params() {
        // cell j has j + 1 reads, all in gene 0
        let mut dense = Array2::<f64>::zeros((3, 20));
        for j in 0..20 {
            dense[[0, j]] = (j + 1) as f64;
        }
        let summary = DatasetSummary::from_matrix(&CountMatrix::from_dense(&dense));
        assert_eq!(summary.gene_counts, vec![1; 20]);

        let p = summary.preprocessing_params();
        assert_relative_eq!(p.min_reads, 1.95, epsilon = 1e-9);
        assert_relative_eq!(p.max_reads, 19.05, epsilon = 1e-9);
        assert_relative_eq!(p.median_reads, 10.5, epsilon = 1e-9);
        assert_eq!(p.cell_frac, 1.0);
        assert_eq!((p.cells, p.genes, p.nbins), (20, 3, 5));
    }

    #[test]
    fn test_cell_frac_rounding() {
        let summary = DatasetSummary {
            cells: 30000,
            genes: 1,
            read_counts: vec![1.0; 30000],
            gene_counts: vec![1; 30000],
            gene_means: vec![1.0],
            gene_vars: vec![0.0],
        };
        assert_eq!(summary.preprocessing_params().cell_frac, 0.33);
    }

    #[test]
    fn test_write_preprocess() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.txt"), "1 2 3\n0 5 0\n").unwrap();
        let p = write_preprocess(dir.path()).unwrap();
        assert_eq!((p.cells, p.genes), (3, 2));
        let text = std::fs::read_to_string(dir.path().join(PREPROCESS_FILE)).unwrap();
        let back: PreprocessParams = serde_json::from_str(&text).unwrap();
        assert_eq!(back, p);
    }
}

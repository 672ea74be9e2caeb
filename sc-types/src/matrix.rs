use anyhow::{ensure, Error};
use ndarray::Array2;
use sprs::{CsMat, TriMat};

/// Raw count matrix with genes as rows and cells as columns, stored
/// column-major so that per-cell access is a contiguous slice.
#[derive(Clone, Debug, PartialEq)]
pub struct CountMatrix {
    matrix: CsMat<f64>,
}

impl CountMatrix {
    /// Build from `(gene, cell, value)` triplets. Duplicate entries are summed.
    pub fn from_triplets(
        genes: usize,
        cells: usize,
        triplets: impl IntoIterator<Item = (usize, usize, f64)>,
    ) -> Result<CountMatrix, Error> {
        let mut tri = TriMat::new((genes, cells));
        for (g, c, v) in triplets {
            ensure!(g < genes && c < cells, "entry ({}, {}) outside {} x {} matrix", g, c, genes, cells);
            if v != 0.0 {
                tri.add_triplet(g, c, v);
            }
        }
        Ok(CountMatrix { matrix: tri.to_csc() })
    }

    /// Build from a dense genes x cells array.
    pub fn from_dense(dense: &Array2<f64>) -> CountMatrix {
        let (genes, cells) = dense.dim();
        let mut tri = TriMat::new((genes, cells));
        for ((g, c), &v) in dense.indexed_iter() {
            if v != 0.0 {
                tri.add_triplet(g, c, v);
            }
        }
        CountMatrix { matrix: tri.to_csc() }
    }

    /// Number of genes (rows)
    pub fn genes(&self) -> usize {
        self.matrix.rows()
    }

    /// Number of cells (columns)
    pub fn cells(&self) -> usize {
        self.matrix.cols()
    }

    /// Number of stored non-zero entries
    pub fn nnz(&self) -> usize {
        self.matrix.nnz()
    }

    /// Underlying CSC matrix
    pub fn inner(&self) -> &CsMat<f64> {
        &self.matrix
    }

    /// Non-zero `(gene, value)` entries of one cell.
    pub fn cell(&self, cell: usize) -> Vec<(usize, f64)> {
        match self.matrix.outer_view(cell) {
            Some(col) => col.iter().map(|(g, &v)| (g, v)).collect(),
            None => Vec::new(),
        }
    }

    /// Total counts per cell.
    pub fn cell_sums(&self) -> Vec<f64> {
        self.matrix
            .outer_iterator()
            .map(|col| col.iter().map(|(_, &v)| v).sum())
            .collect()
    }

    /// Number of detected (non-zero) genes per cell.
    pub fn cell_nnz(&self) -> Vec<usize> {
        self.matrix
            .outer_iterator()
            .map(|col| col.iter().filter(|(_, &v)| v != 0.0).count())
            .collect()
    }

    /// Per-gene mean and population variance across all cells.
    pub fn gene_mean_var(&self) -> (Vec<f64>, Vec<f64>) {
        let n = self.cells() as f64;
        let mut sum = vec![0.0; self.genes()];
        let mut sum_sq = vec![0.0; self.genes()];
        for col in self.matrix.outer_iterator() {
            for (g, &v) in col.iter() {
                sum[g] += v;
                sum_sq[g] += v * v;
            }
        }
        if n == 0.0 {
            return (sum, sum_sq);
        }
        let means = sum.iter().map(|s| s / n).collect::<Vec<_>>();
        let vars = sum_sq
            .iter()
            .zip(&means)
            .map(|(sq, m)| (sq / n - m * m).max(0.0))
            .collect();
        (means, vars)
    }

    /// Dense expression values of one gene across all cells.
    pub fn gene_values(&self, gene: usize) -> Vec<f64> {
        let mut out = vec![0.0; self.cells()];
        for (c, col) in self.matrix.outer_iterator().enumerate() {
            if let Some(&v) = col.get(gene) {
                out[c] = v;
            }
        }
        out
    }

    /// Sub-matrix restricted to the given genes and cells (in the given order).
    /// `None` keeps every gene or cell.
    pub fn select(&self, genes: Option<&[usize]>, cells: Option<&[usize]>) -> CountMatrix {
        let gene_map = genes.map(|gs| {
            let mut map = vec![None; self.genes()];
            for (new, &old) in gs.iter().enumerate() {
                map[old] = Some(new);
            }
            map
        });
        let n_genes = genes.map_or(self.genes(), <[usize]>::len);
        let all_cells;
        let cells = match cells {
            Some(c) => c,
            None => {
                all_cells = (0..self.cells()).collect::<Vec<_>>();
                &all_cells
            }
        };

        let mut tri = TriMat::new((n_genes, cells.len()));
        for (new_c, &old_c) in cells.iter().enumerate() {
            for (g, v) in self.cell(old_c) {
                let row = match &gene_map {
                    Some(map) => map[g],
                    None => Some(g),
                };
                if let Some(row) = row {
                    tri.add_triplet(row, new_c, v);
                }
            }
        }
        CountMatrix { matrix: tri.to_csc() }
    }

    /// Dense copy of the matrix.
    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros((self.genes(), self.cells()));
        for (c, col) in self.matrix.outer_iterator().enumerate() {
            for (g, &v) in col.iter() {
                dense[[g, c]] = v;
            }
        }
        dense
    }
}

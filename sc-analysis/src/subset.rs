//! Gene and cell subsets feeding the factorization, and the cell sample used for plots.

use ball_tree::{BallTree, Point};
use itertools::Itertools;
use log::info;
use ndarray::Array2;
use noisy_float::types::n64;
use rand::SeedableRng;
use rand_distr::{Dirichlet, Distribution};
use rand_pcg::Pcg64Mcg;
use sc_types::CountMatrix;

/// Genes sorted by mean expression are cut into `n_bins` equal bins; in each bin the
/// `frac` most variable genes are kept (at least one per non-empty bin). Result is sorted.
pub fn select_gene_subset(mat: &CountMatrix, frac: f64, n_bins: usize) -> Vec<usize> {
    let genes = mat.genes();
    if genes == 0 || frac <= 0.0 {
        return Vec::new();
    }
    let (means, vars) = mat.gene_mean_var();
    let by_mean = (0..genes).sorted_by_key(|&g| (n64(means[g]), g)).collect::<Vec<_>>();
    let n_bins = n_bins.clamp(1, genes);

    let mut keep = Vec::new();
    for b in 0..n_bins {
        let bin = &by_mean[b * genes / n_bins..(b + 1) * genes / n_bins];
        if bin.is_empty() {
            continue;
        }
        let n_keep = ((bin.len() as f64 * frac).floor() as usize).clamp(1, bin.len());
        keep.extend(
            bin.iter()
                .copied()
                .sorted_by_key(|&g| (std::cmp::Reverse(n64(vars[g])), g))
                .take(n_keep),
        );
    }
    keep.sort_unstable();
    info!("selected {} of {} genes", keep.len(), genes);
    keep
}

/// Cells whose total read count lies in `[min_reads, max_reads]`.
pub fn select_cell_subset(mat: &CountMatrix, min_reads: f64, max_reads: f64) -> Vec<bool> {
    let mask = mat
        .cell_sums()
        .into_iter()
        .map(|s| s >= min_reads && s <= max_reads)
        .collect::<Vec<_>>();
    info!(
        "selected {} of {} cells with reads in [{}, {}]",
        mask.iter().filter(|&&k| k).count(),
        mask.len(),
        min_reads,
        max_reads
    );
    mask
}

/// Positions of the set entries of a mask.
pub fn mask_indices(mask: &[bool]) -> Vec<usize> {
    mask.iter().enumerate().filter(|(_, &k)| k).map(|(i, _)| i).collect()
}

#[derive(PartialEq)]
struct Weights(Vec<f64>);

impl Point for Weights {
    fn distance(&self, other: &Self) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    }

    fn move_towards(&self, other: &Self, d: f64) -> Self {
        let total = self.distance(other);
        let frac = if total == 0.0 { 0.0 } else { d / total };
        Weights(self.0.iter().zip(other.0.iter()).map(|(&s, &o)| s + frac * (o - s)).collect())
    }
}

/// Down-sample cells for visualization, spread over the simplex of cluster weights.
///
/// `w` is `k x cells`. With `frac >= 1` every cell is returned, in order. Otherwise
/// `floor(cells * frac)` uniform points on the simplex are drawn and each takes the
/// nearest cell not yet taken.
pub fn sample_cells(w: &Array2<f64>, frac: f64, seed: u64) -> Vec<usize> {
    let (k, cells) = w.dim();
    if frac >= 1.0 {
        return (0..cells).collect();
    }
    let n_sample = ((cells as f64) * frac.max(0.0)).floor() as usize;
    if n_sample == 0 {
        return Vec::new();
    }
    let dirichlet = match Dirichlet::new_with_size(1.0, k) {
        Ok(d) => d,
        // a single cluster puts every cell on the same point
        Err(_) => return (0..n_sample).collect(),
    };

    info!("building ball tree of {} cells", cells);
    let points = w.columns().into_iter().map(|c| Weights(c.to_vec())).collect();
    let tree = BallTree::new(points, (0..cells).collect());
    let mut query = tree.query();

    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let mut taken = vec![false; cells];
    let mut sample = Vec::with_capacity(n_sample);
    for _ in 0..n_sample {
        let point = Weights(dirichlet.sample(&mut rng));
        let nearest = query.nn(&point).map(|(_, _, &c)| c).find(|&c| !taken[c]);
        if let Some(c) = nearest {
            taken[c] = true;
            sample.push(c);
        }
    }
    sample.sort_unstable();
    sample
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn test_gene_subset() {
        // gene means 1, 1, 10, 10; variance is 0 for genes 0 and 3
        let mat = CountMatrix::from_dense(&array![
            [1.0, 1.0, 1.0, 1.0],
            [0.0, 2.0, 0.0, 2.0],
            [0.0, 20.0, 0.0, 20.0],
            [10.0, 10.0, 10.0, 10.0],
        ]);
        assert_eq!(select_gene_subset(&mat, 0.5, 2), vec![1, 2]);
        assert_eq!(select_gene_subset(&mat, 0.1, 2), vec![1, 2]);
        assert_eq!(select_gene_subset(&mat, 1.0, 2), vec![0, 1, 2, 3]);
        assert_eq!(select_gene_subset(&mat, 0.5, 0), vec![1, 2]);
        assert!(select_gene_subset(&mat, 0.0, 2).is_empty());
        // deterministic
        assert_eq!(select_gene_subset(&mat, 0.3, 3), select_gene_subset(&mat, 0.3, 3));
    }

    #[test]
    fn test_cell_subset() {
        let mat = CountMatrix::from_dense(&array![[1.0, 5.0, 50.0], [0.0, 5.0, 50.0]]);
        assert_eq!(select_cell_subset(&mat, 2.0, 10.0), vec![false, true, false]);
        assert_eq!(select_cell_subset(&mat, 0.0, 1e10), vec![true, true, true]);
        assert_eq!(mask_indices(&[false, true, true]), vec![1, 2]);
    }

    #[test]
    fn test_sample_identity() {
        for n in [0, 1, 7, 100] {
            let w = Array2::from_elem((3, n), 1.0 / 3.0);
            assert_eq!(sample_cells(&w, 1.0, 0), (0..n).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_sample_fraction() {
        let w = Array2::from_shape_fn((2, 40), |(r, c)| if (c % 2 == 0) == (r == 0) { 0.9 } else { 0.1 });
        let s = sample_cells(&w, 0.25, 3);
        assert_eq!(s.len(), 10);
        assert!(s.windows(2).all(|p| p[0] < p[1]));
        assert_eq!(s, sample_cells(&w, 0.25, 3));
        assert!(sample_cells(&w, 0.0, 3).is_empty());
        let single = Array2::from_elem((1, 10), 1.0);
        assert_eq!(sample_cells(&single, 0.5, 0), vec![0, 1, 2, 3, 4]);
    }
}

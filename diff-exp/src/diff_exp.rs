//! Cluster-level differential expression with permutation p-values
//!
use std::collections::BTreeMap;

use crate::dist;
use crate::stat::Statistics;
use anyhow::{ensure, format_err, Error};
use log::{debug, info};
use ndarray::{Array, Array2, Array3, Axis, Dimension, Zip};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use rayon::prelude::*;
use sc_types::CountMatrix;
use serde::{Deserialize, Serialize};
use snoop::Progress;

/// Pseudo-count added to both sides of every mean ratio
pub const EPS: f64 = 1e-10;
/// Default number of label permutations
pub const N_PERMS_DEFAULT: usize = 100;

/// Permutations evaluated between two progress reports
const PERM_CHUNK: usize = 10;

/// Knobs shared by all tests in this module
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiffExpParams {
    /// number of label permutations
    pub n_perms: usize,
    /// Benjamini-Hochberg adjust the permutation p-values
    pub use_fdr: bool,
    /// base seed; permutation `i` uses `seed + i`
    pub seed: u64,
}

impl Default for DiffExpParams {
    fn default() -> Self {
        DiffExpParams {
            n_perms: N_PERMS_DEFAULT,
            use_fdr: false,
            seed: 0,
        }
    }
}

/// Per-cluster scores and p-values, both `clusters x genes`
#[derive(Clone, Debug, PartialEq)]
pub struct DiffExpResult {
    pub scores: Array2<f64>,
    pub p_values: Array2<f64>,
}

/// Pairwise mean ratios and p-values, both `clusters x clusters x genes`
#[derive(Clone, Debug, PartialEq)]
pub struct PairwiseResult {
    pub ratios: Array3<f64>,
    pub p_values: Array3<f64>,
}

/// Counts scaled so that every cell has the median read count.
#[derive(Clone, Debug)]
pub struct NormalizedCells {
    genes: usize,
    cells: Vec<Vec<(usize, f64)>>,
}

impl NormalizedCells {
    pub fn new(mat: &CountMatrix) -> NormalizedCells {
        let sums = mat.cell_sums();
        let median = sums.median();
        let cells = (0..mat.cells())
            .map(|c| {
                let scale = if median > 0.0 && sums[c] > 0.0 { median / sums[c] } else { 1.0 };
                mat.cell(c).into_iter().map(|(g, v)| (g, v * scale)).collect()
            })
            .collect();
        NormalizedCells {
            genes: mat.genes(),
            cells,
        }
    }

    pub fn genes(&self) -> usize {
        self.genes
    }

    pub fn cells(&self) -> usize {
        self.cells.len()
    }

    /// Keep only the given cells, in the given order.
    pub fn select(&self, cells: &[usize]) -> NormalizedCells {
        NormalizedCells {
            genes: self.genes,
            cells: cells.iter().map(|&c| self.cells[c].clone()).collect(),
        }
    }
}

/// Per-group expression totals and cell counts.
#[derive(Clone, Debug)]
pub struct GroupSums {
    /// `groups x genes`
    pub sums: Array2<f64>,
    pub counts: Vec<usize>,
}

impl GroupSums {
    pub fn compute(data: &NormalizedCells, groups: &[usize], n_groups: usize) -> GroupSums {
        let mut sums = Array2::zeros((n_groups, data.genes));
        let mut counts = vec![0; n_groups];
        for (cell, &grp) in data.cells.iter().zip(groups) {
            counts[grp] += 1;
            for &(g, v) in cell {
                sums[[grp, g]] += v;
            }
        }
        GroupSums { sums, counts }
    }

    /// `groups x genes` mean expression, 0 for empty groups
    pub fn means(&self) -> Array2<f64> {
        let mut means = self.sums.clone();
        for (mut row, &n) in means.axis_iter_mut(Axis(0)).zip(&self.counts) {
            if n > 0 {
                row /= n as f64;
            }
        }
        means
    }
}

/// c-score: how much higher a cluster's mean is than the highest other cluster mean.
pub fn c_scores(sums: &GroupSums) -> Array2<f64> {
    let means = sums.means();
    let (n_groups, genes) = means.dim();
    let mut scores = Array2::zeros((n_groups, genes));
    for g in 0..genes {
        let col = means.column(g);
        // best and second best cluster means for this gene
        let (mut best, mut best_idx, mut second) = (0.0_f64, usize::MAX, 0.0_f64);
        for (c, &m) in col.iter().enumerate() {
            if best_idx == usize::MAX || m > best {
                second = if best_idx == usize::MAX { 0.0 } else { best };
                best = m;
                best_idx = c;
            } else if m > second {
                second = m;
            }
        }
        for (c, &m) in col.iter().enumerate() {
            let other = if c == best_idx { second } else { best };
            scores[[c, g]] = (m + EPS) / (other + EPS);
        }
    }
    scores
}

/// Ratio of in-cluster mean to the mean over every other cell.
pub fn one_vs_rest_scores(sums: &GroupSums) -> Array2<f64> {
    let means = sums.means();
    let totals = sums.sums.sum_axis(Axis(0));
    let n_total = sums.counts.iter().sum::<usize>();
    let mut scores = Array2::zeros(means.raw_dim());
    for (c, mut row) in scores.axis_iter_mut(Axis(0)).enumerate() {
        let n_out = n_total - sums.counts[c];
        for (g, s) in row.iter_mut().enumerate() {
            let mean_out = if n_out > 0 {
                (totals[g] - sums.sums[[c, g]]) / n_out as f64
            } else {
                0.0
            };
            *s = (means[[c, g]] + EPS) / (mean_out + EPS);
        }
    }
    scores
}

/// `[a, b, g]` = ratio of cluster a's mean to cluster b's mean. Diagonal is 0.
pub fn pairwise_ratios(sums: &GroupSums) -> Array3<f64> {
    let means = sums.means();
    let (n_groups, genes) = means.dim();
    Array3::from_shape_fn((n_groups, n_groups, genes), |(a, b, g)| {
        if a == b {
            0.0
        } else {
            (means[[a, g]] + EPS) / (means[[b, g]] + EPS)
        }
    })
}

/// Count, per entry, the label permutations whose statistic reaches the observed value.
fn permutation_counts<D, F, S>(
    data: &NormalizedCells,
    groups: &[usize],
    n_groups: usize,
    observed: &Array<f64, D>,
    params: &DiffExpParams,
    stat: F,
    snoop: &mut S,
) -> Array<f64, D>
where
    D: Dimension,
    F: Fn(&GroupSums) -> Array<f64, D> + Sync,
    S: Progress,
{
    let mut counts = Array::zeros(observed.raw_dim());
    let mut done = 0;
    while done < params.n_perms {
        let end = (done + PERM_CHUNK).min(params.n_perms);
        let chunk = (done..end)
            .into_par_iter()
            .map(|i| {
                let mut rng = Pcg64Mcg::seed_from_u64(params.seed.wrapping_add(i as u64));
                let mut shuffled = groups.to_vec();
                shuffled.shuffle(&mut rng);
                let perm = stat(&GroupSums::compute(data, &shuffled, n_groups));
                Zip::from(&perm)
                    .and(observed)
                    .map_collect(|&p, &o| if p >= o { 1.0 } else { 0.0 })
            })
            .reduce(|| Array::zeros(observed.raw_dim()), |a, b| a + b);
        counts += &chunk;
        done = end;
        snoop.set_progress(done as f64 / params.n_perms as f64);
    }
    counts
}

fn to_pvalues<D: Dimension>(counts: Array<f64, D>, params: &DiffExpParams) -> Array<f64, D> {
    let mut p = counts.mapv(|c| dist::permutation_pvalue(c, params.n_perms));
    if params.use_fdr {
        let last = Axis(p.ndim() - 1);
        for mut lane in p.lanes_mut(last) {
            let mut v = lane.to_vec();
            dist::adjust_in_place(&mut v);
            for (x, q) in lane.iter_mut().zip(v) {
                *x = q;
            }
        }
    }
    p
}

fn check_groups(data: &NormalizedCells, groups: &[usize], n_groups: usize) -> Result<(), Error> {
    ensure!(
        groups.len() == data.cells(),
        "{} group assignments for {} cells",
        groups.len(),
        data.cells()
    );
    if let Some(&bad) = groups.iter().find(|&&g| g >= n_groups) {
        return Err(format_err!("group id {} out of range for {} groups", bad, n_groups));
    }
    Ok(())
}

fn run_test<D, F, S>(
    data: &NormalizedCells,
    groups: &[usize],
    n_groups: usize,
    params: &DiffExpParams,
    stat: F,
    snoop: &mut S,
) -> Result<(Array<f64, D>, Array<f64, D>), Error>
where
    D: Dimension,
    F: Fn(&GroupSums) -> Array<f64, D> + Sync,
    S: Progress,
{
    check_groups(data, groups, n_groups)?;
    let observed = stat(&GroupSums::compute(data, groups, n_groups));
    debug!(
        "permutation test over {} cells, {} groups, {} permutations",
        data.cells(),
        n_groups,
        params.n_perms
    );
    let counts = permutation_counts(data, groups, n_groups, &observed, params, &stat, snoop);
    Ok((observed, to_pvalues(counts, params)))
}

/// c-score of every gene in every cluster with permutation p-values.
pub fn c_score_test<S: Progress>(
    data: &NormalizedCells,
    groups: &[usize],
    n_groups: usize,
    params: &DiffExpParams,
    mut snoop: S,
) -> Result<DiffExpResult, Error> {
    info!("c-score test over {} clusters", n_groups);
    let (scores, p_values) = run_test(data, groups, n_groups, params, c_scores, &mut snoop)?;
    Ok(DiffExpResult { scores, p_values })
}

/// One-vs-rest mean ratio of every gene in every cluster with permutation p-values.
pub fn one_vs_rest_test<S: Progress>(
    data: &NormalizedCells,
    groups: &[usize],
    n_groups: usize,
    params: &DiffExpParams,
    mut snoop: S,
) -> Result<DiffExpResult, Error> {
    info!("1-vs-rest test over {} clusters", n_groups);
    let (scores, p_values) = run_test(data, groups, n_groups, params, one_vs_rest_scores, &mut snoop)?;
    Ok(DiffExpResult { scores, p_values })
}

/// Mean ratio for every ordered pair of clusters with permutation p-values.
pub fn pairwise_test<S: Progress>(
    data: &NormalizedCells,
    groups: &[usize],
    n_groups: usize,
    params: &DiffExpParams,
    mut snoop: S,
) -> Result<PairwiseResult, Error> {
    info!("pairwise test over {} clusters", n_groups);
    let (ratios, mut p_values) = run_test(data, groups, n_groups, params, pairwise_ratios, &mut snoop)?;
    for a in 0..n_groups {
        p_values.slice_mut(ndarray::s![a, a, ..]).fill(1.0);
    }
    Ok(PairwiseResult { ratios, p_values })
}

/// Sort direction of a ranking
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RankOrder {
    /// largest first (scores, ratios)
    Descending,
    /// smallest first (p-values)
    Ascending,
}

/// Cluster id -> `(gene, value)` pairs, ordered by value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RankedGenes(pub BTreeMap<usize, Vec<(usize, f64)>>);

impl RankedGenes {
    /// Rank every row of a `clusters x genes` table. Ties keep gene order.
    pub fn from_scores(table: &Array2<f64>, order: RankOrder) -> RankedGenes {
        let ranked = table
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(c, row)| {
                let mut pairs = row.iter().copied().enumerate().collect::<Vec<_>>();
                match order {
                    RankOrder::Descending => pairs.sort_by(|a, b| b.1.total_cmp(&a.1)),
                    RankOrder::Ascending => pairs.sort_by(|a, b| a.1.total_cmp(&b.1)),
                }
                (c, pairs)
            })
            .collect();
        RankedGenes(ranked)
    }

    pub fn get(&self, cluster: usize) -> Option<&[(usize, f64)]> {
        self.0.get(&cluster).map(Vec::as_slice)
    }

    /// First `n` entries for one cluster
    pub fn top(&self, cluster: usize, n: usize) -> &[(usize, f64)] {
        match self.get(cluster) {
            Some(list) => &list[..n.min(list.len())],
            None => &[],
        }
    }

    pub fn num_clusters(&self) -> usize {
        self.0.len()
    }
}

/// `clusters x clusters x genes` table serialized as nested JSON lists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "Vec<Vec<Vec<f64>>>", try_from = "Vec<Vec<Vec<f64>>>")]
pub struct PairwiseTable(pub Array3<f64>);

impl From<PairwiseTable> for Vec<Vec<Vec<f64>>> {
    fn from(table: PairwiseTable) -> Self {
        table
            .0
            .outer_iter()
            .map(|plane| plane.outer_iter().map(|row| row.to_vec()).collect())
            .collect()
    }
}

impl TryFrom<Vec<Vec<Vec<f64>>>> for PairwiseTable {
    type Error = Error;

    fn try_from(nested: Vec<Vec<Vec<f64>>>) -> Result<Self, Error> {
        let a = nested.len();
        let b = nested.first().map_or(0, Vec::len);
        let g = nested.first().and_then(|p| p.first()).map_or(0, Vec::len);
        let mut flat = Vec::with_capacity(a * b * g);
        for plane in nested {
            ensure!(plane.len() == b, "ragged pairwise table");
            for row in plane {
                ensure!(row.len() == g, "ragged pairwise table");
                flat.extend(row);
            }
        }
        Ok(PairwiseTable(Array3::from_shape_vec((a, b, g), flat)?))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use snoop::NoOpSnoop;
    use ndarray::array;

    // genes x cells: gene 0 high in group 0, gene 1 high in group 1, gene 2 flat
    fn two_groups() -> (NormalizedCells, Vec<usize>) {
        let dense = array![
            [9.0, 8.0, 10.0, 0.0, 1.0, 0.0],
            [0.0, 1.0, 0.0, 9.0, 8.0, 10.0],
            [5.0, 5.0, 5.0, 5.0, 5.0, 5.0],
        ];
        let data = NormalizedCells::new(&CountMatrix::from_dense(&dense));
        (data, vec![0, 0, 0, 1, 1, 1])
    }

    #[test]
    fn test_normalization_to_median() {
        let dense = array![[2.0, 4.0, 10.0], [2.0, 4.0, 10.0]];
        let data = NormalizedCells::new(&CountMatrix::from_dense(&dense));
        let sums = GroupSums::compute(&data, &[0, 1, 2], 3);
        // median total is 8
        assert_relative_eq!(sums.sums[[0, 0]], 4.0);
        assert_relative_eq!(sums.sums[[2, 1]], 4.0);
    }

    #[test]
    fn test_scores() {
        let (data, groups) = two_groups();
        let sums = GroupSums::compute(&data, &groups, 2);
        assert_eq!(sums.counts, vec![3, 3]);

        let c = c_scores(&sums);
        assert!(c[[0, 0]] > 5.0);
        assert!(c[[1, 0]] < 0.2);
        assert_relative_eq!(c[[0, 2]], 1.0, epsilon = 1e-9);

        let r = one_vs_rest_scores(&sums);
        assert_relative_eq!(r[[0, 0]], c[[0, 0]], epsilon = 1e-9);

        let p = pairwise_ratios(&sums);
        assert_eq!(p.dim(), (2, 2, 3));
        assert_eq!(p[[0, 0, 0]], 0.0);
        assert_relative_eq!(p[[0, 1, 0]] * p[[1, 0, 0]], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_single_cluster_c_score() {
        let (data, _) = two_groups();
        let sums = GroupSums::compute(&data, &[0; 6], 1);
        let c = c_scores(&sums);
        assert!(c[[0, 2]] > 1e9);
    }

    #[test]
    fn test_permutation_pvalues() {
        let (data, groups) = two_groups();
        let params = DiffExpParams {
            n_perms: 50,
            ..Default::default()
        };
        let res = c_score_test(&data, &groups, 2, &params, NoOpSnoop).unwrap();
        // gene 0 is the strongest marker of cluster 0 and only 1 in 20 labelings
        // reproduces the observed split
        assert!(res.p_values[[0, 0]] < 0.3);
        assert!(res.p_values[[1, 0]] > 0.5);
        assert!(res.p_values.iter().all(|&p| p > 0.0 && p <= 1.0));

        // seeded: identical reruns
        let again = c_score_test(&data, &groups, 2, &params, NoOpSnoop).unwrap();
        assert_eq!(res, again);
    }

    #[test]
    fn test_pairwise_diagonal_and_fdr() {
        let (data, groups) = two_groups();
        let params = DiffExpParams {
            n_perms: 20,
            use_fdr: true,
            seed: 7,
        };
        let res = pairwise_test(&data, &groups, 2, &params, NoOpSnoop).unwrap();
        assert!(res.p_values.slice(ndarray::s![0, 0, ..]).iter().all(|&p| p == 1.0));
        assert!(res.p_values.iter().all(|&p| p <= 1.0));
        assert_eq!(res.ratios[[1, 1, 1]], 0.0);
    }

    #[test]
    fn test_no_permutations() {
        let (data, groups) = two_groups();
        let params = DiffExpParams {
            n_perms: 0,
            ..Default::default()
        };
        let res = one_vs_rest_test(&data, &groups, 2, &params, NoOpSnoop).unwrap();
        assert!(res.p_values.iter().all(|&p| p == 1.0));
    }

    #[test]
    fn test_bad_groups() {
        let (data, _) = two_groups();
        assert!(c_score_test(&data, &[0, 1, 2, 0, 1, 0], 2, &DiffExpParams::default(), NoOpSnoop).is_err());
        assert!(c_score_test(&data, &[0, 1], 2, &DiffExpParams::default(), NoOpSnoop).is_err());
    }

    #[test]
    fn test_ranked_genes() {
        let table = array![[0.5, 3.0, 1.0], [2.0, 0.1, 0.1]];
        let desc = RankedGenes::from_scores(&table, RankOrder::Descending);
        assert_eq!(desc.get(0).unwrap(), &[(1, 3.0), (2, 1.0), (0, 0.5)]);
        assert_eq!(desc.top(1, 1), &[(0, 2.0)]);
        assert!(desc.top(5, 3).is_empty());
        let asc = RankedGenes::from_scores(&table, RankOrder::Ascending);
        assert_eq!(asc.get(1).unwrap()[0], (1, 0.1));

        let json = serde_json::to_string(&desc).unwrap();
        assert!(json.starts_with("{\"0\":[[1,3.0]"));
        let back: RankedGenes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, desc);
    }

    #[test]
    fn test_pairwise_table_json() {
        let table = PairwiseTable(Array3::from_shape_fn((2, 2, 3), |(a, b, g)| (a * 6 + b * 3 + g) as f64));
        let json = serde_json::to_string(&table).unwrap();
        assert!(json.starts_with("[[[0.0,1.0,2.0],[3.0,4.0,5.0]]"));
        let back: PairwiseTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table);
        assert!(serde_json::from_str::<PairwiseTable>("[[[1.0],[1.0, 2.0]]]").is_err());
    }
}

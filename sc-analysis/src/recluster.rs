//! Split, merge, new-cluster and delete-cells edits of a factorization.
//!
//! The functions here only transform `m` and `w`. Persisting them and dropping the
//! artifacts that depend on the clustering is done by `Analysis::recluster`.

use crate::error::AnalysisError;
use crate::factorization::{labels_from_w, FactorizeOptions, Factorizer};
use crate::params::Distribution;
use anyhow::{bail, Error};
use itertools::Itertools;
use log::info;
use ndarray::{concatenate, s, Array1, Array2, Axis};
use sc_types::CountMatrix;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "op", content = "ids")]
pub enum ReclusterOp {
    /// re-estimate one cluster as two
    Split(usize),
    /// collapse clusters into the smallest id
    Merge(Vec<usize>),
    /// make a new cluster of the given cells
    New(Vec<usize>),
    /// drop cells from the analysis
    Delete(Vec<usize>),
}

impl ReclusterOp {
    /// Build from an operation name and its cluster ids or cell indices.
    pub fn parse(kind: &str, ids: Vec<usize>) -> Result<ReclusterOp, Error> {
        Ok(match kind {
            "split" => match ids.as_slice() {
                [c] => ReclusterOp::Split(*c),
                _ => bail!(AnalysisError::invalid_cluster(format!(
                    "split takes exactly one cluster, got {}",
                    ids.len()
                ))),
            },
            "merge" => ReclusterOp::Merge(ids),
            "new" => ReclusterOp::New(ids),
            "delete" => ReclusterOp::Delete(ids),
            other => bail!(AnalysisError::invalid_cluster(format!("unknown operation {other:?}"))),
        })
    }
}

impl fmt::Display for ReclusterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReclusterOp::Split(c) => write!(f, "split({c})"),
            ReclusterOp::Merge(ids) => write!(f, "merge({})", ids.iter().join(", ")),
            ReclusterOp::New(cells) => write!(f, "new({} cells)", cells.len()),
            ReclusterOp::Delete(cells) => write!(f, "delete({} cells)", cells.len()),
        }
    }
}

/// Whether `m`/`w` are being rewritten
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterState {
    Stable,
    Mutating,
}

fn check_cells(cells: &[usize], n: usize) -> Result<Vec<usize>, Error> {
    if cells.is_empty() {
        bail!(AnalysisError::invalid_cluster("no cells given"));
    }
    if let Some(bad) = cells.iter().find(|&&c| c >= n) {
        bail!(AnalysisError::invalid_cluster(format!("cell {bad} out of range for {n} cells")));
    }
    Ok(cells.iter().copied().sorted_unstable().dedup().collect())
}

/// Split cluster `cluster` by factorizing its cells into two states. The first keeps the
/// id, the second becomes cluster `k`.
pub fn split(
    m: &Array2<f64>,
    w: &Array2<f64>,
    cluster: usize,
    data_subset: &CountMatrix,
    factorizer: &dyn Factorizer,
    dist: Distribution,
    max_iters: usize,
) -> Result<(Array2<f64>, Array2<f64>), Error> {
    let k = w.nrows();
    if cluster >= k {
        bail!(AnalysisError::invalid_cluster(format!("cluster {cluster} out of range for {k} clusters")));
    }
    let labels = labels_from_w(w);
    let members = labels
        .iter()
        .enumerate()
        .filter(|(_, &l)| l == cluster)
        .map(|(c, _)| c)
        .collect::<Vec<_>>();
    if members.len() < 2 {
        bail!(AnalysisError::invalid_cluster(format!(
            "cluster {} has {} cells, need at least 2 to split",
            cluster,
            members.len()
        )));
    }
    info!("splitting cluster {} ({} cells)", cluster, members.len());

    let sub = data_subset.select(None, Some(&members));
    let options = FactorizeOptions { max_iters, init: None };
    let f = factorizer.factorize(&sub, 2, dist, &options)?;
    if f.m.dim() != (m.nrows(), 2) || f.w.dim() != (2, members.len()) {
        bail!(AnalysisError::Compute {
            stage: "split".to_string(),
            message: format!("factorizer returned m {:?}, w {:?}", f.m.dim(), f.w.dim()),
        });
    }

    let mut new_m = concatenate(Axis(1), &[m.view(), f.m.slice(s![.., 1..2])])?;
    new_m.column_mut(cluster).assign(&f.m.column(0));

    let mut new_w = concatenate(Axis(0), &[w.view(), Array2::zeros((1, w.ncols())).view()])?;
    let mut sub_w = f.w.clone();
    // both halves must keep at least one cell
    let sub_labels = labels_from_w(&sub_w);
    for side in 0..2 {
        if !sub_labels.contains(&side) {
            let mover = (0..members.len())
                .max_by(|&a, &b| sub_w[[side, a]].total_cmp(&sub_w[[side, b]]))
                .unwrap_or(0);
            let mut col = sub_w.column_mut(mover);
            col.fill(0.0);
            col[side] = 1.0;
        }
    }
    for (i, &cell) in members.iter().enumerate() {
        let mut col = new_w.column_mut(cell);
        col.fill(0.0);
        col[cluster] = sub_w[[0, i]];
        col[k] = sub_w[[1, i]];
    }
    Ok((new_m, new_w))
}

/// Merge `ids` into the smallest of them.
pub fn merge(m: &Array2<f64>, w: &Array2<f64>, ids: &[usize]) -> Result<(Array2<f64>, Array2<f64>), Error> {
    let k = w.nrows();
    let ids = ids.iter().copied().sorted_unstable().dedup().collect::<Vec<_>>();
    if ids.len() < 2 {
        bail!(AnalysisError::invalid_cluster("merge needs at least two distinct clusters"));
    }
    if let Some(bad) = ids.iter().find(|&&c| c >= k) {
        bail!(AnalysisError::invalid_cluster(format!("cluster {bad} out of range for {k} clusters")));
    }
    info!("merging clusters {}", ids.iter().join(", "));
    let target = ids[0];

    let merged_mean = ids
        .iter()
        .map(|&c| m.column(c).to_owned())
        .fold(Array1::zeros(m.nrows()), |acc, col| acc + col)
        / ids.len() as f64;
    let merged_weight = ids
        .iter()
        .map(|&c| w.row(c).to_owned())
        .fold(Array1::zeros(w.ncols()), |acc, row| acc + row);

    let keep = (0..k).filter(|c| *c == target || !ids.contains(c)).collect::<Vec<_>>();
    let mut new_m = m.select(Axis(1), &keep);
    let mut new_w = w.select(Axis(0), &keep);
    let pos = keep.iter().position(|&c| c == target).unwrap_or(0);
    new_m.column_mut(pos).assign(&merged_mean);
    new_w.row_mut(pos).assign(&merged_weight);
    Ok((new_m, new_w))
}

/// Assign `cells` to a new cluster `k` whose mean is their average expression.
pub fn new_cluster(
    m: &Array2<f64>,
    w: &Array2<f64>,
    cells: &[usize],
    data_subset: &CountMatrix,
) -> Result<(Array2<f64>, Array2<f64>), Error> {
    let k = w.nrows();
    let cells = check_cells(cells, w.ncols())?;
    if data_subset.genes() != m.nrows() || data_subset.cells() != w.ncols() {
        bail!(AnalysisError::Compute {
            stage: "new cluster".to_string(),
            message: "data does not match the factorization".to_string(),
        });
    }
    info!("new cluster {} from {} cells", k, cells.len());
    let mut mean = Array1::<f64>::zeros(m.nrows());
    for &c in &cells {
        for (g, v) in data_subset.cell(c) {
            mean[g] += v;
        }
    }
    mean /= cells.len() as f64;

    let new_m = concatenate(Axis(1), &[m.view(), mean.insert_axis(Axis(1)).view()])?;
    let mut new_w = concatenate(Axis(0), &[w.view(), Array2::zeros((1, w.ncols())).view()])?;
    for &c in &cells {
        let mut col = new_w.column_mut(c);
        col.fill(0.0);
        col[k] = 1.0;
    }
    Ok((new_m, new_w))
}

/// Remove `cells` from `w`. Returns the new `w` and the keep-mask over the old cells.
pub fn delete_cells(w: &Array2<f64>, cells: &[usize]) -> Result<(Array2<f64>, Vec<bool>), Error> {
    let n = w.ncols();
    let cells = check_cells(cells, n)?;
    if cells.len() >= n {
        bail!(AnalysisError::invalid_cluster("cannot delete every cell"));
    }
    info!("deleting {} of {} cells", cells.len(), n);
    let mut keep = vec![true; n];
    for &c in &cells {
        keep[c] = false;
    }
    let kept = (0..n).filter(|&c| keep[c]).collect::<Vec<_>>();
    Ok((w.select(Axis(1), &kept), keep))
}

/// Map old cell indices to new ones after deleting the cells cleared in `keep`.
pub fn remap_indices(indices: &[usize], keep: &[bool]) -> Vec<usize> {
    let mut new_index = Vec::with_capacity(keep.len());
    let mut next = 0;
    for &k in keep {
        new_index.push(if k { Some(next) } else { None });
        if k {
            next += 1;
        }
    }
    indices.iter().filter_map(|&i| new_index.get(i).copied().flatten()).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::factorization::Factorization;
    use ndarray::array;

    /// Splits cells by parity of their position.
    struct Halves;

    impl Factorizer for Halves {
        fn factorize(
            &self,
            data: &CountMatrix,
            k: usize,
            _dist: Distribution,
            _options: &FactorizeOptions,
        ) -> Result<Factorization, Error> {
            let w = Array2::from_shape_fn((k, data.cells()), |(r, c)| if c % k == r { 0.8 } else { 0.2 });
            Ok(Factorization {
                m: Array2::from_shape_fn((data.genes(), k), |(_, j)| j as f64 + 10.0),
                w,
                log_likelihood: 0.0,
            })
        }
    }

    fn model() -> (Array2<f64>, Array2<f64>, CountMatrix) {
        let m = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let w = array![
            [0.9, 0.8, 0.1, 0.1, 0.0],
            [0.1, 0.2, 0.8, 0.7, 0.0],
            [0.0, 0.0, 0.1, 0.2, 1.0]
        ];
        let data = CountMatrix::from_dense(&array![[1.0, 2.0, 3.0, 4.0, 5.0], [0.0, 0.0, 2.0, 2.0, 0.0]]);
        (m, w, data)
    }

    #[test]
    fn test_split() {
        let (m, w, data) = model();
        let (m2, w2) = split(&m, &w, 1, &data, &Halves, Distribution::Poiss, 5).unwrap();
        assert_eq!(m2.dim(), (2, 4));
        assert_eq!(m2.column(1).to_vec(), vec![10.0, 10.0]);
        assert_eq!(m2.column(3).to_vec(), vec![11.0, 11.0]);
        let labels = labels_from_w(&w2);
        assert_eq!(labels, vec![0, 0, 1, 3, 2]);

        let err = split(&m, &w, 2, &data, &Halves, Distribution::Poiss, 5).unwrap_err();
        assert!(matches!(crate::error::kind(&err), Some(AnalysisError::InvalidCluster { .. })));
        assert!(split(&m, &w, 3, &data, &Halves, Distribution::Poiss, 5).is_err());
    }

    #[test]
    fn test_merge() {
        let (m, w, _) = model();
        let (m2, w2) = merge(&m, &w, &[2, 0]).unwrap();
        assert_eq!(m2, array![[2.0, 2.0], [5.0, 5.0]]);
        assert_eq!(w2.row(0).to_vec(), vec![0.9, 0.8, 0.2, 0.30000000000000004, 1.0]);
        assert_eq!(labels_from_w(&w2), vec![0, 0, 1, 1, 0]);
        assert!(merge(&m, &w, &[1, 1]).is_err());
        assert!(merge(&m, &w, &[1, 5]).is_err());
    }

    #[test]
    fn test_new_and_delete() {
        let (m, w, data) = model();
        let (m2, w2) = new_cluster(&m, &w, &[0, 4, 0], &data).unwrap();
        assert_eq!(m2.column(3).to_vec(), vec![3.0, 0.0]);
        assert_eq!(labels_from_w(&w2), vec![3, 0, 1, 1, 3]);
        assert!(new_cluster(&m, &w, &[], &data).is_err());
        assert!(new_cluster(&m, &w, &[9], &data).is_err());

        let (w3, keep) = delete_cells(&w, &[1, 3]).unwrap();
        assert_eq!(w3.ncols(), 3);
        assert_eq!(keep, vec![true, false, true, false, true]);
        assert_eq!(remap_indices(&[0, 1, 2, 4], &keep), vec![0, 1, 2]);
        assert!(delete_cells(&w, &[0, 1, 2, 3, 4]).is_err());
    }

    #[test]
    fn test_parse() {
        assert_eq!(ReclusterOp::parse("split", vec![2]).unwrap(), ReclusterOp::Split(2));
        assert!(ReclusterOp::parse("split", vec![1, 2]).is_err());
        assert_eq!(ReclusterOp::parse("merge", vec![0, 3]).unwrap().to_string(), "merge(0, 3)");
        assert!(ReclusterOp::parse("explode", vec![]).is_err());
        let json = serde_json::to_string(&ReclusterOp::Merge(vec![0, 3])).unwrap();
        assert_eq!(json, r#"{"op":"merge","ids":[0,3]}"#);
    }
}

//! Matrix factorization `data ≈ m · w` with `m` genes x k cluster means and `w`
//! k x cells cluster weights, each column of `w` summing to one.

use crate::error::AnalysisError;
use crate::params::Distribution;
use anyhow::{bail, Error};
use log::{debug, info};
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use sc_types::CountMatrix;

const EPS: f64 = 1e-10;

#[derive(Clone, Debug, Default)]
pub struct FactorizeOptions {
    pub max_iters: usize,
    /// starting `(m, w)`, used when re-estimating after a recluster
    pub init: Option<(Array2<f64>, Array2<f64>)>,
}

#[derive(Clone, Debug)]
pub struct Factorization {
    pub m: Array2<f64>,
    pub w: Array2<f64>,
    pub log_likelihood: f64,
}

/// Anything that can cluster a count matrix into `k` soft states.
pub trait Factorizer: Send + Sync {
    fn factorize(
        &self,
        data: &CountMatrix,
        k: usize,
        dist: Distribution,
        options: &FactorizeOptions,
    ) -> Result<Factorization, Error>;
}

/// Poisson state estimation by multiplicative KL updates.
#[derive(Clone, Copy, Debug, Default)]
pub struct PoissonStateEstimator;

impl Factorizer for PoissonStateEstimator {
    fn factorize(
        &self,
        data: &CountMatrix,
        k: usize,
        dist: Distribution,
        options: &FactorizeOptions,
    ) -> Result<Factorization, Error> {
        let cells: Vec<Vec<(usize, f64)>> = match dist {
            Distribution::Poiss => (0..data.cells()).map(|c| data.cell(c)).collect(),
            Distribution::LogNorm => (0..data.cells())
                .map(|c| data.cell(c).into_iter().map(|(g, v)| (g, v.ln_1p())).collect())
                .collect(),
            Distribution::NB => bail!(AnalysisError::Compute {
                stage: "factorization".to_string(),
                message: "NB is not supported by the built-in estimator".to_string(),
            }),
        };
        if k == 0 || data.cells() == 0 || data.genes() == 0 {
            bail!(AnalysisError::Compute {
                stage: "factorization".to_string(),
                message: format!("cannot factorize {} x {} into {} states", data.genes(), data.cells(), k),
            });
        }

        let (mut m, mut w) = match &options.init {
            Some((m0, w0)) => {
                if m0.dim() != (data.genes(), k) || w0.dim() != (k, data.cells()) {
                    bail!(
                        "initial m {:?} / w {:?} do not match {} genes, {} cells, k = {}",
                        m0.dim(),
                        w0.dim(),
                        data.genes(),
                        data.cells(),
                        k
                    );
                }
                (m0.mapv(|v| v.max(EPS)), w0.mapv(|v| v.max(EPS)))
            }
            None => (init_means(&cells, data.genes(), k), Array2::from_elem((k, data.cells()), 1.0 / k as f64)),
        };
        normalize_columns(&mut w);

        info!(
            "factorizing {} genes x {} cells into {} states ({:?}, {} iterations)",
            data.genes(),
            data.cells(),
            k,
            dist,
            options.max_iters
        );
        for it in 0..options.max_iters {
            update_w(&cells, &m, &mut w);
            update_m(&cells, &mut m, &w);
            if it % 10 == 0 {
                debug!("iteration {}: log likelihood {:.4}", it, log_likelihood(&cells, &m, &w));
            }
        }
        let ll = log_likelihood(&cells, &m, &w);
        info!("factorization finished, log likelihood {:.4}", ll);
        Ok(Factorization {
            m,
            w,
            log_likelihood: ll,
        })
    }
}

fn rate(m: &Array2<f64>, w: &Array2<f64>, g: usize, c: usize) -> f64 {
    m.row(g).dot(&w.column(c)) + EPS
}

/// Deterministic farthest-point seeding: start from the deepest cell, then repeatedly
/// take the cell whose profile is farthest from every chosen one.
fn init_means(cells: &[Vec<(usize, f64)>], genes: usize, k: usize) -> Array2<f64> {
    let profiles = cells
        .iter()
        .map(|cell| {
            let total = cell.iter().map(|(_, v)| v).sum::<f64>().max(EPS);
            let mut p = Array1::zeros(genes);
            for &(g, v) in cell {
                p[g] = v / total;
            }
            p
        })
        .collect::<Vec<Array1<f64>>>();
    let depth = cells.iter().map(|c| c.iter().map(|(_, v)| v).sum::<f64>()).collect::<Vec<_>>();
    let mean_depth = depth.iter().sum::<f64>() / depth.len() as f64;

    let first = (0..cells.len())
        .max_by(|&a, &b| depth[a].total_cmp(&depth[b]).then(b.cmp(&a)))
        .unwrap_or(0);
    let mut chosen = vec![first];
    let mut nearest = profiles
        .iter()
        .map(|p| (p - &profiles[first]).mapv(|x| x * x).sum())
        .collect::<Vec<f64>>();
    while chosen.len() < k {
        let next = (0..cells.len())
            .max_by(|&a, &b| nearest[a].total_cmp(&nearest[b]).then(b.cmp(&a)))
            .unwrap_or(0);
        chosen.push(next);
        for (c, d) in nearest.iter_mut().enumerate() {
            let dn = (&profiles[c] - &profiles[next]).mapv(|x| x * x).sum();
            *d = d.min(dn);
        }
    }

    let mut m = Array2::zeros((genes, k));
    for (j, &c) in chosen.iter().enumerate() {
        let mut col = m.column_mut(j);
        col.assign(&(&profiles[c] * mean_depth));
        col.mapv_inplace(|v| v + 1e-3 * mean_depth / genes as f64 + EPS);
    }
    m
}

fn normalize_columns(w: &mut Array2<f64>) {
    for mut col in w.axis_iter_mut(Axis(1)) {
        let s = col.sum();
        if s > 0.0 {
            col /= s;
        }
    }
}

fn update_w(cells: &[Vec<(usize, f64)>], m: &Array2<f64>, w: &mut Array2<f64>) {
    let k = m.ncols();
    let m_sums = m.sum_axis(Axis(0));
    let current: &Array2<f64> = w;
    let cols = cells
        .par_iter()
        .enumerate()
        .map(|(c, cell)| {
            let mut numer = vec![0.0; k];
            for &(g, x) in cell {
                let r = x / rate(m, current, g, c);
                for (j, n) in numer.iter_mut().enumerate() {
                    *n += m[[g, j]] * r;
                }
            }
            let mut col = (0..k).map(|j| current[[j, c]] * numer[j] / (m_sums[j] + EPS)).collect::<Vec<_>>();
            let s = col.iter().sum::<f64>();
            if s > 0.0 {
                col.iter_mut().for_each(|v| *v /= s);
            } else {
                col.iter_mut().for_each(|v| *v = 1.0 / k as f64);
            }
            col
        })
        .collect::<Vec<_>>();
    for (c, col) in cols.into_iter().enumerate() {
        for (j, v) in col.into_iter().enumerate() {
            w[[j, c]] = v.max(EPS);
        }
    }
}

fn update_m(cells: &[Vec<(usize, f64)>], m: &mut Array2<f64>, w: &Array2<f64>) {
    let (genes, k) = m.dim();
    let w_sums = w.sum_axis(Axis(1));
    let mut numer = Array2::<f64>::zeros((genes, k));
    for (c, cell) in cells.iter().enumerate() {
        for &(g, x) in cell {
            let r = x / rate(m, w, g, c);
            for j in 0..k {
                numer[[g, j]] += w[[j, c]] * r;
            }
        }
    }
    for ((g, j), v) in m.indexed_iter_mut() {
        *v = (*v * numer[[g, j]] / (w_sums[j] + EPS)).max(EPS);
    }
}

/// Poisson log likelihood up to the `ln x!` constant.
fn log_likelihood(cells: &[Vec<(usize, f64)>], m: &Array2<f64>, w: &Array2<f64>) -> f64 {
    let total_rate = m.sum_axis(Axis(0)).dot(&w.sum_axis(Axis(1)));
    let observed = cells
        .iter()
        .enumerate()
        .map(|(c, cell)| cell.iter().map(|&(g, x)| x * rate(m, w, g, c).ln()).sum::<f64>())
        .sum::<f64>();
    observed - total_rate
}

/// Hard assignment of every cell: index of its largest weight, lowest index on ties.
pub fn labels_from_w(w: &Array2<f64>) -> Vec<usize> {
    w.axis_iter(Axis(1))
        .map(|col| {
            col.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
                .0
        })
        .collect()
}

/// Shannon entropy of every cell's weights.
pub fn entropy(w: &Array2<f64>) -> Vec<f64> {
    w.axis_iter(Axis(1))
        .map(|col| -col.iter().filter(|&&v| v > 0.0).map(|&v| v * v.ln()).sum::<f64>())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64Mcg;

    // 20 cells: the first 10 express genes 0-4, the rest genes 5-9
    fn two_populations() -> CountMatrix {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let mut trip = Vec::new();
        for c in 0..20 {
            for g in 0..10 {
                let high = (g < 5) == (c < 10);
                let v: f64 = if high { rng.gen_range(8..15) as f64 } else { rng.gen_range(0..2) as f64 };
                trip.push((g, c, v));
            }
        }
        CountMatrix::from_triplets(10, 20, trip).unwrap()
    }

    #[test]
    fn test_two_states() {
        let data = two_populations();
        let opts = FactorizeOptions {
            max_iters: 30,
            init: None,
        };
        let f = PoissonStateEstimator.factorize(&data, 2, Distribution::Poiss, &opts).unwrap();
        assert_eq!(f.m.dim(), (10, 2));
        assert_eq!(f.w.dim(), (2, 20));
        for col in f.w.axis_iter(Axis(1)) {
            assert_relative_eq!(col.sum(), 1.0, epsilon = 1e-6);
        }
        let labels = labels_from_w(&f.w);
        assert!(labels[..10].iter().all(|&l| l == labels[0]));
        assert!(labels[10..].iter().all(|&l| l == labels[10]));
        assert_ne!(labels[0], labels[10]);

        let ln = PoissonStateEstimator.factorize(&data, 2, Distribution::LogNorm, &opts).unwrap();
        assert_eq!(ln.w.dim(), (2, 20));
        assert!(PoissonStateEstimator.factorize(&data, 2, Distribution::NB, &opts).is_err());
        assert!(PoissonStateEstimator.factorize(&data, 0, Distribution::Poiss, &opts).is_err());
    }

    #[test]
    fn test_init_shape_checked() {
        let data = two_populations();
        let opts = FactorizeOptions {
            max_iters: 1,
            init: Some((Array2::ones((10, 3)), Array2::ones((2, 20)))),
        };
        assert!(PoissonStateEstimator.factorize(&data, 2, Distribution::Poiss, &opts).is_err());
    }

    #[test]
    fn test_labels_and_entropy() {
        let w = array![[0.5, 0.1, 1.0], [0.5, 0.9, 0.0]];
        assert_eq!(labels_from_w(&w), vec![0, 1, 0]);
        let e = entropy(&w);
        assert_relative_eq!(e[0], 2f64.ln());
        assert_relative_eq!(e[2], 0.0);
    }
}

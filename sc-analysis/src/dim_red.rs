#![allow(non_snake_case)]

//! Low-dimensional embeddings for plotting. All outputs are `dims x points`.
//!
//! MDS and PCA work on small dense matrices (clusters x clusters, clusters x clusters)
//! and use a symmetric eigendecomposition. The data-only view runs a randomized block
//! Krylov SVD over the sparse log-normalized counts.

use anyhow::{ensure, format_err, Error};
use ndarray::{s, Array1, Array2, Axis};
use ndarray_linalg::svddc::JobSvd;
use ndarray_linalg::{Eigh, SVDDCInto, QR, UPLO};
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};
use rand_pcg::Pcg64Mcg;
use sc_types::CountMatrix;

/// Below this size the block Krylov projection is no smaller than the matrix itself.
const DENSE_SVD_LIMIT: usize = 64;

/// Flip each row so its largest-magnitude entry is positive.
fn fix_signs(mut coords: Array2<f64>) -> Array2<f64> {
    for mut row in coords.rows_mut() {
        let pivot = row.iter().fold(0.0_f64, |acc, &x| if x.abs() > acc.abs() { x } else { acc });
        if pivot < 0.0 {
            row.mapv_inplace(|x| -x);
        }
    }
    coords
}

/// Top `n` eigenpairs of symmetric `A`, largest first, eigenvectors as columns.
pub fn top_eigen(A: &Array2<f64>, n: usize) -> Result<(Array1<f64>, Array2<f64>), Error> {
    let n = n.min(A.nrows());
    let (values, vectors) = A.eigh(UPLO::Lower)?;
    // eigh sorts ascending
    let order = (0..values.len()).rev().take(n).collect::<Vec<_>>();
    Ok((values.select(Axis(0), &order), vectors.select(Axis(1), &order)))
}

/// Classical MDS of the columns of `points`.
pub fn classical_mds(points: &Array2<f64>, dims: usize) -> Result<Array2<f64>, Error> {
    let n = points.ncols();
    let mut D2 = Array2::zeros((n, n));
    for a in 0..n {
        for b in (a + 1)..n {
            let d = (&points.column(a) - &points.column(b)).mapv(|x| x * x).sum();
            D2[[a, b]] = d;
            D2[[b, a]] = d;
        }
    }
    // double centering: B = -1/2 J D2 J
    let row_means = D2.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(n));
    let total = row_means.mean().unwrap_or(0.0);
    let B = Array2::from_shape_fn((n, n), |(a, b)| -0.5 * (D2[[a, b]] - row_means[a] - row_means[b] + total));

    let mut coords = Array2::zeros((dims, n));
    if n == 0 {
        return Ok(coords);
    }
    let (values, vectors) = top_eigen(&B, dims)?;
    for (i, &l) in values.iter().enumerate() {
        let scale = l.max(0.0).sqrt();
        coords.row_mut(i).assign(&(&vectors.column(i) * scale));
    }
    Ok(fix_signs(coords))
}

/// 2-D positions of the cluster means (columns of `m`).
pub fn mds_means(m: &Array2<f64>) -> Result<Array2<f64>, Error> {
    classical_mds(m, 2)
}

/// Cells placed as weight-averages of the cluster positions.
pub fn dim_red_mds(mds_means: &Array2<f64>, w: &Array2<f64>) -> Result<Array2<f64>, Error> {
    ensure!(
        mds_means.ncols() == w.nrows(),
        "{} cluster positions for {} clusters",
        mds_means.ncols(),
        w.nrows()
    );
    Ok(mds_means.dot(w))
}

/// Principal components of the columns of `x` (features x points).
pub fn pca(x: &Array2<f64>, dims: usize) -> Result<Array2<f64>, Error> {
    let n = x.ncols();
    let mut out = Array2::zeros((dims, n));
    if x.nrows() == 0 || n == 0 {
        return Ok(out);
    }
    let means = x.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(x.nrows()));
    let centered = x - &means.insert_axis(Axis(1));
    let cov = centered.dot(&centered.t()) / (n.max(2) - 1) as f64;
    let (_, vectors) = top_eigen(&cov, dims)?;
    let proj = vectors.t().dot(&centered);
    out.slice_mut(s![..proj.nrows(), ..]).assign(&proj);
    Ok(fix_signs(out))
}

type SvdResult = (Array2<f64>, Array1<f64>, Array2<f64>);

/// Rank-`k` SVD of an `m x n` operator given by its products `A * X` and `A' * X`,
/// after "Randomized Block Krylov Methods for Stronger and Faster Approximate Singular
/// Value Decomposition" (Musco & Musco, NIPS 2015). Blocks of `b` columns, `n_iter` of them.
pub fn svd_bk(
    shape: (usize, usize),
    a_dot: impl Fn(&Array2<f64>) -> Array2<f64>,
    at_dot: impl Fn(&Array2<f64>) -> Array2<f64>,
    k: usize,
    b: usize,
    n_iter: usize,
    seed: u64,
) -> Result<SvdResult, Error> {
    let (m, n) = shape;
    ensure!(m >= 2 && n >= 2, "the input matrix must be at least 2x2");
    ensure!(k <= m.min(n), "invalid rank {} for a {} x {} matrix", k, m, n);
    ensure!(n_iter > 0, "at least one Krylov block is needed");

    if m < n {
        // work on the transpose, then swap the singular vectors back
        let (U, sigma, Vt) = svd_bk((n, m), at_dot, a_dot, k, b, n_iter, seed)?;
        return Ok((Vt.reversed_axes(), sigma, U.reversed_axes()));
    }

    let b = b.max(k).min(n);
    let mut rng = Pcg64Mcg::seed_from_u64(seed);
    let unif = Uniform::new(-1.0, 1.0);

    let mut B = Array2::from_shape_simple_fn((n, b), || unif.sample(&mut rng));
    let mut K = Array2::<f64>::zeros((n, b * n_iter));
    for i in 0..n_iter {
        B = at_dot(&a_dot(&B)).qr()?.0;
        K.slice_mut(s![.., i * b..(i + 1) * b]).assign(&B);
    }
    let Q = K.qr()?.0;

    let (U, sigma, Va) = a_dot(&Q).svddc_into(JobSvd::Some)?;
    let U = U.ok_or_else(|| format_err!("svd returned no left singular vectors"))?;
    let Va = Va.ok_or_else(|| format_err!("svd returned no right singular vectors"))?;
    ensure!(sigma.len() >= k, "krylov space of rank {} is smaller than {}", sigma.len(), k);

    Ok((
        U.slice(s![.., ..k]).to_owned(),
        sigma.slice(s![..k]).to_owned(),
        Va.slice(s![..k, ..]).dot(&Q.t()),
    ))
}

/// Truncated SVD of log1p of median-normalized counts, without centering. Returns the
/// cells scaled by their singular values, `dims x cells`.
pub fn tsvd(data: &CountMatrix, dims: usize) -> Result<Array2<f64>, Error> {
    let (genes, cells) = (data.genes(), data.cells());
    let mut out = Array2::zeros((dims, cells));
    let k = dims.min(genes).min(cells);
    if k == 0 {
        return Ok(out);
    }

    let sums = data.cell_sums();
    let mut sorted = sums.clone();
    sorted.sort_by(f64::total_cmp);
    let median = sorted.get(sorted.len() / 2).copied().unwrap_or(0.0);
    let triplets = (0..cells).flat_map(|c| {
        let scale = if sums[c] > 0.0 && median > 0.0 { median / sums[c] } else { 1.0 };
        data.cell(c).into_iter().map(move |(g, v)| (g, c, (v * scale).ln_1p()))
    });
    let X = CountMatrix::from_triplets(genes, cells, triplets)?;
    let X = X.inner();

    let (sigma, Vt) = if genes.min(cells) <= DENSE_SVD_LIMIT {
        let (_, sigma, Vt) = data_dense_svd(&X.to_dense())?;
        (sigma.slice(s![..k]).to_owned(), Vt.slice(s![..k, ..]).to_owned())
    } else {
        let (_, sigma, Vt) = svd_bk(
            (genes, cells),
            |B| X * B,
            |B| &X.transpose_view() * B,
            k,
            2 * k,
            5,
            0,
        )?;
        (sigma, Vt)
    };
    let coords = &Vt * &sigma.insert_axis(Axis(1));
    out.slice_mut(s![..k, ..]).assign(&coords);
    Ok(fix_signs(out))
}

fn data_dense_svd(X: &Array2<f64>) -> Result<SvdResult, Error> {
    let (U, sigma, Vt) = X.clone().svddc_into(JobSvd::Some)?;
    let U = U.ok_or_else(|| format_err!("svd returned no left singular vectors"))?;
    let Vt = Vt.ok_or_else(|| format_err!("svd returned no right singular vectors"))?;
    Ok((U, sigma, Vt))
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_top_eigen() {
        let A = array![[4.0, 1.0, 0.0], [1.0, 3.0, 0.0], [0.0, 0.0, 1.0]];
        let (values, vectors) = top_eigen(&A, 3).unwrap();
        let l0 = (7.0 + 5f64.sqrt()) / 2.0;
        assert_relative_eq!(values[0], l0, epsilon = 1e-10);
        assert_relative_eq!(values[2], 1.0, epsilon = 1e-10);
        let v0 = vectors.column(0);
        let av = A.dot(&v0);
        for i in 0..3 {
            assert_relative_eq!(av[i], l0 * v0[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_equal_eigenvalues() {
        // a square: both top eigenvalues of the centered Gram matrix are equal
        let pts = array![[0.0, 1.0, 0.0, 1.0], [0.0, 0.0, 1.0, 1.0]];
        let coords = classical_mds(&pts, 2).unwrap();
        let dist = |a: usize, b: usize| (&coords.column(a) - &coords.column(b)).mapv(|x| x * x).sum().sqrt();
        assert_relative_eq!(dist(0, 1), 1.0, epsilon = 1e-10);
        assert_relative_eq!(dist(0, 3), 2f64.sqrt(), epsilon = 1e-10);
        assert_relative_eq!(dist(1, 2), 2f64.sqrt(), epsilon = 1e-10);
    }

    #[test]
    fn test_mds_preserves_distances() {
        // four corners of a 3 x 4 rectangle embedded in 3-D
        let pts = array![[0.0, 3.0, 0.0, 3.0], [0.0, 0.0, 4.0, 4.0], [1.0, 1.0, 1.0, 1.0]];
        let coords = classical_mds(&pts, 2).unwrap();
        let dist = |a: usize, b: usize| (&coords.column(a) - &coords.column(b)).mapv(|x| x * x).sum().sqrt();
        assert_relative_eq!(dist(0, 1), 3.0, epsilon = 1e-8);
        assert_relative_eq!(dist(0, 2), 4.0, epsilon = 1e-8);
        assert_relative_eq!(dist(0, 3), 5.0, epsilon = 1e-8);
        assert_eq!(mds_means(&pts).unwrap().dim(), (2, 4));
    }

    #[test]
    fn test_dim_red_mds() {
        let means = array![[0.0, 2.0], [0.0, 2.0]];
        let w = array![[1.0, 0.5], [0.0, 0.5]];
        assert_eq!(dim_red_mds(&means, &w).unwrap(), array![[0.0, 1.0], [0.0, 1.0]]);
        assert!(dim_red_mds(&means, &array![[1.0]]).is_err());
    }

    #[test]
    fn test_pca_and_tsvd_shapes() {
        let x = array![[1.0, 2.0, 3.0, 4.0], [2.0, 4.0, 6.0, 8.1], [0.0, 0.0, 1.0, 0.0]];
        let p = pca(&x, 2).unwrap();
        assert_eq!(p.dim(), (2, 4));
        let spread = |r: usize| p.row(r).mapv(|x| x * x).sum();
        assert!(spread(0) >= spread(1));
        assert!(spread(0) > 0.0);
        let t = tsvd(&CountMatrix::from_dense(&x), 2).unwrap();
        assert_eq!(t.dim(), (2, 4));
        assert_eq!(tsvd(&CountMatrix::from_dense(&array![[1.0, 2.0]]), 2).unwrap().dim(), (2, 2));
    }

    /// Rank-3 matrix built from outer products of smooth vectors.
    fn low_rank(m: usize, n: usize) -> Array2<f64> {
        let mut A = Array2::zeros((m, n));
        for r in 0..3 {
            let u = Array1::from_shape_fn(m, |i| ((i * (r + 1)) as f64 * 0.37).sin() + 1.5);
            let v = Array1::from_shape_fn(n, |j| ((j * (r + 2)) as f64 * 0.21).cos() + 1.5);
            let scale = 10.0 / (r + 1) as f64;
            for i in 0..m {
                for j in 0..n {
                    A[[i, j]] += scale * u[i] * v[j];
                }
            }
        }
        A
    }

    #[test]
    fn test_svd_bk_matches_dense() {
        for (m, n) in [(80, 50), (40, 90)] {
            let A = low_rank(m, n);
            let (_, exact, _) = data_dense_svd(&A).unwrap();
            let (U, sigma, Vt) = svd_bk((m, n), |B| A.dot(B), |B| A.t().dot(B), 3, 4, 3, 1).unwrap();
            assert_eq!(U.dim(), (m, 3));
            assert_eq!(Vt.dim(), (3, n));
            for i in 0..3 {
                assert_relative_eq!(sigma[i], exact[i], max_relative = 1e-8);
            }
            // the rank-3 reconstruction is exact
            let approx = U.dot(&Array2::from_diag(&sigma)).dot(&Vt);
            for (a, b) in approx.iter().zip(A.iter()) {
                assert_relative_eq!(*a, *b, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_tsvd_krylov_path() {
        // large enough to take the randomized path
        let counts = low_rank(70, 100).mapv(f64::round);
        let data = CountMatrix::from_dense(&counts);
        let t = tsvd(&data, 2).unwrap();
        assert_eq!(t.dim(), (2, 100));
        let spread = |r: usize| t.row(r).mapv(|x| x * x).sum();
        assert!(spread(0) > spread(1));
        assert!(spread(1) > 0.0);
    }
}

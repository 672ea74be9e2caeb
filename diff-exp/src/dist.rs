use std::cmp::Ordering;

/// Benjamini-Hochberg adjustment of `(index, p_value)` pairs. The result is sorted by
/// descending raw p-value and keeps the original indexes.
#[inline]
pub fn adjusted_pvalue_bh(pvalue: &[(usize, f64)]) -> Vec<(usize, f64)> {
    // sort pvalue and conserve the original indexes, NaNs to the front
    let mut arr = pvalue.to_vec();
    arr.sort_by(|&(_, a), &(_, b)| match a.partial_cmp(&b) {
        Some(o) => o.reverse(),
        None => {
            if a.is_nan() && b.is_nan() {
                Ordering::Equal
            } else if a.is_nan() {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
    });

    // compute q = np.minimum(1, np.minimum.accumulate(scale * p[descending])
    let len = arr.len() as f64;
    let mut min = f64::MAX;
    for (idx, (_, ref mut val)) in arr.iter_mut().enumerate() {
        *val *= len / (len - idx as f64);
        if *val < min {
            min = *val
        }
        *val = min.min(1.0);
    }

    arr
}

/// Adjust a slice of p-values in place.
pub fn adjust_in_place(pvalues: &mut [f64]) {
    let indexed = pvalues.iter().copied().enumerate().collect::<Vec<_>>();
    for (i, q) in adjusted_pvalue_bh(&indexed) {
        pvalues[i] = q;
    }
}

/// Empirical one-sided p-value from the number of permutations whose statistic was at
/// least as extreme as the observed one. The `+1` terms keep p-values away from zero.
#[inline]
pub fn permutation_pvalue(at_least_as_extreme: f64, n_perms: usize) -> f64 {
    (at_least_as_extreme + 1.0) / (n_perms as f64 + 1.0)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_adjusted_pvalue_bh() {
        let p = [(0, 0.01), (1, 0.04), (2, 0.03), (3, 0.2)];
        let mut q = adjusted_pvalue_bh(&p);
        q.sort_by_key(|&(i, _)| i);
        assert_relative_eq!(q[0].1, 0.04);
        assert_relative_eq!(q[1].1, 0.04 * 4.0 / 3.0);
        assert_relative_eq!(q[2].1, 0.04 * 4.0 / 3.0);
        assert_relative_eq!(q[3].1, 0.2);
    }

    #[test]
    fn test_adjust_in_place_caps_at_one() {
        let mut p = vec![0.9, 0.8, 0.95];
        adjust_in_place(&mut p);
        assert!(p.iter().all(|&q| q <= 1.0));
        assert_relative_eq!(p[2], 0.95);
    }

    #[test]
    fn test_permutation_pvalue() {
        assert_relative_eq!(permutation_pvalue(0.0, 99), 0.01);
        assert_relative_eq!(permutation_pvalue(99.0, 99), 1.0);
    }
}

//! statistics
//!
//! ## `Statistics` trait
//!
//! Summary statistics over slices of numbers, used for size factors and
//! read-count thresholds.

use num_traits::ToPrimitive;

/// Statistics Trait
///
/// It contains `sum`, `mean`, `var`, `percentile`, `median`
pub trait Statistics {
    /// Sum
    fn sum(&self) -> f64;
    /// mean stats, 0 for an empty slice
    fn mean(&self) -> f64;
    /// var stats
    fn var(&self, ddof: f64) -> f64;
    /// Percentile: the value below which `pct` percent of the values in `self` fall,
    /// with linear interpolation between ranks. 0 for an empty slice.
    fn percentile(&self, pct: f64) -> f64;
    /// medium
    fn median(&self) -> f64;
}

impl<T: ToPrimitive + Copy> Statistics for [T] {
    fn sum(&self) -> f64 {
        self.iter().filter_map(ToPrimitive::to_f64).sum()
    }

    fn mean(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.sum() / (self.len() as f64)
    }

    fn var(&self, ddof: f64) -> f64 {
        if (self.len() as f64) <= ddof {
            return 0.0;
        }
        let mean = self.mean();
        let ss = self
            .iter()
            .filter_map(ToPrimitive::to_f64)
            .map(|x| (x - mean) * (x - mean))
            .sum::<f64>();
        ss / ((self.len() as f64) - ddof)
    }

    fn percentile(&self, pct: f64) -> f64 {
        let mut sorted = self.iter().filter_map(ToPrimitive::to_f64).collect::<Vec<_>>();
        sorted.sort_by(f64::total_cmp);
        percentile_of_sorted(&sorted, pct)
    }

    fn median(&self) -> f64 {
        self.percentile(50_f64)
    }
}

// Helper function: extract a value representing the `pct` percentile of a sorted sample-set, using
// linear interpolation. If samples are not sorted, return nonsensical value.
fn percentile_of_sorted(sorted_samples: &[f64], pct: f64) -> f64 {
    match sorted_samples.len() {
        0 => return 0.0,
        1 => return sorted_samples[0],
        _ => {}
    }
    let pct = pct.clamp(0.0, 100.0);
    let length = (sorted_samples.len() - 1) as f64;
    let rank = (pct / 100.0) * length;
    let l_rank = rank.floor();
    let d = rank - l_rank;
    let n = l_rank as usize;
    if n + 1 >= sorted_samples.len() {
        return sorted_samples[n];
    }
    let lo = sorted_samples[n];
    let hi = sorted_samples[n + 1];
    lo + (hi - lo) * d
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_stats() {
        let v = vec![1, 2, 4, 3, 5, 6];
        assert_approx_eq!(v.mean(), 3.5, 1e-11);
        assert_approx_eq!(v.var(0.0), 2.9166666666666665, 1e-11);
        assert_approx_eq!(v.median(), 3.5, 1e-11);
        assert_approx_eq!(v.percentile(0.95), 1.0475, 1e-11);
        assert_approx_eq!(v.percentile(100.0), 6.0, 1e-11);

        let empty: Vec<f64> = vec![];
        assert_eq!(empty.mean(), 0.0);
        assert_eq!(empty.median(), 0.0);
        assert_eq!([7.0f64].median(), 7.0);
    }
}

//! Differential expression between groups of cells: mean-ratio statistics,
//! label-permutation p-values and Benjamini-Hochberg correction.

/// differential expression algo
#[allow(clippy::module_inception)]
pub mod diff_exp;
/// distribution extension
pub mod dist;
/// statistics extension
pub mod stat;

pub use crate::diff_exp::{
    c_score_test, one_vs_rest_test, pairwise_test, DiffExpParams, DiffExpResult, GroupSums,
    NormalizedCells, PairwiseResult, PairwiseTable, RankOrder, RankedGenes,
};

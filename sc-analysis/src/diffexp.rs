//! Differential expression over the clustering or over any discrete color track.

use crate::error::AnalysisError;
use crate::store::DiffexpMode;
use anyhow::{bail, Error};
use diff_exp::{DiffExpParams, NormalizedCells, PairwiseTable, RankOrder, RankedGenes};
use log::info;
use sc_types::LabelClass;
use serde::{Deserialize, Serialize};
use snoop::Progress;

/// Result of differential expression over a color track. Group `i` of the rankings is
/// `labels[i]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TrackDiffexp {
    #[serde(rename = "1_vs_rest")]
    OneVsRest {
        labels: Vec<String>,
        scores: RankedGenes,
        pvals: RankedGenes,
    },
    #[serde(rename = "pairwise")]
    Pairwise {
        labels: Vec<String>,
        ratios: PairwiseTable,
        pvals: PairwiseTable,
    },
}

impl TrackDiffexp {
    pub fn labels(&self) -> &[String] {
        match self {
            TrackDiffexp::OneVsRest { labels, .. } | TrackDiffexp::Pairwise { labels, .. } => labels,
        }
    }

    pub fn mode(&self) -> DiffexpMode {
        match self {
            TrackDiffexp::OneVsRest { .. } => DiffexpMode::OneVsRest,
            TrackDiffexp::Pairwise { .. } => DiffexpMode::Pairwise,
        }
    }

    /// Top `n` genes of one label in one-vs-rest mode.
    pub fn top_genes(&self, label: &str, n: usize) -> Option<&[(usize, f64)]> {
        match self {
            TrackDiffexp::OneVsRest { labels, scores, .. } => {
                let idx = labels.iter().position(|l| l == label)?;
                Some(scores.top(idx, n))
            }
            TrackDiffexp::Pairwise { .. } => None,
        }
    }
}

/// Rankings of a one-vs-rest style result: scores descending, p-values ascending.
pub fn rank(result: &diff_exp::DiffExpResult) -> (RankedGenes, RankedGenes) {
    (
        RankedGenes::from_scores(&result.scores, RankOrder::Descending),
        RankedGenes::from_scores(&result.p_values, RankOrder::Ascending),
    )
}

/// Compute differential expression between the label groups of a discrete track.
pub fn track_diffexp(
    data: &NormalizedCells,
    values: &[String],
    mode: DiffexpMode,
    params: &DiffExpParams,
    snoop: impl Progress,
) -> Result<TrackDiffexp, Error> {
    if values.len() != data.cells() {
        bail!(AnalysisError::Compute {
            stage: "diffexp".to_string(),
            message: format!("track has {} values for {} cells", values.len(), data.cells()),
        });
    }
    let classes = LabelClass::from_assignments(values);
    if classes.num_labels() < 2 {
        bail!(AnalysisError::Compute {
            stage: "diffexp".to_string(),
            message: format!("need at least two labels, found {}", classes.num_labels()),
        });
    }
    let groups = classes.group_ids(values.len());
    let n = classes.num_labels();
    info!("diffexp ({}) over {} labels", mode.as_str(), n);
    let labels = classes.labels;
    Ok(match mode {
        DiffexpMode::OneVsRest => {
            let res = diff_exp::one_vs_rest_test(data, &groups, n, params, snoop)?;
            let (scores, pvals) = rank(&res);
            TrackDiffexp::OneVsRest { labels, scores, pvals }
        }
        DiffexpMode::Pairwise => {
            let res = diff_exp::pairwise_test(data, &groups, n, params, snoop)?;
            TrackDiffexp::Pairwise {
                labels,
                ratios: PairwiseTable(res.ratios),
                pvals: PairwiseTable(res.p_values),
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;
    use sc_types::CountMatrix;
    use snoop::NoOpSnoop;

    fn data() -> NormalizedCells {
        NormalizedCells::new(&CountMatrix::from_dense(&array![
            [9.0, 8.0, 0.0, 1.0],
            [0.0, 1.0, 9.0, 8.0],
            [3.0, 3.0, 3.0, 3.0],
        ]))
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_one_vs_rest_track() {
        let params = DiffExpParams {
            n_perms: 10,
            ..Default::default()
        };
        let res = track_diffexp(&data(), &strings(&["b", "b", "a", "a"]), DiffexpMode::OneVsRest, &params, NoOpSnoop)
            .unwrap();
        assert_eq!(res.labels(), &["a", "b"]);
        assert_eq!(res.top_genes("a", 1).unwrap()[0].0, 1);
        assert_eq!(res.top_genes("b", 1).unwrap()[0].0, 0);
        assert!(res.top_genes("c", 1).is_none());

        let json = serde_json::to_string(&res).unwrap();
        assert!(json.starts_with("{\"1_vs_rest\":{\"labels\":[\"a\",\"b\"]"));
        assert_eq!(serde_json::from_str::<TrackDiffexp>(&json).unwrap(), res);
    }

    #[test]
    fn test_pairwise_track() {
        let params = DiffExpParams {
            n_perms: 5,
            ..Default::default()
        };
        let res =
            track_diffexp(&data(), &strings(&["x", "y", "z", "z"]), DiffexpMode::Pairwise, &params, NoOpSnoop).unwrap();
        assert_eq!(res.mode(), DiffexpMode::Pairwise);
        if let TrackDiffexp::Pairwise { ratios, .. } = &res {
            assert_eq!(ratios.0.dim(), (3, 3, 3));
        }
        let json = serde_json::to_string(&res).unwrap();
        assert_eq!(serde_json::from_str::<TrackDiffexp>(&json).unwrap(), res);
    }

    #[test]
    fn test_single_label_rejected() {
        let err = track_diffexp(
            &data(),
            &strings(&["a"; 4]),
            DiffexpMode::OneVsRest,
            &DiffExpParams::default(),
            NoOpSnoop,
        )
        .unwrap_err();
        assert!(matches!(crate::error::kind(&err), Some(AnalysisError::Compute { .. })));
        assert!(track_diffexp(&data(), &strings(&["a", "b"]), DiffexpMode::OneVsRest, &DiffExpParams::default(), NoOpSnoop).is_err());
    }
}

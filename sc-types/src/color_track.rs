use crate::label_class::LabelClass;
use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label given to cells that no rule of a custom selection matched
pub const UNASSIGNED_LABEL: &str = "unassigned";

/// Per-cell values of a color track
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "values", rename_all = "lowercase")]
pub enum TrackValues {
    /// one label per cell
    Discrete(Vec<String>),
    /// one number per cell
    Continuous(Vec<f64>),
}

impl TrackValues {
    /// Number of cells covered
    pub fn len(&self) -> usize {
        match self {
            TrackValues::Discrete(v) => v.len(),
            TrackValues::Continuous(v) => v.len(),
        }
    }

    /// True when no cells are covered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True for label-valued tracks
    pub fn is_discrete(&self) -> bool {
        matches!(self, TrackValues::Discrete(_))
    }

    /// Keep the entries at `cells`, in that order.
    pub fn select(&self, cells: &[usize]) -> TrackValues {
        match self {
            TrackValues::Discrete(v) => TrackValues::Discrete(cells.iter().map(|&c| v[c].clone()).collect()),
            TrackValues::Continuous(v) => TrackValues::Continuous(cells.iter().map(|&c| v[c]).collect()),
        }
    }

    /// Keep the entries whose `keep` flag is set.
    pub fn retain(&self, keep: &[bool]) -> TrackValues {
        let cells = keep
            .iter()
            .enumerate()
            .filter_map(|(i, &k)| if k { Some(i) } else { None })
            .collect::<Vec<_>>();
        self.select(&cells)
    }
}

/// Where a color track comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    /// the clustering (`cluster`)
    Builtin,
    /// uploaded from a file
    Uploaded,
    /// evaluated from a custom selection
    Custom,
}

/// A named per-cell labeling usable for coloring plots and for grouping cells in
/// differential expression.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColorTrack {
    pub name: String,
    pub source: TrackSource,
    pub values: TrackValues,
    /// fixed colors for some labels
    #[serde(default)]
    pub colors: BTreeMap<String, String>,
}

impl ColorTrack {
    pub fn new(name: impl Into<String>, source: TrackSource, values: TrackValues) -> ColorTrack {
        ColorTrack {
            name: name.into(),
            source,
            values,
            colors: BTreeMap::new(),
        }
    }

    pub fn is_discrete(&self) -> bool {
        self.values.is_discrete()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Group cells by label. Only discrete tracks can be grouped.
    pub fn label_class(&self) -> Result<LabelClass, Error> {
        match &self.values {
            TrackValues::Discrete(v) => Ok(LabelClass::from_assignments(v)),
            TrackValues::Continuous(_) => bail!("color track {} is continuous and cannot group cells", self.name),
        }
    }
}

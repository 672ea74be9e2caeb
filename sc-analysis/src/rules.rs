//! Label rule engine: custom selections built from boolean criteria over per-cell values.
//!
//! A [`CustomSelection`] is an ordered list of [`Label`]s. Each label combines its
//! criteria left to right, every criterion joined to the next by its own relation.
//! Labels are applied in order and a later label overwrites an earlier one.

use crate::error::AnalysisError;
use anyhow::{bail, Error};
use log::debug;
use sc_types::{ColorTrack, TrackSource, TrackValues, UNASSIGNED_LABEL};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "contains")]
    Contains,
}

impl FromStr for Comparison {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Ok(match s.trim() {
            "=" | "==" => Comparison::Eq,
            "!=" | "≠" => Comparison::Ne,
            "<" => Comparison::Lt,
            "<=" | "≤" => Comparison::Le,
            ">" => Comparison::Gt,
            ">=" | "≥" => Comparison::Ge,
            "contains" => Comparison::Contains,
            other => bail!(AnalysisError::InvalidCriterion {
                message: format!("unknown comparison {other:?}"),
            }),
        })
    }
}

impl Comparison {
    fn holds(&self, ord: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Comparison::Eq => ord == Equal,
            Comparison::Ne => ord != Equal,
            Comparison::Lt => ord == Less,
            Comparison::Le => ord != Greater,
            Comparison::Gt => ord == Greater,
            Comparison::Ge => ord != Less,
            Comparison::Contains => false,
        }
    }
}

/// How a criterion joins the next one
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    #[default]
    And,
    Or,
}

impl FromStr for Relation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.trim().to_ascii_lowercase().as_str() {
            "and" | "" => Ok(Relation::And),
            "or" => Ok(Relation::Or),
            other => bail!(AnalysisError::InvalidCriterion {
                message: format!("unknown relation {other:?}"),
            }),
        }
    }
}

/// Per-cell quantities derived from the data rather than from a track
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetadataField {
    ReadCounts,
    GeneCounts,
    Entropy,
}

impl MetadataField {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataField::ReadCounts => "read_counts",
            MetadataField::GeneCounts => "gene_counts",
            MetadataField::Entropy => "entropy",
        }
    }

    fn parse(s: &str) -> Option<MetadataField> {
        match s {
            "read_counts" => Some(MetadataField::ReadCounts),
            "gene_counts" => Some(MetadataField::GeneCounts),
            "entropy" => Some(MetadataField::Entropy),
            _ => None,
        }
    }
}

/// Data source of a criterion. Written as `gene:<NAME>`, `meta:<FIELD>`, or a color track name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SelectionType {
    Gene(String),
    Metadata(MetadataField),
    ColorTrack(String),
}

impl FromStr for SelectionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        if let Some(gene) = s.strip_prefix("gene:") {
            if gene.is_empty() {
                bail!(AnalysisError::UnknownSelectionType { name: s.to_string() });
            }
            return Ok(SelectionType::Gene(gene.to_string()));
        }
        if let Some(field) = s.strip_prefix("meta:") {
            return MetadataField::parse(field)
                .map(SelectionType::Metadata)
                .ok_or_else(|| AnalysisError::UnknownSelectionType { name: s.to_string() }.into());
        }
        if s.is_empty() {
            bail!(AnalysisError::UnknownSelectionType { name: s.to_string() });
        }
        Ok(SelectionType::ColorTrack(s.to_string()))
    }
}

impl TryFrom<String> for SelectionType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<SelectionType> for String {
    fn from(t: SelectionType) -> String {
        t.to_string()
    }
}

impl fmt::Display for SelectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionType::Gene(g) => write!(f, "gene:{g}"),
            SelectionType::Metadata(m) => write!(f, "meta:{}", m.as_str()),
            SelectionType::ColorTrack(t) => write!(f, "{t}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Criterion {
    pub selection_type: SelectionType,
    pub comparison: Comparison,
    pub target: String,
    /// relation to the following criterion
    #[serde(default)]
    pub relation: Relation,
}

impl Criterion {
    pub fn new(selection_type: SelectionType, comparison: Comparison, target: impl Into<String>) -> Criterion {
        Criterion {
            selection_type,
            comparison,
            target: target.into(),
            relation: Relation::And,
        }
    }

    pub fn then(mut self, relation: Relation) -> Criterion {
        self.relation = relation;
        self
    }

    /// Build from web form fields. For `selection_type == "gene"` the gene name is in
    /// `target` and the threshold in `value`.
    pub fn from_form(
        selection_type: &str,
        comparison: &str,
        target: &str,
        and_or: &str,
        value: Option<&str>,
    ) -> Result<Criterion, Error> {
        let (selection_type, target) = match selection_type {
            "gene" => {
                let Some(value) = value else {
                    bail!(AnalysisError::InvalidCriterion {
                        message: format!("gene criterion on {target:?} has no value"),
                    })
                };
                (SelectionType::Gene(target.to_string()), value.to_string())
            }
            other => match MetadataField::parse(other) {
                Some(field) => (SelectionType::Metadata(field), target.to_string()),
                None => (other.parse()?, target.to_string()),
            },
        };
        Ok(Criterion {
            selection_type,
            comparison: comparison.parse()?,
            target,
            relation: and_or.parse()?,
        })
    }

    /// Compare every cell's value against the target.
    pub fn apply(&self, values: &TrackValues) -> Result<Vec<bool>, Error> {
        match values {
            TrackValues::Continuous(v) => {
                if self.comparison == Comparison::Contains {
                    bail!(AnalysisError::InvalidCriterion {
                        message: format!("'contains' needs a discrete source, {} is numeric", self.selection_type),
                    });
                }
                let t = self.target.trim().parse::<f64>().map_err(|_| AnalysisError::InvalidCriterion {
                    message: format!("{:?} is not a number", self.target),
                })?;
                Ok(v.iter()
                    .map(|x| x.partial_cmp(&t).map_or(false, |o| self.comparison.holds(o)))
                    .collect())
            }
            TrackValues::Discrete(v) => {
                let t = self.target.as_str();
                let t_num = t.trim().parse::<f64>().ok();
                Ok(v.iter()
                    .map(|x| match self.comparison {
                        Comparison::Contains => x.contains(t),
                        Comparison::Eq => x == t,
                        Comparison::Ne => x != t,
                        cmp => {
                            let ord = match (x.trim().parse::<f64>().ok(), t_num) {
                                (Some(a), Some(b)) => a.partial_cmp(&b),
                                _ => Some(x.as_str().cmp(t)),
                            };
                            ord.map_or(false, |o| cmp.holds(o))
                        }
                    })
                    .collect())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub criteria: Vec<Criterion>,
}

impl Label {
    pub fn new(name: impl Into<String>, criteria: Vec<Criterion>) -> Label {
        Label {
            name: name.into(),
            color: None,
            criteria,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CustomSelection {
    pub name: String,
    #[serde(default)]
    pub labels: Vec<Label>,
}

impl CustomSelection {
    pub fn new(name: impl Into<String>) -> CustomSelection {
        CustomSelection {
            name: name.into(),
            labels: Vec::new(),
        }
    }

    /// Replace the criteria of `label`, appending the label if it is new.
    pub fn update_label(&mut self, label: &str, criteria: Vec<Criterion>, color: Option<String>) {
        match self.labels.iter_mut().find(|l| l.name == label) {
            Some(existing) => {
                existing.criteria = criteria;
                if color.is_some() {
                    existing.color = color;
                }
            }
            None => self.labels.push(Label {
                name: label.to_string(),
                color,
                criteria,
            }),
        }
    }

    /// Color tracks this selection reads from.
    pub fn referenced_tracks(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().flat_map(|l| &l.criteria).filter_map(|c| match &c.selection_type {
            SelectionType::ColorTrack(t) => Some(t.as_str()),
            _ => None,
        })
    }
}

/// Lookups from a selection type to per-cell values. `None` means the source does not exist.
pub trait Resolvers {
    fn gene_values(&mut self, gene: &str) -> Result<Option<Vec<f64>>, Error>;
    fn metadata_values(&mut self, field: MetadataField) -> Result<Vec<f64>, Error>;
    fn color_track_values(&mut self, name: &str) -> Result<Option<TrackValues>, Error>;
}

fn resolve(selection_type: &SelectionType, resolvers: &mut dyn Resolvers) -> Result<TrackValues, Error> {
    let values = match selection_type {
        SelectionType::Gene(g) => resolvers.gene_values(g)?.map(TrackValues::Continuous),
        SelectionType::Metadata(m) => Some(TrackValues::Continuous(resolvers.metadata_values(*m)?)),
        SelectionType::ColorTrack(t) => resolvers.color_track_values(t)?,
    };
    match values {
        Some(v) => Ok(v),
        None => bail!(AnalysisError::UnknownSelectionType {
            name: selection_type.to_string(),
        }),
    }
}

/// Per-cell result of a label's criteria. No criteria matches no cell.
pub fn evaluate(criteria: &[Criterion], cell_count: usize, resolvers: &mut dyn Resolvers) -> Result<Vec<bool>, Error> {
    let mut result: Option<Vec<bool>> = None;
    let mut relation = Relation::And;
    for criterion in criteria {
        let values = resolve(&criterion.selection_type, resolvers)?;
        if values.len() != cell_count {
            bail!(AnalysisError::Compute {
                stage: "custom selection".to_string(),
                message: format!("{} has {} values for {} cells", criterion.selection_type, values.len(), cell_count),
            });
        }
        let mask = criterion.apply(&values)?;
        result = Some(match result {
            None => mask,
            Some(acc) => acc
                .into_iter()
                .zip(mask)
                .map(|(a, b)| match relation {
                    Relation::And => a && b,
                    Relation::Or => a || b,
                })
                .collect(),
        });
        relation = criterion.relation;
    }
    Ok(result.unwrap_or_else(|| vec![false; cell_count]))
}

/// Evaluate a selection into a discrete color track.
pub fn build_selection(
    selection: &CustomSelection,
    cell_count: usize,
    resolvers: &mut dyn Resolvers,
) -> Result<ColorTrack, Error> {
    let mut assigned = vec![UNASSIGNED_LABEL.to_string(); cell_count];
    let mut colors = BTreeMap::new();
    for label in &selection.labels {
        let mask = evaluate(&label.criteria, cell_count, resolvers)?;
        let mut n = 0;
        for (cell, hit) in mask.into_iter().enumerate() {
            if hit {
                assigned[cell] = label.name.clone();
                n += 1;
            }
        }
        debug!("selection {}: label {} matched {} cells", selection.name, label.name, n);
        if let Some(color) = &label.color {
            colors.insert(label.name.clone(), color.clone());
        }
    }
    let mut track = ColorTrack::new(selection.name.clone(), TrackSource::Custom, TrackValues::Discrete(assigned));
    track.colors = colors;
    Ok(track)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    struct Fixture {
        genes: HashMap<String, Vec<f64>>,
        tracks: HashMap<String, TrackValues>,
    }

    impl Resolvers for Fixture {
        fn gene_values(&mut self, gene: &str) -> Result<Option<Vec<f64>>, Error> {
            Ok(self.genes.get(gene).cloned())
        }

        fn metadata_values(&mut self, _field: MetadataField) -> Result<Vec<f64>, Error> {
            Ok(vec![10.0, 20.0, 30.0, 40.0, 50.0])
        }

        fn color_track_values(&mut self, name: &str) -> Result<Option<TrackValues>, Error> {
            Ok(self.tracks.get(name).cloned())
        }
    }

    fn fixture() -> Fixture {
        let mut genes = HashMap::new();
        genes.insert("CD3D".to_string(), vec![0.0, 2.0, 3.0, 0.5, 5.0]);
        genes.insert("MS4A1".to_string(), vec![4.0, 0.0, 1.0, 2.0, 0.0]);
        let mut tracks = HashMap::new();
        let cluster = ["0", "2", "2", "1", "10"].iter().map(|s| s.to_string()).collect();
        tracks.insert("cluster".to_string(), TrackValues::Discrete(cluster));
        Fixture { genes, tracks }
    }

    fn gene(g: &str, cmp: Comparison, t: &str) -> Criterion {
        Criterion::new(SelectionType::Gene(g.to_string()), cmp, t)
    }

    #[test]
    fn test_single_and_or() {
        let mut f = fixture();
        let cd3d = gene("CD3D", Comparison::Gt, "1");
        let ms4a1 = gene("MS4A1", Comparison::Ge, "1");
        assert_eq!(evaluate(&[cd3d.clone()], 5, &mut f).unwrap(), vec![false, true, true, false, true]);
        assert_eq!(evaluate(&[ms4a1.clone()], 5, &mut f).unwrap(), vec![true, false, true, true, false]);
        assert_eq!(
            evaluate(&[cd3d.clone(), ms4a1.clone()], 5, &mut f).unwrap(),
            vec![false, false, true, false, false]
        );
        assert_eq!(
            evaluate(&[cd3d.then(Relation::Or), ms4a1], 5, &mut f).unwrap(),
            vec![true, true, true, true, true]
        );
        assert_eq!(evaluate(&[], 5, &mut f).unwrap(), vec![false; 5]);
    }

    #[test]
    fn test_later_label_wins() {
        let mut f = fixture();
        let mut sel = CustomSelection::new("t_cells");
        sel.update_label("A", vec![gene("CD3D", Comparison::Gt, "1")], None);
        sel.update_label(
            "B",
            vec![
                gene("CD3D", Comparison::Gt, "1"),
                Criterion::new(SelectionType::ColorTrack("cluster".into()), Comparison::Eq, "2"),
            ],
            Some("#ff0000".into()),
        );
        let track = build_selection(&sel, 5, &mut f).unwrap();
        assert_eq!(track.source, TrackSource::Custom);
        assert_eq!(
            track.values,
            TrackValues::Discrete(
                ["unassigned", "B", "B", "unassigned", "A"].iter().map(|s| s.to_string()).collect()
            )
        );
        assert_eq!(track.colors.get("B").map(String::as_str), Some("#ff0000"));
        assert_eq!(sel.referenced_tracks().collect::<Vec<_>>(), vec!["cluster"]);
    }

    #[test]
    fn test_discrete_comparisons() {
        let mut f = fixture();
        let track = |cmp, t: &str| Criterion::new(SelectionType::ColorTrack("cluster".into()), cmp, t);
        // numeric ordering when both sides parse: "10" > "2"
        assert_eq!(
            evaluate(&[track(Comparison::Gt, "1")], 5, &mut f).unwrap(),
            vec![false, true, true, false, true]
        );
        assert_eq!(
            evaluate(&[track(Comparison::Ne, "2")], 5, &mut f).unwrap(),
            vec![true, false, false, true, true]
        );
        assert_eq!(
            evaluate(&[track(Comparison::Contains, "1")], 5, &mut f).unwrap(),
            vec![false, false, false, true, true]
        );
        let meta = Criterion::new(SelectionType::Metadata(MetadataField::ReadCounts), Comparison::Le, "30");
        assert_eq!(evaluate(&[meta], 5, &mut f).unwrap(), vec![true, true, true, false, false]);
    }

    #[test]
    fn test_errors() {
        let mut f = fixture();
        let err = evaluate(&[gene("NOPE", Comparison::Gt, "1")], 5, &mut f).unwrap_err();
        assert!(matches!(crate::error::kind(&err), Some(AnalysisError::UnknownSelectionType { .. })));
        let err = evaluate(&[gene("CD3D", Comparison::Gt, "high")], 5, &mut f).unwrap_err();
        assert!(matches!(crate::error::kind(&err), Some(AnalysisError::InvalidCriterion { .. })));
        assert!(evaluate(&[gene("CD3D", Comparison::Gt, "1")], 4, &mut f).is_err());
        assert!("meta:nothing".parse::<SelectionType>().is_err());
        assert!("~".parse::<Comparison>().is_err());
    }

    #[test]
    fn test_from_form_and_json() {
        let c = Criterion::from_form("gene", ">=", "CD3D", "or", Some("2.5")).unwrap();
        assert_eq!(c.selection_type, SelectionType::Gene("CD3D".into()));
        assert_eq!(c.target, "2.5");
        assert_eq!(c.relation, Relation::Or);
        assert!(Criterion::from_form("gene", ">=", "CD3D", "and", None).is_err());
        let m = Criterion::from_form("read_counts", "<", "100", "and", None).unwrap();
        assert_eq!(m.selection_type, SelectionType::Metadata(MetadataField::ReadCounts));
        let t = Criterion::from_form("cluster", "=", "3", "", None).unwrap();
        assert_eq!(t.selection_type, SelectionType::ColorTrack("cluster".into()));

        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(
            json,
            r#"{"selection_type":"gene:CD3D","comparison":">=","target":"2.5","relation":"or"}"#
        );
        assert_eq!(serde_json::from_str::<Criterion>(&json).unwrap(), c);
        let parsed: Criterion =
            serde_json::from_str(r#"{"selection_type":"meta:entropy","comparison":"<","target":"1"}"#).unwrap();
        assert_eq!(parsed.relation, Relation::And);
    }
}

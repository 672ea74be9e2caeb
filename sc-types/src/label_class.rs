use anyhow::{format_err, Error};
use serde::{self, Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cells grouped by label: `indices[offsets[i]..offsets[i + 1]]` are the cells carrying `labels[i]`.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct LabelClass {
    pub labels: Vec<String>,
    pub offsets: Vec<i64>,
    #[serde(deserialize_with = "default_if_empty")]
    pub indices: Vec<i64>,
}

impl LabelClass {
    pub fn new(labels: Vec<String>, offsets: Vec<i64>, indices: Vec<i64>) -> Result<LabelClass, Error> {
        if labels.len() != offsets.len() {
            return Err(format_err!("Label and offsets length unequal"));
        }
        Ok(LabelClass {
            labels,
            offsets,
            indices,
        })
    }

    /// Group cells by their assigned label. Labels are ordered numerically when every label
    /// parses as an integer (so cluster "10" follows "9"), lexically otherwise.
    pub fn from_assignments(assignments: &[String]) -> LabelClass {
        let mut groups: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
        for (cell, label) in assignments.iter().enumerate() {
            groups.entry(label.as_str()).or_default().push(cell as i64);
        }
        let mut ordered = groups.into_iter().collect::<Vec<_>>();
        if ordered.iter().all(|(l, _)| l.parse::<i64>().is_ok()) {
            ordered.sort_by_key(|(l, _)| l.parse::<i64>().unwrap_or_default());
        }

        let mut labels = Vec::with_capacity(ordered.len());
        let mut offsets = Vec::with_capacity(ordered.len());
        let mut indices = Vec::with_capacity(assignments.len());
        for (label, cells) in ordered {
            labels.push(label.to_string());
            offsets.push(indices.len() as i64);
            indices.extend(cells);
        }
        LabelClass {
            labels,
            offsets,
            indices,
        }
    }

    /// Number of distinct labels
    pub fn num_labels(&self) -> usize {
        self.labels.len()
    }

    /// Get the index of a label string. Returns None if the label string is not found.
    pub fn get_label_index(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|x| x == label)
    }

    /// Returns either the set of indices pointing to the given label or None is the label doesn't exist.
    pub fn get_indices(&self, label: &str) -> Option<&[i64]> {
        self.get_label_index(label).map(|idx| self.group(idx))
    }

    fn group(&self, idx: usize) -> &[i64] {
        let offset = self.offsets[idx] as usize;
        if idx == self.offsets.len() - 1 {
            &self.indices[offset..]
        } else {
            let next_offset = self.offsets[idx + 1] as usize;
            &self.indices[offset..next_offset]
        }
    }

    /// Per-cell group index (position of the cell's label in `labels`).
    pub fn group_ids(&self, num_cells: usize) -> Vec<usize> {
        let mut ids = vec![0; num_cells];
        for idx in 0..self.labels.len() {
            for &cell in self.group(idx) {
                ids[cell as usize] = idx;
            }
        }
        ids
    }
}

pub fn default_if_empty<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::Deserialize<'de> + Default,
{
    Option::<T>::deserialize(de).map(std::option::Option::unwrap_or_default)
}

#[cfg(test)]
mod test {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(std::string::ToString::to_string).collect()
    }

    #[test]
    fn test_from_assignments() {
        let x = LabelClass::from_assignments(&strings(&["2", "10", "2", "0", "10"]));
        assert_eq!(x.labels, vec!["0", "2", "10"]);
        assert_eq!(x.offsets, vec![0, 1, 3]);
        assert_eq!(x.get_indices("2"), Some(&[0i64, 2][..]));
        assert_eq!(x.get_indices("10"), Some(&[1i64, 4][..]));
        assert_eq!(x.get_indices("7"), None);
        assert_eq!(x.group_ids(5), vec![1, 2, 1, 0, 2]);
    }

    #[test]
    fn test_lexical_order() {
        let x = LabelClass::from_assignments(&strings(&["b", "unassigned", "a", "b"]));
        assert_eq!(x.labels, vec!["a", "b", "unassigned"]);
        assert_eq!(x.num_labels(), 3);
        assert_eq!(x.group_ids(4), vec![1, 2, 0, 1]);
    }

    #[test]
    fn test_new_and_deserialize() {
        assert!(LabelClass::new(strings(&["a"]), vec![], vec![]).is_err());
        let x: LabelClass = serde_json::from_str(r#"{"labels": ["a"], "offsets": [0], "indices": null}"#).unwrap();
        assert!(x.indices.is_empty());
    }
}

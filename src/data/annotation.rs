//! Tagged per-cell/per-feature annotation columns (spec §9 redesign note:
//! "dynamic container types → tagged records").
//!
//! Grounded on the teacher's `input::meta::CellMeta` (a header list plus
//! one `Vec<String>` row per barcode) but reworked into the tagged
//! `Factor`/`Numeric` shape the spec calls for, instead of the teacher's
//! flat string table.

use std::collections::BTreeMap;

/// A single annotation column: either a categorical factor (levels plus
/// per-cell level indices) or a numeric array.
#[derive(Debug, Clone)]
pub enum Annotation {
    Factor { levels: Vec<String>, indices: Vec<Option<u32>> },
    Numeric(Vec<f32>),
}

impl Annotation {
    pub fn len(&self) -> usize {
        match self {
            Annotation::Factor { indices, .. } => indices.len(),
            Annotation::Numeric(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-index a factor/numeric column to a retained subset of rows, in
    /// the given order (used by `CellFiltering::fetch_filtered_annotations`
    /// and by subsetting).
    pub fn select(&self, keep: &[u32]) -> Annotation {
        match self {
            Annotation::Factor { levels, indices } => Annotation::Factor {
                levels: levels.clone(),
                indices: keep.iter().map(|&i| indices[i as usize]).collect(),
            },
            Annotation::Numeric(values) => {
                Annotation::Numeric(keep.iter().map(|&i| values[i as usize]).collect())
            }
        }
    }

    /// Builds a `Factor` column from raw string values in first-appearance
    /// order, treating empty strings as missing (spec §4.2 "missing values
    /// filled as null").
    pub fn factor_from_strings(values: &[String]) -> Annotation {
        let mut levels: Vec<String> = Vec::new();
        let mut level_of: BTreeMap<String, u32> = BTreeMap::new();
        let mut indices = Vec::with_capacity(values.len());
        for v in values {
            if v.is_empty() {
                indices.push(None);
                continue;
            }
            let id = *level_of.entry(v.clone()).or_insert_with(|| {
                let id = levels.len() as u32;
                levels.push(v.clone());
                id
            });
            indices.push(Some(id));
        }
        Annotation::Factor { levels, indices }
    }
}

/// Ordered mapping from field name to a typed column; all columns share a
/// length equal to the number of cells.
#[derive(Debug, Clone, Default)]
pub struct Annotations {
    order: Vec<String>,
    fields: BTreeMap<String, Annotation>,
}

impl Annotations {
    pub fn new() -> Self {
        Annotations::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, column: Annotation) {
        let name = name.into();
        if !self.fields.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.fields.insert(name, column);
    }

    pub fn get(&self, name: &str) -> Option<&Annotation> {
        self.fields.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    /// Re-index every column to the retained subset of rows, in order.
    pub fn select(&self, keep: &[u32]) -> Annotations {
        let mut out = Annotations::new();
        for name in &self.order {
            out.insert(name.clone(), self.fields[name].select(keep));
        }
        out
    }
}

/// Per-modality table of per-feature metadata (gene IDs, symbols, types),
/// grounded on the teacher's `input::features::Feature`.
#[derive(Debug, Clone)]
pub struct FeatureAnnotations {
    pub ids: Vec<String>,
    pub symbols: Vec<String>,
    pub feature_types: Vec<Option<String>>,
}

impl FeatureAnnotations {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factor_from_strings_assigns_first_appearance_levels() {
        let values = vec!["b".to_string(), "a".to_string(), "b".to_string(), "".to_string()];
        let ann = Annotation::factor_from_strings(&values);
        match ann {
            Annotation::Factor { levels, indices } => {
                assert_eq!(levels, vec!["b", "a"]);
                assert_eq!(indices, vec![Some(0), Some(1), Some(0), None]);
            }
            _ => panic!("expected factor"),
        }
    }

    #[test]
    fn select_reindexes_numeric_column() {
        let ann = Annotation::Numeric(vec![10.0, 20.0, 30.0, 40.0]);
        let sub = ann.select(&[3, 1]);
        match sub {
            Annotation::Numeric(v) => assert_eq!(v, vec![40.0, 20.0]),
            _ => panic!("expected numeric"),
        }
    }

    #[test]
    fn annotations_preserve_insertion_order() {
        let mut a = Annotations::new();
        a.insert("sample", Annotation::Numeric(vec![1.0]));
        a.insert("condition", Annotation::Numeric(vec![2.0]));
        let names: Vec<_> = a.names().collect();
        assert_eq!(names, vec!["sample", "condition"]);
    }
}

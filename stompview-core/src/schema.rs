//! Column schema.
//!
//! The identity field always comes first; every other column follows in
//! case-insensitive lexicographic order. Within one dataset generation the
//! schema only grows.

use std::cmp::Ordering;
use std::collections::HashSet;

/// Ordered set of known column names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    identity_field: String,
    columns: Vec<String>,
    known: HashSet<String>,
}

impl Schema {
    /// Creates an empty schema.
    pub fn empty(identity_field: impl Into<String>) -> Self {
        Self {
            identity_field: identity_field.into(),
            columns: Vec::new(),
            known: HashSet::new(),
        }
    }

    /// Creates a schema from a set of observed field names.
    pub fn from_names<'a>(
        identity_field: impl Into<String>,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut schema = Self::empty(identity_field);
        schema.extend(names);
        schema
    }

    /// Adds unseen names. Returns true if the column set grew.
    pub fn extend<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) -> bool {
        let mut grew = false;
        for name in names {
            if !self.known.contains(name) {
                self.known.insert(name.to_string());
                grew = true;
            }
        }
        if grew {
            self.reorder();
        }
        grew
    }

    fn reorder(&mut self) {
        let mut others: Vec<String> = self
            .known
            .iter()
            .filter(|n| **n != self.identity_field)
            .cloned()
            .collect();
        others.sort_by(|a, b| compare_case_insensitive(a, b));

        self.columns.clear();
        if self.known.contains(&self.identity_field) {
            self.columns.push(self.identity_field.clone());
        }
        self.columns.extend(others);
    }

    pub fn identity_field(&self) -> &str {
        &self.identity_field
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.known.contains(name)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Case-insensitive order; ties fall back to byte order so the result is
/// deterministic.
fn compare_case_insensitive(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

//! Records and the value abstraction the store is generic over.

use serde_json::{Map, Value};
use std::fmt;

/// A value that can be stored in a record cell.
pub trait RecordValue: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// Null values never identify a row.
    fn is_null(&self) -> bool;

    /// Canonical key used to index rows by identity.
    ///
    /// Keys must differ for values of different types (`1` and `"1"` are
    /// distinct identities).
    fn identity_key(&self) -> IdentityKey;

    /// Text shown for this value in a table cell.
    fn render(&self) -> String;
}

/// Index key derived from an identity value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl RecordValue for Value {
    fn is_null(&self) -> bool {
        Value::is_null(self)
    }

    fn identity_key(&self) -> IdentityKey {
        // Compact JSON keeps strings quoted, so types never collide.
        IdentityKey(self.to_string())
    }

    fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// An ordered mapping from field name to value.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<V> {
    fields: Vec<(String, V)>,
}

impl<V> Default for Record<V> {
    fn default() -> Self {
        Self { fields: Vec::new() }
    }
}

impl<V> Record<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: V) -> Self {
        self.insert(name, value);
        self
    }

    /// Inserts a field, replacing an existing value in place.
    pub fn insert(&mut self, name: impl Into<String>, value: V) -> Option<V> {
        let name = name.into();
        match self.fields.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.fields.push((name, value));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&V> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<V: RecordValue> Record<V> {
    /// Returns the identity value if present and non-null.
    pub fn identity(&self, field: &str) -> Option<&V> {
        self.get(field).filter(|v| !v.is_null())
    }
}

impl<V> IntoIterator for Record<V> {
    type Item = (String, V);
    type IntoIter = std::vec::IntoIter<(String, V)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl<V> FromIterator<(String, V)> for Record<V> {
    fn from_iter<I: IntoIterator<Item = (String, V)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (name, value) in iter {
            record.insert(name, value);
        }
        record
    }
}

impl From<Map<String, Value>> for Record<Value> {
    fn from(map: Map<String, Value>) -> Self {
        map.into_iter().collect()
    }
}

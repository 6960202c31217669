//! Tagged scalar values and the open metadata map carried by every chunk.
//!
//! The source-document pipeline attaches freely-shaped facts (source, title,
//! detected language, structural flags). Rather than an untyped JSON blob,
//! metadata is a `BTreeMap<String, Scalar>` so lookups stay cheap and the
//! serialized form is stable across runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Str(v)
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Num(v)
    }
}

impl From<usize> for Scalar {
    fn from(v: usize) -> Self {
        Scalar::Num(v as f64)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

/// Open metadata map attached to chunks and search results.
///
/// Ordered map so serialized metadata is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(pub BTreeMap<String, Scalar>);

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Scalar>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Scalar> {
        self.0.get(key)
    }

    /// String value for `key`, if present and a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(Scalar::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_num(&self, key: &str) -> Option<f64> {
        match self.0.get(key) {
            Some(Scalar::Num(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key) {
            Some(Scalar::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Scalar)> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<Scalar>> FromIterator<(K, V)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors() {
        let mut m = Metadata::new();
        m.set("source", "notes.md");
        m.set("chunk_index", 3usize);
        m.set("is_table", true);

        assert_eq!(m.get_str("source"), Some("notes.md"));
        assert_eq!(m.get_num("chunk_index"), Some(3.0));
        assert_eq!(m.get_bool("is_table"), Some(true));
        assert_eq!(m.get_str("missing"), None);
        // Wrong-typed access yields None rather than a panic.
        assert_eq!(m.get_num("source"), None);
    }

    #[test]
    fn serde_round_trip_is_stable() {
        let m: Metadata = [("b", Scalar::Num(1.0)), ("a", Scalar::Str("x".into()))]
            .into_iter()
            .collect();
        let json = serde_json::to_string(&m).unwrap();
        // BTreeMap ordering: keys sorted.
        assert_eq!(json, r#"{"a":"x","b":1.0}"#);
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}

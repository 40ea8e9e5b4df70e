//! Tagged property values.
//!
//! Entity properties are a dynamic bag of scalars and scalar lists. The
//! bag is split into an **external** partition (real data, visible to
//! indexing and matching) and an **internal** partition (bookkeeping such
//! as structural parent references, version tags, client identity). The
//! split is explicit; no string-prefix sniffing anywhere.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single scalar value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl Scalar {
    /// Render the scalar the way it participates in keys and tokens.
    pub fn as_text(&self) -> String {
        match self {
            Scalar::Str(s) => s.clone(),
            // Integral floats render without the trailing ".0" so numeric
            // ids compare equal to their string spellings.
            Scalar::Num(n) if n.fract() == 0.0 && n.is_finite() => {
                format!("{}", *n as i64)
            }
            Scalar::Num(n) => format!("{n}"),
            Scalar::Bool(b) => format!("{b}"),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Str(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Str(s)
    }
}

impl From<f64> for Scalar {
    fn from(n: f64) -> Self {
        Scalar::Num(n)
    }
}

impl From<i64> for Scalar {
    fn from(n: i64) -> Self {
        Scalar::Num(n as f64)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

/// A property value: one scalar or a list of scalars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Scalar(Scalar),
    List(Vec<Scalar>),
}

impl PropertyValue {
    pub fn str(s: impl Into<String>) -> Self {
        PropertyValue::Scalar(Scalar::Str(s.into()))
    }

    pub fn num(n: f64) -> Self {
        PropertyValue::Scalar(Scalar::Num(n))
    }

    pub fn list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Scalar>,
    {
        PropertyValue::List(items.into_iter().map(Into::into).collect())
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            PropertyValue::Scalar(s) => Some(s),
            PropertyValue::List(_) => None,
        }
    }

    /// Textual rendering used for bloom membership and key derivation.
    /// Lists render element-wise.
    pub fn texts(&self) -> Vec<String> {
        match self {
            PropertyValue::Scalar(s) => vec![s.as_text()],
            PropertyValue::List(items) => items.iter().map(Scalar::as_text).collect(),
        }
    }
}

impl From<Scalar> for PropertyValue {
    fn from(s: Scalar) -> Self {
        PropertyValue::Scalar(s)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Scalar(Scalar::Str(s.to_string()))
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::Scalar(Scalar::Str(s))
    }
}

impl From<&String> for PropertyValue {
    fn from(s: &String) -> Self {
        PropertyValue::Scalar(Scalar::Str(s.clone()))
    }
}

impl From<f64> for PropertyValue {
    fn from(n: f64) -> Self {
        PropertyValue::Scalar(Scalar::Num(n))
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        PropertyValue::Scalar(Scalar::Num(n as f64))
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Scalar(Scalar::Bool(b))
    }
}

impl From<Vec<Scalar>> for PropertyValue {
    fn from(items: Vec<Scalar>) -> Self {
        PropertyValue::List(items)
    }
}

/// A property bag with an explicit external/internal partition.
///
/// Iteration order is deterministic (`BTreeMap`) so key derivation and
/// index builds are reproducible across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyBag {
    /// Real data properties: indexed, matched, synced.
    pub external: BTreeMap<String, PropertyValue>,
    /// Bookkeeping properties: structural parent references, version tags,
    /// client identity. Never indexed, never matched.
    pub internal: BTreeMap<String, PropertyValue>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.external.insert(key.into(), value.into());
        self
    }

    pub fn with_internal(
        mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Self {
        self.internal.insert(key.into(), value.into());
        self
    }

    /// External lookup.
    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.external.get(key)
    }

    pub fn get_internal(&self, key: &str) -> Option<&PropertyValue> {
        self.internal.get(key)
    }

    /// Merge another bag into this one, overwriting colliding keys.
    /// Used by merge-by-key upserts.
    pub fn merge_from(&mut self, other: &PropertyBag) {
        for (k, v) in &other.external {
            self.external.insert(k.clone(), v.clone());
        }
        for (k, v) in &other.internal {
            self.internal.insert(k.clone(), v.clone());
        }
    }
}

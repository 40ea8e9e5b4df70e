//! Relations (edges) and the typed filter used to search them.

use serde::{Deserialize, Serialize};

use crate::entity::EntityKey;
use crate::value::{PropertyBag, PropertyValue};

/// A typed edge between two entities (or type placeholder nodes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub relation_type: String,
    pub source: EntityKey,
    pub target: EntityKey,
    pub properties: PropertyBag,
}

impl Relation {
    pub fn new(relation_type: impl Into<String>, source: EntityKey, target: EntityKey) -> Self {
        Self {
            relation_type: relation_type.into(),
            source,
            target,
            properties: PropertyBag::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.external.insert(key.into(), value.into());
        self
    }

    pub fn with_internal(
        mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Self {
        self.properties.internal.insert(key.into(), value.into());
        self
    }
}

/// Property-filtered relation search. All present fields must match; an
/// empty filter matches every relation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelationFilter {
    pub relation_type: Option<String>,
    pub source_type: Option<String>,
    pub target_type: Option<String>,
    /// Equality constraints on edge properties, internal partition included.
    #[serde(default)]
    pub property_equals: Vec<(String, PropertyValue)>,
    /// Exclusion constraints: a relation whose property equals one of
    /// these values does not match. An absent property passes.
    #[serde(default)]
    pub property_not_equals: Vec<(String, PropertyValue)>,
}

impl RelationFilter {
    pub fn of_type(relation_type: impl Into<String>) -> Self {
        Self {
            relation_type: Some(relation_type.into()),
            ..Default::default()
        }
    }

    pub fn between(mut self, source_type: impl Into<String>, target_type: impl Into<String>) -> Self {
        self.source_type = Some(source_type.into());
        self.target_type = Some(target_type.into());
        self
    }

    pub fn where_eq(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.property_equals.push((key.into(), value.into()));
        self
    }

    pub fn matches(&self, relation: &Relation) -> bool {
        if let Some(rt) = &self.relation_type {
            if &relation.relation_type != rt {
                return false;
            }
        }
        if let Some(st) = &self.source_type {
            if &relation.source.entity_type != st {
                return false;
            }
        }
        if let Some(tt) = &self.target_type {
            if &relation.target.entity_type != tt {
                return false;
            }
        }
        for (key, expected) in &self.property_equals {
            let found = relation
                .properties
                .get(key)
                .or_else(|| relation.properties.get_internal(key));
            if found != Some(expected) {
                return false;
            }
        }
        for (key, rejected) in &self.property_not_equals {
            let found = relation
                .properties
                .get(key)
                .or_else(|| relation.properties.get_internal(key));
            if found == Some(rejected) {
                return false;
            }
        }
        true
    }
}

//! Entities: typed records with derived primary keys.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::GraphError;
use crate::value::{PropertyBag, PropertyValue};

/// Label applied to entities that structurally belong to a parent entity.
pub const SUB_ENTITY_LABEL: &str = "sub_entity";

/// Internal property holding the parent entity type of a sub-entity.
pub const INTERNAL_PARENT_TYPE: &str = "_parent_type";
/// Internal property holding the parent entity primary key of a sub-entity.
pub const INTERNAL_PARENT_KEY: &str = "_parent_key";

/// Stable identity of an entity inside a graph store: type plus derived
/// primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub primary_key: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            primary_key: primary_key.into(),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.entity_type, self.primary_key)
    }
}

/// A loosely-typed entity.
///
/// The primary key is always derived from `primary_key_properties` — it is
/// a pure function of type + key property values and is never stored as an
/// independent source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: String,
    pub properties: PropertyBag,
    /// Ordered property names whose concatenated values form the primary key.
    pub primary_key_properties: Vec<String>,
    /// Alternate identity-key property-name sets.
    #[serde(default)]
    pub additional_key_properties: Vec<Vec<String>>,
    /// Extra type tags, e.g. [`SUB_ENTITY_LABEL`].
    #[serde(default)]
    pub additional_labels: BTreeSet<String>,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, primary_key_properties: Vec<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            properties: PropertyBag::new(),
            primary_key_properties,
            additional_key_properties: Vec::new(),
            additional_labels: BTreeSet::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.external.insert(key.into(), value.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.additional_labels.insert(label.into());
        self
    }

    /// Mark this entity as a structural sub-entity of `parent`.
    pub fn with_parent(mut self, parent: &EntityKey) -> Self {
        self.additional_labels.insert(SUB_ENTITY_LABEL.to_string());
        self.properties.internal.insert(
            INTERNAL_PARENT_TYPE.to_string(),
            PropertyValue::str(parent.entity_type.clone()),
        );
        self.properties.internal.insert(
            INTERNAL_PARENT_KEY.to_string(),
            PropertyValue::str(parent.primary_key.clone()),
        );
        self
    }

    pub fn is_sub_entity(&self) -> bool {
        self.additional_labels.contains(SUB_ENTITY_LABEL)
    }

    /// Structural parent reference, if this entity carries one.
    pub fn parent_ref(&self) -> Option<EntityKey> {
        let t = self.properties.get_internal(INTERNAL_PARENT_TYPE)?;
        let k = self.properties.get_internal(INTERNAL_PARENT_KEY)?;
        Some(EntityKey::new(
            t.as_scalar()?.as_text(),
            k.as_scalar()?.as_text(),
        ))
    }

    /// Derive the primary key from the ordered key properties.
    ///
    /// A missing key property is an immediate error: no relation can be
    /// keyed without one.
    pub fn primary_key(&self) -> Result<String, GraphError> {
        if self.primary_key_properties.is_empty() {
            return Err(GraphError::MissingKeyProperty {
                entity_type: self.entity_type.clone(),
                property: "<empty primary key set>".to_string(),
            });
        }
        let mut parts = Vec::with_capacity(self.primary_key_properties.len());
        for prop in &self.primary_key_properties {
            let value =
                self.properties
                    .get(prop)
                    .ok_or_else(|| GraphError::MissingKeyProperty {
                        entity_type: self.entity_type.clone(),
                        property: prop.clone(),
                    })?;
            parts.push(value.texts().join(","));
        }
        Ok(parts.join("+"))
    }

    pub fn key(&self) -> Result<EntityKey, GraphError> {
        Ok(EntityKey::new(self.entity_type.clone(), self.primary_key()?))
    }

    /// All identity-key property-name sets: the primary set first, then
    /// the alternates.
    pub fn identity_key_sets(&self) -> Vec<&[String]> {
        let mut sets: Vec<&[String]> = vec![&self.primary_key_properties];
        for alt in &self.additional_key_properties {
            sets.push(alt);
        }
        sets
    }
}

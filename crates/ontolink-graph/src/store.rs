//! The `GraphStore` contract consumed by the discovery pipeline.
//!
//! Two stores are driven through this trait: the **candidate graph**
//! (type placeholder nodes + candidate/evaluated relation edges) and the
//! **data graph** (real entities + materialized relation edges). Concrete
//! backends adapt their own query languages behind these typed operations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityKey};
use crate::relation::{Relation, RelationFilter};
use crate::value::PropertyValue;
use crate::Result;

/// One node in a bounded-depth neighborhood expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeighborhoodNode {
    pub key: EntityKey,
    /// Hop count from the origin (origin itself is depth 0).
    pub depth: usize,
}

/// Bulk "relate all matching pairs" request: create one `relation_type`
/// edge for every (source, target) entity pair whose property values agree
/// on every listed pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatePairsSpec {
    pub source_type: String,
    pub target_type: String,
    /// `(source_property, target_property)` equality requirements.
    pub property_pairs: Vec<(String, String)>,
    pub relation_type: String,
    /// Extra internal properties stamped on every created edge (version
    /// tag, relation id, acting client).
    pub edge_tags: Vec<(String, PropertyValue)>,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Idempotent merge-by-key upsert: an existing entity with the same
    /// key has its property bag merged, not replaced.
    async fn upsert_entity(&self, entity: Entity) -> Result<EntityKey>;

    /// Batch variant of [`GraphStore::upsert_entity`].
    async fn upsert_entities(&self, entities: Vec<Entity>) -> Result<Vec<EntityKey>>;

    async fn get_entity(&self, key: &EntityKey) -> Result<Option<Entity>>;

    /// All distinct entity types present in the store.
    async fn entity_types(&self) -> Result<Vec<String>>;

    /// Typed read-only scan escape hatch: one page of entities of a type,
    /// in stable order.
    async fn scan_entities(
        &self,
        entity_type: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Entity>>;

    /// Idempotent relation upsert, merged by (type, source, target).
    async fn upsert_relation(&self, relation: Relation) -> Result<()>;

    async fn find_relations(&self, filter: &RelationFilter) -> Result<Vec<Relation>>;

    /// Delete every relation matching the filter; returns the count.
    async fn delete_relations(&self, filter: &RelationFilter) -> Result<usize>;

    /// Delete entities matching a filter on internal properties; returns
    /// the count. Used by version cleanup.
    async fn delete_entities_where(
        &self,
        entity_type: Option<&str>,
        property_equals: &[(String, PropertyValue)],
        property_not_equals: &[(String, PropertyValue)],
    ) -> Result<usize>;

    /// Bulk-create one edge per matching entity pair; returns how many
    /// edges were created.
    async fn relate_matching_pairs(&self, spec: &RelatePairsSpec) -> Result<usize>;

    /// Bounded-depth neighborhood around an entity, following edges in
    /// both directions.
    async fn neighborhood(&self, origin: &EntityKey, max_depth: usize)
        -> Result<Vec<NeighborhoodNode>>;

    /// Shortest undirected path between two entities, as a key sequence.
    async fn shortest_path(
        &self,
        from: &EntityKey,
        to: &EntityKey,
    ) -> Result<Option<Vec<EntityKey>>>;

    async fn count_entities(&self) -> Result<usize>;

    async fn count_relations(&self) -> Result<usize>;
}

//! In-memory engines for [`GraphStore`] and [`HeuristicsKv`].
//!
//! These back the test suites and serve as the embedded default when no
//! external graph database or KV service is wired in. Entities live in a
//! concurrent map keyed by `type|primary_key`; relations live behind a
//! single lock (relation cardinality here is bounded by discovery batch
//! sizes, not by corpus size).

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::entity::{Entity, EntityKey};
use crate::error::GraphError;
use crate::kv::HeuristicsKv;
use crate::relation::{Relation, RelationFilter};
use crate::store::{GraphStore, NeighborhoodNode, RelatePairsSpec};
use crate::value::PropertyValue;
use crate::Result;

/// Embedded graph store.
#[derive(Debug, Default)]
pub struct InMemoryGraph {
    entities: DashMap<String, Entity, ahash::RandomState>,
    relations: RwLock<Vec<Relation>>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(key: &EntityKey) -> String {
        key.to_string()
    }

    fn undirected_adjacency(&self) -> HashMap<EntityKey, Vec<EntityKey>> {
        let relations = self.relations.read();
        let mut adj: HashMap<EntityKey, Vec<EntityKey>> = HashMap::new();
        for rel in relations.iter() {
            adj.entry(rel.source.clone())
                .or_default()
                .push(rel.target.clone());
            adj.entry(rel.target.clone())
                .or_default()
                .push(rel.source.clone());
        }
        adj
    }
}

#[async_trait]
impl GraphStore for InMemoryGraph {
    async fn upsert_entity(&self, entity: Entity) -> Result<EntityKey> {
        let key = entity.key()?;
        match self.entities.entry(Self::slot(&key)) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                let merged = existing.get_mut();
                merged.properties.merge_from(&entity.properties);
                for label in entity.additional_labels {
                    merged.additional_labels.insert(label);
                }
                for alt in entity.additional_key_properties {
                    if !merged.additional_key_properties.contains(&alt) {
                        merged.additional_key_properties.push(alt);
                    }
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entity);
            }
        }
        Ok(key)
    }

    async fn upsert_entities(&self, entities: Vec<Entity>) -> Result<Vec<EntityKey>> {
        let mut keys = Vec::with_capacity(entities.len());
        for entity in entities {
            keys.push(self.upsert_entity(entity).await?);
        }
        Ok(keys)
    }

    async fn get_entity(&self, key: &EntityKey) -> Result<Option<Entity>> {
        Ok(self.entities.get(&Self::slot(key)).map(|e| e.clone()))
    }

    async fn entity_types(&self) -> Result<Vec<String>> {
        let mut types: Vec<String> = self
            .entities
            .iter()
            .map(|e| e.entity_type.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        types.sort();
        Ok(types)
    }

    async fn scan_entities(
        &self,
        entity_type: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Entity>> {
        let mut page: Vec<Entity> = self
            .entities
            .iter()
            .filter(|e| e.entity_type == entity_type)
            .map(|e| e.clone())
            .collect();
        // Stable order so repeated scans page consistently.
        page.sort_by_key(|e| e.primary_key().unwrap_or_default());
        Ok(page.into_iter().skip(offset).take(limit).collect())
    }

    async fn upsert_relation(&self, relation: Relation) -> Result<()> {
        let mut relations = self.relations.write();
        if let Some(existing) = relations.iter_mut().find(|r| {
            r.relation_type == relation.relation_type
                && r.source == relation.source
                && r.target == relation.target
        }) {
            existing.properties.merge_from(&relation.properties);
        } else {
            relations.push(relation);
        }
        Ok(())
    }

    async fn find_relations(&self, filter: &RelationFilter) -> Result<Vec<Relation>> {
        let relations = self.relations.read();
        Ok(relations
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn delete_relations(&self, filter: &RelationFilter) -> Result<usize> {
        let mut relations = self.relations.write();
        let before = relations.len();
        relations.retain(|r| !filter.matches(r));
        Ok(before - relations.len())
    }

    async fn delete_entities_where(
        &self,
        entity_type: Option<&str>,
        property_equals: &[(String, PropertyValue)],
        property_not_equals: &[(String, PropertyValue)],
    ) -> Result<usize> {
        let matches = |entity: &Entity| -> bool {
            if let Some(t) = entity_type {
                if entity.entity_type != t {
                    return false;
                }
            }
            for (key, expected) in property_equals {
                let found = entity
                    .properties
                    .get(key)
                    .or_else(|| entity.properties.get_internal(key));
                if found != Some(expected) {
                    return false;
                }
            }
            for (key, rejected) in property_not_equals {
                let found = entity
                    .properties
                    .get(key)
                    .or_else(|| entity.properties.get_internal(key));
                if found == Some(rejected) {
                    return false;
                }
            }
            true
        };

        let doomed: Vec<String> = self
            .entities
            .iter()
            .filter(|e| matches(e.value()))
            .map(|e| e.key().clone())
            .collect();
        for slot in &doomed {
            self.entities.remove(slot);
        }
        Ok(doomed.len())
    }

    async fn relate_matching_pairs(&self, spec: &RelatePairsSpec) -> Result<usize> {
        // Index targets by their joined pair-property values, then walk the
        // sources once.
        let mut targets: HashMap<Vec<String>, Vec<EntityKey>> = HashMap::new();
        for entry in self.entities.iter() {
            let entity = entry.value();
            if entity.entity_type != spec.target_type {
                continue;
            }
            let mut values = Vec::with_capacity(spec.property_pairs.len());
            let mut complete = true;
            for (_, target_prop) in &spec.property_pairs {
                match entity.properties.get(target_prop) {
                    Some(v) => values.push(v.texts().join(",")),
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if complete {
                targets.entry(values).or_default().push(entity.key()?);
            }
        }

        let mut created = 0usize;
        for entry in self.entities.iter() {
            let entity = entry.value();
            if entity.entity_type != spec.source_type {
                continue;
            }
            let mut values = Vec::with_capacity(spec.property_pairs.len());
            let mut complete = true;
            for (source_prop, _) in &spec.property_pairs {
                match entity.properties.get(source_prop) {
                    Some(v) => values.push(v.texts().join(",")),
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if !complete {
                continue;
            }
            let Some(matched) = targets.get(&values) else {
                continue;
            };
            let source_key = entity.key()?;
            for target_key in matched {
                let mut relation = Relation::new(
                    spec.relation_type.clone(),
                    source_key.clone(),
                    target_key.clone(),
                );
                for (tag, value) in &spec.edge_tags {
                    relation = relation.with_internal(tag.clone(), value.clone());
                }
                self.upsert_relation(relation).await?;
                created += 1;
            }
        }
        Ok(created)
    }

    async fn neighborhood(
        &self,
        origin: &EntityKey,
        max_depth: usize,
    ) -> Result<Vec<NeighborhoodNode>> {
        let adj = self.undirected_adjacency();
        let mut seen: HashSet<EntityKey> = HashSet::from([origin.clone()]);
        let mut out = vec![NeighborhoodNode {
            key: origin.clone(),
            depth: 0,
        }];
        let mut frontier = VecDeque::from([(origin.clone(), 0usize)]);
        while let Some((node, depth)) = frontier.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for next in adj.get(&node).into_iter().flatten() {
                if seen.insert(next.clone()) {
                    out.push(NeighborhoodNode {
                        key: next.clone(),
                        depth: depth + 1,
                    });
                    frontier.push_back((next.clone(), depth + 1));
                }
            }
        }
        Ok(out)
    }

    async fn shortest_path(
        &self,
        from: &EntityKey,
        to: &EntityKey,
    ) -> Result<Option<Vec<EntityKey>>> {
        if from == to {
            return Ok(Some(vec![from.clone()]));
        }
        let adj = self.undirected_adjacency();
        let mut parent: HashMap<EntityKey, EntityKey> = HashMap::new();
        let mut frontier = VecDeque::from([from.clone()]);
        let mut seen: HashSet<EntityKey> = HashSet::from([from.clone()]);
        while let Some(node) = frontier.pop_front() {
            for next in adj.get(&node).into_iter().flatten() {
                if !seen.insert(next.clone()) {
                    continue;
                }
                parent.insert(next.clone(), node.clone());
                if next == to {
                    let mut path = vec![to.clone()];
                    let mut cursor = to.clone();
                    while let Some(prev) = parent.get(&cursor) {
                        path.push(prev.clone());
                        cursor = prev.clone();
                    }
                    path.reverse();
                    return Ok(Some(path));
                }
                frontier.push_back(next.clone());
            }
        }
        Ok(None)
    }

    async fn count_entities(&self) -> Result<usize> {
        Ok(self.entities.len())
    }

    async fn count_relations(&self) -> Result<usize> {
        Ok(self.relations.read().len())
    }
}

// ============================================================================
// In-memory KV
// ============================================================================

#[derive(Debug, Clone)]
enum KvEntry {
    Hash(BTreeMap<String, String>),
    List(Vec<String>),
    Str(String),
}

/// Embedded heuristics KV. Field increments lock only the owning shard, so
/// concurrent merges on distinct relation ids proceed independently.
#[derive(Debug, Default)]
pub struct InMemoryKv {
    entries: DashMap<String, KvEntry, ahash::RandomState>,
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HeuristicsKv for InMemoryKv {
    async fn hash_incr(&self, key: &str, field: &str, by: f64) -> Result<f64> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| KvEntry::Hash(BTreeMap::new()));
        match entry.value_mut() {
            KvEntry::Hash(hash) => {
                let current = hash
                    .get(field)
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(0.0);
                let next = current + by;
                hash.insert(field.to_string(), format_number(next));
                Ok(next)
            }
            _ => Err(GraphError::Store(format!("{key} is not a hash"))),
        }
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| KvEntry::Hash(BTreeMap::new()));
        match entry.value_mut() {
            KvEntry::Hash(hash) => {
                hash.insert(field.to_string(), value.to_string());
                Ok(())
            }
            _ => Err(GraphError::Store(format!("{key} is not a hash"))),
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, String>> {
        match self.entries.get(key).map(|e| e.clone()) {
            Some(KvEntry::Hash(hash)) => Ok(hash),
            Some(_) => Err(GraphError::Store(format!("{key} is not a hash"))),
            None => Ok(BTreeMap::new()),
        }
    }

    async fn list_push_capped(&self, key: &str, value: &str, cap: usize) -> Result<()> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| KvEntry::List(Vec::new()));
        match entry.value_mut() {
            KvEntry::List(list) => {
                list.push(value.to_string());
                if list.len() > cap {
                    let overflow = list.len() - cap;
                    list.drain(..overflow);
                }
                Ok(())
            }
            _ => Err(GraphError::Store(format!("{key} is not a list"))),
        }
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        match self.entries.get(key).map(|e| e.clone()) {
            Some(KvEntry::List(list)) => Ok(list),
            Some(_) => Err(GraphError::Store(format!("{key} is not a list"))),
            None => Ok(Vec::new()),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let doomed = self.scan_prefix(prefix).await?;
        for key in &doomed {
            self.entries.remove(key);
        }
        Ok(doomed.len())
    }

    async fn get_str(&self, key: &str) -> Result<Option<String>> {
        match self.entries.get(key).map(|e| e.clone()) {
            Some(KvEntry::Str(s)) => Ok(Some(s)),
            Some(_) => Err(GraphError::Store(format!("{key} is not a string"))),
            None => Ok(None),
        }
    }

    async fn set_str(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .insert(key.to_string(), KvEntry::Str(value.to_string()));
        Ok(())
    }

    async fn delete_key(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }
}

//! The per-cycle heuristics scan.
//!
//! `process_all_entities` drives one full pass: build the fuzzy index over
//! the whole corpus (strict barrier), pre-create type placeholder nodes in
//! the candidate graph, then stream entities in type-homogeneous batches,
//! turning bloom-confirmed property values into boosted queries, query
//! results into scored [`DeepPropertyMatch`] observations, and flushing
//! them into a [`HeuristicSink`] grouped per batch.
//!
//! Failure isolation: a failing entity skips only that entity; a failing
//! batch flush skips only that batch. Both are logged and counted, never
//! propagated.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use ontolink_graph::{derive_relation_id, Entity, GraphError, GraphStore, PropertyValue};

use crate::index::{FuzzySearchIndex, IndexBuilder, SearchHit, SearchOptions, SearchQuery};
use crate::matching::{
    enumerate_mappings, score_deep_match, value_match, MatchType, PropertyMapping,
};
use crate::tokenize::push_weighted;
use crate::DiscoveryError;

/// Reserved mapping property for the built-in structural sub-entity
/// pattern (`parent reference → parent primary key`).
pub const SUB_ENTITY_MAPPING_PROPERTY: &str = "_parent";
/// Reserved identity-key field name the sub-entity pattern maps onto.
pub const SUB_ENTITY_TARGET_FIELD: &str = "_primary_key";

/// One scored candidate observation, consumed immediately into a
/// heuristic update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeepPropertyMatch {
    pub entity_a_type: String,
    pub entity_a_key: String,
    pub search_property: String,
    pub search_value: String,
    pub entity_b_type: String,
    pub entity_b_key: String,
    pub identity_key: BTreeMap<String, PropertyValue>,
    pub matching_properties: Vec<PropertyMapping>,
    pub bm25_score: f64,
    pub deep_match_quality: f64,
    pub relation_id: String,
}

impl DeepPropertyMatch {
    /// Sorted `a_prop -> b_prop` map, as hashed into the relation id.
    pub fn property_pairs(&self) -> BTreeMap<String, String> {
        self.matching_properties
            .iter()
            .map(|m| {
                (
                    m.entity_a_property.clone(),
                    m.entity_b_idkey_property.clone(),
                )
            })
            .collect()
    }
}

/// Type/label facts observed while scanning a batch, merged into the
/// candidate graph alongside the heuristics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeMetadata {
    pub entity_type: String,
    pub labels: BTreeSet<String>,
    /// Parent types observed on sub-entities of this type.
    pub sub_entity_parent_types: BTreeSet<String>,
}

/// Where the processor flushes its output. Implemented by the candidate
/// store; kept as a seam so the scan stays testable in isolation.
#[async_trait]
pub trait HeuristicSink: Send + Sync {
    /// Idempotent merge of placeholder nodes for every known entity type,
    /// so candidate edges always have valid endpoints.
    async fn ensure_type_placeholders(
        &self,
        version: &str,
        entity_types: &[String],
    ) -> Result<(), GraphError>;

    async fn merge_type_metadata(
        &self,
        version: &str,
        metadata: &[TypeMetadata],
    ) -> Result<(), GraphError>;

    /// Additive merge of one batch of observations, grouped by relation id.
    async fn merge_heuristics(
        &self,
        version: &str,
        batch: Vec<DeepPropertyMatch>,
    ) -> Result<(), GraphError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessorState {
    Idle,
    Indexing,
    Scanning,
    Flushed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Entities per scan page and per flush batch.
    pub batch_size: usize,
    pub search: SearchOptions,
    /// Keep only the globally-maximal-quality match(es) per query.
    /// Ties use exact float equality.
    pub top_score_matches_only: bool,
    /// Cap on context tokens added to a query.
    pub context_token_cap: usize,
    pub value_boost: u32,
    pub property_boost: u32,
    pub context_boost: u32,
    /// Stand-in ranking score for structural sub-entity matches, which
    /// bypass search entirely.
    pub sub_entity_bm25: f64,
    /// Bloom capacity override; defaults to a multiple of the corpus size.
    pub expected_distinct_values: Option<usize>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            search: SearchOptions::default(),
            top_score_matches_only: true,
            context_token_cap: 8,
            value_boost: 3,
            property_boost: 2,
            context_boost: 1,
            sub_entity_bm25: 10.0,
            expected_distinct_values: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanStats {
    pub entities_scanned: usize,
    pub queries_issued: usize,
    pub bloom_skipped: usize,
    pub matches_emitted: usize,
    pub sub_entity_matches: usize,
    pub entity_failures: usize,
    pub batches_flushed: usize,
    pub batch_failures: usize,
}

/// Drives one discovery pass. Single-use: the state machine only moves
/// forward, and a second `process_all_entities` call is refused.
pub struct HeuristicsProcessor {
    data_graph: Arc<dyn GraphStore>,
    sink: Arc<dyn HeuristicSink>,
    config: DiscoveryConfig,
    state: RwLock<ProcessorState>,
}

impl HeuristicsProcessor {
    pub fn new(
        data_graph: Arc<dyn GraphStore>,
        sink: Arc<dyn HeuristicSink>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            data_graph,
            sink,
            config,
            state: RwLock::new(ProcessorState::Idle),
        }
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.read()
    }

    fn advance(&self, next: ProcessorState) {
        *self.state.write() = next;
    }

    pub async fn process_all_entities(&self, version: &str) -> Result<ScanStats, DiscoveryError> {
        {
            let mut state = self.state.write();
            if *state != ProcessorState::Idle {
                return Err(DiscoveryError::AlreadyRan);
            }
            *state = ProcessorState::Indexing;
        }

        let entity_types = self.data_graph.entity_types().await?;
        let corpus_size = self.data_graph.count_entities().await?;
        let expected_values = self
            .config
            .expected_distinct_values
            .unwrap_or_else(|| (corpus_size * 8).max(1024));

        let mut builder = IndexBuilder::new(expected_values);
        for entity_type in &entity_types {
            let mut offset = 0;
            loop {
                let page = self
                    .data_graph
                    .scan_entities(entity_type, offset, self.config.batch_size)
                    .await?;
                if page.is_empty() {
                    break;
                }
                offset += page.len();
                builder.add_batch(&page)?;
            }
        }
        let index = builder.build();
        info!(
            version,
            types = entity_types.len(),
            documents = index.document_count(),
            "fuzzy index built"
        );

        // Placeholder nodes first: relation edges must never race their
        // own endpoints into existence.
        self.sink
            .ensure_type_placeholders(version, &entity_types)
            .await?;

        self.advance(ProcessorState::Scanning);
        let mut stats = ScanStats::default();

        for entity_type in &entity_types {
            let mut offset = 0;
            loop {
                let page = self
                    .data_graph
                    .scan_entities(entity_type, offset, self.config.batch_size)
                    .await?;
                if page.is_empty() {
                    break;
                }
                offset += page.len();
                self.scan_batch(version, &page, &index, &mut stats).await;
            }
        }

        self.advance(ProcessorState::Flushed);
        // The index is read-only once built; dropping it here bounds
        // memory growth across repeated cycles.
        drop(index);
        info!(version, ?stats, "heuristics scan complete");
        Ok(stats)
    }

    async fn scan_batch(
        &self,
        version: &str,
        batch: &[Entity],
        index: &FuzzySearchIndex,
        stats: &mut ScanStats,
    ) {
        let mut matches: Vec<DeepPropertyMatch> = Vec::new();
        let mut metadata: BTreeMap<String, TypeMetadata> = BTreeMap::new();

        for entity in batch {
            stats.entities_scanned += 1;
            let meta = metadata
                .entry(entity.entity_type.clone())
                .or_insert_with(|| TypeMetadata {
                    entity_type: entity.entity_type.clone(),
                    ..Default::default()
                });
            meta.labels.extend(entity.additional_labels.iter().cloned());
            if let Some(parent) = entity.parent_ref() {
                meta.sub_entity_parent_types.insert(parent.entity_type);
            }

            match self.scan_entity(entity, index, stats) {
                Ok(mut found) => matches.append(&mut found),
                Err(error) => {
                    stats.entity_failures += 1;
                    warn!(entity_type = %entity.entity_type, %error, "entity scan failed");
                }
            }
        }

        let meta_batch: Vec<TypeMetadata> = metadata.into_values().collect();
        if let Err(error) = self.sink.merge_type_metadata(version, &meta_batch).await {
            stats.batch_failures += 1;
            warn!(version, %error, "type metadata merge failed");
        }

        if matches.is_empty() {
            return;
        }
        stats.matches_emitted += matches.len();
        match self.sink.merge_heuristics(version, matches).await {
            Ok(()) => stats.batches_flushed += 1,
            Err(error) => {
                stats.batch_failures += 1;
                warn!(version, %error, "heuristic batch merge failed; continuing");
            }
        }
    }

    fn scan_entity(
        &self,
        entity: &Entity,
        index: &FuzzySearchIndex,
        stats: &mut ScanStats,
    ) -> Result<Vec<DeepPropertyMatch>, GraphError> {
        let entity_key = entity.primary_key()?;
        let mut out = Vec::new();

        // Structural parent references bypass search: the relation is
        // known, so emit a pre-scored maximal-quality observation.
        if let Some(parent) = entity.parent_ref() {
            out.push(self.sub_entity_match(entity, &entity_key, &parent));
            stats.sub_entity_matches += 1;
        }

        let queries = self.build_queries(entity, index, stats);
        if queries.is_empty() {
            return Ok(out);
        }
        stats.queries_issued += queries.len();

        let search_queries: Vec<SearchQuery> = queries.iter().map(|q| q.query.clone()).collect();
        let result_sets = index.search_batch(&search_queries, &self.config.search);

        for (plan, hits) in queries.iter().zip(result_sets) {
            let mut query_matches =
                self.deep_property_match(entity, &entity_key, plan, &hits);
            if self.config.top_score_matches_only && !query_matches.is_empty() {
                let best = query_matches
                    .iter()
                    .map(|m| m.deep_match_quality)
                    .fold(f64::NEG_INFINITY, f64::max);
                // Ties kept on exact equality, intentionally.
                query_matches.retain(|m| m.deep_match_quality == best);
            }
            out.append(&mut query_matches);
        }
        Ok(out)
    }

    fn sub_entity_match(
        &self,
        entity: &Entity,
        entity_key: &str,
        parent: &ontolink_graph::EntityKey,
    ) -> DeepPropertyMatch {
        let mut pairs = BTreeMap::new();
        pairs.insert(
            SUB_ENTITY_MAPPING_PROPERTY.to_string(),
            SUB_ENTITY_TARGET_FIELD.to_string(),
        );
        let relation_id = derive_relation_id(&entity.entity_type, &parent.entity_type, &pairs);
        let mut identity_key = BTreeMap::new();
        identity_key.insert(
            SUB_ENTITY_TARGET_FIELD.to_string(),
            PropertyValue::str(parent.primary_key.clone()),
        );
        DeepPropertyMatch {
            entity_a_type: entity.entity_type.clone(),
            entity_a_key: entity_key.to_string(),
            search_property: SUB_ENTITY_MAPPING_PROPERTY.to_string(),
            search_value: parent.primary_key.clone(),
            entity_b_type: parent.entity_type.clone(),
            entity_b_key: parent.primary_key.clone(),
            identity_key,
            matching_properties: vec![PropertyMapping {
                entity_a_property: SUB_ENTITY_MAPPING_PROPERTY.to_string(),
                entity_b_idkey_property: SUB_ENTITY_TARGET_FIELD.to_string(),
                match_type: MatchType::Exact,
                value_match_quality: 1.0,
            }],
            bm25_score: self.config.sub_entity_bm25,
            deep_match_quality: score_deep_match(self.config.sub_entity_bm25, 1, 1.0, 1),
            relation_id,
        }
    }

    fn build_queries(
        &self,
        entity: &Entity,
        index: &FuzzySearchIndex,
        stats: &mut ScanStats,
    ) -> Vec<QueryPlan> {
        let mut plans = Vec::new();
        for (property, value) in &entity.properties.external {
            for text in value.texts() {
                if text.trim().len() < 2 {
                    continue;
                }
                if !index.passes_prefilter(&text) {
                    stats.bloom_skipped += 1;
                    continue;
                }
                let mut tokens = Vec::new();
                push_weighted(&mut tokens, &text, self.config.value_boost);
                push_weighted(&mut tokens, property, self.config.property_boost);
                self.push_context_tokens(entity, property, index, &mut tokens);
                plans.push(QueryPlan {
                    property: property.clone(),
                    value_text: text,
                    query: SearchQuery {
                        tokens,
                        exclude_type: entity.entity_type.clone(),
                    },
                });
            }
        }
        plans
    }

    /// Context tokens: sibling identity-key values when the entity has
    /// them, otherwise other bloom-confirmed property values.
    fn push_context_tokens(
        &self,
        entity: &Entity,
        property: &str,
        index: &FuzzySearchIndex,
        tokens: &mut Vec<(String, u32)>,
    ) {
        let mut budget = self.config.context_token_cap;
        let siblings: Vec<&String> = entity
            .primary_key_properties
            .iter()
            .filter(|p| p.as_str() != property)
            .collect();

        if !siblings.is_empty() {
            for sibling in siblings {
                if budget == 0 {
                    break;
                }
                if let Some(value) = entity.properties.get(sibling) {
                    for text in value.texts() {
                        if budget == 0 {
                            break;
                        }
                        push_weighted(tokens, &text, self.config.context_boost);
                        budget -= 1;
                    }
                }
            }
            return;
        }

        for (other, value) in &entity.properties.external {
            if other == property || budget == 0 {
                continue;
            }
            for text in value.texts() {
                if budget == 0 {
                    break;
                }
                if index.contains(&text) {
                    push_weighted(tokens, &text, self.config.context_boost);
                    budget -= 1;
                }
            }
        }
    }

    fn deep_property_match(
        &self,
        entity: &Entity,
        entity_key: &str,
        plan: &QueryPlan,
        hits: &[SearchHit],
    ) -> Vec<DeepPropertyMatch> {
        let search_value = PropertyValue::str(plan.value_text.clone());
        let mut out = Vec::new();

        for hit in hits {
            for identity_key in &hit.summary.identity_keys {
                // Which identity-key fields did the searched value hit?
                let trigger_fields: Vec<&String> = identity_key
                    .iter()
                    .filter(|(_, field_value)| value_match(&search_value, field_value).is_some())
                    .map(|(field, _)| field)
                    .collect();
                if trigger_fields.is_empty() {
                    continue;
                }

                let mut combos = Vec::new();
                for field in trigger_fields {
                    let flexible = BTreeSet::from([field.clone()]);
                    for combo in enumerate_mappings(
                        identity_key,
                        &entity.properties.external,
                        (&plan.property, field),
                        &flexible,
                    ) {
                        if !combos.contains(&combo) {
                            combos.push(combo);
                        }
                    }
                }
                if combos.is_empty() {
                    continue;
                }

                let mapping_count = combos.len();
                for combo in combos {
                    let pairs = combo.property_pairs();
                    let relation_id = derive_relation_id(
                        &entity.entity_type,
                        &hit.summary.entity_type,
                        &pairs,
                    );
                    let quality = score_deep_match(
                        hit.score,
                        mapping_count,
                        combo.average_quality(),
                        identity_key.len(),
                    );
                    debug!(
                        relation_id,
                        quality,
                        entity_type = %entity.entity_type,
                        matched = %hit.summary.entity_type,
                        "deep match"
                    );
                    out.push(DeepPropertyMatch {
                        entity_a_type: entity.entity_type.clone(),
                        entity_a_key: entity_key.to_string(),
                        search_property: plan.property.clone(),
                        search_value: plan.value_text.clone(),
                        entity_b_type: hit.summary.entity_type.clone(),
                        entity_b_key: hit.summary.primary_key.clone(),
                        identity_key: identity_key.clone(),
                        matching_properties: combo.to_property_mappings(),
                        bm25_score: hit.score,
                        deep_match_quality: quality,
                        relation_id,
                    });
                }
            }
        }
        out
    }
}

struct QueryPlan {
    property: String,
    value_text: String,
    query: SearchQuery,
}

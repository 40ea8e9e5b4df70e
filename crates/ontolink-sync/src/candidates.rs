//! The versioned candidate store.
//!
//! Three backing stores, all behind traits:
//!
//! - the **candidate graph** holds per-version type placeholder nodes,
//!   `is_candidate` edges (evaluations are written onto them), and
//!   type-level `sub_entity_of` edges;
//! - the **data graph** holds the real entities and the materialized
//!   relation edges created by `sync`;
//! - the **heuristics KV** holds the per-relation statistics hashes, the
//!   capped example lists, and the single current-version pointer.
//!
//! Everything written is tagged with its ontology version; `cleanup`
//! purges any version other than the current one, one category at a time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::warn;

use ontolink_discovery::{
    DeepPropertyMatch, HeuristicSink, MatchType, TypeMetadata, SUB_ENTITY_MAPPING_PROPERTY,
};
use ontolink_graph::{
    derive_relation_id, with_retry, Entity, EntityKey, GraphError, GraphStore, HeuristicsKv,
    PropertyValue, RelatePairsSpec, Relation, RelationFilter, RetryConfig,
};

/// Entity type of the placeholder nodes in the candidate graph.
pub const TYPE_NODE: &str = "EntityType";
/// Candidate edge between two type nodes; evaluations are written onto it.
pub const REL_IS_CANDIDATE: &str = "is_candidate";
/// Type-level structural edge: child type → parent type.
pub const REL_SUB_ENTITY_OF: &str = "sub_entity_of";

/// Internal tag properties stamped on everything the store writes.
pub const TAG_VERSION: &str = "_version";
pub const TAG_RELATION_ID: &str = "_relation_id";
pub const TAG_CLIENT: &str = "_client";

const KV_PREFIX: &str = "fkey";
const CURRENT_VERSION_KEY: &str = "fkey:current_version";
const EXAMPLE_CAP: usize = 10;

// ============================================================================
// Candidate view types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvaluationResult {
    Accepted,
    Rejected,
    Unsure,
}

impl EvaluationResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationResult::Accepted => "ACCEPTED",
            EvaluationResult::Rejected => "REJECTED",
            EvaluationResult::Unsure => "UNSURE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACCEPTED" => Some(EvaluationResult::Accepted),
            "REJECTED" => Some(EvaluationResult::Rejected),
            "UNSURE" => Some(EvaluationResult::Unsure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Directionality {
    AToB,
    BToA,
}

impl Directionality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Directionality::AToB => "A_TO_B",
            Directionality::BToA => "B_TO_A",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "A_TO_B" => Some(Directionality::AToB),
            "B_TO_A" => Some(Directionality::BToA),
            _ => None,
        }
    }
}

/// One accepted (or proposed) property-pair rule of an evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRule {
    pub a_property: String,
    pub b_property: String,
    pub match_type: MatchType,
}

/// The outcome of judging one candidate. Absence means "not yet judged".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FkeyEvaluation {
    pub relation_name: String,
    pub result: EvaluationResult,
    pub justification: String,
    pub thought: String,
    pub is_manual: bool,
    pub is_sub_entity_relation: bool,
    pub directionality: Directionality,
    pub property_mappings: Vec<MappingRule>,
}

/// Aggregated, versioned statistical evidence for one candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FkeyHeuristic {
    pub relation_id: String,
    pub entity_a_type: String,
    pub entity_b_type: String,
    /// `a_property -> b_idkey_property`, as hashed into the relation id.
    pub mapping: BTreeMap<String, String>,
    pub total_matches: u64,
    pub bm25_sum: f64,
    pub quality_sum: f64,
    /// Sum of per-observation average value-match quality.
    pub match_quality_sum: f64,
    /// `"a_prop->b_prop"` → per-match-type observation counts.
    pub property_match_patterns: BTreeMap<String, BTreeMap<String, u64>>,
    /// Capped ring of example `(a_key, b_key)` pairs.
    pub example_pairs: Vec<(String, String)>,
}

impl FkeyHeuristic {
    pub fn average_bm25(&self) -> f64 {
        if self.total_matches == 0 {
            0.0
        } else {
            self.bm25_sum / self.total_matches as f64
        }
    }

    pub fn average_quality(&self) -> f64 {
        if self.total_matches == 0 {
            0.0
        } else {
            self.quality_sum / self.total_matches as f64
        }
    }

    pub fn average_match_quality(&self) -> f64 {
        if self.total_matches == 0 {
            0.0
        } else {
            self.match_quality_sum / self.total_matches as f64
        }
    }

    /// True when the only observed pattern is the built-in structural
    /// parent→primary-key sub-entity pattern.
    pub fn is_pure_sub_entity(&self) -> bool {
        !self.property_match_patterns.is_empty()
            && self
                .property_match_patterns
                .keys()
                .all(|k| k.starts_with(&format!("{SUB_ENTITY_MAPPING_PROPERTY}->")))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_synced: bool,
    pub last_synced: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub edges_created: Option<u64>,
}

/// The merged per-version view: heuristic + optional evaluation + sync
/// status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationCandidate {
    pub relation_id: String,
    pub version: String,
    pub heuristic: FkeyHeuristic,
    pub evaluation: Option<FkeyEvaluation>,
    pub sync: SyncStatus,
}

/// Per-category cleanup outcome. One category failing never blocks the
/// others; failures are collected, not thrown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub candidate_relations_deleted: usize,
    pub candidate_nodes_deleted: usize,
    pub data_relations_deleted: usize,
    pub kv_keys_deleted: usize,
    pub failures: Vec<String>,
}

// ============================================================================
// Store
// ============================================================================

pub struct CandidateStore {
    candidate_graph: Arc<dyn GraphStore>,
    data_graph: Arc<dyn GraphStore>,
    kv: Arc<dyn HeuristicsKv>,
    /// Acting client identity; scopes data-graph deletes to edges this
    /// client created.
    client_id: String,
    retry: RetryConfig,
}

impl CandidateStore {
    pub fn new(
        candidate_graph: Arc<dyn GraphStore>,
        data_graph: Arc<dyn GraphStore>,
        kv: Arc<dyn HeuristicsKv>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            candidate_graph,
            data_graph,
            kv,
            client_id: client_id.into(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Pure relation identity; see [`ontolink_graph::derive_relation_id`].
    pub fn derive_relation_id(
        &self,
        entity_a_type: &str,
        entity_b_type: &str,
        mapping: &BTreeMap<String, String>,
    ) -> String {
        derive_relation_id(entity_a_type, entity_b_type, mapping)
    }

    // ------------------------------------------------------------------
    // Version pointer
    // ------------------------------------------------------------------

    pub async fn current_version(&self) -> Result<Option<String>, GraphError> {
        self.kv.get_str(CURRENT_VERSION_KEY).await
    }

    /// The cutover: flip the single current-version pointer.
    pub async fn set_current_version(&self, version: &str) -> Result<(), GraphError> {
        self.kv.set_str(CURRENT_VERSION_KEY, version).await
    }

    // ------------------------------------------------------------------
    // Candidate graph node/edge helpers
    // ------------------------------------------------------------------

    fn type_node(version: &str, entity_type: &str) -> Entity {
        Entity::new(TYPE_NODE, vec!["name".into(), "version".into()])
            .with("name", entity_type)
            .with("version", version)
    }

    fn type_key(version: &str, entity_type: &str) -> EntityKey {
        EntityKey::new(TYPE_NODE, format!("{entity_type}+{version}"))
    }

    fn heur_key(version: &str, relation_id: &str) -> String {
        format!("{KV_PREFIX}:{version}:heur:{relation_id}")
    }

    fn examples_key(version: &str, relation_id: &str) -> String {
        format!("{KV_PREFIX}:{version}:examples:{relation_id}")
    }

    fn sync_key(version: &str, relation_id: &str) -> String {
        format!("{KV_PREFIX}:{version}:sync:{relation_id}")
    }

    // ------------------------------------------------------------------
    // Heuristic reads
    // ------------------------------------------------------------------

    pub async fn list_relation_ids(&self, version: &str) -> Result<Vec<String>, GraphError> {
        let prefix = format!("{KV_PREFIX}:{version}:heur:");
        let keys = self.kv.scan_prefix(&prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    pub async fn get_heuristic(
        &self,
        version: &str,
        relation_id: &str,
    ) -> Result<Option<FkeyHeuristic>, GraphError> {
        let fields = self.kv.hash_get_all(&Self::heur_key(version, relation_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let mut heuristic = FkeyHeuristic {
            relation_id: relation_id.to_string(),
            entity_a_type: fields.get("entity_a_type").cloned().unwrap_or_default(),
            entity_b_type: fields.get("entity_b_type").cloned().unwrap_or_default(),
            mapping: fields
                .get("mapping")
                .and_then(|m| serde_json::from_str(m).ok())
                .unwrap_or_default(),
            total_matches: fields
                .get("total_matches")
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0) as u64,
            bm25_sum: fields
                .get("bm25_sum")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            quality_sum: fields
                .get("quality_sum")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            match_quality_sum: fields
                .get("match_quality_sum")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            ..Default::default()
        };
        for (field, value) in &fields {
            let Some(rest) = field.strip_prefix("pat:") else {
                continue;
            };
            let Some((pair, match_type)) = rest.rsplit_once('|') else {
                continue;
            };
            let count = value.parse::<f64>().unwrap_or(0.0) as u64;
            heuristic
                .property_match_patterns
                .entry(pair.to_string())
                .or_default()
                .insert(match_type.to_string(), count);
        }
        for entry in self
            .kv
            .list_range(&Self::examples_key(version, relation_id))
            .await?
        {
            if let Some((a, b)) = entry.split_once('\u{1f}') {
                heuristic.example_pairs.push((a.to_string(), b.to_string()));
            }
        }
        Ok(Some(heuristic))
    }

    async fn get_sync_status(
        &self,
        version: &str,
        relation_id: &str,
    ) -> Result<SyncStatus, GraphError> {
        let fields = self.kv.hash_get_all(&Self::sync_key(version, relation_id)).await?;
        Ok(SyncStatus {
            is_synced: fields.get("is_synced").map(String::as_str) == Some("true"),
            last_synced: fields
                .get("last_synced")
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            error_message: fields
                .get("error_message")
                .filter(|v| !v.is_empty())
                .cloned(),
            edges_created: fields
                .get("edges_created")
                .and_then(|v| v.parse::<f64>().ok())
                .map(|v| v as u64),
        })
    }

    async fn get_evaluation(
        &self,
        version: &str,
        relation_id: &str,
    ) -> Result<Option<FkeyEvaluation>, GraphError> {
        let edges = self
            .candidate_graph
            .find_relations(
                &RelationFilter::default()
                    .where_eq(TAG_RELATION_ID, relation_id)
                    .where_eq(TAG_VERSION, version),
            )
            .await?;
        for edge in edges {
            if let Some(evaluation) = evaluation_from_edge(&edge) {
                return Ok(Some(evaluation));
            }
        }
        Ok(None)
    }

    /// Merged candidate view for a specific version. No heuristic record
    /// means the candidate does not exist for that version.
    pub async fn get_candidate_in(
        &self,
        version: &str,
        relation_id: &str,
    ) -> Result<Option<RelationCandidate>, GraphError> {
        let Some(heuristic) = self.get_heuristic(version, relation_id).await? else {
            return Ok(None);
        };
        let evaluation = self.get_evaluation(version, relation_id).await?;
        let sync = self.get_sync_status(version, relation_id).await?;
        Ok(Some(RelationCandidate {
            relation_id: relation_id.to_string(),
            version: version.to_string(),
            heuristic,
            evaluation,
            sync,
        }))
    }

    /// Candidate view in the current version.
    pub async fn get_candidate(
        &self,
        relation_id: &str,
    ) -> Result<Option<RelationCandidate>, GraphError> {
        match self.current_version().await? {
            Some(version) => self.get_candidate_in(&version, relation_id).await,
            None => Ok(None),
        }
    }

    pub async fn get_all_candidates_in(
        &self,
        version: &str,
    ) -> Result<Vec<RelationCandidate>, GraphError> {
        let mut out = Vec::new();
        for relation_id in self.list_relation_ids(version).await? {
            if let Some(candidate) = self.get_candidate_in(version, &relation_id).await? {
                out.push(candidate);
            }
        }
        Ok(out)
    }

    pub async fn get_all_candidates(&self) -> Result<Vec<RelationCandidate>, GraphError> {
        match self.current_version().await? {
            Some(version) => self.get_all_candidates_in(&version).await,
            None => Ok(Vec::new()),
        }
    }

    // ------------------------------------------------------------------
    // Evaluation lifecycle
    // ------------------------------------------------------------------

    /// Record a judgment: any prior edge for this relation id is removed
    /// (directionality may have flipped between passes) and the new
    /// evaluation is written onto a freshly oriented edge. Sync status is
    /// untouched.
    pub async fn record_evaluation(
        &self,
        version: &str,
        relation_id: &str,
        evaluation: &FkeyEvaluation,
    ) -> Result<(), GraphError> {
        let heuristic = self
            .get_heuristic(version, relation_id)
            .await?
            .ok_or_else(|| GraphError::EntityNotFound(relation_id.to_string()))?;

        self.candidate_graph
            .delete_relations(
                &RelationFilter::default()
                    .where_eq(TAG_RELATION_ID, relation_id)
                    .where_eq(TAG_VERSION, version),
            )
            .await?;

        let a_node = Self::type_key(version, &heuristic.entity_a_type);
        let b_node = Self::type_key(version, &heuristic.entity_b_type);
        let (source, target) = match evaluation.directionality {
            Directionality::AToB => (a_node, b_node),
            Directionality::BToA => (b_node, a_node),
        };
        let mappings_json = serde_json::to_string(&evaluation.property_mappings)
            .map_err(|e| GraphError::Store(e.to_string()))?;
        let edge = Relation::new(REL_IS_CANDIDATE, source, target)
            .with("result", evaluation.result.as_str())
            .with("relation_name", evaluation.relation_name.clone())
            .with("justification", evaluation.justification.clone())
            .with("thought", evaluation.thought.clone())
            .with("is_manual", evaluation.is_manual)
            .with("is_sub_entity", evaluation.is_sub_entity_relation)
            .with("directionality", evaluation.directionality.as_str())
            .with("mappings", mappings_json)
            .with_internal(TAG_RELATION_ID, relation_id)
            .with_internal(TAG_VERSION, version);

        with_retry(&self.retry, || {
            let edge = edge.clone();
            async move { self.candidate_graph.upsert_relation(edge).await }
        })
        .await
    }

    /// Names of already-accepted relations between two types in a
    /// version, used as judgment context.
    pub async fn accepted_relation_names_between(
        &self,
        version: &str,
        entity_a_type: &str,
        entity_b_type: &str,
    ) -> Result<Vec<String>, GraphError> {
        let a_node = Self::type_key(version, entity_a_type);
        let b_node = Self::type_key(version, entity_b_type);
        let edges = self
            .candidate_graph
            .find_relations(
                &RelationFilter::of_type(REL_IS_CANDIDATE)
                    .where_eq(TAG_VERSION, version)
                    .where_eq("result", EvaluationResult::Accepted.as_str()),
            )
            .await?;
        let mut names = Vec::new();
        for edge in edges {
            let endpoints = (&edge.source, &edge.target);
            let between = endpoints == (&a_node, &b_node) || endpoints == (&b_node, &a_node);
            if !between {
                continue;
            }
            if let Some(name) = edge
                .properties
                .get("relation_name")
                .and_then(|v| v.as_scalar())
                .map(|s| s.as_text())
            {
                if !name.is_empty() && !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    /// Recursively discovered sub-entity type closure, depth-bounded.
    pub async fn sub_entity_closure(
        &self,
        version: &str,
        entity_type: &str,
        max_depth: usize,
    ) -> Result<BTreeSet<String>, GraphError> {
        let edges = self
            .candidate_graph
            .find_relations(
                &RelationFilter::of_type(REL_SUB_ENTITY_OF).where_eq(TAG_VERSION, version),
            )
            .await?;
        // child type → parent type, keyed by the parent for downward BFS.
        let mut children_of: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for edge in &edges {
            let child = edge.source.primary_key.split('+').next().unwrap_or_default();
            let parent = edge.target.primary_key.split('+').next().unwrap_or_default();
            children_of
                .entry(parent.to_string())
                .or_default()
                .insert(child.to_string());
        }

        let mut closure = BTreeSet::new();
        let mut frontier = VecDeque::from([(entity_type.to_string(), 0usize)]);
        while let Some((current, depth)) = frontier.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for child in children_of.get(&current).into_iter().flatten() {
                if closure.insert(child.clone()) {
                    frontier.push_back((child.clone(), depth + 1));
                }
            }
        }
        Ok(closure)
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    /// Materialize (or retract) one candidate in the data graph.
    ///
    /// Accepted candidates bulk-create typed edges between every entity
    /// pair satisfying the accepted mapping and directionality, tagged
    /// with the relation id and this client's identity. Anything else
    /// removes previously materialized edges. Failures are recorded as
    /// `(is_synced = false, error_message)` and never thrown, so a bulk
    /// sync continues past one bad relation.
    pub async fn sync_candidate(&self, version: &str, relation_id: &str) -> SyncStatus {
        let outcome = self.sync_candidate_inner(version, relation_id).await;
        let status = match outcome {
            Ok(edges_created) => SyncStatus {
                is_synced: true,
                last_synced: Some(Utc::now()),
                error_message: None,
                edges_created,
            },
            Err(error) => {
                warn!(relation_id, %error, "sync failed; recorded, not thrown");
                SyncStatus {
                    is_synced: false,
                    last_synced: Some(Utc::now()),
                    error_message: Some(error.to_string()),
                    edges_created: None,
                }
            }
        };
        if let Err(error) = self.write_sync_status(version, relation_id, &status).await {
            warn!(relation_id, %error, "failed to persist sync status");
        }
        status
    }

    async fn sync_candidate_inner(
        &self,
        version: &str,
        relation_id: &str,
    ) -> Result<Option<u64>, GraphError> {
        let candidate = self
            .get_candidate_in(version, relation_id)
            .await?
            .ok_or_else(|| GraphError::EntityNotFound(relation_id.to_string()))?;

        let accepted = candidate
            .evaluation
            .as_ref()
            .filter(|e| e.result == EvaluationResult::Accepted);

        let Some(evaluation) = accepted else {
            // Not accepted: retract anything this client materialized for
            // this relation id earlier.
            self.data_graph
                .delete_relations(
                    &RelationFilter::default()
                        .where_eq(TAG_RELATION_ID, relation_id)
                        .where_eq(TAG_CLIENT, self.client_id.clone()),
                )
                .await?;
            return Ok(None);
        };

        let (source_type, target_type) = match evaluation.directionality {
            Directionality::AToB => (
                candidate.heuristic.entity_a_type.clone(),
                candidate.heuristic.entity_b_type.clone(),
            ),
            Directionality::BToA => (
                candidate.heuristic.entity_b_type.clone(),
                candidate.heuristic.entity_a_type.clone(),
            ),
        };
        let property_pairs: Vec<(String, String)> = evaluation
            .property_mappings
            .iter()
            .map(|rule| match evaluation.directionality {
                Directionality::AToB => (rule.a_property.clone(), rule.b_property.clone()),
                Directionality::BToA => (rule.b_property.clone(), rule.a_property.clone()),
            })
            .collect();
        let relation_type = if evaluation.relation_name.is_empty() {
            "related_to".to_string()
        } else {
            evaluation.relation_name.clone()
        };

        // Idempotence: drop this client's previous materialization first,
        // so re-syncs after a mapping or direction change never leave
        // stale edges behind.
        self.data_graph
            .delete_relations(
                &RelationFilter::default()
                    .where_eq(TAG_RELATION_ID, relation_id)
                    .where_eq(TAG_CLIENT, self.client_id.clone()),
            )
            .await?;

        let spec = RelatePairsSpec {
            source_type,
            target_type,
            property_pairs,
            relation_type,
            edge_tags: vec![
                (TAG_RELATION_ID.into(), PropertyValue::str(relation_id)),
                (TAG_CLIENT.into(), PropertyValue::str(self.client_id.clone())),
                (TAG_VERSION.into(), PropertyValue::str(version)),
            ],
        };
        let created = with_retry(&self.retry, || {
            let spec = spec.clone();
            async move { self.data_graph.relate_matching_pairs(&spec).await }
        })
        .await?;
        Ok(Some(created as u64))
    }

    async fn write_sync_status(
        &self,
        version: &str,
        relation_id: &str,
        status: &SyncStatus,
    ) -> Result<(), GraphError> {
        let key = Self::sync_key(version, relation_id);
        self.kv
            .hash_set(&key, "is_synced", if status.is_synced { "true" } else { "false" })
            .await?;
        if let Some(ts) = status.last_synced {
            self.kv.hash_set(&key, "last_synced", &ts.to_rfc3339()).await?;
        }
        self.kv
            .hash_set(
                &key,
                "error_message",
                status.error_message.as_deref().unwrap_or(""),
            )
            .await?;
        self.kv
            .hash_set(
                &key,
                "edges_created",
                &status.edges_created.unwrap_or(0).to_string(),
            )
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    /// Purge everything tagged with a version other than
    /// `current_version`, independently per category. Nothing tagged with
    /// the current version is ever deleted.
    pub async fn cleanup(&self, current_version: &str) -> CleanupReport {
        let mut report = CleanupReport::default();
        let current = PropertyValue::str(current_version);

        let mut stale_edges = RelationFilter::default();
        stale_edges
            .property_not_equals
            .push((TAG_VERSION.into(), current.clone()));
        match self.candidate_graph.delete_relations(&stale_edges).await {
            Ok(n) => report.candidate_relations_deleted = n,
            Err(error) => report
                .failures
                .push(format!("candidate relations: {error}")),
        }

        match self
            .candidate_graph
            .delete_entities_where(
                Some(TYPE_NODE),
                &[],
                &[("version".into(), current.clone())],
            )
            .await
        {
            Ok(n) => report.candidate_nodes_deleted = n,
            Err(error) => report.failures.push(format!("candidate nodes: {error}")),
        }

        let mut stale_data = RelationFilter::default();
        stale_data
            .property_equals
            .push((TAG_CLIENT.into(), PropertyValue::str(self.client_id.clone())));
        stale_data
            .property_not_equals
            .push((TAG_VERSION.into(), current));
        match self.data_graph.delete_relations(&stale_data).await {
            Ok(n) => report.data_relations_deleted = n,
            Err(error) => report.failures.push(format!("data relations: {error}")),
        }

        match self.cleanup_kv(current_version).await {
            Ok(n) => report.kv_keys_deleted = n,
            Err(error) => report.failures.push(format!("heuristics kv: {error}")),
        }

        for failure in &report.failures {
            warn!(%failure, "cleanup category failed; others proceeded");
        }
        report
    }

    async fn cleanup_kv(&self, current_version: &str) -> Result<usize, GraphError> {
        let keys = self.kv.scan_prefix(&format!("{KV_PREFIX}:")).await?;
        let mut deleted = 0usize;
        for key in keys {
            if key == CURRENT_VERSION_KEY {
                continue;
            }
            // Layout: fkey:{version}:{kind}:{relation_id}
            let mut segments = key.splitn(3, ':');
            let _prefix = segments.next();
            let Some(version) = segments.next() else {
                continue;
            };
            if segments.next().is_none() {
                continue;
            }
            if version == current_version {
                continue;
            }
            if self.kv.delete_key(&key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

fn evaluation_from_edge(edge: &Relation) -> Option<FkeyEvaluation> {
    let text = |key: &str| -> Option<String> {
        edge.properties
            .get(key)
            .and_then(|v| v.as_scalar())
            .map(|s| s.as_text())
    };
    let flag = |key: &str| -> bool {
        matches!(
            edge.properties.get(key),
            Some(PropertyValue::Scalar(ontolink_graph::Scalar::Bool(true)))
        ) || text(key).as_deref() == Some("true")
    };
    let result = EvaluationResult::parse(&text("result")?)?;
    Some(FkeyEvaluation {
        relation_name: text("relation_name").unwrap_or_default(),
        result,
        justification: text("justification").unwrap_or_default(),
        thought: text("thought").unwrap_or_default(),
        is_manual: flag("is_manual"),
        is_sub_entity_relation: flag("is_sub_entity"),
        directionality: text("directionality")
            .and_then(|d| Directionality::parse(&d))
            .unwrap_or(Directionality::AToB),
        property_mappings: text("mappings")
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or_default(),
    })
}

// ============================================================================
// HeuristicSink: where the processor flushes
// ============================================================================

#[async_trait]
impl HeuristicSink for CandidateStore {
    async fn ensure_type_placeholders(
        &self,
        version: &str,
        entity_types: &[String],
    ) -> Result<(), GraphError> {
        for entity_type in entity_types {
            let node = Self::type_node(version, entity_type);
            with_retry(&self.retry, || {
                let node = node.clone();
                async move { self.candidate_graph.upsert_entity(node).await }
            })
            .await?;
        }
        Ok(())
    }

    async fn merge_type_metadata(
        &self,
        version: &str,
        metadata: &[TypeMetadata],
    ) -> Result<(), GraphError> {
        for meta in metadata {
            let mut node = Self::type_node(version, &meta.entity_type);
            if !meta.labels.is_empty() {
                node = node.with(
                    "labels",
                    PropertyValue::list(meta.labels.iter().map(String::as_str)),
                );
            }
            self.candidate_graph.upsert_entity(node).await?;

            for parent in &meta.sub_entity_parent_types {
                self.candidate_graph.upsert_entity(Self::type_node(version, parent)).await?;
                let edge = Relation::new(
                    REL_SUB_ENTITY_OF,
                    Self::type_key(version, &meta.entity_type),
                    Self::type_key(version, parent),
                )
                .with_internal(TAG_VERSION, version);
                self.candidate_graph.upsert_relation(edge).await?;
            }
        }
        Ok(())
    }

    /// Additive merge: grouped by relation id, then per-field atomic
    /// increments. Commutative and order-independent within a version.
    async fn merge_heuristics(
        &self,
        version: &str,
        batch: Vec<DeepPropertyMatch>,
    ) -> Result<(), GraphError> {
        let mut groups: BTreeMap<String, Vec<DeepPropertyMatch>> = BTreeMap::new();
        for observation in batch {
            groups
                .entry(observation.relation_id.clone())
                .or_default()
                .push(observation);
        }

        for (relation_id, observations) in groups {
            let first = &observations[0];

            // A minimal pre-judgment edge makes the candidate discoverable
            // before any evaluation lands. Skip once an evaluation exists:
            // the oriented edge already carries the candidate.
            if self.get_evaluation(version, &relation_id).await?.is_none() {
                let edge = Relation::new(
                    REL_IS_CANDIDATE,
                    Self::type_key(version, &first.entity_a_type),
                    Self::type_key(version, &first.entity_b_type),
                )
                .with_internal(TAG_RELATION_ID, relation_id.clone())
                .with_internal(TAG_VERSION, version);
                with_retry(&self.retry, || {
                    let edge = edge.clone();
                    async move { self.candidate_graph.upsert_relation(edge).await }
                })
                .await?;
            }

            let key = Self::heur_key(version, &relation_id);
            self.kv
                .hash_set(&key, "entity_a_type", &first.entity_a_type)
                .await?;
            self.kv
                .hash_set(&key, "entity_b_type", &first.entity_b_type)
                .await?;
            let mapping_json = serde_json::to_string(&first.property_pairs())
                .map_err(|e| GraphError::Store(e.to_string()))?;
            self.kv.hash_set(&key, "mapping", &mapping_json).await?;

            self.kv
                .hash_incr(&key, "total_matches", observations.len() as f64)
                .await?;
            let bm25: f64 = observations.iter().map(|o| o.bm25_score).sum();
            let quality: f64 = observations.iter().map(|o| o.deep_match_quality).sum();
            let match_quality: f64 = observations
                .iter()
                .map(|o| {
                    let mappings = &o.matching_properties;
                    if mappings.is_empty() {
                        0.0
                    } else {
                        mappings.iter().map(|m| m.value_match_quality).sum::<f64>()
                            / mappings.len() as f64
                    }
                })
                .sum();
            self.kv.hash_incr(&key, "bm25_sum", bm25).await?;
            self.kv.hash_incr(&key, "quality_sum", quality).await?;
            self.kv
                .hash_incr(&key, "match_quality_sum", match_quality)
                .await?;

            for observation in &observations {
                for mapping in &observation.matching_properties {
                    let field = format!(
                        "pat:{}->{}|{}",
                        mapping.entity_a_property,
                        mapping.entity_b_idkey_property,
                        mapping.match_type.as_str()
                    );
                    self.kv.hash_incr(&key, &field, 1.0).await?;
                }
                self.kv
                    .list_push_capped(
                        &Self::examples_key(version, &relation_id),
                        &format!("{}\u{1f}{}", observation.entity_a_key, observation.entity_b_key),
                        EXAMPLE_CAP,
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

//! The discovery orchestrator: one `run_cycle()` end to end.
//!
//! ```text
//! mint version ─► scan (heuristics) ─► plan judgment ─► judge (workers)
//!                                                            │
//!      cleanup ◄─ resync (best effort) ◄─ CUTOVER (pointer flip)
//! ```
//!
//! The previous version stays current and externally visible until the
//! pointer flip; everything before that is invisible staging. The state
//! machine (`Idle | Discovering | Judging`) rejects re-entrant cycles with
//! a typed error instead of queueing or silently skipping.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use ontolink_discovery::{
    DiscoveryConfig, HeuristicSink, HeuristicsProcessor, MatchType, ScanStats,
};
use ontolink_graph::{EntityKey, GraphError, GraphStore, PropertyValue};

use crate::candidates::{
    CandidateStore, CleanupReport, Directionality, EvaluationResult, FkeyEvaluation, MappingRule,
    RelationCandidate,
};
use crate::evaluator::{
    sub_entity_relation_name, CandidateBrief, CandidateGroup, Evaluator, ExamplePair,
    JudgmentContext,
};
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestratorState {
    Idle,
    Discovering,
    Judging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgmentConfig {
    /// Worker pool size; effective pool is `min(this, group count)`.
    pub worker_concurrency: usize,
    /// Re-judge when `total_matches` changed by more than this ratio
    /// versus the prior version.
    pub rejudge_match_ratio: f64,
    /// Re-judge when either quality average moved by at least this much.
    pub quality_delta: f64,
    /// Below this evidence depth, candidates are auto-`Unsure`.
    pub min_evidence_matches: u64,
    /// Example pairs per candidate in judgment context.
    pub max_example_pairs: usize,
    /// Depth bound for the sub-entity type closure in judgment context.
    pub sub_entity_closure_depth: usize,
}

impl Default for JudgmentConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            rejudge_match_ratio: 0.5,
            quality_delta: 0.1,
            min_evidence_matches: 3,
            max_example_pairs: 3,
            sub_entity_closure_depth: 3,
        }
    }
}

// ============================================================================
// Events and reports
// ============================================================================

/// Events emitted at cycle phase boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DiscoveryEvent {
    CycleStarted {
        version: String,
        prior_version: Option<String>,
    },
    ScanCompleted {
        version: String,
        stats: ScanStats,
    },
    GroupsPlanned {
        version: String,
        stats: PlanStats,
    },
    JudgmentCompleted {
        version: String,
        stats: JudgmentStats,
    },
    CutOver {
        version: String,
    },
    SyncCompleted {
        version: String,
        stats: SyncPassStats,
    },
    CleanupCompleted {
        version: String,
        report: CleanupReport,
    },
}

pub type DiscoveryEventHandler = Box<dyn Fn(DiscoveryEvent) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanStats {
    pub groups: usize,
    pub judged_candidates: usize,
    pub auto_accepted: usize,
    pub auto_unsure: usize,
    pub copied_forward: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgmentStats {
    pub groups_judged: usize,
    pub groups_failed: usize,
    pub evaluations_recorded: usize,
    pub worker_failures: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPassStats {
    pub synced: usize,
    pub failed: usize,
    pub edges_created: u64,
}

/// Everything one cycle did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub version: String,
    pub prior_version: Option<String>,
    pub scan: ScanStats,
    pub plan: PlanStats,
    pub judgment: JudgmentStats,
    pub sync: SyncPassStats,
    pub cleanup: CleanupReport,
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct DiscoveryOrchestrator {
    store: Arc<CandidateStore>,
    data_graph: Arc<dyn GraphStore>,
    evaluator: Arc<dyn Evaluator>,
    discovery_config: DiscoveryConfig,
    judgment_config: JudgmentConfig,
    state: Mutex<OrchestratorState>,
    handlers: RwLock<Vec<DiscoveryEventHandler>>,
}

impl DiscoveryOrchestrator {
    pub fn new(
        store: Arc<CandidateStore>,
        data_graph: Arc<dyn GraphStore>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self {
        Self {
            store,
            data_graph,
            evaluator,
            discovery_config: DiscoveryConfig::default(),
            judgment_config: JudgmentConfig::default(),
            state: Mutex::new(OrchestratorState::Idle),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn with_discovery_config(mut self, config: DiscoveryConfig) -> Self {
        self.discovery_config = config;
        self
    }

    pub fn with_judgment_config(mut self, config: JudgmentConfig) -> Self {
        self.judgment_config = config;
        self
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.lock()
    }

    pub fn on_event(&self, handler: DiscoveryEventHandler) {
        self.handlers.write().push(handler);
    }

    fn emit(&self, event: DiscoveryEvent) {
        for handler in self.handlers.read().iter() {
            handler(event.clone());
        }
    }

    /// Read-only inspection, always against the current version.
    pub async fn get_candidate(
        &self,
        relation_id: &str,
    ) -> Result<Option<RelationCandidate>, GraphError> {
        self.store.get_candidate(relation_id).await
    }

    pub async fn get_all_candidates(&self) -> Result<Vec<RelationCandidate>, GraphError> {
        self.store.get_all_candidates().await
    }

    pub async fn sub_entity_closure(
        &self,
        entity_type: &str,
    ) -> Result<BTreeSet<String>, GraphError> {
        match self.store.current_version().await? {
            Some(version) => {
                self.store
                    .sub_entity_closure(
                        &version,
                        entity_type,
                        self.judgment_config.sub_entity_closure_depth,
                    )
                    .await
            }
            None => Ok(BTreeSet::new()),
        }
    }

    /// Run one full discovery cycle. Re-entrant calls are rejected with
    /// [`SyncError::AlreadyRunning`], never queued.
    pub async fn run_cycle(&self) -> Result<CycleReport, SyncError> {
        {
            let mut state = self.state.lock();
            if *state != OrchestratorState::Idle {
                return Err(SyncError::AlreadyRunning { phase: *state });
            }
            *state = OrchestratorState::Discovering;
        }
        let result = self.run_cycle_inner().await;
        *self.state.lock() = OrchestratorState::Idle;
        result
    }

    async fn run_cycle_inner(&self) -> Result<CycleReport, SyncError> {
        let version = Uuid::new_v4().to_string();
        let prior_version = self.store.current_version().await?;
        info!(%version, ?prior_version, "discovery cycle started");
        self.emit(DiscoveryEvent::CycleStarted {
            version: version.clone(),
            prior_version: prior_version.clone(),
        });

        // Phase 1: heuristics scan into the new (staged) version. The
        // prior version stays current and externally visible throughout.
        let sink: Arc<dyn HeuristicSink> = self.store.clone();
        let processor = HeuristicsProcessor::new(
            self.data_graph.clone(),
            sink,
            self.discovery_config.clone(),
        );
        let scan = processor.process_all_entities(&version).await?;
        self.emit(DiscoveryEvent::ScanCompleted {
            version: version.clone(),
            stats: scan.clone(),
        });

        // Phase 2: plan judgment.
        let (plan, groups) = self.plan_judgment(&version, prior_version.as_deref()).await?;
        self.emit(DiscoveryEvent::GroupsPlanned {
            version: version.clone(),
            stats: plan.clone(),
        });

        // Phase 3: judge.
        let judgment = if groups.is_empty() {
            JudgmentStats::default()
        } else {
            *self.state.lock() = OrchestratorState::Judging;
            self.judge_groups(&version, groups).await
        };
        self.emit(DiscoveryEvent::JudgmentCompleted {
            version: version.clone(),
            stats: judgment.clone(),
        });

        // Phase 4: cutover — the sole externally visible switch.
        self.store.set_current_version(&version).await?;
        info!(%version, "cut over to new ontology version");
        self.emit(DiscoveryEvent::CutOver {
            version: version.clone(),
        });

        // Phase 5: best-effort resync (idempotent safety net), then purge
        // the stale version(s).
        let mut sync = SyncPassStats::default();
        for relation_id in self.store.list_relation_ids(&version).await? {
            let status = self.store.sync_candidate(&version, &relation_id).await;
            if status.is_synced {
                sync.synced += 1;
                sync.edges_created += status.edges_created.unwrap_or(0);
            } else {
                sync.failed += 1;
            }
        }
        self.emit(DiscoveryEvent::SyncCompleted {
            version: version.clone(),
            stats: sync.clone(),
        });

        let cleanup = self.store.cleanup(&version).await;
        self.emit(DiscoveryEvent::CleanupCompleted {
            version: version.clone(),
            report: cleanup.clone(),
        });

        Ok(CycleReport {
            version,
            prior_version,
            scan,
            plan,
            judgment,
            sync,
            cleanup,
        })
    }

    /// Decide, per candidate: auto-accept (pure sub-entity pattern),
    /// auto-unsure (insufficient evidence), copy forward (unchanged vs the
    /// prior version), or queue for judgment grouped by type pair.
    async fn plan_judgment(
        &self,
        version: &str,
        prior_version: Option<&str>,
    ) -> Result<(PlanStats, BTreeMap<(String, String), Vec<CandidateBrief>>), SyncError> {
        let candidates = self.store.get_all_candidates_in(version).await?;
        let mut plan = PlanStats::default();
        let mut groups: BTreeMap<(String, String), Vec<CandidateBrief>> = BTreeMap::new();

        for candidate in &candidates {
            let heuristic = &candidate.heuristic;

            if heuristic.is_pure_sub_entity() {
                let evaluation = FkeyEvaluation {
                    relation_name: sub_entity_relation_name(
                        &heuristic.entity_a_type,
                        &heuristic.entity_b_type,
                    ),
                    result: EvaluationResult::Accepted,
                    justification: "structural parent reference".to_string(),
                    thought: String::new(),
                    is_manual: false,
                    is_sub_entity_relation: true,
                    directionality: Directionality::AToB,
                    property_mappings: mapping_rules(heuristic),
                };
                self.record_planned(version, &heuristic.relation_id, &evaluation)
                    .await;
                plan.auto_accepted += 1;
                continue;
            }

            if heuristic.total_matches < self.judgment_config.min_evidence_matches {
                let evaluation = FkeyEvaluation {
                    relation_name: String::new(),
                    result: EvaluationResult::Unsure,
                    justification: format!(
                        "only {} observations, below the evidence threshold",
                        heuristic.total_matches
                    ),
                    thought: String::new(),
                    is_manual: false,
                    is_sub_entity_relation: false,
                    directionality: Directionality::AToB,
                    property_mappings: mapping_rules(heuristic),
                };
                self.record_planned(version, &heuristic.relation_id, &evaluation)
                    .await;
                plan.auto_unsure += 1;
                continue;
            }

            let prior = match prior_version {
                Some(p) => self.store.get_candidate_in(p, &heuristic.relation_id).await?,
                None => None,
            };
            if let Some(prior) = &prior {
                if let Some(prior_eval) = &prior.evaluation {
                    if !self.needs_rejudgment(heuristic, &prior.heuristic) {
                        self.record_planned(version, &heuristic.relation_id, prior_eval)
                            .await;
                        plan.copied_forward += 1;
                        continue;
                    }
                }
            }

            groups
                .entry((
                    heuristic.entity_a_type.clone(),
                    heuristic.entity_b_type.clone(),
                ))
                .or_default()
                .push(CandidateBrief::from_heuristic(heuristic));
            plan.judged_candidates += 1;
        }

        plan.groups = groups.len();
        Ok((plan, groups))
    }

    fn needs_rejudgment(
        &self,
        current: &crate::candidates::FkeyHeuristic,
        prior: &crate::candidates::FkeyHeuristic,
    ) -> bool {
        let ratio = if prior.total_matches == 0 {
            f64::INFINITY
        } else {
            (current.total_matches as f64 - prior.total_matches as f64).abs()
                / prior.total_matches as f64
        };
        if ratio > self.judgment_config.rejudge_match_ratio {
            return true;
        }
        let delta = self.judgment_config.quality_delta;
        (current.average_quality() - prior.average_quality()).abs() >= delta
            || (current.average_match_quality() - prior.average_match_quality()).abs() >= delta
    }

    async fn record_planned(&self, version: &str, relation_id: &str, evaluation: &FkeyEvaluation) {
        if let Err(error) = self
            .store
            .record_evaluation(version, relation_id, evaluation)
            .await
        {
            warn!(relation_id, %error, "failed to record planned evaluation");
        }
    }

    /// Round-robin the groups over a fixed worker pool. Every worker owns
    /// an exclusive queue and drains it sequentially; workers run fully
    /// concurrently and one worker's failure never cancels its siblings.
    async fn judge_groups(
        &self,
        version: &str,
        groups: BTreeMap<(String, String), Vec<CandidateBrief>>,
    ) -> JudgmentStats {
        let group_list: Vec<CandidateGroup> = groups
            .into_iter()
            .map(|((a, b), candidates)| CandidateGroup {
                entity_a_type: a,
                entity_b_type: b,
                candidates,
            })
            .collect();
        let workers = self
            .judgment_config
            .worker_concurrency
            .max(1)
            .min(group_list.len());
        let mut queues: Vec<Vec<CandidateGroup>> = (0..workers).map(|_| Vec::new()).collect();
        for (i, group) in group_list.into_iter().enumerate() {
            queues[i % workers].push(group);
        }

        let mut handles = Vec::with_capacity(workers);
        for (worker_id, queue) in queues.into_iter().enumerate() {
            let worker = JudgmentWorker {
                worker_id,
                version: version.to_string(),
                store: self.store.clone(),
                data_graph: self.data_graph.clone(),
                evaluator: self.evaluator.clone(),
                config: self.judgment_config.clone(),
            };
            handles.push(tokio::spawn(worker.run(queue)));
        }

        // Collect all outcomes; a failed worker is logged, not fatal.
        let mut stats = JudgmentStats::default();
        for handle in handles {
            match handle.await {
                Ok(worker_stats) => {
                    stats.groups_judged += worker_stats.groups_judged;
                    stats.groups_failed += worker_stats.groups_failed;
                    stats.evaluations_recorded += worker_stats.evaluations_recorded;
                }
                Err(error) => {
                    warn!(%error, "judgment worker aborted; siblings unaffected");
                    stats.worker_failures += 1;
                }
            }
        }
        stats
    }
}

fn mapping_rules(heuristic: &crate::candidates::FkeyHeuristic) -> Vec<MappingRule> {
    heuristic
        .mapping
        .iter()
        .map(|(a, b)| MappingRule {
            a_property: a.clone(),
            b_property: b.clone(),
            match_type: MatchType::Exact,
        })
        .collect()
}

// ============================================================================
// Judgment worker
// ============================================================================

#[derive(Debug, Default)]
struct WorkerStats {
    groups_judged: usize,
    groups_failed: usize,
    evaluations_recorded: usize,
}

struct JudgmentWorker {
    worker_id: usize,
    version: String,
    store: Arc<CandidateStore>,
    data_graph: Arc<dyn GraphStore>,
    evaluator: Arc<dyn Evaluator>,
    config: JudgmentConfig,
}

impl JudgmentWorker {
    async fn run(self, queue: Vec<CandidateGroup>) -> WorkerStats {
        let mut stats = WorkerStats::default();
        for group in queue {
            match self.judge_one(&group).await {
                Ok(recorded) => {
                    stats.groups_judged += 1;
                    stats.evaluations_recorded += recorded;
                }
                Err(error) => {
                    stats.groups_failed += 1;
                    warn!(
                        worker = self.worker_id,
                        entity_a = %group.entity_a_type,
                        entity_b = %group.entity_b_type,
                        %error,
                        "group judgment failed; remaining groups proceed"
                    );
                }
            }
        }
        stats
    }

    async fn judge_one(&self, group: &CandidateGroup) -> Result<usize, GraphError> {
        let context = self.build_context(group).await?;
        let outcomes = self
            .evaluator
            .evaluate_group(group, &context)
            .await
            .map_err(|e| GraphError::Store(e.to_string()))?;
        let mut recorded = 0;
        for outcome in outcomes {
            self.store
                .record_evaluation(&self.version, &outcome.relation_id, &outcome.evaluation)
                .await?;
            recorded += 1;
        }
        Ok(recorded)
    }

    /// Bounded context: a few example pairs restricted to the mapped
    /// properties, both sides' sub-entity closures, and relation names
    /// already accepted between the two types.
    async fn build_context(&self, group: &CandidateGroup) -> Result<JudgmentContext, GraphError> {
        let mut context = JudgmentContext {
            a_sub_entity_types: self
                .store
                .sub_entity_closure(
                    &self.version,
                    &group.entity_a_type,
                    self.config.sub_entity_closure_depth,
                )
                .await?,
            b_sub_entity_types: self
                .store
                .sub_entity_closure(
                    &self.version,
                    &group.entity_b_type,
                    self.config.sub_entity_closure_depth,
                )
                .await?,
            accepted_relation_names: self
                .store
                .accepted_relation_names_between(
                    &self.version,
                    &group.entity_a_type,
                    &group.entity_b_type,
                )
                .await?,
            ..Default::default()
        };

        for brief in &group.candidates {
            let Some(heuristic) = self
                .store
                .get_heuristic(&self.version, &brief.relation_id)
                .await?
            else {
                continue;
            };
            let mut pairs = Vec::new();
            for (a_key, b_key) in heuristic
                .example_pairs
                .iter()
                .take(self.config.max_example_pairs)
            {
                let a_entity = self
                    .data_graph
                    .get_entity(&EntityKey::new(group.entity_a_type.clone(), a_key.clone()))
                    .await?;
                let b_entity = self
                    .data_graph
                    .get_entity(&EntityKey::new(group.entity_b_type.clone(), b_key.clone()))
                    .await?;
                let a_props: Vec<&String> = heuristic.mapping.keys().collect();
                let b_props: Vec<&String> = heuristic.mapping.values().collect();
                pairs.push(ExamplePair {
                    a_key: a_key.clone(),
                    b_key: b_key.clone(),
                    a_properties: restrict(a_entity.as_ref(), &a_props),
                    b_properties: restrict(b_entity.as_ref(), &b_props),
                });
            }
            context.example_pairs.insert(brief.relation_id.clone(), pairs);
        }
        Ok(context)
    }
}

fn restrict(
    entity: Option<&ontolink_graph::Entity>,
    properties: &[&String],
) -> BTreeMap<String, PropertyValue> {
    let mut out = BTreeMap::new();
    let Some(entity) = entity else {
        return out;
    };
    for property in properties {
        if let Some(value) = entity.properties.get(property) {
            out.insert((*property).clone(), value.clone());
        }
    }
    out
}

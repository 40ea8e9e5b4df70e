//! Ontolink Sync: candidate lifecycle, judgment, and cutover
//!
//! The discovery pipeline's stateful half:
//!
//! - [`candidates`] — the versioned [`CandidateStore`]: additive heuristic
//!   merges keyed by relation id, candidate/evaluation views, data-graph
//!   materialization, and per-category version cleanup.
//! - [`evaluator`] — the pluggable judgment contract plus a deterministic
//!   rule engine (embedded default and test double) and an optional
//!   HTTP-backed LLM engine behind the `llm` feature.
//! - [`orchestrator`] — `run_cycle()`: mint a version, scan, plan
//!   judgment (auto-accept / auto-unsure / copy-forward / judge), fan
//!   groups out across a worker pool, flip the current-version pointer,
//!   best-effort resync, purge stale versions.
//!
//! Exactly one ontology version is "current" at any time; the pointer
//! flip inside `run_cycle` is the sole externally visible cutover point.

pub mod candidates;
pub mod evaluator;
pub mod orchestrator;

pub use candidates::{
    CandidateStore, CleanupReport, Directionality, EvaluationResult, FkeyEvaluation,
    FkeyHeuristic, MappingRule, RelationCandidate, SyncStatus,
};
pub use evaluator::{
    CandidateBrief, CandidateGroup, EvaluationOutcome, Evaluator, EvaluatorError, ExamplePair,
    JudgmentContext, RuleEvaluator, RuleEvaluatorConfig, ScriptedEvaluator,
};
#[cfg(feature = "llm")]
pub use evaluator::HttpLlmEvaluator;
pub use orchestrator::{
    CycleReport, DiscoveryEvent, DiscoveryEventHandler, DiscoveryOrchestrator, JudgmentConfig,
    JudgmentStats, OrchestratorState, PlanStats, SyncPassStats,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Concurrent `run_cycle` invocations are rejected, not queued.
    #[error("a cycle is already running (phase: {phase:?})")]
    AlreadyRunning { phase: OrchestratorState },

    #[error(transparent)]
    Graph(#[from] ontolink_graph::GraphError),

    #[error(transparent)]
    Discovery(#[from] ontolink_discovery::DiscoveryError),
}

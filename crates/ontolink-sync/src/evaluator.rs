//! The pluggable judgment contract.
//!
//! Judgment is policy, not pipeline: given a group of candidates between
//! one pair of entity types plus bounded supporting context, an
//! [`Evaluator`] returns accept/reject/unsure per candidate. The pipeline
//! is agnostic to what sits behind the trait — the deterministic
//! [`RuleEvaluator`] ships as the embedded default, the
//! [`ScriptedEvaluator`] backs tests, and an HTTP LLM engine is available
//! behind the `llm` feature.
//!
//! A hung evaluator is bounded by the implementation's own step or
//! request limits; the orchestrator does not cancel workers mid-call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use thiserror::Error;

use ontolink_discovery::MatchType;
use ontolink_graph::PropertyValue;

use crate::candidates::{
    Directionality, EvaluationResult, FkeyEvaluation, FkeyHeuristic, MappingRule,
};

#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("evaluator failed: {0}")]
    Failed(String),

    #[error("invalid evaluator response: {0}")]
    InvalidResponse(String),
}

/// Everything a policy sees about one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateBrief {
    pub relation_id: String,
    pub mapping: BTreeMap<String, String>,
    pub total_matches: u64,
    pub average_bm25: f64,
    pub average_quality: f64,
    /// `"a_prop->b_prop"` → per-match-type counts.
    pub property_match_patterns: BTreeMap<String, BTreeMap<String, u64>>,
}

impl CandidateBrief {
    pub fn from_heuristic(heuristic: &FkeyHeuristic) -> Self {
        Self {
            relation_id: heuristic.relation_id.clone(),
            mapping: heuristic.mapping.clone(),
            total_matches: heuristic.total_matches,
            average_bm25: heuristic.average_bm25(),
            average_quality: heuristic.average_quality(),
            property_match_patterns: heuristic.property_match_patterns.clone(),
        }
    }

    /// The dominant match type per property pair, by observation count.
    pub fn dominant_match_types(&self) -> BTreeMap<String, MatchType> {
        self.property_match_patterns
            .iter()
            .filter_map(|(pair, counts)| {
                counts
                    .iter()
                    .max_by_key(|(_, count)| **count)
                    .map(|(match_type, _)| {
                        (
                            pair.clone(),
                            MatchType::from_str(match_type).unwrap_or(MatchType::None),
                        )
                    })
            })
            .collect()
    }
}

/// One judgment unit: every unresolved candidate between one type pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateGroup {
    pub entity_a_type: String,
    pub entity_b_type: String,
    pub candidates: Vec<CandidateBrief>,
}

/// An example entity pair, restricted to the mapped properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamplePair {
    pub a_key: String,
    pub b_key: String,
    pub a_properties: BTreeMap<String, PropertyValue>,
    pub b_properties: BTreeMap<String, PropertyValue>,
}

/// Bounded supporting context assembled per group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JudgmentContext {
    /// Up to a few example pairs per relation id.
    pub example_pairs: BTreeMap<String, Vec<ExamplePair>>,
    pub a_sub_entity_types: BTreeSet<String>,
    pub b_sub_entity_types: BTreeSet<String>,
    /// Relations already accepted between the same two types.
    pub accepted_relation_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub relation_id: String,
    pub evaluation: FkeyEvaluation,
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate_group(
        &self,
        group: &CandidateGroup,
        context: &JudgmentContext,
    ) -> Result<Vec<EvaluationOutcome>, EvaluatorError>;
}

// ============================================================================
// Deterministic rule engine
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEvaluatorConfig {
    /// Accept when evidence is at least this deep...
    pub accept_min_matches: u64,
    /// ...and at least this clean.
    pub accept_min_quality: f64,
    /// Reject below this quality floor.
    pub reject_max_quality: f64,
}

impl Default for RuleEvaluatorConfig {
    fn default() -> Self {
        Self {
            accept_min_matches: 5,
            accept_min_quality: 3.0,
            reject_max_quality: 1.0,
        }
    }
}

/// Threshold-based accept/reject/unsure policy. Deterministic, offline,
/// and order-insensitive — usable both in production and as the reference
/// policy in property tests.
#[derive(Debug, Default)]
pub struct RuleEvaluator {
    config: RuleEvaluatorConfig,
}

impl RuleEvaluator {
    pub fn new(config: RuleEvaluatorConfig) -> Self {
        Self { config }
    }
}

fn snake(type_name: &str) -> String {
    let mut out = String::with_capacity(type_name.len());
    for (i, c) in type_name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Deterministic relation name for an accepted mapping.
pub fn default_relation_name(entity_a_type: &str, entity_b_type: &str) -> String {
    format!("{}_references_{}", snake(entity_a_type), snake(entity_b_type))
}

/// Deterministic relation name for the structural sub-entity pattern.
pub fn sub_entity_relation_name(entity_a_type: &str, entity_b_type: &str) -> String {
    format!("{}_part_of_{}", snake(entity_a_type), snake(entity_b_type))
}

#[async_trait]
impl Evaluator for RuleEvaluator {
    async fn evaluate_group(
        &self,
        group: &CandidateGroup,
        _context: &JudgmentContext,
    ) -> Result<Vec<EvaluationOutcome>, EvaluatorError> {
        let mut outcomes = Vec::with_capacity(group.candidates.len());
        for brief in &group.candidates {
            let result = if brief.total_matches >= self.config.accept_min_matches
                && brief.average_quality >= self.config.accept_min_quality
            {
                EvaluationResult::Accepted
            } else if brief.average_quality < self.config.reject_max_quality {
                EvaluationResult::Rejected
            } else {
                EvaluationResult::Unsure
            };

            let dominant = brief.dominant_match_types();
            let property_mappings = brief
                .mapping
                .iter()
                .map(|(a, b)| MappingRule {
                    a_property: a.clone(),
                    b_property: b.clone(),
                    match_type: dominant
                        .get(&format!("{a}->{b}"))
                        .copied()
                        .unwrap_or(MatchType::Exact),
                })
                .collect();

            outcomes.push(EvaluationOutcome {
                relation_id: brief.relation_id.clone(),
                evaluation: FkeyEvaluation {
                    relation_name: default_relation_name(
                        &group.entity_a_type,
                        &group.entity_b_type,
                    ),
                    result,
                    justification: format!(
                        "{} observations, average quality {:.2}",
                        brief.total_matches, brief.average_quality
                    ),
                    thought: String::new(),
                    is_manual: false,
                    is_sub_entity_relation: false,
                    directionality: Directionality::AToB,
                    property_mappings,
                },
            });
        }
        Ok(outcomes)
    }
}

// ============================================================================
// Scripted engine (test double)
// ============================================================================

/// Returns pre-scripted evaluations by relation id and counts every call.
/// Candidates without a script entry come back `Unsure`.
#[derive(Debug, Default)]
pub struct ScriptedEvaluator {
    script: BTreeMap<String, FkeyEvaluation>,
    calls: std::sync::atomic::AtomicUsize,
    fail_for_types: BTreeSet<String>,
}

impl ScriptedEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(mut self, relation_id: impl Into<String>, evaluation: FkeyEvaluation) -> Self {
        self.script.insert(relation_id.into(), evaluation);
        self
    }

    /// Fail every group whose A-side type matches, for failure-isolation
    /// tests.
    pub fn failing_for(mut self, entity_a_type: impl Into<String>) -> Self {
        self.fail_for_types.insert(entity_a_type.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate_group(
        &self,
        group: &CandidateGroup,
        _context: &JudgmentContext,
    ) -> Result<Vec<EvaluationOutcome>, EvaluatorError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.fail_for_types.contains(&group.entity_a_type) {
            return Err(EvaluatorError::Failed(format!(
                "scripted failure for {}",
                group.entity_a_type
            )));
        }
        Ok(group
            .candidates
            .iter()
            .map(|brief| EvaluationOutcome {
                relation_id: brief.relation_id.clone(),
                evaluation: self.script.get(&brief.relation_id).cloned().unwrap_or(
                    FkeyEvaluation {
                        relation_name: default_relation_name(
                            &group.entity_a_type,
                            &group.entity_b_type,
                        ),
                        result: EvaluationResult::Unsure,
                        justification: "no scripted outcome".to_string(),
                        thought: String::new(),
                        is_manual: false,
                        is_sub_entity_relation: false,
                        directionality: Directionality::AToB,
                        property_mappings: Vec::new(),
                    },
                ),
            })
            .collect())
    }
}

// ============================================================================
// HTTP LLM engine (feature-gated)
// ============================================================================

/// Posts the group + context as JSON to an external judgment service and
/// expects `[{relation_id, evaluation}]` back. The service owns its own
/// step and recursion limits.
#[cfg(feature = "llm")]
pub struct HttpLlmEvaluator {
    endpoint: String,
    client: reqwest::Client,
}

#[cfg(feature = "llm")]
impl HttpLlmEvaluator {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[cfg(feature = "llm")]
#[async_trait]
impl Evaluator for HttpLlmEvaluator {
    async fn evaluate_group(
        &self,
        group: &CandidateGroup,
        context: &JudgmentContext,
    ) -> Result<Vec<EvaluationOutcome>, EvaluatorError> {
        let body = serde_json::json!({ "group": group, "context": context });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| EvaluatorError::Failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EvaluatorError::Failed(format!(
                "judgment service returned {}",
                response.status()
            )));
        }
        response
            .json::<Vec<EvaluationOutcome>>()
            .await
            .map_err(|e| EvaluatorError::InvalidResponse(e.to_string()))
    }
}

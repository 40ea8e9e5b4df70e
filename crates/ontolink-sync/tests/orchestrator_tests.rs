//! End-to-end cycle behavior: judgment planning, worker isolation,
//! copy-forward, re-entrancy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ontolink_discovery::MatchType;
use ontolink_graph::{derive_relation_id, Entity, GraphStore, InMemoryGraph, InMemoryKv};
use ontolink_sync::{
    CandidateGroup, CandidateStore, Directionality, DiscoveryOrchestrator, EvaluationOutcome,
    EvaluationResult, Evaluator, EvaluatorError, FkeyEvaluation, JudgmentContext, MappingRule,
    ScriptedEvaluator, SyncError,
};

fn fk_relation_id() -> String {
    let mapping = BTreeMap::from([("customer_id".to_string(), "id".to_string())]);
    derive_relation_id("Order", "User", &mapping)
}

fn accepted_evaluation() -> FkeyEvaluation {
    FkeyEvaluation {
        relation_name: "placed_by".into(),
        result: EvaluationResult::Accepted,
        justification: "scripted".into(),
        thought: String::new(),
        is_manual: false,
        is_sub_entity_relation: false,
        directionality: Directionality::AToB,
        property_mappings: vec![MappingRule {
            a_property: "customer_id".into(),
            b_property: "id".into(),
            match_type: MatchType::Exact,
        }],
    }
}

async fn seed_orders(data_graph: &InMemoryGraph, orders: usize, users: usize) {
    for i in 0..users {
        data_graph
            .upsert_entity(Entity::new("User", vec!["id".into()]).with("id", format!("u-{i}")))
            .await
            .unwrap();
    }
    for i in 0..orders {
        data_graph
            .upsert_entity(
                Entity::new("Order", vec!["num".into()])
                    .with("num", format!("o-{i}"))
                    .with("customer_id", format!("u-{}", i % users)),
            )
            .await
            .unwrap();
    }
}

fn orchestrator(
    data_graph: Arc<InMemoryGraph>,
    evaluator: Arc<dyn Evaluator>,
) -> (DiscoveryOrchestrator, Arc<CandidateStore>) {
    let store = Arc::new(CandidateStore::new(
        Arc::new(InMemoryGraph::new()),
        data_graph.clone(),
        Arc::new(InMemoryKv::new()),
        "test-client",
    ));
    (
        DiscoveryOrchestrator::new(store.clone(), data_graph, evaluator),
        store,
    )
}

#[tokio::test]
async fn full_cycle_discovers_judges_and_syncs() {
    let data_graph = Arc::new(InMemoryGraph::new());
    seed_orders(&data_graph, 12, 3).await;

    let evaluator = Arc::new(
        ScriptedEvaluator::new().with_outcome(fk_relation_id(), accepted_evaluation()),
    );
    let (orchestrator, store) = orchestrator(data_graph.clone(), evaluator.clone());

    let report = orchestrator.run_cycle().await.unwrap();
    assert!(report.prior_version.is_none());
    assert_eq!(report.plan.judged_candidates, 1);
    assert_eq!(report.judgment.groups_judged, 1);
    assert_eq!(report.judgment.evaluations_recorded, 1);
    assert_eq!(report.sync.failed, 0);
    assert_eq!(report.sync.edges_created, 12);

    // Cutover happened: the report's version is now current.
    assert_eq!(
        store.current_version().await.unwrap().as_deref(),
        Some(report.version.as_str())
    );

    let candidate = store.get_candidate(&fk_relation_id()).await.unwrap().unwrap();
    assert_eq!(candidate.heuristic.total_matches, 12);
    let evaluation = candidate.evaluation.unwrap();
    assert_eq!(evaluation.result, EvaluationResult::Accepted);
    assert!(candidate.sync.is_synced);

    let edges = data_graph
        .find_relations(&ontolink_graph::RelationFilter::of_type("placed_by"))
        .await
        .unwrap();
    assert_eq!(edges.len(), 12);
}

#[tokio::test]
async fn rerun_with_no_new_data_copies_forward_without_evaluator_calls() {
    let data_graph = Arc::new(InMemoryGraph::new());
    seed_orders(&data_graph, 10, 2).await;

    let evaluator = Arc::new(
        ScriptedEvaluator::new().with_outcome(fk_relation_id(), accepted_evaluation()),
    );
    let (orchestrator, store) = orchestrator(data_graph, evaluator.clone());

    let first = orchestrator.run_cycle().await.unwrap();
    let calls_after_first = evaluator.calls();
    assert!(calls_after_first > 0);

    let second = orchestrator.run_cycle().await.unwrap();
    assert_eq!(second.prior_version.as_deref(), Some(first.version.as_str()));
    assert_eq!(
        evaluator.calls(),
        calls_after_first,
        "unchanged candidates must not reach the evaluator"
    );
    assert_eq!(second.plan.copied_forward, 1);
    assert_eq!(second.plan.judged_candidates, 0);

    // The copied-forward evaluation is intact in the new version.
    let candidate = store.get_candidate(&fk_relation_id()).await.unwrap().unwrap();
    assert_eq!(candidate.version, second.version);
    assert_eq!(
        candidate.evaluation.unwrap().result,
        EvaluationResult::Accepted
    );

    // The first version was purged after cutover.
    assert!(store
        .get_candidate_in(&first.version, &fk_relation_id())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn low_evidence_candidates_are_auto_unsure() {
    let data_graph = Arc::new(InMemoryGraph::new());
    // Two orders only: below the default evidence threshold of 3.
    seed_orders(&data_graph, 2, 2).await;

    let evaluator = Arc::new(ScriptedEvaluator::new());
    let (orchestrator, store) = orchestrator(data_graph, evaluator.clone());

    let report = orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.plan.auto_unsure, 1);
    assert_eq!(report.plan.judged_candidates, 0);
    assert_eq!(evaluator.calls(), 0);

    let candidate = store.get_candidate(&fk_relation_id()).await.unwrap().unwrap();
    assert_eq!(
        candidate.evaluation.unwrap().result,
        EvaluationResult::Unsure
    );
}

#[tokio::test]
async fn sub_entity_candidates_are_auto_accepted() {
    let data_graph = Arc::new(InMemoryGraph::new());
    let host = ontolink_graph::EntityKey::new("Host", "h-1");
    data_graph
        .upsert_entity(Entity::new("Host", vec!["name".into()]).with("name", "h-1"))
        .await
        .unwrap();
    for i in 0..4 {
        data_graph
            .upsert_entity(
                Entity::new("Disk", vec!["serial".into()])
                    .with("serial", format!("sd-{i}"))
                    .with_parent(&host),
            )
            .await
            .unwrap();
    }

    let evaluator = Arc::new(ScriptedEvaluator::new());
    let (orchestrator, store) = orchestrator(data_graph, evaluator.clone());

    let report = orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.plan.auto_accepted, 1);
    assert_eq!(evaluator.calls(), 0, "structural links skip judgment");

    let candidates = store.get_all_candidates().await.unwrap();
    let sub = candidates
        .iter()
        .find(|c| c.heuristic.is_pure_sub_entity())
        .expect("sub-entity candidate");
    let evaluation = sub.evaluation.as_ref().unwrap();
    assert_eq!(evaluation.result, EvaluationResult::Accepted);
    assert!(evaluation.is_sub_entity_relation);
    assert_eq!(evaluation.relation_name, "disk_part_of_host");
}

#[tokio::test]
async fn one_failing_group_does_not_block_the_others() {
    let data_graph = Arc::new(InMemoryGraph::new());
    seed_orders(&data_graph, 8, 2).await;
    // A second judgeable type pair: tickets referencing users.
    for i in 0..6 {
        data_graph
            .upsert_entity(
                Entity::new("Ticket", vec!["key".into()])
                    .with("key", format!("t-{i}"))
                    .with("assignee", format!("u-{}", i % 2)),
            )
            .await
            .unwrap();
    }

    let ticket_relation = derive_relation_id(
        "Ticket",
        "User",
        &BTreeMap::from([("assignee".to_string(), "id".to_string())]),
    );
    let evaluator = Arc::new(
        ScriptedEvaluator::new()
            .with_outcome(fk_relation_id(), accepted_evaluation())
            .failing_for("Order"),
    );
    let (orchestrator, store) = orchestrator(data_graph, evaluator.clone());

    let report = orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.judgment.groups_failed, 1);
    assert!(report.judgment.groups_judged >= 1);

    // The ticket group was judged despite the order group failing.
    let ticket = store.get_candidate(&ticket_relation).await.unwrap().unwrap();
    assert!(ticket.evaluation.is_some());
    // The failed group's candidate stays unjudged and is retried next
    // cycle (its heuristics persist).
    let order = store.get_candidate(&fk_relation_id()).await.unwrap().unwrap();
    assert!(order.evaluation.is_none());
}

/// Holds every call long enough for a second `run_cycle` to collide.
struct SlowEvaluator {
    inner: ScriptedEvaluator,
    delay: Duration,
}

#[async_trait]
impl Evaluator for SlowEvaluator {
    async fn evaluate_group(
        &self,
        group: &CandidateGroup,
        context: &JudgmentContext,
    ) -> Result<Vec<EvaluationOutcome>, EvaluatorError> {
        tokio::time::sleep(self.delay).await;
        self.inner.evaluate_group(group, context).await
    }
}

#[tokio::test]
async fn concurrent_cycles_are_rejected_not_queued() {
    let data_graph = Arc::new(InMemoryGraph::new());
    seed_orders(&data_graph, 10, 2).await;

    let evaluator = Arc::new(SlowEvaluator {
        inner: ScriptedEvaluator::new(),
        delay: Duration::from_millis(300),
    });
    let (orchestrator, _store) = orchestrator(data_graph, evaluator);
    let orchestrator = Arc::new(orchestrator);

    let background = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_cycle().await })
    };
    // Give the first cycle time to get under way.
    tokio::time::sleep(Duration::from_millis(100)).await;

    match orchestrator.run_cycle().await {
        Err(SyncError::AlreadyRunning { .. }) => {}
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }

    let first = background.await.unwrap();
    assert!(first.is_ok());
}

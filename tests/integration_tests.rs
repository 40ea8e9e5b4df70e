//! Integration tests for the complete Ontolink pipeline
//!
//! These tests verify end-to-end functionality across crates:
//! - Data graph → FuzzySearchIndex → MatchScorer → heuristics
//! - CandidateStore → Evaluator → cutover → data-graph sync
//! - Version lifecycle across repeated cycles
//!
//! Run with: cargo test --test integration_tests

use std::collections::BTreeMap;
use std::sync::Arc;

use ontolink_graph::{
    derive_relation_id, Entity, GraphStore, InMemoryGraph, InMemoryKv, RelationFilter,
};
use ontolink_sync::{
    CandidateStore, DiscoveryOrchestrator, EvaluationResult, RuleEvaluator,
};

// ============================================================================
// Fixtures
// ============================================================================

fn fk_relation_id() -> String {
    let mapping = BTreeMap::from([("customer_id".to_string(), "id".to_string())]);
    derive_relation_id("Order", "User", &mapping)
}

/// Fifty orders, every one referencing an existing user's id.
async fn seed_shop(data_graph: &InMemoryGraph) {
    for i in 0..5 {
        data_graph
            .upsert_entity(
                Entity::new("User", vec!["id".into()])
                    .with("id", format!("u-{i}"))
                    .with("email", format!("user{i}@shop.example")),
            )
            .await
            .unwrap();
    }
    for i in 0..50 {
        data_graph
            .upsert_entity(
                Entity::new("Order", vec!["num".into()])
                    .with("num", format!("o-{i}"))
                    .with("customer_id", format!("u-{}", i % 5)),
            )
            .await
            .unwrap();
    }
}

fn pipeline(
    data_graph: Arc<InMemoryGraph>,
) -> (DiscoveryOrchestrator, Arc<CandidateStore>, Arc<InMemoryGraph>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let candidate_graph = Arc::new(InMemoryGraph::new());
    let store = Arc::new(CandidateStore::new(
        candidate_graph.clone(),
        data_graph.clone(),
        Arc::new(InMemoryKv::new()),
        "integration-client",
    ));
    let orchestrator = DiscoveryOrchestrator::new(
        store.clone(),
        data_graph,
        Arc::new(RuleEvaluator::default()),
    );
    (orchestrator, store, candidate_graph)
}

// ============================================================================
// The foreign-key scenario: Users × Orders
// ============================================================================

#[tokio::test]
async fn fifty_orders_become_one_accepted_relation_with_fifty_edges() -> anyhow::Result<()> {
    let data_graph = Arc::new(InMemoryGraph::new());
    seed_shop(&data_graph).await;
    let (orchestrator, store, _) = pipeline(data_graph.clone());

    let report = orchestrator.run_cycle().await?;

    // One cycle, one candidate, with the full evidence depth.
    let candidate = store
        .get_candidate(&fk_relation_id())
        .await?
        .expect("the customer_id → id candidate must exist");
    assert_eq!(candidate.heuristic.total_matches, 50);
    assert_eq!(
        candidate.heuristic.mapping,
        BTreeMap::from([("customer_id".to_string(), "id".to_string())])
    );
    assert_eq!(
        candidate.heuristic.property_match_patterns["customer_id->id"]["EXACT"],
        50
    );

    // The deterministic policy accepts it, and sync materializes exactly
    // one edge per order.
    let evaluation = candidate.evaluation.expect("judged in the same cycle");
    assert_eq!(evaluation.result, EvaluationResult::Accepted);
    assert!(candidate.sync.is_synced);
    assert_eq!(candidate.sync.edges_created, Some(50));
    assert_eq!(report.sync.edges_created, 50);

    let edges = data_graph
        .find_relations(&RelationFilter::of_type(evaluation.relation_name.clone()))
        .await?;
    assert_eq!(edges.len(), 50);
    // Every edge is tagged with the relation id and the acting client.
    for edge in &edges {
        assert!(edge.properties.get_internal("_relation_id").is_some());
        assert!(edge.properties.get_internal("_client").is_some());
    }
    Ok(())
}

#[tokio::test]
async fn globally_unique_values_are_bloom_filtered() -> anyhow::Result<()> {
    let data_graph = Arc::new(InMemoryGraph::new());
    seed_shop(&data_graph).await;
    // A value that is nobody's identity key, in whole or in tokens: no
    // fuzzy query should ever be issued for it.
    data_graph
        .upsert_entity(
            Entity::new("Note", vec!["slug".into()])
                .with("slug", "weeklynote")
                .with("body", "zxqv wvuthree plgh"),
        )
        .await
        .unwrap();
    let (orchestrator, _, _) = pipeline(data_graph);

    let report = orchestrator.run_cycle().await?;
    assert!(
        report.scan.bloom_skipped >= 1,
        "the unique note body must be skipped before search"
    );
    Ok(())
}

#[tokio::test]
async fn second_cycle_reuses_every_judgment_and_purges_the_old_version() -> anyhow::Result<()> {
    let data_graph = Arc::new(InMemoryGraph::new());
    seed_shop(&data_graph).await;
    let (orchestrator, store, _) = pipeline(data_graph);

    let first = orchestrator.run_cycle().await?;
    let second = orchestrator.run_cycle().await?;

    assert_eq!(second.prior_version.as_deref(), Some(first.version.as_str()));
    assert_eq!(second.plan.judged_candidates, 0, "nothing changed");
    assert!(second.plan.copied_forward >= 1);
    assert_eq!(second.judgment.evaluations_recorded, 0);

    // The old version is unreachable after cleanup.
    assert!(store
        .get_candidate_in(&first.version, &fk_relation_id())
        .await?
        .is_none());
    // The new one carries the same accepted judgment.
    let candidate = store.get_candidate(&fk_relation_id()).await?.unwrap();
    assert_eq!(
        candidate.evaluation.unwrap().result,
        EvaluationResult::Accepted
    );
    Ok(())
}

// ============================================================================
// Mixed corpus: structural sub-entities alongside fuzzy candidates
// ============================================================================

#[tokio::test]
async fn structural_and_fuzzy_candidates_coexist_in_one_cycle() -> anyhow::Result<()> {
    let data_graph = Arc::new(InMemoryGraph::new());
    seed_shop(&data_graph).await;
    for i in 0..4 {
        let parent = ontolink_graph::EntityKey::new("Order", format!("o-{i}"));
        data_graph
            .upsert_entity(
                Entity::new("LineItem", vec!["sku".into(), "line".into()])
                    .with("sku", format!("sku-{i}"))
                    .with("line", i as i64)
                    .with_parent(&parent),
            )
            .await
            .unwrap();
    }
    let (orchestrator, store, _) = pipeline(data_graph);

    let report = orchestrator.run_cycle().await?;
    assert_eq!(report.plan.auto_accepted, 1, "LineItem → Order is structural");
    assert_eq!(report.scan.sub_entity_matches, 4);

    let candidates = store.get_all_candidates().await?;
    assert!(candidates.len() >= 2);
    let structural = candidates
        .iter()
        .find(|c| c.heuristic.is_pure_sub_entity())
        .unwrap();
    assert_eq!(structural.heuristic.entity_a_type, "LineItem");
    assert!(structural
        .evaluation
        .as_ref()
        .is_some_and(|e| e.is_sub_entity_relation));

    // The sub-entity closure is inspectable through the orchestrator.
    let closure = orchestrator.sub_entity_closure("Order").await?;
    assert!(closure.contains("LineItem"));
    Ok(())
}

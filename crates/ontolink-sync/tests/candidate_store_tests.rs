//! Candidate store behavior: additive merges, evaluation lifecycle,
//! sync materialization, and version cleanup.

use std::collections::BTreeMap;
use std::sync::Arc;

use ontolink_discovery::{DeepPropertyMatch, HeuristicSink, MatchType, PropertyMapping};
use ontolink_graph::{
    derive_relation_id, Entity, GraphStore, InMemoryGraph, InMemoryKv, PropertyValue,
    RelationFilter,
};
use ontolink_sync::{
    CandidateStore, Directionality, EvaluationResult, FkeyEvaluation, MappingRule,
};

struct Fixture {
    store: CandidateStore,
    candidate_graph: Arc<InMemoryGraph>,
    data_graph: Arc<InMemoryGraph>,
}

fn fixture() -> Fixture {
    let candidate_graph = Arc::new(InMemoryGraph::new());
    let data_graph = Arc::new(InMemoryGraph::new());
    let kv = Arc::new(InMemoryKv::new());
    let store = CandidateStore::new(
        candidate_graph.clone(),
        data_graph.clone(),
        kv,
        "test-client",
    );
    Fixture {
        store,
        candidate_graph,
        data_graph,
    }
}

fn fk_mapping() -> BTreeMap<String, String> {
    BTreeMap::from([("customer_id".to_string(), "id".to_string())])
}

fn fk_relation_id() -> String {
    derive_relation_id("Order", "User", &fk_mapping())
}

fn observation(order: &str, user: &str) -> DeepPropertyMatch {
    DeepPropertyMatch {
        entity_a_type: "Order".into(),
        entity_a_key: order.into(),
        search_property: "customer_id".into(),
        search_value: user.into(),
        entity_b_type: "User".into(),
        entity_b_key: user.into(),
        identity_key: BTreeMap::from([("id".to_string(), PropertyValue::str(user))]),
        matching_properties: vec![PropertyMapping {
            entity_a_property: "customer_id".into(),
            entity_b_idkey_property: "id".into(),
            match_type: MatchType::Exact,
            value_match_quality: 1.0,
        }],
        bm25_score: 4.0,
        deep_match_quality: 12.0,
        relation_id: fk_relation_id(),
    }
}

fn accepted_evaluation() -> FkeyEvaluation {
    FkeyEvaluation {
        relation_name: "placed_by".into(),
        result: EvaluationResult::Accepted,
        justification: "consistent exact mapping".into(),
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

async fn seed_data_graph(data_graph: &InMemoryGraph, orders: usize) {
    for i in 0..3 {
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
                    .with("customer_id", format!("u-{}", i % 3)),
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn merges_accumulate_commutatively() {
    let f = fixture();
    f.store
        .ensure_type_placeholders("v1", &["Order".into(), "User".into()])
        .await
        .unwrap();

    let batch_a: Vec<_> = (0..7).map(|i| observation(&format!("o-{i}"), "u-1")).collect();
    let batch_b: Vec<_> = (7..12).map(|i| observation(&format!("o-{i}"), "u-2")).collect();
    f.store.merge_heuristics("v1", batch_a).await.unwrap();
    f.store.merge_heuristics("v1", batch_b).await.unwrap();

    let candidate = f
        .store
        .get_candidate_in("v1", &fk_relation_id())
        .await
        .unwrap()
        .expect("candidate exists");
    let h = &candidate.heuristic;
    assert_eq!(h.total_matches, 12);
    assert_eq!(h.entity_a_type, "Order");
    assert_eq!(h.mapping, fk_mapping());
    assert_eq!(
        h.property_match_patterns["customer_id->id"]["EXACT"],
        12
    );
    // Example ring is capped at 10.
    assert_eq!(h.example_pairs.len(), 10);
    approx::assert_relative_eq!(h.average_bm25(), 4.0);
    approx::assert_relative_eq!(h.average_quality(), 12.0);
    assert!(candidate.evaluation.is_none());
}

#[tokio::test]
async fn merge_makes_candidate_discoverable_before_judgment() {
    let f = fixture();
    f.store
        .ensure_type_placeholders("v1", &["Order".into(), "User".into()])
        .await
        .unwrap();
    f.store
        .merge_heuristics("v1", vec![observation("o-1", "u-1")])
        .await
        .unwrap();

    let edges = f
        .candidate_graph
        .find_relations(&RelationFilter::of_type("is_candidate"))
        .await
        .unwrap();
    assert_eq!(edges.len(), 1);
    assert!(edges[0].source.primary_key.starts_with("Order+"));
    assert!(edges[0].target.primary_key.starts_with("User+"));
}

#[tokio::test]
async fn record_evaluation_reorients_the_edge() {
    let f = fixture();
    f.store
        .ensure_type_placeholders("v1", &["Order".into(), "User".into()])
        .await
        .unwrap();
    f.store
        .merge_heuristics("v1", vec![observation("o-1", "u-1")])
        .await
        .unwrap();
    let relation_id = fk_relation_id();

    let mut reversed = accepted_evaluation();
    reversed.directionality = Directionality::BToA;
    f.store
        .record_evaluation("v1", &relation_id, &reversed)
        .await
        .unwrap();

    let edges = f
        .candidate_graph
        .find_relations(&RelationFilter::of_type("is_candidate"))
        .await
        .unwrap();
    assert_eq!(edges.len(), 1, "prior edge removed, one oriented edge left");
    assert!(edges[0].source.primary_key.starts_with("User+"));

    // Directionality may flip between passes; the edge follows.
    f.store
        .record_evaluation("v1", &relation_id, &accepted_evaluation())
        .await
        .unwrap();
    let edges = f
        .candidate_graph
        .find_relations(&RelationFilter::of_type("is_candidate"))
        .await
        .unwrap();
    assert_eq!(edges.len(), 1);
    assert!(edges[0].source.primary_key.starts_with("Order+"));

    let candidate = f
        .store
        .get_candidate_in("v1", &relation_id)
        .await
        .unwrap()
        .unwrap();
    let evaluation = candidate.evaluation.expect("evaluation recorded");
    assert_eq!(evaluation.result, EvaluationResult::Accepted);
    assert_eq!(evaluation.relation_name, "placed_by");
    assert_eq!(evaluation.property_mappings.len(), 1);
}

#[tokio::test]
async fn sync_materializes_accepted_and_retracts_rejected() {
    let f = fixture();
    seed_data_graph(&f.data_graph, 9).await;
    f.store
        .ensure_type_placeholders("v1", &["Order".into(), "User".into()])
        .await
        .unwrap();
    f.store
        .merge_heuristics("v1", vec![observation("o-1", "u-1")])
        .await
        .unwrap();
    let relation_id = fk_relation_id();

    f.store
        .record_evaluation("v1", &relation_id, &accepted_evaluation())
        .await
        .unwrap();
    let status = f.store.sync_candidate("v1", &relation_id).await;
    assert!(status.is_synced);
    assert_eq!(status.edges_created, Some(9));
    assert_eq!(f.data_graph.count_relations().await.unwrap(), 9);

    let edges = f
        .data_graph
        .find_relations(&RelationFilter::of_type("placed_by"))
        .await
        .unwrap();
    assert_eq!(edges.len(), 9);
    assert_eq!(
        edges[0].properties.get_internal("_client"),
        Some(&PropertyValue::str("test-client"))
    );

    // Flip to rejected: the materialized edges must come back out.
    let mut rejected = accepted_evaluation();
    rejected.result = EvaluationResult::Rejected;
    f.store
        .record_evaluation("v1", &relation_id, &rejected)
        .await
        .unwrap();
    let status = f.store.sync_candidate("v1", &relation_id).await;
    assert!(status.is_synced);
    assert_eq!(f.data_graph.count_relations().await.unwrap(), 0);
}

#[tokio::test]
async fn sync_failures_are_recorded_not_thrown() {
    let f = fixture();
    // No heuristic exists for this id: the inner sync fails, the status
    // records it, and nothing panics or propagates.
    let status = f.store.sync_candidate("v1", "no-such-relation").await;
    assert!(!status.is_synced);
    assert!(status.error_message.is_some());
}

#[tokio::test]
async fn sub_entity_closure_is_depth_bounded() {
    use ontolink_discovery::TypeMetadata;
    use std::collections::BTreeSet;

    let f = fixture();
    f.store
        .ensure_type_placeholders(
            "v1",
            &["Host".into(), "Disk".into(), "Partition".into(), "Block".into()],
        )
        .await
        .unwrap();
    // Host ← Disk ← Partition ← Block
    let chain = [("Disk", "Host"), ("Partition", "Disk"), ("Block", "Partition")];
    let metadata: Vec<TypeMetadata> = chain
        .iter()
        .map(|(child, parent)| TypeMetadata {
            entity_type: child.to_string(),
            labels: BTreeSet::from(["sub_entity".to_string()]),
            sub_entity_parent_types: BTreeSet::from([parent.to_string()]),
        })
        .collect();
    f.store.merge_type_metadata("v1", &metadata).await.unwrap();

    let shallow = f.store.sub_entity_closure("v1", "Host", 2).await.unwrap();
    assert_eq!(
        shallow,
        BTreeSet::from(["Disk".to_string(), "Partition".to_string()])
    );
    let deep = f.store.sub_entity_closure("v1", "Host", 5).await.unwrap();
    assert_eq!(deep.len(), 3);
}

#[tokio::test]
async fn cleanup_purges_only_stale_versions() {
    let f = fixture();
    seed_data_graph(&f.data_graph, 3).await;

    for version in ["v1", "v2"] {
        f.store
            .ensure_type_placeholders(version, &["Order".into(), "User".into()])
            .await
            .unwrap();
        f.store
            .merge_heuristics(version, vec![observation("o-1", "u-1")])
            .await
            .unwrap();
        f.store
            .record_evaluation(version, &fk_relation_id(), &accepted_evaluation())
            .await
            .unwrap();
        f.store.sync_candidate(version, &fk_relation_id()).await;
    }
    f.store.set_current_version("v2").await.unwrap();

    let report = f.store.cleanup("v2").await;
    assert!(report.failures.is_empty());
    assert!(report.candidate_nodes_deleted >= 2);
    assert!(report.kv_keys_deleted > 0);

    // v2 survives intact.
    let current = f
        .store
        .get_candidate_in("v2", &fk_relation_id())
        .await
        .unwrap();
    assert!(current.is_some());
    assert!(current.unwrap().evaluation.is_some());
    assert_eq!(f.store.current_version().await.unwrap().as_deref(), Some("v2"));

    // v1 is gone from every category.
    assert!(f
        .store
        .get_candidate_in("v1", &fk_relation_id())
        .await
        .unwrap()
        .is_none());
    let stale_edges = f
        .candidate_graph
        .find_relations(&RelationFilter::default().where_eq("_version", "v1"))
        .await
        .unwrap();
    assert!(stale_edges.is_empty());
    let stale_data = f
        .data_graph
        .find_relations(&RelationFilter::default().where_eq("_version", "v1"))
        .await
        .unwrap();
    assert!(stale_data.is_empty());
}

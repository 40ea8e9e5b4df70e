//! Property test: `cleanup(current)` never removes anything tagged with
//! the current version, regardless of how many stale versions exist, in
//! which order they were written, or how often cleanup runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use ontolink_discovery::{DeepPropertyMatch, HeuristicSink, MatchType, PropertyMapping};
use ontolink_graph::{derive_relation_id, InMemoryGraph, InMemoryKv, PropertyValue};
use ontolink_sync::CandidateStore;
use proptest::prelude::*;

fn observation(relation_seed: &str, i: usize) -> DeepPropertyMatch {
    let mapping = BTreeMap::from([(format!("ref_{relation_seed}"), "id".to_string())]);
    DeepPropertyMatch {
        entity_a_type: "Source".into(),
        entity_a_key: format!("s-{i}"),
        search_property: format!("ref_{relation_seed}"),
        search_value: format!("t-{i}"),
        entity_b_type: "Target".into(),
        entity_b_key: format!("t-{i}"),
        identity_key: BTreeMap::from([("id".to_string(), PropertyValue::str(format!("t-{i}")))]),
        matching_properties: vec![PropertyMapping {
            entity_a_property: format!("ref_{relation_seed}"),
            entity_b_idkey_property: "id".into(),
            match_type: MatchType::Exact,
            value_match_quality: 1.0,
        }],
        bm25_score: 2.0,
        deep_match_quality: 8.0,
        relation_id: derive_relation_id("Source", "Target", &mapping),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn cleanup_never_touches_the_current_version(
        stale_relations in prop::collection::vec("[a-z]{2,8}", 1..5),
        current_relations in prop::collection::vec("[a-z]{2,8}", 1..5),
        stale_first in any::<bool>(),
        run_cleanup_twice in any::<bool>(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let store = CandidateStore::new(
                Arc::new(InMemoryGraph::new()),
                Arc::new(InMemoryGraph::new()),
                Arc::new(InMemoryKv::new()),
                "prop-client",
            );

            let write = |version: &'static str, seeds: Vec<String>| {
                let store = &store;
                async move {
                    store
                        .ensure_type_placeholders(version, &["Source".into(), "Target".into()])
                        .await
                        .unwrap();
                    for (i, seed) in seeds.iter().enumerate() {
                        store
                            .merge_heuristics(version, vec![observation(seed, i)])
                            .await
                            .unwrap();
                    }
                }
            };

            if stale_first {
                write("stale", stale_relations.clone()).await;
                write("current", current_relations.clone()).await;
            } else {
                write("current", current_relations.clone()).await;
                write("stale", stale_relations.clone()).await;
            }
            store.set_current_version("current").await.unwrap();

            let report = store.cleanup("current").await;
            assert!(report.failures.is_empty());
            if run_cleanup_twice {
                let again = store.cleanup("current").await;
                assert!(again.failures.is_empty());
            }

            // Every current-version candidate survives with its data.
            for seed in &current_relations {
                let mapping = BTreeMap::from([(format!("ref_{seed}"), "id".to_string())]);
                let relation_id = derive_relation_id("Source", "Target", &mapping);
                let candidate = store
                    .get_candidate_in("current", &relation_id)
                    .await
                    .unwrap()
                    .expect("current candidate must survive cleanup");
                assert!(candidate.heuristic.total_matches > 0);
            }
            // Every stale-version candidate is gone.
            for seed in &stale_relations {
                let mapping = BTreeMap::from([(format!("ref_{seed}"), "id".to_string())]);
                let relation_id = derive_relation_id("Source", "Target", &mapping);
                assert!(store
                    .get_candidate_in("stale", &relation_id)
                    .await
                    .unwrap()
                    .is_none());
            }
            // The pointer itself is never collateral damage.
            assert_eq!(
                store.current_version().await.unwrap().as_deref(),
                Some("current")
            );
        });
    }
}

//! Relation-id derivation must be a pure content hash: invariant under
//! mapping insertion order, sensitive to every component.

use ontolink_graph::derive_relation_id;
use proptest::prelude::*;
use std::collections::BTreeMap;

fn mapping_strategy() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::vec(("[a-z_]{1,12}", "[a-z_]{1,12}"), 1..6)
}

proptest! {
    #[test]
    fn id_is_invariant_under_reordering(
        pairs in mapping_strategy(),
        type_a in "[A-Z][a-z]{1,10}",
        type_b in "[A-Z][a-z]{1,10}",
    ) {
        let forward: BTreeMap<String, String> = pairs.iter().cloned().collect();
        let reversed: BTreeMap<String, String> = pairs.iter().rev().cloned().collect();
        prop_assert_eq!(
            derive_relation_id(&type_a, &type_b, &forward),
            derive_relation_id(&type_a, &type_b, &reversed)
        );
    }

    #[test]
    fn id_distinguishes_types(
        pairs in mapping_strategy(),
        type_a in "[A-Z][a-z]{1,10}",
        type_b in "[A-Z][a-z]{1,10}",
    ) {
        prop_assume!(type_a != type_b);
        let mapping: BTreeMap<String, String> = pairs.into_iter().collect();
        prop_assert_ne!(
            derive_relation_id(&type_a, &type_b, &mapping),
            derive_relation_id(&type_b, &type_a, &mapping)
        );
    }

    #[test]
    fn id_changes_when_a_pair_changes(
        pairs in mapping_strategy(),
        type_a in "[A-Z][a-z]{1,10}",
        type_b in "[A-Z][a-z]{1,10}",
    ) {
        let base: BTreeMap<String, String> = pairs.into_iter().collect();
        let mut tweaked = base.clone();
        let (key, value) = tweaked.iter().next().map(|(k, v)| (k.clone(), v.clone())).unwrap();
        tweaked.insert(key, format!("{value}_x"));
        prop_assert_ne!(
            derive_relation_id(&type_a, &type_b, &base),
            derive_relation_id(&type_a, &type_b, &tweaked)
        );
    }
}

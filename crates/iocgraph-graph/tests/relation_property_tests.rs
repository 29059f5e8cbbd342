use iocgraph_dsl::db::{parse_database, DbGrammar, DbParseOptions};
use iocgraph_graph::build_relations;
use proptest::prelude::*;

fn pv_name() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[A-Z][A-Z0-9]{0,6}(:[A-Z0-9]{1,4})?").unwrap()
}

proptest! {
    // relations[a][b] and relations[b][a] always exist together, with the
    // field roles swapped, for arbitrary link topologies (including
    // self-links and links to records nobody defines).
    #[test]
    fn every_edge_is_mirrored(
        links in proptest::collection::btree_map(pv_name(), pv_name(), 1..8)
    ) {
        let mut text = String::new();
        for (name, target) in &links {
            text.push_str(&format!(
                "record(ai, \"{name}\") {{\n    field(INP, \"{target} CPP MS\")\n    field(FLNK, \"{target}\")\n}}\n"
            ));
        }
        let db = parse_database(&text, DbParseOptions::new("prop.db", DbGrammar::V3))
            .expect("generated text parses");
        let graph = build_relations(&db);

        for (near, peers) in &graph.relations {
            for (far, edges) in peers {
                let back = graph.edges_between(far, near);
                for edge in edges {
                    prop_assert!(
                        back.iter().any(|m| m.near_field == edge.far_field
                            && m.far_field == edge.near_field
                            && m.modifiers == edge.modifiers),
                        "missing mirror for {near}->{far} {edge:?}"
                    );
                }
            }
        }

        // Placeholder targets are exactly the linked-to names nobody defines.
        for target in &graph.unknown_targets {
            prop_assert!(!db.records.contains_key(target));
        }
    }
}

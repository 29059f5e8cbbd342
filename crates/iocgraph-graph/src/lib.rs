//! The bidirectional PV link-relationship graph.
//!
//! For every record instance, every link-typed field (input, output, forward
//! link) is parsed into a `(target, modifiers)` pair and inserted as a
//! *mirrored* pair of adjacency entries: `relations[a][b]` and
//! `relations[b][a]` are always populated together, with the field roles
//! swapped. Constant and hardware link values are skipped, and links to
//! records nobody has defined yet resolve against a synthesized placeholder
//! so the edge reconciles once the real record appears (e.g. when merging
//! graphs from several IOCs).

use iocgraph_dsl::model::{Database, LinkDirection};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One directed link, stored on both endpoints with roles swapped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationEdge {
    /// Field on the record this adjacency entry hangs off.
    pub near_field: String,
    /// Field on the other record.
    pub far_field: String,
    /// Link modifiers (`CPP`, `MS`, `NPP`, ...), in link order.
    pub modifiers: Vec<String>,
}

/// `record -> record -> edges`, symmetric by construction.
pub type PVRelations = BTreeMap<String, BTreeMap<String, Vec<RelationEdge>>>;

/// A parsed link-field value that references another record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    pub record: String,
    /// Explicit `RECORD.FIELD` target field, when given.
    pub field: Option<String>,
    pub modifiers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PVRelationGraph {
    pub relations: PVRelations,
    /// Link targets that no loaded record defines; their `VAL`/`PROC` far
    /// fields are placeholders of dtype `"unknown"` until reconciled.
    pub unknown_targets: BTreeSet<String>,
}

impl PVRelationGraph {
    /// Insert the mirrored adjacency pair for one resolved link.
    pub fn add_edge(
        &mut self,
        near_record: &str,
        near_field: &str,
        far_record: &str,
        far_field: &str,
        modifiers: &[String],
    ) {
        let forward = RelationEdge {
            near_field: near_field.to_string(),
            far_field: far_field.to_string(),
            modifiers: modifiers.to_vec(),
        };
        let mirrored = RelationEdge {
            near_field: far_field.to_string(),
            far_field: near_field.to_string(),
            modifiers: modifiers.to_vec(),
        };
        push_unique(
            self.relations
                .entry(near_record.to_string())
                .or_default()
                .entry(far_record.to_string())
                .or_default(),
            forward,
        );
        push_unique(
            self.relations
                .entry(far_record.to_string())
                .or_default()
                .entry(near_record.to_string())
                .or_default(),
            mirrored,
        );
    }

    pub fn edges_between(&self, a: &str, b: &str) -> &[RelationEdge] {
        self.relations
            .get(a)
            .and_then(|peers| peers.get(b))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Drop placeholder status for targets that are now defined.
    pub fn reconcile(&mut self, known_records: &BTreeSet<String>) {
        self.unknown_targets
            .retain(|name| !known_records.contains(name));
    }
}

fn push_unique(edges: &mut Vec<RelationEdge>, edge: RelationEdge) {
    if !edges.contains(&edge) {
        edges.push(edge);
    }
}

/// Parse a link-field value into its target reference.
///
/// Non-reference forms return `None` (not an error): empty values, numeric
/// constants, hardware links (`@...`, `#...`) and JSON link specifications.
pub fn parse_link(value: &str) -> Option<LinkTarget> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('@') || trimmed.starts_with('#') {
        return None;
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return None;
    }
    if trimmed.parse::<f64>().is_ok() {
        return None;
    }

    let mut tokens = trimmed.split_whitespace();
    let target = tokens.next()?;
    let modifiers: Vec<String> = tokens.map(str::to_string).collect();

    let (record, field) = match target.split_once('.') {
        Some((record, field)) if !record.is_empty() && !field.is_empty() => {
            (record.to_string(), Some(field.to_string()))
        }
        _ => (target.to_string(), None),
    };
    Some(LinkTarget {
        record,
        field,
        modifiers,
    })
}

/// Whether `name` looks like a link field, used when no record-type
/// definition is available to say so authoritatively.
fn heuristic_link_direction(name: &str) -> Option<LinkDirection> {
    if name == "FLNK" {
        return Some(LinkDirection::Forward);
    }
    if name.len() == 4 && name.starts_with("LNK") {
        // Fanout LNK1..LNKF forward links.
        return Some(LinkDirection::Forward);
    }
    if name.starts_with("INP") || matches!(name, "DOL" | "SDIS" | "TSEL" | "SELL") {
        return Some(LinkDirection::Input);
    }
    if name.starts_with("OUT") {
        return Some(LinkDirection::Output);
    }
    None
}

/// Build the relation graph for one merged database.
pub fn build_relations(database: &Database) -> PVRelationGraph {
    let mut graph = PVRelationGraph::default();

    for record in database.records.values() {
        let record_type = database.record_types.get(&record.record_type);
        for field in record.fields.values() {
            let direction = match record_type {
                Some(rt) => rt
                    .fields
                    .get(&field.name)
                    .and_then(|def| def.link_direction()),
                None => heuristic_link_direction(&field.name),
            };
            let Some(direction) = direction else {
                continue;
            };
            let Some(target) = parse_link(&field.value) else {
                continue;
            };

            let far_record = database.canonical_name(&target.record).to_string();
            let far_field = match (&target.field, direction) {
                (Some(explicit), _) => explicit.clone(),
                (None, LinkDirection::Forward) => "PROC".to_string(),
                (None, _) => "VAL".to_string(),
            };
            if !database.records.contains_key(&far_record) {
                graph.unknown_targets.insert(far_record.clone());
            }
            graph.add_edge(
                &record.name,
                &field.name,
                &far_record,
                &far_field,
                &target.modifiers,
            );
        }
    }

    graph
}

/// Merge independently built per-IOC graphs into `dest`, folding aliases so
/// a link expressed via an alias lands on the canonical record.
pub fn combine_relations(
    dest: &mut PVRelationGraph,
    others: impl IntoIterator<Item = PVRelationGraph>,
    aliases: &BTreeMap<String, String>,
) {
    let resolve = |name: &str| -> String {
        aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    };

    // Fold dest itself first so pre-merge alias edges collapse too.
    let mut folded = PVRelationGraph {
        relations: PVRelations::new(),
        unknown_targets: BTreeSet::new(),
    };
    let existing = std::mem::take(dest);
    for graph in std::iter::once(existing).chain(others) {
        for (a, peers) in graph.relations {
            let a = resolve(&a);
            for (b, edges) in peers {
                let b = resolve(&b);
                let slot = folded
                    .relations
                    .entry(a.clone())
                    .or_default()
                    .entry(b)
                    .or_default();
                for edge in edges {
                    push_unique(slot, edge);
                }
            }
        }
        for target in graph.unknown_targets {
            folded.unknown_targets.insert(resolve(&target));
        }
    }
    *dest = folded;
}

#[cfg(test)]
mod tests {
    use super::*;
    use iocgraph_dsl::db::{parse_database, DbGrammar, DbParseOptions};

    fn db(text: &str) -> Database {
        parse_database(text, DbParseOptions::new("graph.db", DbGrammar::V3)).expect("parse")
    }

    #[test]
    fn input_link_with_modifiers_builds_mirrored_edges() {
        let database = db(
            r#"
record(ai, "A") {
    field(INP, "B CPP MS")
}
record(ao, "B") {
    field(VAL, "20")
}
"#,
        );
        let graph = build_relations(&database);
        assert_eq!(
            graph.edges_between("A", "B"),
            &[RelationEdge {
                near_field: "INP".to_string(),
                far_field: "VAL".to_string(),
                modifiers: vec!["CPP".to_string(), "MS".to_string()],
            }]
        );
        assert_eq!(
            graph.edges_between("B", "A"),
            &[RelationEdge {
                near_field: "VAL".to_string(),
                far_field: "INP".to_string(),
                modifiers: vec!["CPP".to_string(), "MS".to_string()],
            }]
        );
        assert!(graph.unknown_targets.is_empty());
    }

    #[test]
    fn mirror_invariant_holds_for_every_pair() {
        let database = db(
            r#"
record(calc, "C") {
    field(INPA, "A")
    field(INPB, "B.RVAL NPP")
    field(FLNK, "D")
    field(OUT, "E PP")
}
"#,
        );
        let graph = build_relations(&database);
        for (a, peers) in &graph.relations {
            for (b, edges) in peers {
                let back = graph.edges_between(b, a);
                for edge in edges {
                    assert!(
                        back.iter().any(|m| m.near_field == edge.far_field
                            && m.far_field == edge.near_field
                            && m.modifiers == edge.modifiers),
                        "missing mirror for {a}->{b} {edge:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn forward_links_default_to_proc_and_explicit_fields_win() {
        let database = db(
            r#"
record(ai, "A") {
    field(FLNK, "B")
    field(INP, "C.RVAL")
}
"#,
        );
        let graph = build_relations(&database);
        assert_eq!(graph.edges_between("A", "B")[0].far_field, "PROC");
        assert_eq!(graph.edges_between("A", "C")[0].far_field, "RVAL");
        // Neither B nor C is defined here.
        assert_eq!(graph.unknown_targets.len(), 2);
    }

    #[test]
    fn constants_and_hardware_links_are_skipped() {
        let database = db(
            r##"
record(ao, "A") {
    field(DOL, "42")
    field(OUT, "@asyn(PORT,0) SOMETHING")
}
record(bi, "B") {
    field(INP, "#C0 S1")
}
"##,
        );
        let graph = build_relations(&database);
        assert!(graph.relations.is_empty());
    }

    #[test]
    fn definition_overrides_name_heuristics() {
        let database = db(
            r#"
recordtype(odd) {
    field(XLNK, DBF_INLINK) {
        prompt("Odd input")
    }
    field(INPQ, DBF_STRING) {
        prompt("Not a link")
    }
}
record(odd, "A") {
    field(XLNK, "B")
    field(INPQ, "C")
}
"#,
        );
        let graph = build_relations(&database);
        assert_eq!(graph.edges_between("A", "B").len(), 1);
        assert!(graph.edges_between("A", "C").is_empty());
    }

    #[test]
    fn links_via_aliases_fold_onto_canonical_records() {
        let database = db(
            r#"
record(ai, "REAL") {
}
alias("REAL", "NICKNAME")
record(ai, "READER") {
    field(INP, "NICKNAME CP")
}
"#,
        );
        let graph = build_relations(&database);
        assert_eq!(graph.edges_between("READER", "REAL").len(), 1);
        assert!(graph.edges_between("READER", "NICKNAME").is_empty());
    }

    #[test]
    fn combine_merges_and_reconciles_unknown_targets() {
        let ioc_a = db("record(ai, \"A\") {\n    field(INP, \"B\")\n}\n");
        let ioc_b = db("record(ao, \"B\") {\n}\n");

        let mut combined = build_relations(&ioc_a);
        assert!(combined.unknown_targets.contains("B"));

        combine_relations(
            &mut combined,
            vec![build_relations(&ioc_b)],
            &BTreeMap::new(),
        );
        let known: BTreeSet<String> =
            ["A", "B"].into_iter().map(str::to_string).collect();
        combined.reconcile(&known);
        assert!(combined.unknown_targets.is_empty());
        assert_eq!(combined.edges_between("A", "B").len(), 1);
    }

    #[test]
    fn combine_is_idempotent_for_identical_graphs() {
        let database = db("record(ai, \"A\") {\n    field(INP, \"B MS\")\n}\n");
        let mut dest = build_relations(&database);
        combine_relations(&mut dest, vec![build_relations(&database)], &BTreeMap::new());
        assert_eq!(dest.edges_between("A", "B").len(), 1);
        assert_eq!(dest.edges_between("B", "A").len(), 1);
    }
}

use iocgraph_dsl::context::FullLoadContext;
use iocgraph_dsl::db::{parse_database, DbGrammar, DbParseOptions};
use iocgraph_dsl::format::format_database;
use proptest::prelude::*;
use std::collections::BTreeMap;

#[test]
fn parses_a_nested_include_context() {
    let base = FullLoadContext::single("st.cmd", 42);
    let db = parse_database(
        "record(ai, \"A\") {\n    field(DESC, \"d\")\n}\n",
        DbParseOptions::new("ioc.db", DbGrammar::V3).with_base_context(base),
    )
    .expect("parse");
    let record = &db.records["A"];
    assert_eq!(record.context.to_string(), "st.cmd:42 ioc.db:1");
    assert_eq!(
        record.fields["DESC"].context.to_string(),
        "st.cmd:42 ioc.db:2"
    );
}

#[test]
fn lint_uses_an_external_definition() {
    let dbd = parse_database(
        r#"
recordtype(ao) {
    field(VAL, DBF_DOUBLE) {
        prompt("Value")
    }
    field(OUT, DBF_OUTLINK) {
        prompt("Output Specification")
    }
}
"#,
        DbParseOptions::new("soft.dbd", DbGrammar::V3),
    )
    .expect("dbd");

    let db = parse_database(
        r#"
record(ao, "OUT:1") {
    field(VAL, "not-a-number")
    field(BOGUS, "x")
}
"#,
        DbParseOptions::new("ioc.db", DbGrammar::V3).with_definition(&dbd),
    )
    .expect("db");

    let codes: Vec<&str> = db.lint.warnings.iter().map(|w| w.code.as_str()).collect();
    assert!(codes.contains(&"bad-field-value"), "codes={codes:?}");
    assert!(codes.contains(&"unknown-field"), "codes={codes:?}");
    assert_eq!(db.records["OUT:1"].fields["VAL"].dtype, "DBF_DOUBLE");
    assert!(db.lint.success());
}

#[test]
fn merge_resolves_star_redefinitions_across_files() {
    let mut running = parse_database(
        "record(ai, \"X\") {\n    field(DESC, \"one\")\n}\n",
        DbParseOptions::new("first.db", DbGrammar::V3),
    )
    .expect("first");
    let second = parse_database(
        "record(\"*\", \"X\") {\n    field(EGU, \"mm\")\n}\n",
        DbParseOptions::new("second.db", DbGrammar::V3),
    )
    .expect("second");

    running.merge(second);
    let record = &running.records["X"];
    assert_eq!(record.record_type, "ai");
    assert_eq!(record.fields.len(), 2);
    assert!(record.context.to_string().contains("first.db:1"));
    assert!(record.context.to_string().contains("second.db:1"));
}

#[test]
fn formatting_is_a_fixed_point() {
    let text = r#"
record(calc, "SUM") {
    field(CALC, "A+B")
    field(INPA, "X:1 NPP NMS")
    field(INPB, "X:2")
}
"#;
    let first =
        parse_database(text, DbParseOptions::new("a.db", DbGrammar::V3)).expect("parse");
    let rendered = format_database(&first);
    let second =
        parse_database(&rendered, DbParseOptions::new("b.db", DbGrammar::V3)).expect("reparse");
    assert_eq!(format_database(&second), rendered);
}

fn record_name() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[A-Z][A-Za-z0-9_]{0,6}(:[A-Za-z0-9_]{1,6})?").unwrap()
}

fn field_name() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[A-Z][A-Z0-9]{0,5}").unwrap()
}

fn field_value() -> impl Strategy<Value = String> {
    // Values exercise spaces, link modifiers, quotes-needing punctuation.
    proptest::string::string_regex("[A-Za-z0-9_:. /+-]{0,18}").unwrap()
}

proptest! {
    // Parsing then re-serializing and re-parsing yields an equal instance
    // set, for arbitrary generated databases.
    #[test]
    fn reserialization_preserves_the_instance_set(
        records in proptest::collection::btree_map(
            record_name(),
            proptest::collection::btree_map(field_name(), field_value(), 0..5),
            1..6
        )
    ) {
        let mut text = String::new();
        for (name, fields) in &records {
            text.push_str(&format!("record(ai, \"{name}\") {{\n"));
            for (fname, value) in fields {
                text.push_str(&format!("    field({fname}, \"{value}\")\n"));
            }
            text.push_str("}\n");
        }

        let first = parse_database(&text, DbParseOptions::new("gen.db", DbGrammar::V3))
            .expect("generated text parses");
        let rendered = format_database(&first);
        let second = parse_database(&rendered, DbParseOptions::new("re.db", DbGrammar::V3))
            .expect("rendered text parses");

        let flatten = |db: &iocgraph_dsl::model::Database| -> BTreeMap<String, BTreeMap<String, String>> {
            db.records
                .iter()
                .map(|(name, record)| {
                    (
                        name.clone(),
                        record
                            .fields
                            .iter()
                            .map(|(f, v)| (f.clone(), v.value.clone()))
                            .collect(),
                    )
                })
                .collect()
        };
        prop_assert_eq!(flatten(&first), flatten(&second));
    }
}

//! Database text formatting.
//!
//! Renders a [`Database`]'s record instances back into `.db` text. The
//! formatter is deliberately conservative: captured doc comments are written
//! back above their declaration, fields and info nodes come out in canonical
//! (sorted) order, and values are always quoted so the output re-parses under
//! either grammar version.

use crate::model::{Database, RecordInstance};
use std::fmt::Write;

/// Render every record instance (and standalone aliases) as `.db` text.
pub fn format_database(db: &Database) -> String {
    let mut out = String::new();
    for record in db.records.values() {
        out.push_str(&format_record(record));
        out.push('\n');
    }

    let mut standalone: Vec<(&String, &String)> = db
        .aliases
        .iter()
        .filter(|(alias, canonical)| {
            db.records
                .get(*canonical)
                .map(|r| !r.aliases.contains(alias))
                .unwrap_or(true)
        })
        .collect();
    standalone.sort();
    for (alias, canonical) in standalone {
        let _ = writeln!(out, "alias({}, {})", quote(canonical), quote(alias));
    }
    out
}

/// Render one record instance.
pub fn format_record(record: &RecordInstance) -> String {
    let mut out = String::new();
    for doc in &record.docs {
        let _ = writeln!(out, "# {doc}");
    }
    let _ = writeln!(
        out,
        "record({}, {}) {{",
        record.record_type,
        quote(&record.name)
    );
    for field in record.fields.values() {
        let _ = writeln!(out, "    field({}, {})", field.name, quote(&field.value));
    }
    for (name, info) in &record.info {
        // JSON info values re-parse only unquoted.
        if info.value.starts_with('{') || info.value.starts_with('[') {
            let _ = writeln!(out, "    info({}, {})", name, info.value);
        } else {
            let _ = writeln!(out, "    info({}, {})", name, quote(&info.value));
        }
    }
    for alias in &record.aliases {
        let _ = writeln!(out, "    alias({})", quote(alias));
    }
    out.push_str("}\n");
    out
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{parse_database, DbGrammar, DbParseOptions};

    #[test]
    fn format_then_reparse_preserves_instances() {
        let text = r#"
# Upstream flow
record(ai, "FLOW:1") {
    field(DESC, "Flow \"A\"")
    field(INP, "FLOW:RAW CPP MS")
    info(autosaveFields, "PREC")
    alias("FLOW:ONE")
}
alias("FLOW:1", "FLOW:UNO")
"#;
        let first =
            parse_database(text, DbParseOptions::new("a.db", DbGrammar::V3)).expect("parse");
        let rendered = format_database(&first);
        let second = parse_database(&rendered, DbParseOptions::new("b.db", DbGrammar::V3))
            .expect("reparse");

        assert_eq!(first.records.len(), second.records.len());
        for (name, record) in &first.records {
            let other = &second.records[name];
            assert_eq!(record.record_type, other.record_type);
            assert_eq!(record.aliases, other.aliases);
            assert_eq!(record.docs, other.docs);
            for (fname, field) in &record.fields {
                assert_eq!(field.value, other.fields[fname].value, "field {fname}");
            }
        }
        assert_eq!(first.aliases, second.aliases);
    }
}

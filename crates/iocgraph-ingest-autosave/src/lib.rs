//! Autosave restore-file (`.sav`) discovery for iocgraph.
//!
//! Extracts saved PV values from autosave snapshots:
//! - `PV[.FIELD] value` rows -> restored values (field defaults to `VAL`)
//! - `@array@ { "a" "b" }` values -> array restores
//! - `! ...` rows -> disconnected/error channels
//! - `<END>` marker -> file-complete detection

use anyhow::{bail, Result};
use iocgraph_dsl::context::{FullLoadContext, LoadContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// End-of-file marker a complete snapshot carries.
pub const END_MARKER: &str = "<END>";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RestoreValue {
    Scalar(String),
    Array(Vec<String>),
}

/// One restored `(record, field)` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreEntry {
    pub record: String,
    pub field: String,
    pub value: RestoreValue,
    pub context: FullLoadContext,
}

/// A parsed autosave snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreFile {
    pub filename: String,
    /// record -> field -> restored value
    pub values: BTreeMap<String, BTreeMap<String, RestoreEntry>>,
    /// Channels the snapshot recorded as disconnected or in error.
    pub disconnected: Vec<String>,
    pub comments: Vec<String>,
    /// Whether the `<END>` marker was seen (an incomplete snapshot usually
    /// means the IOC died mid-save).
    pub complete: bool,
}

impl RestoreFile {
    pub fn entry(&self, record: &str, field: &str) -> Option<&RestoreEntry> {
        self.values.get(record).and_then(|fields| fields.get(field))
    }

    /// Record names touched by this snapshot, for annotation.
    pub fn record_names(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }
}

/// Parse autosave restore text.
pub fn parse_autosave(
    text: &str,
    source: &str,
    base_context: &FullLoadContext,
) -> Result<RestoreFile> {
    let mut restore = RestoreFile {
        filename: source.to_string(),
        ..RestoreFile::default()
    };

    let lines: Vec<&str> = text.lines().collect();
    let mut i = 0usize;
    while i < lines.len() {
        let line_no = i + 1;
        let line = lines[i].trim();
        i += 1;

        if line.is_empty() {
            continue;
        }
        if line == END_MARKER {
            restore.complete = true;
            continue;
        }
        if let Some(comment) = line.strip_prefix('#') {
            restore.comments.push(comment.trim().to_string());
            continue;
        }
        if let Some(err) = line.strip_prefix('!') {
            restore.disconnected.push(err.trim().to_string());
            continue;
        }

        let (pvname, rest) = match line.split_once(char::is_whitespace) {
            Some((pvname, rest)) => (pvname, rest.trim()),
            // A bare PV name restores an empty scalar.
            None => (line, ""),
        };

        let mut value_text = rest.to_string();
        if value_text.starts_with("@array@") {
            // Arrays occasionally wrap; join until the braces balance.
            while !brace_balanced(&value_text) && i < lines.len() {
                value_text.push(' ');
                value_text.push_str(lines[i].trim());
                i += 1;
            }
            if !brace_balanced(&value_text) {
                bail!("{source}:{line_no}: unterminated @array@ value");
            }
        }

        let (record, field) = split_pvname(pvname);
        let context = base_context.pushed(LoadContext::new(source.to_string(), line_no));
        let value = parse_value(&value_text);
        restore.values.entry(record.clone()).or_default().insert(
            field.clone(),
            RestoreEntry {
                record,
                field,
                value,
                context,
            },
        );
    }

    Ok(restore)
}

/// `PV.FIELD` -> `(PV, FIELD)`; the field defaults to `VAL`.
fn split_pvname(pvname: &str) -> (String, String) {
    match pvname.rsplit_once('.') {
        Some((record, field)) if !field.is_empty() => (record.to_string(), field.to_string()),
        _ => (pvname.to_string(), "VAL".to_string()),
    }
}

fn parse_value(text: &str) -> RestoreValue {
    if let Some(rest) = text.strip_prefix("@array@") {
        let inner = rest
            .trim()
            .strip_prefix('{')
            .and_then(|r| r.trim_end().strip_suffix('}'))
            .unwrap_or("");
        return RestoreValue::Array(split_elements(inner));
    }
    RestoreValue::Scalar(unquote(text))
}

fn split_elements(inner: &str) -> Vec<String> {
    let mut elements = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut escaped = false;
    let mut have = false;
    for c in inner.chars() {
        if in_quote {
            if escaped {
                current.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quote = false;
            } else {
                current.push(c);
            }
            continue;
        }
        match c {
            '"' => {
                in_quote = true;
                have = true;
            }
            c if c.is_whitespace() => {
                if have {
                    elements.push(std::mem::take(&mut current));
                    have = false;
                }
            }
            _ => {
                current.push(c);
                have = true;
            }
        }
    }
    if have {
        elements.push(current);
    }
    elements
}

fn brace_balanced(text: &str) -> bool {
    let mut depth = 0isize;
    let mut in_quote = false;
    let mut escaped = false;
    for c in text.chars() {
        if in_quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quote = false;
            }
            continue;
        }
        match c {
            '"' => in_quote = true,
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
    }
    depth == 0
}

fn unquote(text: &str) -> String {
    let bytes = text.as_bytes();
    if bytes.len() >= 2 && bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"' {
        return text[1..text.len() - 1].replace("\\\"", "\"");
    }
    text.to_string()
}

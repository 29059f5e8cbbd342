//! Record database (`.db`) and database definition (`.dbd`) grammar.
//!
//! The two supported grammar versions share one parser:
//!
//! - `V3`: classic syntax, bare unquoted field values allowed
//! - `V4`: additionally accepts JSON-style values on `field`/`info` and
//!   `link(name, handler)` declarations
//!
//! The driver walks the text line by line, collecting balanced blocks where a
//! declaration spans lines, and uses nom combinators for the in-line forms.
//! Grammar-level malformation is fatal to the one file ([`DbParseError`]);
//! semantic problems (unknown record type, unknown field, suspicious value)
//! are recorded on the returned database's lint result and never abort the
//! walk.

use crate::context::{FullLoadContext, LoadContext};
use crate::model::{
    Breaktable, Database, DeviceSupport, InfoEntry, LinkSupport, Menu, NamedDecl, PVAFieldReference,
    PVAGroup, RecordField, RecordInstance, RecordType, RecordTypeField, VariableDecl,
};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char as pchar, multispace0},
    combinator::{all_consuming, opt, recognize},
    sequence::tuple,
    IResult,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported database grammar versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbGrammar {
    V3,
    V4,
}

#[derive(Debug, Error)]
pub enum DbParseError {
    #[error("{file}:{line}: {message}")]
    Line {
        file: String,
        line: usize,
        message: String,
    },
}

/// Parse options for one database file.
pub struct DbParseOptions<'a> {
    /// Name recorded in every context produced by this parse.
    pub source: String,
    pub grammar: DbGrammar,
    /// The include stack leading to this file (empty for a top-level parse).
    pub base_context: FullLoadContext,
    /// Record-type definitions to lint instances against, when available.
    pub definition: Option<&'a Database>,
}

impl<'a> DbParseOptions<'a> {
    pub fn new(source: impl Into<String>, grammar: DbGrammar) -> Self {
        Self {
            source: source.into(),
            grammar,
            base_context: FullLoadContext::empty(),
            definition: None,
        }
    }

    pub fn with_definition(mut self, definition: &'a Database) -> Self {
        self.definition = Some(definition);
        self
    }

    pub fn with_base_context(mut self, base: FullLoadContext) -> Self {
        self.base_context = base;
        self
    }
}

/// Parse one database / database-definition file.
pub fn parse_database(text: &str, opts: DbParseOptions<'_>) -> Result<Database, DbParseError> {
    let mut driver = Driver {
        lines: text.lines().collect(),
        source: opts.source,
        grammar: opts.grammar,
        base: opts.base_context,
        db: Database::default(),
        pending_comments: Vec::new(),
        index: 0,
    };
    driver.run()?;
    if let Some(definition) = opts.definition {
        lint_against_definition(&mut driver.db, definition);
    } else {
        let snapshot = driver.db.clone();
        lint_against_definition(&mut driver.db, &snapshot);
    }
    promote_pva_groups(&mut driver.db);
    Ok(driver.db)
}

struct Driver<'a> {
    lines: Vec<&'a str>,
    source: String,
    grammar: DbGrammar,
    base: FullLoadContext,
    db: Database,
    pending_comments: Vec<String>,
    index: usize,
}

impl Driver<'_> {
    fn context(&self, line_no: usize) -> FullLoadContext {
        self.base.pushed(LoadContext::new(self.source.clone(), line_no))
    }

    fn err(&self, line_no: usize, message: impl Into<String>) -> DbParseError {
        DbParseError::Line {
            file: self.source.clone(),
            line: line_no,
            message: message.into(),
        }
    }

    fn run(&mut self) -> Result<(), DbParseError> {
        while self.index < self.lines.len() {
            let line_no = self.index + 1;
            let raw = self.lines[self.index];
            let line = strip_trailing_comment(raw).trim();

            if line.is_empty() {
                // A blank line breaks comment attachment.
                if raw.trim().is_empty() {
                    self.pending_comments.clear();
                }
                if let Some(comment) = comment_text(raw) {
                    self.pending_comments.push(comment);
                }
                self.index += 1;
                continue;
            }

            if line.starts_with("recordtype") {
                self.parse_recordtype_block(line_no)?;
                continue;
            }
            if line.starts_with("record") || line.starts_with("grecord") {
                self.parse_record_block(line_no)?;
                continue;
            }
            if line.starts_with("menu") {
                self.parse_menu_block(line_no)?;
                continue;
            }
            if line.starts_with("breaktable") {
                self.parse_breaktable_block(line_no)?;
                continue;
            }
            if line.starts_with("device") {
                let (call, next) = self.collect_call(self.index)?;
                self.reduce_device(&call, line_no)?;
                self.index = next;
                continue;
            }
            if line.starts_with("driver")
                || line.starts_with("registrar")
                || line.starts_with("function")
                || line.starts_with("variable")
                || line.starts_with("link")
            {
                let (call, next) = self.collect_call(self.index)?;
                self.reduce_named_decl(&call, line_no)?;
                self.index = next;
                continue;
            }
            if line.starts_with("alias") {
                let (call, next) = self.collect_call(self.index)?;
                self.reduce_standalone_alias(&call, line_no)?;
                self.index = next;
                continue;
            }
            if let Some(rest) = line.strip_prefix("include").map(str::trim) {
                let file = parse_string_directive(rest)
                    .map_err(|m| self.err(line_no, format!("include: {m}")))?;
                self.db.includes.push(NamedDecl {
                    name: file,
                    context: self.context(line_no),
                });
                self.index += 1;
                continue;
            }
            if let Some(rest) = line.strip_prefix("addpath").map(str::trim) {
                let path = parse_string_directive(rest)
                    .map_err(|m| self.err(line_no, format!("addpath: {m}")))?;
                self.db.addpaths.push(path);
                self.index += 1;
                continue;
            }
            if let Some(rest) = line.strip_prefix("path").map(str::trim) {
                let path = parse_string_directive(rest)
                    .map_err(|m| self.err(line_no, format!("path: {m}")))?;
                self.db.paths.push(path);
                self.index += 1;
                continue;
            }

            return Err(self.err(line_no, format!("unrecognized declaration: {line}")));
        }
        Ok(())
    }

    /// Collect one `keyword(args...)` call that may span lines; returns the
    /// joined call text and the next line index.
    fn collect_call(&self, start: usize) -> Result<(String, usize), DbParseError> {
        let mut combined = String::new();
        let mut i = start;
        while i < self.lines.len() {
            let piece = strip_trailing_comment(self.lines[i]);
            if !combined.is_empty() {
                combined.push(' ');
            }
            combined.push_str(piece.trim());
            i += 1;
            if parens_balanced(&combined) {
                return Ok((combined, i));
            }
        }
        Err(self.err(start + 1, "unterminated declaration"))
    }

    fn parse_record_block(&mut self, header_line: usize) -> Result<(), DbParseError> {
        let (call, mut i) = self.collect_call(self.index)?;
        let (record_type, name) = parse_record_header(&call)
            .map_err(|m| self.err(header_line, format!("record: {m}")))?;

        let mut record = RecordInstance::new(name, record_type, self.context(header_line));
        record.docs = std::mem::take(&mut self.pending_comments);

        // The opening brace may trail the header or sit on its own line.
        if !call.trim_end().ends_with('{') {
            i = self.expect_open_brace(i)?;
        }

        while i < self.lines.len() {
            let line_no = i + 1;
            let raw = self.lines[i];
            let line = strip_trailing_comment(raw).trim();
            if line.is_empty() {
                i += 1;
                continue;
            }
            if line == "}" {
                i += 1;
                self.index = i;
                self.insert_record(record);
                return Ok(());
            }
            let (call, next) = self.collect_body_call(i)?;
            i = next;
            if let Some(args) = call_args(&call, "field") {
                let (fname, value) = parse_two_args(&args, self.grammar)
                    .map_err(|m| self.err(line_no, format!("field: {m}")))?;
                record.fields.insert(
                    fname.clone(),
                    RecordField {
                        name: fname,
                        dtype: String::new(),
                        value,
                        context: self.context(line_no),
                    },
                );
                continue;
            }
            if let Some(args) = call_args(&call, "info") {
                let (iname, value) = parse_two_args(&args, DbGrammar::V4)
                    .map_err(|m| self.err(line_no, format!("info: {m}")))?;
                record.info.insert(
                    iname,
                    InfoEntry {
                        value,
                        context: self.context(line_no),
                    },
                );
                continue;
            }
            if let Some(args) = call_args(&call, "alias") {
                let alias = parse_one_arg(&args)
                    .map_err(|m| self.err(line_no, format!("alias: {m}")))?;
                self.db.aliases.insert(alias.clone(), record.name.clone());
                record.aliases.push(alias);
                continue;
            }
            return Err(self.err(line_no, format!("unrecognized record body line: {line}")));
        }
        Err(self.err(header_line, "unterminated record block"))
    }

    fn insert_record(&mut self, record: RecordInstance) {
        use std::collections::btree_map::Entry;
        match self.db.records.entry(record.name.clone()) {
            Entry::Occupied(mut e) => e.get_mut().merge_from(record),
            Entry::Vacant(e) => {
                e.insert(record);
            }
        }
    }

    fn parse_recordtype_block(&mut self, header_line: usize) -> Result<(), DbParseError> {
        let (call, mut i) = self.collect_call(self.index)?;
        let args = call_args(&call, "recordtype")
            .ok_or_else(|| self.err(header_line, "recordtype: malformed header"))?;
        let type_name = parse_one_arg(&args)
            .map_err(|m| self.err(header_line, format!("recordtype: {m}")))?;

        let mut rt = RecordType {
            name: type_name,
            context: self.context(header_line),
            ..RecordType::default()
        };

        if !call.trim_end().ends_with('{') {
            i = self.expect_open_brace(i)?;
        }

        while i < self.lines.len() {
            let line_no = i + 1;
            let line = strip_trailing_comment(self.lines[i]).trim().to_string();
            if line.is_empty() {
                i += 1;
                continue;
            }
            if line == "}" {
                i += 1;
                self.index = i;
                self.db.record_types.insert(rt.name.clone(), rt);
                return Ok(());
            }
            if let Some(cdef) = line.strip_prefix('%') {
                rt.cdefs.push(cdef.trim().to_string());
                i += 1;
                continue;
            }
            if let Some(rest) = line.strip_prefix("include").map(str::trim) {
                let file = parse_string_directive(rest)
                    .map_err(|m| self.err(line_no, format!("include: {m}")))?;
                self.db.includes.push(NamedDecl {
                    name: file,
                    context: self.context(line_no),
                });
                i += 1;
                continue;
            }
            if line.starts_with("field") {
                let (block, next) = self.collect_braced_block(i)?;
                i = next;
                let field = parse_recordtype_field(&block, self.context(line_no))
                    .map_err(|m| self.err(line_no, format!("field: {m}")))?;
                rt.fields.insert(field.name.clone(), field);
                continue;
            }
            return Err(self.err(line_no, format!("unrecognized recordtype body line: {line}")));
        }
        Err(self.err(header_line, "unterminated recordtype block"))
    }

    fn parse_menu_block(&mut self, header_line: usize) -> Result<(), DbParseError> {
        let (call, mut i) = self.collect_call(self.index)?;
        let args = call_args(&call, "menu")
            .ok_or_else(|| self.err(header_line, "menu: malformed header"))?;
        let name = parse_one_arg(&args).map_err(|m| self.err(header_line, format!("menu: {m}")))?;

        let mut menu = Menu {
            name,
            choices: Vec::new(),
            context: self.context(header_line),
        };

        if !call.trim_end().ends_with('{') {
            i = self.expect_open_brace(i)?;
        }

        while i < self.lines.len() {
            let line_no = i + 1;
            let line = strip_trailing_comment(self.lines[i]).trim().to_string();
            if line.is_empty() {
                i += 1;
                continue;
            }
            if line == "}" {
                i += 1;
                self.index = i;
                self.db.menus.insert(menu.name.clone(), menu);
                return Ok(());
            }
            let (call, next) = self.collect_body_call(i)?;
            i = next;
            if let Some(args) = call_args(&call, "choice") {
                let (id, label) = parse_two_args(&args, DbGrammar::V3)
                    .map_err(|m| self.err(line_no, format!("choice: {m}")))?;
                menu.choices.push((id, label));
                continue;
            }
            if let Some(rest) = call.strip_prefix("include").map(str::trim) {
                let file = parse_string_directive(rest)
                    .map_err(|m| self.err(line_no, format!("include: {m}")))?;
                self.db.includes.push(NamedDecl {
                    name: file,
                    context: self.context(line_no),
                });
                continue;
            }
            return Err(self.err(line_no, format!("unrecognized menu body line: {line}")));
        }
        Err(self.err(header_line, "unterminated menu block"))
    }

    fn parse_breaktable_block(&mut self, header_line: usize) -> Result<(), DbParseError> {
        let (call, mut i) = self.collect_call(self.index)?;
        let args = call_args(&call, "breaktable")
            .ok_or_else(|| self.err(header_line, "breaktable: malformed header"))?;
        let name =
            parse_one_arg(&args).map_err(|m| self.err(header_line, format!("breaktable: {m}")))?;

        let mut table = Breaktable {
            name,
            values: Vec::new(),
            context: self.context(header_line),
        };

        if !call.trim_end().ends_with('{') {
            i = self.expect_open_brace(i)?;
        }

        while i < self.lines.len() {
            let line = strip_trailing_comment(self.lines[i]).trim().to_string();
            if line == "}" {
                i += 1;
                self.index = i;
                self.db.breaktables.insert(table.name.clone(), table);
                return Ok(());
            }
            for token in line.split_whitespace() {
                table.values.push(token.trim_matches(',').to_string());
            }
            i += 1;
        }
        Err(self.err(header_line, "unterminated breaktable block"))
    }

    /// Body calls (`field(...)`, `info(...)`) may span lines when a V4 JSON
    /// value does; join until parens and braces balance.
    fn collect_body_call(&self, start: usize) -> Result<(String, usize), DbParseError> {
        let mut combined = String::new();
        let mut i = start;
        while i < self.lines.len() {
            let piece = strip_trailing_comment(self.lines[i]);
            if !combined.is_empty() {
                combined.push(' ');
            }
            combined.push_str(piece.trim());
            i += 1;
            if parens_balanced(&combined) && braces_balanced(&combined) {
                return Ok((combined, i));
            }
        }
        Err(self.err(start + 1, "unterminated body declaration"))
    }

    /// Collect a `field(...) { ... }` block of a recordtype, which may be
    /// braceless, single-line or multi-line.
    fn collect_braced_block(&self, start: usize) -> Result<(String, usize), DbParseError> {
        let first = strip_trailing_comment(self.lines[start]).trim().to_string();
        if parens_balanced(&first) && !first.contains('{') {
            return Ok((first, start + 1));
        }
        let mut combined = String::new();
        let mut i = start;
        while i < self.lines.len() {
            let piece = strip_trailing_comment(self.lines[i]);
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(piece.trim());
            i += 1;
            if parens_balanced(&combined) && braces_balanced(&combined) && combined.contains('}') {
                return Ok((combined, i));
            }
            // A braceless declaration is complete once parens close.
            if parens_balanced(&combined) && !combined.contains('{') {
                return Ok((combined, i));
            }
        }
        Err(self.err(start + 1, "unterminated field block"))
    }

    fn expect_open_brace(&self, mut i: usize) -> Result<usize, DbParseError> {
        while i < self.lines.len() {
            let line = strip_trailing_comment(self.lines[i]).trim().to_string();
            if line.is_empty() {
                i += 1;
                continue;
            }
            if line == "{" {
                return Ok(i + 1);
            }
            return Err(self.err(i + 1, format!("expected `{{`, found: {line}")));
        }
        Err(self.err(i, "expected `{` before end of file"))
    }

    fn reduce_device(&mut self, call: &str, line_no: usize) -> Result<(), DbParseError> {
        let args = call_args(call, "device")
            .ok_or_else(|| self.err(line_no, "device: malformed declaration"))?;
        let parts = split_args(&args);
        if parts.len() != 4 {
            return Err(self.err(line_no, format!("device: expected 4 arguments, got {}", parts.len())));
        }
        let device = DeviceSupport {
            record_type: parts[0].clone(),
            link_type: parts[1].clone(),
            dset_name: parts[2].clone(),
            choice_string: parts[3].clone(),
            context: self.context(line_no),
        };
        if let Some(rt) = self.db.record_types.get_mut(&device.record_type) {
            rt.devices.push(device.choice_string.clone());
        }
        self.db.devices.push(device);
        Ok(())
    }

    fn reduce_named_decl(&mut self, call: &str, line_no: usize) -> Result<(), DbParseError> {
        let context = self.context(line_no);
        if let Some(args) = call_args(call, "driver") {
            let name = parse_one_arg(&args).map_err(|m| self.err(line_no, format!("driver: {m}")))?;
            self.db.drivers.push(NamedDecl { name, context });
            return Ok(());
        }
        if let Some(args) = call_args(call, "registrar") {
            let name =
                parse_one_arg(&args).map_err(|m| self.err(line_no, format!("registrar: {m}")))?;
            self.db.registrars.push(NamedDecl { name, context });
            return Ok(());
        }
        if let Some(args) = call_args(call, "function") {
            let name =
                parse_one_arg(&args).map_err(|m| self.err(line_no, format!("function: {m}")))?;
            self.db.functions.push(NamedDecl { name, context });
            return Ok(());
        }
        if let Some(args) = call_args(call, "variable") {
            let parts = split_args(&args);
            match parts.as_slice() {
                [name] => self.db.variables.push(VariableDecl {
                    name: name.clone(),
                    type_name: "int".to_string(),
                    context,
                }),
                [name, type_name] => self.db.variables.push(VariableDecl {
                    name: name.clone(),
                    type_name: type_name.clone(),
                    context,
                }),
                _ => return Err(self.err(line_no, "variable: expected 1 or 2 arguments")),
            }
            return Ok(());
        }
        if let Some(args) = call_args(call, "link") {
            if self.grammar == DbGrammar::V3 {
                self.db.lint.warn(
                    "v4-only-declaration",
                    "link(...) requires the V4 grammar",
                    context.clone(),
                );
            }
            let (name, handler) = parse_two_args(&args, DbGrammar::V3)
                .map_err(|m| self.err(line_no, format!("link: {m}")))?;
            self.db.link_types.push(LinkSupport {
                name,
                handler,
                context,
            });
            return Ok(());
        }
        Err(self.err(line_no, format!("unrecognized declaration: {call}")))
    }

    fn reduce_standalone_alias(&mut self, call: &str, line_no: usize) -> Result<(), DbParseError> {
        let args = call_args(call, "alias")
            .ok_or_else(|| self.err(line_no, "alias: malformed declaration"))?;
        let (record_name, alias) = parse_two_args(&args, DbGrammar::V3)
            .map_err(|m| self.err(line_no, format!("alias: {m}")))?;
        self.db.aliases.insert(alias.clone(), record_name.clone());
        if let Some(record) = self.db.records.get_mut(&record_name) {
            if !record.aliases.contains(&alias) {
                record.aliases.push(alias);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Linter
// ============================================================================

/// Cross-check every instance against the record-type table of `definition`,
/// resolving field dtypes and recording warnings for unknown types, unknown
/// fields and suspicious values.
pub fn lint_against_definition(db: &mut Database, definition: &Database) {
    let mut findings = Vec::new();
    for record in db.records.values_mut() {
        if record.record_type == "*" {
            continue;
        }
        let Some(rt) = definition
            .record_types
            .get(&record.record_type)
            .or_else(|| db.record_types.get(&record.record_type))
        else {
            findings.push((
                "unknown-record-type",
                format!(
                    "record {:?} has unknown record type {:?}",
                    record.name, record.record_type
                ),
                record.context.clone(),
            ));
            continue;
        };
        for field in record.fields.values_mut() {
            let Some(def) = rt.fields.get(&field.name) else {
                findings.push((
                    "unknown-field",
                    format!(
                        "record {:?} ({}) has no field {:?}",
                        record.name, record.record_type, field.name
                    ),
                    field.context.clone(),
                ));
                continue;
            };
            field.dtype = def.type_name.clone();
            if matches!(def.type_name.as_str(), "DBF_DOUBLE" | "DBF_FLOAT")
                && !field.value.is_empty()
                && !field.value.contains('$')
                && field.value.parse::<f64>().is_err()
            {
                findings.push((
                    "bad-field-value",
                    format!(
                        "field {:?} of record {:?} expects a number, got {:?}",
                        field.name, record.name, field.value
                    ),
                    field.context.clone(),
                ));
            }
        }
    }
    for (code, message, context) in findings {
        db.lint.warn(code, message, context);
    }
}

// ============================================================================
// PVA group aggregation (build-after-parse)
// ============================================================================

/// Harvest `info(Q:group, {...})` nodes into synthetic PVA group
/// pseudo-records. The JSON value maps group names to field specifications;
/// a `+channel` entry resolves to the contributing `(record, field)` pair.
pub fn promote_pva_groups(db: &mut Database) {
    let mut findings = Vec::new();
    let mut groups: Vec<(String, String, PVAFieldReference)> = Vec::new();

    for record in db.records.values() {
        let Some(entry) = record.info.get("Q:group") else {
            continue;
        };
        let parsed: serde_json::Value = match serde_json::from_str(&entry.value) {
            Ok(v) => v,
            Err(e) => {
                findings.push((
                    "bad-pva-group",
                    format!("record {:?}: unparseable Q:group value: {e}", record.name),
                    entry.context.clone(),
                ));
                continue;
            }
        };
        let Some(group_map) = parsed.as_object() else {
            findings.push((
                "bad-pva-group",
                format!("record {:?}: Q:group value is not an object", record.name),
                entry.context.clone(),
            ));
            continue;
        };
        for (group_name, spec) in group_map {
            let Some(fields) = spec.as_object() else {
                continue;
            };
            for (field_name, field_spec) in fields {
                let mut reference = PVAFieldReference {
                    name: field_name.clone(),
                    record_name: Some(record.name.clone()),
                    field_name: None,
                    metadata: Default::default(),
                    context: entry.context.clone(),
                };
                if let Some(field_map) = field_spec.as_object() {
                    for (key, value) in field_map {
                        let value = match value {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        if key == "+channel" {
                            reference.field_name = Some(value);
                        } else {
                            reference
                                .metadata
                                .insert(key.trim_start_matches('+').to_string(), value);
                        }
                    }
                }
                groups.push((group_name.clone(), field_name.clone(), reference));
            }
        }
    }

    for (group_name, field_name, reference) in groups {
        let group = db
            .pva_groups
            .entry(group_name.clone())
            .or_insert_with(|| PVAGroup {
                name: group_name,
                ..PVAGroup::default()
            });
        if group.context.is_empty() {
            group.context = reference.context.clone();
        } else {
            group.context.extend_from(&reference.context);
        }
        group.references.insert(field_name, reference);
    }

    for (code, message, context) in findings {
        db.lint.warn(code, message, context);
    }
}

// ============================================================================
// In-line forms (nom)
// ============================================================================

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn parse_ident(input: &str) -> IResult<&str, &str> {
    recognize(tuple((
        take_while1(is_ident_start),
        take_while(is_ident_continue),
    )))(input)
}

/// Parse `record(TYPE, NAME)` / `grecord(TYPE, NAME)` headers. The type may
/// be `*` (append to an existing instance of unknown type); the name may be
/// quoted or bare and may contain macro references.
fn parse_record_header(call: &str) -> Result<(String, String), String> {
    fn header(input: &str) -> IResult<&str, &str> {
        let (input, _) = multispace0(input)?;
        let (input, _) = alt((tag("grecord"), tag("record")))(input)?;
        let (input, _) = multispace0(input)?;
        let (input, _) = pchar('(')(input)?;
        Ok((input, ""))
    }

    let (rest, _) = header(call).map_err(|_| "malformed record header".to_string())?;
    let close = find_matching_paren(rest).ok_or_else(|| "missing `)`".to_string())?;
    let args = split_args(&rest[..close]);
    if args.len() != 2 {
        return Err(format!("expected 2 arguments, got {}", args.len()));
    }
    let record_type = args[0].clone();
    let name = args[1].clone();
    if name.is_empty() {
        return Err("record name is empty".to_string());
    }
    Ok((record_type, name))
}

/// Parse a `field(NAME, DBF_TYPE) { attr("..") ... }` recordtype block.
fn parse_recordtype_field(block: &str, context: FullLoadContext) -> Result<RecordTypeField, String> {
    fn header(input: &str) -> IResult<&str, (&str, &str)> {
        let (input, _) = multispace0(input)?;
        let (input, _) = tag("field")(input)?;
        let (input, _) = multispace0(input)?;
        let (input, _) = pchar('(')(input)?;
        let (input, _) = multispace0(input)?;
        let (input, name) = parse_ident(input)?;
        let (input, _) = multispace0(input)?;
        let (input, _) = pchar(',')(input)?;
        let (input, _) = multispace0(input)?;
        let (input, type_name) = parse_ident(input)?;
        let (input, _) = multispace0(input)?;
        let (input, _) = pchar(')')(input)?;
        Ok((input, (name, type_name)))
    }

    let (rest, (name, type_name)) =
        header(block).map_err(|_| "malformed field declaration".to_string())?;
    let mut field = RecordTypeField {
        name: name.to_string(),
        type_name: type_name.to_string(),
        attrs: Default::default(),
        context,
    };

    let body = rest.trim();
    if body.is_empty() {
        return Ok(field);
    }
    let body = body
        .strip_prefix('{')
        .and_then(|b| b.trim_end().strip_suffix('}'))
        .ok_or_else(|| "malformed field body".to_string())?;

    let mut remaining = body.trim();
    while !remaining.is_empty() {
        let (rest, (attr, value)) = parse_attr_call(remaining)
            .map_err(|_| format!("malformed field attribute near: {remaining}"))?;
        field.attrs.insert(attr.to_string(), value);
        remaining = rest.trim_start();
    }
    Ok(field)
}

/// One `attr(value)` call inside a recordtype field body.
fn parse_attr_call(input: &str) -> IResult<&str, (&str, String)> {
    let (input, _) = multispace0(input)?;
    let (input, name) = parse_ident(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = pchar('(')(input)?;
    let close = find_matching_paren(input).ok_or(nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::TakeUntil,
    )))?;
    let value = unquote_arg(input[..close].trim());
    let (input, _) = opt(multispace0)(&input[close + 1..])?;
    Ok((input, (name, value)))
}

/// Parse a bare `"file"` directive argument (include/path/addpath).
fn parse_string_directive(rest: &str) -> Result<String, String> {
    let rest = rest.trim();
    if rest.is_empty() {
        return Err("missing argument".to_string());
    }
    Ok(unquote_arg(rest))
}

/// Extract the argument text of `keyword(args)`, or `None` when the call is
/// for a different keyword.
fn call_args(call: &str, keyword: &str) -> Option<String> {
    let trimmed = call.trim_start();
    let rest = trimmed.strip_prefix(keyword)?;
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('(')?;
    let close = find_matching_paren(rest)?;
    Some(rest[..close].to_string())
}

fn parse_one_arg(args: &str) -> Result<String, String> {
    let parts = split_args(args);
    match parts.as_slice() {
        [one] if !one.is_empty() => Ok(one.clone()),
        _ => Err(format!("expected 1 argument, got {}", parts.len())),
    }
}

fn parse_two_args(args: &str, grammar: DbGrammar) -> Result<(String, String), String> {
    let parts = split_args(args);
    if parts.len() != 2 {
        return Err(format!("expected 2 arguments, got {}", parts.len()));
    }
    if grammar == DbGrammar::V3 && (parts[1].starts_with('{') || parts[1].starts_with('[')) {
        return Err("JSON values require the V4 grammar".to_string());
    }
    Ok((parts[0].clone(), parts[1].clone()))
}

/// Split `a, "b, c", {j: 1}` on top-level commas, unquoting each argument.
fn split_args(args: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in args.chars() {
        if let Some(q) = quote {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => {
                quote = Some(c);
                current.push(c);
            }
            '(' | '{' | '[' => {
                depth += 1;
                current.push(c);
            }
            ')' | '}' | ']' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                out.push(unquote_arg(current.trim()));
                current.clear();
            }
            _ => current.push(c),
        }
    }
    let last = current.trim();
    if !last.is_empty() || !out.is_empty() {
        out.push(unquote_arg(last));
    }
    out
}

/// Strip one layer of quotes and resolve the escapes the db grammar allows.
fn unquote_arg(arg: &str) -> String {
    let bytes = arg.as_bytes();
    if bytes.len() >= 2 && bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"' {
        let inner = &arg[1..arg.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(other) => out.push(other),
                    None => out.push('\\'),
                }
            } else {
                out.push(c);
            }
        }
        return out;
    }
    arg.to_string()
}

/// Index of the `)` closing an already-opened paren, honoring quotes and
/// nested brackets.
fn find_matching_paren(rest: &str) -> Option<usize> {
    let mut depth = 1usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (idx, c) in rest.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn parens_balanced(text: &str) -> bool {
    bracket_depth(text, '(', ')') == 0
}

fn braces_balanced(text: &str) -> bool {
    bracket_depth(text, '{', '}') == 0
}

fn bracket_depth(text: &str, open: char, close: char) -> isize {
    let mut depth = 0isize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in text.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            c if c == open => depth += 1,
            c if c == close => depth -= 1,
            _ => {}
        }
    }
    depth
}

/// Cut a trailing `#` comment, honoring quotes.
fn strip_trailing_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (idx, c) in line.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '#' => return &line[..idx],
            _ => {}
        }
    }
    line
}

/// The text of a whole-line comment, for doc capture.
fn comment_text(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let body = trimmed.strip_prefix('#')?;
    Some(body.trim().to_string())
}

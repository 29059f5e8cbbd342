//! The typed record/database model shared by every parser and the shell.
//!
//! A [`Database`] is produced fresh for each parsed file; the interpreter
//! merges successive results into its running state with [`Database::merge`].
//! Redefinition of an instance name merges fields and extends provenance
//! rather than replacing the earlier definition.

use crate::context::FullLoadContext;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One field value on a record instance.
///
/// `dtype` stays empty until the field is cross-checked against the owning
/// record type's field table; `"unknown"` marks placeholder fields the graph
/// engine synthesizes for not-yet-seen targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordField {
    pub name: String,
    pub dtype: String,
    pub value: String,
    pub context: FullLoadContext,
}

/// An `info(name, value)` node on a record instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoEntry {
    pub value: String,
    pub context: FullLoadContext,
}

/// Link direction of a record-type field, derived from its DBF type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkDirection {
    Input,
    Output,
    Forward,
}

/// A field declaration inside `recordtype(...) { ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordTypeField {
    pub name: String,
    pub type_name: String,
    /// Body attributes (`prompt`, `asl`, `special`, ...), in declaration form.
    pub attrs: BTreeMap<String, String>,
    pub context: FullLoadContext,
}

impl RecordTypeField {
    pub fn link_direction(&self) -> Option<LinkDirection> {
        match self.type_name.as_str() {
            "DBF_INLINK" => Some(LinkDirection::Input),
            "DBF_OUTLINK" => Some(LinkDirection::Output),
            "DBF_FWDLINK" => Some(LinkDirection::Forward),
            _ => None,
        }
    }
}

/// A record type from a database definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordType {
    pub name: String,
    pub fields: BTreeMap<String, RecordTypeField>,
    /// Device-support choice strings declared for this record type.
    pub devices: Vec<String>,
    pub aliases: Vec<String>,
    pub info: BTreeMap<String, InfoEntry>,
    /// Verbatim `%`-prefixed C definition snippets from the type body.
    pub cdefs: Vec<String>,
    pub context: FullLoadContext,
}

impl RecordType {
    /// Names of the link-typed fields, with their directions.
    pub fn link_fields(&self) -> impl Iterator<Item = (&str, LinkDirection)> {
        self.fields
            .values()
            .filter_map(|f| f.link_direction().map(|d| (f.name.as_str(), d)))
    }
}

/// Tagged metadata values attached to records by sub-handlers.
///
/// Known keys on [`RecordInstance::metadata`]: the sub-handler names
/// (`asyn`, `motor`, `autosave`, `stream`, `access`) plus `gateway`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MetadataValue {
    Str(String),
    List(Vec<String>),
    Map(BTreeMap<String, String>),
}

/// A named, typed control-system data point with fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordInstance {
    pub name: String,
    /// `"*"` at parse time means append-to-existing; resolved in a deferred
    /// pass against a previously seen instance.
    pub record_type: String,
    pub fields: BTreeMap<String, RecordField>,
    pub info: BTreeMap<String, InfoEntry>,
    pub aliases: Vec<String>,
    /// Free-text documentation captured from comments immediately preceding
    /// the declaration.
    pub docs: Vec<String>,
    pub context: FullLoadContext,
    /// Identifier of the IOC that loaded this record, filled by the shell.
    pub owner: String,
    pub metadata: BTreeMap<String, MetadataValue>,
    pub is_pva: bool,
}

impl RecordInstance {
    pub fn new(name: impl Into<String>, record_type: impl Into<String>, context: FullLoadContext) -> Self {
        Self {
            name: name.into(),
            record_type: record_type.into(),
            fields: BTreeMap::new(),
            info: BTreeMap::new(),
            aliases: Vec::new(),
            docs: Vec::new(),
            context,
            owner: String::new(),
            metadata: BTreeMap::new(),
            is_pva: false,
        }
    }

    /// Fold a redefinition of the same name into this instance: later field
    /// values win per-field, aliases/info/docs union, provenance extends.
    pub fn merge_from(&mut self, other: RecordInstance) {
        if self.record_type == "*" && other.record_type != "*" {
            self.record_type = other.record_type;
        }
        for (name, field) in other.fields {
            self.fields.insert(name, field);
        }
        for (name, entry) in other.info {
            self.info.insert(name, entry);
        }
        for alias in other.aliases {
            if !self.aliases.contains(&alias) {
                self.aliases.push(alias);
            }
        }
        for doc in other.docs {
            if !self.docs.contains(&doc) {
                self.docs.push(doc);
            }
        }
        self.context.extend_from(&other.context);
    }

    pub fn field_value(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|f| f.value.as_str())
    }
}

/// A pseudo-field of a synthesized PVA group, pointing back at the V3
/// record/field that contributes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PVAFieldReference {
    pub name: String,
    pub record_name: Option<String>,
    pub field_name: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub context: FullLoadContext,
}

/// A pseudo-record aggregating `Q:group` info nodes spread across records.
///
/// Group names are unique across every record that contributes to one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PVAGroup {
    pub name: String,
    pub references: BTreeMap<String, PVAFieldReference>,
    pub context: FullLoadContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Menu {
    pub name: String,
    /// Choice identifier -> display label, in declaration order.
    pub choices: Vec<(String, String)>,
    pub context: FullLoadContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSupport {
    pub record_type: String,
    pub link_type: String,
    pub dset_name: String,
    pub choice_string: String,
    pub context: FullLoadContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedDecl {
    pub name: String,
    pub context: FullLoadContext,
}

/// `link(name, handler)` declarations from V4 definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSupport {
    pub name: String,
    pub handler: String,
    pub context: FullLoadContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableDecl {
    pub name: String,
    pub type_name: String,
    pub context: FullLoadContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breaktable {
    pub name: String,
    pub values: Vec<String>,
    pub context: FullLoadContext,
}

/// A lint finding, tagged with a short machine-readable code plus a human
/// message, both carrying the triggering context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintMessage {
    pub code: String,
    pub message: String,
    pub context: FullLoadContext,
}

impl LintMessage {
    pub fn new(code: &str, message: impl Into<String>, context: FullLoadContext) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            context,
        }
    }
}

/// Accumulated lint findings for one parse. Errors make the parse
/// unsuccessful but never abort the walk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintResult {
    pub errors: Vec<LintMessage>,
    pub warnings: Vec<LintMessage>,
}

impl LintResult {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error(&mut self, code: &str, message: impl Into<String>, context: FullLoadContext) {
        self.errors.push(LintMessage::new(code, message, context));
    }

    pub fn warn(&mut self, code: &str, message: impl Into<String>, context: FullLoadContext) {
        self.warnings.push(LintMessage::new(code, message, context));
    }

    pub fn absorb(&mut self, other: LintResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// The parse-time aggregate for one database or definition file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    pub record_types: BTreeMap<String, RecordType>,
    pub records: BTreeMap<String, RecordInstance>,
    pub pva_groups: BTreeMap<String, PVAGroup>,
    pub menus: BTreeMap<String, Menu>,
    pub devices: Vec<DeviceSupport>,
    pub drivers: Vec<NamedDecl>,
    pub link_types: Vec<LinkSupport>,
    pub registrars: Vec<NamedDecl>,
    pub functions: Vec<NamedDecl>,
    pub variables: Vec<VariableDecl>,
    pub breaktables: BTreeMap<String, Breaktable>,
    /// Alias name -> canonical record name, from both inline and standalone
    /// alias directives.
    pub aliases: BTreeMap<String, String>,
    pub paths: Vec<String>,
    pub addpaths: Vec<String>,
    pub includes: Vec<NamedDecl>,
    pub lint: LintResult,
}

impl Database {
    /// Merge another parse result into this running database.
    ///
    /// Instances already seen merge field-wise; everything else unions.
    pub fn merge(&mut self, other: Database) {
        for (name, rt) in other.record_types {
            self.record_types.insert(name, rt);
        }
        for (name, record) in other.records {
            match self.records.entry(name) {
                std::collections::btree_map::Entry::Occupied(mut e) => {
                    e.get_mut().merge_from(record);
                }
                std::collections::btree_map::Entry::Vacant(e) => {
                    e.insert(record);
                }
            }
        }
        for (name, group) in other.pva_groups {
            match self.pva_groups.entry(name) {
                std::collections::btree_map::Entry::Occupied(mut e) => {
                    let dest = e.get_mut();
                    dest.references.extend(group.references);
                    dest.context.extend_from(&group.context);
                }
                std::collections::btree_map::Entry::Vacant(e) => {
                    e.insert(group);
                }
            }
        }
        self.menus.extend(other.menus);
        self.devices.extend(other.devices);
        self.drivers.extend(other.drivers);
        self.link_types.extend(other.link_types);
        self.registrars.extend(other.registrars);
        self.functions.extend(other.functions);
        self.variables.extend(other.variables);
        self.breaktables.extend(other.breaktables);
        self.aliases.extend(other.aliases);
        self.paths.extend(other.paths);
        self.addpaths.extend(other.addpaths);
        self.includes.extend(other.includes);
        self.lint.absorb(other.lint);
    }

    /// Resolve an alias (or canonical name) to the canonical record name.
    pub fn canonical_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FullLoadContext;

    fn ctx(line: usize) -> FullLoadContext {
        FullLoadContext::single("test.db", line)
    }

    #[test]
    fn redefinition_merges_fields_and_context() {
        let mut a = RecordInstance::new("X", "ai", ctx(1));
        a.fields.insert(
            "DESC".into(),
            RecordField {
                name: "DESC".into(),
                dtype: String::new(),
                value: "first".into(),
                context: ctx(2),
            },
        );
        let mut b = RecordInstance::new("X", "*", ctx(10));
        b.fields.insert(
            "EGU".into(),
            RecordField {
                name: "EGU".into(),
                dtype: String::new(),
                value: "mm".into(),
                context: ctx(11),
            },
        );

        a.merge_from(b);
        assert_eq!(a.record_type, "ai");
        assert_eq!(a.fields.len(), 2);
        assert_eq!(a.context.0.len(), 2);
    }

    #[test]
    fn database_merge_unions_aliases() {
        let mut dest = Database::default();
        dest.aliases.insert("OLD".into(), "X".into());
        let mut other = Database::default();
        other.aliases.insert("NEW".into(), "Y".into());
        dest.merge(other);
        assert_eq!(dest.canonical_name("OLD"), "X");
        assert_eq!(dest.canonical_name("NEW"), "Y");
        assert_eq!(dest.canonical_name("Z"), "Z");
    }

    #[test]
    fn lint_errors_fail_success_but_warnings_do_not() {
        let mut lint = LintResult::default();
        lint.warn("unknown-field", "no such field", ctx(3));
        assert!(lint.success());
        lint.error("bad-grammar", "unparseable", ctx(4));
        assert!(!lint.success());
    }
}

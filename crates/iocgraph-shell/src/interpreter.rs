//! The startup-script interpreter: a command-dispatch state machine that
//! replays one script line by line against a [`ShellState`].
//!
//! Failure semantics: a failing command captures its error class and message
//! into that line's result and the script continues; a failing redirect
//! (`< file`) terminates only that include chain. `iocInit` is the terminal
//! transition for database mutation.

use crate::commands::{parse_argv, Command};
use crate::handlers::{default_handlers, SubHandler};
use crate::state::{
    infer_base_version, CommandError, InterpreterOptions, IocState, Outcome, ShellResult,
    ShellState,
};
use iocgraph_dsl::context::{FullLoadContext, LoadContext};
use iocgraph_dsl::db::{parse_database, DbParseOptions};
use iocgraph_dsl::macros::parse_definitions;
use iocgraph_dsl::model::Database;
use iocgraph_dsl::substitution::parse_substitution;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything one IOC load produced, self-contained and serializable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IocLoadReport {
    pub name: String,
    pub script: String,
    pub results: Vec<ShellResult>,
    /// The merged running database: records, PVA groups, aliases, lints.
    pub database: Database,
    pub loaded_files: BTreeMap<String, String>,
    pub variables: BTreeMap<String, String>,
    pub macros: BTreeMap<String, String>,
    pub ioc_initialized: bool,
    pub base_version: Option<String>,
    pub unhandled_commands: BTreeMap<String, usize>,
}

pub struct ShellInterpreter {
    pub state: ShellState,
    handlers: Vec<Box<dyn SubHandler>>,
}

impl ShellInterpreter {
    pub fn new(options: InterpreterOptions) -> Self {
        Self::with_handlers(options, default_handlers())
    }

    pub fn with_handlers(options: InterpreterOptions, handlers: Vec<Box<dyn SubHandler>>) -> Self {
        Self {
            state: ShellState::new(options),
            handlers,
        }
    }

    /// Interpret a startup script from disk. A missing script is the one
    /// unrecoverable error: there is nothing to replay.
    pub fn interpret_script(&mut self, path: &str) -> Result<Vec<ShellResult>, CommandError> {
        let (resolved, text) = self.state.read_file(path)?;
        if self.state.options.cwd.is_none() {
            if let Some(dir) = resolved.parent() {
                self.state.cwd = dir.to_path_buf();
            }
        }
        let source = resolved.display().to_string();
        Ok(self.interpret_text(&text, &source))
    }

    /// Interpret script text line by line.
    pub fn interpret_text(&mut self, text: &str, source: &str) -> Vec<ShellResult> {
        if self.state.ioc_state == IocState::Uninitialized {
            self.state.ioc_state = IocState::Loading;
        }
        let mut results = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            results.extend(self.interpret_line(raw, source, idx + 1));
        }
        results
    }

    /// Interpret one shell line, yielding zero or more results (redirects
    /// inline the interpreted lines of the target file).
    pub fn interpret_line(&mut self, raw: &str, source: &str, line_no: usize) -> Vec<ShellResult> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Vec::new();
        }
        let context = self
            .state
            .load_context
            .pushed(LoadContext::new(source.to_string(), line_no));
        let expanded = self.state.macros.expand(trimmed);

        if let Some(target) = expanded.strip_prefix('<') {
            return self.interpret_redirect(target.trim().to_string(), expanded.clone(), context);
        }

        let argv = parse_argv(&expanded);
        if argv.is_empty() {
            return Vec::new();
        }

        let mut result = ShellResult {
            line: expanded.clone(),
            context: context.clone(),
            argv: argv.clone(),
            outcome: Outcome::Success,
            notes: BTreeMap::new(),
        };

        let command = Command::from_name(&argv[0]);
        let outcome = match command {
            Command::DbLoadDatabase => self.cmd_db_load_database(&argv, &context, &mut result),
            Command::DbLoadRecords => self.cmd_db_load_records(&argv, &context, &mut result),
            Command::DbLoadTemplate => self.cmd_db_load_template(&argv, &context, &mut result),
            Command::IocInit => self.cmd_ioc_init(&mut result),
            Command::EpicsEnvSet => self.cmd_epics_env_set(&argv),
            Command::EpicsEnvShow => {
                for (name, value) in self.state.variables.clone() {
                    result.notes.insert(name, value);
                }
                Ok(())
            }
            Command::Cd => self.cmd_cd(&argv),
            Command::Dbl => {
                result.notes.insert(
                    "records".to_string(),
                    self.state.database.records.len().to_string(),
                );
                Ok(())
            }
            Command::Var => self.cmd_var(&argv, &mut result),
            Command::Unknown => {
                let mut claimed = None;
                for handler in &mut self.handlers {
                    if let Some(outcome) = handler.try_command(&mut self.state, &argv, &context) {
                        claimed = Some(outcome);
                        break;
                    }
                }
                match claimed {
                    Some(Ok(notes)) => {
                        result.notes.extend(notes);
                        Ok(())
                    }
                    Some(Err(e)) => Err(e),
                    None => {
                        tracing::debug!(command = %argv[0], "unhandled command");
                        *self
                            .state
                            .unhandled_commands
                            .entry(argv[0].clone())
                            .or_insert(0) += 1;
                        result.outcome = Outcome::Unhandled;
                        Ok(())
                    }
                }
            }
        };

        if let Err(e) = outcome {
            tracing::debug!(command = %argv[0], "command failed: {e}");
            result.outcome = Outcome::Failure {
                class: e.class().to_string(),
                message: e.to_string(),
                trace: Vec::new(),
            };
        }
        vec![result]
    }

    /// `< file` inlines the interpreted lines of `file` in document order. A
    /// missing file fails this line only.
    fn interpret_redirect(
        &mut self,
        target: String,
        line: String,
        context: FullLoadContext,
    ) -> Vec<ShellResult> {
        let argv = vec!["<".to_string(), target.clone()];
        match self.state.read_file(&target) {
            Err(e) => vec![ShellResult::failure(line, context, argv, &e)],
            Ok((resolved, text)) => {
                let mut results = vec![ShellResult {
                    line,
                    context: context.clone(),
                    argv,
                    outcome: Outcome::Success,
                    notes: BTreeMap::new(),
                }];
                let saved = self.state.load_context.clone();
                self.state.load_context = context;
                results.extend(self.interpret_text(&text, &resolved.display().to_string()));
                self.state.load_context = saved;
                results
            }
        }
    }

    // ------------------------------------------------------------------
    // Core commands
    // ------------------------------------------------------------------

    fn cmd_db_load_database(
        &mut self,
        argv: &[String],
        context: &FullLoadContext,
        result: &mut ShellResult,
    ) -> Result<(), CommandError> {
        let path = expect_arg(argv, 1)?;
        if self.state.ioc_initialized() {
            return Err(CommandError::LoadAfterInit);
        }
        if let Some(existing) = &self.state.database_definition_file {
            return Err(CommandError::DbdAlreadyLoaded(existing.clone()));
        }

        let (resolved, text) = self.state.read_file(path)?;
        let source = resolved.display().to_string();
        let definition = parse_database(
            &text,
            DbParseOptions::new(source.clone(), self.state.db_grammar())
                .with_base_context(context.clone()),
        )
        .map_err(|e| CommandError::Parse(e.to_string()))?;

        for addpath in &definition.addpaths {
            let resolved = self.state.resolve_path(addpath);
            self.state.db_add_paths.push(resolved);
        }
        // Make the definition's record types visible to the running
        // database so link-field resolution can see them.
        for (name, rt) in &definition.record_types {
            self.state
                .database
                .record_types
                .insert(name.clone(), rt.clone());
        }

        result
            .notes
            .insert("record_types".to_string(), definition.record_types.len().to_string());
        result
            .notes
            .insert("menus".to_string(), definition.menus.len().to_string());
        self.state.database_definition = Some(definition);
        self.state.database_definition_file = Some(source);
        Ok(())
    }

    fn cmd_db_load_records(
        &mut self,
        argv: &[String],
        context: &FullLoadContext,
        result: &mut ShellResult,
    ) -> Result<(), CommandError> {
        let path = expect_arg(argv, 1)?;
        let macro_defs = argv.get(2).cloned().unwrap_or_default();
        let parsed = self.load_records_file(path, &macro_defs, context)?;
        result
            .notes
            .insert("records".to_string(), parsed.to_string());
        Ok(())
    }

    /// Shared body of `dbLoadRecords` and each substitution row: read the
    /// database file, expand macros, parse, stamp owners, merge.
    fn load_records_file(
        &mut self,
        path: &str,
        macro_defs: &str,
        context: &FullLoadContext,
    ) -> Result<usize, CommandError> {
        if self.state.database_definition.is_none() {
            return Err(CommandError::DbdNotLoaded);
        }
        if self.state.ioc_initialized() {
            return Err(CommandError::LoadAfterInit);
        }

        let pairs =
            parse_definitions(macro_defs).map_err(|e| CommandError::Parse(e.to_string()))?;
        let (resolved, text) = self.state.read_db_file(path)?;
        let source = resolved.display().to_string();
        let grammar = self.state.db_grammar();

        let expanded = {
            let scope = self.state.macros.scoped(pairs);
            scope.expand(&text)
        };

        let definition = self
            .state
            .database_definition
            .as_ref()
            .ok_or(CommandError::DbdNotLoaded)?;
        let mut parsed = parse_database(
            &expanded,
            DbParseOptions::new(source, grammar)
                .with_base_context(context.clone())
                .with_definition(definition),
        )
        .map_err(|e| CommandError::Parse(e.to_string()))?;

        for record in parsed.records.values_mut() {
            record.owner = self.state.options.name.clone();
        }
        let loaded_names: Vec<String> = parsed.records.keys().cloned().collect();
        let count = loaded_names.len();
        self.state.database.merge(parsed);

        // Star-typed redefinitions are resolved against previously loaded
        // instances during the merge; whatever is left is genuinely dangling.
        for name in loaded_names {
            if let Some(record) = self.state.database.records.get(&name) {
                if record.record_type == "*" {
                    let ctx = record.context.clone();
                    self.state.database.lint.warn(
                        "unresolved-star-record",
                        format!("record {name:?} extends an instance that was never defined"),
                        ctx,
                    );
                }
            }
        }
        Ok(count)
    }

    fn cmd_db_load_template(
        &mut self,
        argv: &[String],
        context: &FullLoadContext,
        result: &mut ShellResult,
    ) -> Result<(), CommandError> {
        let path = expect_arg(argv, 1)?;
        let global_defs = argv.get(2).cloned().unwrap_or_default();
        if self.state.database_definition.is_none() {
            return Err(CommandError::DbdNotLoaded);
        }
        if self.state.ioc_initialized() {
            return Err(CommandError::LoadAfterInit);
        }

        let (resolved, text) = self.state.read_file(path)?;
        let source = resolved.display().to_string();
        let rows = parse_substitution(&text, &source, context)
            .map_err(|e| CommandError::Parse(e.to_string()))?;

        let mut records = 0usize;
        for row in &rows {
            let mut defs: Vec<String> = Vec::new();
            if !global_defs.is_empty() {
                defs.push(global_defs.clone());
            }
            for (name, value) in &row.macros {
                defs.push(format!("{name}=\"{value}\""));
            }
            records += self.load_records_file(&row.target_file, &defs.join(","), &row.context)?;
        }
        result.notes.insert("rows".to_string(), rows.len().to_string());
        result
            .notes
            .insert("records".to_string(), records.to_string());
        Ok(())
    }

    fn cmd_ioc_init(&mut self, result: &mut ShellResult) -> Result<(), CommandError> {
        if self.state.ioc_initialized() {
            return Err(CommandError::AlreadyInitialized);
        }
        for handler in &mut self.handlers {
            for (key, value) in handler.pre_ioc_init(&mut self.state) {
                result.notes.insert(format!("{}.{key}", handler.name()), value);
            }
        }
        self.state.ioc_state = IocState::Initialized;
        for handler in &mut self.handlers {
            for (key, value) in handler.post_ioc_init(&mut self.state) {
                result.notes.insert(format!("{}.{key}", handler.name()), value);
            }
        }
        tracing::info!(ioc = %self.state.options.name, "iocInit complete");
        Ok(())
    }

    fn cmd_epics_env_set(&mut self, argv: &[String]) -> Result<(), CommandError> {
        let name = expect_arg(argv, 1)?.to_string();
        let value = argv.get(2).cloned().unwrap_or_default();
        self.state.macros.define(name.clone(), value.clone());
        self.state.variables.insert(name.clone(), value.clone());

        // Well-known variable hooks; nothing fails when none matches.
        if name == "EPICS_BASE" {
            if let Some(version) = infer_base_version(&value) {
                self.state.base_version = Some(version);
            }
        }
        for handler in &mut self.handlers {
            handler.env_set(&mut self.state, &name, &value);
        }
        Ok(())
    }

    fn cmd_cd(&mut self, argv: &[String]) -> Result<(), CommandError> {
        let target = expect_arg(argv, 1)?;
        let resolved = self.state.resolve_path(target);
        if !resolved.is_dir() {
            return Err(CommandError::FileNotFound(target.to_string()));
        }
        self.state.cwd = resolved;
        Ok(())
    }

    fn cmd_var(&mut self, argv: &[String], result: &mut ShellResult) -> Result<(), CommandError> {
        let name = expect_arg(argv, 1)?.to_string();
        match argv.get(2) {
            Some(value) => {
                self.state.variables.insert(name, value.clone());
            }
            None => {
                let value = self
                    .state
                    .variables
                    .get(&name)
                    .cloned()
                    .unwrap_or_else(|| "<undefined>".to_string());
                result.notes.insert(name, value);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Annotation pass
    // ------------------------------------------------------------------

    /// Offer every loaded record to every sub-handler, in registration
    /// order, attaching returned metadata under the handler's name. Runs
    /// once, after all scripts are interpreted.
    pub fn annotate_records(&mut self) {
        for handler in &mut self.handlers {
            handler.prepare_annotations(&mut self.state);
        }
        for handler in &self.handlers {
            let mut annotations = Vec::new();
            for record in self.state.database.records.values() {
                if let Some(value) = handler.annotate_record(&self.state, record) {
                    annotations.push((record.name.clone(), value));
                }
            }
            for (name, value) in annotations {
                if let Some(record) = self.state.database.records.get_mut(&name) {
                    record.metadata.insert(handler.name().to_string(), value);
                }
            }
        }
    }

    /// Package the final state as a self-contained report.
    pub fn into_report(self, script: String, results: Vec<ShellResult>) -> IocLoadReport {
        IocLoadReport {
            name: self.state.options.name.clone(),
            script,
            results,
            macros: self.state.macros.definitions_flat(),
            database: self.state.database,
            loaded_files: self.state.loaded_files,
            variables: self.state.variables,
            ioc_initialized: self.state.ioc_state == IocState::Initialized,
            base_version: self.state.base_version,
            unhandled_commands: self.state.unhandled_commands,
        }
    }
}

/// Interpret one IOC startup script end to end: replay, annotate, report.
pub fn load_ioc(options: InterpreterOptions, script: &str) -> Result<IocLoadReport, CommandError> {
    let mut interpreter = ShellInterpreter::new(options);
    let results = interpreter.interpret_script(script)?;
    interpreter.annotate_records();
    Ok(interpreter.into_report(script.to_string(), results))
}

fn expect_arg<'a>(argv: &'a [String], index: usize) -> Result<&'a str, CommandError> {
    argv.get(index).map(String::as_str).ok_or_else(|| {
        CommandError::BadArguments {
            command: argv[0].clone(),
            expected: "more",
            got: argv.len() - 1,
        }
    })
}

//! The interpreter's simulated IOC environment.
//!
//! A [`ShellState`] is created once per IOC load and mutated strictly
//! sequentially as the startup script replays: working directory, macro
//! definitions, the running record database, the loaded-file digest ledger
//! and the per-handler device registries all live here. Nothing process-wide
//! is touched, so independent loads can run concurrently in one process.

use iocgraph_dsl::context::FullLoadContext;
use iocgraph_dsl::db::DbGrammar;
use iocgraph_dsl::digest::text_digest;
use iocgraph_dsl::macros::{MacroContext, UndefinedMacroPolicy};
use iocgraph_dsl::model::Database;
use iocgraph_ingest_acf::AccessSecurityConfig;
use iocgraph_ingest_autosave::RestoreFile;
use iocgraph_ingest_stream::StreamProtocolFile;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Lifecycle of one interpreted IOC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IocState {
    Uninitialized,
    Loading,
    Initialized,
}

/// Errors a single shell command can fail with. Captured per line; they
/// never abort the rest of the script.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("could not read {path}: {message}")]
    ReadFailed { path: String, message: String },
    #[error("database definition already loaded from {0}")]
    DbdAlreadyLoaded(String),
    #[error("no database definition loaded")]
    DbdNotLoaded,
    #[error("IOC is already initialized")]
    AlreadyInitialized,
    #[error("record loading is not permitted after iocInit")]
    LoadAfterInit,
    #[error("unknown {kind} {name:?}")]
    MissingReference { kind: &'static str, name: String },
    #[error("{command}: expected {expected} argument(s), got {got}")]
    BadArguments {
        command: String,
        expected: &'static str,
        got: usize,
    },
    #[error("{0}")]
    Parse(String),
}

impl CommandError {
    /// Short machine-readable class for captured failures.
    pub fn class(&self) -> &'static str {
        match self {
            CommandError::FileNotFound(_) => "FileNotFound",
            CommandError::ReadFailed { .. } => "ReadFailed",
            CommandError::DbdAlreadyLoaded(_) => "DbdAlreadyLoaded",
            CommandError::DbdNotLoaded => "DbdNotLoaded",
            CommandError::AlreadyInitialized => "AlreadyInitialized",
            CommandError::LoadAfterInit => "LoadAfterInit",
            CommandError::MissingReference { .. } => "MissingReference",
            CommandError::BadArguments { .. } => "BadArguments",
            CommandError::Parse(_) => "ParseError",
        }
    }
}

/// Outcome of one interpreted shell line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// The command failed; the script continues.
    Failure {
        class: String,
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        trace: Vec<String>,
    },
    /// Nobody claimed the command; recorded, not an error.
    Unhandled,
}

/// One annotated result record for one shell line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellResult {
    pub line: String,
    pub context: FullLoadContext,
    /// Parsed argv, after macro expansion.
    pub argv: Vec<String>,
    pub outcome: Outcome,
    /// Free-form notes a command attaches (e.g. iocInit hook metadata).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub notes: BTreeMap<String, String>,
}

impl ShellResult {
    pub fn failure(line: String, context: FullLoadContext, argv: Vec<String>, err: &CommandError) -> Self {
        Self {
            line,
            context,
            argv,
            outcome: Outcome::Failure {
                class: err.class().to_string(),
                message: err.to_string(),
                trace: Vec::new(),
            },
            notes: BTreeMap::new(),
        }
    }
}

// ============================================================================
// Device registries (per-handler state slices)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsynPortKind {
    Serial,
    Ip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsynPort {
    pub name: String,
    pub kind: AsynPortKind,
    /// tty path or host:port, as configured.
    pub address: String,
    pub options: BTreeMap<String, String>,
    pub context: FullLoadContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorController {
    pub name: String,
    /// The asyn port the controller talks through, when it resolved.
    pub asyn_port: Option<String>,
    pub num_axes: usize,
    pub context: FullLoadContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreFileRequest {
    /// 0 or 1, matching the restore pass the file was registered for.
    pub pass: u8,
    pub path: String,
    pub context: FullLoadContext,
}

/// Keyed registries the sub-handlers maintain. Each handler owns its slice;
/// cross-references (a motor naming its asyn port) go through here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRegistries {
    pub asyn_ports: BTreeMap<String, AsynPort>,
    pub motors: BTreeMap<String, MotorController>,
    pub save_path: Option<String>,
    pub request_paths: Vec<String>,
    pub restore_requests: Vec<RestoreFileRequest>,
    /// Snapshots parsed during the iocInit restore passes.
    pub restores: Vec<RestoreFile>,
    pub protocol_paths: Vec<String>,
    /// Protocol files parsed during the annotation pass, keyed by file name.
    pub protocols: BTreeMap<String, StreamProtocolFile>,
    pub access_file: Option<String>,
    pub access: Option<AccessSecurityConfig>,
}

// ============================================================================
// Shell state
// ============================================================================

/// Options fixed for the lifetime of one interpretation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterpreterOptions {
    /// IOC identifier stamped onto every loaded record as its owner.
    pub name: String,
    /// Initial macro definitions (`P=X, IOC=...`).
    pub macros: Vec<(String, String)>,
    /// Initial working directory; defaults to the script's directory.
    pub cwd: Option<PathBuf>,
    /// Absolute-path rewrites applied before filesystem access, for archived
    /// IOC trees mounted somewhere else.
    pub standin_directories: BTreeMap<String, String>,
    /// Force a database grammar instead of inferring it from EPICS_BASE.
    pub grammar: Option<DbGrammar>,
    /// Let macro expansion fall back to the process environment.
    pub use_environment: bool,
}

/// The mutable simulation state of one IOC load.
#[derive(Debug)]
pub struct ShellState {
    pub options: InterpreterOptions,
    pub prompt: String,
    /// `var`-style shell variables and everything set via `epicsEnvSet`.
    pub variables: BTreeMap<String, String>,
    pub macros: MacroContext,
    pub cwd: PathBuf,
    /// File name -> content digest of every file this load read.
    pub loaded_files: BTreeMap<String, String>,
    /// The running record database (instances, PVA groups, aliases, lints).
    pub database: Database,
    pub database_definition: Option<Database>,
    /// The file the definition came from.
    pub database_definition_file: Option<String>,
    /// Extra database search paths seeded by `addpath` directives.
    pub db_add_paths: Vec<PathBuf>,
    /// Include stack of the line currently being interpreted.
    pub load_context: FullLoadContext,
    pub ioc_state: IocState,
    /// EPICS base version inferred from `EPICS_BASE`, when recognizable.
    pub base_version: Option<String>,
    pub devices: DeviceRegistries,
    /// Commands nobody handled, with occurrence counts.
    pub unhandled_commands: BTreeMap<String, usize>,
}

impl ShellState {
    pub fn new(options: InterpreterOptions) -> Self {
        let mut macros = MacroContext::new();
        macros.undefined = UndefinedMacroPolicy::Keep;
        macros.use_environment = options.use_environment;
        for (name, value) in &options.macros {
            macros.define(name.clone(), value.clone());
        }
        let cwd = options.cwd.clone().unwrap_or_else(|| PathBuf::from("."));
        Self {
            options,
            prompt: "epics>".to_string(),
            variables: BTreeMap::new(),
            macros,
            cwd,
            loaded_files: BTreeMap::new(),
            database: Database::default(),
            database_definition: None,
            database_definition_file: None,
            db_add_paths: Vec::new(),
            load_context: FullLoadContext::empty(),
            ioc_state: IocState::Uninitialized,
            base_version: None,
            devices: DeviceRegistries::default(),
            unhandled_commands: BTreeMap::new(),
        }
    }

    pub fn ioc_initialized(&self) -> bool {
        self.ioc_state == IocState::Initialized
    }

    /// Apply the standin rewrite table to an absolute path, then resolve
    /// relative paths against the working directory.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let rewritten = self.apply_standins(path);
        let candidate = Path::new(&rewritten);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.cwd.join(candidate)
        }
    }

    fn apply_standins(&self, path: &str) -> String {
        if !Path::new(path).is_absolute() {
            return path.to_string();
        }
        for (prefix, replacement) in &self.options.standin_directories {
            if let Some(rest) = path.strip_prefix(prefix.as_str()) {
                return format!("{replacement}{rest}");
            }
        }
        path.to_string()
    }

    /// Read a file through the simulation: standin rewrite, cwd resolution,
    /// and digest bookkeeping in the loaded-file ledger.
    pub fn read_file(&mut self, path: &str) -> Result<(PathBuf, String), CommandError> {
        let resolved = self.resolve_path(path);
        self.read_resolved(path, &resolved)
    }

    /// Like [`ShellState::read_file`], but trying the database search paths
    /// when the working-directory candidate does not exist.
    pub fn read_db_file(&mut self, path: &str) -> Result<(PathBuf, String), CommandError> {
        let primary = self.resolve_path(path);
        if primary.exists() {
            return self.read_resolved(path, &primary);
        }
        let fallback = self
            .db_add_paths
            .iter()
            .map(|add_path| add_path.join(path))
            .find(|candidate| candidate.exists());
        if let Some(candidate) = fallback {
            return self.read_resolved(path, &candidate);
        }
        Err(CommandError::FileNotFound(path.to_string()))
    }

    fn read_resolved(
        &mut self,
        original: &str,
        resolved: &Path,
    ) -> Result<(PathBuf, String), CommandError> {
        if !resolved.exists() {
            return Err(CommandError::FileNotFound(original.to_string()));
        }
        let text = std::fs::read_to_string(resolved).map_err(|e| CommandError::ReadFailed {
            path: resolved.display().to_string(),
            message: e.to_string(),
        })?;
        self.loaded_files
            .insert(resolved.display().to_string(), text_digest(&text));
        Ok((resolved.to_path_buf(), text))
    }

    /// The grammar version to parse database text with: explicit option
    /// first, then EPICS base-version inference, else V3.
    pub fn db_grammar(&self) -> DbGrammar {
        if let Some(grammar) = self.options.grammar {
            return grammar;
        }
        match &self.base_version {
            Some(version) if version.split('.').next().and_then(|m| m.parse::<u32>().ok())
                >= Some(7) =>
            {
                DbGrammar::V4
            }
            _ => DbGrammar::V3,
        }
    }
}

/// Infer an EPICS base version from an `EPICS_BASE` path component such as
/// `/opt/epics/base-7.0.5` or `.../R3.15.9/...`.
pub fn infer_base_version(path: &str) -> Option<String> {
    for component in Path::new(path).components() {
        let text = component.as_os_str().to_string_lossy();
        for prefix in ["base-", "R", "base_"] {
            if let Some(rest) = text.strip_prefix(prefix) {
                if rest.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                    return Some(rest.to_string());
                }
            }
        }
    }
    None
}

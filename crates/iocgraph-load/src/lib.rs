//! Parallel IOC load orchestration.
//!
//! Each [`LoadDescriptor`] is interpreted independently, with its own
//! [`ShellState`](iocgraph_shell::ShellState), inside a bounded rayon pool:
//! interpretation mutates state that looks process-wide (the simulated
//! working directory), so nothing may leak across concurrent loads. Workers
//! share no mutable memory; each returns a self-contained [`IocLoadReport`]
//! that the orchestrator merges after the join.
//!
//! A failed load degrades to a report carrying the failure as a synthetic
//! script line, so the batch always completes and only that IOC is marked
//! failed.

pub mod cache;

pub use cache::{Cache, CacheKey, CACHE_FORMAT_VERSION};

use iocgraph_dsl::digest::content_digest;
use iocgraph_dsl::context::FullLoadContext;
use iocgraph_dsl::model::{Database, MetadataValue};
use iocgraph_graph::{build_relations, combine_relations, PVRelationGraph};
use iocgraph_ingest_gateway::GatewayPVList;
use iocgraph_shell::{load_ioc, CommandError, InterpreterOptions, IocLoadReport};
use iocgraph_shell::state::{Outcome, ShellResult};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Everything needed to interpret one IOC, loadable from JSON batch input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadDescriptor {
    /// IOC identifier, stamped onto every record it loads.
    pub name: String,
    /// Startup script path.
    pub script: String,
    /// Initial macro definitions.
    #[serde(default)]
    pub macros: Vec<(String, String)>,
    /// Initial working directory; defaults to the script's directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Absolute-path rewrites for archived IOC trees mounted elsewhere.
    #[serde(default)]
    pub standin_directories: BTreeMap<String, String>,
    /// Let macro expansion fall back to the process environment.
    #[serde(default)]
    pub use_environment: bool,
}

impl LoadDescriptor {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            macros: Vec::new(),
            cwd: None,
            standin_directories: BTreeMap::new(),
            use_environment: false,
        }
    }

    fn interpreter_options(&self) -> InterpreterOptions {
        InterpreterOptions {
            name: self.name.clone(),
            macros: self.macros.clone(),
            cwd: self.cwd.clone(),
            standin_directories: self.standin_directories.clone(),
            grammar: None,
            use_environment: self.use_environment,
        }
    }

    /// The cache identity of this descriptor. Anything that changes how the
    /// script is interpreted must appear here.
    fn cache_key(&self) -> CacheKey {
        let macros = self
            .macros
            .iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        let standins = self
            .standin_directories
            .iter()
            .map(|(from, to)| format!("{from}={to}"))
            .collect::<Vec<_>>()
            .join(",");
        CacheKey::new("IocLoadReport", CACHE_FORMAT_VERSION)
            .field("name", &self.name)
            .field("script", &self.script)
            .field("macros", macros)
            .field(
                "cwd",
                self.cwd
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            )
            .field("standins", standins)
            .field("env", self.use_environment.to_string())
    }
}

/// Knobs for one batch run.
#[derive(Debug, Default)]
pub struct BatchOptions {
    /// Worker pool size; `None` uses the rayon default.
    pub jobs: Option<usize>,
    /// Cache directory; `None` disables the cache.
    pub cache_dir: Option<PathBuf>,
    /// Gateway PV list applied to the merged records (the `gateway`
    /// metadata key).
    pub gateway: Option<GatewayPVList>,
}

/// The merged outcome of one batch: the union of every IOC's records,
/// aliases and file ledger, plus the combined relation graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IocLoadSet {
    /// Per-IOC reports, keyed by descriptor name.
    pub reports: BTreeMap<String, IocLoadReport>,
    /// IOCs whose interpretation failed outright.
    pub failed: BTreeSet<String>,
    /// IOCs satisfied from the cache without reinterpretation.
    pub from_cache: BTreeSet<String>,
    /// Union of all per-IOC databases (instances merged field-wise).
    pub database: Database,
    /// Union of every IOC's loaded-file digest ledger.
    pub loaded_files: BTreeMap<String, String>,
    /// The combined, alias-folded relation graph.
    pub relations: PVRelationGraph,
}

impl IocLoadSet {
    pub fn aliases(&self) -> &BTreeMap<String, String> {
        &self.database.aliases
    }
}

struct LoadedIoc {
    report: IocLoadReport,
    from_cache: bool,
    failed: bool,
}

/// Interpret every descriptor, fork/join, and merge the results.
pub fn load_many(descriptors: &[LoadDescriptor], options: &BatchOptions) -> IocLoadSet {
    let cache = options.cache_dir.as_ref().map(Cache::new);
    let run = || {
        descriptors
            .par_iter()
            .map(|descriptor| load_one(descriptor, cache.as_ref()))
            .collect::<Vec<_>>()
    };

    let loaded = match options.jobs {
        Some(jobs) => match rayon::ThreadPoolBuilder::new().num_threads(jobs).build() {
            Ok(pool) => pool.install(run),
            Err(e) => {
                tracing::warn!("falling back to the default worker pool: {e}");
                run()
            }
        },
        None => run(),
    };

    merge_loaded(loaded, options)
}

fn load_one(descriptor: &LoadDescriptor, cache: Option<&Cache>) -> LoadedIoc {
    if let Some(cache) = cache {
        if let Some(report) = cache.load::<IocLoadReport>(&descriptor.cache_key()) {
            if ledger_is_current(&report.loaded_files) {
                tracing::debug!(ioc = %descriptor.name, "cache hit");
                return LoadedIoc {
                    report,
                    from_cache: true,
                    failed: false,
                };
            }
            tracing::debug!(ioc = %descriptor.name, "cache entry stale");
        }
    }

    match load_ioc(descriptor.interpreter_options(), &descriptor.script) {
        Ok(report) => {
            if let Some(cache) = cache {
                if let Err(e) = cache.store(&descriptor.cache_key(), &report) {
                    tracing::warn!(ioc = %descriptor.name, "cache write failed: {e}");
                }
            }
            LoadedIoc {
                report,
                from_cache: false,
                failed: false,
            }
        }
        Err(e) => {
            tracing::warn!(ioc = %descriptor.name, "load failed: {e}");
            LoadedIoc {
                report: failure_report(descriptor, &e),
                from_cache: false,
                failed: true,
            }
        }
    }
}

/// A cached report stays valid while every file in its ledger still
/// digests to the recorded value.
fn ledger_is_current(loaded_files: &BTreeMap<String, String>) -> bool {
    loaded_files.iter().all(|(path, digest)| {
        match std::fs::read(Path::new(path)) {
            Ok(bytes) => content_digest(&bytes) == *digest,
            Err(_) => false,
        }
    })
}

/// Degenerate report for an IOC that could not be interpreted at all: the
/// failure is carried as a synthetic script line so the merged result still
/// has one entry per descriptor.
fn failure_report(descriptor: &LoadDescriptor, error: &CommandError) -> IocLoadReport {
    let context = FullLoadContext::single(descriptor.script.clone(), 0);
    let line = ShellResult {
        line: descriptor.script.clone(),
        context,
        argv: vec![descriptor.script.clone()],
        outcome: Outcome::Failure {
            class: error.class().to_string(),
            message: error.to_string(),
            trace: vec![format!("loading {}", descriptor.script)],
        },
        notes: BTreeMap::new(),
    };
    IocLoadReport {
        name: descriptor.name.clone(),
        script: descriptor.script.clone(),
        results: vec![line],
        database: Database::default(),
        loaded_files: BTreeMap::new(),
        variables: BTreeMap::new(),
        macros: BTreeMap::new(),
        ioc_initialized: false,
        base_version: None,
        unhandled_commands: BTreeMap::new(),
    }
}

fn merge_loaded(loaded: Vec<LoadedIoc>, options: &BatchOptions) -> IocLoadSet {
    let mut set = IocLoadSet::default();
    let mut graphs = Vec::with_capacity(loaded.len());

    for ioc in loaded {
        let name = ioc.report.name.clone();
        if ioc.failed {
            set.failed.insert(name.clone());
        }
        if ioc.from_cache {
            set.from_cache.insert(name.clone());
        }
        set.database.merge(ioc.report.database.clone());
        set.loaded_files.extend(ioc.report.loaded_files.clone());
        graphs.push(build_relations(&ioc.report.database));
        set.reports.insert(name, ioc.report);
    }

    combine_relations(&mut set.relations, graphs, &set.database.aliases);
    let known: BTreeSet<String> = set.database.records.keys().cloned().collect();
    set.relations.reconcile(&known);

    if let Some(pvlist) = &options.gateway {
        for record in set.database.records.values_mut() {
            let metadata = pvlist.metadata_for(&record.name);
            if !metadata.is_empty() {
                record
                    .metadata
                    .insert("gateway".to_string(), MetadataValue::Map(metadata));
            }
        }
    }

    tracing::info!(
        iocs = set.reports.len(),
        failed = set.failed.len(),
        records = set.database.records.len(),
        "batch merge complete"
    );
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    const DBD: &str = r#"
recordtype(ai) {
    field(VAL, DBF_DOUBLE) {
        prompt("Current Value")
    }
    field(INP, DBF_INLINK) {
        prompt("Input Specification")
    }
    field(FLNK, DBF_FWDLINK) {
        prompt("Forward Process Link")
    }
}
recordtype(ao) {
    field(VAL, DBF_DOUBLE) {
        prompt("Desired Output")
    }
    field(OUT, DBF_OUTLINK) {
        prompt("Output Specification")
    }
}
"#;

    fn write(dir: &Path, name: &str, text: &str) -> String {
        let path = dir.join(name);
        fs::write(&path, text).expect("write fixture");
        path.display().to_string()
    }

    fn ioc_fixture(dir: &Path, ioc: &str, db: &str) -> LoadDescriptor {
        let sub = dir.join(ioc);
        fs::create_dir_all(&sub).expect("fixture dir");
        write(&sub, "ioc.dbd", DBD);
        write(&sub, "ioc.db", db);
        let script = write(
            &sub,
            "st.cmd",
            "dbLoadDatabase(\"ioc.dbd\")\ndbLoadRecords(\"ioc.db\")\niocInit\n",
        );
        LoadDescriptor::new(ioc, script)
    }

    #[test]
    fn batch_merges_databases_and_relations_across_iocs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = ioc_fixture(
            dir.path(),
            "ioc-a",
            "record(ai, \"A:TEMP\") {\n    field(INP, \"B:SET CPP MS\")\n}\n",
        );
        let b = ioc_fixture(
            dir.path(),
            "ioc-b",
            "record(ao, \"B:SET\") {\n    field(VAL, \"20\")\n}\n",
        );

        let set = load_many(&[a, b], &BatchOptions::default());
        assert!(set.failed.is_empty());
        assert_eq!(set.database.records.len(), 2);
        assert_eq!(set.database.records["A:TEMP"].owner, "ioc-a");
        assert_eq!(set.database.records["B:SET"].owner, "ioc-b");

        // The A->B edge was built before ioc-b's record existed; the merge
        // reconciles it.
        assert_eq!(set.relations.edges_between("A:TEMP", "B:SET").len(), 1);
        assert_eq!(set.relations.edges_between("B:SET", "A:TEMP").len(), 1);
        assert!(set.relations.unknown_targets.is_empty());
    }

    #[test]
    fn a_failed_ioc_degrades_without_sinking_the_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = ioc_fixture(dir.path(), "ioc-good", "record(ai, \"G\") {\n}\n");
        let bad = LoadDescriptor::new("ioc-bad", "/nowhere/st.cmd");

        let set = load_many(&[good, bad], &BatchOptions::default());
        assert_eq!(set.failed.len(), 1);
        assert!(set.failed.contains("ioc-bad"));
        assert_eq!(set.database.records.len(), 1);

        let report = &set.reports["ioc-bad"];
        assert_eq!(report.results.len(), 1);
        match &report.results[0].outcome {
            Outcome::Failure { class, .. } => assert_eq!(class, "FileNotFound"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn cache_short_circuits_until_a_file_changes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache_dir = dir.path().join("cache");
        let descriptor = ioc_fixture(dir.path(), "ioc-c", "record(ai, \"C\") {\n}\n");
        let options = BatchOptions {
            cache_dir: Some(cache_dir),
            ..BatchOptions::default()
        };

        let first = load_many(std::slice::from_ref(&descriptor), &options);
        assert!(first.from_cache.is_empty());

        let second = load_many(std::slice::from_ref(&descriptor), &options);
        assert!(second.from_cache.contains("ioc-c"));
        assert_eq!(second.database.records.len(), 1);

        // Touching a ledgered file invalidates the entry.
        let db_path = dir.path().join("ioc-c").join("ioc.db");
        fs::write(&db_path, "record(ai, \"C\") {\n}\nrecord(ai, \"C2\") {\n}\n")
            .expect("rewrite db");
        let third = load_many(std::slice::from_ref(&descriptor), &options);
        assert!(third.from_cache.is_empty());
        assert_eq!(third.database.records.len(), 2);
    }

    #[test]
    fn gateway_rules_annotate_merged_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let descriptor = ioc_fixture(dir.path(), "ioc-g", "record(ai, \"RING:X\") {\n}\n");
        let pvlist = iocgraph_ingest_gateway::parse_pvlist(
            "RING:.* ALLOW\n",
            "gateway.pvlist",
            &FullLoadContext::empty(),
        )
        .expect("pvlist");

        let set = load_many(
            std::slice::from_ref(&descriptor),
            &BatchOptions {
                gateway: Some(pvlist),
                ..BatchOptions::default()
            },
        );
        let record = &set.database.records["RING:X"];
        match record.metadata.get("gateway") {
            Some(MetadataValue::Map(map)) => assert!(!map.is_empty()),
            other => panic!("expected gateway metadata, got {other:?}"),
        }
    }
}

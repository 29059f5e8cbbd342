//! iocgraph CLI
//!
//! Command-line front end for the iocgraph library stack:
//! - Parsing individual EPICS configuration files to JSON
//! - Interpreting one startup script into a load report
//! - Building the combined PV relation graph for a set of IOCs
//! - Batch-loading many IOCs from a descriptor file, with caching

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use iocgraph_dsl::context::FullLoadContext;
use iocgraph_dsl::db::{parse_database, DbGrammar, DbParseOptions};
use iocgraph_dsl::macros::parse_definitions;
use iocgraph_dsl::model::LintMessage;
use iocgraph_dsl::substitution::parse_substitution;
use iocgraph_load::{load_many, BatchOptions, LoadDescriptor};
use iocgraph_shell::{load_ioc, InterpreterOptions, IocLoadReport};
use iocgraph_shell::state::Outcome;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "iocgraph")]
#[command(author, version, about = "Analyze EPICS IOC configurations")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse one configuration file and emit its model as JSON.
    Parse {
        /// Input file (.db/.dbd/.substitutions/.sav/.acf/.proto/.pvlist/.st).
        input: PathBuf,
        /// File format; inferred from the extension when omitted.
        #[arg(short, long, value_enum)]
        format: Option<ParseFormat>,
        /// Parse database text with the V4 grammar.
        #[arg(long)]
        v4: bool,
        /// Output JSON path; stdout when omitted.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Interpret a startup script and emit the load report as JSON.
    Interpret {
        /// Startup script (st.cmd).
        script: PathBuf,
        /// IOC identifier; defaults to the script's directory name.
        #[arg(long)]
        name: Option<String>,
        /// Initial macro definitions (`P=RING:,IOC=ioc-a`).
        #[arg(short, long)]
        macros: Option<String>,
        /// Absolute-path rewrite `FROM=TO`; may repeat.
        #[arg(long = "standin")]
        standins: Vec<String>,
        /// Let macro expansion fall back to the process environment.
        #[arg(long)]
        use_environment: bool,
        /// Parse database text with the V4 grammar.
        #[arg(long)]
        v4: bool,
        /// Output JSON path; stdout when omitted.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Build the combined relation graph for a set of startup scripts.
    Graph {
        /// Startup scripts, or directories to scan for `*.cmd` files.
        paths: Vec<PathBuf>,
        /// Output JSON path; stdout when omitted.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Load every IOC in a JSON descriptor file and emit the merged result.
    Batch {
        /// Descriptor file: a JSON array of load descriptors.
        descriptors: PathBuf,
        /// Worker pool size; rayon default when omitted.
        #[arg(short, long)]
        jobs: Option<usize>,
        /// Cache directory for per-IOC reports.
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// Gateway PV list applied to the merged records.
        #[arg(long)]
        pvlist: Option<PathBuf>,
        /// Output JSON path; stdout when omitted.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ParseFormat {
    Db,
    Dbd,
    Template,
    Autosave,
    Acf,
    Proto,
    Pvlist,
    Snl,
}

impl ParseFormat {
    fn infer(path: &Path) -> Option<ParseFormat> {
        match path.extension()?.to_str()? {
            "db" | "vdb" => Some(ParseFormat::Db),
            "dbd" => Some(ParseFormat::Dbd),
            "substitutions" | "template" => Some(ParseFormat::Template),
            "sav" => Some(ParseFormat::Autosave),
            "acf" => Some(ParseFormat::Acf),
            "proto" | "protocol" => Some(ParseFormat::Proto),
            "pvlist" => Some(ParseFormat::Pvlist),
            "st" => Some(ParseFormat::Snl),
            _ => None,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli.command) {
        eprintln!("{} {e:#}", "error:".red().bold());
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Parse {
            input,
            format,
            v4,
            out,
        } => cmd_parse(&input, format, v4, out.as_deref()),
        Commands::Interpret {
            script,
            name,
            macros,
            standins,
            use_environment,
            v4,
            out,
        } => cmd_interpret(
            &script,
            name,
            macros.as_deref(),
            &standins,
            use_environment,
            v4,
            out.as_deref(),
        ),
        Commands::Graph { paths, out } => cmd_graph(&paths, out.as_deref()),
        Commands::Batch {
            descriptors,
            jobs,
            cache_dir,
            pvlist,
            out,
        } => cmd_batch(&descriptors, jobs, cache_dir, pvlist.as_deref(), out.as_deref()),
    }
}

// ----------------------------------------------------------------------
// parse
// ----------------------------------------------------------------------

fn cmd_parse(
    input: &Path,
    format: Option<ParseFormat>,
    v4: bool,
    out: Option<&Path>,
) -> Result<()> {
    let format = format
        .or_else(|| ParseFormat::infer(input))
        .ok_or_else(|| anyhow!("cannot infer format of {}; pass --format", input.display()))?;
    let text = fs::read_to_string(input)
        .with_context(|| format!("reading {}", input.display()))?;
    let source = input.display().to_string();
    let base = FullLoadContext::empty();
    let grammar = if v4 { DbGrammar::V4 } else { DbGrammar::V3 };

    let mut lint_errors = 0usize;
    let value = match format {
        ParseFormat::Db | ParseFormat::Dbd => {
            let db = parse_database(&text, DbParseOptions::new(source, grammar))?;
            report_lint(&db.lint.warnings, &db.lint.errors);
            lint_errors = db.lint.errors.len();
            serde_json::to_value(&db)?
        }
        ParseFormat::Template => {
            let rows = parse_substitution(&text, &source, &base)?;
            serde_json::to_value(&rows)?
        }
        ParseFormat::Autosave => {
            let restore = iocgraph_ingest_autosave::parse_autosave(&text, &source, &base)?;
            serde_json::to_value(&restore)?
        }
        ParseFormat::Acf => {
            let config = iocgraph_ingest_acf::parse_acf(&text, &source, &base)?;
            serde_json::to_value(&config)?
        }
        ParseFormat::Proto => {
            let protocols = iocgraph_ingest_stream::parse_protocol(&text, &source, &base)?;
            serde_json::to_value(&protocols)?
        }
        ParseFormat::Pvlist => {
            let pvlist = iocgraph_ingest_gateway::parse_pvlist(&text, &source, &base)?;
            serde_json::to_value(&pvlist)?
        }
        ParseFormat::Snl => {
            let program = iocgraph_ingest_snl::parse_program_header(&text, &source, &base)?;
            serde_json::to_value(&program)?
        }
    };

    write_json(out, &value)?;
    if lint_errors > 0 {
        bail!("{lint_errors} lint error(s) in {}", input.display());
    }
    Ok(())
}

fn report_lint(warnings: &[LintMessage], errors: &[LintMessage]) {
    for w in warnings {
        eprintln!(
            "{} [{}] {} ({})",
            "warning:".yellow().bold(),
            w.code,
            w.message,
            w.context
        );
    }
    for e in errors {
        eprintln!(
            "{} [{}] {} ({})",
            "error:".red().bold(),
            e.code,
            e.message,
            e.context
        );
    }
}

// ----------------------------------------------------------------------
// interpret
// ----------------------------------------------------------------------

fn cmd_interpret(
    script: &Path,
    name: Option<String>,
    macros: Option<&str>,
    standins: &[String],
    use_environment: bool,
    v4: bool,
    out: Option<&Path>,
) -> Result<()> {
    let name = name.unwrap_or_else(|| ioc_name_for(script));
    let mut standin_directories = BTreeMap::new();
    for entry in standins {
        let (from, to) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("bad --standin {entry:?}; expected FROM=TO"))?;
        standin_directories.insert(from.to_string(), to.to_string());
    }
    let options = InterpreterOptions {
        name,
        macros: macros.map(parse_definitions).transpose()?.unwrap_or_default(),
        cwd: None,
        standin_directories,
        grammar: v4.then_some(DbGrammar::V4),
        use_environment,
    };

    let report = load_ioc(options, &script.display().to_string())?;
    let failures = failure_count(&report);
    write_json(out, &serde_json::to_value(&report)?)?;

    eprintln!(
        "{} {}: {} line(s), {} record(s), {} failure(s)",
        "ok:".green().bold(),
        report.name,
        report.results.len(),
        report.database.records.len(),
        failures
    );
    if failures > 0 {
        bail!("{failures} command(s) failed in {}", report.script);
    }
    Ok(())
}

fn failure_count(report: &IocLoadReport) -> usize {
    report
        .results
        .iter()
        .filter(|r| matches!(r.outcome, Outcome::Failure { .. }))
        .count()
}

fn ioc_name_for(script: &Path) -> String {
    script
        .parent()
        .and_then(Path::file_name)
        .or_else(|| script.file_stem())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ioc".to_string())
}

// ----------------------------------------------------------------------
// graph
// ----------------------------------------------------------------------

fn cmd_graph(paths: &[PathBuf], out: Option<&Path>) -> Result<()> {
    let scripts = collect_scripts(paths)?;
    if scripts.is_empty() {
        bail!("no startup scripts found");
    }

    let descriptors: Vec<LoadDescriptor> = scripts
        .iter()
        .map(|script| LoadDescriptor::new(ioc_name_for(script), script.display().to_string()))
        .collect();
    let set = load_many(&descriptors, &BatchOptions::default());

    for name in &set.failed {
        eprintln!("{} {name} failed to load", "warning:".yellow().bold());
    }
    write_json(out, &serde_json::to_value(&set.relations)?)?;
    eprintln!(
        "{} {} IOC(s), {} record(s), {} unresolved target(s)",
        "ok:".green().bold(),
        set.reports.len(),
        set.database.records.len(),
        set.relations.unknown_targets.len()
    );
    Ok(())
}

/// Scripts named directly, plus every `*.cmd` file under named directories.
fn collect_scripts(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut scripts = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in walkdir::WalkDir::new(path).sort_by_file_name() {
                let entry = entry?;
                if entry.file_type().is_file()
                    && entry.path().extension().is_some_and(|ext| ext == "cmd")
                {
                    scripts.push(entry.path().to_path_buf());
                }
            }
        } else {
            scripts.push(path.clone());
        }
    }
    Ok(scripts)
}

// ----------------------------------------------------------------------
// batch
// ----------------------------------------------------------------------

fn cmd_batch(
    descriptors_path: &Path,
    jobs: Option<usize>,
    cache_dir: Option<PathBuf>,
    pvlist: Option<&Path>,
    out: Option<&Path>,
) -> Result<()> {
    let text = fs::read_to_string(descriptors_path)
        .with_context(|| format!("reading {}", descriptors_path.display()))?;
    let descriptors: Vec<LoadDescriptor> = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", descriptors_path.display()))?;

    let gateway = match pvlist {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Some(iocgraph_ingest_gateway::parse_pvlist(
                &text,
                &path.display().to_string(),
                &FullLoadContext::empty(),
            )?)
        }
        None => None,
    };

    let options = BatchOptions {
        jobs,
        cache_dir,
        gateway,
    };
    let set = load_many(&descriptors, &options);

    for (name, report) in &set.reports {
        if set.failed.contains(name) {
            eprintln!("{} {name}", "failed:".red().bold());
        } else {
            let cached = if set.from_cache.contains(name) {
                " (cached)"
            } else {
                ""
            };
            eprintln!(
                "{} {name}: {} record(s){cached}",
                "ok:".green().bold(),
                report.database.records.len()
            );
        }
    }
    write_json(out, &serde_json::to_value(&set)?)?;
    if !set.failed.is_empty() {
        bail!("{} IOC(s) failed to load", set.failed.len());
    }
    Ok(())
}

// ----------------------------------------------------------------------

fn write_json(out: Option<&Path>, value: &serde_json::Value) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)?;
    match out {
        Some(path) => fs::write(path, rendered)
            .with_context(|| format!("writing {}", path.display()))?,
        None => println!("{rendered}"),
    }
    Ok(())
}

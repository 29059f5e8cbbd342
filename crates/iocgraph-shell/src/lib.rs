//! The IOC shell interpreter.
//!
//! Replays a startup script command by command against a simulated IOC
//! environment ([`state::ShellState`]): working directory, macros, loaded
//! databases and the device registries of the pluggable sub-handlers. One
//! interpretation is strictly sequential; run independent IOCs on separate
//! interpreters for parallelism.
//!
//! ```no_run
//! use iocgraph_shell::{load_ioc, InterpreterOptions};
//!
//! let mut options = InterpreterOptions::default();
//! options.name = "ioc-ring-01".to_string();
//! let report = load_ioc(options, "/iocs/ring01/st.cmd").expect("script exists");
//! println!("{} records", report.database.records.len());
//! ```

pub mod commands;
pub mod handlers;
pub mod interpreter;
pub mod state;

pub use commands::{parse_argv, Command};
pub use handlers::{default_handlers, SubHandler};
pub use interpreter::{load_ioc, IocLoadReport, ShellInterpreter};
pub use state::{
    CommandError, InterpreterOptions, IocState, Outcome, ShellResult, ShellState,
};

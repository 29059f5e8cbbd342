//! Pluggable sub-handlers for hardware/device shell commands.
//!
//! The interpreter holds an ordered collection of trait objects; each handler
//! claims the commands it understands, keeps its registry slice inside
//! [`DeviceRegistries`](crate::state::DeviceRegistries), participates in the
//! `iocInit` lifecycle, and may annotate records once the full database is
//! loaded.

mod access;
mod asyn;
mod autosave;
mod motor;
mod stream;

pub use access::AccessHandler;
pub use asyn::AsynHandler;
pub use autosave::AutosaveHandler;
pub use motor::MotorHandler;
pub use stream::StreamHandler;

use crate::state::{CommandError, ShellState};
use iocgraph_dsl::context::FullLoadContext;
use iocgraph_dsl::model::{MetadataValue, RecordInstance};
use std::collections::BTreeMap;

/// Notes a handler hook attaches to the current result.
pub type HandlerNotes = BTreeMap<String, String>;

/// One sub-handler: a capability object the interpreter consults in
/// registration order.
pub trait SubHandler {
    /// Registry/metadata key for this handler.
    fn name(&self) -> &'static str;

    /// Claim and execute a command. `None` means "not mine"; the interpreter
    /// then asks the next handler. An `Err` is captured on the line's result
    /// like any other command failure.
    fn try_command(
        &mut self,
        _state: &mut ShellState,
        _argv: &[String],
        _context: &FullLoadContext,
    ) -> Option<Result<HandlerNotes, CommandError>> {
        None
    }

    /// Observe `epicsEnvSet` (well-known variable hook).
    fn env_set(&mut self, _state: &mut ShellState, _name: &str, _value: &str) {}

    /// Runs before records are considered live, in registration order.
    fn pre_ioc_init(&mut self, _state: &mut ShellState) -> HandlerNotes {
        HandlerNotes::new()
    }

    /// Runs after the IOC is up, in registration order.
    fn post_ioc_init(&mut self, _state: &mut ShellState) -> HandlerNotes {
        HandlerNotes::new()
    }

    /// Read any files the annotation pass needs (ledger-tracked reads).
    fn prepare_annotations(&mut self, _state: &mut ShellState) {}

    /// Attach handler-specific metadata to one record, keyed by
    /// [`SubHandler::name`]. Runs after all scripts are loaded.
    fn annotate_record(
        &self,
        _state: &ShellState,
        _record: &RecordInstance,
    ) -> Option<MetadataValue> {
        None
    }
}

/// The standard handler set, in registration order.
pub fn default_handlers() -> Vec<Box<dyn SubHandler>> {
    vec![
        Box::new(AsynHandler),
        Box::new(MotorHandler),
        Box::new(AutosaveHandler),
        Box::new(StreamHandler),
        Box::new(AccessHandler),
    ]
}

/// Parse an `@asyn(PORT, ADDR[, TIMEOUT])` / `@asynMask(...)` link value
/// into its port name and address, when it is one.
pub(crate) fn parse_asyn_link(value: &str) -> Option<(String, Option<String>)> {
    let rest = value
        .trim()
        .strip_prefix("@asynMask(")
        .or_else(|| value.trim().strip_prefix("@asyn("))?;
    let close = rest.find(')')?;
    let mut args = rest[..close].split(',').map(str::trim);
    let port = args.next()?.to_string();
    if port.is_empty() {
        return None;
    }
    Some((port, args.next().map(str::to_string)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asyn_link_values_parse() {
        assert_eq!(
            parse_asyn_link("@asyn(L0, 3, 1.0) TEMP"),
            Some(("L0".to_string(), Some("3".to_string())))
        );
        assert_eq!(
            parse_asyn_link("@asynMask(MASK1,0,0xFF)"),
            Some(("MASK1".to_string(), Some("0".to_string())))
        );
        assert_eq!(parse_asyn_link("@somethingelse"), None);
        assert_eq!(parse_asyn_link("PLAIN:pv"), None);
    }
}

//! Access-security registry (`asSetFilename` / `asInit`).

use super::{HandlerNotes, SubHandler};
use crate::state::{CommandError, ShellState};
use iocgraph_dsl::context::FullLoadContext;
use iocgraph_dsl::model::{MetadataValue, RecordInstance};
use iocgraph_ingest_acf::parse_acf;
use std::collections::BTreeMap;

pub struct AccessHandler;

impl AccessHandler {
    /// Parse the registered configuration file, if any and not done yet.
    fn load_config(state: &mut ShellState) -> Result<HandlerNotes, CommandError> {
        let Some(file) = state.devices.access_file.clone() else {
            return Ok(HandlerNotes::new());
        };
        if state.devices.access.is_some() {
            return Ok(HandlerNotes::new());
        }
        let (resolved, text) = state.read_file(&file)?;
        let base = state.load_context.clone();
        let config = parse_acf(&text, &resolved.display().to_string(), &base)
            .map_err(|e| CommandError::Parse(e.to_string()))?;
        let mut notes = HandlerNotes::new();
        notes.insert("groups".to_string(), config.groups.len().to_string());
        state.devices.access = Some(config);
        Ok(notes)
    }
}

impl SubHandler for AccessHandler {
    fn name(&self) -> &'static str {
        "access"
    }

    fn try_command(
        &mut self,
        state: &mut ShellState,
        argv: &[String],
        _context: &FullLoadContext,
    ) -> Option<Result<HandlerNotes, CommandError>> {
        match argv[0].as_str() {
            "asSetFilename" => {
                if argv.len() < 2 {
                    return Some(Err(CommandError::BadArguments {
                        command: argv[0].clone(),
                        expected: "1",
                        got: argv.len() - 1,
                    }));
                }
                state.devices.access_file = Some(argv[1].clone());
                Some(Ok(HandlerNotes::new()))
            }
            "asInit" => Some(Self::load_config(state)),
            _ => None,
        }
    }

    /// `iocInit` initializes access security implicitly when a file was set.
    fn pre_ioc_init(&mut self, state: &mut ShellState) -> HandlerNotes {
        match Self::load_config(state) {
            Ok(notes) => notes,
            Err(e) => {
                tracing::warn!("access security configuration failed: {e}");
                let mut notes = HandlerNotes::new();
                notes.insert("error".to_string(), e.to_string());
                notes
            }
        }
    }

    fn annotate_record(
        &self,
        state: &ShellState,
        record: &RecordInstance,
    ) -> Option<MetadataValue> {
        let config = state.devices.access.as_ref()?;
        let group_name = record.field_value("ASG").unwrap_or("DEFAULT");
        let group = config.groups.get(group_name)?;

        let mut map = BTreeMap::new();
        map.insert("group".to_string(), group.name.clone());
        map.insert("rules".to_string(), group.rules.len().to_string());
        if !group.inputs.is_empty() {
            map.insert(
                "inputs".to_string(),
                group
                    .inputs
                    .iter()
                    .map(|i| i.pvname.clone())
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }
        Some(MetadataValue::Map(map))
    }
}

//! Autosave registry: restore-file registration and the pass-0/pass-1
//! restores that run inside `iocInit`.

use super::{HandlerNotes, SubHandler};
use crate::state::{CommandError, RestoreFileRequest, ShellState};
use iocgraph_dsl::context::FullLoadContext;
use iocgraph_dsl::model::{MetadataValue, RecordInstance};
use iocgraph_ingest_autosave::{parse_autosave, RestoreValue};
use std::collections::BTreeMap;

pub struct AutosaveHandler;

impl AutosaveHandler {
    fn register_restore(
        state: &mut ShellState,
        argv: &[String],
        pass: u8,
        context: &FullLoadContext,
    ) -> Result<HandlerNotes, CommandError> {
        if argv.len() < 2 {
            return Err(CommandError::BadArguments {
                command: argv[0].clone(),
                expected: "1",
                got: argv.len() - 1,
            });
        }
        state.devices.restore_requests.push(RestoreFileRequest {
            pass,
            path: argv[1].clone(),
            context: context.clone(),
        });
        Ok(HandlerNotes::new())
    }

    /// Parse every restore file registered for `pass`, tracking reads in the
    /// ledger. Missing or unparseable files are noted, never fatal.
    fn run_pass(state: &mut ShellState, pass: u8) -> HandlerNotes {
        let mut notes = HandlerNotes::new();
        let requests: Vec<RestoreFileRequest> = state
            .devices
            .restore_requests
            .iter()
            .filter(|r| r.pass == pass)
            .cloned()
            .collect();
        let mut restored = 0usize;
        for request in requests {
            // Files live under the save path unless given with a directory.
            let path = match (&state.devices.save_path, request.path.contains('/')) {
                (Some(save_path), false) => format!("{save_path}/{}", request.path),
                _ => request.path.clone(),
            };
            match state.read_file(&path) {
                Ok((resolved, text)) => {
                    match parse_autosave(&text, &resolved.display().to_string(), &request.context) {
                        Ok(restore) => {
                            restored += restore.values.len();
                            state.devices.restores.push(restore);
                        }
                        Err(e) => {
                            notes.insert(request.path.clone(), format!("unparseable: {e}"));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(file = %request.path, pass, "restore file unavailable: {e}");
                    notes.insert(request.path.clone(), format!("unavailable: {e}"));
                }
            }
        }
        notes.insert(format!("restored_pass{pass}"), restored.to_string());
        notes
    }
}

impl SubHandler for AutosaveHandler {
    fn name(&self) -> &'static str {
        "autosave"
    }

    fn try_command(
        &mut self,
        state: &mut ShellState,
        argv: &[String],
        context: &FullLoadContext,
    ) -> Option<Result<HandlerNotes, CommandError>> {
        match argv[0].as_str() {
            "set_savefile_path" => {
                if argv.len() < 2 {
                    return Some(Err(CommandError::BadArguments {
                        command: argv[0].clone(),
                        expected: "at least 1",
                        got: argv.len() - 1,
                    }));
                }
                // An optional second argument is a subdirectory.
                let path = match argv.get(2) {
                    Some(sub) if !sub.is_empty() => format!("{}/{sub}", argv[1]),
                    _ => argv[1].clone(),
                };
                state.devices.save_path = Some(path);
                Some(Ok(HandlerNotes::new()))
            }
            "set_requestfile_path" => {
                if argv.len() < 2 {
                    return Some(Err(CommandError::BadArguments {
                        command: argv[0].clone(),
                        expected: "at least 1",
                        got: argv.len() - 1,
                    }));
                }
                state.devices.request_paths.push(argv[1].clone());
                Some(Ok(HandlerNotes::new()))
            }
            "set_pass0_restoreFile" => Some(Self::register_restore(state, argv, 0, context)),
            "set_pass1_restoreFile" => Some(Self::register_restore(state, argv, 1, context)),
            _ => None,
        }
    }

    fn pre_ioc_init(&mut self, state: &mut ShellState) -> HandlerNotes {
        Self::run_pass(state, 0)
    }

    fn post_ioc_init(&mut self, state: &mut ShellState) -> HandlerNotes {
        Self::run_pass(state, 1)
    }

    fn annotate_record(
        &self,
        state: &ShellState,
        record: &RecordInstance,
    ) -> Option<MetadataValue> {
        let mut map = BTreeMap::new();
        for restore in &state.devices.restores {
            if let Some(fields) = restore.values.get(&record.name) {
                for (field, entry) in fields {
                    let rendered = match &entry.value {
                        RestoreValue::Scalar(s) => s.clone(),
                        RestoreValue::Array(items) => format!("[{}]", items.join(", ")),
                    };
                    map.insert(field.clone(), rendered);
                }
            }
        }
        if map.is_empty() {
            return None;
        }
        Some(MetadataValue::Map(map))
    }
}

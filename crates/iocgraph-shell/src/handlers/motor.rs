//! Motor controller registry (`*CreateController` / `*CreateAxis`).
//!
//! Controller creation commands across motor drivers share the
//! `<Driver>CreateController(name, asynPort, numAxes, ...)` shape, so the
//! handler claims by suffix rather than enumerating every driver.

use super::{parse_asyn_link, HandlerNotes, SubHandler};
use crate::state::{CommandError, MotorController, ShellState};
use iocgraph_dsl::context::FullLoadContext;
use iocgraph_dsl::model::{MetadataValue, RecordInstance};
use std::collections::BTreeMap;

pub struct MotorHandler;

impl MotorHandler {
    fn create_controller(
        state: &mut ShellState,
        argv: &[String],
        context: &FullLoadContext,
    ) -> Result<HandlerNotes, CommandError> {
        if argv.len() < 3 {
            return Err(CommandError::BadArguments {
                command: argv[0].clone(),
                expected: "at least 2",
                got: argv.len() - 1,
            });
        }
        let name = argv[1].clone();
        let asyn_port_name = argv[2].clone();
        let num_axes = argv
            .get(3)
            .and_then(|a| a.parse::<usize>().ok())
            .unwrap_or(1);

        let port_known = state.devices.asyn_ports.contains_key(&asyn_port_name);
        state.devices.motors.insert(
            name.clone(),
            MotorController {
                name: name.clone(),
                asyn_port: port_known.then(|| asyn_port_name.clone()),
                num_axes,
                context: context.clone(),
            },
        );
        if !port_known {
            // The controller is kept with an unresolved port; only this
            // command fails.
            return Err(CommandError::MissingReference {
                kind: "asyn port",
                name: asyn_port_name,
            });
        }
        let mut notes = HandlerNotes::new();
        notes.insert("controller".to_string(), name);
        notes.insert("port".to_string(), asyn_port_name);
        Ok(notes)
    }

    fn create_axis(state: &mut ShellState, argv: &[String]) -> Result<HandlerNotes, CommandError> {
        if argv.len() < 2 {
            return Err(CommandError::BadArguments {
                command: argv[0].clone(),
                expected: "at least 1",
                got: argv.len() - 1,
            });
        }
        let name = &argv[1];
        if !state.devices.motors.contains_key(name) {
            return Err(CommandError::MissingReference {
                kind: "motor controller",
                name: name.clone(),
            });
        }
        Ok(HandlerNotes::new())
    }
}

impl SubHandler for MotorHandler {
    fn name(&self) -> &'static str {
        "motor"
    }

    fn try_command(
        &mut self,
        state: &mut ShellState,
        argv: &[String],
        context: &FullLoadContext,
    ) -> Option<Result<HandlerNotes, CommandError>> {
        let command = argv[0].as_str();
        if command.ends_with("CreateController") {
            return Some(Self::create_controller(state, argv, context));
        }
        if command.ends_with("CreateAxis") {
            return Some(Self::create_axis(state, argv));
        }
        None
    }

    fn annotate_record(
        &self,
        state: &ShellState,
        record: &RecordInstance,
    ) -> Option<MetadataValue> {
        let dtype = record.field_value("DTYP")?;
        if !dtype.contains("Motor") {
            return None;
        }
        let link = record
            .field_value("OUT")
            .or_else(|| record.field_value("INP"))?;
        let (controller_name, axis) = parse_asyn_link(link)?;
        let controller = state.devices.motors.get(&controller_name)?;

        let mut map = BTreeMap::new();
        map.insert("controller".to_string(), controller_name);
        if let Some(axis) = axis {
            map.insert("axis".to_string(), axis);
        }
        if let Some(port) = &controller.asyn_port {
            map.insert("port".to_string(), port.clone());
            if let Some(asyn) = state.devices.asyn_ports.get(port) {
                map.insert("address".to_string(), asyn.address.clone());
            }
        }
        Some(MetadataValue::Map(map))
    }
}

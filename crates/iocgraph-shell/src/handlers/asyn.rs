//! Serial/IP port registry (`drvAsyn*PortConfigure`, `asynSetOption`).

use super::{parse_asyn_link, HandlerNotes, SubHandler};
use crate::state::{AsynPort, AsynPortKind, CommandError, ShellState};
use iocgraph_dsl::context::FullLoadContext;
use iocgraph_dsl::model::{MetadataValue, RecordInstance};
use std::collections::BTreeMap;

pub struct AsynHandler;

impl AsynHandler {
    fn configure_port(
        state: &mut ShellState,
        argv: &[String],
        kind: AsynPortKind,
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
        let address = argv[2].clone();
        state.devices.asyn_ports.insert(
            name.clone(),
            AsynPort {
                name: name.clone(),
                kind,
                address: address.clone(),
                options: BTreeMap::new(),
                context: context.clone(),
            },
        );
        let mut notes = HandlerNotes::new();
        notes.insert("port".to_string(), name);
        notes.insert("address".to_string(), address);
        Ok(notes)
    }

    fn set_option(
        state: &mut ShellState,
        argv: &[String],
    ) -> Result<HandlerNotes, CommandError> {
        if argv.len() != 5 {
            return Err(CommandError::BadArguments {
                command: argv[0].clone(),
                expected: "4",
                got: argv.len() - 1,
            });
        }
        let name = &argv[1];
        let Some(port) = state.devices.asyn_ports.get_mut(name) else {
            return Err(CommandError::MissingReference {
                kind: "asyn port",
                name: name.clone(),
            });
        };
        port.options.insert(argv[3].clone(), argv[4].clone());
        Ok(HandlerNotes::new())
    }
}

impl SubHandler for AsynHandler {
    fn name(&self) -> &'static str {
        "asyn"
    }

    fn try_command(
        &mut self,
        state: &mut ShellState,
        argv: &[String],
        context: &FullLoadContext,
    ) -> Option<Result<HandlerNotes, CommandError>> {
        match argv[0].as_str() {
            "drvAsynSerialPortConfigure" => Some(Self::configure_port(
                state,
                argv,
                AsynPortKind::Serial,
                context,
            )),
            "drvAsynIPPortConfigure" => {
                Some(Self::configure_port(state, argv, AsynPortKind::Ip, context))
            }
            "asynSetOption" => Some(Self::set_option(state, argv)),
            _ => None,
        }
    }

    fn annotate_record(
        &self,
        state: &ShellState,
        record: &RecordInstance,
    ) -> Option<MetadataValue> {
        let link = record
            .field_value("INP")
            .or_else(|| record.field_value("OUT"))?;
        let (port_name, addr) = parse_asyn_link(link)?;

        let mut map = BTreeMap::new();
        map.insert("port".to_string(), port_name.clone());
        if let Some(addr) = addr {
            map.insert("addr".to_string(), addr);
        }
        if let Some(port) = state.devices.asyn_ports.get(&port_name) {
            map.insert("address".to_string(), port.address.clone());
            map.insert(
                "kind".to_string(),
                match port.kind {
                    AsynPortKind::Serial => "serial".to_string(),
                    AsynPortKind::Ip => "ip".to_string(),
                },
            );
        }
        Some(MetadataValue::Map(map))
    }
}

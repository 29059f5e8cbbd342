//! Device-protocol registry for stream-style device support.
//!
//! There is no dedicated shell command: the protocol search path arrives via
//! `epicsEnvSet("STREAM_PROTOCOL_PATH", ...)`, and the protocol files a
//! record actually uses are discovered from its `INP`/`OUT` links during the
//! annotation pass.

use super::{HandlerNotes, SubHandler};
use crate::state::ShellState;
use iocgraph_dsl::model::{MetadataValue, RecordInstance};
use iocgraph_ingest_stream::parse_protocol;
use std::collections::BTreeMap;

pub struct StreamHandler;

/// Split `@file.proto protocol(args) port [addr]` into its parts.
fn parse_stream_link(value: &str) -> Option<(String, String, Option<String>)> {
    let rest = value.trim().strip_prefix('@')?;
    // `@asyn(...)` links belong to the asyn handler.
    if rest.starts_with("asyn(") || rest.starts_with("asynMask(") {
        return None;
    }
    let mut tokens = rest.split_whitespace();
    let file = tokens.next()?.to_string();
    if !file.contains(".proto") && !file.contains(".protocol") {
        return None;
    }
    let protocol = tokens.next()?.to_string();
    let port = tokens.next().map(str::to_string);
    Some((file, protocol, port))
}

/// The protocol name alone, with any `(arg, ...)` call stripped.
fn protocol_name(protocol: &str) -> &str {
    protocol.split('(').next().unwrap_or(protocol)
}

fn record_uses_stream(record: &RecordInstance) -> Option<&str> {
    let dtype = record.field_value("DTYP")?;
    if dtype != "stream" {
        return None;
    }
    record
        .field_value("INP")
        .or_else(|| record.field_value("OUT"))
}

impl SubHandler for StreamHandler {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn env_set(&mut self, state: &mut ShellState, name: &str, value: &str) {
        if name == "STREAM_PROTOCOL_PATH" {
            for dir in value.split(':').filter(|d| !d.is_empty()) {
                state.devices.protocol_paths.push(dir.to_string());
            }
        }
    }

    fn pre_ioc_init(&mut self, state: &mut ShellState) -> HandlerNotes {
        let mut notes = HandlerNotes::new();
        if !state.devices.protocol_paths.is_empty() {
            notes.insert(
                "protocol_path".to_string(),
                state.devices.protocol_paths.join(":"),
            );
        }
        notes
    }

    /// Parse every protocol file the loaded records reference.
    fn prepare_annotations(&mut self, state: &mut ShellState) {
        let mut wanted = Vec::new();
        for record in state.database.records.values() {
            if let Some(link) = record_uses_stream(record) {
                if let Some((file, _, _)) = parse_stream_link(link) {
                    if !wanted.contains(&file) {
                        wanted.push(file);
                    }
                }
            }
        }

        for file in wanted {
            if state.devices.protocols.contains_key(&file) {
                continue;
            }
            let mut candidates = vec![file.clone()];
            for dir in &state.devices.protocol_paths {
                candidates.push(format!("{dir}/{file}"));
            }
            let mut found = false;
            for candidate in candidates {
                let Ok((resolved, text)) = state.read_file(&candidate) else {
                    continue;
                };
                let base = state.load_context.clone();
                match parse_protocol(&text, &resolved.display().to_string(), &base) {
                    Ok(parsed) => {
                        state.devices.protocols.insert(file.clone(), parsed);
                    }
                    Err(e) => {
                        tracing::warn!(file = %file, "unparseable protocol file: {e}");
                    }
                }
                found = true;
                break;
            }
            if !found {
                tracing::debug!(file = %file, "protocol file not found on search path");
            }
        }
    }

    fn annotate_record(
        &self,
        state: &ShellState,
        record: &RecordInstance,
    ) -> Option<MetadataValue> {
        let link = record_uses_stream(record)?;
        let (file, protocol, port) = parse_stream_link(link)?;

        let mut map = BTreeMap::new();
        map.insert("protocol_file".to_string(), file.clone());
        map.insert("protocol".to_string(), protocol.clone());
        if let Some(port) = port {
            map.insert("port".to_string(), port);
        }
        if let Some(parsed) = state.devices.protocols.get(&file) {
            if let Some(proto) = parsed.protocols.get(protocol_name(&protocol)) {
                map.insert("commands".to_string(), proto.commands.len().to_string());
            }
        }
        Some(MetadataValue::Map(map))
    }
}

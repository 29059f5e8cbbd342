//! Device protocol file (`.proto`) discovery for iocgraph.
//!
//! Extracts the structure stream-style device support consumes:
//! - global `name = value;` variable assignments
//! - `name { command "arg"; ... }` protocol blocks
//! - `@name { ... }` exception handlers nested inside protocols
//!
//! Commands are kept as `(name, argument-text)` pairs; the argument grammar
//! (format converters etc.) is opaque at this layer.

use iocgraph_dsl::context::{FullLoadContext, LoadContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolParseError {
    #[error("{file}:{line}: {message}")]
    Line {
        file: String,
        line: usize,
        message: String,
    },
}

/// One `in`/`out`/`wait`/... command or config row inside a protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolCommand {
    pub name: String,
    pub arguments: String,
    pub context: FullLoadContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProtocol {
    pub name: String,
    pub commands: Vec<ProtocolCommand>,
    /// Protocol-local variable assignments shadowing globals.
    pub variables: BTreeMap<String, String>,
    /// `@mismatch`-style exception handlers.
    pub handlers: BTreeMap<String, Vec<ProtocolCommand>>,
    pub context: FullLoadContext,
}

/// A parsed protocol file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProtocolFile {
    pub filename: String,
    pub variables: BTreeMap<String, String>,
    pub protocols: BTreeMap<String, StreamProtocol>,
}

/// Parse protocol-file text.
pub fn parse_protocol(
    text: &str,
    source: &str,
    base_context: &FullLoadContext,
) -> Result<StreamProtocolFile, ProtocolParseError> {
    let mut parser = ProtoParser {
        source: source.to_string(),
        base: base_context.clone(),
        statements: lex_statements(text),
        index: 0,
    };
    parser.run()
}

/// One `;`-terminated statement or a `{` / `}` structural token.
#[derive(Debug)]
struct Statement {
    text: String,
    line: usize,
}

struct ProtoParser {
    source: String,
    base: FullLoadContext,
    statements: Vec<Statement>,
    index: usize,
}

impl ProtoParser {
    fn err(&self, line: usize, message: impl Into<String>) -> ProtocolParseError {
        ProtocolParseError::Line {
            file: self.source.clone(),
            line,
            message: message.into(),
        }
    }

    fn ctx(&self, line: usize) -> FullLoadContext {
        self.base.pushed(LoadContext::new(self.source.clone(), line))
    }

    fn run(&mut self) -> Result<StreamProtocolFile, ProtocolParseError> {
        let mut file = StreamProtocolFile {
            filename: self.source.clone(),
            ..StreamProtocolFile::default()
        };

        while self.index < self.statements.len() {
            let Statement { text, line } = &self.statements[self.index];
            let text = text.clone();
            let line = *line;

            if text == "}" {
                return Err(self.err(line, "unmatched `}`"));
            }
            if let Some((name, value)) = split_assignment(&text) {
                file.variables.insert(name, value);
                self.index += 1;
                continue;
            }
            if let Some(name) = text.strip_suffix('{').map(str::trim) {
                if name.is_empty() {
                    return Err(self.err(line, "protocol block without a name"));
                }
                if name.starts_with('@') {
                    return Err(self.err(line, "handler outside a protocol"));
                }
                self.index += 1;
                let protocol = self.parse_protocol_body(name, line)?;
                file.protocols.insert(protocol.name.clone(), protocol);
                continue;
            }
            return Err(self.err(line, format!("unrecognized statement: {text}")));
        }
        Ok(file)
    }

    fn parse_protocol_body(
        &mut self,
        name: &str,
        header_line: usize,
    ) -> Result<StreamProtocol, ProtocolParseError> {
        let mut protocol = StreamProtocol {
            name: name.to_string(),
            commands: Vec::new(),
            variables: BTreeMap::new(),
            handlers: BTreeMap::new(),
            context: self.ctx(header_line),
        };

        while self.index < self.statements.len() {
            let Statement { text, line } = &self.statements[self.index];
            let text = text.clone();
            let line = *line;

            if text == "}" {
                self.index += 1;
                return Ok(protocol);
            }
            if let Some((vname, value)) = split_assignment(&text) {
                protocol.variables.insert(vname, value);
                self.index += 1;
                continue;
            }
            if let Some(handler) = text.strip_suffix('{').map(str::trim) {
                let Some(handler_name) = handler.strip_prefix('@') else {
                    return Err(self.err(line, "nested protocol blocks are not supported"));
                };
                self.index += 1;
                let commands = self.parse_handler_body(line)?;
                protocol.handlers.insert(handler_name.to_string(), commands);
                continue;
            }
            protocol.commands.push(self.command_from(&text, line));
            self.index += 1;
        }
        Err(self.err(header_line, format!("unterminated protocol block {name:?}")))
    }

    fn parse_handler_body(
        &mut self,
        header_line: usize,
    ) -> Result<Vec<ProtocolCommand>, ProtocolParseError> {
        let mut commands = Vec::new();
        while self.index < self.statements.len() {
            let Statement { text, line } = &self.statements[self.index];
            let text = text.clone();
            let line = *line;
            if text == "}" {
                self.index += 1;
                return Ok(commands);
            }
            if text.ends_with('{') {
                return Err(self.err(line, "blocks cannot nest inside a handler"));
            }
            commands.push(self.command_from(&text, line));
            self.index += 1;
        }
        Err(self.err(header_line, "unterminated handler block"))
    }

    fn command_from(&self, text: &str, line: usize) -> ProtocolCommand {
        let (name, arguments) = match text.split_once(char::is_whitespace) {
            Some((name, rest)) => (name.to_string(), rest.trim().to_string()),
            None => (text.to_string(), String::new()),
        };
        ProtocolCommand {
            name,
            arguments,
            context: self.ctx(line),
        }
    }
}

/// `name = value` with an optional trailing `;` already stripped.
fn split_assignment(text: &str) -> Option<(String, String)> {
    let (name, value) = text.split_once('=')?;
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) || name.contains('"') {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

/// Split the file into `;`-terminated statements plus `{`/`}` tokens,
/// honoring strings and `#` comments. Statement line numbers point at the
/// statement start.
fn lex_statements(text: &str) -> Vec<Statement> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut start_line = 1usize;
    let mut in_quote: Option<char> = None;
    let mut escaped = false;

    let mut push = |current: &mut String, start_line: usize| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            statements.push(Statement {
                text: trimmed.to_string(),
                line: start_line,
            });
        }
        current.clear();
    };

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let mut chars = raw.chars().peekable();
        while let Some(c) = chars.next() {
            if let Some(q) = in_quote {
                current.push(c);
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    in_quote = None;
                }
                continue;
            }
            match c {
                '#' => break,
                '/' if chars.peek() == Some(&'/') => break,
                '"' | '\'' => {
                    if current.trim().is_empty() {
                        start_line = line_no;
                    }
                    in_quote = Some(c);
                    current.push(c);
                }
                ';' => push(&mut current, start_line),
                '{' => {
                    current.push('{');
                    let push_line = if current_is_only_brace(&current) { line_no } else { start_line };
                    push(&mut current, push_line);
                }
                '}' => {
                    push(&mut current, start_line);
                    current.push('}');
                    push(&mut current, line_no);
                }
                c if c.is_whitespace() => {
                    if !current.trim().is_empty() {
                        current.push(' ');
                    }
                }
                _ => {
                    if current.trim().is_empty() {
                        start_line = line_no;
                    }
                    current.push(c);
                }
            }
        }
    }
    push(&mut current, start_line);
    statements
}

fn current_is_only_brace(current: &str) -> bool {
    current.trim() == "{"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> StreamProtocolFile {
        parse_protocol(text, "device.proto", &FullLoadContext::empty()).expect("parse")
    }

    #[test]
    fn parses_globals_protocols_and_handlers() {
        let file = parse(
            r#"
locktimeout = 5000;
terminator = CR LF;

read_temp {
    out "TEMP?";
    in "%f";
    @mismatch {
        out "ERR?";
        in "%s";
    }
}
"#,
        );
        assert_eq!(file.variables["locktimeout"], "5000");
        assert_eq!(file.variables["terminator"], "CR LF");

        let protocol = &file.protocols["read_temp"];
        assert_eq!(protocol.commands.len(), 2);
        assert_eq!(protocol.commands[0].name, "out");
        assert_eq!(protocol.commands[0].arguments, "\"TEMP?\"");
        assert_eq!(protocol.handlers["mismatch"].len(), 2);
        assert_eq!(protocol.commands[0].context.to_string(), "device.proto:6");
    }

    #[test]
    fn protocol_local_variables_shadow_globals() {
        let file = parse("replytimeout = 100;\np1 { replytimeout = 5; out \"GO\"; }\n");
        assert_eq!(file.variables["replytimeout"], "100");
        assert_eq!(file.protocols["p1"].variables["replytimeout"], "5");
        assert_eq!(file.protocols["p1"].commands.len(), 1);
    }

    #[test]
    fn comments_are_ignored() {
        let file = parse("# a comment\np { out \"X\"; } // trailing\n");
        assert!(file.protocols.contains_key("p"));
    }

    #[test]
    fn unterminated_protocol_fails_with_context() {
        let err = parse_protocol("p {\n out \"X\";\n", "bad.proto", &FullLoadContext::empty())
            .expect_err("should fail");
        assert!(err.to_string().starts_with("bad.proto:1:"), "err={err}");
    }

    #[test]
    fn handler_outside_protocol_is_rejected() {
        let err = parse_protocol("@mismatch {\n}\n", "bad.proto", &FullLoadContext::empty())
            .expect_err("should fail");
        assert!(err.to_string().contains("handler"), "err={err}");
    }
}

//! Sequencer program (`.st`) header discovery for iocgraph.
//!
//! Only the `program` declaration matters to IOC analysis: it names the state
//! program a `seq` shell command refers to and may carry a macro-definition
//! parameter string:
//!
//! ```text
//! program ringScan("unit=1, speed=fast")
//! ```
//!
//! Leading C comments and preprocessor lines are tolerated; the body of the
//! program is opaque at this layer.

use anyhow::{bail, Result};
use iocgraph_dsl::context::{FullLoadContext, LoadContext};
use serde::{Deserialize, Serialize};

/// A sequencer program header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerProgram {
    pub name: String,
    /// The raw parameter string, when the declaration carries one.
    pub params: Option<String>,
    pub context: FullLoadContext,
}

/// Find and parse the `program` declaration of state-notation text.
pub fn parse_program_header(
    text: &str,
    source: &str,
    base_context: &FullLoadContext,
) -> Result<SequencerProgram> {
    let mut in_block_comment = false;
    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comments(raw, &mut in_block_comment);
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some(rest) = line.strip_prefix("program") else {
            // Anything else before `program` ends the header search.
            bail!("{source}:{line_no}: expected a program declaration, found: {line}");
        };
        let rest = rest.trim();
        if rest.is_empty() {
            bail!("{source}:{line_no}: program declaration is missing a name");
        }

        let (name, params) = match rest.split_once('(') {
            Some((name, args)) => {
                let Some(args) = args.trim_end().strip_suffix(')') else {
                    bail!("{source}:{line_no}: unterminated program parameter list");
                };
                (name.trim(), Some(unquote(args.trim())))
            }
            None => (rest, None),
        };
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!("{source}:{line_no}: bad program name {name:?}");
        }

        return Ok(SequencerProgram {
            name: name.to_string(),
            params,
            context: base_context.pushed(LoadContext::new(source.to_string(), line_no)),
        });
    }
    bail!("{source}: no program declaration found");
}

/// Remove `//` and `/* ... */` comments, tracking block state across lines.
fn strip_comments(line: &str, in_block: &mut bool) -> String {
    let mut out = String::new();
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if *in_block {
            if c == '*' && chars.peek() == Some(&'/') {
                chars.next();
                *in_block = false;
            }
            continue;
        }
        match c {
            '/' if chars.peek() == Some(&'/') => break,
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                *in_block = true;
            }
            _ => out.push(c),
        }
    }
    out
}

fn unquote(text: &str) -> String {
    let bytes = text.as_bytes();
    if bytes.len() >= 2 && bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"' {
        return text[1..text.len() - 1].to_string();
    }
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_plain_program_header() {
        let program = parse_program_header(
            "/* scan program */\nprogram ringScan\nss main { }\n",
            "ring.st",
            &FullLoadContext::empty(),
        )
        .expect("parse");
        assert_eq!(program.name, "ringScan");
        assert_eq!(program.params, None);
        assert_eq!(program.context.to_string(), "ring.st:2");
    }

    #[test]
    fn parses_parameterized_headers() {
        let program = parse_program_header(
            "program ringScan(\"unit=1, speed=fast\")\n",
            "ring.st",
            &FullLoadContext::empty(),
        )
        .expect("parse");
        assert_eq!(program.params.as_deref(), Some("unit=1, speed=fast"));
    }

    #[test]
    fn multi_line_block_comments_are_skipped() {
        let program = parse_program_header(
            "/*\n * header\n */\n#define X 1\nprogram p1\n",
            "p.st",
            &FullLoadContext::empty(),
        )
        .expect("parse");
        assert_eq!(program.name, "p1");
    }

    #[test]
    fn missing_program_is_an_error() {
        let err = parse_program_header("int x;\n", "no.st", &FullLoadContext::empty())
            .expect_err("should fail");
        assert!(err.to_string().contains("no.st"), "err={err}");
    }
}

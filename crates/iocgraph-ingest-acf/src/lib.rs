//! Access-security configuration (`.acf`) discovery for iocgraph.
//!
//! Extracts the rule structure a gateway or IOC enforces:
//! - `UAG(name) {users}` -> user access groups
//! - `HAG(name) {hosts}` -> host access groups
//! - `ASG(name) { INP<x>(pv) RULE(level, perm[, trap]) { UAG(..) HAG(..)
//!   CALC("expr") } }` -> security groups with their rules

use iocgraph_dsl::context::{FullLoadContext, LoadContext};
use nom::{
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char as pchar, multispace0},
    combinator::recognize,
    sequence::tuple,
    IResult,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AcfParseError {
    #[error("{file}:{line}: {message}")]
    Line {
        file: String,
        line: usize,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccessGroup {
    pub name: String,
    pub users: Vec<String>,
    pub context: FullLoadContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAccessGroup {
    pub name: String,
    pub hosts: Vec<String>,
    pub context: FullLoadContext,
}

/// `INPA(pv)` .. `INPL(pv)` inputs usable from `CALC` expressions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessInput {
    pub index: char,
    pub pvname: String,
    pub context: FullLoadContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub level: u8,
    /// `NONE`, `READ` or `WRITE`.
    pub permission: String,
    /// `TRAPWRITE`/`NOTRAPWRITE` option when present.
    pub trap_option: Option<String>,
    pub user_groups: Vec<String>,
    pub host_groups: Vec<String>,
    pub calc: Option<String>,
    pub context: FullLoadContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessSecurityGroup {
    pub name: String,
    pub inputs: Vec<AccessInput>,
    pub rules: Vec<AccessRule>,
    pub context: FullLoadContext,
}

/// A parsed access-security configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessSecurityConfig {
    pub filename: String,
    pub user_groups: BTreeMap<String, UserAccessGroup>,
    pub host_groups: BTreeMap<String, HostAccessGroup>,
    pub groups: BTreeMap<String, AccessSecurityGroup>,
}

/// Parse access-security configuration text.
pub fn parse_acf(
    text: &str,
    source: &str,
    base_context: &FullLoadContext,
) -> Result<AccessSecurityConfig, AcfParseError> {
    let mut config = AccessSecurityConfig {
        filename: source.to_string(),
        ..AccessSecurityConfig::default()
    };

    let err = |line: usize, message: String| AcfParseError::Line {
        file: source.to_string(),
        line,
        message,
    };
    let ctx = |line: usize| base_context.pushed(LoadContext::new(source.to_string(), line));

    let lines: Vec<&str> = text.lines().collect();
    let mut i = 0usize;
    while i < lines.len() {
        let line_no = i + 1;
        let line = strip_comment(lines[i]).trim().to_string();
        if line.is_empty() {
            i += 1;
            continue;
        }

        if line.starts_with("UAG") {
            let (block, next) = collect_block(&lines, i).map_err(|m| err(line_no, m))?;
            let (name, members) =
                parse_group_block(&block, "UAG").map_err(|m| err(line_no, m))?;
            config.user_groups.insert(
                name.clone(),
                UserAccessGroup {
                    name,
                    users: members,
                    context: ctx(line_no),
                },
            );
            i = next;
            continue;
        }
        if line.starts_with("HAG") {
            let (block, next) = collect_block(&lines, i).map_err(|m| err(line_no, m))?;
            let (name, members) =
                parse_group_block(&block, "HAG").map_err(|m| err(line_no, m))?;
            config.host_groups.insert(
                name.clone(),
                HostAccessGroup {
                    name,
                    hosts: members,
                    context: ctx(line_no),
                },
            );
            i = next;
            continue;
        }
        if line.starts_with("ASG") {
            let (group, next) = parse_asg(&lines, i, source, base_context)?;
            config.groups.insert(group.name.clone(), group);
            i = next;
            continue;
        }

        return Err(err(line_no, format!("unrecognized declaration: {line}")));
    }

    Ok(config)
}

/// Parse one `ASG(name) { ... }` block starting at `start`.
fn parse_asg(
    lines: &[&str],
    start: usize,
    source: &str,
    base_context: &FullLoadContext,
) -> Result<(AccessSecurityGroup, usize), AcfParseError> {
    let err = |line: usize, message: String| AcfParseError::Line {
        file: source.to_string(),
        line,
        message,
    };
    let ctx = |line: usize| base_context.pushed(LoadContext::new(source.to_string(), line));

    let header_line = start + 1;
    let header = strip_comment(lines[start]);
    let name = parse_call_name(header, "ASG").map_err(|m| err(header_line, m))?;
    let mut group = AccessSecurityGroup {
        name,
        inputs: Vec::new(),
        rules: Vec::new(),
        context: ctx(header_line),
    };

    let mut i = start + 1;
    if !header.trim_end().ends_with('{') {
        i = skip_to_open_brace(lines, i).map_err(|(l, m)| err(l, m))?;
    }

    while i < lines.len() {
        let line_no = i + 1;
        let line = strip_comment(lines[i]).trim().to_string();
        if line.is_empty() {
            i += 1;
            continue;
        }
        if line == "}" {
            return Ok((group, i + 1));
        }
        if let Some(rest) = line.strip_prefix("INP") {
            let (index, pvname) = parse_inp(rest).map_err(|m| err(line_no, m))?;
            group.inputs.push(AccessInput {
                index,
                pvname,
                context: ctx(line_no),
            });
            i += 1;
            continue;
        }
        if line.starts_with("RULE") {
            let (rule, next) = parse_rule(lines, i, source, base_context)?;
            group.rules.push(rule);
            i = next;
            continue;
        }
        return Err(err(line_no, format!("unrecognized ASG body line: {line}")));
    }
    Err(err(header_line, "unterminated ASG block".to_string()))
}

/// Parse `RULE(level, perm[, trap])`, optionally followed by a body block
/// naming UAG/HAG memberships and a CALC expression.
fn parse_rule(
    lines: &[&str],
    start: usize,
    source: &str,
    base_context: &FullLoadContext,
) -> Result<(AccessRule, usize), AcfParseError> {
    let err = |line: usize, message: String| AcfParseError::Line {
        file: source.to_string(),
        line,
        message,
    };

    let header_line = start + 1;
    let header = strip_comment(lines[start]);
    let args = call_args(header, "RULE").ok_or_else(|| {
        err(header_line, "RULE: malformed declaration".to_string())
    })?;
    let parts: Vec<&str> = args.split(',').map(str::trim).collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(err(
            header_line,
            format!("RULE: expected 2 or 3 arguments, got {}", parts.len()),
        ));
    }
    let level: u8 = parts[0]
        .parse()
        .map_err(|_| err(header_line, format!("RULE: bad level {:?}", parts[0])))?;

    let mut rule = AccessRule {
        level,
        permission: parts[1].to_string(),
        trap_option: parts.get(2).map(|s| s.to_string()),
        user_groups: Vec::new(),
        host_groups: Vec::new(),
        calc: None,
        context: base_context.pushed(LoadContext::new(source.to_string(), header_line)),
    };

    // A rule without a body applies unconditionally.
    let has_body = header.trim_end().ends_with('{')
        || lines
            .get(start + 1)
            .map(|l| strip_comment(l).trim() == "{")
            .unwrap_or(false);
    if !has_body {
        return Ok((rule, start + 1));
    }

    let mut i = if header.trim_end().ends_with('{') {
        start + 1
    } else {
        start + 2
    };
    while i < lines.len() {
        let line_no = i + 1;
        let line = strip_comment(lines[i]).trim().to_string();
        i += 1;
        if line.is_empty() {
            continue;
        }
        if line == "}" {
            return Ok((rule, i));
        }
        if let Some(args) = call_args(&line, "UAG") {
            rule.user_groups.extend(split_members(&args));
            continue;
        }
        if let Some(args) = call_args(&line, "HAG") {
            rule.host_groups.extend(split_members(&args));
            continue;
        }
        if let Some(args) = call_args(&line, "CALC") {
            rule.calc = Some(unquote(args.trim()));
            continue;
        }
        return Err(err(line_no, format!("unrecognized RULE body line: {line}")));
    }
    Err(err(header_line, "unterminated RULE block".to_string()))
}

/// `A(pvname)` suffix of an `INP` line.
fn parse_inp(rest: &str) -> Result<(char, String), String> {
    let mut chars = rest.chars();
    let index = chars
        .next()
        .filter(|c| c.is_ascii_uppercase())
        .ok_or_else(|| "INP: missing index letter".to_string())?;
    let rest = chars.as_str().trim();
    let inner = rest
        .strip_prefix('(')
        .and_then(|r| r.trim_end().strip_suffix(')'))
        .ok_or_else(|| "INP: malformed argument".to_string())?;
    Ok((index, unquote(inner.trim())))
}

/// `UAG(name) {m1, m2}` / `HAG(name) {h1, h2}` blocks.
fn parse_group_block(block: &str, keyword: &str) -> Result<(String, Vec<String>), String> {
    let name = parse_call_name(block, keyword)?;
    let open = block
        .find('{')
        .ok_or_else(|| format!("{keyword}: missing members block"))?;
    let close = block
        .rfind('}')
        .ok_or_else(|| format!("{keyword}: unterminated members block"))?;
    Ok((name, split_members(&block[open + 1..close])))
}

fn split_members(inner: &str) -> Vec<String> {
    inner
        .split([',', '\n'])
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(|m| unquote(m).to_string())
        .collect()
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.')
}

fn parse_call_name(text: &str, keyword: &str) -> Result<String, String> {
    fn name_parser<'a>(input: &'a str, keyword: &str) -> IResult<&'a str, &'a str> {
        let (input, _) = multispace0(input)?;
        let (input, _) = tag(keyword)(input)?;
        let (input, _) = multispace0(input)?;
        let (input, _) = pchar('(')(input)?;
        let (input, _) = multispace0(input)?;
        let (input, name) = recognize(tuple((
            take_while1(is_name_char),
            take_while(is_name_char),
        )))(input)?;
        let (input, _) = multispace0(input)?;
        let (input, _) = pchar(')')(input)?;
        Ok((input, name))
    }

    name_parser(text, keyword)
        .map(|(_, name)| name.to_string())
        .map_err(|_| format!("{keyword}: malformed header"))
}

/// Argument text of `keyword(args)` at the start of `text`.
fn call_args(text: &str, keyword: &str) -> Option<String> {
    let rest = text.trim_start().strip_prefix(keyword)?;
    let rest = rest.trim_start().strip_prefix('(')?;
    let mut depth = 1usize;
    let mut in_quote = false;
    for (idx, c) in rest.char_indices() {
        if in_quote {
            if c == '"' {
                in_quote = false;
            }
            continue;
        }
        match c {
            '"' => in_quote = true,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(rest[..idx].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Join lines until the braces of a `UAG`/`HAG` block balance.
fn collect_block(lines: &[&str], start: usize) -> Result<(String, usize), String> {
    let mut combined = String::new();
    let mut i = start;
    while i < lines.len() {
        let piece = strip_comment(lines[i]);
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(piece.trim());
        i += 1;
        let opens = combined.matches('{').count();
        let closes = combined.matches('}').count();
        if opens > 0 && opens == closes {
            return Ok((combined, i));
        }
    }
    Err("unterminated block".to_string())
}

fn skip_to_open_brace(lines: &[&str], mut i: usize) -> Result<usize, (usize, String)> {
    while i < lines.len() {
        let line = strip_comment(lines[i]).trim().to_string();
        if line.is_empty() {
            i += 1;
            continue;
        }
        if line == "{" {
            return Ok(i + 1);
        }
        return Err((i + 1, format!("expected `{{`, found: {line}")));
    }
    Err((i, "expected `{` before end of file".to_string()))
}

fn strip_comment(line: &str) -> &str {
    let mut in_quote = false;
    for (idx, c) in line.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            '#' if !in_quote => return &line[..idx],
            _ => {}
        }
    }
    line
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

    fn parse(text: &str) -> AccessSecurityConfig {
        parse_acf(text, "access.acf", &FullLoadContext::empty()).expect("parse")
    }

    #[test]
    fn parses_groups_rules_and_inputs() {
        let config = parse(
            r#"
# Access security for the ring
UAG(ops) {op1, op2}
HAG(consoles) {cr-host1, cr-host2}
ASG(DEFAULT) {
    INPA(ACC:BEAM_CURRENT)
    RULE(0, READ)
    RULE(1, WRITE, TRAPWRITE) {
        UAG(ops)
        HAG(consoles)
        CALC("A>0.1")
    }
}
"#,
        );
        assert_eq!(config.user_groups["ops"].users, vec!["op1", "op2"]);
        assert_eq!(config.host_groups["consoles"].hosts.len(), 2);

        let group = &config.groups["DEFAULT"];
        assert_eq!(group.inputs[0].index, 'A');
        assert_eq!(group.inputs[0].pvname, "ACC:BEAM_CURRENT");
        assert_eq!(group.rules.len(), 2);
        assert_eq!(group.rules[0].permission, "READ");
        assert!(group.rules[0].user_groups.is_empty());

        let write = &group.rules[1];
        assert_eq!(write.level, 1);
        assert_eq!(write.trap_option.as_deref(), Some("TRAPWRITE"));
        assert_eq!(write.user_groups, vec!["ops"]);
        assert_eq!(write.calc.as_deref(), Some("A>0.1"));
        assert_eq!(write.context.to_string(), "access.acf:8");
    }

    #[test]
    fn multiline_member_blocks_join() {
        let config = parse("UAG(all) {\n  u1,\n  u2\n}\n");
        assert_eq!(config.user_groups["all"].users, vec!["u1", "u2"]);
    }

    #[test]
    fn unrecognized_lines_fail_with_context() {
        let err = parse_acf("NOPE(x)\n", "bad.acf", &FullLoadContext::empty())
            .expect_err("should fail");
        assert!(err.to_string().starts_with("bad.acf:1:"), "err={err}");
    }

    #[test]
    fn rule_level_must_be_numeric() {
        let err = parse_acf(
            "ASG(S) {\n  RULE(x, READ)\n}\n",
            "bad.acf",
            &FullLoadContext::empty(),
        )
        .expect_err("should fail");
        assert!(err.to_string().contains("bad level"), "err={err}");
    }
}

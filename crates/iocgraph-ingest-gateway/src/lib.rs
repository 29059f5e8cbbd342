//! Gateway PV-list discovery for iocgraph.
//!
//! A gateway PV list is a sequence of `pattern COMMAND [args...]` rules:
//!
//! ```text
//! EVALUATION ORDER ALLOW, DENY
//! .*          ALLOW
//! ACC:.*      DENY host1 host2
//! DEMO:alias  ALIAS DEMO:real
//! ```
//!
//! Patterns are anchored regular expressions. Rules with patterns that fail
//! to compile are kept (with the error recorded) so a lint layer can surface
//! them, but they never match.

use anyhow::{bail, Result};
use iocgraph_dsl::context::{FullLoadContext, LoadContext};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayCommand {
    Allow,
    Deny,
    Alias,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRule {
    pub pattern: String,
    pub command: GatewayCommand,
    /// `ALIAS` target, or the access-security group/level args of `ALLOW`.
    pub arguments: Vec<String>,
    /// Hosts a `DENY FROM` applies to.
    pub hosts: Vec<String>,
    pub context: FullLoadContext,
    /// Regex compilation failure, if any.
    pub pattern_error: Option<String>,
    #[serde(skip)]
    regex: Option<Regex>,
}

impl GatewayRule {
    pub fn matches(&self, pvname: &str) -> bool {
        self.regex.as_ref().map(|r| r.is_match(pvname)).unwrap_or(false)
    }
}

/// One parsed PV-list file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayPVList {
    pub filename: String,
    /// `EVALUATION ORDER` directive, verbatim, when present.
    pub evaluation_order: Option<String>,
    pub rules: Vec<GatewayRule>,
}

impl GatewayPVList {
    /// Every rule matching `pvname`, in file order.
    pub fn matches<'a>(&'a self, pvname: &str) -> Vec<&'a GatewayRule> {
        self.rules.iter().filter(|r| r.matches(pvname)).collect()
    }

    /// Summarize the matches for one record as metadata, keyed by pattern.
    pub fn metadata_for(&self, pvname: &str) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for rule in self.matches(pvname) {
            let what = match rule.command {
                GatewayCommand::Allow => "ALLOW".to_string(),
                GatewayCommand::Deny if rule.hosts.is_empty() => "DENY".to_string(),
                GatewayCommand::Deny => format!("DENY FROM {}", rule.hosts.join(" ")),
                GatewayCommand::Alias => format!("ALIAS {}", rule.arguments.join(" ")),
            };
            out.insert(rule.pattern.clone(), what);
        }
        out
    }
}

/// Parse gateway PV-list text.
pub fn parse_pvlist(
    text: &str,
    source: &str,
    base_context: &FullLoadContext,
) -> Result<GatewayPVList> {
    let mut list = GatewayPVList {
        filename: source.to_string(),
        ..GatewayPVList::default()
    };

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = match raw.split_once('#') {
            Some((before, _)) => before.trim(),
            None => raw.trim(),
        };
        if line.is_empty() {
            continue;
        }

        if let Some(order) = line.strip_prefix("EVALUATION ORDER") {
            list.evaluation_order = Some(order.trim().to_string());
            continue;
        }

        let mut tokens = line.split_whitespace();
        let Some(pattern) = tokens.next() else {
            continue;
        };
        let Some(command) = tokens.next() else {
            bail!("{source}:{line_no}: rule {pattern:?} is missing a command");
        };
        let rest: Vec<String> = tokens.map(str::to_string).collect();

        let context = base_context.pushed(LoadContext::new(source.to_string(), line_no));
        let (command, arguments, hosts) = match command {
            "ALLOW" => (GatewayCommand::Allow, rest, Vec::new()),
            "DENY" => {
                // `DENY FROM host...` scopes the denial to requesting hosts.
                let hosts = match rest.first().map(String::as_str) {
                    Some("FROM") => rest[1..].to_vec(),
                    _ => rest,
                };
                (GatewayCommand::Deny, Vec::new(), hosts)
            }
            "ALIAS" => {
                if rest.is_empty() {
                    bail!("{source}:{line_no}: ALIAS rule is missing a target");
                }
                (GatewayCommand::Alias, rest, Vec::new())
            }
            "DENY," | "ALLOW," => {
                // An `EVALUATION ORDER` line without the leading keyword.
                bail!("{source}:{line_no}: misplaced evaluation-order directive");
            }
            other => {
                bail!("{source}:{line_no}: unknown command {other:?}");
            }
        };

        let anchored = format!("^(?:{pattern})$");
        let (regex, pattern_error) = match Regex::new(&anchored) {
            Ok(r) => (Some(r), None),
            Err(e) => (None, Some(e.to_string())),
        };
        list.rules.push(GatewayRule {
            pattern: pattern.to_string(),
            command,
            arguments,
            hosts,
            context,
            pattern_error,
            regex,
        });
    }

    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> GatewayPVList {
        parse_pvlist(text, "gateway.pvlist", &FullLoadContext::empty()).expect("parse")
    }

    #[test]
    fn parses_rules_and_matches_anchored() {
        let list = parse(
            r#"
EVALUATION ORDER ALLOW, DENY
.*       ALLOW
ACC:.*   DENY host1 host2
DEMO:ai  ALIAS REAL:ai
"#,
        );
        assert_eq!(list.evaluation_order.as_deref(), Some("ALLOW, DENY"));
        assert_eq!(list.rules.len(), 3);

        let matched = list.matches("ACC:BEAM");
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[1].hosts, vec!["host1", "host2"]);

        // Anchoring: `DEMO:ai` must not match `DEMO:ai2`.
        assert!(list.matches("DEMO:ai2").iter().all(|r| r.pattern == ".*"));
    }

    #[test]
    fn metadata_summarizes_matches() {
        let list = parse(".* ALLOW\nX:.* DENY FROM op-host\n");
        let meta = list.metadata_for("X:1");
        assert_eq!(meta[".*"], "ALLOW");
        assert_eq!(meta["X:.*"], "DENY FROM op-host");
    }

    #[test]
    fn bad_patterns_are_kept_but_never_match() {
        let list = parse("*bad ALLOW\n");
        assert!(list.rules[0].pattern_error.is_some());
        assert!(list.matches("anything").is_empty());
    }

    #[test]
    fn alias_requires_a_target() {
        let err = parse_pvlist("X ALIAS\n", "bad.pvlist", &FullLoadContext::empty())
            .expect_err("should fail");
        assert!(err.to_string().contains("bad.pvlist:1"), "err={err}");
    }
}

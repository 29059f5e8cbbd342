//! Shell-line tokenization and the closed command set.
//!
//! Both iocsh calling conventions are accepted:
//!
//! ```text
//! dbLoadRecords("db/motor.db", "P=X, N=1")
//! dbLoadRecords db/motor.db, "P=X, N=1"
//! ```
//!
//! Dispatch is a match over [`Command`]; names nobody maps land in
//! [`Command::Unknown`] and are offered to the sub-handlers before being
//! recorded as unhandled (which is not an error).

/// The commands the interpreter implements directly. Hardware commands are
/// claimed by sub-handlers out of the `Unknown` arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    DbLoadDatabase,
    DbLoadRecords,
    DbLoadTemplate,
    IocInit,
    EpicsEnvSet,
    EpicsEnvShow,
    Cd,
    Dbl,
    Var,
    Unknown,
}

impl Command {
    pub fn from_name(name: &str) -> Command {
        match name {
            "dbLoadDatabase" => Command::DbLoadDatabase,
            "dbLoadRecords" => Command::DbLoadRecords,
            "dbLoadTemplate" => Command::DbLoadTemplate,
            "iocInit" => Command::IocInit,
            "epicsEnvSet" => Command::EpicsEnvSet,
            "epicsEnvShow" => Command::EpicsEnvShow,
            "cd" | "chdir" => Command::Cd,
            "dbl" => Command::Dbl,
            "var" => Command::Var,
            _ => Command::Unknown,
        }
    }
}

/// Tokenize one (already macro-expanded) shell line into argv.
pub fn parse_argv(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    // Function-call form: `name(arg, arg)` with the parens wrapping the
    // whole remainder of the line.
    if let Some((name, args)) = split_call_form(trimmed) {
        let mut argv = vec![name.to_string()];
        argv.extend(split_call_args(args));
        return argv;
    }

    tokenize_words(trimmed)
}

fn split_call_form(line: &str) -> Option<(&str, &str)> {
    let open = line.find('(')?;
    let name = &line[..open];
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
    {
        return None;
    }
    let rest = line[open + 1..].trim_end();
    let inner = rest.strip_suffix(')')?;
    Some((name, inner))
}

/// Split call arguments on top-level commas, honoring quotes and brackets.
fn split_call_args(args: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in args.chars() {
        if let Some(q) = quote {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => {
                quote = Some(c);
                current.push(c);
            }
            '(' | '{' | '[' => {
                depth += 1;
                current.push(c);
            }
            ')' | '}' | ']' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                out.push(unquote(current.trim()));
                current.clear();
            }
            _ => current.push(c),
        }
    }
    let last = current.trim();
    if !last.is_empty() || !out.is_empty() {
        out.push(unquote(last));
    }
    // Drop a dangling empty argument from a trailing comma.
    while out.last().map(|a| a.is_empty()).unwrap_or(false) {
        out.pop();
    }
    out
}

/// Whitespace/comma tokenization for the plain form.
fn tokenize_words(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut quoted_token = false;
    for c in line.chars() {
        if let Some(q) = quote {
            if escaped {
                current.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            } else {
                current.push(c);
            }
            continue;
        }
        match c {
            '"' | '\'' => {
                quote = Some(c);
                quoted_token = true;
            }
            c if c.is_whitespace() || c == ',' => {
                if !current.is_empty() || quoted_token {
                    out.push(std::mem::take(&mut current));
                    quoted_token = false;
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() || quoted_token {
        out.push(current);
    }
    out
}

fn unquote(arg: &str) -> String {
    let bytes = arg.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        if first == bytes[bytes.len() - 1] && (first == b'"' || first == b'\'') {
            let inner = &arg[1..arg.len() - 1];
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    match chars.next() {
                        Some(other) => out.push(other),
                        None => out.push('\\'),
                    }
                } else {
                    out.push(c);
                }
            }
            return out;
        }
    }
    arg.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_form_splits_arguments() {
        assert_eq!(
            parse_argv("dbLoadRecords(\"db/m.db\", \"P=X, N=1\")"),
            vec!["dbLoadRecords", "db/m.db", "P=X, N=1"]
        );
        assert_eq!(parse_argv("iocInit()"), vec!["iocInit"]);
        assert_eq!(parse_argv("iocInit"), vec!["iocInit"]);
    }

    #[test]
    fn word_form_splits_on_spaces_and_commas() {
        assert_eq!(
            parse_argv("dbLoadRecords db/m.db, \"P=X\""),
            vec!["dbLoadRecords", "db/m.db", "P=X"]
        );
        assert_eq!(parse_argv("cd \"/some dir\""), vec!["cd", "/some dir"]);
    }

    #[test]
    fn quoted_empty_arguments_survive() {
        assert_eq!(parse_argv("cmd \"\" x"), vec!["cmd", "", "x"]);
    }

    #[test]
    fn nested_parens_stay_in_one_argument() {
        assert_eq!(
            parse_argv("XPSCreateController(XPS1, IP1, 8)"),
            vec!["XPSCreateController", "XPS1", "IP1", "8"]
        );
        assert_eq!(
            parse_argv("cmd(a(b,c), d)"),
            vec!["cmd", "a(b,c)", "d"]
        );
    }

    #[test]
    fn unknown_names_map_to_unknown() {
        assert_eq!(Command::from_name("chdir"), Command::Cd);
        assert_eq!(Command::from_name("frobnicate"), Command::Unknown);
    }
}

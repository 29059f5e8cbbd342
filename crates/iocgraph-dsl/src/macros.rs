//! The `$(NAME)` / `${NAME}` macro engine.
//!
//! Startup scripts, database files and substitution rows all share the same
//! macro language:
//!
//! - `$(A)` or `${A}` — simple reference
//! - `$(A=def)` — reference with a default used when `A` is undefined
//! - `$(A,B)` / `$(A,B=def)` — alternate names, tried left to right
//!
//! Resolution order for each candidate name: explicit definitions (innermost
//! scope first), then the process environment when enabled, then the `=def`
//! clause once every name missed. Undefined references degrade to either the
//! empty string or a kept literal, controlled by [`UndefinedMacroPolicy`];
//! with `show_warnings` set, surviving placeholders render as
//! `$(A,undefined)` / `$(A,recursive)` so broken expansions are visible in
//! output instead of silently vanishing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use thiserror::Error;

/// What an undefined reference expands to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UndefinedMacroPolicy {
    /// Expand to the empty string.
    Empty,
    /// Keep the reference as a literal `$(NAME)`.
    Keep,
}

#[derive(Debug, Error)]
pub enum MacroDefError {
    #[error("macro definition {index} ({chunk:?}) is missing `=`")]
    MissingEquals { index: usize, chunk: String },
}

/// An ordered, scoped mapping of macro name to value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MacroContext {
    /// Scope stack; the last entry is the innermost scope.
    scopes: Vec<BTreeMap<String, String>>,
    /// Consult the process environment after explicit definitions.
    pub use_environment: bool,
    /// Render surviving placeholders with `,undefined` / `,recursive`.
    pub show_warnings: bool,
    pub undefined: UndefinedMacroPolicy,
}

impl Default for MacroContext {
    fn default() -> Self {
        Self {
            scopes: vec![BTreeMap::new()],
            use_environment: false,
            show_warnings: false,
            undefined: UndefinedMacroPolicy::Keep,
        }
    }
}

impl MacroContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a macro in the innermost scope.
    pub fn define(&mut self, name: impl Into<String>, value: impl Into<String>) {
        // scopes is never empty: the root scope survives every pop.
        self.scopes
            .last_mut()
            .unwrap_or_else(|| unreachable!("root scope always present"))
            .insert(name.into(), value.into());
    }

    /// Parse and define a comma-separated `A=1,B=2` definition string, the
    /// form `dbLoadRecords`/`dbLoadTemplate` pass macros in.
    ///
    /// Values may be quoted; a single layer of matching quotes is stripped.
    /// Returns the parsed pairs in document order.
    pub fn define_from_string(&mut self, defs: &str) -> Result<Vec<(String, String)>, MacroDefError> {
        let pairs = parse_definitions(defs)?;
        for (name, value) in &pairs {
            self.define(name.clone(), value.clone());
        }
        Ok(pairs)
    }

    /// Overlay `overrides` as a new scope; the returned guard restores the
    /// previous definitions when dropped, even on panic or early return.
    pub fn scoped<I>(&mut self, overrides: I) -> MacroScope<'_>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.scopes.push(overrides.into_iter().collect());
        MacroScope { ctx: self }
    }

    /// The effective flat mapping, inner scopes shadowing outer ones.
    pub fn definitions_flat(&self) -> BTreeMap<String, String> {
        let mut flat = BTreeMap::new();
        for scope in &self.scopes {
            for (k, v) in scope {
                flat.insert(k.clone(), v.clone());
            }
        }
        flat
    }

    fn lookup_defined(&self, name: &str) -> Option<&str> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).map(String::as_str))
    }

    /// Expand every macro reference in `text`.
    pub fn expand(&self, text: &str) -> String {
        let mut active = Vec::new();
        self.expand_inner(text, &mut active)
    }

    fn expand_inner(&self, text: &str, active: &mut Vec<String>) -> String {
        let mut out = String::with_capacity(text.len());
        let chars: Vec<char> = text.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            if chars[i] == '$' && i + 1 < chars.len() && (chars[i + 1] == '(' || chars[i + 1] == '{')
            {
                let open = chars[i + 1];
                let close = if open == '(' { ')' } else { '}' };
                if let Some(end) = find_matching(&chars, i + 1, open, close) {
                    let content: String = chars[i + 2..end].iter().collect();
                    out.push_str(&self.expand_reference(&content, active));
                    i = end + 1;
                    continue;
                }
                // Unterminated reference: keep the rest verbatim.
                out.extend(&chars[i..]);
                break;
            }
            out.push(chars[i]);
            i += 1;
        }
        out
    }

    /// Expand one `NAME[,ALT...][=default]` reference body.
    fn expand_reference(&self, content: &str, active: &mut Vec<String>) -> String {
        let (names_part, default) = split_default(content);
        // Names may themselves contain references ($(P$(N))).
        let names_part = self.expand_inner(&names_part, active);
        let names: Vec<&str> = names_part
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .collect();

        for name in &names {
            if active.iter().any(|a| a == name) {
                return self.placeholder(name, "recursive");
            }
            let value = match self.lookup_defined(name) {
                Some(v) => Some(v.to_string()),
                None if self.use_environment => std::env::var(name).ok(),
                None => None,
            };
            if let Some(value) = value {
                active.push(name.to_string());
                let expanded = self.expand_inner(&value, active);
                active.pop();
                return expanded;
            }
        }

        if let Some(default) = default {
            return self.expand_inner(&default, active);
        }

        let shown = names.first().copied().unwrap_or("");
        self.placeholder(shown, "undefined")
    }

    fn placeholder(&self, name: &str, why: &str) -> String {
        if self.show_warnings {
            return format!("$({name},{why})");
        }
        match self.undefined {
            UndefinedMacroPolicy::Empty if why == "undefined" => String::new(),
            _ => format!("$({name})"),
        }
    }
}

/// RAII guard returned by [`MacroContext::scoped`].
pub struct MacroScope<'a> {
    ctx: &'a mut MacroContext,
}

impl Deref for MacroScope<'_> {
    type Target = MacroContext;

    fn deref(&self) -> &MacroContext {
        self.ctx
    }
}

impl DerefMut for MacroScope<'_> {
    fn deref_mut(&mut self) -> &mut MacroContext {
        self.ctx
    }
}

impl Drop for MacroScope<'_> {
    fn drop(&mut self) {
        self.ctx.scopes.pop();
    }
}

/// Find the index of the close bracket matching `chars[open_index]`.
fn find_matching(chars: &[char], open_index: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, &c) in chars[open_index..].iter().enumerate() {
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return Some(open_index + offset);
            }
        }
    }
    None
}

/// Split `NAME,ALT=default` into the names part and the optional default,
/// honoring nesting so `$(A=$(B))` keeps its inner reference intact.
fn split_default(content: &str) -> (String, Option<String>) {
    let mut depth = 0usize;
    for (idx, c) in content.char_indices() {
        match c {
            '(' | '{' => depth += 1,
            ')' | '}' => depth = depth.saturating_sub(1),
            '=' if depth == 0 => {
                return (
                    content[..idx].to_string(),
                    Some(content[idx + 1..].to_string()),
                );
            }
            _ => {}
        }
    }
    (content.to_string(), None)
}

/// Parse a `A=1,B=2` definition string into ordered pairs.
pub fn parse_definitions(defs: &str) -> Result<Vec<(String, String)>, MacroDefError> {
    let mut pairs = Vec::new();
    for (index, chunk) in split_top_level(defs).into_iter().enumerate() {
        let chunk = chunk.trim();
        if chunk.is_empty() {
            continue;
        }
        let Some(eq) = find_top_level_equals(chunk) else {
            return Err(MacroDefError::MissingEquals {
                index,
                chunk: chunk.to_string(),
            });
        };
        let name = chunk[..eq].trim().to_string();
        let value = unquote(chunk[eq + 1..].trim());
        pairs.push((name, value));
    }
    Ok(pairs)
}

/// Split on commas outside quotes, parens and braces.
fn split_top_level(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for c in text.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    current.push(c);
                }
                '(' | '{' => {
                    depth += 1;
                    current.push(c);
                }
                ')' | '}' => {
                    depth = depth.saturating_sub(1);
                    current.push(c);
                }
                ',' if depth == 0 => {
                    chunks.push(std::mem::take(&mut current));
                }
                _ => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn find_top_level_equals(chunk: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, c) in chunk.char_indices() {
        match c {
            '(' | '{' => depth += 1,
            ')' | '}' => depth = depth.saturating_sub(1),
            '=' if depth == 0 => return Some(idx),
            _ => {}
        }
    }
    None
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if first == last && (first == b'"' || first == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_simple_references() {
        let mut ctx = MacroContext::new();
        ctx.define_from_string("A=1,B=2").expect("defs");
        assert_eq!(ctx.expand("$(A)-$(B)"), "1-2");
        assert_eq!(ctx.expand("${A}-${B}"), "1-2");
    }

    #[test]
    fn scoped_overrides_revert_on_drop() {
        let mut ctx = MacroContext::new();
        ctx.define_from_string("A=1,B=2").expect("defs");
        {
            let scope = ctx.scoped(vec![("A".to_string(), "9".to_string())]);
            assert_eq!(scope.expand("$(A)-$(B)"), "9-2");
        }
        assert_eq!(ctx.expand("$(A)-$(B)"), "1-2");
    }

    #[test]
    fn scoped_overrides_revert_on_panic() {
        let mut ctx = MacroContext::new();
        ctx.define("A", "1");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = ctx.scoped(vec![("A".to_string(), "9".to_string())]);
            panic!("inside scope");
        }));
        assert!(result.is_err());
        assert_eq!(ctx.expand("$(A)"), "1");
    }

    #[test]
    fn default_applies_only_when_every_name_misses() {
        let mut ctx = MacroContext::new();
        ctx.define("B", "alt");
        assert_eq!(ctx.expand("$(A,B=def)"), "alt");
        assert_eq!(ctx.expand("$(A,C=def)"), "def");
        ctx.define("A", "first");
        assert_eq!(ctx.expand("$(A,B=def)"), "first");
    }

    #[test]
    fn environment_is_consulted_before_default() {
        let mut ctx = MacroContext::new();
        ctx.use_environment = true;
        std::env::set_var("IOCGRAPH_MACRO_TEST_VAR", "from-env");
        assert_eq!(ctx.expand("$(IOCGRAPH_MACRO_TEST_VAR=def)"), "from-env");
        std::env::remove_var("IOCGRAPH_MACRO_TEST_VAR");
        assert_eq!(ctx.expand("$(IOCGRAPH_MACRO_TEST_VAR=def)"), "def");
    }

    #[test]
    fn undefined_policy_controls_rendering() {
        let mut ctx = MacroContext::new();
        ctx.undefined = UndefinedMacroPolicy::Keep;
        assert_eq!(ctx.expand("x$(GONE)y"), "x$(GONE)y");
        ctx.undefined = UndefinedMacroPolicy::Empty;
        assert_eq!(ctx.expand("x$(GONE)y"), "xy");
        ctx.show_warnings = true;
        assert_eq!(ctx.expand("x$(GONE)y"), "x$(GONE,undefined)y");
    }

    #[test]
    fn recursive_references_are_detected() {
        let mut ctx = MacroContext::new();
        ctx.define("A", "$(A)x");
        assert_eq!(ctx.expand("$(A)"), "$(A)x");
        ctx.show_warnings = true;
        assert_eq!(ctx.expand("$(A)"), "$(A,recursive)x");

        ctx.show_warnings = false;
        ctx.define("P", "$(Q)");
        ctx.define("Q", "$(P)");
        assert_eq!(ctx.expand("$(P)"), "$(P)");
    }

    #[test]
    fn nested_reference_builds_the_name() {
        let mut ctx = MacroContext::new();
        ctx.define("N", "1");
        ctx.define("P1", "first");
        assert_eq!(ctx.expand("$(P$(N))"), "first");
    }

    #[test]
    fn definition_values_may_be_quoted_and_hold_commas() {
        let mut ctx = MacroContext::new();
        let pairs = ctx
            .define_from_string("P=XF:31ID,DESC=\"a, quoted\"")
            .expect("defs");
        assert_eq!(pairs.len(), 2);
        assert_eq!(ctx.expand("$(DESC)"), "a, quoted");
    }

    #[test]
    fn definition_without_equals_is_rejected() {
        let mut ctx = MacroContext::new();
        let err = ctx.define_from_string("A=1,orphan").expect_err("should fail");
        assert!(err.to_string().contains("orphan"), "err={err}");
    }
}

//! Template substitution file grammar (`.substitutions`).
//!
//! Two row forms are supported, matching the classic tool:
//!
//! ```text
//! file "template.db" {
//!     pattern {P, N}
//!     {XF:31ID, 1}
//!     {XF:31ID, 2}
//! }
//! ```
//!
//! and the legacy variable form, optionally with `global` blocks whose
//! definitions apply to every following row:
//!
//! ```text
//! global {UNIT=mm}
//! file "template.db" {
//!     {P=XF:31ID, N=1}
//! }
//! ```
//!
//! Each row reduces to one [`TemplateSubstitution`]: the macro set to expand
//! the named template with, carrying the row's own context.

use crate::context::{FullLoadContext, LoadContext};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One macro-bound expansion of a template file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSubstitution {
    pub target_file: String,
    /// Macro pairs in effective order: globals first, row values overriding.
    pub macros: Vec<(String, String)>,
    pub context: FullLoadContext,
}

#[derive(Debug, Error)]
pub enum SubstitutionParseError {
    #[error("{file}:{line}: {message}")]
    Line {
        file: String,
        line: usize,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    LBrace,
    RBrace,
    Equals,
    Comma,
    Word(String),
}

/// Parse a substitution file into its ordered expansion rows.
pub fn parse_substitution(
    text: &str,
    source: &str,
    base_context: &FullLoadContext,
) -> Result<Vec<TemplateSubstitution>, SubstitutionParseError> {
    let err = |line: usize, message: String| SubstitutionParseError::Line {
        file: source.to_string(),
        line,
        message,
    };

    let tokens = lex(text);
    let mut out = Vec::new();
    let mut globals: Vec<(String, String)> = Vec::new();
    let mut i = 0usize;

    while i < tokens.len() {
        let (tok, line) = &tokens[i];
        match tok {
            Tok::Word(w) if w == "global" => {
                let (pairs, next) = parse_kv_block(&tokens, i + 1)
                    .map_err(|(l, m)| err(l, format!("global: {m}")))?;
                for (name, value) in pairs {
                    upsert(&mut globals, name, value);
                }
                i = next;
            }
            Tok::Word(w) if w == "file" => {
                let Some((Tok::Word(target), _)) = tokens.get(i + 1) else {
                    return Err(err(*line, "file: missing template name".to_string()));
                };
                let target = target.clone();
                let mut j = i + 2;
                expect(&tokens, j, &Tok::LBrace)
                    .map_err(|(l, m)| err(l, format!("file: {m}")))?;
                j += 1;

                let mut pattern: Option<Vec<String>> = None;
                loop {
                    match tokens.get(j) {
                        Some((Tok::RBrace, _)) => {
                            j += 1;
                            break;
                        }
                        Some((Tok::Word(w), _)) if w == "pattern" => {
                            let (names, next) = parse_word_block(&tokens, j + 1)
                                .map_err(|(l, m)| err(l, format!("pattern: {m}")))?;
                            pattern = Some(names);
                            j = next;
                        }
                        Some((Tok::Word(w), _)) if w == "global" => {
                            let (pairs, next) = parse_kv_block(&tokens, j + 1)
                                .map_err(|(l, m)| err(l, format!("global: {m}")))?;
                            for (name, value) in pairs {
                                upsert(&mut globals, name, value);
                            }
                            j = next;
                        }
                        Some((Tok::LBrace, row_line)) => {
                            let row_line = *row_line;
                            let row = parse_row(&tokens, j, pattern.as_deref())
                                .map_err(|(l, m)| err(l, m))?;
                            let (pairs, next) = row;
                            let mut macros = globals.clone();
                            for (name, value) in pairs {
                                upsert(&mut macros, name, value);
                            }
                            out.push(TemplateSubstitution {
                                target_file: target.clone(),
                                macros,
                                context: base_context
                                    .pushed(LoadContext::new(source.to_string(), row_line)),
                            });
                            j = next;
                        }
                        Some((other, l)) => {
                            return Err(err(*l, format!("unexpected token in file block: {other:?}")));
                        }
                        None => {
                            return Err(err(*line, "unterminated file block".to_string()));
                        }
                    }
                }
                i = j;
            }
            Tok::Word(other) => {
                return Err(err(*line, format!("unexpected word: {other}")));
            }
            other => {
                return Err(err(*line, format!("unexpected token: {other:?}")));
            }
        }
    }

    Ok(out)
}

fn expect(tokens: &[(Tok, usize)], i: usize, want: &Tok) -> Result<(), (usize, String)> {
    match tokens.get(i) {
        Some((tok, _)) if tok == want => Ok(()),
        Some((tok, line)) => Err((*line, format!("expected {want:?}, found {tok:?}"))),
        None => Err((
            tokens.last().map(|(_, l)| *l).unwrap_or(1),
            format!("expected {want:?}, found end of file"),
        )),
    }
}

/// `{a=b, c=d}` -> pairs. Commas are optional separators.
fn parse_kv_block(
    tokens: &[(Tok, usize)],
    start: usize,
) -> Result<(Vec<(String, String)>, usize), (usize, String)> {
    expect(tokens, start, &Tok::LBrace)?;
    let mut pairs = Vec::new();
    let mut i = start + 1;
    loop {
        match tokens.get(i) {
            Some((Tok::RBrace, _)) => return Ok((pairs, i + 1)),
            Some((Tok::Comma, _)) => i += 1,
            Some((Tok::Word(name), line)) => {
                expect(tokens, i + 1, &Tok::Equals).map_err(|_| {
                    (*line, format!("expected `=` after {name:?}"))
                })?;
                let Some((Tok::Word(value), _)) = tokens.get(i + 2) else {
                    return Err((*line, format!("missing value for {name:?}")));
                };
                pairs.push((name.clone(), value.clone()));
                i += 3;
            }
            Some((tok, line)) => return Err((*line, format!("unexpected token: {tok:?}"))),
            None => {
                return Err((
                    tokens.last().map(|(_, l)| *l).unwrap_or(1),
                    "unterminated block".to_string(),
                ))
            }
        }
    }
}

/// `{a, b, c}` -> words.
fn parse_word_block(
    tokens: &[(Tok, usize)],
    start: usize,
) -> Result<(Vec<String>, usize), (usize, String)> {
    expect(tokens, start, &Tok::LBrace)?;
    let mut words = Vec::new();
    let mut i = start + 1;
    loop {
        match tokens.get(i) {
            Some((Tok::RBrace, _)) => return Ok((words, i + 1)),
            Some((Tok::Comma, _)) => i += 1,
            Some((Tok::Word(w), _)) => {
                words.push(w.clone());
                i += 1;
            }
            Some((tok, line)) => return Err((*line, format!("unexpected token: {tok:?}"))),
            None => {
                return Err((
                    tokens.last().map(|(_, l)| *l).unwrap_or(1),
                    "unterminated block".to_string(),
                ))
            }
        }
    }
}

/// One substitution row, positional when a pattern is in effect, `a=b`
/// otherwise. Missing positional values expand to the empty string.
fn parse_row(
    tokens: &[(Tok, usize)],
    start: usize,
    pattern: Option<&[String]>,
) -> Result<(Vec<(String, String)>, usize), (usize, String)> {
    // Peek for `=` at row top level to pick the form.
    let mut has_equals = false;
    let mut k = start + 1;
    while let Some((tok, _)) = tokens.get(k) {
        match tok {
            Tok::RBrace => break,
            Tok::Equals => {
                has_equals = true;
                break;
            }
            _ => k += 1,
        }
    }

    if has_equals {
        return parse_kv_block(tokens, start);
    }

    let line = tokens[start].1;
    let Some(names) = pattern else {
        return Err((line, "value row without a preceding pattern".to_string()));
    };
    let (values, next) = parse_word_block(tokens, start)?;
    if values.len() > names.len() {
        return Err((
            line,
            format!(
                "row has {} values but the pattern names {}",
                values.len(),
                names.len()
            ),
        ));
    }
    let mut pairs = Vec::new();
    for (idx, name) in names.iter().enumerate() {
        let value = values.get(idx).cloned().unwrap_or_default();
        pairs.push((name.clone(), value));
    }
    Ok((pairs, next))
}

fn upsert(pairs: &mut Vec<(String, String)>, name: String, value: String) {
    if let Some(slot) = pairs.iter_mut().find(|(n, _)| *n == name) {
        slot.1 = value;
        return;
    }
    pairs.push((name, value));
}

fn lex(text: &str) -> Vec<(Tok, usize)> {
    let mut tokens = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let mut chars = raw.char_indices().peekable();
        while let Some(&(_, c)) = chars.peek() {
            match c {
                '#' => break,
                c if c.is_whitespace() => {
                    chars.next();
                }
                '{' => {
                    chars.next();
                    tokens.push((Tok::LBrace, line));
                }
                '}' => {
                    chars.next();
                    tokens.push((Tok::RBrace, line));
                }
                '=' => {
                    chars.next();
                    tokens.push((Tok::Equals, line));
                }
                ',' => {
                    chars.next();
                    tokens.push((Tok::Comma, line));
                }
                '"' | '\'' => {
                    let quote = c;
                    chars.next();
                    let mut word = String::new();
                    let mut escaped = false;
                    for (_, c) in chars.by_ref() {
                        if escaped {
                            word.push(c);
                            escaped = false;
                        } else if c == '\\' {
                            escaped = true;
                        } else if c == quote {
                            break;
                        } else {
                            word.push(c);
                        }
                    }
                    tokens.push((Tok::Word(word), line));
                }
                _ => {
                    let mut word = String::new();
                    while let Some(&(_, c)) = chars.peek() {
                        if c.is_whitespace() || matches!(c, '{' | '}' | '=' | ',' | '#') {
                            break;
                        }
                        word.push(c);
                        chars.next();
                    }
                    tokens.push((Tok::Word(word), line));
                }
            }
        }
    }
    tokens
}

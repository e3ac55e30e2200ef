// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The source checker.
//!
//! Runs before any parse: strips comments and strings, verifies balanced
//! brackets, requires exactly one class or function declaration, and
//! rejects `for…in` (its iteration order is unstable in hostile hosts).

use super::LangError;

pub fn check_source(source: &str) -> Result<(), LangError> {
    let stripped = strip(source)?;
    check_balanced(&stripped)?;
    check_single_declaration(&stripped)?;
    check_no_for_in(&stripped)?;
    Ok(())
}

/// Removes comments entirely and replaces string contents with spaces, so
/// the structural checks cannot be confused by brace characters in text.
fn strip(source: &str) -> Result<String, LangError> {
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let close = source[i + 2..]
                    .find("*/")
                    .ok_or_else(|| LangError::Check("unterminated block comment".into()))?;
                i += 2 + close + 2;
            }
            quote @ (b'\'' | b'"') => {
                out.push(' ');
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                if i >= bytes.len() {
                    return Err(LangError::Check("unterminated string".into()));
                }
                out.push(' ');
                i += 1;
            }
            c => {
                out.push(c as char);
                i += 1;
            }
        }
    }
    Ok(out)
}

fn check_balanced(stripped: &str) -> Result<(), LangError> {
    let mut stack = Vec::new();
    for c in stripped.chars() {
        match c {
            '{' | '(' | '[' => stack.push(c),
            '}' | ')' | ']' => {
                let open = stack.pop();
                let matches = matches!(
                    (open, c),
                    (Some('{'), '}') | (Some('('), ')') | (Some('['), ']')
                );
                if !matches {
                    return Err(LangError::Check(format!("unbalanced {c:?}")));
                }
            }
            _ => {}
        }
    }
    if !stack.is_empty() {
        return Err(LangError::Check("unclosed bracket".into()));
    }
    Ok(())
}

/// The source must be one `class` or `function` declaration ending at the
/// closing brace of its body.
fn check_single_declaration(stripped: &str) -> Result<(), LangError> {
    let trimmed = stripped.trim_start();
    let is_class = trimmed.starts_with("class") && !starts_with_ident_char(&trimmed[5..]);
    let is_function = trimmed.starts_with("function") && !starts_with_ident_char(&trimmed[8..]);
    if !is_class && !is_function {
        return Err(LangError::Check(
            "source must be a class or function declaration".into(),
        ));
    }

    // After the declaration's final close brace there must be nothing.
    let mut depth = 0usize;
    let mut seen_open = false;
    for (idx, c) in stripped.char_indices() {
        match c {
            '{' => {
                depth += 1;
                seen_open = true;
            }
            '}' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| LangError::Check("unbalanced brace".into()))?;
                if depth == 0 && seen_open {
                    let rest = &stripped[idx + 1..];
                    if !rest.trim().is_empty() {
                        return Err(LangError::Check(
                            "source must contain a single declaration".into(),
                        ));
                    }
                    return Ok(());
                }
            }
            _ => {}
        }
    }
    Err(LangError::Check("declaration has no body".into()))
}

fn starts_with_ident_char(s: &str) -> bool {
    s.chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Scans every `for` header for the `in` keyword.
fn check_no_for_in(stripped: &str) -> Result<(), LangError> {
    let words = word_positions(stripped);
    for (i, (word, end)) in words.iter().enumerate() {
        if word != "for" {
            continue;
        }
        // Find the parenthesized header that follows.
        let Some(open) = stripped[*end..].find('(').map(|p| end + p) else {
            continue;
        };
        let mut depth = 0usize;
        let mut close = None;
        for (idx, c) in stripped[open..].char_indices() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        close = Some(open + idx);
                        break;
                    }
                }
                _ => {}
            }
        }
        let Some(close) = close else { continue };
        let header_has_in = words
            .iter()
            .skip(i + 1)
            .take_while(|(_, e)| *e <= close)
            .any(|(w, _)| w == "in");
        if header_has_in {
            return Err(LangError::Check(
                "for…in is not deterministic and is forbidden".into(),
            ));
        }
    }
    Ok(())
}

/// (word, end byte offset) for each identifier-shaped run.
fn word_positions(s: &str) -> Vec<(String, usize)> {
    let mut words = Vec::new();
    let mut current = String::new();
    for (idx, c) in s.char_indices() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
            current.push(c);
        } else if !current.is_empty() {
            words.push((std::mem::take(&mut current), idx));
        }
    }
    if !current.is_empty() {
        words.push((current, s.len()));
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_single_declarations() {
        assert!(check_source("class A {}").is_ok());
        assert!(check_source("class A extends B { f() { return 1 } }").is_ok());
        assert!(check_source("function f(a) { return a }").is_ok());
        assert!(check_source("  class A {}  ").is_ok());
    }

    #[test]
    fn rejects_multiple_declarations() {
        assert!(check_source("class A {} class B {}").is_err());
        assert!(check_source("class A {}; let x = 1").is_err());
    }

    #[test]
    fn rejects_non_declarations() {
        assert!(check_source("let x = 1").is_err());
        assert!(check_source("classy {}").is_err());
        assert!(check_source("").is_err());
    }

    #[test]
    fn ignores_braces_in_strings_and_comments() {
        assert!(check_source("class A { f() { return '}' } }").is_ok());
        assert!(check_source("class A { /* } */ }").is_ok());
        assert!(check_source("class A { // }\n }").is_ok());
    }

    #[test]
    fn rejects_unbalanced_braces() {
        assert!(check_source("class A {").is_err());
        assert!(check_source("class A { f() { } ").is_err());
        assert!(check_source("class A { f(] }").is_err());
    }

    #[test]
    fn rejects_for_in() {
        assert!(check_source("class A { f(o) { for (let k in o) {} } }").is_err());
        // for…of passes, and `in` inside the body is fine.
        assert!(check_source("class A { f(o) { for (let k of o) { let inside = 1 } } }").is_ok());
    }
}

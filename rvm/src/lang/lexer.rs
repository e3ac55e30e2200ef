// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

use super::LangError;

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    Punct(&'static str),
    Eof,
}

impl Token {
    pub fn is_punct(&self, p: &str) -> bool {
        matches!(self, Token::Punct(q) if *q == p)
    }

    pub fn is_ident(&self, name: &str) -> bool {
        matches!(self, Token::Ident(i) if i == name)
    }
}

/// Multi-character punctuators first so maximal munch wins.
const PUNCTS: [&str; 30] = [
    "===", "!==", "=>", "==", "!=", "<=", ">=", "&&", "||", "+=", "-=", "(", ")", "{", "}", "[",
    "]", ",", ";", ".", ":", "=", "<", ">", "+", "-", "*", "/", "%", "!",
];

pub fn tokenize(source: &str) -> Result<Vec<Token>, LangError> {
    let mut tokens = Vec::new();
    let bytes = source.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        // Comments.
        if c == b'/' && bytes.get(i + 1) == Some(&b'/') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if c == b'/' && bytes.get(i + 1) == Some(&b'*') {
            let close = source[i + 2..]
                .find("*/")
                .ok_or_else(|| LangError::Lex("unterminated block comment".into()))?;
            i += 2 + close + 2;
            continue;
        }
        // Strings.
        if c == b'\'' || c == b'"' {
            let (s, len) = lex_string(&source[i..])?;
            tokens.push(Token::Str(s));
            i += len;
            continue;
        }
        // Numbers.
        if c.is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i < bytes.len() && (bytes[i] == b'.' || bytes[i] == b'e' || bytes[i] == b'E') {
                return Err(LangError::Lex(
                    "non-integer number literals are not supported".into(),
                ));
            }
            let text = &source[start..i];
            let n: i64 = text
                .parse()
                .map_err(|_| LangError::Lex(format!("integer literal out of range: {text}")))?;
            tokens.push(Token::Int(n));
            continue;
        }
        // Identifiers and keywords.
        if c.is_ascii_alphabetic() || c == b'_' || c == b'$' {
            let start = i;
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'$')
            {
                i += 1;
            }
            tokens.push(Token::Ident(source[start..i].to_owned()));
            continue;
        }
        // Punctuators.
        let mut matched = false;
        for p in PUNCTS {
            if source[i..].starts_with(p) {
                tokens.push(Token::Punct(p));
                i += p.len();
                matched = true;
                break;
            }
        }
        if !matched {
            return Err(LangError::Lex(format!(
                "unexpected character {:?}",
                source[i..].chars().next().unwrap_or('?')
            )));
        }
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

/// Lexes a quoted string starting at the opening quote; returns the value
/// and the byte length consumed including quotes.
fn lex_string(rest: &str) -> Result<(String, usize), LangError> {
    let mut chars = rest.char_indices();
    let (_, quote) = chars.next().expect("caller checked");
    let mut out = String::new();
    while let Some((idx, c)) = chars.next() {
        if c == quote {
            return Ok((out, idx + c.len_utf8()));
        }
        if c == '\\' {
            let (_, esc) = chars
                .next()
                .ok_or_else(|| LangError::Lex("unterminated string".into()))?;
            match esc {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                '\\' => out.push('\\'),
                '\'' => out.push('\''),
                '"' => out.push('"'),
                'u' => {
                    let mut code = 0u32;
                    for _ in 0..4 {
                        let (_, h) = chars
                            .next()
                            .ok_or_else(|| LangError::Lex("bad unicode escape".into()))?;
                        code = code * 16
                            + h.to_digit(16)
                                .ok_or_else(|| LangError::Lex("bad unicode escape".into()))?;
                    }
                    out.push(
                        char::from_u32(code)
                            .ok_or_else(|| LangError::Lex("bad unicode escape".into()))?,
                    );
                }
                other => {
                    return Err(LangError::Lex(format!("unknown escape \\{other}")));
                }
            }
            continue;
        }
        out.push(c);
    }
    Err(LangError::Lex("unterminated string".into()))
}

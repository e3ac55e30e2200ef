// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The deterministic jig dialect: lexer, parser, and source checker.
//!
//! User code reaches the runtime as source strings. The checker gates what
//! may even be parsed; the parser produces the tree the sandbox turns into
//! a class template and the interpreter executes.

pub mod ast;
mod check;
mod lexer;
mod parser;

pub use check::check_source;
pub use parser::parse_declaration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LangError {
    #[error("lex error: {0}")]
    Lex(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("source check failed: {0}")]
    Check(String),
}

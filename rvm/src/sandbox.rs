// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The sandbox: turns source strings into class templates.
//!
//! Evaluation is memoized per kernel, so identical sources share one
//! template and intrinsic identity is stable within a process. The
//! checker runs first; nothing unchecked ever reaches the parser.

use std::collections::HashMap;
use std::rc::Rc;

use rvm_shared::{Result, RvmError};

use crate::lang::ast::{Decl, MethodDecl};
use crate::lang::{check_source, parse_declaration};

/// Idents of the built-in creations.
pub const NATIVE_JIG: &str = "Jig";
pub const NATIVE_BERRY: &str = "Berry";

/// An evaluated source: the declaration plus its stable name. The name is
/// taken from the declaration itself, never from the caller's scope.
pub struct ClassTemplate {
    pub name: String,
    pub decl: Decl,
    pub src: String,
}

impl ClassTemplate {
    /// The parent class name, when declared.
    pub fn parent(&self) -> Option<&str> {
        match &self.decl {
            Decl::Class(c) => c.parent.as_deref(),
            Decl::Function(_) => None,
        }
    }

    pub fn method(&self, name: &str, is_static: bool) -> Option<&MethodDecl> {
        match &self.decl {
            Decl::Class(c) => c.method(name, is_static),
            Decl::Function(_) => None,
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self.decl, Decl::Function(_))
    }
}

/// The per-kernel compartment factory.
#[derive(Default)]
pub struct Sandbox {
    memo: HashMap<String, Rc<ClassTemplate>>,
}

impl Sandbox {
    pub fn new() -> Self {
        Sandbox {
            memo: HashMap::new(),
        }
    }

    /// Checks and evaluates a source string. Identical sources return the
    /// identical template.
    pub fn evaluate(&mut self, source: &str) -> Result<Rc<ClassTemplate>> {
        if let Some(template) = self.memo.get(source) {
            return Ok(template.clone());
        }
        check_source(source).map_err(|e| RvmError::execution(e.to_string()))?;
        let decl =
            parse_declaration(source).map_err(|e| RvmError::execution(e.to_string()))?;
        let template = Rc::new(ClassTemplate {
            name: decl.name().to_owned(),
            decl,
            src: source.to_owned(),
        });
        self.memo.insert(source.to_owned(), template.clone());
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_is_memoized() {
        let mut sandbox = Sandbox::new();
        let a = sandbox.evaluate("class A {}").unwrap();
        let b = sandbox.evaluate("class A {}").unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        let c = sandbox.evaluate("class A { }").unwrap();
        assert!(!Rc::ptr_eq(&a, &c));
    }

    #[test]
    fn name_comes_from_the_declaration() {
        let mut sandbox = Sandbox::new();
        let t = sandbox.evaluate("class Token extends Jig {}").unwrap();
        assert_eq!(t.name, "Token");
        assert_eq!(t.parent(), Some("Jig"));
    }

    #[test]
    fn unchecked_sources_are_rejected() {
        let mut sandbox = Sandbox::new();
        assert!(sandbox.evaluate("let x = 1").is_err());
        assert!(sandbox.evaluate("class A {} class B {}").is_err());
        assert!(sandbox
            .evaluate("class A { f(o) { for (let k in o) {} } }")
            .is_err());
    }
}

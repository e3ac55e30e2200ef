// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Creations: the tagged union of everything addressable on chain.

use std::cell::RefCell;
use std::rc::Rc;

use rvm_shared::bindings::Bindings;

use crate::heap::CreationId;
use crate::membrane::Rules;
use crate::sandbox::ClassTemplate;
use crate::value::Props;

#[derive(Clone)]
pub enum CreationKind {
    /// A deployed class: source plus its evaluated template. The
    /// dependency map lives in props under `deps`.
    Code {
        src: String,
        template: Rc<ClassTemplate>,
    },
    /// An instance; its class is another creation.
    Jig { class: CreationId },
    /// An immutable pluck keyed by (class, path).
    Berry { class: CreationId, path: String },
    /// A built-in, addressed only via `native://`.
    Native { ident: String },
    /// A shell whose kind is not yet known; filled by a completer.
    Pending,
}

pub struct Creation {
    pub kind: CreationKind,
    pub bindings: Bindings,
    pub props: Rc<RefCell<Props>>,
    pub rules: Rules,
    /// False while this is a recreate shell awaiting phase 2; membranes
    /// reject access until then.
    pub initialized: bool,
}

impl Creation {
    pub fn new(kind: CreationKind, rules: Rules) -> Self {
        Creation {
            kind,
            bindings: Bindings::undeployed(),
            props: Rc::new(RefCell::new(Props::new())),
            rules,
            initialized: true,
        }
    }

    pub fn shell(kind: CreationKind, rules: Rules) -> Self {
        Creation {
            initialized: false,
            ..Creation::new(kind, rules)
        }
    }

    pub fn is_code(&self) -> bool {
        matches!(self.kind, CreationKind::Code { .. })
    }

    pub fn is_native(&self) -> bool {
        matches!(self.kind, CreationKind::Native { .. })
    }

    /// The class creation for instances and berries.
    pub fn class(&self) -> Option<CreationId> {
        match self.kind {
            CreationKind::Jig { class } | CreationKind::Berry { class, .. } => Some(class),
            _ => None,
        }
    }

    pub fn template(&self) -> Option<&Rc<ClassTemplate>> {
        match &self.kind {
            CreationKind::Code { template, .. } => Some(template),
            _ => None,
        }
    }

    pub fn src(&self) -> Option<&str> {
        match &self.kind {
            CreationKind::Code { src, .. } => Some(src),
            _ => None,
        }
    }
}

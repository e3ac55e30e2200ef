// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

/// The per-creation access profile. A value, not a hierarchy: each
/// creation kind picks its table at construction time.
#[derive(Clone, Debug)]
pub struct Rules {
    /// Location bindings managed by the runtime; UTXO bindings settable
    /// by the creation's own methods.
    pub bindings: bool,
    /// Reserved names cannot be redefined.
    pub reserved: bool,
    /// Underscore names visible only to methods of the same class.
    pub privacy: bool,
    /// Any define/set/delete fails.
    pub immutable: bool,
    pub record_reads: bool,
    pub record_updates: bool,
    pub record_calls: bool,
    /// Only the owner lock may mutate; verified at publish.
    pub smart_api: bool,
    /// Calling a method with a local class as `this` installs it as code
    /// first.
    pub autocode: bool,
    /// Method names that cannot be invoked.
    pub disabled_methods: Vec<String>,
    /// Method names invoked without recording.
    pub unrecorded_methods: Vec<String>,
}

impl Rules {
    pub fn jig_code() -> Self {
        Rules {
            bindings: true,
            reserved: true,
            privacy: true,
            immutable: false,
            record_reads: true,
            record_updates: true,
            record_calls: true,
            smart_api: true,
            autocode: true,
            disabled_methods: vec![],
            unrecorded_methods: vec![],
        }
    }

    pub fn jig_instance() -> Self {
        Rules {
            bindings: true,
            reserved: true,
            privacy: true,
            immutable: false,
            record_reads: true,
            record_updates: true,
            record_calls: true,
            smart_api: true,
            autocode: false,
            disabled_methods: vec![],
            unrecorded_methods: vec![],
        }
    }

    pub fn berry() -> Self {
        Rules {
            bindings: false,
            reserved: true,
            privacy: true,
            immutable: true,
            record_reads: true,
            record_updates: false,
            record_calls: false,
            smart_api: false,
            autocode: false,
            disabled_methods: vec![],
            unrecorded_methods: vec![],
        }
    }

    /// Non-jig helper code: readable, never writable, calls unrecorded.
    pub fn sidekick_code() -> Self {
        Rules {
            bindings: true,
            reserved: true,
            privacy: false,
            immutable: true,
            record_reads: true,
            record_updates: false,
            record_calls: false,
            smart_api: false,
            autocode: false,
            disabled_methods: vec![],
            unrecorded_methods: vec![],
        }
    }

    pub fn native_code() -> Self {
        Rules {
            bindings: false,
            reserved: true,
            privacy: false,
            immutable: true,
            record_reads: false,
            record_updates: false,
            record_calls: false,
            smart_api: false,
            autocode: false,
            disabled_methods: vec!["init".into()],
            unrecorded_methods: vec![],
        }
    }

    /// The profile inner collections inherit; reads from a non-owning
    /// method force immutability.
    pub fn child_of(parent: &Rules, owned: bool) -> Self {
        Rules {
            immutable: parent.immutable || !owned,
            disabled_methods: vec![],
            unrecorded_methods: vec![],
            ..parent.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_differ_where_it_matters() {
        assert!(!Rules::jig_code().immutable);
        assert!(Rules::berry().immutable);
        assert!(Rules::sidekick_code().immutable);
        assert!(Rules::jig_instance().record_updates);
        assert!(!Rules::berry().record_updates);
        assert!(Rules::jig_code().autocode);
        assert!(!Rules::jig_instance().autocode);
    }

    #[test]
    fn children_of_foreign_readers_are_frozen() {
        let parent = Rules::jig_instance();
        assert!(!Rules::child_of(&parent, true).immutable);
        assert!(Rules::child_of(&parent, false).immutable);
        assert!(Rules::child_of(&Rules::berry(), true).immutable);
    }
}

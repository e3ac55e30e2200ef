// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The creation arena.
//!
//! Every live creation sits in one per-kernel heap slot; values refer to
//! creations only by [`CreationId`], so cross-creation cycles never form
//! owning pointer cycles. Not threadsafe; the runtime is single-threaded
//! by design.

use std::collections::HashMap;

use rvm_shared::bindings::Bindings;
use rvm_shared::Location;

use crate::creation::Creation;
use crate::value::{Props, Value};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct CreationId(pub u32);

/// A deep, deterministic copy of a creation's own-properties and
/// bindings. Immutable once taken.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub bindings: Bindings,
    pub props: Props,
}

pub struct Heap {
    slots: Vec<Creation>,
}

impl Heap {
    pub fn new() -> Self {
        Heap { slots: Vec::new() }
    }

    pub fn alloc(&mut self, creation: Creation) -> CreationId {
        let id = CreationId(self.slots.len() as u32);
        self.slots.push(creation);
        id
    }

    pub fn get(&self, id: CreationId) -> &Creation {
        &self.slots[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: CreationId) -> &mut Creation {
        &mut self.slots[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = CreationId> {
        (0..self.slots.len() as u32).map(CreationId)
    }

    /// Finds the creation currently bound to a location.
    pub fn find_by_location(&self, location: &Location) -> Option<CreationId> {
        self.ids()
            .find(|id| &self.get(*id).bindings.location == location)
    }

    /// Groups every creation under its origin string. Undeployed
    /// creations key under their record location.
    pub fn origin_key(&self, id: CreationId) -> String {
        let creation = self.get(id);
        if creation.bindings.origin.is_undeployed() {
            format!("record:{}", id.0)
        } else {
            creation.bindings.origin.compile()
        }
    }

    /// A deep copy of one creation's state; internal sharing and cycles
    /// in the props are preserved within the copy.
    pub fn snapshot(&self, id: CreationId) -> Snapshot {
        let creation = self.get(id);
        let mut memo = HashMap::new();
        let props: Props = creation
            .props
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.deep_copy(&mut memo)))
            .collect();
        Snapshot {
            bindings: creation.bindings.clone(),
            props,
        }
    }

    /// Rolls a creation back to a snapshot.
    pub fn restore(&mut self, id: CreationId, snapshot: &Snapshot) {
        let mut memo = HashMap::new();
        let props: Props = snapshot
            .props
            .iter()
            .map(|(k, v)| (k.clone(), v.deep_copy(&mut memo)))
            .collect();
        let creation = self.get_mut(id);
        creation.bindings = snapshot.bindings.clone();
        *creation.props.borrow_mut() = props;
    }

    /// Every creation referenced from a value graph, plus those reachable
    /// through the props of referenced creations, transitively.
    pub fn reachable_creations(&self, roots: &[Value]) -> Vec<CreationId> {
        let mut seen = Vec::new();
        let mut queue: Vec<CreationId> = Vec::new();
        for root in roots {
            root.for_each_creation(&mut |id| queue.push(id));
        }
        while let Some(id) = queue.pop() {
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            let creation = self.get(id);
            for (_, v) in creation.props.borrow().iter() {
                v.for_each_creation(&mut |child| queue.push(child));
            }
            if let Some(class) = creation.class() {
                queue.push(class);
            }
        }
        seen
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creation::CreationKind;
    use crate::membrane::Rules;
    use crate::value::PropKey;

    fn native(ident: &str) -> Creation {
        Creation::new(
            CreationKind::Native {
                ident: ident.into(),
            },
            Rules::native_code(),
        )
    }

    #[test]
    fn alloc_and_lookup() {
        let mut heap = Heap::new();
        let id = heap.alloc(native("Jig"));
        assert_eq!(heap.len(), 1);
        assert!(matches!(
            &heap.get(id).kind,
            CreationKind::Native { ident } if ident == "Jig"
        ));
    }

    #[test]
    fn snapshot_and_restore_roundtrip() {
        let mut heap = Heap::new();
        let id = heap.alloc(native("Jig"));
        heap.get(id)
            .props
            .borrow_mut()
            .insert(PropKey::new("n"), Value::Int(1));

        let snap = heap.snapshot(id);
        heap.get(id)
            .props
            .borrow_mut()
            .insert(PropKey::new("n"), Value::Int(2));
        heap.restore(id, &snap);

        let props = heap.get(id).props.borrow();
        assert!(matches!(props[&PropKey::new("n")], Value::Int(1)));
    }

    #[test]
    fn snapshots_are_detached_from_live_props() {
        let mut heap = Heap::new();
        let id = heap.alloc(native("Jig"));
        let list = Value::new_array(vec![Value::Int(1)]);
        heap.get(id)
            .props
            .borrow_mut()
            .insert(PropKey::new("list"), list.clone());

        let snap = heap.snapshot(id);
        if let Value::Array(rc) = &list {
            rc.borrow_mut().push(Value::Int(2));
        }
        let Value::Array(rc) = &snap.props[&PropKey::new("list")] else {
            panic!()
        };
        assert_eq!(rc.borrow().len(), 1);
    }
}

// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Reference unification — the worldview.
//!
//! Before user code runs, every creation reachable from the call's
//! argument graph is resolved to one chosen version per origin (the
//! latest by nonce), and all reference slots are rewritten to the chosen
//! versions so identity and equality are consistent inside the call.

use std::collections::{HashMap, HashSet};

use rvm_shared::{Result, RvmError};

use crate::heap::{CreationId, Heap};
use crate::value::{Props, Value};

/// The outcome of replay-time unification.
#[derive(Debug)]
pub struct Worldview {
    /// origin key → chosen version.
    pub chosen: HashMap<String, CreationId>,
    /// Pre-unification props of indirectly referenced creations, restored
    /// after replay for creations that are not outputs.
    saved: HashMap<CreationId, Props>,
}

impl Worldview {
    /// Restores indirect references of creations that did not become part
    /// of any output.
    pub fn deunify(&self, heap: &mut Heap, outputs: &HashSet<CreationId>) {
        for (id, props) in &self.saved {
            if outputs.contains(id) {
                continue;
            }
            let mut memo = HashMap::new();
            let restored: Props = props
                .iter()
                .map(|(k, v)| (k.clone(), v.deep_copy(&mut memo)))
                .collect();
            *heap.get(*id).props.borrow_mut() = restored;
        }
    }
}

fn choose_latest(heap: &Heap, ids: &[CreationId]) -> HashMap<String, CreationId> {
    let mut chosen: HashMap<String, CreationId> = HashMap::new();
    for id in ids {
        let key = heap.origin_key(*id);
        match chosen.get(&key) {
            Some(current)
                if heap.get(*current).bindings.nonce >= heap.get(*id).bindings.nonce => {}
            _ => {
                chosen.insert(key, *id);
            }
        }
    }
    chosen
}

fn rewrite_all(heap: &Heap, roots: &[Value], ids: &[CreationId], chosen: &HashMap<String, CreationId>) {
    let map = |id: CreationId| -> CreationId {
        chosen.get(&heap.origin_key(id)).copied().unwrap_or(id)
    };
    for root in roots {
        root.rewrite_creations(&map);
    }
    for id in ids {
        for (_, v) in heap.get(*id).props.borrow().iter() {
            v.rewrite_creations(&map);
        }
    }
}

/// Method-time unification over a call's argument graph. `fixed` holds
/// creations the enclosing record has already committed to; two distinct
/// fixed versions of one origin cannot be reconciled.
pub fn unify_for_method(
    heap: &Heap,
    roots: &[Value],
    fixed: &[CreationId],
) -> Result<HashMap<String, CreationId>> {
    let reachable = heap.reachable_creations(roots);
    let mut chosen = choose_latest(heap, &reachable);

    // Fixed creations win over anything newer found in the graph.
    for id in fixed {
        let key = heap.origin_key(*id);
        if let Some(existing) = chosen.get(&key) {
            if existing != id && fixed.contains(existing) {
                return Err(RvmError::execution(format!(
                    "inconsistent worldview: two fixed versions of {key}"
                )));
            }
        }
        if reachable.contains(id) || chosen.contains_key(&key) {
            chosen.insert(key, *id);
        }
    }

    rewrite_all(heap, roots, &reachable, &chosen);
    Ok(chosen)
}

/// Replay-time unification. `incoming` are the loaded inputs and refs —
/// the authoritative versions for this transaction. A reachable version
/// newer than the incoming one for the same origin is time travel.
pub fn unify_for_replay(heap: &Heap, incoming: &[CreationId]) -> Result<Worldview> {
    let roots: Vec<Value> = incoming.iter().map(|id| Value::Creation(*id)).collect();
    let reachable = heap.reachable_creations(&roots);

    let mut chosen: HashMap<String, CreationId> = HashMap::new();
    let mut incoming_keys = HashSet::new();
    for id in incoming {
        let key = heap.origin_key(*id);
        incoming_keys.insert(key.clone());
        chosen.insert(key, *id);
    }

    for id in &reachable {
        let key = heap.origin_key(*id);
        if incoming_keys.contains(&key) {
            // The incoming version is authoritative: anything newer in
            // the reachable graph came from the future.
            let authoritative = chosen[&key];
            if heap.get(*id).bindings.nonce > heap.get(authoritative).bindings.nonce {
                return Err(RvmError::execution(format!(
                    "Time travel: {key} referenced at nonce {} but supplied at nonce {}",
                    heap.get(*id).bindings.nonce,
                    heap.get(authoritative).bindings.nonce,
                )));
            }
        } else {
            // Indirect reference; the latest observed version wins.
            match chosen.get(&key) {
                Some(best)
                    if heap.get(*best).bindings.nonce >= heap.get(*id).bindings.nonce => {}
                _ => {
                    chosen.insert(key, *id);
                }
            }
        }
    }

    // Save pre-unification props of everything whose slots we rewrite.
    let mut saved = HashMap::new();
    for id in &reachable {
        let mut memo = HashMap::new();
        let props: Props = heap
            .get(*id)
            .props
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.deep_copy(&mut memo)))
            .collect();
        saved.insert(*id, props);
    }

    rewrite_all(heap, &roots, &reachable, &chosen);
    Ok(Worldview { chosen, saved })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creation::{Creation, CreationKind};
    use crate::membrane::Rules;
    use crate::value::PropKey;
    use rvm_shared::Location;

    /// Two versions of one origin at different nonces.
    fn versioned_pair(heap: &mut Heap) -> (CreationId, CreationId) {
        let origin = Location::parse(&format!("{}_o1", "ab".repeat(32))).unwrap();
        let mut old = Creation::new(
            CreationKind::Jig {
                class: CreationId(0),
            },
            Rules::jig_instance(),
        );
        old.bindings.origin = origin.clone();
        old.bindings.location = origin.clone();
        old.bindings.nonce = 1;
        let mut new = Creation::new(
            CreationKind::Jig {
                class: CreationId(0),
            },
            Rules::jig_instance(),
        );
        new.bindings.origin = origin;
        new.bindings.location =
            Location::parse(&format!("{}_o1", "cd".repeat(32))).unwrap();
        new.bindings.nonce = 2;
        (heap.alloc(old), heap.alloc(new))
    }

    #[test]
    fn method_unify_picks_latest_and_rewrites() {
        let mut heap = Heap::new();
        let (old, new) = versioned_pair(&mut heap);
        let graph = Value::new_array(vec![
            Value::Creation(old),
            Value::Creation(new),
        ]);
        unify_for_method(&heap, std::slice::from_ref(&graph), &[]).unwrap();
        let Value::Array(rc) = &graph else { panic!() };
        let items = rc.borrow();
        assert!(items[0].strict_eq(&Value::Creation(new)));
        assert!(items[1].strict_eq(&Value::Creation(new)));
    }

    #[test]
    fn method_unify_is_idempotent() {
        let mut heap = Heap::new();
        let (old, new) = versioned_pair(&mut heap);
        let graph = Value::new_array(vec![Value::Creation(old)]);
        let first = unify_for_method(&heap, std::slice::from_ref(&graph), &[]).unwrap();
        let second = unify_for_method(&heap, std::slice::from_ref(&graph), &[]).unwrap();
        assert_eq!(first, second);
        let Value::Array(rc) = &graph else { panic!() };
        assert!(rc.borrow()[0].strict_eq(&Value::Creation(new)));
    }

    #[test]
    fn replay_unify_rejects_time_travel() {
        let mut heap = Heap::new();
        let (old, new) = versioned_pair(&mut heap);
        // The incoming set references the OLD version, but a reachable
        // prop points at the newer one.
        heap.get(old)
            .props
            .borrow_mut()
            .insert(PropKey::new("peer"), Value::Creation(new));
        let err = unify_for_replay(&heap, &[old]).unwrap_err();
        assert!(err.to_string().contains("Time travel"));
    }

    #[test]
    fn replay_unify_settles_indirect_refs_and_deunifies() {
        let mut heap = Heap::new();
        let (old, new) = versioned_pair(&mut heap);
        // A root of a different origin points at the old indirect ref.
        let root = heap.alloc(Creation::new(
            CreationKind::Jig {
                class: CreationId(0),
            },
            Rules::jig_instance(),
        ));
        heap.get(root)
            .props
            .borrow_mut()
            .insert(PropKey::new("peer"), Value::Creation(old));
        heap.get(root)
            .props
            .borrow_mut()
            .insert(PropKey::new("peer2"), Value::Creation(new));

        let worldview = unify_for_replay(&heap, &[root]).unwrap();
        {
            let props = heap.get(root).props.borrow();
            assert!(props[&PropKey::new("peer")].strict_eq(&Value::Creation(new)));
        }

        // Root produced no output: deunify restores the original slots.
        worldview.deunify(&mut heap, &HashSet::new());
        let props = heap.get(root).props.borrow();
        assert!(props[&PropKey::new("peer")].strict_eq(&Value::Creation(old)));
    }
}

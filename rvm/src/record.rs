// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The per-top-level-call staging area.
//!
//! Every touch of a creation during one top-level call lands here: the
//! ordered action log, the input/ref/create/delete sets, and the before
//! snapshots that make rollback possible. A record freezes into a commit
//! at the end of the call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use rvm_shared::{Result, RvmError};

use crate::heap::{CreationId, Heap, Snapshot};
use crate::value::Value;

static NEXT_RECORD: AtomicU64 = AtomicU64::new(1);

/// One entry in the action log, in call order.
#[derive(Debug)]
pub enum RecordedAction {
    Deploy {
        codes: Vec<CreationId>,
    },
    Upgrade {
        code: CreationId,
        src: String,
    },
    Call {
        target: CreationId,
        method: String,
        args: Vec<Value>,
    },
    New {
        class: CreationId,
        args: Vec<Value>,
        instance: CreationId,
    },
}

pub struct Record {
    /// Opaque process-unique id; also the record-location authority.
    pub id: String,
    /// Replay records skip method-time unification and never auto-publish.
    pub replay: bool,
    pub actions: Vec<RecordedAction>,
    /// Pre-existing creations this record spends, in first-touch order.
    pub inputs: Vec<CreationId>,
    /// Pre-existing creations read but not changed.
    pub refs: Vec<CreationId>,
    /// Creations born in this record, in creation order.
    pub creates: Vec<CreationId>,
    /// Creations destroyed in this record, in deletion order.
    pub deletes: Vec<CreationId>,
    /// Creations whose state changed (inputs and creates both qualify).
    pub updated: Vec<CreationId>,
    pub before: HashMap<CreationId, Snapshot>,
}

impl Record {
    pub fn new(replay: bool) -> Self {
        Record {
            id: format!("r{}", NEXT_RECORD.fetch_add(1, Ordering::Relaxed)),
            replay,
            actions: Vec::new(),
            inputs: Vec::new(),
            refs: Vec::new(),
            creates: Vec::new(),
            deletes: Vec::new(),
            updated: Vec::new(),
            before: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    fn known(&self, id: CreationId) -> bool {
        self.inputs.contains(&id) || self.creates.contains(&id) || self.refs.contains(&id)
    }

    /// A creation was read. Pre-existing creations become refs.
    pub fn read(&mut self, heap: &Heap, id: CreationId) {
        if self.known(id) || heap.get(id).is_native() {
            return;
        }
        self.refs.push(id);
    }

    /// A creation is being written. Pre-existing creations become inputs
    /// and get a before snapshot; created ones are already staged.
    pub fn update(&mut self, heap: &Heap, id: CreationId) -> Result<()> {
        if self.deletes.contains(&id) {
            return Err(RvmError::execution("cannot update a deleted creation"));
        }
        if !self.creates.contains(&id) && !self.inputs.contains(&id) {
            if let Some(pos) = self.refs.iter().position(|r| *r == id) {
                self.refs.remove(pos);
            }
            self.inputs.push(id);
        }
        self.before
            .entry(id)
            .or_insert_with(|| heap.snapshot(id));
        if !self.updated.contains(&id) {
            self.updated.push(id);
        }
        Ok(())
    }

    /// A creation was born in this record.
    pub fn create(&mut self, id: CreationId) {
        self.creates.push(id);
        if !self.updated.contains(&id) {
            self.updated.push(id);
        }
    }

    /// A creation was destroyed in this record.
    pub fn delete(&mut self, heap: &Heap, id: CreationId) -> Result<()> {
        self.update(heap, id)?;
        if !self.deletes.contains(&id) {
            self.deletes.push(id);
        }
        Ok(())
    }

    /// The ordered output list: spent inputs that survive, then new
    /// creations, deletions excluded. Output slots are 1-based.
    pub fn output_order(&self) -> Vec<CreationId> {
        let mut outputs = Vec::new();
        for id in &self.inputs {
            if !self.deletes.contains(id) && self.updated.contains(id) {
                outputs.push(*id);
            }
        }
        for id in &self.creates {
            if !self.deletes.contains(id) {
                outputs.push(*id);
            }
        }
        outputs
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creation::{Creation, CreationKind};
    use crate::membrane::Rules;

    fn heap_with(n: usize) -> (Heap, Vec<CreationId>) {
        let mut heap = Heap::new();
        let ids = (0..n)
            .map(|i| {
                heap.alloc(Creation::new(
                    CreationKind::Native {
                        ident: format!("N{i}"),
                    },
                    Rules::native_code(),
                ))
            })
            .collect();
        (heap, ids)
    }

    #[test]
    fn reads_become_refs_until_updated() {
        let (heap, ids) = heap_with(2);
        let mut record = Record::new(false);
        record.read(&heap, ids[0]);
        record.read(&heap, ids[0]);
        assert_eq!(record.refs, vec![ids[0]]);

        record.update(&heap, ids[0]).unwrap();
        assert!(record.refs.is_empty());
        assert_eq!(record.inputs, vec![ids[0]]);
        assert!(record.before.contains_key(&ids[0]));
    }

    #[test]
    fn output_order_is_inputs_then_creates() {
        let (heap, ids) = heap_with(3);
        let mut record = Record::new(false);
        record.create(ids[2]);
        record.update(&heap, ids[0]).unwrap();
        record.update(&heap, ids[1]).unwrap();
        record.delete(&heap, ids[1]).unwrap();
        assert_eq!(record.output_order(), vec![ids[0], ids[2]]);
        assert_eq!(record.deletes, vec![ids[1]]);
    }

    #[test]
    fn record_ids_are_unique() {
        assert_ne!(Record::new(false).id, Record::new(false).id);
    }
}

// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Replay: re-execution of a transaction's action list.
//!
//! Loads the transaction's inputs and refs at their previous locations,
//! unifies them into one worldview, executes the actions in a fresh
//! record, captures and hashes the results, and compares against the
//! metadata. Any divergence is a deterministic failure and bans the
//! location that asked for it.

use std::collections::{HashMap, HashSet};

use serde_json::Value as Json;

use rvm_shared::lock::Owner;
use rvm_shared::metadata::{Opcode, Payload};
use rvm_shared::transaction::Tx;
use rvm_shared::{ClassifyResult, Location, Result, RvmError, Slot, Txid};
use rvm_store::keys;

use crate::capture::{capture, state_hash, RefResolver};
use crate::codec;
use crate::creation::{Creation, CreationKind};
use crate::heap::{CreationId, Heap};
use crate::interp::Interp;
use crate::kernel::Kernel;
use crate::load::LoadSession;
use crate::membrane::Rules;
use crate::record::{Record, RecordedAction};
use crate::timeout::Timeout;
use crate::tx::outpoint_location;
use crate::value::Value;

pub struct ReplayOutcome {
    pub outputs: Vec<CreationId>,
    pub deletes: Vec<CreationId>,
}

/// Capture resolver for replay: everything outside the transaction was
/// loaded from chain and has a persistent location.
struct ChainResolver<'a> {
    heap: &'a Heap,
}

impl RefResolver for ChainResolver<'_> {
    fn resolve(&self, id: CreationId) -> Result<Location> {
        let location = self.heap.get(id).bindings.location.clone();
        if location.is_deployed() || matches!(location, Location::Native { .. }) {
            Ok(location)
        } else {
            Err(RvmError::execution(format!(
                "replay reference to unanchored creation at {}",
                location.compile()
            )))
        }
    }
}

impl Kernel {
    /// Replays one fetched transaction. The caller has already located
    /// the run payload; `vrun` is its output index.
    pub(crate) fn replay_tx(
        &self,
        heap: &mut Heap,
        txid: &str,
        tx: &Tx,
        vrun: u32,
        payload: &Payload,
        timeout: &Timeout,
    ) -> Result<ReplayOutcome> {
        if !self.replaying.borrow_mut().insert(txid.to_owned()) {
            return Err(RvmError::execution(format!(
                "circular replay of {txid}"
            )));
        }
        log::debug!("replaying {txid}");
        let result = self.replay_guarded(heap, txid, tx, vrun, payload, timeout);
        self.replaying.borrow_mut().remove(txid);
        result
    }

    fn replay_guarded(
        &self,
        heap: &mut Heap,
        txid: &str,
        tx: &Tx,
        vrun: u32,
        payload: &Payload,
        timeout: &Timeout,
    ) -> Result<ReplayOutcome> {
        let meta = &payload.metadata;

        // Code execution requires trusting the carrying transaction.
        let executes_code = meta
            .exec
            .iter()
            .any(|a| matches!(a.op, Opcode::Deploy | Opcode::Upgrade));
        if executes_code && !self.trusted(txid) {
            return Err(RvmError::Trust {
                txid: txid.to_owned(),
                message: "transaction deploys code and is not trusted".into(),
            });
        }

        // Load inputs and refs with a session of their own.
        let mut session = LoadSession::new();
        let mut inputs = Vec::new();
        for i in 0..meta.inputs {
            let txin = tx.inputs.get(i).ok_or_else(|| {
                RvmError::execution(format!(
                    "metadata claims {} inputs but the transaction has {}",
                    meta.inputs,
                    tx.inputs.len()
                ))
            })?;
            let prev_tx = self.fetch_tx(&txin.prev_txid, timeout)?;
            let location = outpoint_location(&prev_tx, &txin.prev_txid, txin.prev_vout)?;
            inputs.push(self.load_inner(heap, &mut session, &location, timeout)?);
        }
        let mut refs = Vec::new();
        for loc in &meta.refs {
            let location =
                Location::parse(loc).map_err(|e| RvmError::execution(e.to_string()))?;
            refs.push(self.load_inner(heap, &mut session, &location, timeout)?);
        }
        self.drain_completers(heap, &mut session, timeout)?;

        let mut base: Vec<CreationId> = inputs.clone();
        base.extend(refs.iter().copied());

        let worldview = crate::unify::unify_for_replay(heap, &base)?;

        let mut record = Record::new(true);
        for id in &inputs {
            record.inputs.push(*id);
            record.before.insert(*id, heap.snapshot(*id));
        }
        record.refs = refs.clone();

        let outcome = self.replay_actions(heap, &mut record, &base, meta, timeout);
        let outcome = match outcome {
            Ok(()) => self.replay_finalize(heap, &mut record, meta, txid),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(outcome) => {
                let mut keep: HashSet<CreationId> =
                    outcome.outputs.iter().copied().collect();
                keep.extend(outcome.deletes.iter().copied());
                worldview.deunify(heap, &keep);
                Ok(outcome)
            }
            Err(e) => {
                self.rollback_record(heap, &record, &e);
                worldview.deunify(heap, &HashSet::new());
                Err(e)
            }
        }
    }

    fn replay_actions(
        &self,
        heap: &mut Heap,
        record: &mut Record,
        base: &[CreationId],
        meta: &rvm_shared::metadata::Metadata,
        timeout: &Timeout,
    ) -> Result<()> {
        for action in &meta.exec {
            timeout.check("replay")?;
            match action.op {
                Opcode::Deploy => {
                    let data = action
                        .data
                        .as_array()
                        .filter(|a| !a.is_empty() && a.len() % 2 == 0)
                        .ok_or_else(|| {
                            RvmError::execution("DEPLOY data must be [src, props] pairs")
                        })?;
                    // Codes first, so pair props can reference each other.
                    let mut created = Vec::new();
                    for pair in data.chunks(2) {
                        let src = pair[0].as_str().ok_or_else(|| {
                            RvmError::execution("DEPLOY source must be a string")
                        })?;
                        let template = self.sandbox.borrow_mut().evaluate(src)?;
                        let id = heap.alloc(Creation::new(
                            CreationKind::Code {
                                src: src.to_owned(),
                                template,
                            },
                            Rules::jig_code(),
                        ));
                        record.create(id);
                        created.push(id);
                    }
                    for (pair, id) in data.chunks(2).zip(created.iter()) {
                        let props = self.decode_action_value(heap, record, base, &pair[1], timeout)?;
                        let Value::Object(props) = props else {
                            return Err(RvmError::execution(
                                "DEPLOY props must be an object",
                            ));
                        };
                        heap.get_mut(*id).props = props;
                        self.settle_code_rules(heap, record, *id)?;
                    }
                    record.actions.push(RecordedAction::Deploy { codes: created });
                }
                Opcode::Upgrade => {
                    let data = action
                        .data
                        .as_array()
                        .filter(|a| a.len() == 3)
                        .ok_or_else(|| {
                            RvmError::execution("UPGRADE data must be [code, src, props]")
                        })?;
                    let target = self.decode_action_value(heap, record, base, &data[0], timeout)?;
                    let Value::Creation(code) = target else {
                        return Err(RvmError::execution("UPGRADE target must be code"));
                    };
                    let src = data[1].as_str().ok_or_else(|| {
                        RvmError::execution("UPGRADE source must be a string")
                    })?;
                    let props = self.decode_action_value(heap, record, base, &data[2], timeout)?;
                    let Value::Object(props) = props else {
                        return Err(RvmError::execution("UPGRADE props must be an object"));
                    };
                    let template = self.sandbox.borrow_mut().evaluate(src)?;
                    record.update(heap, code)?;
                    let creation = heap.get_mut(code);
                    creation.kind = CreationKind::Code {
                        src: src.to_owned(),
                        template,
                    };
                    creation.props = props;
                    record
                        .actions
                        .push(RecordedAction::Upgrade {
                            code,
                            src: src.to_owned(),
                        });
                }
                Opcode::Call => {
                    let data = action
                        .data
                        .as_array()
                        .filter(|a| a.len() == 3)
                        .ok_or_else(|| {
                            RvmError::execution("CALL data must be [target, method, args]")
                        })?;
                    let target = self.decode_action_value(heap, record, base, &data[0], timeout)?;
                    let Value::Creation(target) = target else {
                        return Err(RvmError::execution("CALL target must be a creation"));
                    };
                    let method = data[1].as_str().ok_or_else(|| {
                        RvmError::execution("CALL method must be a string")
                    })?;
                    let args = self.decode_action_value(heap, record, base, &data[2], timeout)?;
                    let Value::Array(args) = args else {
                        return Err(RvmError::execution("CALL args must be an array"));
                    };
                    let args = args.borrow().clone();
                    record.update(heap, target)?;
                    let mut interp =
                        Interp::new(heap, record, &self.natives, self.config.backing_limit);
                    interp.call_creation_method(target, method, &args, None)?;
                    record.actions.push(RecordedAction::Call {
                        target,
                        method: method.to_owned(),
                        args,
                    });
                }
                Opcode::New => {
                    let data = action
                        .data
                        .as_array()
                        .filter(|a| a.len() == 2)
                        .ok_or_else(|| {
                            RvmError::execution("NEW data must be [class, args]")
                        })?;
                    let class = self.decode_action_value(heap, record, base, &data[0], timeout)?;
                    let Value::Creation(class) = class else {
                        return Err(RvmError::execution("NEW class must be a creation"));
                    };
                    let args = self.decode_action_value(heap, record, base, &data[1], timeout)?;
                    let Value::Array(args) = args else {
                        return Err(RvmError::execution("NEW args must be an array"));
                    };
                    let args = args.borrow().clone();
                    record.read(heap, class);
                    let mut interp =
                        Interp::new(heap, record, &self.natives, self.config.backing_limit);
                    let instance = interp.construct(class, &args, None)?;
                    let Value::Creation(instance) = instance else {
                        return Err(RvmError::execution("NEW must construct a jig"));
                    };
                    record.actions.push(RecordedAction::New {
                        class,
                        args,
                        instance,
                    });
                }
            }
        }
        if record.actions.is_empty() {
            return Err(RvmError::execution("transaction has no actions"));
        }
        Ok(())
    }

    /// Sidekick code is immutable; jig code is not. Decidable only after
    /// deps are installed.
    fn settle_code_rules(
        &self,
        heap: &mut Heap,
        record: &mut Record,
        id: CreationId,
    ) -> Result<()> {
        let is_function = heap
            .get(id)
            .template()
            .is_some_and(|t| t.is_function());
        let extends_jig = if is_function {
            false
        } else {
            let mut interp = Interp::new(heap, record, &self.natives, self.config.backing_limit);
            interp.extends_native(id, crate::sandbox::NATIVE_JIG)?
        };
        heap.get_mut(id).rules = if extends_jig {
            Rules::jig_code()
        } else {
            Rules::sidekick_code()
        };
        Ok(())
    }

    /// Decodes one action-data value against the master list: indices
    /// into [inputs, refs, new creations], strings as locations.
    fn decode_action_value(
        &self,
        heap: &mut Heap,
        record: &mut Record,
        base: &[CreationId],
        json: &Json,
        timeout: &Timeout,
    ) -> Result<Value> {
        // Loads triggered by location payloads share one throwaway
        // session; deep references must already be materialized.
        let mut session = LoadSession::new();
        let creates = record.creates.clone();
        let mut dec = |payload: &Json| -> Result<Value> {
            if let Some(idx) = payload.as_u64() {
                let idx = idx as usize;
                let id = base
                    .get(idx)
                    .or_else(|| creates.get(idx.wrapping_sub(base.len())))
                    .ok_or_else(|| {
                        RvmError::execution(format!("reference index {idx} out of range"))
                    })?;
                return Ok(Value::Creation(*id));
            }
            if let Some(loc) = payload.as_str() {
                let location = Location::parse(loc)
                    .map_err(|e| RvmError::execution(e.to_string()))?;
                let id = self.load_inner(heap, &mut session, &location, timeout)?;
                return Ok(Value::Creation(id));
            }
            Err(RvmError::execution(format!(
                "bad creation reference payload: {payload}"
            )))
        };
        let value = codec::decode(json, &mut dec)?;
        self.drain_completers(heap, &mut session, timeout)?;
        Ok(value)
    }

    fn replay_finalize(
        &self,
        heap: &mut Heap,
        record: &mut Record,
        meta: &rvm_shared::metadata::Metadata,
        txid: &str,
    ) -> Result<ReplayOutcome> {
        // Initial owners come from the metadata.
        if meta.cre.len() != record.creates.len() {
            return Err(RvmError::execution(format!(
                "cre lists {} owners for {} new creations",
                meta.cre.len(),
                record.creates.len()
            )));
        }
        for (id, owner) in record.creates.clone().into_iter().zip(&meta.cre) {
            if heap.get(id).bindings.owner.is_none() && !owner.is_null() {
                let owner = Owner::from_json(owner)
                    .map_err(|e| RvmError::execution(e.to_string()))?;
                heap.get_mut(id).bindings.owner = Some(owner);
            }
        }

        let outputs = record.output_order();
        let deletes = record.deletes.clone();
        if outputs.len() != meta.out.len() {
            return Err(RvmError::execution(format!(
                "transaction commits {} outputs but produced {}",
                meta.out.len(),
                outputs.len()
            )));
        }
        if deletes.len() != meta.del.len() {
            return Err(RvmError::execution(format!(
                "transaction commits {} deletes but produced {}",
                meta.del.len(),
                deletes.len()
            )));
        }

        let mut tx_locations = HashMap::new();
        for (i, id) in outputs.iter().enumerate() {
            let slot = Slot::Output(i as u32 + 1);
            heap.get_mut(*id)
                .bindings
                .bump(Location::Partial { slot });
            tx_locations.insert(*id, Location::Partial { slot });
        }
        for (i, id) in deletes.iter().enumerate() {
            let slot = Slot::Deleted(i as u32);
            heap.get_mut(*id)
                .bindings
                .bump(Location::Partial { slot });
            tx_locations.insert(*id, Location::Partial { slot });
        }

        // Capture, hash, compare, persist.
        let txid_parsed =
            Txid::parse(txid).map_err(|e| RvmError::execution(e.to_string()))?;
        let resolver = ChainResolver { heap };
        let mut blobs = Vec::new();
        for (i, id) in outputs.iter().enumerate() {
            let snapshot = heap.snapshot(*id);
            let blob = capture(heap, *id, &snapshot, &tx_locations, &resolver)?;
            let hash = state_hash(&blob)?;
            if hash != meta.out[i] {
                return Err(RvmError::execution(format!(
                    "state hash mismatch for output {}: computed {hash}, committed {}",
                    i + 1,
                    meta.out[i]
                )));
            }
            blobs.push(blob);
        }
        let mut del_blobs = Vec::new();
        for (i, id) in deletes.iter().enumerate() {
            let snapshot = heap.snapshot(*id);
            let blob = capture(heap, *id, &snapshot, &tx_locations, &resolver)?;
            let hash = state_hash(&blob)?;
            if hash != meta.del[i] {
                return Err(RvmError::execution(format!(
                    "state hash mismatch for delete {i}: computed {hash}, committed {}",
                    meta.del[i]
                )));
            }
            del_blobs.push(blob);
        }

        // Final cross-transaction bindings and persistence.
        for (i, (id, blob)) in outputs.iter().zip(&blobs).enumerate() {
            let location = Location::Jig {
                txid: txid_parsed,
                slot: Slot::Output(i as u32 + 1),
            };
            self.absolutize(heap, *id, location.clone());
            self.cache
                .set(&format!("{}{}", keys::JIG, location.compile()), blob.to_value())
                .or_internal()?;
        }
        for (i, (id, blob)) in deletes.iter().zip(&del_blobs).enumerate() {
            let location = Location::Jig {
                txid: txid_parsed,
                slot: Slot::Deleted(i as u32),
            };
            self.absolutize(heap, *id, location.clone());
            self.cache
                .set(&format!("{}{}", keys::JIG, location.compile()), blob.to_value())
                .or_internal()?;
        }
        for id in &record.inputs {
            if let Some(snapshot) = record.before.get(id) {
                let _ = self.cache.set(
                    &format!("{}{}", keys::SPEND, snapshot.bindings.location.compile()),
                    serde_json::json!(txid),
                );
            }
        }

        log::debug!(
            "replayed {txid}: {} outputs, {} deletes",
            outputs.len(),
            deletes.len()
        );
        Ok(ReplayOutcome { outputs, deletes })
    }

    fn absolutize(&self, heap: &mut Heap, id: CreationId, location: Location) {
        let creation = heap.get_mut(id);
        if matches!(creation.bindings.origin, Location::Partial { .. }) {
            creation.bindings.origin = location.clone();
        }
        creation.bindings.location = location;
    }
}


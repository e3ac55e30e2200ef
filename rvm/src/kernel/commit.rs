// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Commits and the publish pipeline.
//!
//! A record freezes into a commit with after-state snapshots and its
//! upstream dependency edges. Commits publish in dependency order: build
//! the transaction, collect owner signatures, let the purse fund it,
//! broadcast, persist captured states, then wake downstream commits. A
//! failure rolls the whole downstream chain back.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use serde_json::{json, Value as Json};

use rvm_shared::metadata::{Action, Metadata, Opcode, Payload};
use rvm_shared::transaction::{Tx, TxIn, TxOut, Utxo};
use rvm_shared::{ClassifyResult, Location, Lock, Result, RvmError, Slot};
use rvm_store::keys;

use crate::capture::{capture, state_hash, RefResolver};
use crate::codec;
use crate::heap::{CreationId, Heap, Snapshot};
use crate::kernel::{EventKind, Kernel};
use crate::record::{Record, RecordedAction};
use crate::timeout::Timeout;
use crate::tx::{calculate_dust, slot_vout};
use crate::value::Value;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CommitState {
    /// Finalized, all upstream published.
    Ready,
    /// Finalized, waiting on upstream.
    Queued,
    Publishing,
    Published,
    Failed,
}

pub struct Commit {
    pub id: String,
    pub record: Record,
    /// Ordered outputs (spent survivors then creations).
    pub outputs: Vec<CreationId>,
    /// After-state of every output and delete.
    pub after: HashMap<CreationId, Snapshot>,
    /// Locations of referenced creations as of finalize; record-relative
    /// entries resolve through the publish log at publish time.
    pub ref_locations: HashMap<CreationId, Location>,
    pub upstream: HashSet<String>,
    pub downstream: Vec<String>,
    pub state: CommitState,
    /// origin → (location, nonce) worldview, filled at publish.
    pub refmap: BTreeMap<String, (String, u64)>,
}

impl Commit {
    pub fn deletes(&self) -> &[CreationId] {
        &self.record.deletes
    }
}

use crate::kernel::now_ms;

/// Location resolver used while capturing one commit's states.
struct PublishResolver<'a> {
    heap: &'a Heap,
    ref_locations: &'a HashMap<CreationId, Location>,
    latest_published: &'a HashMap<String, (Location, u64)>,
}

impl PublishResolver<'_> {
    fn lookup(&self, id: CreationId, location: &Location) -> Result<Location> {
        if location.is_deployed() || matches!(location, Location::Native { .. }) {
            return Ok(location.clone());
        }
        let key = self.heap.origin_key(id);
        self.latest_published
            .get(&key)
            .map(|(loc, _)| loc.clone())
            .ok_or_else(|| {
                RvmError::internal(format!(
                    "reference to unpublished creation {key} during publish"
                ))
            })
    }
}

impl RefResolver for PublishResolver<'_> {
    fn resolve(&self, id: CreationId) -> Result<Location> {
        let location = self
            .ref_locations
            .get(&id)
            .cloned()
            .unwrap_or_else(|| self.heap.get(id).bindings.location.clone());
        self.lookup(id, &location)
    }

    fn resolve_origin(&self, id: CreationId) -> Result<Location> {
        let origin = self.heap.get(id).bindings.origin.clone();
        self.lookup(id, &origin)
    }
}

impl Kernel {
    /// Freezes a record into a commit: owners assigned, bindings bumped
    /// into record-relative locations, after snapshots taken, upstream
    /// edges wired. Returns the commit id.
    pub(crate) fn commit_record(&self, heap: &mut Heap, mut record: Record) -> Result<String> {
        if record.is_empty() {
            return Err(RvmError::internal("commit requires at least one action"));
        }
        if record.updated.is_empty() && record.deletes.is_empty() {
            return Err(RvmError::internal(
                "commit requires at least one touched creation",
            ));
        }

        // New creations get their initial owner from the wallet; replay
        // assigns owners from metadata before finalizing.
        if !record.replay {
            for id in record.creates.clone() {
                if heap.get(id).bindings.owner.is_none() {
                    let owner = self.owner.next_owner().or_internal()?;
                    heap.get_mut(id).bindings.owner = Some(owner);
                }
            }
        }

        // Upstream edges, detected before locations are rewritten.
        let mut upstream = HashSet::new();
        for id in &record.inputs {
            let location = record
                .before
                .get(id)
                .map(|s| s.bindings.location.clone())
                .unwrap_or_else(|| heap.get(*id).bindings.location.clone());
            self.note_upstream(*id, &location, &mut upstream)?;
        }
        for id in &record.refs {
            let location = heap.get(*id).bindings.location.clone();
            self.note_upstream(*id, &location, &mut upstream)?;
        }

        let outputs = record.output_order();
        let deletes = record.deletes.clone();

        // Reference locations as of finalize, before any bumping.
        let mut ref_locations = HashMap::new();
        let mut reachable_roots: Vec<Value> = Vec::new();
        for id in outputs.iter().chain(deletes.iter()) {
            reachable_roots.push(Value::Creation(*id));
        }
        for id in heap.reachable_creations(&reachable_roots) {
            ref_locations.insert(id, heap.get(id).bindings.location.clone());
        }
        for id in &record.inputs {
            if let Some(snapshot) = record.before.get(id) {
                ref_locations.insert(*id, snapshot.bindings.location.clone());
            }
        }

        // Bump every output and delete into this record.
        for (i, id) in outputs.iter().enumerate() {
            heap.get_mut(*id).bindings.bump(Location::Record {
                record: record.id.clone(),
                slot: Slot::Output(i as u32 + 1),
            });
        }
        for (i, id) in deletes.iter().enumerate() {
            heap.get_mut(*id).bindings.bump(Location::Record {
                record: record.id.clone(),
                slot: Slot::Deleted(i as u32),
            });
        }

        let mut after = HashMap::new();
        for id in outputs.iter().chain(deletes.iter()) {
            after.insert(*id, heap.snapshot(*id));
            self.emit(EventKind::Update, heap.get(*id).bindings.location.compile());
        }

        let commit_id = record.id.clone();
        let state = if upstream.is_empty() {
            CommitState::Ready
        } else {
            CommitState::Queued
        };
        for up in &upstream {
            if let Some(up_commit) = self.commits.borrow().get(up) {
                up_commit.borrow_mut().downstream.push(commit_id.clone());
            }
        }
        for id in &outputs {
            self.pending_outputs
                .borrow_mut()
                .insert(*id, commit_id.clone());
        }

        let commit = Commit {
            id: commit_id.clone(),
            record,
            outputs,
            after,
            ref_locations,
            upstream,
            downstream: Vec::new(),
            state,
            refmap: BTreeMap::new(),
        };
        self.commits
            .borrow_mut()
            .insert(commit_id.clone(), Rc::new(RefCell::new(commit)));
        Ok(commit_id)
    }

    fn note_upstream(
        &self,
        id: CreationId,
        location: &Location,
        upstream: &mut HashSet<String>,
    ) -> Result<()> {
        if location.is_deployed()
            || matches!(location, Location::Native { .. })
            || location.is_undeployed()
        {
            return Ok(());
        }
        match self.pending_outputs.borrow().get(&id) {
            Some(commit_id) => {
                upstream.insert(commit_id.clone());
                Ok(())
            }
            None => Err(RvmError::internal(format!(
                "creation at {} has no pending commit",
                location.compile()
            ))),
        }
    }

    /// Publishes a commit if its upstream has drained, then wakes its
    /// downstream. Queued commits wait for their upstream's publish.
    pub(crate) fn try_publish(
        &self,
        heap: &mut Heap,
        commit_id: &str,
        timeout: &Timeout,
    ) -> Result<()> {
        let Some(commit) = self.commits.borrow().get(commit_id).cloned() else {
            return Ok(());
        };
        {
            let mut c = commit.borrow_mut();
            match c.state {
                CommitState::Ready | CommitState::Queued => {}
                _ => return Ok(()),
            }
            let blocked = c
                .upstream
                .iter()
                .any(|up| self.commits.borrow().contains_key(up));
            if blocked {
                c.state = CommitState::Queued;
                return Ok(());
            }
            c.state = CommitState::Publishing;
        }

        match self.publish_commit(heap, &commit, timeout) {
            Ok(()) => {
                let downstream = {
                    let mut c = commit.borrow_mut();
                    c.state = CommitState::Published;
                    c.downstream.clone()
                };
                self.commits.borrow_mut().remove(commit_id);
                for id in commit.borrow().outputs.iter().chain(commit.borrow().deletes().iter()) {
                    self.pending_outputs.borrow_mut().remove(id);
                }
                for down in downstream {
                    self.try_publish(heap, &down, timeout)?;
                }
                Ok(())
            }
            Err(e) => {
                self.fail_commit(heap, commit_id, &e);
                Err(e)
            }
        }
    }

    /// Rolls a failed commit back and poisons its downstream chain.
    pub(crate) fn fail_commit(&self, heap: &mut Heap, commit_id: &str, error: &RvmError) {
        let Some(commit) = self.commits.borrow_mut().remove(commit_id) else {
            return;
        };
        let mut c = commit.borrow_mut();
        c.state = CommitState::Failed;
        self.rollback_record(heap, &c.record, error);
        // Inputs rolled back to their snapshots; outputs born here are
        // poisoned by rollback_record. Spent survivors that pre-existed
        // keep their restored bindings.
        for id in c.outputs.clone() {
            self.pending_outputs.borrow_mut().remove(&id);
        }
        let downstream = c.downstream.clone();
        drop(c);
        for down in downstream {
            self.fail_commit(heap, &down, error);
        }
    }

    /// Publishes every queued commit in dependency order.
    pub fn sync_all(&self) -> Result<()> {
        let timeout = Timeout::new(self.config.timeout);
        let mut heap = self.heap.borrow_mut();
        loop {
            let next = {
                let commits = self.commits.borrow();
                commits
                    .iter()
                    .filter(|(_, c)| {
                        matches!(
                            c.borrow().state,
                            CommitState::Ready | CommitState::Queued
                        )
                    })
                    .find(|(_, c)| {
                        c.borrow()
                            .upstream
                            .iter()
                            .all(|up| !commits.contains_key(up))
                    })
                    .map(|(id, _)| id.clone())
            };
            match next {
                Some(id) => self.try_publish(&mut heap, &id, &timeout)?,
                None => break,
            }
        }
        if self.commits.borrow().is_empty() {
            Ok(())
        } else {
            Err(RvmError::internal("publish chain is stuck"))
        }
    }

    // ---- the publish pipeline ------------------------------------------

    fn publish_commit(
        &self,
        heap: &mut Heap,
        commit: &Rc<RefCell<Commit>>,
        timeout: &Timeout,
    ) -> Result<()> {
        let mut c_guard = commit.borrow_mut();
        let c = &mut *c_guard;
        let record_id = c.record.id.clone();
        log::debug!("publishing commit {record_id}");

        let latest_published = self.latest_published.borrow().clone();
        let resolver = PublishResolver {
            heap,
            ref_locations: &c.ref_locations,
            latest_published: &latest_published,
        };

        // Previous outpoints and parent UTXOs for every spent input.
        let mut prev_locations = Vec::new();
        for id in &c.record.inputs {
            let location = c
                .ref_locations
                .get(id)
                .cloned()
                .ok_or_else(|| RvmError::internal("input without a finalize location"))?;
            prev_locations.push(resolver.lookup(*id, &location)?);
        }

        let mut tx = Tx::new();
        let mut parents: Vec<Utxo> = Vec::new();
        let mut locks = Vec::new();
        for (id, location) in c.record.inputs.iter().zip(&prev_locations) {
            timeout.check("publish")?;
            let Location::Jig { txid, slot } = location else {
                return Err(RvmError::internal(format!(
                    "input location {} is not spendable",
                    location.compile()
                )));
            };
            let prev_txid = txid.to_string();
            let prev_tx = self.fetch_tx(&prev_txid, timeout)?;
            let (vrun, _) = crate::tx::find_run_payload(&prev_tx).ok_or_else(|| {
                RvmError::execution(format!("{prev_txid} is not a run transaction"))
            })?;
            let vout = slot_vout(vrun, *slot)
                .ok_or_else(|| RvmError::internal("cannot spend a deletion slot"))?;
            let prev_out = prev_tx.outputs.get(vout as usize).ok_or_else(|| {
                RvmError::execution(format!("{prev_txid} has no output {vout}"))
            })?;

            let owner = c
                .record
                .before
                .get(id)
                .and_then(|s| s.bindings.owner.clone());
            let domain = owner.as_ref().map(|o| o.lock().domain()).unwrap_or(0);
            tx.inputs.push(TxIn {
                prev_txid: prev_txid.clone(),
                prev_vout: vout,
                // Padded so fee estimation sees the final size.
                script_sig: vec![0; domain],
                sequence: 0xffff_ffff,
            });
            parents.push(Utxo {
                txid: prev_txid,
                vout,
                script: hex::encode(&prev_out.script),
                satoshis: prev_out.satoshis,
            });
            locks.push(owner);
        }

        // In-transaction locations for capture.
        let mut tx_locations = HashMap::new();
        for (i, id) in c.outputs.iter().enumerate() {
            tx_locations.insert(
                *id,
                Location::Partial {
                    slot: Slot::Output(i as u32 + 1),
                },
            );
        }
        for (i, id) in c.record.deletes.iter().enumerate() {
            tx_locations.insert(
                *id,
                Location::Partial {
                    slot: Slot::Deleted(i as u32),
                },
            );
        }

        // Capture and hash every output and delete.
        let mut out_hashes = Vec::new();
        let mut blobs = Vec::new();
        for id in &c.outputs {
            let snapshot = &c.after[id];
            let blob = capture(heap, *id, snapshot, &tx_locations, &resolver)?;
            out_hashes.push(state_hash(&blob)?);
            blobs.push(blob);
        }
        let mut del_hashes = Vec::new();
        let mut del_blobs = Vec::new();
        for id in &c.record.deletes {
            let snapshot = &c.after[id];
            let blob = capture(heap, *id, snapshot, &tx_locations, &resolver)?;
            del_hashes.push(state_hash(&blob)?);
            del_blobs.push(blob);
        }

        // Worldview for the metadata.
        for (id, location) in c.record.inputs.iter().zip(&prev_locations) {
            let nonce = c
                .record
                .before
                .get(id)
                .map(|s| s.bindings.nonce)
                .unwrap_or(0);
            c.refmap.insert(
                heap.origin_key(*id),
                (location.compile(), nonce),
            );
        }

        // Metadata.
        let master = self.master_list(&c.record);
        let refs = {
            let mut refs = Vec::new();
            for id in &c.record.refs {
                refs.push(resolver.resolve(*id)?.compile());
            }
            refs
        };
        let cre: Vec<Json> = c
            .record
            .creates
            .iter()
            .map(|id| {
                let owner = c
                    .after
                    .get(id)
                    .map(|s| s.bindings.owner.clone())
                    .unwrap_or_else(|| heap.get(*id).bindings.owner.clone());
                owner.map(|o| o.to_json()).unwrap_or(Json::Null)
            })
            .collect();
        let exec = self.encode_actions(heap, &c.record, &c.after, &master, &resolver)?;
        let metadata = Metadata {
            inputs: c.record.inputs.len(),
            refs,
            out: out_hashes,
            del: del_hashes,
            cre,
            exec,
        };

        tx.outputs.push(TxOut {
            satoshis: 0,
            script: Payload::new(self.config.app.clone(), metadata).to_script(),
        });
        for id in &c.outputs {
            let snapshot = &c.after[id];
            let owner = snapshot.bindings.owner.as_ref().ok_or_else(|| {
                RvmError::internal("output creation without an owner")
            })?;
            let script = owner.lock().script();
            let dust = calculate_dust(script.len());
            tx.outputs.push(TxOut {
                satoshis: snapshot.bindings.satoshis.max(dust),
                script,
            });
        }
        drop(resolver);

        // sign → pay → broadcast.
        timeout.check("owner sign")?;
        let signed = self
            .owner
            .sign(&tx.to_hex(), &parents, &locks)
            .or_internal()?;
        timeout.check("purse pay")?;
        let paid = self.purse.pay(&signed, &parents).or_internal()?;
        let final_tx = Tx::from_hex(&paid)
            .map_err(|e| RvmError::internal(format!("purse returned a bad tx: {e}")))?;
        let txid = final_tx.txid();

        timeout.check("broadcast")?;
        if let Err(e) = self.blockchain.broadcast(&paid) {
            let _ = self.purse.cancel(&paid);
            return Err(RvmError::Internal(format!("broadcast failed: {e:#}")));
        }
        if let Some(state) = &self.state {
            if let Err(e) = state.broadcast(&paid) {
                log::warn!("state broadcast hook failed: {e:#}");
            }
        }
        if let Err(e) = self.purse.broadcast(&paid) {
            log::warn!("purse broadcast hook failed: {e:#}");
        }

        let now = now_ms();
        {
            let mut ring = self.broadcasts.borrow_mut();
            ring.record(&final_tx, now);
            ring.expire(now);
            let _ = self
                .cache
                .set(keys::CONFIG_RECENT_BROADCASTS, ring.to_json());
        }

        // Persist captured states, the transaction, and spend pointers.
        let txid_parsed = rvm_shared::Txid::parse(&txid)
            .map_err(|e| RvmError::internal(e.to_string()))?;
        self.cache
            .set(&format!("{}{txid}", keys::TX), json!(paid))
            .or_internal()?;
        let _ = self
            .cache
            .set(&format!("{}{txid}", keys::TIME), json!(now));
        for location in &prev_locations {
            self.cache
                .set(
                    &format!("{}{}", keys::SPEND, location.compile()),
                    json!(txid),
                )
                .or_internal()?;
        }
        for (i, (id, blob)) in c.outputs.iter().zip(&blobs).enumerate() {
            let location = Location::Jig {
                txid: txid_parsed,
                slot: Slot::Output(i as u32 + 1),
            };
            self.cache
                .set(&format!("{}{}", keys::JIG, location.compile()), blob.to_value())
                .or_internal()?;
            self.finalize_bindings(heap, *id, &record_id, location);
        }
        for (i, (id, blob)) in c.record.deletes.iter().zip(&del_blobs).enumerate() {
            let location = Location::Jig {
                txid: txid_parsed,
                slot: Slot::Deleted(i as u32),
            };
            self.cache
                .set(&format!("{}{}", keys::JIG, location.compile()), blob.to_value())
                .or_internal()?;
            self.finalize_bindings(heap, *id, &record_id, location);
        }

        // Own transactions are trusted.
        self.trust_quietly(&txid);

        for id in c.outputs.iter().chain(c.record.deletes.iter()) {
            let nonce = c.after[id].bindings.nonce;
            let key = heap.origin_key(*id);
            let location = heap.get(*id).bindings.location.clone();
            let location = match &location {
                Location::Record { .. } | Location::Partial { .. } => {
                    // Advanced by a later commit; publish log still needs
                    // this commit's absolute location.
                    tx_locations
                        .get(id)
                        .and_then(|partial| partial.slot())
                        .map(|slot| Location::Jig {
                            txid: txid_parsed,
                            slot,
                        })
                        .unwrap_or(location)
                }
                other => other.clone(),
            };
            self.latest_published
                .borrow_mut()
                .insert(key, (location.clone(), nonce));
            self.emit(EventKind::Publish, location.compile());
        }

        log::debug!("published commit {record_id} as {txid}");
        Ok(())
    }

    /// Sets a creation's bindings to their final on-chain form, unless a
    /// later commit has advanced it further.
    fn finalize_bindings(
        &self,
        heap: &mut Heap,
        id: CreationId,
        record_id: &str,
        location: Location,
    ) {
        let creation = heap.get_mut(id);
        if matches!(&creation.bindings.origin, Location::Record { record, .. } if record == record_id)
        {
            creation.bindings.origin = location.clone();
        }
        if matches!(&creation.bindings.location, Location::Record { record, .. } if record == record_id)
        {
            creation.bindings.location = location;
        }
    }

    /// The master reference list: inputs, refs, then new creations.
    pub(crate) fn master_list(&self, record: &Record) -> Vec<CreationId> {
        record
            .inputs
            .iter()
            .chain(record.refs.iter())
            .chain(record.creates.iter())
            .copied()
            .collect()
    }

    pub(crate) fn encode_actions(
        &self,
        heap: &Heap,
        record: &Record,
        after: &HashMap<CreationId, Snapshot>,
        master: &[CreationId],
        resolver: &dyn RefResolver,
    ) -> Result<Vec<Action>> {
        let index_of = |id: CreationId| master.iter().position(|m| *m == id);
        let mut enc = |id: CreationId| -> Result<Json> {
            match index_of(id) {
                Some(idx) => Ok(json!(idx)),
                None => Ok(json!(resolver.resolve(id)?.compile())),
            }
        };
        // Code props travel as committed, not as the heap looks now.
        let props_of = |id: CreationId| -> Value {
            match after.get(&id) {
                Some(snapshot) => Value::new_object(snapshot.props.clone()),
                None => Value::Object(heap.get(id).props.clone()),
            }
        };

        let mut actions = Vec::new();
        for action in &record.actions {
            let (op, data) = match action {
                RecordedAction::Deploy { codes } => {
                    let mut data = Vec::new();
                    for code in codes {
                        let src = heap
                            .get(*code)
                            .src()
                            .ok_or_else(|| RvmError::internal("deploy of non-code"))?
                            .to_owned();
                        data.push(json!(src));
                        data.push(codec::encode(&props_of(*code), &mut enc)?);
                    }
                    (Opcode::Deploy, Json::Array(data))
                }
                RecordedAction::Upgrade { code, src } => (
                    Opcode::Upgrade,
                    json!([
                        codec::encode(&Value::Creation(*code), &mut enc)?,
                        src,
                        codec::encode(&props_of(*code), &mut enc)?,
                    ]),
                ),
                RecordedAction::Call {
                    target,
                    method,
                    args,
                } => {
                    let args = Value::new_array(args.clone());
                    (
                        Opcode::Call,
                        json!([
                            codec::encode(&Value::Creation(*target), &mut enc)?,
                            method,
                            codec::encode(&args, &mut enc)?,
                        ]),
                    )
                }
                RecordedAction::New { class, args, .. } => {
                    let args = Value::new_array(args.clone());
                    (
                        Opcode::New,
                        json!([
                            codec::encode(&Value::Creation(*class), &mut enc)?,
                            codec::encode(&args, &mut enc)?,
                        ]),
                    )
                }
            };
            actions.push(Action { op, data });
        }
        Ok(actions)
    }
}

// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Load: the entry point that turns a location into a live creation.
//!
//! Cache-first with replay fallback, dedup of parallel loads within a
//! session, ban bookkeeping with trust-based auto-clear, and berry
//! plucking. A top-level load drains all pending completers before it
//! returns, so callers only ever see fully materialized creations.

use std::collections::HashMap;

use serde_json::{json, Value as Json};

use rvm_encoding::StateBlob;
use rvm_shared::transaction::Tx;
use rvm_shared::{Location, Result, RvmError, Slot};
use rvm_store::keys;

use crate::capture::{capture, state_hash, RefResolver};
use crate::creation::{Creation, CreationKind};
use crate::heap::{CreationId, Heap};
use crate::interp::{Interp, PluckCtx};
use crate::kernel::{now_ms, EventKind, Kernel};
use crate::membrane::Rules;
use crate::record::Record;
use crate::recreate::Completer;
use crate::timeout::Timeout;
use crate::tx::find_run_payload;
use crate::value::Value;
use rvm_shared::ClassifyResult;

/// Work discovered during a load, drained before the load returns.
pub(crate) enum Task {
    /// Phase 2 of a recreated shell.
    Complete(Completer),
    /// A pending stub that still needs its content resolved.
    Materialize(String),
}

/// Per-top-level-load state: the dedup map and the deferred work queue.
pub struct LoadSession {
    pub loaded: HashMap<String, CreationId>,
    pub(crate) tasks: Vec<Task>,
    pub(crate) settle: Vec<CreationId>,
}

impl LoadSession {
    pub fn new() -> Self {
        LoadSession {
            loaded: HashMap::new(),
            tasks: Vec::new(),
            settle: Vec::new(),
        }
    }
}

impl Default for LoadSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Loads a creation by location string.
    pub fn load(&self, location: &str) -> Result<CreationId> {
        let timeout = Timeout::new(self.config.timeout);
        let location =
            Location::parse(location).map_err(|e| RvmError::argument(e.to_string()))?;
        let mut heap = self.heap.borrow_mut();
        let mut session = LoadSession::new();
        let id = self.load_inner(&mut heap, &mut session, &location, &timeout)?;
        self.drain_completers(&mut heap, &mut session, &timeout)?;
        drop(heap);
        self.emit(EventKind::Load, location.compile());
        Ok(id)
    }

    /// Loads a berry through a caller-supplied class instead of the
    /// class anchored in a location.
    pub fn load_berry_with_class(&self, class: CreationId, path: &str) -> Result<CreationId> {
        let timeout = Timeout::new(self.config.timeout);
        let mut heap = self.heap.borrow_mut();
        let mut session = LoadSession::new();
        let id = self.pluck(&mut heap, &mut session, class, path, None, &timeout)?;
        self.drain_completers(&mut heap, &mut session, &timeout)?;
        let location = heap.get(id).bindings.location.compile();
        drop(heap);
        self.emit(EventKind::Load, location);
        Ok(id)
    }

    pub(crate) fn load_inner(
        &self,
        heap: &mut Heap,
        session: &mut LoadSession,
        location: &Location,
        timeout: &Timeout,
    ) -> Result<CreationId> {
        let key = location.compile();
        if let Some(id) = session.loaded.get(&key) {
            return Ok(*id);
        }

        match location {
            Location::Native { ident } => {
                let id = self
                    .natives
                    .get(ident)
                    .copied()
                    .ok_or_else(|| RvmError::argument(format!("unknown native {ident}")))?;
                session.loaded.insert(key, id);
                Ok(id)
            }
            Location::Error { .. } | Location::Record { .. } | Location::Partial { .. } => {
                Err(RvmError::argument(format!("cannot load {key}")))
            }
            Location::Jig { .. } | Location::Berry { .. } => {
                // A creation already materialized at this location is
                // identity-shared across loads.
                if let Some(id) = heap.find_by_location(location) {
                    if heap.get(id).initialized {
                        session.loaded.insert(key, id);
                        return Ok(id);
                    }
                }
                let had_ban = self.check_ban(&key)?;
                let result = self.load_resolve(heap, session, location, None, timeout);
                match result {
                    Ok(id) => {
                        session.loaded.insert(key.clone(), id);
                        if had_ban {
                            let _ = self.cache.set(
                                &format!("{}{key}", keys::BAN),
                                Json::Bool(false),
                            );
                        }
                        Ok(id)
                    }
                    Err(e) => {
                        if e.is_bannable() {
                            self.write_ban(&key, &e);
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    /// Resolves the content of a location: cache first, replay fallback.
    /// `fill` redirects the result into a pending stub.
    fn load_resolve(
        &self,
        heap: &mut Heap,
        session: &mut LoadSession,
        location: &Location,
        fill: Option<CreationId>,
        timeout: &Timeout,
    ) -> Result<CreationId> {
        if let Location::Berry {
            txid,
            slot,
            path,
            hash,
            ..
        } = location
        {
            // Berries: cache, else pluck through the anchored class.
            let key = location.compile();
            timeout.check("cache read")?;
            if let Some(blob) = self.cached_blob(&format!("{}{key}", keys::BERRY))? {
                // A berry location carries its own state hash.
                if state_hash(&blob)? != hex::encode(hash) {
                    return Err(RvmError::execution(format!(
                        "cached berry state for {key} fails verification"
                    )));
                }
                let id = self.recreate_shell(heap, location, &blob, fill)?;
                session.tasks.push(Task::Complete(Completer {
                    id,
                    location: location.clone(),
                    blob,
                }));
                return Ok(id);
            }
            let class_loc = Location::Jig {
                txid: *txid,
                slot: *slot,
            };
            let class = self.load_inner(heap, session, &class_loc, timeout)?;
            self.drain_completers(heap, session, timeout)?;
            return self.pluck(heap, session, class, path, Some((location, fill)), timeout);
        }

        let Location::Jig { txid, slot } = location else {
            return Err(RvmError::internal("load_resolve requires an anchored location"));
        };
        let txid_str = txid.to_string();
        let key = location.compile();

        // Cache-first.
        timeout.check("cache read")?;
        if let Some(blob) = self.cached_blob(&format!("{}{key}", keys::JIG))? {
            if !self.cache_trusted() {
                // Verify the blob against the hash the transaction
                // committed to.
                let tx = self.fetch_tx(&txid_str, timeout)?;
                let (_, payload) = find_run_payload(&tx).ok_or_else(|| {
                    RvmError::execution(format!("{txid_str} is not a run transaction"))
                })?;
                let expected = match slot {
                    Slot::Output(n) => (*n as usize)
                        .checked_sub(1)
                        .and_then(|i| payload.metadata.out.get(i)),
                    Slot::Deleted(n) => payload.metadata.del.get(*n as usize),
                };
                let hash = state_hash(&blob)?;
                if expected != Some(&hash) {
                    log::warn!("cached state for {key} fails verification; replaying");
                    return self.load_via_replay(heap, session, location, fill, timeout);
                }
            }
            if blob.kind == rvm_encoding::BlobKind::Code
                && !self.cache_trusted()
                && !self.trusted(&txid_str)
            {
                return Err(RvmError::Trust {
                    txid: txid_str,
                    message: format!("code at {key} is not trusted"),
                });
            }
            let id = self.recreate_shell(heap, location, &blob, fill)?;
            session.tasks.push(Task::Complete(Completer {
                id,
                location: location.clone(),
                blob,
            }));
            return Ok(id);
        }

        self.load_via_replay(heap, session, location, fill, timeout)
    }

    fn load_via_replay(
        &self,
        heap: &mut Heap,
        session: &mut LoadSession,
        location: &Location,
        fill: Option<CreationId>,
        timeout: &Timeout,
    ) -> Result<CreationId> {
        let key = location.compile();
        if self.config.client {
            return Err(RvmError::ClientMode(format!("{key} is not in the cache")));
        }
        let Location::Jig { txid, slot } = location else {
            return Err(RvmError::internal("replay requires an anchored location"));
        };
        let txid_str = txid.to_string();
        let tx = self.fetch_tx(&txid_str, timeout)?;
        let (vrun, payload) = find_run_payload(&tx).ok_or_else(|| {
            RvmError::execution(format!("{txid_str} is not a run transaction"))
        })?;

        let outcome = self.replay_tx(heap, &txid_str, &tx, vrun, &payload, timeout)?;
        for (i, id) in outcome.outputs.iter().enumerate() {
            let loc = Location::Jig {
                txid: *txid,
                slot: Slot::Output(i as u32 + 1),
            };
            session.loaded.entry(loc.compile()).or_insert(*id);
        }
        for (i, id) in outcome.deletes.iter().enumerate() {
            let loc = Location::Jig {
                txid: *txid,
                slot: Slot::Deleted(i as u32),
            };
            session.loaded.entry(loc.compile()).or_insert(*id);
        }

        let found = match slot {
            Slot::Output(n) => (*n as usize)
                .checked_sub(1)
                .and_then(|i| outcome.outputs.get(i))
                .copied(),
            Slot::Deleted(n) => outcome.deletes.get(*n as usize).copied(),
        };
        let found = found.ok_or_else(|| {
            RvmError::execution(format!("{txid_str} has no creation at slot {slot}"))
        })?;

        match fill {
            Some(stub) => {
                self.fill_stub(heap, stub, found);
                Ok(stub)
            }
            None => Ok(found),
        }
    }

    /// Copies a materialized creation into a pending stub so every
    /// session reference to the stub sees the real state.
    fn fill_stub(&self, heap: &mut Heap, stub: CreationId, real: CreationId) {
        let (kind, props, bindings, rules) = {
            let creation = heap.get(real);
            (
                creation.kind.clone(),
                creation.props.clone(),
                creation.bindings.clone(),
                creation.rules.clone(),
            )
        };
        let target = heap.get_mut(stub);
        target.kind = kind;
        target.props = props;
        target.bindings = bindings;
        target.rules = rules;
        target.initialized = true;
    }

    /// Registers a referenced location, allocating a pending stub when it
    /// is not yet known to this session.
    pub(crate) fn ensure_ref(
        &self,
        heap: &mut Heap,
        session: &mut LoadSession,
        location: &Location,
    ) -> Result<CreationId> {
        if let Location::Native { ident } = location {
            return self
                .natives
                .get(ident)
                .copied()
                .ok_or_else(|| RvmError::execution(format!("unknown native {ident}")));
        }
        let key = location.compile();
        if let Some(id) = session.loaded.get(&key) {
            return Ok(*id);
        }
        if let Some(id) = heap.find_by_location(location) {
            if heap.get(id).initialized {
                session.loaded.insert(key, id);
                return Ok(id);
            }
        }
        let mut shell = Creation::shell(CreationKind::Pending, Rules::jig_code());
        shell.bindings.location = location.clone();
        let id = heap.alloc(shell);
        session.loaded.insert(key.clone(), id);
        session.tasks.push(Task::Materialize(key));
        Ok(id)
    }

    /// Runs deferred work until none remains, then settles shells.
    pub(crate) fn drain_completers(
        &self,
        heap: &mut Heap,
        session: &mut LoadSession,
        timeout: &Timeout,
    ) -> Result<()> {
        while let Some(task) = session.tasks.pop() {
            timeout.check("load")?;
            match task {
                Task::Complete(completer) => {
                    self.complete_shell(heap, session, completer)?;
                }
                Task::Materialize(key) => {
                    let id = session.loaded.get(&key).copied().ok_or_else(|| {
                        RvmError::internal(format!("pending stub for {key} vanished"))
                    })?;
                    if !matches!(heap.get(id).kind, CreationKind::Pending) {
                        continue;
                    }
                    let location = Location::parse(&key)
                        .map_err(|e| RvmError::internal(e.to_string()))?;
                    let had_ban = self.check_ban(&key)?;
                    match self.load_resolve(heap, session, &location, Some(id), timeout) {
                        Ok(_) => {
                            if had_ban {
                                let _ = self.cache.set(
                                    &format!("{}{key}", keys::BAN),
                                    Json::Bool(false),
                                );
                            }
                        }
                        Err(e) => {
                            if e.is_bannable() {
                                self.write_ban(&key, &e);
                            }
                            return Err(e);
                        }
                    }
                }
            }
        }
        self.settle_shells(heap, session)
    }

    // ---- berries --------------------------------------------------------

    /// Runs a class's static pluck; `anchor` carries the expected berry
    /// location from a located load, absent for class-supplied plucks.
    fn pluck(
        &self,
        heap: &mut Heap,
        session: &mut LoadSession,
        class: CreationId,
        path: &str,
        anchor: Option<(&Location, Option<CreationId>)>,
        timeout: &Timeout,
    ) -> Result<CreationId> {
        let chain = self.blockchain.clone();
        let pluck_timeout = *timeout;
        let fetch = move |txid: &str| -> Result<Value> {
            pluck_timeout.check("pluck fetch")?;
            chain.fetch(txid).map(Value::Str).or_execution()
        };

        let mut record = Record::new(true);
        let plucked = {
            let mut interp =
                Interp::new(heap, &mut record, &self.natives, self.config.backing_limit);
            interp.pluck = Some(PluckCtx {
                path: path.to_owned(),
                fetch: &fetch,
                created: None,
            });
            let ret = interp.call_creation_method(
                class,
                "pluck",
                &[Value::Str(path.to_owned())],
                None,
            )?;
            match ret {
                Value::Creation(id) => Some(id),
                _ => interp.pluck.as_ref().and_then(|p| p.created),
            }
        };
        let id = plucked.ok_or_else(|| {
            RvmError::execution(format!("pluck of {path:?} produced no berry"))
        })?;

        // Anchor the berry: nonce 1, location carrying its state hash.
        let class_location = heap.get(class).bindings.location.clone();
        let Location::Jig { txid, slot } = class_location else {
            return Err(RvmError::execution(
                "berries require a deployed class",
            ));
        };
        heap.get_mut(id).bindings.bump(Location::Partial {
            slot: Slot::Output(0),
        });

        let (location, blob) = {
            let probe = Location::Berry {
                txid,
                slot,
                path: path.to_owned(),
                hash: [0; 32],
                version: rvm_shared::version::PROTOCOL_VERSION as u32,
            };
            let mut tx_locations = HashMap::new();
            tx_locations.insert(id, probe.clone());
            let snapshot = heap.snapshot(id);
            let resolver = BerryResolver { heap };
            // The location embeds the hash of a state whose location
            // field is the hash-free probe form.
            let blob = capture(heap, id, &snapshot, &tx_locations, &resolver)?;
            let hash_hex = state_hash(&blob)?;
            let mut hash = [0u8; 32];
            hex::decode_to_slice(&hash_hex, &mut hash)
                .map_err(|e| RvmError::internal(e.to_string()))?;
            (
                Location::Berry {
                    txid,
                    slot,
                    path: path.to_owned(),
                    hash,
                    version: rvm_shared::version::PROTOCOL_VERSION as u32,
                },
                blob,
            )
        };

        if let Some((expected, _)) = anchor {
            if let Location::Berry { hash, .. } = expected {
                if let Location::Berry { hash: computed, .. } = &location {
                    if hash != computed {
                        return Err(RvmError::execution(format!(
                            "berry state hash mismatch for {}",
                            expected.compile()
                        )));
                    }
                }
            }
        }

        heap.get_mut(id).bindings.location = location.clone();
        heap.get_mut(id).bindings.origin = location.clone();
        let _ = self.cache.set(
            &format!("{}{}", keys::BERRY, location.compile()),
            blob.to_value(),
        );

        if let Some((expected, fill)) = anchor {
            session.loaded.insert(expected.compile(), id);
            if let Some(stub) = fill {
                self.fill_stub(heap, stub, id);
                return Ok(stub);
            }
        }
        Ok(id)
    }

    /// Reads a state blob from the cache, falling back to the state
    /// oracle when one is configured.
    fn cached_blob(&self, key: &str) -> Result<Option<StateBlob>> {
        let value = self
            .cache
            .get(key)
            .map_err(|e| RvmError::Internal(format!("{e:#}")))?;
        let value = match value {
            Some(value) => Some(value),
            None => match &self.state {
                Some(state) => {
                    let pulled = state
                        .pull(key)
                        .map_err(|e| RvmError::Internal(format!("{e:#}")))?;
                    if let Some(pulled) = &pulled {
                        let _ = self.cache.set(key, pulled.clone());
                    }
                    pulled
                }
                None => None,
            },
        };
        match value {
            None => Ok(None),
            Some(value) => StateBlob::from_value(&value).map(Some).map_err(|e| {
                RvmError::execution(format!("corrupt cached state at {key}: {e}"))
            }),
        }
    }

    // ---- bans -----------------------------------------------------------

    /// Checks for a ban. Returns whether a (cleared or absent) ban entry
    /// existed; raises when the ban still stands.
    fn check_ban(&self, key: &str) -> Result<bool> {
        let ban_key = format!("{}{key}", keys::BAN);
        let Some(value) = self
            .cache
            .get(&ban_key)
            .map_err(|e| RvmError::Internal(format!("{e:#}")))?
        else {
            return Ok(false);
        };
        if value == Json::Bool(false) {
            return Ok(false);
        }
        if let Some(untrusted) = value.get("untrusted").and_then(Json::as_str) {
            if self.trusted(untrusted) {
                // The offending txid has been trusted since; clear.
                let _ = self.cache.set(&ban_key, Json::Bool(false));
                return Ok(true);
            }
            return Err(RvmError::Trust {
                txid: untrusted.to_owned(),
                message: format!("{key} is banned"),
            });
        }
        let reason = value
            .get("reason")
            .and_then(Json::as_str)
            .unwrap_or("deterministic failure");
        Err(RvmError::execution(format!("{key} is banned: {reason}")))
    }

    fn write_ban(&self, key: &str, error: &RvmError) {
        let mut ban = serde_json::Map::new();
        ban.insert("reason".into(), json!(error.to_string()));
        if let Some(txid) = error.untrusted_txid() {
            ban.insert("untrusted".into(), json!(txid));
        }
        let _ = self
            .cache
            .set(&format!("{}{key}", keys::BAN), Json::Object(ban));
    }

    // ---- transactions ---------------------------------------------------

    /// Fetches a raw transaction: cache, recent broadcasts, then the
    /// blockchain oracle. Persists fetched bodies under `tx://`.
    pub(crate) fn fetch_tx(&self, txid: &str, timeout: &Timeout) -> Result<Tx> {
        timeout.check("fetch")?;
        let key = format!("{}{txid}", keys::TX);
        if let Some(Json::String(hex)) = self
            .cache
            .get(&key)
            .map_err(|e| RvmError::Internal(format!("{e:#}")))?
        {
            return Tx::from_hex(&hex)
                .map_err(|e| RvmError::Internal(format!("cached tx is corrupt: {e}")));
        }
        let now = now_ms();
        if let Some(hex) = self.broadcasts.borrow().rawtx(txid, now) {
            return Tx::from_hex(&hex)
                .map_err(|e| RvmError::Internal(format!("recent tx is corrupt: {e}")));
        }
        if self.config.client {
            return Err(RvmError::ClientMode(format!(
                "transaction {txid} is not in the cache"
            )));
        }
        let hex = self
            .blockchain
            .fetch(txid)
            .map_err(|e| RvmError::Argument(format!("cannot fetch {txid}: {e:#}")))?;
        let tx = Tx::from_hex(&hex)
            .map_err(|e| RvmError::execution(format!("{txid} is not a transaction: {e}")))?;
        let _ = self.cache.set(&key, json!(hex));
        Ok(tx)
    }

    // ---- forward sync ---------------------------------------------------

    /// Follows spend pointers to the creation's latest version. Returns
    /// the creation at the newest location (a fresh handle when the
    /// creation advanced).
    pub fn sync(&self, target: CreationId) -> Result<CreationId> {
        let timeout = Timeout::new(self.config.timeout);
        let mut heap = self.heap.borrow_mut();
        let mut session = LoadSession::new();
        let mut current = target;

        loop {
            timeout.check("sync")?;
            let location = heap.get(current).bindings.location.clone();
            let Location::Jig { txid, slot } = &location else {
                break;
            };
            if slot.is_deleted() {
                break;
            }
            let txid_str = txid.to_string();
            let tx = self.fetch_tx(&txid_str, &timeout)?;
            let (vrun, _) = find_run_payload(&tx).ok_or_else(|| {
                RvmError::execution(format!("{txid_str} is not a run transaction"))
            })?;
            let Some(vout) = crate::tx::slot_vout(vrun, *slot) else {
                break;
            };

            // The cache's spend pointer wins; otherwise ask the oracle.
            let spend_key = format!("{}{}", keys::SPEND, location.compile());
            let next = match self
                .cache
                .get(&spend_key)
                .ok()
                .flatten()
                .and_then(|v| v.as_str().map(str::to_owned))
            {
                Some(next) => Some(next),
                None => self
                    .blockchain
                    .spends(&txid_str, vout)
                    .map_err(|e| RvmError::Internal(format!("{e:#}")))?,
            };
            let Some(next_txid) = next else {
                break;
            };

            let origin = heap.origin_key(current);
            let next_tx = self.fetch_tx(&next_txid, &timeout)?;
            let (_, next_payload) = find_run_payload(&next_tx).ok_or_else(|| {
                RvmError::execution(format!("{next_txid} spends a jig without a payload"))
            })?;

            // Materialize the successor and find our origin among its
            // outputs and deletes.
            let mut advanced = None;
            let out_count = next_payload.metadata.out.len();
            let del_count = next_payload.metadata.del.len();
            let next_txid_parsed = rvm_shared::Txid::parse(&next_txid)
                .map_err(|e| RvmError::execution(e.to_string()))?;
            for i in 0..out_count + del_count {
                let slot = if i < out_count {
                    Slot::Output(i as u32 + 1)
                } else {
                    Slot::Deleted((i - out_count) as u32)
                };
                let loc = Location::Jig {
                    txid: next_txid_parsed,
                    slot,
                };
                let id = self.load_inner(&mut heap, &mut session, &loc, &timeout)?;
                self.drain_completers(&mut heap, &mut session, &timeout)?;
                if heap.origin_key(id) == origin {
                    advanced = Some(id);
                    break;
                }
            }
            let Some(advanced) = advanced else {
                return Err(RvmError::execution(format!(
                    "{next_txid} spends {} without continuing it",
                    location.compile()
                )));
            };
            current = advanced;
        }

        let location = heap.get(current).bindings.location.compile();
        drop(heap);
        self.emit(EventKind::Load, location);
        Ok(current)
    }
}

/// Berry captures may reference other creations; they must already be
/// anchored.
struct BerryResolver<'a> {
    heap: &'a Heap,
}

impl RefResolver for BerryResolver<'_> {
    fn resolve(&self, id: CreationId) -> Result<Location> {
        let location = self.heap.get(id).bindings.location.clone();
        if location.is_deployed() || matches!(location, Location::Native { .. }) {
            Ok(location)
        } else {
            Err(RvmError::execution(
                "berries may only reference deployed creations",
            ))
        }
    }
}

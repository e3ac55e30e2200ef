// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The kernel: the process-wide active instance.
//!
//! Aggregates the oracles, the trust list, client/timeout configuration,
//! the creation heap, and the bookkeeping the engine shares across
//! operations (replay dedup, publishing registry, recent broadcasts).
//! Components never reach for globals; they take what they need from
//! here. At most one kernel is active per thread, and only explicitly.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

use rvm_shared::{Location, Result, RvmError};
use rvm_store::{Cache, RecentBroadcasts};

use crate::creation::{Creation, CreationKind};
use crate::externs::{Blockchain, OwnerWallet, Purse, StateSource};
use crate::heap::{CreationId, Heap};
use crate::interp::Interp;
use crate::membrane::{self, Rules};
use crate::record::{Record, RecordedAction};
use crate::sandbox::{Sandbox, NATIVE_BERRY, NATIVE_JIG};
use crate::timeout::Timeout;
use crate::value::{PropKey, Props, Value};

mod commit;
mod events;

pub use commit::{Commit, CommitState};
pub use events::{Event, EventKind};

/// Default per-operation deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builder-style configuration, applied once at kernel construction.
#[derive(Clone, Debug)]
pub struct KernelConfig {
    /// The app string written into every payload.
    pub app: String,
    /// Per-operation deadline.
    pub timeout: Duration,
    /// Refuse network fetches; resolve everything from the cache.
    pub client: bool,
    /// Initial trust list: txids plus the `"*"` and `"state"` sentinels.
    pub trust: Vec<String>,
    /// Upper bound on satoshis backing one creation.
    pub backing_limit: u64,
    /// Publish commits as soon as their upstream drains. When off,
    /// commits queue until `sync_all`.
    pub auto_publish: bool,
}

impl KernelConfig {
    pub fn new() -> Self {
        KernelConfig {
            app: String::new(),
            timeout: DEFAULT_TIMEOUT,
            client: false,
            trust: Vec::new(),
            backing_limit: rvm_shared::bindings::MAX_BACKING_SATOSHIS,
            auto_publish: true,
        }
    }

    pub fn app(mut self, app: impl Into<String>) -> Self {
        self.app = app.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn client(mut self, client: bool) -> Self {
        self.client = client;
        self
    }

    pub fn trust(mut self, item: impl Into<String>) -> Self {
        self.trust.push(item.into());
        self
    }

    pub fn auto_publish(mut self, auto_publish: bool) -> Self {
        self.auto_publish = auto_publish;
        self
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Kernel {
    pub blockchain: Rc<dyn Blockchain>,
    pub cache: Rc<dyn Cache>,
    pub state: Option<Rc<dyn StateSource>>,
    pub owner: Rc<dyn OwnerWallet>,
    pub purse: Rc<dyn Purse>,
    pub config: KernelConfig,

    pub(crate) heap: RefCell<Heap>,
    pub(crate) sandbox: RefCell<Sandbox>,
    pub(crate) natives: HashMap<String, CreationId>,
    pub(crate) trust_list: RefCell<HashSet<String>>,
    /// txids currently replaying; at most one replay per transaction.
    pub(crate) replaying: RefCell<HashSet<String>>,
    /// Publishing registry: commit id → commit.
    pub(crate) commits: RefCell<HashMap<String, Rc<RefCell<Commit>>>>,
    /// Unpublished outputs: creation → owning commit id.
    pub(crate) pending_outputs: RefCell<HashMap<CreationId, String>>,
    /// origin key → latest published (location, nonce).
    pub(crate) latest_published: RefCell<HashMap<String, (Location, u64)>>,
    pub(crate) broadcasts: RefCell<RecentBroadcasts>,
    pub(crate) listeners: RefCell<Vec<(EventKind, Box<dyn Fn(&Event)>)>>,
}

thread_local! {
    static ACTIVE: RefCell<Option<Rc<Kernel>>> = const { RefCell::new(None) };
}

/// Host wall-clock, milliseconds. Never visible to user code.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Kernel {
    pub fn new(
        config: KernelConfig,
        blockchain: Rc<dyn Blockchain>,
        cache: Rc<dyn Cache>,
        state: Option<Rc<dyn StateSource>>,
        owner: Rc<dyn OwnerWallet>,
        purse: Rc<dyn Purse>,
    ) -> Rc<Kernel> {
        let mut heap = Heap::new();
        let mut natives = HashMap::new();
        for ident in [NATIVE_JIG, NATIVE_BERRY] {
            let mut creation =
                Creation::new(CreationKind::Native { ident: ident.into() }, Rules::native_code());
            creation.bindings.location = Location::Native {
                ident: ident.into(),
            };
            creation.bindings.origin = creation.bindings.location.clone();
            natives.insert(ident.to_owned(), heap.alloc(creation));
        }
        let trust_list = config.trust.iter().cloned().collect();
        Rc::new(Kernel {
            blockchain,
            cache,
            state,
            owner,
            purse,
            config,
            heap: RefCell::new(heap),
            sandbox: RefCell::new(Sandbox::new()),
            natives,
            trust_list: RefCell::new(trust_list),
            replaying: RefCell::new(HashSet::new()),
            commits: RefCell::new(HashMap::new()),
            pending_outputs: RefCell::new(HashMap::new()),
            latest_published: RefCell::new(HashMap::new()),
            broadcasts: RefCell::new(RecentBroadcasts::new()),
            listeners: RefCell::new(Vec::new()),
        })
    }

    // ---- activation -----------------------------------------------------

    /// Makes this kernel the thread's active instance. At most one.
    pub fn activate(self: &Rc<Self>) {
        ACTIVE.with(|slot| *slot.borrow_mut() = Some(self.clone()));
    }

    pub fn deactivate(self: &Rc<Self>) {
        ACTIVE.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.as_ref().is_some_and(|k| Rc::ptr_eq(k, self)) {
                *slot = None;
            }
        });
    }

    pub fn active() -> Option<Rc<Kernel>> {
        ACTIVE.with(|slot| slot.borrow().clone())
    }

    // ---- trust ----------------------------------------------------------

    /// Adds a txid (or the `"*"` / `"state"` sentinels) to the trust
    /// list. Matching bans clear lazily on the next load.
    pub fn trust(&self, item: &str) -> Result<()> {
        let valid = item == "*"
            || item == "state"
            || (item.len() == 64
                && item.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')));
        if !valid {
            return Err(RvmError::argument(format!("not trustable: {item:?}")));
        }
        self.trust_list.borrow_mut().insert(item.to_owned());
        self.cache
            .set(
                &format!("{}{item}", rvm_store::keys::TRUST),
                serde_json::Value::Bool(true),
            )
            .map_err(|e| RvmError::Internal(format!("{e:#}")))?;
        Ok(())
    }

    pub fn trusted(&self, txid: &str) -> bool {
        let list = self.trust_list.borrow();
        list.contains("*") || list.contains(txid)
    }

    /// Whether cached state blobs are accepted without re-verification.
    pub fn cache_trusted(&self) -> bool {
        let list = self.trust_list.borrow();
        list.contains("*") || list.contains("state")
    }

    pub(crate) fn trust_quietly(&self, txid: &str) {
        self.trust_list.borrow_mut().insert(txid.to_owned());
    }

    // ---- events ---------------------------------------------------------

    pub fn on(&self, kind: EventKind, listener: impl Fn(&Event) + 'static) {
        self.listeners
            .borrow_mut()
            .push((kind, Box::new(listener)));
    }

    pub(crate) fn emit(&self, kind: EventKind, location: impl Into<String>) {
        let event = Event {
            kind,
            location: location.into(),
        };
        for (wanted, listener) in self.listeners.borrow().iter() {
            if *wanted == kind {
                listener(&event);
            }
        }
    }

    // ---- read surface ---------------------------------------------------

    /// Mediated property read from outside any method.
    pub fn read_prop(&self, id: CreationId, key: &str) -> Result<Value> {
        let heap = self.heap.borrow();
        membrane::get_prop(&heap, None, None, id, key)
    }

    pub fn location_of(&self, id: CreationId) -> String {
        self.heap.borrow().get(id).bindings.location.compile()
    }

    pub fn origin_of(&self, id: CreationId) -> String {
        self.heap.borrow().get(id).bindings.origin.compile()
    }

    pub fn nonce_of(&self, id: CreationId) -> u64 {
        self.heap.borrow().get(id).bindings.nonce
    }

    pub fn src_of(&self, id: CreationId) -> Option<String> {
        self.heap.borrow().get(id).src().map(str::to_owned)
    }

    pub(crate) fn native(&self, ident: &str) -> CreationId {
        self.natives[ident]
    }

    // ---- top-level actions ----------------------------------------------

    /// Stages one action in a fresh record, finalizes it into a commit
    /// and starts the publish chain.
    fn transact<T>(
        &self,
        f: impl FnOnce(&mut Interp<'_>) -> Result<(RecordedAction, T)>,
    ) -> Result<T> {
        let timeout = Timeout::new(self.config.timeout);
        let mut heap = self.heap.borrow_mut();
        let mut record = Record::new(false);

        let result = {
            let mut interp = Interp::new(
                &mut heap,
                &mut record,
                &self.natives,
                self.config.backing_limit,
            );
            f(&mut interp)
        };
        let (action, ret) = match result {
            Ok(ok) => ok,
            Err(e) => {
                self.rollback_record(&mut heap, &record, &e);
                return Err(e);
            }
        };
        record.actions.push(action);

        let commit_id = match self.commit_record(&mut heap, record) {
            Ok(id) => id,
            Err(e) => return Err(e),
        };
        if self.config.auto_publish {
            self.try_publish(&mut heap, &commit_id, &timeout)?;
        }
        Ok(ret)
    }

    /// Restores every touched creation to its before snapshot and
    /// poisons creations born in the failed record.
    pub(crate) fn rollback_record(&self, heap: &mut Heap, record: &Record, error: &RvmError) {
        for (id, snapshot) in &record.before {
            heap.restore(*id, snapshot);
            self.emit(EventKind::Update, heap.get(*id).bindings.location.compile());
        }
        for id in &record.creates {
            let poisoned = Location::Error {
                message: format!("Unhandled {error}"),
            };
            let creation = heap.get_mut(*id);
            creation.bindings.location = poisoned.clone();
            creation.bindings.origin = poisoned;
        }
    }

    /// Deploys a class or function with no dependencies.
    pub fn deploy(&self, src: &str) -> Result<CreationId> {
        self.deploy_with_deps(src, &[])
    }

    /// Deploys a class or function; `deps` resolves the free names of the
    /// source (including its parent class).
    pub fn deploy_with_deps(&self, src: &str, deps: &[(&str, CreationId)]) -> Result<CreationId> {
        let template = self.sandbox.borrow_mut().evaluate(src)?;
        self.transact(|interp| {
            let mut deps_props = Props::new();
            for (name, id) in deps {
                deps_props.insert(PropKey::new(*name), Value::Creation(*id));
            }
            let rules = Rules::jig_code();
            let mut creation = Creation::new(
                CreationKind::Code {
                    src: src.to_owned(),
                    template: template.clone(),
                },
                rules,
            );
            creation
                .props
                .borrow_mut()
                .insert(PropKey::new("deps"), Value::new_object(deps_props));
            let id = interp.heap.alloc(creation);
            interp.record.create(id);

            // Sidekick code is immutable from birth.
            if !template.is_function() && !interp.extends_native(id, NATIVE_JIG)? {
                interp.heap.get_mut(id).rules = Rules::sidekick_code();
            } else if template.is_function() {
                interp.heap.get_mut(id).rules = Rules::sidekick_code();
            }

            Ok((RecordedAction::Deploy { codes: vec![id] }, id))
        })
    }

    /// Replaces a code creation's source, keeping its origin.
    pub fn upgrade(&self, code: CreationId, src: &str) -> Result<()> {
        let template = self.sandbox.borrow_mut().evaluate(src)?;
        self.transact(|interp| {
            if !interp.heap.get(code).is_code() {
                return Err(RvmError::argument("only code can be upgraded"));
            }
            interp.record.update(interp.heap, code)?;
            interp.heap.get_mut(code).kind = CreationKind::Code {
                src: src.to_owned(),
                template: template.clone(),
            };
            Ok((
                RecordedAction::Upgrade {
                    code,
                    src: src.to_owned(),
                },
                (),
            ))
        })
    }

    /// Top-level method call.
    pub fn call(&self, target: CreationId, method: &str, args: Vec<Value>) -> Result<Value> {
        // Unrecorded calls (berries, sidekick code) evaluate without a
        // transaction; the membrane still applies.
        let recorded = {
            let heap = self.heap.borrow();
            let rules = &heap.get(target).rules;
            rules.record_calls && !rules.unrecorded_methods.iter().any(|m| m == method)
        };
        if !recorded {
            let mut heap = self.heap.borrow_mut();
            let mut record = Record::new(true);
            let mut interp = Interp::new(
                &mut heap,
                &mut record,
                &self.natives,
                self.config.backing_limit,
            );
            return interp.call_creation_method(target, method, &args, None);
        }

        self.transact(|interp| {
            let mut roots = vec![Value::Creation(target)];
            roots.extend(args.iter().cloned());
            let chosen = crate::unify::unify_for_method(interp.heap, &roots, &[])?;
            let target = chosen
                .get(&interp.heap.origin_key(target))
                .copied()
                .unwrap_or(target);
            // A recorded call is a spend: replay will re-execute it
            // against this creation as an input.
            interp.record.update(interp.heap, target)?;
            // The action log keeps the pre-call argument state; the
            // method is free to mutate the live containers.
            let mut memo = std::collections::HashMap::new();
            let recorded_args: Vec<Value> =
                args.iter().map(|a| a.deep_copy(&mut memo)).collect();
            let ret = interp.call_creation_method(target, method, &args, None)?;
            Ok((
                RecordedAction::Call {
                    target,
                    method: method.to_owned(),
                    args: recorded_args,
                },
                ret,
            ))
        })
    }

    /// Top-level `new Class(args)`.
    pub fn instantiate(&self, class: CreationId, args: Vec<Value>) -> Result<CreationId> {
        self.transact(|interp| {
            let mut roots = vec![Value::Creation(class)];
            roots.extend(args.iter().cloned());
            crate::unify::unify_for_method(interp.heap, &roots, &[])?;
            interp.record.read(interp.heap, class);
            let mut memo = std::collections::HashMap::new();
            let recorded_args: Vec<Value> =
                args.iter().map(|a| a.deep_copy(&mut memo)).collect();
            let value = interp.construct(class, &args, None)?;
            let Value::Creation(instance) = value else {
                return Err(RvmError::argument(
                    "only jig classes can be instantiated at the top level",
                ));
            };
            Ok((
                RecordedAction::New {
                    class,
                    args: recorded_args,
                    instance,
                },
                instance,
            ))
        })
    }

    /// UTXO listing corrected against recent broadcasts, so freshly
    /// created outputs appear and freshly spent ones disappear before
    /// the indexer catches up.
    pub fn utxos(&self, script_hex: &str) -> Result<Vec<rvm_shared::Utxo>> {
        let listed = self
            .blockchain
            .utxos(script_hex)
            .map_err(|e| RvmError::Internal(format!("{e:#}")))?;
        let now = now_ms();
        let mut ring = self.broadcasts.borrow_mut();
        ring.expire(now);
        Ok(ring.correct_utxos(script_hex, listed, now))
    }

    /// Destroys a creation: spends it to a deletion slot.
    pub fn destroy(&self, target: CreationId) -> Result<()> {
        self.call(target, "destroy", Vec::new()).map(|_| ())
    }

    /// Forces a spend without changing state.
    pub fn auth(&self, target: CreationId) -> Result<()> {
        self.call(target, "auth", Vec::new()).map(|_| ())
    }
}

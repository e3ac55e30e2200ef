// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Recreate: rebuilding a live creation from a cached state blob.
//!
//! Phase 1 makes a shell: source evaluated for code, bindings installed,
//! every referenced location resolved to a (possibly pending) creation.
//! Phase 2 — the completer, run by the load's drain loop — materializes
//! the references, settles rules, and flips the shell live. Until then
//! the membrane rejects all access.

use serde_json::Value as Json;

use rvm_encoding::{BlobKind, StateBlob};
use rvm_shared::lock::Owner;
use rvm_shared::{Location, Result, RvmError, Txid};

use crate::codec;
use crate::creation::{Creation, CreationKind};
use crate::heap::{CreationId, Heap};
use crate::kernel::Kernel;
use crate::load::LoadSession;
use crate::membrane::Rules;
use crate::value::{PropKey, Value};

/// A deferred phase 2.
pub struct Completer {
    pub id: CreationId,
    pub location: Location,
    pub blob: StateBlob,
}

impl Kernel {
    /// Phase 1. `fill` reuses a pending stub instead of allocating.
    pub(crate) fn recreate_shell(
        &self,
        heap: &mut Heap,
        location: &Location,
        blob: &StateBlob,
        fill: Option<CreationId>,
    ) -> Result<CreationId> {
        let kind = match blob.kind {
            BlobKind::Code => {
                let src = blob
                    .src
                    .as_deref()
                    .ok_or_else(|| RvmError::execution("code blob without src"))?;
                CreationKind::Code {
                    src: src.to_owned(),
                    template: self.sandbox.borrow_mut().evaluate(src)?,
                }
            }
            // The class reference resolves in phase 2.
            BlobKind::Jig | BlobKind::Berry => CreationKind::Pending,
        };

        let id = match fill {
            Some(id) => {
                heap.get_mut(id).kind = kind;
                id
            }
            None => heap.alloc(Creation::shell(kind, Rules::jig_code())),
        };
        heap.get_mut(id).initialized = false;
        heap.get_mut(id).bindings.location = location.clone();
        Ok(id)
    }

    /// Phase 2: decode props with real references, install bindings, set
    /// the class, and queue the shell for settlement.
    pub(crate) fn complete_shell(
        &self,
        heap: &mut Heap,
        session: &mut LoadSession,
        completer: Completer,
    ) -> Result<()> {
        let Completer { id, location, blob } = completer;
        let txid = location.txid().ok_or_else(|| {
            RvmError::internal("recreated creation without an anchored location")
        })?;

        let mut dec = |payload: &Json| -> Result<Value> {
            let loc = payload.as_str().ok_or_else(|| {
                RvmError::execution(format!("bad reference in cached state: {payload}"))
            })?;
            let loc = parse_state_location(loc, txid)?;
            let ref_id = self.ensure_ref(heap, session, &loc)?;
            Ok(Value::Creation(ref_id))
        };
        let props = codec::decode(&blob.props, &mut dec)?;
        let Value::Object(props) = props else {
            return Err(RvmError::execution("cached props must be an object"));
        };

        // Split bindings out of the decoded props.
        {
            let mut props = props.borrow_mut();
            let origin = match props.remove(&PropKey::new("origin")) {
                Some(Value::Str(s)) => parse_state_location(&s, txid)?,
                _ => return Err(RvmError::execution("cached state without origin")),
            };
            let nonce = match props.remove(&PropKey::new("nonce")) {
                Some(Value::Int(n)) if n >= 1 => n as u64,
                _ => return Err(RvmError::execution("cached state without nonce")),
            };
            let owner = match props.remove(&PropKey::new("owner")) {
                None | Some(Value::Null) => None,
                Some(value) => Some(state_owner(&value)?),
            };
            let satoshis = match props.remove(&PropKey::new("satoshis")) {
                Some(Value::Int(n)) if n >= 0 => n as u64,
                _ => 0,
            };
            props.remove(&PropKey::new("location"));

            let creation = heap.get_mut(id);
            creation.bindings.location = location.clone();
            creation.bindings.origin = origin;
            creation.bindings.nonce = nonce;
            creation.bindings.owner = owner;
            creation.bindings.satoshis = satoshis;
        }

        match blob.kind {
            BlobKind::Code => {
                heap.get(id).props.borrow_mut().clone_from(&props.borrow());
            }
            BlobKind::Jig | BlobKind::Berry => {
                let class = self.class_from_blob(heap, session, &blob, txid)?;
                heap.get_mut(id).props = props;
                heap.get_mut(id).kind = match blob.kind {
                    BlobKind::Jig => CreationKind::Jig { class },
                    _ => CreationKind::Berry {
                        class,
                        path: berry_path(&location),
                    },
                };
                heap.get_mut(id).rules = match blob.kind {
                    BlobKind::Jig => Rules::jig_instance(),
                    _ => Rules::berry(),
                };
            }
        }

        session.settle.push(id);
        Ok(())
    }

    fn class_from_blob(
        &self,
        heap: &mut Heap,
        session: &mut LoadSession,
        blob: &StateBlob,
        txid: Txid,
    ) -> Result<CreationId> {
        let cls = blob
            .cls
            .as_ref()
            .and_then(|c| c.get("$jig"))
            .and_then(Json::as_str)
            .ok_or_else(|| RvmError::execution("cached state without a class"))?;
        let loc = parse_state_location(cls, txid)?;
        self.ensure_ref(heap, session, &loc)
    }

    /// Settlement: after every referenced creation materialized, pick the
    /// final rules for code and flip shells live.
    pub(crate) fn settle_shells(&self, heap: &mut Heap, session: &mut LoadSession) -> Result<()> {
        // Code first so instance classes are settled before instances.
        session
            .settle
            .sort_by_key(|id| !heap.get(*id).is_code() as u8);
        for id in std::mem::take(&mut session.settle) {
            if heap.get(id).is_code() {
                let sidekick = heap
                    .get(id)
                    .template()
                    .is_some_and(|t| t.is_function())
                    || !self.code_extends(heap, id, crate::sandbox::NATIVE_JIG)?;
                heap.get_mut(id).rules = if sidekick {
                    Rules::sidekick_code()
                } else {
                    Rules::jig_code()
                };
            }
            heap.get_mut(id).initialized = true;
        }
        Ok(())
    }

    /// Parent walk over settled templates; usable before shells flip
    /// live, unlike the interpreter's variant.
    fn code_extends(&self, heap: &Heap, class: CreationId, ident: &str) -> Result<bool> {
        let native = self.native(ident);
        let mut current = class;
        for _ in 0..64 {
            if current == native {
                return Ok(true);
            }
            let creation = heap.get(current);
            let Some(template) = creation.template() else {
                return Ok(false);
            };
            let Some(parent_name) = template.parent() else {
                return Ok(false);
            };
            let parent = {
                let props = creation.props.borrow();
                match props.get(&PropKey::new("deps")) {
                    Some(Value::Object(deps)) => {
                        match deps.borrow().get(&PropKey::new(parent_name)) {
                            Some(Value::Creation(id)) => Some(*id),
                            _ => None,
                        }
                    }
                    _ => None,
                }
            };
            current = match parent {
                Some(id) => id,
                None if parent_name == crate::sandbox::NATIVE_JIG
                    || parent_name == crate::sandbox::NATIVE_BERRY =>
                {
                    self.native(parent_name)
                }
                None => {
                    return Err(RvmError::execution(format!(
                        "parent {parent_name} is not in deps"
                    )))
                }
            };
        }
        Err(RvmError::execution("class hierarchy too deep"))
    }
}

/// Locations inside blobs are either in-transaction (`_o1`) or absolute.
fn parse_state_location(s: &str, txid: Txid) -> Result<Location> {
    let location = Location::parse(s).map_err(|e| RvmError::execution(e.to_string()))?;
    Ok(match location {
        Location::Partial { slot } => Location::Jig { txid, slot },
        other => other,
    })
}

fn state_owner(value: &Value) -> Result<Owner> {
    crate::membrane::value_to_owner(value)
        .map_err(|e| RvmError::execution(format!("bad owner in cached state: {e}")))
}

fn berry_path(location: &Location) -> String {
    match location {
        Location::Berry { path, .. } => path.clone(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_locations_absolutize_against_the_blob_txid() {
        let txid = Txid::parse(&"ab".repeat(32)).unwrap();
        let loc = parse_state_location("_o2", txid).unwrap();
        assert_eq!(loc.compile(), format!("{}_o2", "ab".repeat(32)));

        let other = format!("{}_d1", "cd".repeat(32));
        assert_eq!(parse_state_location(&other, txid).unwrap().compile(), other);
        assert!(parse_state_location("garbage", txid).is_err());
    }
}

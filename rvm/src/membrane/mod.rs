// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The access mediator.
//!
//! All reads and writes of creation state go through these functions,
//! which consult the creation's [`Rules`] table: recording into the
//! active record, privacy, reserved names, binding protection, and
//! immutability. The interpreter and the kernel never touch props
//! directly.

mod rules;

pub use rules::Rules;

use rvm_shared::bindings::Bindings;
use rvm_shared::lock::{Owner, P2pkhLock, ScriptLock};
use rvm_shared::{Result, RvmError};

use crate::heap::{CreationId, Heap};
use crate::record::Record;
use crate::value::{PropKey, Value};

/// Names owned by the runtime. `owner` and `satoshis` are assignable
/// under binding rules; the rest never are.
const BINDING_PROPS: [&str; 5] = ["location", "origin", "nonce", "owner", "satoshis"];
const RESERVED_METHODS: [&str; 3] = ["sync", "destroy", "auth"];

/// Who is executing: the method frame the mediator consults for
/// ownership, privacy and recording decisions.
#[derive(Clone, Copy, Debug, Default)]
pub struct MethodCtx {
    pub this: Option<CreationId>,
    /// The class whose method body is running; grants `_` visibility.
    pub class: Option<CreationId>,
    pub caller: Option<CreationId>,
}

/// The class that owns a creation's private names: itself for code, its
/// class for instances and berries.
fn privacy_class(heap: &Heap, id: CreationId) -> CreationId {
    heap.get(id).class().unwrap_or(id)
}

fn check_ready(heap: &Heap, id: CreationId) -> Result<()> {
    if !heap.get(id).initialized {
        return Err(RvmError::execution(
            "creation is not ready: deep load in progress",
        ));
    }
    Ok(())
}

fn check_privacy(heap: &Heap, ctx: Option<&MethodCtx>, id: CreationId, key: &str) -> Result<()> {
    if !key.starts_with('_') || !heap.get(id).rules.privacy {
        return Ok(());
    }
    let allowed = ctx.is_some_and(|c| {
        c.this == Some(id) || c.class == Some(privacy_class(heap, id))
    });
    if allowed {
        Ok(())
    } else {
        Err(RvmError::execution(format!(
            "{key} is private to methods of its class"
        )))
    }
}

pub fn owner_to_value(owner: &Option<Owner>) -> Value {
    match owner {
        None => Value::Null,
        Some(Owner::Address(lock)) => Value::Str(lock.address()),
        Some(Owner::Script(lock)) => {
            let mut props = crate::value::Props::new();
            props.insert(
                PropKey::new("script"),
                Value::Str(hex::encode(&lock.script)),
            );
            props.insert(PropKey::new("domain"), Value::Int(lock.domain as i64));
            Value::new_object(props)
        }
    }
}

/// Coerces a user-assigned owner value; strings must be valid addresses.
pub fn value_to_owner(value: &Value) -> Result<Owner> {
    match value {
        Value::Str(address) => Ok(Owner::Address(
            P2pkhLock::from_address(address)
                .map_err(|e| RvmError::argument(e.to_string()))?,
        )),
        Value::Object(rc) => {
            let props = rc.borrow();
            let script = match props.get(&PropKey::new("script")) {
                Some(Value::Str(s)) => hex::decode(s)
                    .map_err(|_| RvmError::argument("owner script must be hex"))?,
                _ => return Err(RvmError::argument("owner must have a script")),
            };
            let domain = match props.get(&PropKey::new("domain")) {
                Some(Value::Int(n)) if *n >= 0 => *n as usize,
                _ => return Err(RvmError::argument("owner must have a domain")),
            };
            Ok(Owner::Script(ScriptLock { script, domain }))
        }
        other => Err(RvmError::argument(format!(
            "cannot coerce {} to an owner",
            other.type_of()
        ))),
    }
}

/// Mediated property read.
pub fn get_prop(
    heap: &Heap,
    record: Option<&mut Record>,
    ctx: Option<&MethodCtx>,
    id: CreationId,
    key: &str,
) -> Result<Value> {
    check_ready(heap, id)?;
    check_privacy(heap, ctx, id, key)?;

    let creation = heap.get(id);
    let bound = match key {
        "location" => Some(Value::Str(creation.bindings.location.compile())),
        "origin" => Some(Value::Str(creation.bindings.origin.compile())),
        "nonce" => Some(Value::Int(creation.bindings.nonce as i64)),
        "owner" => Some(owner_to_value(&creation.bindings.owner)),
        "satoshis" => Some(Value::Int(creation.bindings.satoshis as i64)),
        _ => None,
    };
    if let Some(value) = bound {
        return Ok(value);
    }

    if creation.rules.record_reads {
        if let Some(record) = record {
            record.read(heap, id);
        }
    }

    let props = creation.props.borrow();
    Ok(props
        .get(&PropKey::new(key))
        .cloned()
        .unwrap_or(Value::Undefined))
}

/// Mediated property write.
pub fn set_prop(
    heap: &mut Heap,
    record: &mut Record,
    ctx: &MethodCtx,
    id: CreationId,
    key: &str,
    value: Value,
    backing_limit: u64,
) -> Result<()> {
    check_ready(heap, id)?;
    let rules = heap.get(id).rules.clone();
    if rules.immutable {
        return Err(RvmError::execution("creation is immutable"));
    }
    if ctx.this != Some(id) {
        return Err(RvmError::execution(
            "updates must be performed by the creation's own methods",
        ));
    }
    check_privacy(heap, Some(ctx), id, key)?;

    match key {
        "location" | "origin" | "nonce" => {
            return Err(RvmError::execution(format!(
                "{key} is set only by the runtime"
            )));
        }
        "deps" if rules.reserved => {
            return Err(RvmError::execution("deps cannot be redefined"));
        }
        name if rules.reserved && RESERVED_METHODS.contains(&name) => {
            return Err(RvmError::execution(format!("{name} cannot be redefined")));
        }
        "owner" if rules.bindings => {
            let owner = value_to_owner(&value)?;
            record.update(heap, id)?;
            heap.get_mut(id).bindings.owner = Some(owner);
        }
        "satoshis" if rules.bindings => {
            let n = match value {
                Value::Int(n) => n,
                other => {
                    return Err(RvmError::argument(format!(
                        "satoshis must be a number, got {}",
                        other.type_of()
                    )))
                }
            };
            let checked = Bindings::check_satoshis(n, backing_limit)?;
            record.update(heap, id)?;
            heap.get_mut(id).bindings.satoshis = checked;
        }
        _ => {
            if !rules.record_updates {
                return Err(RvmError::execution("creation does not accept updates"));
            }
            record.update(heap, id)?;
            heap.get(id)
                .props
                .borrow_mut()
                .insert(PropKey::new(key), value);
        }
    }
    Ok(())
}

/// Mediated property delete.
pub fn delete_prop(
    heap: &mut Heap,
    record: &mut Record,
    ctx: &MethodCtx,
    id: CreationId,
    key: &str,
) -> Result<()> {
    check_ready(heap, id)?;
    let rules = heap.get(id).rules.clone();
    if rules.immutable {
        return Err(RvmError::execution("creation is immutable"));
    }
    if ctx.this != Some(id) {
        return Err(RvmError::execution(
            "updates must be performed by the creation's own methods",
        ));
    }
    check_privacy(heap, Some(ctx), id, key)?;
    if BINDING_PROPS.contains(&key) {
        return Err(RvmError::execution(format!("{key} cannot be deleted")));
    }
    if !rules.record_updates {
        return Err(RvmError::execution("creation does not accept updates"));
    }
    record.update(heap, id)?;
    heap.get(id).props.borrow_mut().remove(&PropKey::new(key));
    Ok(())
}

/// Whether a method may be invoked at all under the target's rules.
pub fn check_callable(heap: &Heap, id: CreationId, method: &str) -> Result<()> {
    check_ready(heap, id)?;
    let rules = &heap.get(id).rules;
    if rules.disabled_methods.iter().any(|m| m == method) {
        return Err(RvmError::execution(format!(
            "{method} is disabled on this creation"
        )));
    }
    Ok(())
}

/// Whether the running frame owns containers read from `source`: child
/// containers of a foreign or immutable creation are frozen.
pub fn container_owned(heap: &Heap, ctx: Option<&MethodCtx>, source: CreationId) -> bool {
    !heap.get(source).rules.immutable && ctx.is_some_and(|c| c.this == Some(source))
}

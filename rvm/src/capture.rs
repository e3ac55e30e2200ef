// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! State capture and hashing.
//!
//! Produces the canonical state blob whose double-SHA-256 is anchored in
//! transaction metadata. Location bindings are rewritten to their
//! in-transaction form, references to creations in the same transaction
//! to their in-transaction locations, and everything else to canonical
//! persistent locations.

use std::collections::HashMap;

use serde_json::{json, Value as Json};
use sha2::{Digest, Sha256};

use rvm_encoding::{to_canonical_string, BlobKind, StateBlob};
use rvm_shared::version::STATE_VERSION;
use rvm_shared::{Location, Result, RvmError};

use crate::codec;
use crate::creation::CreationKind;
use crate::heap::{CreationId, Heap, Snapshot};
use crate::membrane::owner_to_value;
use crate::value::Value;

/// Resolves the location a reference should be captured as.
pub trait RefResolver {
    fn resolve(&self, id: CreationId) -> Result<Location>;

    /// The persistent origin of a creation born in an earlier, already
    /// published transaction.
    fn resolve_origin(&self, id: CreationId) -> Result<Location> {
        self.resolve(id)
    }
}

/// Captures one creation from a snapshot of its state.
///
/// `tx_locations` maps every creation of the enclosing transaction to its
/// in-transaction location; `resolver` supplies persistent locations for
/// everything else.
pub fn capture(
    heap: &Heap,
    id: CreationId,
    snapshot: &Snapshot,
    tx_locations: &HashMap<CreationId, Location>,
    resolver: &dyn RefResolver,
) -> Result<StateBlob> {
    let mut enc = |ref_id: CreationId| -> Result<Json> {
        let location = match tx_locations.get(&ref_id) {
            Some(partial) => partial.clone(),
            None => resolver.resolve(ref_id)?,
        };
        Ok(json!(location.compile()))
    };

    // The props object: own properties plus the five bindings.
    let props_value = Value::new_object(snapshot.props.clone());
    let mut props = match codec::encode(&props_value, &mut enc)? {
        Json::Object(map) => map,
        _ => return Err(RvmError::internal("props must encode to an object")),
    };

    let own_location = tx_locations
        .get(&id)
        .cloned()
        .ok_or_else(|| RvmError::internal("captured creation missing a tx location"))?;
    let origin = if snapshot.bindings.nonce == 1 {
        own_location.clone()
    } else if snapshot.bindings.origin.is_deployed() {
        snapshot.bindings.origin.clone()
    } else {
        // Born in an unpublished upstream record; by capture time that
        // record has published and the resolver knows where.
        resolver.resolve_origin(id)?
    };
    props.insert("location".into(), json!(own_location.compile()));
    props.insert("origin".into(), json!(origin.compile()));
    props.insert("nonce".into(), json!(snapshot.bindings.nonce));
    props.insert(
        "owner".into(),
        owner_json(&snapshot.bindings.owner),
    );
    props.insert("satoshis".into(), json!(snapshot.bindings.satoshis));

    let creation = heap.get(id);
    let blob = match &creation.kind {
        CreationKind::Code { src, .. } => StateBlob {
            kind: BlobKind::Code,
            cls: None,
            props: Json::Object(props),
            src: Some(src.clone()),
            version: STATE_VERSION.into(),
        },
        CreationKind::Jig { class } => StateBlob {
            kind: BlobKind::Jig,
            cls: Some(json!({ "$jig": enc_class(*class, tx_locations, resolver)? })),
            props: Json::Object(props),
            src: None,
            version: STATE_VERSION.into(),
        },
        CreationKind::Berry { class, .. } => StateBlob {
            kind: BlobKind::Berry,
            cls: Some(json!({ "$jig": enc_class(*class, tx_locations, resolver)? })),
            props: Json::Object(props),
            src: None,
            version: STATE_VERSION.into(),
        },
        CreationKind::Native { .. } | CreationKind::Pending => {
            return Err(RvmError::internal("only deployable creations capture"));
        }
    };
    Ok(blob)
}

fn enc_class(
    class: CreationId,
    tx_locations: &HashMap<CreationId, Location>,
    resolver: &dyn RefResolver,
) -> Result<Json> {
    let location = match tx_locations.get(&class) {
        Some(partial) => partial.clone(),
        None => resolver.resolve(class)?,
    };
    Ok(json!(location.compile()))
}

fn owner_json(owner: &Option<rvm_shared::Owner>) -> Json {
    match owner_to_value(owner) {
        Value::Null => Json::Null,
        Value::Str(s) => json!(s),
        Value::Object(rc) => {
            let props = rc.borrow();
            let mut map = serde_json::Map::new();
            for (k, v) in props.iter() {
                map.insert(
                    k.as_str().to_owned(),
                    match v {
                        Value::Str(s) => json!(s),
                        Value::Int(n) => json!(n),
                        _ => Json::Null,
                    },
                );
            }
            Json::Object(map)
        }
        _ => Json::Null,
    }
}

/// Double-SHA-256 over UTF-8 canonical JSON, lower-case hex.
pub fn state_hash(blob: &StateBlob) -> Result<String> {
    let canonical = to_canonical_string(&blob.to_value())
        .map_err(|e| RvmError::execution(e.to_string()))?;
    let first = Sha256::digest(canonical.as_bytes());
    let second = Sha256::digest(first);
    Ok(hex::encode(second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creation::Creation;
    use crate::membrane::Rules;
    use crate::sandbox::Sandbox;
    use crate::value::{PropKey, Props};
    use pretty_assertions::assert_eq;
    use rvm_shared::lock::{Owner, P2pkhLock};
    use rvm_shared::Slot;

    struct NoRefs;

    impl RefResolver for NoRefs {
        fn resolve(&self, _: CreationId) -> Result<Location> {
            Err(RvmError::internal("no external refs expected"))
        }
    }

    fn code_creation(heap: &mut Heap, src: &str) -> CreationId {
        let template = Sandbox::new().evaluate(src).unwrap();
        let mut creation = Creation::new(
            CreationKind::Code {
                src: src.into(),
                template,
            },
            Rules::jig_code(),
        );
        creation
            .props
            .borrow_mut()
            .insert(PropKey::new("deps"), Value::new_object(Props::new()));
        heap.alloc(creation)
    }

    fn owner() -> Owner {
        Owner::Address(P2pkhLock {
            pubkey_hash: [7; 20],
            testnet: false,
        })
    }

    #[test]
    fn trivial_class_capture_matches_protocol_shape() {
        // S1: deploy `class A {}` and inspect the captured state.
        let mut heap = Heap::new();
        let id = code_creation(&mut heap, "class A {}");
        heap.get_mut(id)
            .bindings
            .bump(Location::Partial {
                slot: Slot::Output(1),
            });
        heap.get_mut(id).bindings.owner = Some(owner());

        let snapshot = heap.snapshot(id);
        let mut tx_locations = HashMap::new();
        tx_locations.insert(
            id,
            Location::Partial {
                slot: Slot::Output(1),
            },
        );
        let blob = capture(&heap, id, &snapshot, &tx_locations, &NoRefs).unwrap();

        let addr = owner().to_json();
        let expected = serde_json::json!({
            "kind": "code",
            "props": {
                "deps": {},
                "location": "_o1",
                "nonce": 1,
                "origin": "_o1",
                "owner": addr,
                "satoshis": 0,
            },
            "src": "class A {}",
            "version": "04",
        });
        assert_eq!(blob.to_value(), expected);

        // The hash is deterministic.
        assert_eq!(state_hash(&blob).unwrap(), state_hash(&blob).unwrap());
        assert_eq!(state_hash(&blob).unwrap().len(), 64);
    }

    #[test]
    fn second_nonce_keeps_absolute_origin() {
        let mut heap = Heap::new();
        let id = code_creation(&mut heap, "class A {}");
        let origin = Location::parse(&format!("{}_o1", "ab".repeat(32))).unwrap();
        heap.get_mut(id).bindings.bump(origin.clone());
        heap.get_mut(id)
            .bindings
            .bump(Location::Partial {
                slot: Slot::Output(1),
            });
        heap.get_mut(id).bindings.owner = Some(owner());

        let snapshot = heap.snapshot(id);
        let mut tx_locations = HashMap::new();
        tx_locations.insert(
            id,
            Location::Partial {
                slot: Slot::Output(1),
            },
        );
        let blob = capture(&heap, id, &snapshot, &tx_locations, &NoRefs).unwrap();
        let props = blob.props.as_object().unwrap();
        assert_eq!(props["origin"], serde_json::json!(origin.compile()));
        assert_eq!(props["location"], serde_json::json!("_o1"));
        assert_eq!(props["nonce"], serde_json::json!(2));
    }
}

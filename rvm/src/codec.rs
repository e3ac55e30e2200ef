// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Value graph ↔ JSON.
//!
//! The marker codec carries the non-JSON intrinsics (`$set`, `$map`,
//! `$u64`, `$ui8a`, `$undefined`, `$arb`), creation references (`$jig`,
//! payload supplied by the caller), and intra-graph sharing (`$dedup`
//! pointers indexing nodes in DFS emit order). The plain converters
//! implement user-facing `JSON.stringify` / `JSON.parse` semantics.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Map, Value as Json};

use rvm_encoding::tags;
use rvm_shared::{Result, RvmError};

use crate::heap::CreationId;
use crate::value::{PropKey, Props, Value};

pub type EncodeCreation<'x> = &'x mut dyn FnMut(CreationId) -> Result<Json>;
pub type DecodeCreation<'x> = &'x mut dyn FnMut(&Json) -> Result<Value>;

fn err(msg: impl Into<String>) -> RvmError {
    RvmError::execution(msg.into())
}

/// Encodes a value graph with markers. `encode_creation` supplies the
/// `$jig` payload (a master-list index or a location string).
pub fn encode(value: &Value, encode_creation: EncodeCreation) -> Result<Json> {
    let mut seen = HashMap::new();
    encode_inner(value, encode_creation, &mut seen)
}

fn register(value: &Value, seen: &mut HashMap<usize, usize>) -> Option<usize> {
    let ptr = value.container_ptr()?;
    if let Some(&idx) = seen.get(&ptr) {
        return Some(idx);
    }
    seen.insert(ptr, seen.len());
    None
}

fn encode_inner(
    value: &Value,
    enc: EncodeCreation,
    seen: &mut HashMap<usize, usize>,
) -> Result<Json> {
    if let Some(idx) = register(value, seen) {
        return Ok(tags::tagged(tags::DEDUP, json!(idx)));
    }
    match value {
        Value::Undefined => Ok(tags::tagged(tags::UNDEFINED, json!(1))),
        Value::Null => Ok(Json::Null),
        Value::Bool(b) => Ok(json!(b)),
        Value::Int(n) => Ok(json!(n)),
        Value::U64(n) => Ok(tags::tagged(tags::U64, json!(n.to_string()))),
        Value::Str(s) => Ok(json!(s)),
        Value::Bytes(b) => Ok(tags::tagged(tags::UI8A, json!(hex::encode(b)))),
        Value::Array(rc) => {
            let items = rc.borrow().clone();
            let mut out = Vec::with_capacity(items.len());
            for item in &items {
                out.push(encode_inner(item, enc, seen)?);
            }
            Ok(Json::Array(out))
        }
        Value::Set(rc) => {
            let items = rc.borrow().clone();
            let mut out = Vec::with_capacity(items.len());
            for item in &items {
                out.push(encode_inner(item, enc, seen)?);
            }
            Ok(tags::tagged(tags::SET, Json::Array(out)))
        }
        Value::Map(rc) => {
            let entries = rc.borrow().clone();
            let mut out = Vec::with_capacity(entries.len());
            for (k, v) in &entries {
                out.push(Json::Array(vec![
                    encode_inner(k, enc, seen)?,
                    encode_inner(v, enc, seen)?,
                ]));
            }
            Ok(tags::tagged(tags::MAP, Json::Array(out)))
        }
        Value::Object(rc) => {
            let props = rc.borrow().clone();
            Ok(Json::Object(encode_props(&props, enc, seen)?))
        }
        Value::Arb { class, props } => {
            let props = props.borrow().clone();
            let payload = json!({
                "props": Json::Object(encode_props(&props, enc, seen)?),
                "type": enc(*class)?,
            });
            Ok(tags::tagged(tags::ARB, payload))
        }
        Value::Creation(id) => Ok(tags::tagged(tags::JIG, enc(*id)?)),
        Value::Closure(_) => Err(err("functions cannot be serialized")),
    }
}

fn encode_props(
    props: &Props,
    enc: EncodeCreation,
    seen: &mut HashMap<usize, usize>,
) -> Result<Map<String, Json>> {
    let mut out = Map::new();
    for (key, value) in props {
        if tags::is_marker(key.as_str()) {
            return Err(err(format!(
                "property name {} collides with a marker",
                key.as_str()
            )));
        }
        out.insert(key.as_str().to_owned(), encode_inner(value, enc, seen)?);
    }
    Ok(out)
}

/// Decodes a marker-encoded JSON tree. `decode_creation` resolves `$jig`
/// payloads.
pub fn decode(json: &Json, decode_creation: DecodeCreation) -> Result<Value> {
    let mut nodes = Vec::new();
    decode_inner(json, decode_creation, &mut nodes)
}

fn decode_inner(json: &Json, dec: DecodeCreation, nodes: &mut Vec<Value>) -> Result<Value> {
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(u) = n.as_u64() {
                Ok(Value::U64(u))
            } else {
                Err(err(format!("non-integer number {n}")))
            }
        }
        Json::String(s) => Ok(Value::Str(s.clone())),
        Json::Array(items) => {
            let value = Value::new_array(Vec::new());
            nodes.push(value.clone());
            let Value::Array(rc) = &value else { unreachable!() };
            for item in items {
                let decoded = decode_inner(item, dec, nodes)?;
                rc.borrow_mut().push(decoded);
            }
            Ok(value)
        }
        Json::Object(_) => {
            if let Some((tag, payload)) = tags::as_tagged(json) {
                return decode_tagged(tag, payload, dec, nodes);
            }
            let Json::Object(map) = json else { unreachable!() };
            let value = Value::new_object(Props::new());
            nodes.push(value.clone());
            let Value::Object(rc) = &value else { unreachable!() };
            for (key, item) in map {
                let decoded = decode_inner(item, dec, nodes)?;
                rc.borrow_mut().insert(PropKey::new(key), decoded);
            }
            Ok(value)
        }
    }
}

fn decode_tagged(
    tag: &str,
    payload: &Json,
    dec: DecodeCreation,
    nodes: &mut Vec<Value>,
) -> Result<Value> {
    match tag {
        tags::UNDEFINED => Ok(Value::Undefined),
        tags::U64 => {
            let s = payload
                .as_str()
                .ok_or_else(|| err("$u64 payload must be a string"))?;
            s.parse()
                .map(Value::U64)
                .map_err(|_| err(format!("bad $u64 payload {s:?}")))
        }
        tags::UI8A => {
            let s = payload
                .as_str()
                .ok_or_else(|| err("$ui8a payload must be a string"))?;
            hex::decode(s)
                .map(Value::Bytes)
                .map_err(|_| err(format!("bad $ui8a payload {s:?}")))
        }
        tags::JIG => dec(payload),
        tags::DEDUP => {
            let idx = payload
                .as_u64()
                .ok_or_else(|| err("$dedup payload must be an index"))?;
            nodes
                .get(idx as usize)
                .cloned()
                .ok_or_else(|| err(format!("$dedup index {idx} out of range")))
        }
        tags::SET => {
            let items = payload
                .as_array()
                .ok_or_else(|| err("$set payload must be an array"))?;
            let value = Value::new_set();
            nodes.push(value.clone());
            let Value::Set(rc) = &value else { unreachable!() };
            for item in items {
                let decoded = decode_inner(item, dec, nodes)?;
                rc.borrow_mut().push(decoded);
            }
            Ok(value)
        }
        tags::MAP => {
            let entries = payload
                .as_array()
                .ok_or_else(|| err("$map payload must be an array"))?;
            let value = Value::new_map();
            nodes.push(value.clone());
            let Value::Map(rc) = &value else { unreachable!() };
            for entry in entries {
                let pair = entry
                    .as_array()
                    .filter(|p| p.len() == 2)
                    .ok_or_else(|| err("$map entries must be [key, value]"))?;
                let key = decode_inner(&pair[0], dec, nodes)?;
                let val = decode_inner(&pair[1], dec, nodes)?;
                rc.borrow_mut().push((key, val));
            }
            Ok(value)
        }
        tags::ARB => {
            let class = dec(
                payload
                    .get("type")
                    .ok_or_else(|| err("$arb payload must carry a type"))?,
            )?;
            let Value::Creation(class) = class else {
                return Err(err("$arb type must be a creation"));
            };
            let props_json = payload
                .get("props")
                .and_then(Json::as_object)
                .ok_or_else(|| err("$arb payload must carry props"))?;
            let value = Value::Arb {
                class,
                props: std::rc::Rc::new(std::cell::RefCell::new(Props::new())),
            };
            nodes.push(value.clone());
            let Value::Arb { props, .. } = &value else {
                unreachable!()
            };
            for (key, item) in props_json {
                let decoded = decode_inner(item, dec, nodes)?;
                props.borrow_mut().insert(PropKey::new(key), decoded);
            }
            Ok(value)
        }
        other => Err(err(format!("unknown marker {other}"))),
    }
}

/// `JSON.stringify` semantics: `undefined` in arrays becomes `null`,
/// `undefined` props are dropped, sets and maps flatten to `{}`, cycles
/// are an error, creations and functions refuse.
pub fn to_plain_json(value: &Value) -> Result<Json> {
    fn inner(value: &Value, stack: &mut HashSet<usize>) -> Result<Option<Json>> {
        if let Some(ptr) = value.container_ptr() {
            if !stack.insert(ptr) {
                return Err(err("converting circular structure to JSON"));
            }
        }
        let out = match value {
            Value::Undefined | Value::Closure(_) => None,
            Value::Null => Some(Json::Null),
            Value::Bool(b) => Some(json!(b)),
            Value::Int(n) => Some(json!(n)),
            Value::U64(n) => Some(json!(n)),
            Value::Str(s) => Some(json!(s)),
            Value::Bytes(bytes) => {
                let mut map = Map::new();
                for (i, b) in bytes.iter().enumerate() {
                    map.insert(i.to_string(), json!(b));
                }
                Some(Json::Object(map))
            }
            Value::Array(rc) => {
                let items = rc.borrow().clone();
                let mut out = Vec::with_capacity(items.len());
                for item in &items {
                    out.push(inner(item, stack)?.unwrap_or(Json::Null));
                }
                Some(Json::Array(out))
            }
            Value::Set(_) | Value::Map(_) => Some(json!({})),
            Value::Object(rc) => {
                let props = rc.borrow().clone();
                let mut map = Map::new();
                for (key, item) in &props {
                    if let Some(encoded) = inner(item, stack)? {
                        map.insert(key.as_str().to_owned(), encoded);
                    }
                }
                Some(Json::Object(map))
            }
            Value::Arb { props, .. } => {
                let props = props.borrow().clone();
                let mut map = Map::new();
                for (key, item) in &props {
                    if let Some(encoded) = inner(item, stack)? {
                        map.insert(key.as_str().to_owned(), encoded);
                    }
                }
                Some(Json::Object(map))
            }
            Value::Creation(_) => {
                return Err(err("creations cannot be stringified"));
            }
        };
        if let Some(ptr) = value.container_ptr() {
            stack.remove(&ptr);
        }
        Ok(out)
    }
    Ok(inner(value, &mut HashSet::new())?.unwrap_or(Json::Null))
}

/// `JSON.parse` semantics: no marker interpretation, integers only.
pub fn from_plain_json(json: &Json) -> Result<Value> {
    match json {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(*b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(u) = n.as_u64() {
                Ok(Value::U64(u))
            } else {
                Err(err(format!("non-integer number {n}")))
            }
        }
        Json::String(s) => Ok(Value::Str(s.clone())),
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(from_plain_json(item)?);
            }
            Ok(Value::new_array(out))
        }
        Json::Object(map) => {
            let mut props = Props::new();
            for (key, item) in map {
                props.insert(PropKey::new(key), from_plain_json(item)?);
            }
            Ok(Value::new_object(props))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn no_creations_enc(_: CreationId) -> Result<Json> {
        Err(RvmError::internal("unexpected creation"))
    }

    fn no_creations_dec(_: &Json) -> Result<Value> {
        Err(RvmError::internal("unexpected creation"))
    }

    fn roundtrip(value: &Value) -> Value {
        let json = encode(value, &mut no_creations_enc).unwrap();
        decode(&json, &mut no_creations_dec).unwrap()
    }

    #[test]
    fn primitives_roundtrip() {
        for v in [
            Value::Null,
            Value::Bool(true),
            Value::Int(-42),
            Value::Str("hi".into()),
        ] {
            assert!(roundtrip(&v).deep_eq(&v));
        }
    }

    #[test]
    fn markers_roundtrip() {
        let u = Value::U64(u64::MAX);
        let json = encode(&u, &mut no_creations_enc).unwrap();
        assert_eq!(json, json!({"$u64": "18446744073709551615"}));
        assert!(roundtrip(&u).strict_eq(&u));

        let bytes = Value::Bytes(vec![0xde, 0xad]);
        let json = encode(&bytes, &mut no_creations_enc).unwrap();
        assert_eq!(json, json!({"$ui8a": "dead"}));
        assert!(roundtrip(&bytes).deep_eq(&bytes));

        let json = encode(&Value::Undefined, &mut no_creations_enc).unwrap();
        assert_eq!(json, json!({"$undefined": 1}));
    }

    #[test]
    fn sets_and_maps_roundtrip() {
        let set = Value::new_set();
        if let Value::Set(rc) = &set {
            rc.borrow_mut().push(Value::Int(1));
            rc.borrow_mut().push(Value::Str("a".into()));
        }
        let json = encode(&set, &mut no_creations_enc).unwrap();
        assert_eq!(json, json!({"$set": [1, "a"]}));
        assert!(roundtrip(&set).deep_eq(&set));

        let map = Value::new_map();
        if let Value::Map(rc) = &map {
            rc.borrow_mut().push((Value::Int(1), Value::Str("x".into())));
        }
        let json = encode(&map, &mut no_creations_enc).unwrap();
        assert_eq!(json, json!({"$map": [[1, "x"]]}));
        assert!(roundtrip(&map).deep_eq(&map));
    }

    #[test]
    fn creation_refs_use_the_callback() {
        let v = Value::Creation(CreationId(7));
        let json = encode(&v, &mut |id| Ok(json!(id.0))).unwrap();
        assert_eq!(json, json!({"$jig": 7}));
        let back = decode(&json, &mut |payload| {
            Ok(Value::Creation(CreationId(payload.as_u64().unwrap() as u32)))
        })
        .unwrap();
        assert!(back.strict_eq(&v));
    }

    #[test]
    fn cycles_dedup() {
        let arr = Value::new_array(vec![Value::Int(1)]);
        if let Value::Array(rc) = &arr {
            let clone = arr.clone();
            rc.borrow_mut().push(clone);
        }
        let json = encode(&arr, &mut no_creations_enc).unwrap();
        assert_eq!(json, json!([1, {"$dedup": 0}]));
        let back = roundtrip(&arr);
        let Value::Array(rc) = &back else { panic!() };
        let items = rc.borrow();
        // The self-reference survives as identity.
        assert_eq!(items[1].container_ptr(), back.container_ptr());
    }

    #[test]
    fn shared_containers_dedup() {
        let inner = Value::new_array(vec![Value::Int(9)]);
        let outer = Value::new_array(vec![inner.clone(), inner.clone()]);
        let json = encode(&outer, &mut no_creations_enc).unwrap();
        assert_eq!(json, json!([[9], {"$dedup": 1}]));
        let back = roundtrip(&outer);
        let Value::Array(rc) = &back else { panic!() };
        let items = rc.borrow();
        assert_eq!(items[0].container_ptr(), items[1].container_ptr());
    }

    #[test]
    fn marker_colliding_keys_refuse_to_encode() {
        let mut props = Props::new();
        props.insert(PropKey::new("$set"), Value::Int(1));
        let v = Value::new_object(props);
        assert!(encode(&v, &mut no_creations_enc).is_err());
    }

    #[test]
    fn plain_json_stringify_semantics() {
        let arr = Value::new_array(vec![Value::Undefined, Value::Int(1)]);
        assert_eq!(to_plain_json(&arr).unwrap(), json!([null, 1]));

        let mut props = Props::new();
        props.insert(PropKey::new("keep"), Value::Int(1));
        props.insert(PropKey::new("drop"), Value::Undefined);
        let obj = Value::new_object(props);
        assert_eq!(to_plain_json(&obj).unwrap(), json!({"keep": 1}));

        // Cycles refuse.
        let arr = Value::new_array(vec![]);
        if let Value::Array(rc) = &arr {
            rc.borrow_mut().push(arr.clone());
        }
        assert!(to_plain_json(&arr).is_err());
    }
}

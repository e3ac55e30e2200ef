// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The determinism layer: the intrinsic library user code runs against.
//!
//! Everything here is a pure function of its inputs. Sort is stable, key
//! enumeration is canonical, stringification is canonical, and the
//! non-deterministic globals of a typical host do not exist — reading one
//! raises a descriptive error instead.

use rvm_shared::{Result, RvmError};

use crate::value::{Props, Value};

/// Globals that exist in ordinary hosts but are excised from the realm.
/// Touching one is a deterministic error, not silence.
const BANNED_GLOBALS: [&str; 10] = [
    "Date",
    "eval",
    "Function",
    "setTimeout",
    "setInterval",
    "clearTimeout",
    "clearInterval",
    "fetch",
    "XMLHttpRequest",
    "globalThis",
];

pub fn banned_global(name: &str) -> Option<RvmError> {
    if BANNED_GLOBALS.contains(&name) {
        Some(RvmError::execution(format!(
            "{name} is non-deterministic and is disabled in the realm"
        )))
    } else {
        None
    }
}

/// Invokes a closure value with arguments; supplied by the interpreter.
pub type CallFn<'a> = &'a mut dyn FnMut(&Value, &[Value]) -> Result<Value>;

fn err(msg: impl Into<String>) -> RvmError {
    RvmError::execution(msg.into())
}

/// Checked integer extraction for arithmetic and indexing.
pub fn as_int(v: &Value) -> Result<i64> {
    match v {
        Value::Int(n) => Ok(*n),
        Value::U64(n) => i64::try_from(*n).map_err(|_| err("number out of range")),
        other => Err(err(format!("expected a number, got {}", other.type_of()))),
    }
}

/// String coercion, the deterministic subset of host display rules.
pub fn display_string(v: &Value) -> String {
    match v {
        Value::Undefined => "undefined".into(),
        Value::Null => "null".into(),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        Value::U64(n) => n.to_string(),
        Value::Str(s) => s.clone(),
        Value::Bytes(_) => "[object Uint8Array]".into(),
        Value::Array(rc) => {
            let items: Vec<String> = rc.borrow().iter().map(display_string).collect();
            items.join(",")
        }
        Value::Set(_) => "[object Set]".into(),
        Value::Map(_) => "[object Map]".into(),
        Value::Object(_) | Value::Arb { .. } | Value::Creation(_) => "[object Object]".into(),
        Value::Closure(_) => "[function]".into(),
    }
}

/// Loose equality, restricted: numbers compare across width, everything
/// else falls back to strict equality. No implicit string/number bridges.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    a.strict_eq(b)
}

pub fn binary_add(a: &Value, b: &Value) -> Result<Value> {
    match (a, b) {
        (Value::Str(x), y) => Ok(Value::Str(format!("{x}{}", display_string(y)))),
        (x, Value::Str(y)) => Ok(Value::Str(format!("{}{y}", display_string(x)))),
        _ => {
            let (x, y) = (as_int(a)?, as_int(b)?);
            x.checked_add(y)
                .map(Value::Int)
                .ok_or_else(|| err("integer overflow"))
        }
    }
}

pub fn binary_arith(op: &str, a: &Value, b: &Value) -> Result<Value> {
    let (x, y) = (as_int(a)?, as_int(b)?);
    let out = match op {
        "-" => x.checked_sub(y),
        "*" => x.checked_mul(y),
        "/" => {
            if y == 0 {
                return Err(err("division by zero"));
            }
            x.checked_div(y)
        }
        "%" => {
            if y == 0 {
                return Err(err("modulo by zero"));
            }
            x.checked_rem(y)
        }
        _ => return Err(RvmError::internal(format!("unknown arith op {op}"))),
    };
    out.map(Value::Int).ok_or_else(|| err("integer overflow"))
}

pub fn compare(op: &str, a: &Value, b: &Value) -> Result<bool> {
    if let (Value::Str(x), Value::Str(y)) = (a, b) {
        return Ok(match op {
            "<" => x < y,
            "<=" => x <= y,
            ">" => x > y,
            ">=" => x >= y,
            _ => return Err(RvmError::internal(format!("unknown compare op {op}"))),
        });
    }
    let (x, y) = (as_int(a)?, as_int(b)?);
    Ok(match op {
        "<" => x < y,
        "<=" => x <= y,
        ">" => x > y,
        ">=" => x >= y,
        _ => return Err(RvmError::internal(format!("unknown compare op {op}"))),
    })
}

/// Stable sort. With a comparator, ties keep their original order; without
/// one, elements order by their display strings, also stably.
///
/// Insertion sort so comparator failures propagate; jig arrays are small.
pub fn sort_values(
    items: &mut Vec<Value>,
    comparator: Option<&Value>,
    call: CallFn,
) -> Result<()> {
    let mut less_than = |a: &Value, b: &Value| -> Result<bool> {
        match comparator {
            Some(f) => {
                let ret = call(f, &[a.clone(), b.clone()])?;
                Ok(as_int(&ret)? < 0)
            }
            None => Ok(display_string(a) < display_string(b)),
        }
    };

    for i in 1..items.len() {
        let mut j = i;
        while j > 0 {
            // Strictly-less keeps equal elements in original order.
            if less_than(&items[j], &items[j - 1])? {
                items.swap(j, j - 1);
                j -= 1;
            } else {
                break;
            }
        }
    }
    Ok(())
}

/// `Object.keys` over plain props, canonical order.
pub fn object_keys(props: &Props) -> Value {
    Value::new_array(
        props
            .keys()
            .map(|k| Value::Str(k.as_str().to_owned()))
            .collect(),
    )
}

pub fn object_values(props: &Props) -> Value {
    Value::new_array(props.values().cloned().collect())
}

pub fn object_entries(props: &Props) -> Value {
    Value::new_array(
        props
            .iter()
            .map(|(k, v)| Value::new_array(vec![Value::Str(k.as_str().to_owned()), v.clone()]))
            .collect(),
    )
}

/// Array intrinsics that need no callback.
pub fn array_method(
    items: &std::rc::Rc<std::cell::RefCell<Vec<Value>>>,
    name: &str,
    args: &[Value],
) -> Result<Value> {
    match name {
        "push" => {
            let mut v = items.borrow_mut();
            for a in args {
                v.push(a.clone());
            }
            Ok(Value::Int(v.len() as i64))
        }
        "pop" => Ok(items.borrow_mut().pop().unwrap_or(Value::Undefined)),
        "indexOf" => {
            let target = args.first().cloned().unwrap_or(Value::Undefined);
            let pos = items
                .borrow()
                .iter()
                .position(|v| v.strict_eq(&target))
                .map(|p| p as i64)
                .unwrap_or(-1);
            Ok(Value::Int(pos))
        }
        "includes" => {
            let target = args.first().cloned().unwrap_or(Value::Undefined);
            Ok(Value::Bool(
                items.borrow().iter().any(|v| v.strict_eq(&target)),
            ))
        }
        "join" => {
            let sep = match args.first() {
                Some(Value::Str(s)) => s.clone(),
                Some(other) => display_string(other),
                None => ",".into(),
            };
            let joined: Vec<String> = items.borrow().iter().map(display_string).collect();
            Ok(Value::Str(joined.join(&sep)))
        }
        "slice" => {
            let v = items.borrow();
            let len = v.len() as i64;
            let clamp = |n: i64| -> usize {
                let n = if n < 0 { len + n } else { n };
                n.clamp(0, len) as usize
            };
            let start = clamp(args.first().map(as_int).transpose()?.unwrap_or(0));
            let end = clamp(args.get(1).map(as_int).transpose()?.unwrap_or(len));
            Ok(Value::new_array(
                v.get(start..end.max(start)).unwrap_or(&[]).to_vec(),
            ))
        }
        "concat" => {
            let mut out = items.borrow().clone();
            for a in args {
                match a {
                    Value::Array(rc) => out.extend(rc.borrow().iter().cloned()),
                    other => out.push(other.clone()),
                }
            }
            Ok(Value::new_array(out))
        }
        "reverse" => {
            items.borrow_mut().reverse();
            Ok(Value::Array(items.clone()))
        }
        _ => Err(err(format!("unknown array method {name}"))),
    }
}

/// Array intrinsics taking a function argument.
pub fn array_callback_method(
    items: &std::rc::Rc<std::cell::RefCell<Vec<Value>>>,
    name: &str,
    args: &[Value],
    call: CallFn,
) -> Result<Value> {
    match name {
        "sort" => {
            let mut snapshot = items.borrow().clone();
            sort_values(&mut snapshot, args.first(), call)?;
            *items.borrow_mut() = snapshot;
            Ok(Value::Array(items.clone()))
        }
        "map" | "filter" | "forEach" | "find" | "some" | "every" => {
            let f = args
                .first()
                .ok_or_else(|| err(format!("{name} requires a function")))?;
            let snapshot = items.borrow().clone();
            let mut mapped = Vec::with_capacity(snapshot.len());
            for (i, item) in snapshot.iter().enumerate() {
                mapped.push(call(f, &[item.clone(), Value::Int(i as i64)])?);
            }
            Ok(match name {
                "map" => Value::new_array(mapped),
                "filter" => Value::new_array(
                    snapshot
                        .into_iter()
                        .zip(&mapped)
                        .filter(|(_, keep)| keep.truthy())
                        .map(|(v, _)| v)
                        .collect(),
                ),
                "find" => snapshot
                    .into_iter()
                    .zip(&mapped)
                    .find(|(_, keep)| keep.truthy())
                    .map(|(v, _)| v)
                    .unwrap_or(Value::Undefined),
                "some" => Value::Bool(mapped.iter().any(Value::truthy)),
                "every" => Value::Bool(mapped.iter().all(Value::truthy)),
                _ => Value::Undefined, // forEach
            })
        }
        _ => Err(err(format!("unknown array method {name}"))),
    }
}

pub fn string_method(s: &str, name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "slice" => {
            let chars: Vec<char> = s.chars().collect();
            let len = chars.len() as i64;
            let clamp = |n: i64| -> usize {
                let n = if n < 0 { len + n } else { n };
                n.clamp(0, len) as usize
            };
            let start = clamp(args.first().map(as_int).transpose()?.unwrap_or(0));
            let end = clamp(args.get(1).map(as_int).transpose()?.unwrap_or(len));
            Ok(Value::Str(
                chars[start..end.max(start)].iter().collect(),
            ))
        }
        "indexOf" => {
            let needle = match args.first() {
                Some(Value::Str(n)) => n.clone(),
                _ => return Ok(Value::Int(-1)),
            };
            Ok(Value::Int(
                s.find(&needle)
                    .map(|byte| s[..byte].chars().count() as i64)
                    .unwrap_or(-1),
            ))
        }
        "includes" => Ok(Value::Bool(match args.first() {
            Some(Value::Str(n)) => s.contains(n.as_str()),
            _ => false,
        })),
        "startsWith" => Ok(Value::Bool(match args.first() {
            Some(Value::Str(n)) => s.starts_with(n.as_str()),
            _ => false,
        })),
        "endsWith" => Ok(Value::Bool(match args.first() {
            Some(Value::Str(n)) => s.ends_with(n.as_str()),
            _ => false,
        })),
        "split" => {
            let sep = match args.first() {
                Some(Value::Str(n)) => n.clone(),
                _ => {
                    return Ok(Value::new_array(vec![Value::Str(s.to_owned())]));
                }
            };
            let parts: Vec<Value> = if sep.is_empty() {
                s.chars().map(|c| Value::Str(c.to_string())).collect()
            } else {
                s.split(&sep).map(|p| Value::Str(p.to_owned())).collect()
            };
            Ok(Value::new_array(parts))
        }
        "toLowerCase" => Ok(Value::Str(s.to_lowercase())),
        "toUpperCase" => Ok(Value::Str(s.to_uppercase())),
        "charAt" => {
            let i = args.first().map(as_int).transpose()?.unwrap_or(0);
            Ok(Value::Str(
                usize::try_from(i)
                    .ok()
                    .and_then(|i| s.chars().nth(i))
                    .map(|c| c.to_string())
                    .unwrap_or_default(),
            ))
        }
        "trim" => Ok(Value::Str(s.trim().to_owned())),
        _ => Err(err(format!("unknown string method {name}"))),
    }
}

pub fn set_method(
    items: &std::rc::Rc<std::cell::RefCell<Vec<Value>>>,
    name: &str,
    args: &[Value],
    this: &Value,
) -> Result<Value> {
    let arg = args.first().cloned().unwrap_or(Value::Undefined);
    match name {
        "add" => {
            let mut v = items.borrow_mut();
            if !v.iter().any(|x| x.strict_eq(&arg)) {
                v.push(arg);
            }
            Ok(this.clone())
        }
        "has" => Ok(Value::Bool(
            items.borrow().iter().any(|x| x.strict_eq(&arg)),
        )),
        "delete" => {
            let mut v = items.borrow_mut();
            match v.iter().position(|x| x.strict_eq(&arg)) {
                Some(pos) => {
                    v.remove(pos);
                    Ok(Value::Bool(true))
                }
                None => Ok(Value::Bool(false)),
            }
        }
        "clear" => {
            items.borrow_mut().clear();
            Ok(Value::Undefined)
        }
        "forEach" => Err(err("use for…of to iterate a Set")),
        _ => Err(err(format!("unknown set method {name}"))),
    }
}

pub fn map_method(
    entries: &std::rc::Rc<std::cell::RefCell<Vec<(Value, Value)>>>,
    name: &str,
    args: &[Value],
    this: &Value,
) -> Result<Value> {
    let key = args.first().cloned().unwrap_or(Value::Undefined);
    match name {
        "get" => Ok(entries
            .borrow()
            .iter()
            .find(|(k, _)| k.strict_eq(&key))
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Undefined)),
        "set" => {
            let value = args.get(1).cloned().unwrap_or(Value::Undefined);
            let mut v = entries.borrow_mut();
            match v.iter_mut().find(|(k, _)| k.strict_eq(&key)) {
                Some(entry) => entry.1 = value,
                None => v.push((key, value)),
            }
            Ok(this.clone())
        }
        "has" => Ok(Value::Bool(
            entries.borrow().iter().any(|(k, _)| k.strict_eq(&key)),
        )),
        "delete" => {
            let mut v = entries.borrow_mut();
            match v.iter().position(|(k, _)| k.strict_eq(&key)) {
                Some(pos) => {
                    v.remove(pos);
                    Ok(Value::Bool(true))
                }
                None => Ok(Value::Bool(false)),
            }
        }
        "clear" => {
            entries.borrow_mut().clear();
            Ok(Value::Undefined)
        }
        _ => Err(err(format!("unknown map method {name}"))),
    }
}

/// Integer-only `Math`.
pub fn math_method(name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "random" => Err(err(
            "Math.random is non-deterministic and is disabled in the realm",
        )),
        "abs" => {
            let n = as_int(args.first().unwrap_or(&Value::Undefined))?;
            n.checked_abs()
                .map(Value::Int)
                .ok_or_else(|| err("integer overflow"))
        }
        "sign" => {
            let n = as_int(args.first().unwrap_or(&Value::Undefined))?;
            Ok(Value::Int(n.signum()))
        }
        "min" | "max" => {
            if args.is_empty() {
                return Err(err(format!("Math.{name} requires arguments")));
            }
            let mut best = as_int(&args[0])?;
            for a in &args[1..] {
                let n = as_int(a)?;
                best = if name == "min" {
                    best.min(n)
                } else {
                    best.max(n)
                };
            }
            Ok(Value::Int(best))
        }
        "floor" | "ceil" | "round" | "trunc" => {
            // Integers are already integral.
            Ok(Value::Int(as_int(args.first().unwrap_or(&Value::Undefined))?))
        }
        _ => Err(err(format!("unknown Math member {name}"))),
    }
}

/// Canonical iteration for for…of: arrays and sets yield values, maps
/// yield `[k, v]` pairs, strings yield characters, plain objects refuse.
pub fn iterate(v: &Value) -> Result<Vec<Value>> {
    match v {
        Value::Array(rc) | Value::Set(rc) => Ok(rc.borrow().clone()),
        Value::Map(rc) => Ok(rc
            .borrow()
            .iter()
            .map(|(k, val)| Value::new_array(vec![k.clone(), val.clone()]))
            .collect()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        other => Err(err(format!("{} is not iterable", other.type_of()))),
    }
}

/// Property of the iteration-facing length/size members.
pub fn length_of(v: &Value) -> Option<Value> {
    match v {
        Value::Str(s) => Some(Value::Int(s.chars().count() as i64)),
        Value::Array(rc) => Some(Value::Int(rc.borrow().len() as i64)),
        Value::Bytes(b) => Some(Value::Int(b.len() as i64)),
        _ => None,
    }
}

pub fn size_of(v: &Value) -> Option<Value> {
    match v {
        Value::Set(rc) => Some(Value::Int(rc.borrow().len() as i64)),
        Value::Map(rc) => Some(Value::Int(rc.borrow().len() as i64)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::PropKey;

    fn no_call(_: &Value, _: &[Value]) -> Result<Value> {
        Err(RvmError::internal("no callback expected"))
    }

    #[test]
    fn banned_globals_raise() {
        assert!(banned_global("Date").is_some());
        assert!(banned_global("eval").is_some());
        assert!(banned_global("JSON").is_none());
    }

    #[test]
    fn sort_is_stable_for_equal_keys() {
        // S2: [{k:2},{k:1},{k:2}] sorted by k keeps original relative
        // order of the equal elements.
        let tag = |k: i64, i: i64| {
            let mut props = Props::new();
            props.insert(PropKey::new("k"), Value::Int(k));
            props.insert(PropKey::new("i"), Value::Int(i));
            Value::new_object(props)
        };
        let mut items = vec![tag(2, 0), tag(1, 1), tag(2, 2)];
        let mut call = |f: &Value, args: &[Value]| -> Result<Value> {
            // Simulates (a, b) => a.k - b.k without an interpreter.
            let _ = f;
            let get = |v: &Value| -> i64 {
                let Value::Object(rc) = v else { panic!() };
                let b = rc.borrow();
                let Value::Int(n) = b[&PropKey::new("k")] else {
                    panic!()
                };
                n
            };
            Ok(Value::Int(get(&args[0]) - get(&args[1])))
        };
        sort_values(&mut items, Some(&Value::Int(0)), &mut call).unwrap();
        let order: Vec<i64> = items
            .iter()
            .map(|v| {
                let Value::Object(rc) = v else { panic!() };
                let b = rc.borrow();
                let Value::Int(n) = b[&PropKey::new("i")] else {
                    panic!()
                };
                n
            })
            .collect();
        assert_eq!(order, vec![1, 0, 2]);
    }

    #[test]
    fn default_sort_is_by_display_string() {
        let mut items = vec![Value::Int(10), Value::Int(2), Value::Int(1)];
        sort_values(&mut items, None, &mut no_call).unwrap();
        let out: Vec<String> = items.iter().map(display_string).collect();
        assert_eq!(out, vec!["1", "10", "2"]);
    }

    #[test]
    fn arithmetic_is_checked() {
        assert!(binary_add(&Value::Int(i64::MAX), &Value::Int(1)).is_err());
        assert!(binary_arith("/", &Value::Int(1), &Value::Int(0)).is_err());
        assert!(matches!(
            binary_add(&Value::Str("a".into()), &Value::Int(1)).unwrap(),
            Value::Str(s) if s == "a1"
        ));
    }

    #[test]
    fn math_random_is_disabled() {
        let e = math_method("random", &[]).unwrap_err();
        assert!(e.to_string().contains("non-deterministic"));
    }

    #[test]
    fn object_keys_enumerate_canonically() {
        let mut props = Props::new();
        for k in ["b", "2", "a", "10"] {
            props.insert(PropKey::new(k), Value::Null);
        }
        let Value::Array(rc) = object_keys(&props) else {
            panic!()
        };
        let keys: Vec<String> = rc.borrow().iter().map(display_string).collect();
        assert_eq!(keys, vec!["2", "10", "a", "b"]);
    }
}

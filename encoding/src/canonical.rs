// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cmp::Ordering;

use serde_json::Value;

use crate::CodecError;

/// How a property key sorts: canonical integer keys first in numeric
/// order, then everything else in code-point order.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
pub enum PropKeyOrder {
    Integer(u64),
    Text(String),
}

impl PropKeyOrder {
    pub fn of(key: &str) -> PropKeyOrder {
        if is_canonical_integer(key) {
            if let Ok(n) = key.parse::<u64>() {
                return PropKeyOrder::Integer(n);
            }
        }
        PropKeyOrder::Text(key.to_owned())
    }
}

fn is_canonical_integer(key: &str) -> bool {
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    key == "0" || !key.starts_with('0')
}

/// The canonical property comparator used by key enumeration and by the
/// stringifier.
pub fn cmp_prop_keys(a: &str, b: &str) -> Ordering {
    PropKeyOrder::of(a).cmp(&PropKeyOrder::of(b))
}

/// Serializes a JSON tree to its canonical string: sorted keys, compact
/// separators, integers only.
pub fn to_canonical_string(value: &Value) -> Result<String, CodecError> {
    let mut out = String::new();
    write_value(value, &mut out)?;
    Ok(out)
}

fn write_value(value: &Value, out: &mut String) -> Result<(), CodecError> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                out.push_str(&i.to_string());
            } else if let Some(u) = n.as_u64() {
                out.push_str(&u.to_string());
            } else {
                return Err(CodecError::Float(n.to_string()));
            }
        }
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| cmp_prop_keys(a, b));
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(&map[key.as_str()], out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn keys_sort_integers_first() {
        let v = json!({"b": 1, "10": 2, "2": 3, "a": 4, "02": 5});
        assert_eq!(
            to_canonical_string(&v).unwrap(),
            r#"{"2":3,"10":2,"02":5,"a":4,"b":1}"#
        );
    }

    #[test]
    fn nested_structures_are_compact() {
        let v = json!({"z": [1, {"y": null, "x": true}], "a": "s"});
        assert_eq!(
            to_canonical_string(&v).unwrap(),
            r#"{"a":"s","z":[1,{"x":true,"y":null}]}"#
        );
    }

    #[test]
    fn floats_are_rejected() {
        let v = json!({"a": 1.5});
        assert_eq!(
            to_canonical_string(&v),
            Err(CodecError::Float("1.5".into()))
        );
    }

    #[test]
    fn strings_escape_controls() {
        let v = json!("a\"b\\c\nd\u{1}");
        assert_eq!(
            to_canonical_string(&v).unwrap(),
            "\"a\\\"b\\\\c\\nd\\u0001\""
        );
    }

    #[test]
    fn comparator_is_total_and_stable() {
        let mut keys = vec!["b", "1", "a", "0", "11", "2"];
        keys.sort_by(|a, b| cmp_prop_keys(a, b));
        assert_eq!(keys, vec!["0", "1", "2", "11", "a", "b"]);
    }
}

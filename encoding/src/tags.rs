// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The typed single-key markers.

use serde_json::{Map, Value};

pub const JIG: &str = "$jig";
pub const SET: &str = "$set";
pub const MAP: &str = "$map";
pub const ARB: &str = "$arb";
pub const U64: &str = "$u64";
pub const UI8A: &str = "$ui8a";
pub const DEDUP: &str = "$dedup";
pub const UNDEFINED: &str = "$undefined";

const ALL: [&str; 8] = [JIG, SET, MAP, ARB, U64, UI8A, DEDUP, UNDEFINED];

/// True when a plain-object key would collide with a marker.
pub fn is_marker(key: &str) -> bool {
    ALL.contains(&key)
}

pub fn tagged(tag: &str, payload: Value) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(tag.to_owned(), payload);
    Value::Object(map)
}

/// Recognizes a tagged object: exactly one key, and that key is a marker.
pub fn as_tagged(value: &Value) -> Option<(&str, &Value)> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let (key, payload) = map.iter().next()?;
    if is_marker(key) {
        Some((key.as_str(), payload))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tagged_objects_are_recognized() {
        let v = tagged(JIG, json!(3));
        assert_eq!(as_tagged(&v), Some((JIG, &json!(3))));
        assert_eq!(as_tagged(&json!({"$jig": 1, "x": 2})), None);
        assert_eq!(as_tagged(&json!({"plain": 1})), None);
        assert_eq!(as_tagged(&json!([1])), None);
    }

    #[test]
    fn marker_set_is_closed() {
        for tag in ALL {
            assert!(is_marker(tag));
        }
        assert!(!is_marker("$other"));
        assert!(!is_marker("jig"));
    }
}

// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::cell::RefCell;
use std::collections::HashMap;

use anyhow::anyhow;
use serde_json::Value;

use crate::bloom::CodeFilter;
use crate::{keys, Cache};

/// Default cap on the cache's approximate byte size.
pub const DEFAULT_MAX_BYTES: usize = 10 * 1024 * 1024;

struct Entry {
    value: Value,
    size: usize,
}

struct Inner {
    entries: HashMap<String, Entry>,
    /// LRU order; front is coldest.
    order: Vec<String>,
    bytes: usize,
    max_bytes: usize,
    filter: CodeFilter,
}

/// The local cache: LRU by approximate byte size, write-once immutable
/// prefixes, and a maintained code bloom filter. Not threadsafe; the
/// runtime is single-threaded by design.
pub struct MemoryCache {
    inner: RefCell<Inner>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_max_bytes(DEFAULT_MAX_BYTES)
    }

    pub fn with_max_bytes(max_bytes: usize) -> Self {
        MemoryCache {
            inner: RefCell::new(Inner {
                entries: HashMap::new(),
                order: Vec::new(),
                bytes: 0,
                max_bytes,
                filter: CodeFilter::new(),
            }),
        }
    }

    /// The transport form of the code filter.
    pub fn code_filter_base64(&self) -> String {
        self.inner.borrow().filter.to_base64()
    }

    /// Whether a code location is possibly cached locally.
    pub fn possibly_has_code(&self, location: &str) -> bool {
        self.inner.borrow().filter.possibly_has(location)
    }

    pub fn bytes(&self) -> usize {
        self.inner.borrow().bytes
    }
}

impl Inner {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos);
            self.order.push(k);
        }
    }

    fn filter_update_on_remove(&mut self, key: &str, value: &Value) {
        if let Some(location) = key.strip_prefix(keys::JIG) {
            if value.get("kind").and_then(Value::as_str) == Some("code") {
                self.filter.remove(location);
            }
        }
    }

    fn evict(&mut self) {
        let mut rotations = 0;
        while self.bytes > self.max_bytes && rotations < self.order.len() {
            let Some(key) = self.order.first().cloned() else {
                break;
            };
            if keys::is_preserved(&key) {
                // Config entries ride to the warm end instead of dying.
                self.touch(&key);
                rotations += 1;
                continue;
            }
            self.order.remove(0);
            if let Some(entry) = self.entries.remove(&key) {
                self.bytes -= entry.size;
                self.filter_update_on_remove(&key, &entry.value);
                log::debug!("cache evicted {} ({} bytes)", key, entry.size);
            }
        }
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        if key == keys::CONFIG_CODE_FILTER {
            return Ok(Some(self.inner.borrow().filter.to_json()));
        }
        let mut inner = self.inner.borrow_mut();
        if !inner.entries.contains_key(key) {
            return Ok(None);
        }
        inner.touch(key);
        Ok(inner.entries.get(key).map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        let mut inner = self.inner.borrow_mut();

        if key == keys::CONFIG_CODE_FILTER {
            inner.filter = CodeFilter::from_json(&value)
                .ok_or_else(|| anyhow!("malformed code filter"))?;
            return Ok(());
        }

        match inner.entries.get(key) {
            Some(existing) if keys::is_immutable(key) => {
                let unchanged = existing.value == value;
                if !unchanged {
                    return Err(anyhow!(
                        "attempt to change immutable cache entry {}",
                        key
                    ));
                }
                inner.touch(key);
                return Ok(());
            }
            Some(existing) => {
                let old_size = existing.size;
                inner.bytes -= old_size;
            }
            None => {}
        }

        let size = key.len() + value.to_string().len();
        if let Some(location) = key.strip_prefix(keys::JIG) {
            if value.get("kind").and_then(Value::as_str) == Some("code") {
                inner.filter.add(location);
            }
        }

        let fresh = inner.entries.insert(key.to_owned(), Entry { value, size });
        if fresh.is_none() {
            inner.order.push(key.to_owned());
        } else {
            inner.touch(key);
        }
        inner.bytes += size;
        inner.evict();
        Ok(())
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn get_set_roundtrip() {
        let cache = MemoryCache::new();
        assert_eq!(cache.get("trust://ab").unwrap(), None);
        cache.set("trust://ab", json!(true)).unwrap();
        assert_eq!(cache.get("trust://ab").unwrap(), Some(json!(true)));
    }

    #[test]
    fn immutable_keys_are_write_once() {
        let cache = MemoryCache::new();
        cache.set("tx://ab", json!("rawtx1")).unwrap();
        // Idempotent re-set is fine.
        cache.set("tx://ab", json!("rawtx1")).unwrap();
        // A differing value is a programmer error.
        assert!(cache.set("tx://ab", json!("rawtx2")).is_err());
        // Mutable keys may change.
        cache.set("ban://x_o1", json!(true)).unwrap();
        cache.set("ban://x_o1", json!(false)).unwrap();
    }

    #[test]
    fn lru_evicts_cold_entries_first() {
        let cache = MemoryCache::with_max_bytes(200);
        cache.set("spend://a", json!("1234567890")).unwrap();
        cache.set("spend://b", json!("1234567890")).unwrap();
        // Touch a so b is coldest.
        cache.get("spend://a").unwrap();
        for i in 0..8 {
            cache
                .set(&format!("spend://fill{i}"), json!("1234567890"))
                .unwrap();
        }
        assert_eq!(cache.get("spend://b").unwrap(), None);
    }

    #[test]
    fn config_entries_survive_eviction() {
        let cache = MemoryCache::with_max_bytes(150);
        cache
            .set(crate::keys::CONFIG_RECENT_BROADCASTS, json!([]))
            .unwrap();
        for i in 0..20 {
            cache
                .set(&format!("spend://fill{i}"), json!("1234567890"))
                .unwrap();
        }
        assert!(cache
            .get(crate::keys::CONFIG_RECENT_BROADCASTS)
            .unwrap()
            .is_some());
    }

    #[test]
    fn code_entries_maintain_the_filter() {
        let cache = MemoryCache::new();
        let loc = format!("{}_o1", "ab".repeat(32));
        assert!(!cache.possibly_has_code(&loc));
        cache
            .set(
                &format!("jig://{loc}"),
                json!({"kind": "code", "src": "class A {}", "props": {}, "version": "04"}),
            )
            .unwrap();
        assert!(cache.possibly_has_code(&loc));

        // Jig instances do not count.
        let loc2 = format!("{}_o2", "ab".repeat(32));
        cache
            .set(
                &format!("jig://{loc2}"),
                json!({"kind": "jig", "cls": {"$jig": 0}, "props": {}, "version": "04"}),
            )
            .unwrap();
        assert!(!cache.possibly_has_code(&loc2));
    }

    #[test]
    fn evicting_code_removes_it_from_the_filter() {
        let cache = MemoryCache::with_max_bytes(220);
        let loc = format!("{}_o1", "ab".repeat(32));
        cache
            .set(
                &format!("jig://{loc}"),
                json!({"kind": "code", "src": "class A {}", "props": {}, "version": "04"}),
            )
            .unwrap();
        assert!(cache.possibly_has_code(&loc));
        for i in 0..10 {
            cache
                .set(&format!("spend://fill{i}"), json!("1234567890"))
                .unwrap();
        }
        assert!(!cache.possibly_has_code(&loc));
    }

    #[test]
    fn code_filter_key_is_backed_by_the_filter() {
        let cache = MemoryCache::new();
        let json = cache.get(crate::keys::CONFIG_CODE_FILTER).unwrap().unwrap();
        let filter = CodeFilter::from_json(&json).unwrap();
        assert_eq!(filter, CodeFilter::new());
    }
}

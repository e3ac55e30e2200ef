// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The cache layer: a key-prefixed JSON content store plus its two
//! sidecars, the code bloom filter and the recent-broadcast ring.
//!
//! Cache values are restricted to JSON-serializable data (numbers,
//! strings, booleans, null, arrays, plain objects). The `jig`, `berry`
//! and `tx` prefixes are content-addressed and therefore write-once.

mod bloom;
mod broadcasts;
mod memory;

pub use bloom::CodeFilter;
pub use broadcasts::{RecentBroadcast, RecentBroadcasts, DEFAULT_EXPIRATION_MS};
pub use memory::MemoryCache;

use serde_json::Value;

/// Well-known cache keys and prefixes.
pub mod keys {
    pub const TX: &str = "tx://";
    pub const TIME: &str = "time://";
    pub const SPEND: &str = "spend://";
    pub const JIG: &str = "jig://";
    pub const BERRY: &str = "berry://";
    pub const TRUST: &str = "trust://";
    pub const BAN: &str = "ban://";
    pub const CONFIG_CODE_FILTER: &str = "config://code-filter";
    pub const CONFIG_RECENT_BROADCASTS: &str = "config://recent-broadcasts";

    /// Write-once prefixes: the value is determined by its key.
    pub fn is_immutable(key: &str) -> bool {
        key.starts_with(JIG) || key.starts_with(BERRY) || key.starts_with(TX)
    }

    /// Keys preserved across LRU eviction.
    pub fn is_preserved(key: &str) -> bool {
        key == CONFIG_CODE_FILTER || key == CONFIG_RECENT_BROADCASTS
    }
}

/// A key/value store for JSON values. Remote implementations only need
/// stable read-your-writes; the local [`MemoryCache`] adds LRU semantics.
pub trait Cache {
    fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> anyhow::Result<()>;
}

// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Untrusted code bans the location; trusting the txid clears the ban on
//! the next load.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use rvm::KernelConfig;
use rvm_shared::RvmError;
use rvm_store::Cache;

#[test]
fn trust_clears_a_ban_and_load_succeeds() {
    let h = harness();
    let code = h.kernel.deploy("class A {}").unwrap();
    let location = h.kernel.location_of(code);
    let txid = location.strip_suffix("_o1").unwrap().to_owned();

    // A fresh kernel with no cache and no trust must refuse to replay
    // the deploy, and remember the refusal.
    let h2 = sibling(&h, KernelConfig::new().app("test"), false);
    let err = h2.kernel.load(&location).unwrap_err();
    assert!(matches!(err, RvmError::Trust { .. }), "{err}");

    let ban_key = format!("ban://{location}");
    let ban = h2.cache.get(&ban_key).unwrap().expect("ban was written");
    assert_eq!(
        ban.get("untrusted").and_then(|v| v.as_str()),
        Some(txid.as_str())
    );

    // While banned, the load fails immediately.
    let err = h2.kernel.load(&location).unwrap_err();
    assert!(matches!(err, RvmError::Trust { .. }), "{err}");

    // Trusting the offending txid lets the next load replay, and the
    // successful load resets the ban.
    h2.kernel.trust(&txid).unwrap();
    let loaded = h2.kernel.load(&location).unwrap();
    assert_eq!(h2.kernel.src_of(loaded).as_deref(), Some("class A {}"));
    assert_eq!(
        h2.cache.get(&ban_key).unwrap(),
        Some(serde_json::Value::Bool(false))
    );
}

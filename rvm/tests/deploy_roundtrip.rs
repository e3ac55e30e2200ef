// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Deploying a trivial class and materializing it back, from the cache
//! and from replay.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use rvm::KernelConfig;
use rvm_store::Cache;

#[test]
fn deploy_and_reload_a_trivial_class() {
    let h = harness();
    let code = h.kernel.deploy("class A {}").unwrap();

    let location = h.kernel.location_of(code);
    assert!(location.ends_with("_o1"), "got {location}");
    let txid = location.strip_suffix("_o1").unwrap().to_owned();
    assert_eq!(h.kernel.origin_of(code), location);
    assert_eq!(h.kernel.nonce_of(code), 1);
    assert_eq!(h.chain.broadcast_order().len(), 1);

    // The cached state blob has the exact protocol shape.
    let cached = h
        .cache
        .get(&format!("jig://{location}"))
        .unwrap()
        .expect("state was persisted");
    let expected = serde_json::json!({
        "kind": "code",
        "props": {
            "deps": {},
            "location": "_o1",
            "nonce": 1,
            "origin": "_o1",
            "owner": owner_address(),
            "satoshis": 0,
        },
        "src": "class A {}",
        "version": "04",
    });
    assert_eq!(cached, expected);

    // A fresh kernel over the same cache rehydrates it.
    let h2 = sibling(&h, KernelConfig::new().app("test").trust(&txid), true);
    let loaded = h2.kernel.load(&location).unwrap();
    assert_eq!(h2.kernel.src_of(loaded).as_deref(), Some("class A {}"));
    assert_eq!(h2.kernel.location_of(loaded), location);
    assert_eq!(h2.kernel.nonce_of(loaded), 1);

    // A cache-less kernel replays it from the chain and arrives at the
    // same state.
    let h3 = sibling(&h, KernelConfig::new().app("test").trust(&txid), false);
    let replayed = h3.kernel.load(&location).unwrap();
    assert_eq!(h3.kernel.src_of(replayed).as_deref(), Some("class A {}"));
    assert_eq!(h3.kernel.location_of(replayed), location);
    assert_eq!(
        h3.cache.get(&format!("jig://{location}")).unwrap(),
        Some(expected)
    );
}

#[test]
fn loads_memoize_within_a_kernel() {
    let h = harness();
    let code = h.kernel.deploy("class A {}").unwrap();
    let location = h.kernel.location_of(code);

    let first = h.kernel.load(&location).unwrap();
    let second = h.kernel.load(&location).unwrap();
    assert_eq!(first, second);
}

#[test]
fn client_mode_refuses_cache_misses() {
    let h = harness();
    let code = h.kernel.deploy("class A {}").unwrap();
    let location = h.kernel.location_of(code);

    let client = sibling(
        &h,
        KernelConfig::new().app("test").client(true).trust("*"),
        false,
    );
    let err = client.kernel.load(&location).unwrap_err();
    assert!(matches!(err, rvm_shared::RvmError::ClientMode(_)), "{err}");
}

// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Method dispatch through the membrane: recording, nonce bumps,
//! destroy/auth, upgrade, privacy, and forward sync.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use rvm::{KernelConfig, Value};

const COUNTER: &str = "class Counter extends Jig {
    init(start) { this.count = start }
    inc() { this.count += 1 }
    _hidden() { return 1 }
    peek() { return this.count }
}";

#[test]
fn calls_bump_the_nonce_exactly_when_touched() {
    let h = harness();
    let code = h.kernel.deploy(COUNTER).unwrap();
    let jig = h
        .kernel
        .instantiate(code, vec![Value::Int(10)])
        .unwrap();
    assert_eq!(h.kernel.nonce_of(jig), 1);

    h.kernel.call(jig, "inc", vec![]).unwrap();
    assert_eq!(h.kernel.nonce_of(jig), 2);
    assert!(matches!(
        h.kernel.read_prop(jig, "count").unwrap(),
        Value::Int(11)
    ));

    // Even a read-only method call is a recorded action, and a recorded
    // action spends its target.
    let peeked = h.kernel.call(jig, "peek", vec![]).unwrap();
    assert!(matches!(peeked, Value::Int(11)));
    assert_eq!(h.kernel.nonce_of(jig), 3);
}

#[test]
fn private_names_are_hidden_from_the_host() {
    let h = harness();
    let code = h.kernel.deploy(COUNTER).unwrap();
    let jig = h.kernel.instantiate(code, vec![Value::Int(0)]).unwrap();
    h.kernel.call(jig, "inc", vec![]).unwrap();
    assert!(h.kernel.read_prop(jig, "_secret").is_err());
}

#[test]
fn destroy_moves_to_a_deletion_slot() {
    let h = harness();
    let code = h.kernel.deploy(COUNTER).unwrap();
    let jig = h.kernel.instantiate(code, vec![Value::Int(0)]).unwrap();
    h.kernel.destroy(jig).unwrap();

    let location = h.kernel.location_of(jig);
    assert!(location.contains("_d0"), "got {location}");
    assert_eq!(h.kernel.nonce_of(jig), 2);
}

#[test]
fn auth_spends_without_changing_state() {
    let h = harness();
    let code = h.kernel.deploy(COUNTER).unwrap();
    let jig = h.kernel.instantiate(code, vec![Value::Int(5)]).unwrap();
    let before = h.kernel.location_of(jig);

    h.kernel.auth(jig).unwrap();
    let after = h.kernel.location_of(jig);
    assert_ne!(before, after);
    assert_eq!(h.kernel.nonce_of(jig), 2);
    assert!(matches!(
        h.kernel.read_prop(jig, "count").unwrap(),
        Value::Int(5)
    ));
}

#[test]
fn upgrade_keeps_the_origin() {
    let h = harness();
    let code = h.kernel.deploy("class A {}").unwrap();
    let origin = h.kernel.origin_of(code);

    h.kernel.upgrade(code, "class A { two() { return 2 } }").unwrap();
    assert_eq!(h.kernel.origin_of(code), origin);
    assert_ne!(h.kernel.location_of(code), origin);
    assert_eq!(h.kernel.nonce_of(code), 2);
    assert_eq!(
        h.kernel.src_of(code).as_deref(),
        Some("class A { two() { return 2 } }")
    );

    // A replaying kernel sees the upgraded source at the new location.
    let h2 = sibling(&h, KernelConfig::new().app("test").trust("*"), false);
    let loaded = h2.kernel.load(&h.kernel.location_of(code)).unwrap();
    assert_eq!(
        h2.kernel.src_of(loaded).as_deref(),
        Some("class A { two() { return 2 } }")
    );
}

#[test]
fn sync_follows_spend_pointers_forward() {
    let h = harness();
    let code = h.kernel.deploy(COUNTER).unwrap();
    let jig = h.kernel.instantiate(code, vec![Value::Int(0)]).unwrap();
    let v1_location = h.kernel.location_of(jig);

    // A second kernel loads version 1, then the first kernel advances.
    let h2 = sibling(&h, KernelConfig::new().app("test").trust("*"), false);
    let stale = h2.kernel.load(&v1_location).unwrap();
    assert_eq!(h2.kernel.nonce_of(stale), 1);

    h.kernel.call(jig, "inc", vec![]).unwrap();
    h.kernel.call(jig, "inc", vec![]).unwrap();

    let fresh = h2.kernel.sync(stale).unwrap();
    assert_eq!(h2.kernel.nonce_of(fresh), 3);
    assert_eq!(h2.kernel.location_of(fresh), h.kernel.location_of(jig));
    assert!(matches!(
        h2.kernel.read_prop(fresh, "count").unwrap(),
        Value::Int(2)
    ));
}

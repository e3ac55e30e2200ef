// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Berries: plucked through a class, content-addressed by state hash,
//! immutable afterwards.

mod common;

use common::*;
use pretty_assertions::assert_eq;
use rvm::Value;
use rvm_shared::Location;

const SNIPPET: &str = "class Snippet extends Berry {
    init(text) { this.text = text }
    poke() { this.text = 'changed' }
    static pluck(path) { return new Snippet(path) }
}";

#[test]
fn pluck_through_a_supplied_class() {
    let h = harness();
    let code = h.kernel.deploy(SNIPPET).unwrap();
    let berry = h.kernel.load_berry_with_class(code, "hello").unwrap();

    assert!(matches!(
        h.kernel.read_prop(berry, "text").unwrap(),
        Value::Str(s) if s == "hello"
    ));

    let location = h.kernel.location_of(berry);
    let parsed = Location::parse(&location).unwrap();
    let Location::Berry { path, version, .. } = parsed else {
        panic!("not a berry location: {location}");
    };
    assert_eq!(path, "hello");
    assert_eq!(version, 5);
    assert_eq!(h.kernel.nonce_of(berry), 1);
}

#[test]
fn plucked_berries_reload_from_the_cache() {
    let h = harness();
    let code = h.kernel.deploy(SNIPPET).unwrap();
    let berry = h.kernel.load_berry_with_class(code, "again").unwrap();
    let location = h.kernel.location_of(berry);

    // A sibling kernel sharing the cache rehydrates the berry from its
    // cached state blob.
    let h2 = sibling(
        &h,
        rvm::KernelConfig::new().app("test").trust("*"),
        true,
    );
    let reloaded = h2.kernel.load(&location).unwrap();
    assert!(matches!(
        h2.kernel.read_prop(reloaded, "text").unwrap(),
        Value::Str(s) if s == "again"
    ));
    assert_eq!(h2.kernel.location_of(reloaded), location);
}

#[test]
fn berries_are_immutable() {
    let h = harness();
    let code = h.kernel.deploy(SNIPPET).unwrap();
    let berry = h.kernel.load_berry_with_class(code, "frozen").unwrap();

    let before = h.chain.broadcast_order().len();
    let err = h.kernel.call(berry, "poke", vec![]).unwrap_err();
    assert!(err.to_string().contains("immutable"), "{err}");
    // No transaction was attempted for the berry call.
    assert_eq!(h.chain.broadcast_order().len(), before);
}

#[test]
fn berry_constructors_refuse_outside_pluck() {
    let h = harness();
    let code = h.kernel.deploy(SNIPPET).unwrap();
    let err = h.kernel.instantiate(code, vec![Value::str("x")]).unwrap_err();
    assert!(err.to_string().contains("pluck"), "{err}");
}

#[test]
fn plucks_can_fetch_transactions() {
    let h = harness();
    // Install something fetchable, then pluck a berry of its raw bytes.
    let probe = craft_run_tx(
        &[],
        &rvm_shared::metadata::Payload::new(
            "probe",
            rvm_shared::metadata::Metadata {
                inputs: 0,
                refs: vec![],
                out: vec![],
                del: vec![],
                cre: vec![],
                exec: vec![],
            },
        ),
    );
    let txid = h.chain.install(&probe);

    let src = "class TxBerry extends Berry {
        init(raw) { this.raw = raw }
        static pluck(path) { return new TxBerry(fetch(path)) }
    }";
    let code = h.kernel.deploy(src).unwrap();
    let berry = h.kernel.load_berry_with_class(code, &txid).unwrap();
    let Value::Str(raw) = h.kernel.read_prop(berry, "raw").unwrap() else {
        panic!("raw is not a string");
    };
    assert_eq!(raw, probe.to_hex());
}

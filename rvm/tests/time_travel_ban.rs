// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Replay must reject transactions that reference a creation at an older
//! version than one reachable through the supplied state — and ban the
//! requested location.

mod common;

use common::*;
use rvm::Value;
use rvm_shared::metadata::{Action, Metadata, Opcode, Payload};
use rvm_store::Cache;

const SRC: &str = "class C extends Jig {
    init() { this.n = 0 }
    touch() { this.n += 1 }
    keep(other) { this.peer = other }
}";

#[test]
fn replay_rejects_time_travel_and_bans_the_location() {
    let h = harness();
    let code = h.kernel.deploy(SRC).unwrap();
    let j = h.kernel.instantiate(code, vec![]).unwrap();
    let k = h.kernel.instantiate(code, vec![]).unwrap();
    let j_v1_location = h.kernel.location_of(j);

    // K holds a reference to J; then J advances; then K advances so its
    // latest state points at the newer J.
    h.kernel.call(k, "keep", vec![Value::Creation(j)]).unwrap();
    h.kernel.call(j, "touch", vec![]).unwrap();
    h.kernel.call(k, "touch", vec![]).unwrap();
    assert_eq!(h.kernel.nonce_of(j), 2);
    assert_eq!(h.kernel.nonce_of(k), 3);
    let k_latest = h.kernel.location_of(k);

    // Craft a transaction that spends J at version 1 while referencing
    // the K whose state embeds J at version 2.
    let metadata = Metadata {
        inputs: 1,
        refs: vec![k_latest],
        out: vec!["00".repeat(32)],
        del: vec![],
        cre: vec![],
        exec: vec![Action {
            op: Opcode::Call,
            data: serde_json::json!([{"$jig": 0}, "touch", []]),
        }],
    };
    let tx = craft_run_tx(
        &[outpoint_of(&j_v1_location)],
        &Payload::new("test", metadata),
    );
    let txid = h.chain.install(&tx);
    let target = format!("{txid}_o1");

    let err = h.kernel.load(&target).unwrap_err();
    assert!(
        err.to_string().contains("Time travel"),
        "unexpected error: {err}"
    );

    let ban = h
        .cache
        .get(&format!("ban://{target}"))
        .unwrap()
        .expect("ban was written");
    assert!(ban.get("reason").is_some(), "ban entry: {ban}");
}

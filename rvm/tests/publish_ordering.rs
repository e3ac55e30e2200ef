// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Dependent commits broadcast in dependency order, publish events fire
//! exactly once, and an upstream failure poisons the whole chain.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::*;
use pretty_assertions::assert_eq;
use rvm::externs::Blockchain;
use rvm::{EventKind, KernelConfig};
use rvm_shared::metadata::Opcode;
use rvm_shared::transaction::Tx;

fn ops_of(h: &Harness, txid: &str) -> Vec<Opcode> {
    let rawtx = h.chain.fetch(txid).unwrap();
    let tx = Tx::from_hex(&rawtx).unwrap();
    let (_, payload) = rvm::tx::find_run_payload(&tx).unwrap();
    payload.metadata.exec.iter().map(|a| a.op).collect()
}

#[test]
fn downstream_commits_wait_for_upstream() {
    let h = harness_with(KernelConfig::new().app("test").auto_publish(false));

    let published: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = published.clone();
    h.kernel.on(EventKind::Publish, move |event| {
        sink.borrow_mut().push(event.location.clone());
    });

    // C1 deploys the class; C2 instantiates it, so C2 depends on C1.
    let code = h.kernel.deploy("class A extends Jig {}").unwrap();
    let jig = h.kernel.instantiate(code, vec![]).unwrap();
    assert!(h.chain.broadcast_order().is_empty());

    h.kernel.sync_all().unwrap();

    let order = h.chain.broadcast_order();
    assert_eq!(order.len(), 2);
    assert_eq!(ops_of(&h, &order[0]), vec![Opcode::Deploy]);
    assert_eq!(ops_of(&h, &order[1]), vec![Opcode::New]);

    // One publish event per creation.
    let code_location = h.kernel.location_of(code);
    let jig_location = h.kernel.location_of(jig);
    let events = published.borrow();
    assert_eq!(events.len(), 2);
    assert_eq!(
        events.iter().filter(|l| **l == code_location).count(),
        1
    );
    assert_eq!(events.iter().filter(|l| **l == jig_location).count(), 1);
}

#[test]
fn upstream_failure_poisons_downstream_outputs() {
    let h = harness_with(KernelConfig::new().app("test").auto_publish(false));
    let code = h.kernel.deploy("class A extends Jig {}").unwrap();
    let jig = h.kernel.instantiate(code, vec![]).unwrap();

    h.purse.fail_next_pay.set(true);
    let err = h.kernel.sync_all().unwrap_err();
    assert!(err.to_string().contains("purse"), "{err}");

    assert!(h.chain.broadcast_order().is_empty());
    assert!(
        h.kernel.location_of(code).starts_with("error://Unhandled"),
        "{}",
        h.kernel.location_of(code)
    );
    assert!(
        h.kernel.location_of(jig).starts_with("error://Unhandled"),
        "{}",
        h.kernel.location_of(jig)
    );
}

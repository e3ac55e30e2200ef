// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Mapping between transactions and creation slots.
//!
//! The run payload rides in one output; outputs before it count into
//! `vrun`, and jig slot `_o<n>` maps to transaction output `vrun + n`.

use rvm_shared::metadata::Payload;
use rvm_shared::transaction::Tx;
use rvm_shared::{Location, Result, RvmError, Slot, Txid};

/// Output value floor. Whether miners accept this at all sizes is a
/// policy assumption; isolate it here.
pub fn calculate_dust(_script_len: usize) -> u64 {
    1
}

/// Finds the run payload output. Returns its index (`vrun`) and the
/// parsed payload.
pub fn find_run_payload(tx: &Tx) -> Option<(u32, Payload)> {
    for (i, output) in tx.outputs.iter().enumerate() {
        if let Ok(payload) = Payload::from_script(&output.script) {
            return Some((i as u32, payload));
        }
    }
    None
}

/// The transaction output index backing a slot. Deletion slots have no
/// output.
pub fn slot_vout(vrun: u32, slot: Slot) -> Option<u32> {
    match slot {
        Slot::Output(n) => Some(vrun + n),
        Slot::Deleted(_) => None,
    }
}

/// The location spent by an outpoint of a run transaction.
pub fn outpoint_location(prev_tx: &Tx, prev_txid: &str, vout: u32) -> Result<Location> {
    let (vrun, _) = find_run_payload(prev_tx).ok_or_else(|| {
        RvmError::execution(format!("{prev_txid} is not a run transaction"))
    })?;
    if vout <= vrun {
        return Err(RvmError::execution(format!(
            "output {vout} of {prev_txid} is not a jig output"
        )));
    }
    Ok(Location::Jig {
        txid: Txid::parse(prev_txid).map_err(|e| RvmError::argument(e.to_string()))?,
        slot: Slot::Output(vout - vrun),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvm_shared::metadata::Metadata;
    use rvm_shared::transaction::TxOut;

    fn run_tx() -> Tx {
        let payload = Payload::new(
            "app",
            Metadata {
                inputs: 0,
                refs: vec![],
                out: vec!["ab".repeat(32)],
                del: vec![],
                cre: vec![],
                exec: vec![],
            },
        );
        Tx {
            version: 1,
            inputs: vec![],
            outputs: vec![
                TxOut {
                    satoshis: 0,
                    script: payload.to_script(),
                },
                TxOut {
                    satoshis: 1,
                    script: vec![0x51],
                },
            ],
            locktime: 0,
        }
    }

    #[test]
    fn payload_discovery_and_vrun() {
        let tx = run_tx();
        let (vrun, payload) = find_run_payload(&tx).unwrap();
        assert_eq!(vrun, 0);
        assert_eq!(payload.metadata.out.len(), 1);
        assert_eq!(slot_vout(vrun, Slot::Output(1)), Some(1));
        assert_eq!(slot_vout(vrun, Slot::Deleted(0)), None);
    }

    #[test]
    fn outpoint_locations_subtract_vrun() {
        let tx = run_tx();
        let txid = tx.txid();
        let loc = outpoint_location(&tx, &txid, 1).unwrap();
        assert_eq!(loc.compile(), format!("{txid}_o1"));
        assert!(outpoint_location(&tx, &txid, 0).is_err());
    }

    #[test]
    fn non_run_transactions_are_detected() {
        let tx = Tx::new();
        assert!(find_run_payload(&tx).is_none());
    }
}

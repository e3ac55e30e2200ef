// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::collections::VecDeque;

use serde_json::{json, Value};

use rvm_shared::transaction::{Tx, Utxo};

/// How long a broadcast papers over indexer lag.
pub const DEFAULT_EXPIRATION_MS: u64 = 10_000;

/// One remembered broadcast.
#[derive(Clone, PartialEq, Debug)]
pub struct RecentBroadcast {
    pub rawtx: String,
    pub txid: String,
    pub time: u64,
    /// Outpoints this transaction spent.
    pub inputs: Vec<(String, u32)>,
    /// Outputs this transaction created.
    pub outputs: Vec<Utxo>,
}

/// A ring of recently broadcast transactions, used to correct UTXO
/// listings while the indexer catches up.
#[derive(Clone, PartialEq, Debug)]
pub struct RecentBroadcasts {
    entries: VecDeque<RecentBroadcast>,
    expiration_ms: u64,
}

impl RecentBroadcasts {
    pub fn new() -> Self {
        Self::with_expiration(DEFAULT_EXPIRATION_MS)
    }

    pub fn with_expiration(expiration_ms: u64) -> Self {
        RecentBroadcasts {
            entries: VecDeque::new(),
            expiration_ms,
        }
    }

    pub fn record(&mut self, tx: &Tx, time: u64) {
        let txid = tx.txid();
        let inputs = tx
            .inputs
            .iter()
            .map(|i| (i.prev_txid.clone(), i.prev_vout))
            .collect();
        let outputs = tx
            .outputs
            .iter()
            .enumerate()
            .map(|(vout, o)| Utxo {
                txid: txid.clone(),
                vout: vout as u32,
                script: hex::encode(&o.script),
                satoshis: o.satoshis,
            })
            .collect();
        self.entries.push_back(RecentBroadcast {
            rawtx: tx.to_hex(),
            txid,
            time,
            inputs,
            outputs,
        });
    }

    pub fn expire(&mut self, now: u64) {
        while let Some(front) = self.entries.front() {
            if now.saturating_sub(front.time) >= self.expiration_ms {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn live(&self, now: u64) -> impl Iterator<Item = &RecentBroadcast> {
        self.entries
            .iter()
            .filter(move |e| now.saturating_sub(e.time) < self.expiration_ms)
    }

    /// Augments an oracle UTXO listing with recent outputs paying the
    /// script, then drops outpoints already spent by a recent broadcast.
    pub fn correct_utxos(&self, script_hex: &str, mut utxos: Vec<Utxo>, now: u64) -> Vec<Utxo> {
        for entry in self.live(now) {
            for output in &entry.outputs {
                if output.script == script_hex
                    && !utxos
                        .iter()
                        .any(|u| u.txid == output.txid && u.vout == output.vout)
                {
                    utxos.push(output.clone());
                }
            }
        }
        utxos.retain(|u| {
            !self
                .live(now)
                .any(|e| e.inputs.iter().any(|(t, v)| *t == u.txid && *v == u.vout))
        });
        utxos
    }

    /// The recent raw transaction for a txid, if still remembered.
    pub fn rawtx(&self, txid: &str, now: u64) -> Option<String> {
        self.live(now)
            .find(|e| e.txid == txid)
            .map(|e| e.rawtx.clone())
    }

    pub fn to_json(&self) -> Value {
        Value::Array(
            self.entries
                .iter()
                .map(|e| {
                    json!({
                        "rawtx": e.rawtx,
                        "txid": e.txid,
                        "time": e.time,
                        "inputs": e.inputs.iter()
                            .map(|(t, v)| json!({"txid": t, "vout": v}))
                            .collect::<Vec<_>>(),
                        "outputs": e.outputs.iter()
                            .map(|u| json!({
                                "txid": u.txid,
                                "vout": u.vout,
                                "script": u.script,
                                "satoshis": u.satoshis,
                            }))
                            .collect::<Vec<_>>(),
                    })
                })
                .collect(),
        )
    }

    pub fn from_json(value: &Value, expiration_ms: u64) -> Option<Self> {
        let mut entries = VecDeque::new();
        for e in value.as_array()? {
            let inputs = e
                .get("inputs")?
                .as_array()?
                .iter()
                .map(|i| {
                    Some((
                        i.get("txid")?.as_str()?.to_owned(),
                        i.get("vout")?.as_u64()? as u32,
                    ))
                })
                .collect::<Option<_>>()?;
            let outputs = e
                .get("outputs")?
                .as_array()?
                .iter()
                .map(|o| {
                    Some(Utxo {
                        txid: o.get("txid")?.as_str()?.to_owned(),
                        vout: o.get("vout")?.as_u64()? as u32,
                        script: o.get("script")?.as_str()?.to_owned(),
                        satoshis: o.get("satoshis")?.as_u64()?,
                    })
                })
                .collect::<Option<_>>()?;
            entries.push_back(RecentBroadcast {
                rawtx: e.get("rawtx")?.as_str()?.to_owned(),
                txid: e.get("txid")?.as_str()?.to_owned(),
                time: e.get("time")?.as_u64()?,
                inputs,
                outputs,
            });
        }
        Some(RecentBroadcasts {
            entries,
            expiration_ms,
        })
    }
}

impl Default for RecentBroadcasts {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rvm_shared::transaction::{TxIn, TxOut};

    fn payment_tx(prev_txid: &str, prev_vout: u32, script: &[u8]) -> Tx {
        Tx {
            version: 1,
            inputs: vec![TxIn {
                prev_txid: prev_txid.into(),
                prev_vout,
                script_sig: vec![],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![TxOut {
                satoshis: 1000,
                script: script.to_vec(),
            }],
            locktime: 0,
        }
    }

    #[test]
    fn broadcast_outputs_appear_in_listings() {
        let mut ring = RecentBroadcasts::new();
        let tx = payment_tx(&"22".repeat(32), 0, &[0x51]);
        ring.record(&tx, 1000);

        let corrected = ring.correct_utxos("51", vec![], 1001);
        assert_eq!(corrected.len(), 1);
        assert_eq!(corrected[0].txid, tx.txid());
        assert_eq!(corrected[0].vout, 0);

        // A different script is untouched.
        assert!(ring.correct_utxos("52", vec![], 1001).is_empty());
    }

    #[test]
    fn spent_outpoints_are_filtered() {
        let mut ring = RecentBroadcasts::new();
        let parent = payment_tx(&"33".repeat(32), 0, &[0x51]);
        ring.record(&parent, 1000);
        let child = payment_tx(&parent.txid(), 0, &[0x52]);
        ring.record(&child, 1001);

        // The indexer still lists the parent's output; the ring knows the
        // child spent it.
        let stale = vec![Utxo {
            txid: parent.txid(),
            vout: 0,
            script: "51".into(),
            satoshis: 1000,
        }];
        assert!(ring.correct_utxos("51", stale, 1002).is_empty());
    }

    #[test]
    fn entries_expire() {
        let mut ring = RecentBroadcasts::with_expiration(100);
        let tx = payment_tx(&"44".repeat(32), 0, &[0x51]);
        ring.record(&tx, 1000);
        assert_eq!(ring.correct_utxos("51", vec![], 1099).len(), 1);
        assert!(ring.correct_utxos("51", vec![], 1100).is_empty());

        ring.expire(1100);
        assert!(ring.rawtx(&tx.txid(), 1100).is_none());
    }

    #[test]
    fn json_roundtrip() {
        let mut ring = RecentBroadcasts::new();
        ring.record(&payment_tx(&"55".repeat(32), 1, &[0x51, 0x52]), 42);
        let restored =
            RecentBroadcasts::from_json(&ring.to_json(), DEFAULT_EXPIRATION_MS).unwrap();
        assert_eq!(restored, ring);
    }
}

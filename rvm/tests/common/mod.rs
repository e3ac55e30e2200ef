// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Dummy oracles and a test harness for end-to-end scenarios.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use anyhow::anyhow;

use rvm::externs::{Blockchain, OwnerWallet, Purse};
use rvm::{Kernel, KernelConfig};
use rvm_shared::lock::{Owner, P2pkhLock};
use rvm_shared::metadata::Payload;
use rvm_shared::transaction::{Tx, TxIn, TxOut, Utxo};
use rvm_store::MemoryCache;

/// An in-memory chain that accepts anything broadcast to it.
pub struct MockChain {
    txs: RefCell<HashMap<String, String>>,
    spends: RefCell<HashMap<(String, u32), String>>,
    pub broadcast_log: RefCell<Vec<String>>,
    pub fail_next_broadcast: Cell<bool>,
}

impl MockChain {
    pub fn new() -> Rc<Self> {
        Rc::new(MockChain {
            txs: RefCell::new(HashMap::new()),
            spends: RefCell::new(HashMap::new()),
            broadcast_log: RefCell::new(Vec::new()),
            fail_next_broadcast: Cell::new(false),
        })
    }

    /// Installs a transaction as if it had been mined, without going
    /// through broadcast.
    pub fn install(&self, tx: &Tx) -> String {
        let txid = tx.txid();
        self.txs.borrow_mut().insert(txid.clone(), tx.to_hex());
        for input in &tx.inputs {
            self.spends
                .borrow_mut()
                .insert((input.prev_txid.clone(), input.prev_vout), txid.clone());
        }
        txid
    }

    pub fn broadcast_order(&self) -> Vec<String> {
        self.broadcast_log.borrow().clone()
    }
}

impl Blockchain for MockChain {
    fn network(&self) -> &str {
        "mock"
    }

    fn broadcast(&self, rawtx: &str) -> anyhow::Result<String> {
        if self.fail_next_broadcast.take() {
            return Err(anyhow!("mock broadcast refused"));
        }
        let tx = Tx::from_hex(rawtx).map_err(|e| anyhow!("bad rawtx: {e}"))?;
        let txid = self.install(&tx);
        self.broadcast_log.borrow_mut().push(txid.clone());
        Ok(txid)
    }

    fn fetch(&self, txid: &str) -> anyhow::Result<String> {
        self.txs
            .borrow()
            .get(txid)
            .cloned()
            .ok_or_else(|| anyhow!("unknown txid {txid}"))
    }

    fn utxos(&self, script_hex: &str) -> anyhow::Result<Vec<Utxo>> {
        let mut out = Vec::new();
        for (txid, rawtx) in self.txs.borrow().iter() {
            let tx = Tx::from_hex(rawtx).map_err(|e| anyhow!("bad stored tx: {e}"))?;
            for (vout, output) in tx.outputs.iter().enumerate() {
                let vout = vout as u32;
                if hex::encode(&output.script) == script_hex
                    && !self.spends.borrow().contains_key(&(txid.clone(), vout))
                {
                    out.push(Utxo {
                        txid: txid.clone(),
                        vout,
                        script: script_hex.to_owned(),
                        satoshis: output.satoshis,
                    });
                }
            }
        }
        Ok(out)
    }

    fn spends(&self, txid: &str, vout: u32) -> anyhow::Result<Option<String>> {
        Ok(self.spends.borrow().get(&(txid.to_owned(), vout)).cloned())
    }

    fn time(&self, _txid: &str) -> anyhow::Result<u64> {
        Ok(0)
    }
}

/// Signs nothing: the mock chain never validates scripts.
pub struct MockOwner {
    pub lock: P2pkhLock,
}

impl MockOwner {
    pub fn new() -> Rc<Self> {
        Rc::new(MockOwner {
            lock: P2pkhLock {
                pubkey_hash: [7; 20],
                testnet: false,
            },
        })
    }
}

impl OwnerWallet for MockOwner {
    fn sign(
        &self,
        rawtx: &str,
        _parents: &[Utxo],
        _locks: &[Option<Owner>],
    ) -> anyhow::Result<String> {
        Ok(rawtx.to_owned())
    }

    fn next_owner(&self) -> anyhow::Result<Owner> {
        Ok(Owner::Address(self.lock))
    }
}

pub struct MockPurse {
    pub fail_next_pay: Cell<bool>,
    pub cancelled: RefCell<Vec<String>>,
}

impl MockPurse {
    pub fn new() -> Rc<Self> {
        Rc::new(MockPurse {
            fail_next_pay: Cell::new(false),
            cancelled: RefCell::new(Vec::new()),
        })
    }
}

impl Purse for MockPurse {
    fn pay(&self, rawtx: &str, _parents: &[Utxo]) -> anyhow::Result<String> {
        if self.fail_next_pay.take() {
            return Err(anyhow!("mock purse is empty"));
        }
        Ok(rawtx.to_owned())
    }

    fn cancel(&self, rawtx: &str) -> anyhow::Result<()> {
        self.cancelled.borrow_mut().push(rawtx.to_owned());
        Ok(())
    }
}

pub struct Harness {
    pub chain: Rc<MockChain>,
    pub cache: Rc<MemoryCache>,
    pub owner: Rc<MockOwner>,
    pub purse: Rc<MockPurse>,
    pub kernel: Rc<Kernel>,
}

pub fn harness() -> Harness {
    harness_with(KernelConfig::new().app("test"))
}

pub fn harness_with(config: KernelConfig) -> Harness {
    let chain = MockChain::new();
    let cache = Rc::new(MemoryCache::new());
    build(chain, cache, config)
}

/// A second kernel over the same chain; optionally sharing the cache.
pub fn sibling(h: &Harness, config: KernelConfig, share_cache: bool) -> Harness {
    let cache = if share_cache {
        h.cache.clone()
    } else {
        Rc::new(MemoryCache::new())
    };
    build(h.chain.clone(), cache, config)
}

fn build(chain: Rc<MockChain>, cache: Rc<MemoryCache>, config: KernelConfig) -> Harness {
    let owner = MockOwner::new();
    let purse = MockPurse::new();
    let kernel = Kernel::new(
        config,
        chain.clone(),
        cache.clone(),
        None,
        owner.clone(),
        purse.clone(),
    );
    Harness {
        chain,
        cache,
        owner,
        purse,
        kernel,
    }
}

pub fn owner_address() -> String {
    P2pkhLock {
        pubkey_hash: [7; 20],
        testnet: false,
    }
    .address()
}

/// Assembles a transaction that spends the given outpoints and carries
/// the payload at output zero.
pub fn craft_run_tx(inputs: &[(String, u32)], payload: &Payload) -> Tx {
    Tx {
        version: 1,
        inputs: inputs
            .iter()
            .map(|(txid, vout)| TxIn {
                prev_txid: txid.clone(),
                prev_vout: *vout,
                script_sig: vec![],
                sequence: 0xffff_ffff,
            })
            .collect(),
        outputs: vec![TxOut {
            satoshis: 0,
            script: payload.to_script(),
        }],
        locktime: 0,
    }
}

/// The outpoint behind a `txid_oN` location, assuming the payload rides
/// at output zero (true for every transaction this runtime builds).
pub fn outpoint_of(location: &str) -> (String, u32) {
    let location = rvm_shared::Location::parse(location).expect("test location");
    let rvm_shared::Location::Jig { txid, slot } = location else {
        panic!("not a jig location");
    };
    (txid.to_string(), slot.index())
}

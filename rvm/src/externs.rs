// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The oracle boundary.
//!
//! Everything the runtime cannot compute deterministically is delegated to
//! these traits. Implementations are supplied by the node embedding the
//! runtime; the kernel never constructs one itself. Failures are `anyhow`
//! here and classified into the runtime taxonomy by callers.

use serde_json::Value;

use rvm_shared::lock::Owner;
use rvm_shared::transaction::Utxo;

/// Transaction fetching, broadcasting and UTXO status.
pub trait Blockchain {
    /// The network name, e.g. `"main"` or `"test"`.
    fn network(&self) -> &str;

    /// Broadcasts a raw transaction, returning its txid.
    fn broadcast(&self, rawtx: &str) -> anyhow::Result<String>;

    /// Fetches a raw transaction by txid.
    fn fetch(&self, txid: &str) -> anyhow::Result<String>;

    /// Unspent outputs paying the given script.
    fn utxos(&self, script_hex: &str) -> anyhow::Result<Vec<Utxo>>;

    /// The txid spending an outpoint, or `None` while unspent.
    fn spends(&self, txid: &str, vout: u32) -> anyhow::Result<Option<String>>;

    /// Block time of a transaction in milliseconds.
    fn time(&self, txid: &str) -> anyhow::Result<u64>;
}

/// Optional enrichment over the cache: a remote state server.
pub trait StateSource {
    /// Pulls a value by cache key.
    fn pull(&self, key: &str) -> anyhow::Result<Option<Value>>;

    /// Known locations for a script, newest first.
    fn locations(&self, _script_hex: &str) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Invoked after every successful broadcast.
    fn broadcast(&self, _rawtx: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The signing wallet for jig owners.
pub trait OwnerWallet {
    /// Signs the jig inputs of a raw transaction. `parents` carries the
    /// locking script and satoshis for each input, `locks` the owner lock
    /// for inputs the wallet is expected to sign (None for purse inputs).
    fn sign(
        &self,
        rawtx: &str,
        parents: &[Utxo],
        locks: &[Option<Owner>],
    ) -> anyhow::Result<String>;

    /// The owner assigned to newly created creations.
    fn next_owner(&self) -> anyhow::Result<Owner>;
}

/// The funding wallet.
pub trait Purse {
    /// Adds funding inputs and change outputs, signing what it adds.
    fn pay(&self, rawtx: &str, parents: &[Utxo]) -> anyhow::Result<String>;

    /// Invoked after every successful broadcast.
    fn broadcast(&self, _rawtx: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Invoked when a paid transaction will never broadcast, so the purse
    /// can reclaim its inputs.
    fn cancel(&self, _rawtx: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

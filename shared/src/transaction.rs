// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! A minimal Bitcoin transaction model.
//!
//! Only what the runtime itself needs: enough serialization to compute
//! txids, locate the run payload output, and hand unsigned skeletons to
//! the owner and purse collaborators. Script semantics live elsewhere.

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxError {
    #[error("truncated transaction")]
    Truncated,
    #[error("invalid hex: {0}")]
    BadHex(String),
}

/// An unspent output as reported by the blockchain oracle.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    /// Locking script, hex.
    pub script: String,
    pub satoshis: u64,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TxIn {
    /// Previous txid, display order (big-endian hex).
    pub prev_txid: String,
    pub prev_vout: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TxOut {
    pub satoshis: u64,
    pub script: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Tx {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub locktime: u32,
}

impl Tx {
    pub fn new() -> Self {
        Tx {
            version: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
            locktime: 0,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        write_varint(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            let mut prev = hex_to_txid_bytes(&input.prev_txid).unwrap_or([0; 32]);
            prev.reverse();
            out.extend_from_slice(&prev);
            out.extend_from_slice(&input.prev_vout.to_le_bytes());
            write_varint(&mut out, input.script_sig.len() as u64);
            out.extend_from_slice(&input.script_sig);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_varint(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            out.extend_from_slice(&output.satoshis.to_le_bytes());
            write_varint(&mut out, output.script.len() as u64);
            out.extend_from_slice(&output.script);
        }
        out.extend_from_slice(&self.locktime.to_le_bytes());
        out
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TxError> {
        let mut r = Reader(bytes);
        let version = r.u32()?;
        let n_in = r.varint()?;
        let mut inputs = Vec::with_capacity(n_in as usize);
        for _ in 0..n_in {
            let mut prev = r.array::<32>()?;
            prev.reverse();
            let prev_vout = r.u32()?;
            let len = r.varint()? as usize;
            let script_sig = r.take(len)?.to_vec();
            let sequence = r.u32()?;
            inputs.push(TxIn {
                prev_txid: hex::encode(prev),
                prev_vout,
                script_sig,
                sequence,
            });
        }
        let n_out = r.varint()?;
        let mut outputs = Vec::with_capacity(n_out as usize);
        for _ in 0..n_out {
            let satoshis = r.u64()?;
            let len = r.varint()? as usize;
            let script = r.take(len)?.to_vec();
            outputs.push(TxOut { satoshis, script });
        }
        let locktime = r.u32()?;
        if !r.0.is_empty() {
            return Err(TxError::Truncated);
        }
        Ok(Tx {
            version,
            inputs,
            outputs,
            locktime,
        })
    }

    pub fn from_hex(s: &str) -> Result<Self, TxError> {
        let bytes = hex::decode(s).map_err(|_| TxError::BadHex(s.into()))?;
        Self::from_bytes(&bytes)
    }

    /// The display-order txid: reversed double-SHA-256 of the serialized
    /// transaction.
    pub fn txid(&self) -> String {
        let first = Sha256::digest(self.to_bytes());
        let mut second: [u8; 32] = Sha256::digest(first).into();
        second.reverse();
        hex::encode(second)
    }
}

impl Default for Tx {
    fn default() -> Self {
        Tx::new()
    }
}

fn hex_to_txid_bytes(s: &str) -> Option<[u8; 32]> {
    let mut raw = [0u8; 32];
    hex::decode_to_slice(s, &mut raw).ok()?;
    Some(raw)
}

fn write_varint(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x10000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], TxError> {
        if self.0.len() < n {
            return Err(TxError::Truncated);
        }
        let (head, rest) = self.0.split_at(n);
        self.0 = rest;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], TxError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, TxError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, TxError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn varint(&mut self) -> Result<u64, TxError> {
        let first = self.take(1)?[0];
        Ok(match first {
            0xfd => u16::from_le_bytes(self.array()?) as u64,
            0xfe => u32::from_le_bytes(self.array()?) as u64,
            0xff => u64::from_le_bytes(self.array()?),
            n => n as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Tx {
        Tx {
            version: 1,
            inputs: vec![TxIn {
                prev_txid: "11".repeat(32),
                prev_vout: 3,
                script_sig: vec![0x51],
                sequence: 0xffff_ffff,
            }],
            outputs: vec![
                TxOut {
                    satoshis: 0,
                    script: vec![0x00, 0x6a],
                },
                TxOut {
                    satoshis: 546,
                    script: vec![0x76, 0xa9],
                },
            ],
            locktime: 0,
        }
    }

    #[test]
    fn bytes_roundtrip() {
        let tx = sample();
        assert_eq!(Tx::from_bytes(&tx.to_bytes()).unwrap(), tx);
        assert_eq!(Tx::from_hex(&tx.to_hex()).unwrap(), tx);
    }

    #[test]
    fn txid_is_stable_and_hexadecimal() {
        let tx = sample();
        let txid = tx.txid();
        assert_eq!(txid.len(), 64);
        assert_eq!(txid, tx.txid());
        assert!(txid.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')));
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let mut bytes = sample().to_bytes();
        bytes.push(0);
        assert_eq!(Tx::from_bytes(&bytes), Err(TxError::Truncated));
    }

    #[test]
    fn empty_tx_roundtrip() {
        let tx = Tx::new();
        assert_eq!(Tx::from_bytes(&tx.to_bytes()).unwrap(), tx);
    }
}

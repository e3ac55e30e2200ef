// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Owner locks.
//!
//! A lock is anything that can produce an output script and an upper bound
//! on its unlocking script size (used to pad transactions so purse fees are
//! predictable). Address strings coerce to the standard P2PKH lock.

use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid script hex: {0}")]
    InvalidScript(String),
}

/// A value that can lock a transaction output.
pub trait Lock {
    /// The locking script, raw bytes.
    fn script(&self) -> Vec<u8>;

    /// Upper bound on the unlocking script size in bytes.
    fn domain(&self) -> usize;
}

const BASE58_ALPHABET: &[u8; 58] =
    b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

const MAINNET_P2PKH: u8 = 0x00;
const TESTNET_P2PKH: u8 = 0x6f;

/// The standard pay-to-pubkey-hash lock.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct P2pkhLock {
    pub pubkey_hash: [u8; 20],
    pub testnet: bool,
}

impl P2pkhLock {
    /// Validates a base58check address and coerces it to a lock.
    pub fn from_address(addr: &str) -> Result<Self, LockError> {
        let raw = base58check_decode(addr)
            .ok_or_else(|| LockError::InvalidAddress(addr.into()))?;
        if raw.len() != 21 {
            return Err(LockError::InvalidAddress(addr.into()));
        }
        let testnet = match raw[0] {
            MAINNET_P2PKH => false,
            TESTNET_P2PKH => true,
            _ => return Err(LockError::InvalidAddress(addr.into())),
        };
        let mut pubkey_hash = [0u8; 20];
        pubkey_hash.copy_from_slice(&raw[1..]);
        Ok(P2pkhLock {
            pubkey_hash,
            testnet,
        })
    }

    pub fn address(&self) -> String {
        let mut raw = Vec::with_capacity(21);
        raw.push(if self.testnet {
            TESTNET_P2PKH
        } else {
            MAINNET_P2PKH
        });
        raw.extend_from_slice(&self.pubkey_hash);
        base58check_encode(&raw)
    }
}

impl Lock for P2pkhLock {
    fn script(&self) -> Vec<u8> {
        // OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG
        let mut s = Vec::with_capacity(25);
        s.extend_from_slice(&[0x76, 0xa9, 0x14]);
        s.extend_from_slice(&self.pubkey_hash);
        s.extend_from_slice(&[0x88, 0xac]);
        s
    }

    fn domain(&self) -> usize {
        // Push of a 72-byte DER signature plus push of a 33-byte pubkey,
        // rounded up one byte the way the historical client did.
        108
    }
}

impl fmt::Debug for P2pkhLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P2pkhLock({})", self.address())
    }
}

/// A lock described directly by its script. The escape hatch for
/// non-standard owners.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ScriptLock {
    pub script: Vec<u8>,
    pub domain: usize,
}

impl Lock for ScriptLock {
    fn script(&self) -> Vec<u8> {
        self.script.clone()
    }

    fn domain(&self) -> usize {
        self.domain
    }
}

/// An owner as it appears in metadata `cre` entries and on bindings.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Owner {
    Address(P2pkhLock),
    Script(ScriptLock),
}

impl Owner {
    /// Coerce a metadata entry: strings are addresses, objects carry an
    /// explicit script and domain.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, LockError> {
        match value {
            serde_json::Value::String(s) => Ok(Owner::Address(P2pkhLock::from_address(s)?)),
            serde_json::Value::Object(map) => {
                let script_hex = map
                    .get("script")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| LockError::InvalidScript(value.to_string()))?;
                let script = hex::decode(script_hex)
                    .map_err(|_| LockError::InvalidScript(script_hex.into()))?;
                let domain = map
                    .get("domain")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| LockError::InvalidScript(value.to_string()))?;
                Ok(Owner::Script(ScriptLock {
                    script,
                    domain: domain as usize,
                }))
            }
            other => Err(LockError::InvalidScript(other.to_string())),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Owner::Address(lock) => serde_json::Value::String(lock.address()),
            Owner::Script(lock) => serde_json::json!({
                "script": hex::encode(&lock.script),
                "domain": lock.domain,
            }),
        }
    }

    pub fn lock(&self) -> &dyn Lock {
        match self {
            Owner::Address(lock) => lock,
            Owner::Script(lock) => lock,
        }
    }

    pub fn script_hex(&self) -> String {
        hex::encode(self.lock().script())
    }
}

fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

fn base58check_encode(payload: &[u8]) -> String {
    let mut data = payload.to_vec();
    data.extend_from_slice(&sha256d(payload)[..4]);

    let mut digits: Vec<u8> = vec![0];
    for &byte in &data {
        let mut carry = byte as u32;
        for digit in digits.iter_mut() {
            carry += (*digit as u32) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }
    let leading_zeros = data.iter().take_while(|b| **b == 0).count();
    let mut out = String::with_capacity(leading_zeros + digits.len());
    for _ in 0..leading_zeros {
        out.push('1');
    }
    for &digit in digits.iter().rev() {
        out.push(BASE58_ALPHABET[digit as usize] as char);
    }
    out
}

fn base58check_decode(s: &str) -> Option<Vec<u8>> {
    let mut bytes: Vec<u8> = vec![0];
    for c in s.bytes() {
        let value = BASE58_ALPHABET.iter().position(|b| *b == c)? as u32;
        let mut carry = value;
        for byte in bytes.iter_mut() {
            carry += (*byte as u32) * 58;
            *byte = (carry & 0xff) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xff) as u8);
            carry >>= 8;
        }
    }
    let leading_ones = s.bytes().take_while(|b| *b == b'1').count();
    let mut data: Vec<u8> = vec![0; leading_ones];
    data.extend(bytes.iter().rev().skip_while(|b| **b == 0));

    if data.len() < 4 {
        return None;
    }
    let (payload, checksum) = data.split_at(data.len() - 4);
    if sha256d(payload)[..4] != *checksum {
        return None;
    }
    Some(payload.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // The zero pubkey-hash mainnet address.
    const ZERO_ADDR: &str = "1111111111111111111114oLvT2";

    #[test]
    fn address_roundtrip() {
        let lock = P2pkhLock {
            pubkey_hash: [0x5a; 20],
            testnet: false,
        };
        let parsed = P2pkhLock::from_address(&lock.address()).unwrap();
        assert_eq!(parsed, lock);

        let test = P2pkhLock {
            pubkey_hash: [0x5a; 20],
            testnet: true,
        };
        assert_eq!(P2pkhLock::from_address(&test.address()).unwrap(), test);
    }

    #[test]
    fn zero_hash_address_is_known_vector() {
        let lock = P2pkhLock {
            pubkey_hash: [0; 20],
            testnet: false,
        };
        assert_eq!(lock.address(), ZERO_ADDR);
        assert_eq!(P2pkhLock::from_address(ZERO_ADDR).unwrap(), lock);
    }

    #[test]
    fn bad_checksum_rejected() {
        let lock = P2pkhLock {
            pubkey_hash: [7; 20],
            testnet: false,
        };
        let mut addr = lock.address();
        // Flip the final character to damage the checksum.
        let last = addr.pop().unwrap();
        addr.push(if last == '2' { '3' } else { '2' });
        assert!(P2pkhLock::from_address(&addr).is_err());
    }

    #[test]
    fn p2pkh_script_shape() {
        let lock = P2pkhLock {
            pubkey_hash: [9; 20],
            testnet: false,
        };
        let script = lock.script();
        assert_eq!(script.len(), 25);
        assert_eq!(&script[..3], &[0x76, 0xa9, 0x14]);
        assert_eq!(&script[23..], &[0x88, 0xac]);
        assert_eq!(lock.domain(), 108);
    }

    #[test]
    fn owner_json_coercion() {
        let addr = P2pkhLock {
            pubkey_hash: [1; 20],
            testnet: false,
        }
        .address();
        let owner = Owner::from_json(&serde_json::Value::String(addr.clone())).unwrap();
        assert_eq!(owner.to_json(), serde_json::Value::String(addr));

        let custom = serde_json::json!({"script": "51", "domain": 0});
        let owner = Owner::from_json(&custom).unwrap();
        assert_eq!(owner.lock().script(), vec![0x51]);
        assert_eq!(owner.to_json(), custom);

        assert!(Owner::from_json(&serde_json::json!(42)).is_err());
    }
}

// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The location addressing scheme.
//!
//! A location is the canonical identifier of a creation. There are six
//! dialects; parsing tries them in order and `compile` (via [`Display`])
//! produces the canonical string, so `compile(parse(s)) == s` holds for
//! every canonical input.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// The exact serialization of the undeployed sentinel. Distinguished from
/// other `error://` locations only by string equality.
pub const UNDEPLOYED: &str = "error://Undeployed";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("unknown location format: {0:?}")]
    UnknownFormat(String),
    #[error("invalid txid: {0:?}")]
    InvalidTxid(String),
    #[error("invalid output index: {0:?}")]
    InvalidIndex(String),
    #[error("invalid record id: {0:?}")]
    InvalidRecordId(String),
    #[error("invalid berry query: {0}")]
    InvalidQuery(String),
    #[error("invalid native identifier: {0:?}")]
    InvalidNative(String),
}

/// A transaction id, stored raw and rendered as lower-case 64-hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Txid(pub [u8; 32]);

impl Txid {
    pub fn parse(s: &str) -> Result<Self, LocationError> {
        if s.len() != 64 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(LocationError::InvalidTxid(s.into()));
        }
        let mut raw = [0u8; 32];
        hex::decode_to_slice(s, &mut raw).map_err(|_| LocationError::InvalidTxid(s.into()))?;
        Ok(Txid(raw))
    }
}

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Position of a creation within one transaction: a spendable output
/// (`_o<n>`) or a deletion slot (`_d<n>`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum Slot {
    Output(u32),
    Deleted(u32),
}

impl Slot {
    fn parse(s: &str) -> Result<Self, LocationError> {
        let err = || LocationError::InvalidIndex(s.into());
        let mut chars = s.chars();
        let kind = chars.next().ok_or_else(err)?;
        let n = parse_decimal(chars.as_str()).ok_or_else(err)?;
        match kind {
            'o' => Ok(Slot::Output(n)),
            'd' => Ok(Slot::Deleted(n)),
            _ => Err(err()),
        }
    }

    pub fn index(&self) -> u32 {
        match *self {
            Slot::Output(n) | Slot::Deleted(n) => n,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, Slot::Deleted(_))
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Slot::Output(n) => write!(f, "o{}", n),
            Slot::Deleted(n) => write!(f, "d{}", n),
        }
    }
}

/// Decimal without sign or leading zeros. `"0"` is canonical for zero.
fn parse_decimal(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

/// A parsed location.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Location {
    /// `<txid>_o<n>` / `<txid>_d<n>` — a deployed creation.
    Jig { txid: Txid, slot: Slot },
    /// `_o<n>` / `_d<n>` — in-record, before publication.
    Partial { slot: Slot },
    /// `record://<id>_o<n>` — during staging.
    Record { record: String, slot: Slot },
    /// `<txid>_o<n>?berry=<path>&hash=<hash>&version=<n>` — a pluck.
    Berry {
        txid: Txid,
        slot: Slot,
        path: String,
        hash: [u8; 32],
        version: u32,
    },
    /// `native://<Ident>` — a built-in.
    Native { ident: String },
    /// `error://<free-text>` — permanently invalid.
    Error { message: String },
}

impl Location {
    pub fn parse(s: &str) -> Result<Self, LocationError> {
        if let Some(rest) = s.strip_prefix("record://") {
            return parse_record(rest);
        }
        if let Some(rest) = s.strip_prefix("native://") {
            if rest.is_empty()
                || !rest.bytes().next().unwrap().is_ascii_alphabetic()
                || !rest.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
            {
                return Err(LocationError::InvalidNative(rest.into()));
            }
            return Ok(Location::Native { ident: rest.into() });
        }
        if let Some(rest) = s.strip_prefix("error://") {
            return Ok(Location::Error {
                message: rest.into(),
            });
        }
        if let Some((jig, query)) = s.split_once('?') {
            return parse_berry(jig, query);
        }
        if let Some(slot) = s.strip_prefix('_') {
            return Ok(Location::Partial {
                slot: Slot::parse(slot)?,
            });
        }
        if let Some((txid, slot)) = s.split_once('_') {
            return Ok(Location::Jig {
                txid: Txid::parse(txid)?,
                slot: Slot::parse(slot)?,
            });
        }
        Err(LocationError::UnknownFormat(s.into()))
    }

    /// The canonical string; same as [`Display`].
    pub fn compile(&self) -> String {
        self.to_string()
    }

    pub fn undeployed() -> Self {
        Location::Error {
            message: "Undeployed".into(),
        }
    }

    pub fn is_undeployed(&self) -> bool {
        matches!(self, Location::Error { message } if message == "Undeployed")
    }

    pub fn txid(&self) -> Option<Txid> {
        match self {
            Location::Jig { txid, .. } | Location::Berry { txid, .. } => Some(*txid),
            _ => None,
        }
    }

    pub fn slot(&self) -> Option<Slot> {
        match self {
            Location::Jig { slot, .. }
            | Location::Partial { slot }
            | Location::Record { slot, .. }
            | Location::Berry { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    /// The in-transaction rendering (`_o<n>` / `_d<n>`) of a deployed or
    /// partial location.
    pub fn to_partial(&self) -> Option<Location> {
        self.slot().map(|slot| Location::Partial { slot })
    }

    /// True for locations that point at a published transaction.
    pub fn is_deployed(&self) -> bool {
        matches!(self, Location::Jig { .. } | Location::Berry { .. })
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Jig { txid, slot } => write!(f, "{}_{}", txid, slot),
            Location::Partial { slot } => write!(f, "_{}", slot),
            Location::Record { record, slot } => write!(f, "record://{}_{}", record, slot),
            Location::Berry {
                txid,
                slot,
                path,
                hash,
                version,
            } => write!(
                f,
                "{}_{}?berry={}&hash={}&version={}",
                txid,
                slot,
                uri_component_encode(path),
                hex::encode(hash),
                version
            ),
            Location::Native { ident } => write!(f, "native://{}", ident),
            Location::Error { message } => write!(f, "error://{}", message),
        }
    }
}

impl FromStr for Location {
    type Err = LocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Location::parse(s)
    }
}

fn parse_record(rest: &str) -> Result<Location, LocationError> {
    let (id, slot) = rest
        .rsplit_once('_')
        .ok_or_else(|| LocationError::UnknownFormat(format!("record://{}", rest)))?;
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(LocationError::InvalidRecordId(id.into()));
    }
    Ok(Location::Record {
        record: id.into(),
        slot: Slot::parse(slot)?,
    })
}

fn parse_berry(jig: &str, query: &str) -> Result<Location, LocationError> {
    let (txid, slot) = jig
        .split_once('_')
        .ok_or_else(|| LocationError::UnknownFormat(jig.into()))?;
    let txid = Txid::parse(txid)?;
    let slot = Slot::parse(slot)?;

    // Canonical query order is sorted: berry, hash, version. Anything else
    // is rejected rather than normalized.
    let mut parts = query.split('&');
    let path = expect_param(&mut parts, "berry")?;
    let path = uri_component_decode(&path)
        .ok_or_else(|| LocationError::InvalidQuery(format!("bad berry path encoding: {path:?}")))?;
    let hash_hex = expect_param(&mut parts, "hash")?;
    if hash_hex.len() != 64
        || !hash_hex
            .bytes()
            .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    {
        return Err(LocationError::InvalidQuery(format!(
            "bad hash: {hash_hex:?}"
        )));
    }
    let mut hash = [0u8; 32];
    hex::decode_to_slice(&hash_hex, &mut hash)
        .map_err(|_| LocationError::InvalidQuery(format!("bad hash: {hash_hex:?}")))?;
    let version_str = expect_param(&mut parts, "version")?;
    let version = parse_decimal(&version_str)
        .filter(|v| *v >= 1)
        .ok_or_else(|| LocationError::InvalidQuery(format!("bad version: {version_str:?}")))?;
    if parts.next().is_some() {
        return Err(LocationError::InvalidQuery("trailing parameters".into()));
    }

    Ok(Location::Berry {
        txid,
        slot,
        path,
        hash,
        version,
    })
}

fn expect_param<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    name: &str,
) -> Result<String, LocationError> {
    let part = parts
        .next()
        .ok_or_else(|| LocationError::InvalidQuery(format!("missing {name} parameter")))?;
    part.strip_prefix(name)
        .and_then(|p| p.strip_prefix('='))
        .map(|v| v.to_owned())
        .ok_or_else(|| LocationError::InvalidQuery(format!("expected {name} parameter")))
}

/// Characters left bare by URI-component encoding.
fn is_uri_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'!' | b'~' | b'*' | b'\'' | b'(' | b')')
}

pub fn uri_component_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if is_uri_unreserved(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push_str(&format!("{:02X}", b));
        }
    }
    out
}

pub fn uri_component_decode(s: &str) -> Option<String> {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = *bytes.get(i + 1)? as char;
            let lo = *bytes.get(i + 2)? as char;
            let byte = (hi.to_digit(16)? * 16 + lo.to_digit(16)?) as u8;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TXID: &str = "0000000000000000000000000000000000000000000000000000000000000abc";

    fn roundtrip(s: &str) -> Location {
        let loc = Location::parse(s).unwrap();
        assert_eq!(loc.compile(), s);
        loc
    }

    #[test]
    fn jig_locations_roundtrip() {
        let loc = roundtrip(&format!("{TXID}_o1"));
        assert!(matches!(loc, Location::Jig { slot: Slot::Output(1), .. }));
        roundtrip(&format!("{TXID}_d0"));
        roundtrip(&format!("{TXID}_o4294967295"));
    }

    #[test]
    fn partial_and_record_roundtrip() {
        assert_eq!(
            roundtrip("_o2"),
            Location::Partial { slot: Slot::Output(2) }
        );
        roundtrip("_d3");
        roundtrip("record://abc123_o1");
    }

    #[test]
    fn berry_roundtrip_encodes_path() {
        let hash = "ab".repeat(32);
        let s = format!("{TXID}_o1?berry=a%20b%2Fc&hash={hash}&version=5");
        let loc = roundtrip(&s);
        match loc {
            Location::Berry { path, version, .. } => {
                assert_eq!(path, "a b/c");
                assert_eq!(version, 5);
            }
            other => panic!("expected berry, got {other:?}"),
        }
    }

    #[test]
    fn native_and_error_roundtrip() {
        assert_eq!(
            roundtrip("native://Jig"),
            Location::Native { ident: "Jig".into() }
        );
        roundtrip("error://anything at all");
    }

    #[test]
    fn undeployed_is_exact_string_match() {
        let loc = Location::parse(UNDEPLOYED).unwrap();
        assert!(loc.is_undeployed());
        assert!(!Location::parse("error://undeployed").unwrap().is_undeployed());
        assert_eq!(Location::undeployed().compile(), UNDEPLOYED);
    }

    #[test]
    fn rejects_non_canonical_forms() {
        let cases = vec![
            String::new(),
            "abc".to_owned(),
            TXID.to_uppercase(),
            format!("{}_o1", TXID.to_uppercase()),
            format!("{TXID}_o01"),
            format!("{TXID}_x1"),
            format!("{TXID}_o"),
            "record://_o1".to_owned(),
            "record://has_underscore_o1".to_owned(),
            "native://2Bad".to_owned(),
            format!("{TXID}_o1?hash=00&berry=a&version=1"),
            format!("{TXID}_o1?berry=a&hash=00&version=1"),
            format!("{TXID}_o1?berry=a&hash={}&version=0", "ab".repeat(32)),
        ];
        for bad in &cases {
            assert!(Location::parse(bad).is_err(), "accepted {bad:?}");
        }
    }
}

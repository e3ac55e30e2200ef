// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The byte-level form of Run state.
//!
//! Everything the protocol hashes or ships is canonical JSON: object keys
//! sorted by the canonical property comparator, integer numbers only, no
//! insignificant whitespace. Non-primitive intrinsics travel as tagged
//! single-key objects (`$set`, `$map`, …); creation references as `$jig`.

mod blob;
mod canonical;
pub mod tags;

pub use blob::{BlobKind, StateBlob};
pub use canonical::{cmp_prop_keys, to_canonical_string, PropKeyOrder};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("non-integer number cannot be canonicalized: {0}")]
    Float(String),
    #[error("malformed tagged value: {0}")]
    BadTag(String),
    #[error("malformed state blob: {0}")]
    BadBlob(String),
    #[error("dedup index out of range: {0}")]
    BadDedup(usize),
}

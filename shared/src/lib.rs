// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Shared types for the Run Virtual Machine: locations, locks, bindings,
//! the metadata field layout, the protocol/state version pair, and the
//! runtime error taxonomy.

pub mod bindings;
pub mod error;
pub mod location;
pub mod lock;
pub mod metadata;
pub mod transaction;
pub mod version;

pub use error::{ClassifyResult, Result, RvmError};
pub use location::{Location, Slot, Txid};
pub use lock::{Lock, Owner};
pub use transaction::{Tx, Utxo};

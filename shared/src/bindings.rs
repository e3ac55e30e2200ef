// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The five bindings every creation carries.
//!
//! Location bindings (`location`, `origin`, `nonce`) are set only by the
//! runtime as records finalize. UTXO bindings (`owner`, `satoshis`) may be
//! assigned by user code from within a method, subject to validation here.

use crate::error::RvmError;
use crate::location::Location;
use crate::lock::Owner;

/// Default upper bound on the satoshis backing one creation.
pub const MAX_BACKING_SATOSHIS: u64 = 100_000_000;

#[derive(Clone, PartialEq, Debug)]
pub struct Bindings {
    pub location: Location,
    pub origin: Location,
    /// Count of transactions that modified the creation. Zero only before
    /// the first commit.
    pub nonce: u64,
    pub owner: Option<Owner>,
    pub satoshis: u64,
}

impl Bindings {
    /// Bindings of a creation that has not been touched by any record yet.
    pub fn undeployed() -> Self {
        Bindings {
            location: Location::undeployed(),
            origin: Location::undeployed(),
            nonce: 0,
            owner: None,
            satoshis: 0,
        }
    }

    /// Validates a user-supplied satoshis assignment.
    pub fn check_satoshis(value: i64, limit: u64) -> Result<u64, RvmError> {
        if value < 0 {
            return Err(RvmError::argument("satoshis must be non-negative"));
        }
        let value = value as u64;
        if value > limit {
            return Err(RvmError::argument(format!(
                "satoshis must be <= {limit}"
            )));
        }
        Ok(value)
    }

    /// Advance the location bindings into the next transaction. Called by
    /// the runtime when a record finalizes; `slot_location` is the new
    /// in-record location.
    pub fn bump(&mut self, slot_location: Location) {
        if self.nonce == 0 {
            self.origin = slot_location.clone();
        }
        self.location = slot_location;
        self.nonce += 1;
    }
}

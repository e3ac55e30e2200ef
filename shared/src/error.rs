// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The runtime error taxonomy.
//!
//! Every failure surfaced by the runtime is one of these kinds. The kind
//! decides caching behavior: execution and trust failures are banned in the
//! cache, argument and internal failures never are.

use thiserror::Error;

/// Runtime result.
pub type Result<T> = std::result::Result<T, RvmError>;

#[derive(Debug, Error)]
pub enum RvmError {
    /// Malformed user input. Never cached as a ban.
    #[error("argument error: {0}")]
    Argument(String),

    /// Resource not in cache while client mode is on.
    #[error("client mode error: {0}")]
    ClientMode(String),

    /// Deterministic replay failure. Bans the location.
    #[error("execution error: {0}")]
    Execution(String),

    /// Code from an untrusted txid was about to run. Banned with the txid
    /// recorded so a later trust() clears it.
    #[error("trust error: {message} (txid {txid})")]
    Trust { txid: String, message: String },

    /// The top-level timeout elapsed. Never silently recovered.
    #[error("timeout error: {0}")]
    Timeout(String),

    /// Invariant violation; a bug in the runtime. Never cached.
    #[error("internal error: {0}")]
    Internal(String),

    /// An abstract collaborator method was invoked.
    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl RvmError {
    pub fn argument(msg: impl Into<String>) -> Self {
        RvmError::Argument(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        RvmError::Execution(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        RvmError::Internal(msg.into())
    }

    /// True for failures that are deterministic properties of the data and
    /// should be remembered as bans.
    pub fn is_bannable(&self) -> bool {
        matches!(self, RvmError::Execution(_) | RvmError::Trust { .. })
    }

    /// The untrusted txid, when this is a trust failure.
    pub fn untrusted_txid(&self) -> Option<&str> {
        match self {
            RvmError::Trust { txid, .. } => Some(txid),
            _ => None,
        }
    }
}

/// Classifies results from the oracle boundary into the taxonomy.
///
/// Oracles speak `anyhow`; everything that crosses back into the runtime
/// picks a kind explicitly.
pub trait ClassifyResult: Sized {
    type Value;

    /// An oracle failure that invalidates replay determinism.
    fn or_execution(self) -> Result<Self::Value>;

    /// A failure that can only mean a runtime bug.
    fn or_internal(self) -> Result<Self::Value>;

    /// A failure caused by bad user input.
    fn or_argument(self) -> Result<Self::Value>;
}

impl<T, E: Into<anyhow::Error>> ClassifyResult for std::result::Result<T, E> {
    type Value = T;

    fn or_execution(self) -> Result<T> {
        self.map_err(|e| RvmError::Execution(format!("{:#}", e.into())))
    }

    fn or_internal(self) -> Result<T> {
        self.map_err(|e| RvmError::Internal(format!("{:#}", e.into())))
    }

    fn or_argument(self) -> Result<T> {
        self.map_err(|e| RvmError::Argument(format!("{:#}", e.into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_picks_kinds() {
        let failing: anyhow::Result<()> = Err(anyhow::anyhow!("boom"));
        assert!(matches!(failing.or_execution(), Err(RvmError::Execution(_))));
        let failing: anyhow::Result<()> = Err(anyhow::anyhow!("boom"));
        assert!(matches!(failing.or_internal(), Err(RvmError::Internal(_))));
        let ok: anyhow::Result<u32> = Ok(7);
        assert_eq!(ok.or_argument().unwrap(), 7);
    }

    #[test]
    fn bannable_kinds() {
        assert!(RvmError::execution("hash mismatch").is_bannable());
        assert!(RvmError::Trust {
            txid: "ab".repeat(32),
            message: "untrusted".into()
        }
        .is_bannable());
        assert!(!RvmError::argument("nope").is_bannable());
        assert!(!RvmError::internal("bug").is_bannable());
    }
}

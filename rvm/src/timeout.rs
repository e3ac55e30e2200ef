// Copyright 2021-2023 Run Core Devs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::time::{Duration, Instant};

use rvm_shared::{Result, RvmError};

/// The deadline carried by every top-level operation.
///
/// Checked at each oracle boundary; exceeding it is a hard
/// [`RvmError::Timeout`] with no partial-state fallthrough. Never visible
/// to user code — the realm has no clock.
#[derive(Clone, Copy, Debug)]
pub struct Timeout {
    start: Instant,
    limit: Duration,
}

impl Timeout {
    pub fn new(limit: Duration) -> Self {
        Timeout {
            start: Instant::now(),
            limit,
        }
    }

    pub fn check(&self, doing: &str) -> Result<()> {
        if self.start.elapsed() > self.limit {
            return Err(RvmError::Timeout(format!(
                "{} exceeded {:?}",
                doing, self.limit
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_timeout_passes() {
        let t = Timeout::new(Duration::from_secs(10));
        assert!(t.check("load").is_ok());
    }

    #[test]
    fn expired_timeout_fails() {
        let t = Timeout::new(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(1));
        let err = t.check("load").unwrap_err();
        assert!(matches!(err, RvmError::Timeout(_)));
    }
}

// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::locking::timeout::LockTimeoutValue;
use std::fmt;

/// What a request does when it cannot be granted immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Never block; a conflicting request fails at once with `AcquireTimeout`.
    FailFast,
    /// Park the calling thread until granted, stopped or the timeout expires.
    Block { timeout: LockTimeoutValue },
    /// Re-check `spins` times with the stripe unlocked before parking.
    SpinThenBlock {
        spins: u32,
        timeout: LockTimeoutValue,
    },
}

impl WaitStrategy {
    pub const fn block(timeout: LockTimeoutValue) -> Self {
        WaitStrategy::Block { timeout }
    }

    pub fn timeout(&self) -> LockTimeoutValue {
        match self {
            WaitStrategy::FailFast => LockTimeoutValue::Finite(std::time::Duration::ZERO),
            WaitStrategy::Block { timeout } | WaitStrategy::SpinThenBlock { timeout, .. } => {
                *timeout
            }
        }
    }

    pub fn spins(&self) -> u32 {
        match self {
            WaitStrategy::SpinThenBlock { spins, .. } => *spins,
            _ => 0,
        }
    }

    pub fn may_block(&self) -> bool {
        !matches!(self, WaitStrategy::FailFast)
    }
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::block(LockTimeoutValue::from_secs(30))
    }
}

impl fmt::Display for WaitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitStrategy::FailFast => f.write_str("fail-fast"),
            WaitStrategy::Block { timeout } => write!(f, "block (timeout {timeout})"),
            WaitStrategy::SpinThenBlock { spins, timeout } => {
                write!(f, "spin {spins} then block (timeout {timeout})")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fail_fast_has_zero_budget() {
        let strategy = WaitStrategy::FailFast;
        assert!(!strategy.may_block());
        assert_eq!(strategy.timeout(), LockTimeoutValue::Finite(Duration::ZERO));
    }

    #[test]
    fn display_describes_policy() {
        let strategy = WaitStrategy::SpinThenBlock {
            spins: 8,
            timeout: LockTimeoutValue::from_millis(100),
        };
        assert_eq!(strategy.to_string(), "spin 8 then block (timeout 100ms)");
        assert_eq!(strategy.spins(), 8);
    }
}

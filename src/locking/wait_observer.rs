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

//! Observer interfaces for lock wait instrumentation.
//!
//! Observers are invoked while the caller's stripe is locked and must not call
//! back into the lock manager.

use crate::locking::mode::LockMode;
use crate::locking::resource::ClientId;
use crate::locking::timeout::LockTimeoutValue;
use log::{debug, info, warn};
use std::fmt;
use std::time::Duration;

/// The request a wait event refers to.
#[derive(Debug, Clone, Copy)]
pub struct WaitTarget<'a> {
    pub client: ClientId,
    pub resource: &'a str,
    pub mode: LockMode,
}

impl fmt::Display for WaitTarget<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} lock on {} for client {}",
            self.mode, self.resource, self.client
        )
    }
}

/// Observer hooks for lock wait events.
pub trait LockWaitObserver: Send + Sync {
    fn on_wait_start(&self, _target: &WaitTarget<'_>, _timeout: LockTimeoutValue) {}

    fn on_spin(&self, _target: &WaitTarget<'_>, _attempt: u32) {}

    fn on_acquired(&self, _target: &WaitTarget<'_>, _waited: Duration) {}

    fn on_timeout(&self, _target: &WaitTarget<'_>, _waited: Duration) {}

    fn on_cancelled(&self, _target: &WaitTarget<'_>, _waited: Duration) {}
}

/// Observer implementation that performs no work.
#[derive(Debug, Default)]
pub struct NoopLockWaitObserver;

impl LockWaitObserver for NoopLockWaitObserver {}

/// Writes wait events through the `log` facade.
#[derive(Debug, Default)]
pub struct LoggingWaitObserver;

impl LockWaitObserver for LoggingWaitObserver {
    fn on_wait_start(&self, target: &WaitTarget<'_>, timeout: LockTimeoutValue) {
        debug!("Waiting for {target} (timeout {timeout})");
    }

    fn on_acquired(&self, target: &WaitTarget<'_>, waited: Duration) {
        debug!("Acquired {target} after {}", format_duration(waited));
    }

    fn on_timeout(&self, target: &WaitTarget<'_>, waited: Duration) {
        warn!(
            "Timed out waiting for {target} after {}",
            format_duration(waited)
        );
    }

    fn on_cancelled(&self, target: &WaitTarget<'_>, waited: Duration) {
        info!(
            "Stopped while waiting for {target} after {}",
            format_duration(waited)
        );
    }
}

pub(crate) fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.1}s", duration.as_secs_f32())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_label_names_mode_resource_and_client() {
        let target = WaitTarget {
            client: ClientId(7),
            resource: "node(3)",
            mode: LockMode::Exclusive,
        };
        assert_eq!(target.to_string(), "exclusive lock on node(3) for client 7");
    }

    #[test]
    fn durations_switch_units_at_one_second() {
        assert_eq!(format_duration(Duration::from_millis(120)), "120ms");
        assert_eq!(format_duration(Duration::from_millis(1_200)), "1.2s");
    }
}

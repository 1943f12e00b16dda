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

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters describing lock manager activity. Advisory only.
#[derive(Debug, Default)]
pub struct LockStats {
    grants: AtomicU64,
    waits: AtomicU64,
    timeouts: AtomicU64,
    stopped_waits: AtomicU64,
    releases: AtomicU64,
}

impl LockStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_grant(&self) {
        self.grants.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wait(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stopped_wait(&self) {
        self.stopped_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LockStatsSnapshot {
        LockStatsSnapshot {
            grants: self.grants.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            stopped_waits: self.stopped_waits.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LockStatsSnapshot {
    pub grants: u64,
    pub waits: u64,
    pub timeouts: u64,
    pub stopped_waits: u64,
    pub releases: u64,
}

/// Exponentially weighted average of how long granted waiters waited, per resource type.
#[derive(Debug)]
pub struct GrantLatency {
    average_nanos: Box<[AtomicU64]>,
}

const SMOOTHING_SHIFT: u32 = 3;

impl GrantLatency {
    pub fn new(type_slots: usize) -> Self {
        let average_nanos = (0..type_slots).map(|_| AtomicU64::new(0)).collect();
        Self { average_nanos }
    }

    pub fn record(&self, type_slot: usize, waited: Duration) {
        let Some(slot) = self.average_nanos.get(type_slot) else {
            return;
        };
        let sample = u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX);
        let _ = slot.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            if current == 0 {
                return Some(sample);
            }
            let updated = if sample >= current {
                current.saturating_add((sample - current) >> SMOOTHING_SHIFT)
            } else {
                current - ((current - sample) >> SMOOTHING_SHIFT)
            };
            Some(updated)
        });
    }

    pub fn average(&self, type_slot: usize) -> Duration {
        self.average_nanos
            .get(type_slot)
            .map(|slot| Duration::from_nanos(slot.load(Ordering::Relaxed)))
            .unwrap_or_default()
    }

    /// Queue length times the observed average wait for the type.
    pub fn estimate(&self, type_slot: usize, queued: usize) -> Duration {
        let queued = u32::try_from(queued).unwrap_or(u32::MAX);
        self.average(type_slot).saturating_mul(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_the_average() {
        let latency = GrantLatency::new(2);
        latency.record(1, Duration::from_millis(80));
        assert_eq!(latency.average(1), Duration::from_millis(80));
        assert_eq!(latency.average(0), Duration::ZERO);
    }

    #[test]
    fn average_moves_an_eighth_towards_new_samples() {
        let latency = GrantLatency::new(1);
        latency.record(0, Duration::from_nanos(800));
        latency.record(0, Duration::from_nanos(1_600));
        assert_eq!(latency.average(0), Duration::from_nanos(900));
        latency.record(0, Duration::from_nanos(100));
        assert_eq!(latency.average(0), Duration::from_nanos(800));
    }

    #[test]
    fn estimate_scales_with_queue_length() {
        let latency = GrantLatency::new(1);
        latency.record(0, Duration::from_millis(10));
        assert_eq!(latency.estimate(0, 3), Duration::from_millis(30));
        assert_eq!(latency.estimate(0, 0), Duration::ZERO);
        assert_eq!(latency.estimate(5, 3), Duration::ZERO);
    }

    #[test]
    fn counters_snapshot() {
        let stats = LockStats::new();
        stats.record_grant();
        stats.record_grant();
        stats.record_timeout();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.grants, 2);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.waits, 0);
    }
}

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

//! Interval locks over the ordered value space of one entity property.
//!
//! Two intervals under the same key conflict iff they overlap, at least one is
//! Exclusive, and they belong to different clients. A request is granted when
//! it conflicts with no held interval, whatever is queued. Waiters are
//! promoted in arrival order as holds go away.

use crate::error::{LockError, Result};
use crate::locking::mode::LockMode;
use crate::locking::resource::{ClientId, ResourceType};
use crate::locking::stripes::StripedMap;
use crate::locking::table::Requester;
use crate::locking::wait::{RequestSlot, WaitCoordinator, WaitRequest};
use crate::locking::wait_observer::WaitTarget;
use log::debug;
use parking_lot::MutexGuard;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// `(resource type, entity, property key)`; each key owns an independent interval set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemporalKey {
    pub type_id: u32,
    pub entity_id: u64,
    pub property_key_id: u32,
}

impl TemporalKey {
    pub const fn new(type_id: u32, entity_id: u64, property_key_id: u32) -> Self {
        Self {
            type_id,
            entity_id,
            property_key_id,
        }
    }
}

/// Closed interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TemporalInterval {
    pub start: i64,
    pub end: i64,
}

impl TemporalInterval {
    pub fn new(start: i64, end: i64) -> Result<Self> {
        if start > end {
            return Err(LockError::InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    pub const fn point(time: i64) -> Self {
        Self {
            start: time,
            end: time,
        }
    }

    pub fn overlaps(&self, other: &TemporalInterval) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for TemporalInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TemporalHold {
    pub(crate) client: ClientId,
    pub(crate) mode: LockMode,
    pub(crate) interval: TemporalInterval,
    pub(crate) count: u32,
}

#[derive(Debug)]
pub(crate) struct PendingInterval {
    pub(crate) client: ClientId,
    pub(crate) mode: LockMode,
    pub(crate) interval: TemporalInterval,
    pub(crate) enqueued_at: Instant,
    slot: Arc<RequestSlot>,
}

fn conflicts(
    a: (ClientId, LockMode, &TemporalInterval),
    b: (ClientId, LockMode, &TemporalInterval),
) -> bool {
    a.0 != b.0 && (a.1.is_exclusive() || b.1.is_exclusive()) && a.2.overlaps(b.2)
}

#[derive(Debug)]
pub(crate) struct TemporalLockState {
    pub(crate) identity: u64,
    pub(crate) holds: Vec<TemporalHold>,
    pub(crate) waiters: VecDeque<PendingInterval>,
}

impl TemporalLockState {
    fn new(identity: u64) -> Self {
        Self {
            identity,
            holds: Vec::new(),
            waiters: VecDeque::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.holds.is_empty() && self.waiters.is_empty()
    }

    fn conflicts_with_holds(
        &self,
        client: ClientId,
        mode: LockMode,
        interval: &TemporalInterval,
    ) -> bool {
        self.holds
            .iter()
            .any(|hold| conflicts((client, mode, interval), (hold.client, hold.mode, &hold.interval)))
    }

    fn hold_index(
        &self,
        client: ClientId,
        mode: LockMode,
        interval: &TemporalInterval,
    ) -> Option<usize> {
        self.holds.iter().position(|hold| {
            hold.client == client && hold.mode == mode && hold.interval == *interval
        })
    }

    fn try_grant(&mut self, client: ClientId, mode: LockMode, interval: TemporalInterval) -> bool {
        if let Some(index) = self.hold_index(client, mode, &interval) {
            self.holds[index].count += 1;
            return true;
        }
        if self.conflicts_with_holds(client, mode, &interval) {
            return false;
        }
        self.add_hold(client, mode, interval);
        true
    }

    fn add_hold(&mut self, client: ClientId, mode: LockMode, interval: TemporalInterval) {
        match self.hold_index(client, mode, &interval) {
            Some(index) => self.holds[index].count += 1,
            None => self.holds.push(TemporalHold {
                client,
                mode,
                interval,
                count: 1,
            }),
        }
    }

    fn release(&mut self, client: ClientId, mode: LockMode, interval: &TemporalInterval) -> bool {
        let Some(index) = self.hold_index(client, mode, interval) else {
            return false;
        };
        self.holds[index].count -= 1;
        if self.holds[index].count == 0 {
            self.holds.swap_remove(index);
        }
        true
    }

    /// Grants, in arrival order, every waiter whose interval no longer
    /// conflicts with a hold. Waiters granted earlier in the pass count as
    /// holds for the ones behind them.
    fn promote(&mut self) -> usize {
        let mut granted = 0;
        let mut remaining: VecDeque<PendingInterval> = VecDeque::with_capacity(self.waiters.len());
        while let Some(waiter) = self.waiters.pop_front() {
            if self.conflicts_with_holds(waiter.client, waiter.mode, &waiter.interval) {
                remaining.push_back(waiter);
            } else if waiter.slot.grant() {
                self.add_hold(waiter.client, waiter.mode, waiter.interval);
                granted += 1;
            }
        }
        self.waiters = remaining;
        granted
    }

    fn withdraw(&mut self, slot: &Arc<RequestSlot>) {
        self.waiters
            .retain(|waiter| !Arc::ptr_eq(&waiter.slot, slot));
        self.promote();
    }
}

/// Interval-tagged locks keyed by `(resource type, entity, property)`.
pub struct TemporalRangeIndex {
    stripes: StripedMap<TemporalKey, TemporalLockState>,
    coordinator: Arc<WaitCoordinator>,
    identities: AtomicU64,
}

impl TemporalRangeIndex {
    pub fn new(stripes: usize, coordinator: Arc<WaitCoordinator>) -> Self {
        Self {
            stripes: StripedMap::new(stripes),
            coordinator,
            identities: AtomicU64::new(1),
        }
    }

    pub(crate) fn acquire(
        &self,
        requester: Requester<'_>,
        resource_type: &ResourceType,
        type_slot: usize,
        key: TemporalKey,
        interval: TemporalInterval,
        mode: LockMode,
    ) -> Result<()> {
        let stripe = self.stripes.stripe(&key);
        let mut guard = stripe.entries.lock();
        let identities = &self.identities;
        let state = guard
            .entry(key)
            .or_insert_with(|| TemporalLockState::new(identities.fetch_add(1, Ordering::Relaxed)));

        if state.try_grant(requester.id, mode, interval) {
            self.coordinator.stats().record_grant();
            return Ok(());
        }

        let resource = describe(resource_type, &key, &interval);
        let target = WaitTarget {
            client: requester.id,
            resource: &resource,
            mode,
        };
        let strategy = resource_type.wait_strategy();
        if !strategy.may_block() {
            return Err(self.coordinator.reject(&target));
        }

        let slot = RequestSlot::new();
        state.waiters.push_back(PendingInterval {
            client: requester.id,
            mode,
            interval,
            enqueued_at: Instant::now(),
            slot: slot.clone(),
        });

        self.coordinator.await_grant(
            WaitRequest {
                target,
                strategy,
                type_slot,
                slot: &slot,
                signal: requester.signal,
                session: requester.id,
            },
            &mut guard,
            &stripe.changed,
            |entries| {
                if let Some(state) = entries.get_mut(&key) {
                    state.withdraw(&slot);
                    if state.is_idle() {
                        entries.remove(&key);
                    }
                }
            },
        )?;
        self.coordinator.stats().record_grant();
        Ok(())
    }

    /// Removes one hold of exactly this interval and mode.
    pub(crate) fn release(
        &self,
        client: ClientId,
        resource_type: &ResourceType,
        key: TemporalKey,
        interval: TemporalInterval,
        mode: LockMode,
    ) -> Result<()> {
        let stripe = self.stripes.stripe(&key);
        let mut guard = stripe.entries.lock();

        let released = guard
            .get_mut(&key)
            .is_some_and(|state| state.release(client, mode, &interval));
        if !released {
            return Err(LockError::InvalidRelease {
                resource: describe(resource_type, &key, &interval),
                mode,
                session: client.0,
            });
        }
        self.coordinator.stats().record_release();

        let mut granted = 0;
        if let Some(state) = guard.get_mut(&key) {
            granted = state.promote();
            if state.is_idle() {
                guard.remove(&key);
            }
        }
        drop(guard);

        if granted > 0 {
            debug!(
                "Release of {} by client {client} granted {granted} waiting request(s)",
                describe(resource_type, &key, &interval)
            );
            stripe.changed.notify_all();
        }
        Ok(())
    }

    /// Number of queued requests on one key.
    pub fn waiting_on(&self, key: TemporalKey) -> usize {
        self.stripes
            .stripe(&key)
            .entries
            .lock()
            .get(&key)
            .map(|state| state.waiters.len())
            .unwrap_or(0)
    }

    /// Number of keys with any hold or waiter.
    pub fn active_keys(&self) -> usize {
        self.stripes.entry_count()
    }

    pub(crate) fn wake_all(&self) {
        self.stripes.wake_all();
    }

    pub(crate) fn lock_all(
        &self,
    ) -> Vec<MutexGuard<'_, HashMap<TemporalKey, TemporalLockState>>> {
        self.stripes.lock_all()
    }
}

pub(crate) fn describe(
    resource_type: &ResourceType,
    key: &TemporalKey,
    interval: &TemporalInterval,
) -> String {
    format!(
        "{} property {} {interval}",
        resource_type.describe(key.entity_id),
        key.property_key_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(client: u64, start: i64, end: i64) -> (ClientId, LockMode, TemporalInterval) {
        (
            ClientId(client),
            LockMode::Shared,
            TemporalInterval { start, end },
        )
    }

    #[test]
    fn interval_rejects_reversed_bounds() {
        assert!(matches!(
            TemporalInterval::new(5, 1),
            Err(LockError::InvalidInterval { start: 5, end: 1 })
        ));
        assert_eq!(TemporalInterval::point(7), TemporalInterval::new(7, 7).unwrap());
    }

    #[test]
    fn overlap_is_inclusive_at_both_ends() {
        let a = TemporalInterval { start: 0, end: 10 };
        assert!(a.overlaps(&TemporalInterval::point(10)));
        assert!(a.overlaps(&TemporalInterval { start: -3, end: 0 }));
        assert!(!a.overlaps(&TemporalInterval::point(11)));
    }

    #[test]
    fn conflict_requires_overlap_exclusivity_and_distinct_clients() {
        let (c1, s, i1) = shared(1, 0, 10);
        let (c2, _, i2) = shared(2, 5, 15);
        assert!(!conflicts((c1, s, &i1), (c2, s, &i2)));
        assert!(conflicts(
            (c1, s, &i1),
            (c2, LockMode::Exclusive, &TemporalInterval::point(7))
        ));
        assert!(!conflicts(
            (c1, s, &i1),
            (c1, LockMode::Exclusive, &TemporalInterval::point(7))
        ));
        assert!(!conflicts(
            (c1, s, &i1),
            (c2, LockMode::Exclusive, &TemporalInterval::point(11))
        ));
    }

    #[test]
    fn identical_hold_stacks() {
        let mut state = TemporalLockState::new(1);
        let interval = TemporalInterval { start: 0, end: 4 };
        assert!(state.try_grant(ClientId(1), LockMode::Shared, interval));
        assert!(state.try_grant(ClientId(1), LockMode::Shared, interval));
        assert_eq!(state.holds.len(), 1);
        assert_eq!(state.holds[0].count, 2);
        assert!(state.release(ClientId(1), LockMode::Shared, &interval));
        assert!(state.release(ClientId(1), LockMode::Shared, &interval));
        assert!(!state.release(ClientId(1), LockMode::Shared, &interval));
        assert!(state.is_idle());
    }

    #[test]
    fn promote_grants_in_arrival_order() {
        let mut state = TemporalLockState::new(1);
        assert!(state.try_grant(ClientId(1), LockMode::Exclusive, TemporalInterval::point(5)));

        let exclusive_slot = RequestSlot::new();
        state.waiters.push_back(PendingInterval {
            client: ClientId(2),
            mode: LockMode::Exclusive,
            interval: TemporalInterval::point(5),
            enqueued_at: Instant::now(),
            slot: exclusive_slot.clone(),
        });
        let shared_slot = RequestSlot::new();
        state.waiters.push_back(PendingInterval {
            client: ClientId(3),
            mode: LockMode::Shared,
            interval: TemporalInterval { start: 0, end: 9 },
            enqueued_at: Instant::now(),
            slot: shared_slot.clone(),
        });

        assert!(state.release(ClientId(1), LockMode::Exclusive, &TemporalInterval::point(5)));
        assert_eq!(state.promote(), 1);
        assert_eq!(exclusive_slot.state(), crate::locking::wait::RequestState::Granted);
        assert_eq!(shared_slot.state(), crate::locking::wait::RequestState::Waiting);
        assert_eq!(state.waiters.len(), 1);
    }

    #[test]
    fn queued_waiters_do_not_block_a_new_request() {
        let mut state = TemporalLockState::new(1);
        assert!(state.try_grant(ClientId(1), LockMode::Shared, TemporalInterval { start: 0, end: 10 }));
        state.waiters.push_back(PendingInterval {
            client: ClientId(2),
            mode: LockMode::Exclusive,
            interval: TemporalInterval::point(7),
            enqueued_at: Instant::now(),
            slot: RequestSlot::new(),
        });

        assert!(state.try_grant(ClientId(1), LockMode::Shared, TemporalInterval { start: 6, end: 8 }));
        assert!(state.try_grant(ClientId(3), LockMode::Shared, TemporalInterval { start: 6, end: 8 }));
        assert!(!state.try_grant(ClientId(3), LockMode::Exclusive, TemporalInterval::point(9)));
        assert_eq!(state.holds.len(), 3);
    }
}

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

//! The shared resource lock table.
//!
//! # Grant rule
//!
//! A request from client `c` for mode `m` on a key is granted at once when
//!
//! - `c` already holds a compatible mode (Shared while holding anything,
//!   Exclusive while holding Exclusive), regardless of the queue, or
//! - nothing is queued ahead of it and no *other* client holds a conflicting
//!   mode.
//!
//! Otherwise it is queued. Requests from clients that already hold the key
//! (upgrades) are queued ahead of requests from clients that hold nothing:
//! a non-holder can never be granted while any holder remains, so queueing an
//! upgrade behind one would only deadlock. Releases promote waiters from the
//! front of the queue for as long as the front is compatible, which wakes a
//! run of Shared requests together and an Exclusive request alone.

use crate::error::{LockError, Result};
use crate::locking::mode::LockMode;
use crate::locking::resource::{ClientId, LockKey, ResourceType};
use crate::locking::stripes::StripedMap;
use crate::locking::wait::{RequestSlot, SessionSignal, WaitCoordinator, WaitRequest};
use crate::locking::wait_observer::WaitTarget;
use log::{debug, trace};
use parking_lot::MutexGuard;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// How many times a client holds a key in each mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeldCounts {
    pub shared: u32,
    pub exclusive: u32,
}

impl HeldCounts {
    pub fn count(&self, mode: LockMode) -> u32 {
        match mode {
            LockMode::Shared => self.shared,
            LockMode::Exclusive => self.exclusive,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.shared == 0 && self.exclusive == 0
    }

    pub(crate) fn increment(&mut self, mode: LockMode) {
        match mode {
            LockMode::Shared => self.shared += 1,
            LockMode::Exclusive => self.exclusive += 1,
        }
    }

    /// Returns false, leaving the counts untouched, if `mode` is not held.
    pub(crate) fn decrement(&mut self, mode: LockMode) -> bool {
        let count = match mode {
            LockMode::Shared => &mut self.shared,
            LockMode::Exclusive => &mut self.exclusive,
        };
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Strongest mode held, if any.
    pub fn mode(&self) -> Option<LockMode> {
        if self.exclusive > 0 {
            Some(LockMode::Exclusive)
        } else if self.shared > 0 {
            Some(LockMode::Shared)
        } else {
            None
        }
    }
}

#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) client: ClientId,
    pub(crate) mode: LockMode,
    pub(crate) enqueued_at: Instant,
    slot: Arc<RequestSlot>,
}

/// Holder and waiter state of one contended or held key.
#[derive(Debug)]
pub(crate) struct ResourceLockState {
    pub(crate) identity: u64,
    pub(crate) holders: HashMap<ClientId, HeldCounts>,
    pub(crate) waiters: VecDeque<PendingRequest>,
}

enum Admission {
    Granted,
    Blocked { position: usize },
}

impl ResourceLockState {
    fn new(identity: u64) -> Self {
        Self {
            identity,
            holders: HashMap::new(),
            waiters: VecDeque::new(),
        }
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.waiters.is_empty()
    }

    fn is_reentrant(&self, client: ClientId, mode: LockMode) -> bool {
        self.holders.get(&client).is_some_and(|held| match mode {
            LockMode::Shared => !held.is_empty(),
            LockMode::Exclusive => held.exclusive > 0,
        })
    }

    /// Compatibility with every holder other than `client`, ignoring the queue.
    fn compatible_with_others(&self, client: ClientId, mode: LockMode) -> bool {
        self.holders
            .iter()
            .filter(|(holder, _)| **holder != client)
            .all(|(_, held)| match mode {
                LockMode::Shared => held.exclusive == 0,
                LockMode::Exclusive => held.is_empty(),
            })
    }

    fn queue_position(&self, client: ClientId) -> usize {
        if !self.holders.contains_key(&client) {
            return self.waiters.len();
        }
        self.waiters
            .iter()
            .position(|waiter| !self.holders.contains_key(&waiter.client))
            .unwrap_or(self.waiters.len())
    }

    fn admit(&self, client: ClientId, mode: LockMode) -> Admission {
        if self.is_reentrant(client, mode) {
            return Admission::Granted;
        }
        let position = self.queue_position(client);
        if position == 0 && self.compatible_with_others(client, mode) {
            Admission::Granted
        } else {
            Admission::Blocked { position }
        }
    }

    fn grant(&mut self, client: ClientId, mode: LockMode) {
        self.holders.entry(client).or_default().increment(mode);
    }

    fn release(&mut self, client: ClientId, mode: LockMode) -> bool {
        let Some(held) = self.holders.get_mut(&client) else {
            return false;
        };
        if !held.decrement(mode) {
            return false;
        }
        if held.is_empty() {
            self.holders.remove(&client);
        }
        true
    }

    /// Grants queued requests from the front while they are compatible.
    fn promote(&mut self) -> usize {
        let mut granted = 0;
        while let Some(front) = self.waiters.front() {
            if !self.compatible_with_others(front.client, front.mode) {
                break;
            }
            let Some(request) = self.waiters.pop_front() else {
                break;
            };
            if request.slot.grant() {
                self.grant(request.client, request.mode);
                granted += 1;
            }
        }
        granted
    }

    fn withdraw(&mut self, slot: &Arc<RequestSlot>) {
        self.waiters
            .retain(|waiter| !Arc::ptr_eq(&waiter.slot, slot));
        self.promote();
    }
}

/// The calling client, as seen by the table.
#[derive(Clone, Copy)]
pub(crate) struct Requester<'a> {
    pub(crate) id: ClientId,
    pub(crate) signal: &'a SessionSignal,
}

/// Shared map of `(resource type, resource id)` to holder and waiter state.
pub struct LockTable {
    stripes: StripedMap<LockKey, ResourceLockState>,
    coordinator: Arc<WaitCoordinator>,
    identities: AtomicU64,
}

impl LockTable {
    pub fn new(stripes: usize, coordinator: Arc<WaitCoordinator>) -> Self {
        Self {
            stripes: StripedMap::new(stripes),
            coordinator,
            identities: AtomicU64::new(1),
        }
    }

    /// Acquires `mode` on every id in order, blocking per the type's wait strategy.
    ///
    /// Callers must present ids in the same order everywhere; nothing here
    /// reorders them or detects cycles. On failure, locks granted earlier in
    /// this call are released again before the error is returned.
    pub(crate) fn acquire_all(
        &self,
        requester: Requester<'_>,
        resource_type: &ResourceType,
        type_slot: usize,
        resource_ids: &[u64],
        mode: LockMode,
    ) -> Result<()> {
        for (index, resource_id) in resource_ids.iter().enumerate() {
            if let Err(err) =
                self.acquire(requester, resource_type, type_slot, *resource_id, mode)
            {
                for granted in resource_ids[..index].iter().rev() {
                    self.release(requester.id, resource_type, *granted, mode)?;
                }
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) fn acquire(
        &self,
        requester: Requester<'_>,
        resource_type: &ResourceType,
        type_slot: usize,
        resource_id: u64,
        mode: LockMode,
    ) -> Result<()> {
        let key = resource_type.key(resource_id);
        let stripe = self.stripes.stripe(&key);
        let mut guard = stripe.entries.lock();
        let state = self.state_for(&mut guard, key);

        let position = match state.admit(requester.id, mode) {
            Admission::Granted => {
                state.grant(requester.id, mode);
                self.coordinator.stats().record_grant();
                trace!(
                    "Granted {mode} lock on {} to client {}",
                    resource_type.describe(resource_id),
                    requester.id
                );
                return Ok(());
            }
            Admission::Blocked { position } => position,
        };

        let resource = resource_type.describe(resource_id);
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
        state.waiters.insert(
            position,
            PendingRequest {
                client: requester.id,
                mode,
                enqueued_at: Instant::now(),
                slot: slot.clone(),
            },
        );

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

    /// Grants `mode` only if that needs no waiting; never queues.
    pub(crate) fn try_acquire(
        &self,
        client: ClientId,
        resource_type: &ResourceType,
        resource_id: u64,
        mode: LockMode,
    ) -> bool {
        let key = resource_type.key(resource_id);
        let stripe = self.stripes.stripe(&key);
        let mut guard = stripe.entries.lock();
        let state = self.state_for(&mut guard, key);

        match state.admit(client, mode) {
            Admission::Granted => {
                state.grant(client, mode);
                self.coordinator.stats().record_grant();
                true
            }
            Admission::Blocked { .. } => false,
        }
    }

    pub(crate) fn release(
        &self,
        client: ClientId,
        resource_type: &ResourceType,
        resource_id: u64,
        mode: LockMode,
    ) -> Result<()> {
        self.release_counts(
            client,
            resource_type,
            resource_id,
            match mode {
                LockMode::Shared => HeldCounts {
                    shared: 1,
                    exclusive: 0,
                },
                LockMode::Exclusive => HeldCounts {
                    shared: 0,
                    exclusive: 1,
                },
            },
        )
    }

    /// Releases several holds of one key under a single stripe acquisition.
    ///
    /// Nothing is released unless the client holds at least `counts`.
    pub(crate) fn release_counts(
        &self,
        client: ClientId,
        resource_type: &ResourceType,
        resource_id: u64,
        counts: HeldCounts,
    ) -> Result<()> {
        let key = resource_type.key(resource_id);
        let stripe = self.stripes.stripe(&key);
        let mut guard = stripe.entries.lock();

        let invalid = |mode: LockMode| LockError::InvalidRelease {
            resource: resource_type.describe(resource_id),
            mode,
            session: client.0,
        };
        let Some(state) = guard.get_mut(&key) else {
            return Err(invalid(counts.mode().unwrap_or(LockMode::Shared)));
        };
        let held = state.holders.get(&client).copied().unwrap_or_default();
        for mode in [LockMode::Exclusive, LockMode::Shared] {
            if held.count(mode) < counts.count(mode) {
                return Err(invalid(mode));
            }
        }

        for mode in [LockMode::Exclusive, LockMode::Shared] {
            for _ in 0..counts.count(mode) {
                state.release(client, mode);
                self.coordinator.stats().record_release();
            }
        }

        let granted = state.promote();
        if state.is_idle() {
            guard.remove(&key);
        }
        drop(guard);

        if granted > 0 {
            debug!(
                "Release of {} by client {client} granted {granted} waiting request(s)",
                resource_type.describe(resource_id)
            );
            stripe.changed.notify_all();
        }
        Ok(())
    }

    /// Current holds of `client` on one key, as recorded by the table.
    pub fn held_by(&self, client: ClientId, key: LockKey) -> HeldCounts {
        self.stripes
            .stripe(&key)
            .entries
            .lock()
            .get(&key)
            .and_then(|state| state.holders.get(&client).copied())
            .unwrap_or_default()
    }

    /// Number of queued requests on one key.
    pub fn waiting_on(&self, key: LockKey) -> usize {
        self.stripes
            .stripe(&key)
            .entries
            .lock()
            .get(&key)
            .map(|state| state.waiters.len())
            .unwrap_or(0)
    }

    /// Number of keys with any holder or waiter.
    pub fn active_keys(&self) -> usize {
        self.stripes.entry_count()
    }

    pub(crate) fn wake_all(&self) {
        self.stripes.wake_all();
    }

    pub(crate) fn lock_all(&self) -> Vec<MutexGuard<'_, HashMap<LockKey, ResourceLockState>>> {
        self.stripes.lock_all()
    }

    fn state_for<'g>(
        &self,
        entries: &'g mut HashMap<LockKey, ResourceLockState>,
        key: LockKey,
    ) -> &'g mut ResourceLockState {
        entries
            .entry(key)
            .or_insert_with(|| ResourceLockState::new(self.next_identity()))
    }

    fn next_identity(&self) -> u64 {
        self.identities.fetch_add(1, Ordering::Relaxed)
    }
}

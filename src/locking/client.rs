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

//! Per-actor lock sessions.
//!
//! A [`ClientSession`] is the only way to take locks. It keeps its own ledger
//! of what it holds, which always equals its contribution to the shared
//! table, so that [`ClientSession::close`] can release everything in one
//! pass. The ledger mutex is never held while waiting for a lock; the stripe
//! mutexes are always taken after it, never before.

use crate::error::{LockError, Result};
use crate::locking::guard::LockGuard;
use crate::locking::manager::ManagerInner;
use crate::locking::mode::LockMode;
use crate::locking::resource::{ClientId, LockKey, ResourceType};
use crate::locking::table::{HeldCounts, Requester};
use crate::locking::temporal::{TemporalInterval, TemporalKey};
use crate::locking::wait::{SessionSignal, SessionState};
use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// One entry of [`ClientSession::held_locks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeldLock {
    pub key: LockKey,
    pub counts: HeldCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TemporalLedgerKey {
    key: TemporalKey,
    interval: TemporalInterval,
    exclusive: bool,
}

impl TemporalLedgerKey {
    fn mode(&self) -> LockMode {
        if self.exclusive {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        }
    }
}

#[derive(Debug, Default)]
struct SessionLedger {
    locks: BTreeMap<LockKey, HeldCounts>,
    temporal: BTreeMap<TemporalLedgerKey, u32>,
}

impl SessionLedger {
    fn record(&mut self, key: LockKey, mode: LockMode) {
        self.locks.entry(key).or_default().increment(mode);
    }

    fn forget(&mut self, key: LockKey, mode: LockMode) {
        if let Some(counts) = self.locks.get_mut(&key) {
            counts.decrement(mode);
            if counts.is_empty() {
                self.locks.remove(&key);
            }
        }
    }
}

/// A lock client, usually owned by one transaction.
///
/// Methods take `&self` and may be called from several threads; a waiting
/// call on one thread can be aborted with [`ClientSession::stop`] from another.
pub struct ClientSession {
    id: ClientId,
    manager: Arc<ManagerInner>,
    signal: Arc<SessionSignal>,
    ledger: Mutex<SessionLedger>,
}

impl ClientSession {
    pub(crate) fn new(id: ClientId, manager: Arc<ManagerInner>, signal: Arc<SessionSignal>) -> Self {
        Self {
            id,
            manager,
            signal,
            ledger: Mutex::new(SessionLedger::default()),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Stable identifier for correlating this session in logs and diagnostics.
    pub fn lock_session_id(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.id.0)
    }

    pub fn state(&self) -> SessionState {
        self.signal.state()
    }

    pub fn is_stopped(&self) -> bool {
        self.signal.state() == SessionState::Stopped
    }

    /// Acquires Shared on every id, in the order given.
    ///
    /// All call sites must present ids in one global order; on failure the
    /// ids granted earlier in this call are released again.
    pub fn acquire_shared(&self, resource_type: &ResourceType, resource_ids: &[u64]) -> Result<()> {
        self.acquire(resource_type, resource_ids, LockMode::Shared)
    }

    /// Acquires Exclusive on every id, in the order given. See [`ClientSession::acquire_shared`].
    pub fn acquire_exclusive(
        &self,
        resource_type: &ResourceType,
        resource_ids: &[u64],
    ) -> Result<()> {
        self.acquire(resource_type, resource_ids, LockMode::Exclusive)
    }

    /// Takes Exclusive on one id only if that needs no waiting.
    pub fn try_exclusive_lock(&self, resource_type: &ResourceType, resource_id: u64) -> Result<bool> {
        self.try_lock(resource_type, resource_id, LockMode::Exclusive)
    }

    /// Takes Shared on one id only if that needs no waiting.
    pub fn try_shared_lock(&self, resource_type: &ResourceType, resource_id: u64) -> Result<bool> {
        self.try_lock(resource_type, resource_id, LockMode::Shared)
    }

    pub fn release_shared(&self, resource_type: &ResourceType, resource_id: u64) -> Result<()> {
        self.release(resource_type, resource_id, LockMode::Shared)
    }

    pub fn release_exclusive(&self, resource_type: &ResourceType, resource_id: u64) -> Result<()> {
        self.release(resource_type, resource_id, LockMode::Exclusive)
    }

    /// Locks `[start, end]` of one property's value space in Shared mode.
    pub fn acquire_temporal_prop_shared(
        &self,
        resource_type: &ResourceType,
        entity_id: u64,
        property_key_id: u32,
        start: i64,
        end: i64,
    ) -> Result<()> {
        let interval = TemporalInterval::new(start, end)?;
        self.acquire_temporal(resource_type, entity_id, property_key_id, interval, LockMode::Shared)
    }

    /// Locks the single point `time` of one property's value space in Exclusive mode.
    pub fn acquire_temporal_prop_exclusive(
        &self,
        resource_type: &ResourceType,
        entity_id: u64,
        property_key_id: u32,
        time: i64,
    ) -> Result<()> {
        self.acquire_temporal(
            resource_type,
            entity_id,
            property_key_id,
            TemporalInterval::point(time),
            LockMode::Exclusive,
        )
    }

    pub fn release_temporal_prop_shared(
        &self,
        resource_type: &ResourceType,
        entity_id: u64,
        property_key_id: u32,
        start: i64,
        end: i64,
    ) -> Result<()> {
        let interval = TemporalInterval::new(start, end)?;
        self.release_temporal(resource_type, entity_id, property_key_id, interval, LockMode::Shared)
    }

    pub fn release_temporal_prop_exclusive(
        &self,
        resource_type: &ResourceType,
        entity_id: u64,
        property_key_id: u32,
        time: i64,
    ) -> Result<()> {
        self.release_temporal(
            resource_type,
            entity_id,
            property_key_id,
            TemporalInterval::point(time),
            LockMode::Exclusive,
        )
    }

    /// Acquires Exclusive on one id and releases it when the guard is dropped.
    pub fn exclusive_guard(
        &self,
        resource_type: &ResourceType,
        resource_id: u64,
    ) -> Result<LockGuard<'_>> {
        self.acquire(resource_type, &[resource_id], LockMode::Exclusive)?;
        Ok(LockGuard::new(self, resource_type.clone(), resource_id, LockMode::Exclusive))
    }

    /// Acquires Shared on one id and releases it when the guard is dropped.
    pub fn shared_guard(&self, resource_type: &ResourceType, resource_id: u64) -> Result<LockGuard<'_>> {
        self.acquire(resource_type, &[resource_id], LockMode::Shared)?;
        Ok(LockGuard::new(self, resource_type.clone(), resource_id, LockMode::Shared))
    }

    /// Ends every wait this session is blocked in with `StoppedWait`.
    ///
    /// Held locks are kept; further acquires fail until the session is closed.
    pub fn stop(&self) -> Result<()> {
        self.ensure_open()?;
        if self.signal.stop() {
            debug!("Stopped lock client {}", self.id);
            self.manager.wake_all();
        }
        Ok(())
    }

    /// Releases everything this session holds and makes it unusable.
    ///
    /// Every held entry is released in full regardless of its count. If some
    /// release fails, the remaining entries are still released and the first
    /// error is returned.
    pub fn close(&self) -> Result<()> {
        let mut ledger = self.ledger.lock();
        self.ensure_open()?;
        if self.signal.stop() {
            self.manager.wake_all();
        }

        let mut first_error = None;
        let locks = std::mem::take(&mut ledger.locks);
        for (key, counts) in locks {
            let result = self
                .manager
                .registry
                .by_id(key.type_id)
                .ok_or(LockError::UnknownResourceType(key.type_id))
                .and_then(|(resource_type, _)| {
                    self.manager
                        .table
                        .release_counts(self.id, resource_type, key.resource_id, counts)
                });
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }

        let temporal = std::mem::take(&mut ledger.temporal);
        for (entry, count) in temporal {
            let Some((resource_type, _)) = self.manager.registry.by_id(entry.key.type_id) else {
                first_error.get_or_insert(LockError::UnknownResourceType(entry.key.type_id));
                continue;
            };
            for _ in 0..count {
                if let Err(err) = self.manager.temporal.release(
                    self.id,
                    resource_type,
                    entry.key,
                    entry.interval,
                    entry.mode(),
                ) {
                    first_error.get_or_insert(err);
                    break;
                }
            }
        }

        self.signal.mark_closed();
        drop(ledger);
        self.manager.deregister(self.id);
        debug!("Closed lock client {}", self.id);

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// How many times this session holds `mode` on one resource.
    pub fn held_count(&self, resource_type: &ResourceType, resource_id: u64, mode: LockMode) -> u32 {
        self.ledger
            .lock()
            .locks
            .get(&resource_type.key(resource_id))
            .map(|counts| counts.count(mode))
            .unwrap_or(0)
    }

    /// Snapshot of the session's resource ledger, ordered by key.
    pub fn held_locks(&self) -> Vec<HeldLock> {
        self.ledger
            .lock()
            .locks
            .iter()
            .map(|(key, counts)| HeldLock {
                key: *key,
                counts: *counts,
            })
            .collect()
    }

    /// Number of distinct temporal intervals this session holds.
    pub fn held_interval_count(&self) -> usize {
        self.ledger.lock().temporal.len()
    }

    fn acquire(&self, resource_type: &ResourceType, resource_ids: &[u64], mode: LockMode) -> Result<()> {
        let (registered, type_slot) = self.manager.registry.resolve(resource_type)?;
        self.ensure_acquirable(|| match resource_ids {
            [single] => registered.describe(*single),
            _ => format!("{} {resource_ids:?}", registered.name()),
        })?;

        self.manager
            .table
            .acquire_all(self.requester(), registered, type_slot, resource_ids, mode)?;

        let mut ledger = self.ledger.lock();
        if let Err(err) = self.ensure_open() {
            drop(ledger);
            for resource_id in resource_ids.iter().rev() {
                self.manager
                    .table
                    .release(self.id, registered, *resource_id, mode)?;
            }
            return Err(err);
        }
        for resource_id in resource_ids {
            ledger.record(registered.key(*resource_id), mode);
        }
        Ok(())
    }

    fn try_lock(&self, resource_type: &ResourceType, resource_id: u64, mode: LockMode) -> Result<bool> {
        let (registered, _) = self.manager.registry.resolve(resource_type)?;
        let mut ledger = self.ledger.lock();
        self.ensure_open()?;
        if self.signal.is_stopped() {
            return Ok(false);
        }
        let granted = self
            .manager
            .table
            .try_acquire(self.id, registered, resource_id, mode);
        if granted {
            ledger.record(registered.key(resource_id), mode);
        }
        Ok(granted)
    }

    fn release(&self, resource_type: &ResourceType, resource_id: u64, mode: LockMode) -> Result<()> {
        let (registered, _) = self.manager.registry.resolve(resource_type)?;
        let mut ledger = self.open_ledger()?;
        self.manager
            .table
            .release(self.id, registered, resource_id, mode)
            .inspect_err(|err| self.stop_after_invalid_release(err))?;
        ledger.forget(registered.key(resource_id), mode);
        Ok(())
    }

    fn acquire_temporal(
        &self,
        resource_type: &ResourceType,
        entity_id: u64,
        property_key_id: u32,
        interval: TemporalInterval,
        mode: LockMode,
    ) -> Result<()> {
        let (registered, type_slot) = self.manager.registry.resolve(resource_type)?;
        let key = TemporalKey::new(registered.id(), entity_id, property_key_id);
        self.ensure_acquirable(|| crate::locking::temporal::describe(registered, &key, &interval))?;

        self.manager
            .temporal
            .acquire(self.requester(), registered, type_slot, key, interval, mode)?;

        let mut ledger = self.ledger.lock();
        if let Err(err) = self.ensure_open() {
            drop(ledger);
            self.manager
                .temporal
                .release(self.id, registered, key, interval, mode)?;
            return Err(err);
        }
        *ledger
            .temporal
            .entry(TemporalLedgerKey {
                key,
                interval,
                exclusive: mode.is_exclusive(),
            })
            .or_default() += 1;
        Ok(())
    }

    fn release_temporal(
        &self,
        resource_type: &ResourceType,
        entity_id: u64,
        property_key_id: u32,
        interval: TemporalInterval,
        mode: LockMode,
    ) -> Result<()> {
        let (registered, _) = self.manager.registry.resolve(resource_type)?;
        let key = TemporalKey::new(registered.id(), entity_id, property_key_id);
        let mut ledger = self.open_ledger()?;
        self.manager
            .temporal
            .release(self.id, registered, key, interval, mode)
            .inspect_err(|err| self.stop_after_invalid_release(err))?;

        let entry = TemporalLedgerKey {
            key,
            interval,
            exclusive: mode.is_exclusive(),
        };
        if let Some(count) = ledger.temporal.get_mut(&entry) {
            *count -= 1;
            if *count == 0 {
                ledger.temporal.remove(&entry);
            }
        }
        Ok(())
    }

    /// A release that does not match a hold stops the session. Held locks
    /// stay releasable and `close` still cleans up.
    fn stop_after_invalid_release(&self, err: &LockError) {
        if matches!(err, LockError::InvalidRelease { .. }) && self.signal.stop() {
            warn!("Stopped lock client {} after {err}", self.id);
            self.manager.wake_all();
        }
    }

    fn requester(&self) -> Requester<'_> {
        Requester {
            id: self.id,
            signal: &self.signal,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.signal.state() == SessionState::Closed {
            return Err(LockError::UseAfterClose { session: self.id.0 });
        }
        Ok(())
    }

    fn ensure_acquirable(&self, resource: impl FnOnce() -> String) -> Result<()> {
        match self.signal.state() {
            SessionState::Active => Ok(()),
            SessionState::Stopped => Err(LockError::StoppedWait {
                resource: resource(),
                session: self.id.0,
            }),
            SessionState::Closed => Err(LockError::UseAfterClose { session: self.id.0 }),
        }
    }

    fn open_ledger(&self) -> Result<MutexGuard<'_, SessionLedger>> {
        let ledger = self.ledger.lock();
        self.ensure_open()?;
        Ok(ledger)
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("state", &self.signal.state())
            .finish()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if self.signal.state() != SessionState::Closed
            && let Err(err) = self.close()
        {
            warn!("Failed to release locks of client {} on drop: {err}", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::manager::LockManager;
    use crate::locking::strategy::WaitStrategy;
    use crate::locking::timeout::LockTimeoutValue;

    fn node() -> ResourceType {
        ResourceType::new(
            0,
            "node",
            WaitStrategy::block(LockTimeoutValue::from_millis(50)),
        )
    }

    fn manager() -> LockManager {
        LockManager::new(vec![node()]).unwrap()
    }

    #[test]
    fn ledger_mirrors_reentrant_holds() {
        let manager = manager();
        let client = manager.new_client().unwrap();
        let node = node();

        client.acquire_exclusive(&node, &[1, 1]).unwrap();
        client.acquire_shared(&node, &[1]).unwrap();
        assert_eq!(client.held_count(&node, 1, LockMode::Exclusive), 2);
        assert_eq!(client.held_count(&node, 1, LockMode::Shared), 1);

        client.release_exclusive(&node, 1).unwrap();
        assert_eq!(
            client.held_locks(),
            vec![HeldLock {
                key: node.key(1),
                counts: HeldCounts {
                    shared: 1,
                    exclusive: 1
                }
            }]
        );
        assert_eq!(
            client.manager.table.held_by(client.id(), node.key(1)),
            client.held_locks()[0].counts
        );
    }

    #[test]
    fn close_releases_every_count() {
        let manager = manager();
        let first = manager.new_client().unwrap();
        let second = manager.new_client().unwrap();
        let node = node();

        first.acquire_exclusive(&node, &[5, 5, 5]).unwrap();
        first
            .acquire_temporal_prop_shared(&node, 5, 1, 0, 10)
            .unwrap();
        first.close().unwrap();

        assert!(second.try_exclusive_lock(&node, 5).unwrap());
        second
            .acquire_temporal_prop_exclusive(&node, 5, 1, 3)
            .unwrap();
    }

    #[test]
    fn closed_session_rejects_everything() {
        let manager = manager();
        let client = manager.new_client().unwrap();
        let node = node();
        client.close().unwrap();

        assert!(matches!(
            client.acquire_shared(&node, &[1]),
            Err(LockError::UseAfterClose { .. })
        ));
        assert!(matches!(
            client.release_shared(&node, 1),
            Err(LockError::UseAfterClose { .. })
        ));
        assert!(matches!(client.stop(), Err(LockError::UseAfterClose { .. })));
        assert!(matches!(client.close(), Err(LockError::UseAfterClose { .. })));
        assert!(matches!(
            client.lock_session_id(),
            Err(LockError::UseAfterClose { .. })
        ));
    }

    #[test]
    fn stopped_session_keeps_locks_and_refuses_new_ones() {
        let manager = manager();
        let client = manager.new_client().unwrap();
        let node = node();

        client.acquire_exclusive(&node, &[1]).unwrap();
        client.stop().unwrap();
        client.stop().unwrap();
        assert!(client.is_stopped());
        assert_eq!(client.held_count(&node, 1, LockMode::Exclusive), 1);

        assert!(client.acquire_shared(&node, &[2]).unwrap_err().is_stopped());
        assert!(!client.try_shared_lock(&node, 2).unwrap());
        client.release_exclusive(&node, 1).unwrap();
        client.close().unwrap();
    }

    #[test]
    fn unregistered_type_is_rejected() {
        let manager = manager();
        let client = manager.new_client().unwrap();
        let stranger = ResourceType::new(7, "label", WaitStrategy::FailFast);
        assert!(matches!(
            client.acquire_shared(&stranger, &[1]),
            Err(LockError::UnknownResourceType(7))
        ));
    }

    #[test]
    fn drop_releases_held_locks() {
        let manager = manager();
        let node = node();
        {
            let client = manager.new_client().unwrap();
            client.acquire_exclusive(&node, &[4]).unwrap();
        }
        let other = manager.new_client().unwrap();
        assert!(other.try_exclusive_lock(&node, 4).unwrap());
    }

    #[test]
    fn invalid_temporal_interval_is_rejected() {
        let manager = manager();
        let client = manager.new_client().unwrap();
        let node = node();
        assert!(matches!(
            client.acquire_temporal_prop_shared(&node, 1, 1, 9, 2),
            Err(LockError::InvalidInterval { start: 9, end: 2 })
        ));
        assert!(matches!(
            client.release_temporal_prop_exclusive(&node, 1, 1, 4),
            Err(LockError::InvalidRelease { .. })
        ));
    }
}

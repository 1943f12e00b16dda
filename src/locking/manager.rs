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

use crate::config::LockManagerConfig;
use crate::error::{LockError, Result};
use crate::locking::client::ClientSession;
use crate::locking::inspector::{self, LockSnapshotEntry, LockVisitor};
use crate::locking::resource::{ClientId, ResourceType};
use crate::locking::stats::LockStatsSnapshot;
use crate::locking::stripes::DEFAULT_STRIPES;
use crate::locking::table::LockTable;
use crate::locking::temporal::{TemporalKey, TemporalRangeIndex};
use crate::locking::wait::{SessionSignal, WaitCoordinator};
use crate::locking::wait_observer::{LockWaitObserver, LoggingWaitObserver};
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// The fixed set of resource types a manager was built with.
#[derive(Debug)]
pub(crate) struct ResourceRegistry {
    types: Vec<ResourceType>,
    slots: HashMap<u32, usize>,
}

impl ResourceRegistry {
    fn new(types: Vec<ResourceType>) -> Result<Self> {
        if types.is_empty() {
            return Err(LockError::FactoryMisconfiguration(
                "at least one resource type must be registered".to_string(),
            ));
        }

        let mut slots = HashMap::with_capacity(types.len());
        let mut names = HashSet::with_capacity(types.len());
        for (slot, resource_type) in types.iter().enumerate() {
            if resource_type.name().trim().is_empty() {
                return Err(LockError::FactoryMisconfiguration(format!(
                    "resource type {} has an empty name",
                    resource_type.id()
                )));
            }
            if slots.insert(resource_type.id(), slot).is_some() {
                return Err(LockError::FactoryMisconfiguration(format!(
                    "duplicate resource type id {}",
                    resource_type.id()
                )));
            }
            if !names.insert(resource_type.name()) {
                return Err(LockError::FactoryMisconfiguration(format!(
                    "duplicate resource type name '{}'",
                    resource_type.name()
                )));
            }
        }

        Ok(Self { types, slots })
    }

    pub(crate) fn by_id(&self, type_id: u32) -> Option<(&ResourceType, usize)> {
        let slot = *self.slots.get(&type_id)?;
        self.types.get(slot).map(|resource_type| (resource_type, slot))
    }

    /// Maps a caller's type to the registered instance.
    ///
    /// The registered instance is authoritative for the wait strategy; a type
    /// that shares an id but not a name with a registered one is unknown.
    pub(crate) fn resolve(&self, resource_type: &ResourceType) -> Result<(&ResourceType, usize)> {
        self.by_id(resource_type.id())
            .filter(|(registered, _)| registered.name() == resource_type.name())
            .ok_or(LockError::UnknownResourceType(resource_type.id()))
    }

    fn types(&self) -> &[ResourceType] {
        &self.types
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Initialized,
    Started,
    Stopped,
    Shutdown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleState::Created => "created",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Started => "started",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Shutdown => "shut down",
        };
        f.write_str(label)
    }
}

/// Construction parameters beyond the resource types.
#[derive(Clone)]
pub struct ManagerOptions {
    pub stripes: usize,
    pub observer: Arc<dyn LockWaitObserver>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            stripes: DEFAULT_STRIPES,
            observer: Arc::new(LoggingWaitObserver),
        }
    }
}

impl fmt::Debug for ManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerOptions")
            .field("stripes", &self.stripes)
            .finish_non_exhaustive()
    }
}

/// Average grant latency observed for one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeLatency {
    pub resource_type: String,
    #[serde(rename = "average_wait_us")]
    #[serde(serialize_with = "serialize_micros")]
    pub average_wait: Duration,
}

fn serialize_micros<S: serde::Serializer>(
    value: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_micros()).unwrap_or(u64::MAX))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub counters: LockStatsSnapshot,
    pub latency: Vec<TypeLatency>,
    pub live_clients: usize,
    pub active_keys: usize,
    pub active_temporal_keys: usize,
}

pub(crate) struct ManagerInner {
    pub(crate) registry: ResourceRegistry,
    pub(crate) coordinator: Arc<WaitCoordinator>,
    pub(crate) table: LockTable,
    pub(crate) temporal: TemporalRangeIndex,
    sessions: Mutex<HashMap<ClientId, Weak<SessionSignal>>>,
    lifecycle: Mutex<LifecycleState>,
    next_client: AtomicU64,
}

impl ManagerInner {
    pub(crate) fn deregister(&self, id: ClientId) {
        self.sessions.lock().remove(&id);
    }

    pub(crate) fn wake_all(&self) {
        self.table.wake_all();
        self.temporal.wake_all();
    }

    /// Stops every live session; returns how many were newly stopped.
    fn stop_sessions(&self) -> usize {
        let signals: Vec<Arc<SessionSignal>> = {
            let mut sessions = self.sessions.lock();
            sessions.retain(|_, signal| signal.strong_count() > 0);
            sessions.values().filter_map(Weak::upgrade).collect()
        };
        let stopped = signals.iter().filter(|signal| signal.stop()).count();
        if stopped > 0 {
            self.wake_all();
        }
        stopped
    }
}

/// Owner of the lock table, the temporal index and the session registry.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<ManagerInner>,
}

impl LockManager {
    pub fn new(resource_types: Vec<ResourceType>) -> Result<Self> {
        Self::with_options(resource_types, ManagerOptions::default())
    }

    pub fn with_options(resource_types: Vec<ResourceType>, options: ManagerOptions) -> Result<Self> {
        if options.stripes == 0 {
            return Err(LockError::FactoryMisconfiguration(
                "stripe count must be at least 1".to_string(),
            ));
        }
        let registry = ResourceRegistry::new(resource_types)?;
        let coordinator = Arc::new(WaitCoordinator::new(
            options.observer,
            registry.types().len(),
        ));
        debug!(
            "Creating lock manager with {} resource type(s) over {} stripe(s)",
            registry.types().len(),
            options.stripes
        );
        Ok(Self {
            inner: Arc::new(ManagerInner {
                table: LockTable::new(options.stripes, coordinator.clone()),
                temporal: TemporalRangeIndex::new(options.stripes, coordinator.clone()),
                coordinator,
                registry,
                sessions: Mutex::new(HashMap::new()),
                lifecycle: Mutex::new(LifecycleState::Created),
                next_client: AtomicU64::new(1),
            }),
        })
    }

    pub fn from_config(config: &LockManagerConfig) -> Result<Self> {
        Self::with_options(
            config.resource_types()?,
            ManagerOptions {
                stripes: config.stripes,
                ..ManagerOptions::default()
            },
        )
    }

    pub fn resource_types(&self) -> &[ResourceType] {
        self.inner.registry.types()
    }

    /// Looks up a registered type by name.
    pub fn resource_type(&self, name: &str) -> Option<&ResourceType> {
        self.resource_types()
            .iter()
            .find(|resource_type| resource_type.name() == name)
    }

    /// Opens a new session with a fresh id.
    pub fn new_client(&self) -> Result<ClientSession> {
        if *self.inner.lifecycle.lock() == LifecycleState::Shutdown {
            return Err(LockError::ManagerShutdown);
        }
        let id = ClientId(self.inner.next_client.fetch_add(1, Ordering::Relaxed));
        let signal = SessionSignal::new();
        self.inner
            .sessions
            .lock()
            .insert(id, Arc::downgrade(&signal));
        Ok(ClientSession::new(id, self.inner.clone(), signal))
    }

    pub fn lifecycle(&self) -> LifecycleState {
        *self.inner.lifecycle.lock()
    }

    pub fn init(&self) -> Result<()> {
        self.transition(&[LifecycleState::Created], LifecycleState::Initialized)
    }

    pub fn start(&self) -> Result<()> {
        self.transition(
            &[
                LifecycleState::Created,
                LifecycleState::Initialized,
                LifecycleState::Stopped,
            ],
            LifecycleState::Started,
        )
    }

    /// Aborts the pending waits of every live session. Held locks are kept.
    pub fn stop(&self) -> Result<()> {
        self.transition(&[LifecycleState::Started], LifecycleState::Stopped)?;
        let stopped = self.inner.stop_sessions();
        debug!("Stopped {stopped} lock client(s)");
        Ok(())
    }

    /// Stops every live session and refuses new ones. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if *lifecycle == LifecycleState::Shutdown {
                return Ok(());
            }
            *lifecycle = LifecycleState::Shutdown;
        }
        let stopped = self.inner.stop_sessions();
        info!("Lock manager shut down; stopped {stopped} live client(s)");
        Ok(())
    }

    /// Visits every held lock from a copied snapshot.
    pub fn accept(&self, visitor: &mut dyn LockVisitor) {
        inspector::accept(&self.inner, visitor);
    }

    pub fn snapshot(&self) -> Vec<LockSnapshotEntry> {
        inspector::snapshot(&self.inner)
    }

    /// Number of queued requests on one resource.
    pub fn waiting_on(&self, resource_type: &ResourceType, resource_id: u64) -> usize {
        self.inner.table.waiting_on(resource_type.key(resource_id))
    }

    /// Number of queued temporal requests on one property.
    pub fn temporal_waiting_on(
        &self,
        resource_type: &ResourceType,
        entity_id: u64,
        property_key_id: u32,
    ) -> usize {
        self.inner.temporal.waiting_on(TemporalKey::new(
            resource_type.id(),
            entity_id,
            property_key_id,
        ))
    }

    pub fn stats(&self) -> ManagerStats {
        let latency = self
            .resource_types()
            .iter()
            .enumerate()
            .map(|(slot, resource_type)| TypeLatency {
                resource_type: resource_type.name().to_string(),
                average_wait: self.inner.coordinator.latency().average(slot),
            })
            .collect();
        let live_clients = {
            let mut sessions = self.inner.sessions.lock();
            sessions.retain(|_, signal| signal.strong_count() > 0);
            sessions.len()
        };
        ManagerStats {
            counters: self.inner.coordinator.stats().snapshot(),
            latency,
            live_clients,
            active_keys: self.inner.table.active_keys(),
            active_temporal_keys: self.inner.temporal.active_keys(),
        }
    }

    fn transition(&self, from: &[LifecycleState], to: LifecycleState) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if *lifecycle == to {
            return Ok(());
        }
        if *lifecycle == LifecycleState::Shutdown {
            return Err(LockError::ManagerShutdown);
        }
        if !from.contains(&*lifecycle) {
            return Err(LockError::InvalidLifecycle {
                from: *lifecycle,
                to,
            });
        }
        *lifecycle = to;
        info!("Lock manager {to}");
        Ok(())
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("resource_types", &self.inner.registry.types())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::strategy::WaitStrategy;
    use crate::locking::timeout::LockTimeoutValue;
    use crate::locking::wait::SessionState;
    use std::thread;

    fn node() -> ResourceType {
        ResourceType::new(0, "node", WaitStrategy::block(LockTimeoutValue::Infinite))
    }

    #[test]
    fn rejects_invalid_type_sets() {
        assert!(matches!(
            LockManager::new(Vec::new()),
            Err(LockError::FactoryMisconfiguration(_))
        ));

        let duplicate_id = vec![node(), ResourceType::new(0, "label", WaitStrategy::FailFast)];
        match LockManager::new(duplicate_id) {
            Err(LockError::FactoryMisconfiguration(message)) => {
                assert!(message.contains("duplicate resource type id 0"));
            }
            other => panic!("Expected misconfiguration, got {other:?}"),
        }

        let duplicate_name = vec![node(), ResourceType::new(1, "node", WaitStrategy::FailFast)];
        assert!(matches!(
            LockManager::new(duplicate_name),
            Err(LockError::FactoryMisconfiguration(_))
        ));

        let blank = vec![ResourceType::new(0, " ", WaitStrategy::FailFast)];
        assert!(matches!(
            LockManager::new(blank),
            Err(LockError::FactoryMisconfiguration(_))
        ));
    }

    #[test]
    fn session_ids_are_unique() {
        let manager = LockManager::new(vec![node()]).unwrap();
        let first = manager.new_client().unwrap();
        let second = manager.new_client().unwrap();
        assert_ne!(
            first.lock_session_id().unwrap(),
            second.lock_session_id().unwrap()
        );
        assert_eq!(manager.stats().live_clients, 2);
        drop(first);
        assert_eq!(manager.stats().live_clients, 1);
    }

    #[test]
    fn lifecycle_moves_forward() {
        let manager = LockManager::new(vec![node()]).unwrap();
        assert_eq!(manager.lifecycle(), LifecycleState::Created);
        manager.init().unwrap();
        manager.start().unwrap();
        manager.start().unwrap();
        manager.stop().unwrap();
        manager.start().unwrap();
        assert_eq!(manager.lifecycle(), LifecycleState::Started);

        let fresh = LockManager::new(vec![node()]).unwrap();
        assert!(matches!(
            fresh.stop(),
            Err(LockError::InvalidLifecycle {
                from: LifecycleState::Created,
                to: LifecycleState::Stopped
            })
        ));
    }

    #[test]
    fn shutdown_stops_waiters_and_refuses_new_clients() {
        let manager = LockManager::new(vec![node()]).unwrap();
        let holder = manager.new_client().unwrap();
        holder.acquire_exclusive(&node(), &[1]).unwrap();

        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || {
                let client = manager.new_client().unwrap();
                let result = client.acquire_shared(&node(), &[1]);
                (result, client.state())
            })
        };
        while manager.waiting_on(&node(), 1) == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        manager.shutdown().unwrap();
        let (result, state) = waiter.join().unwrap();
        assert!(result.unwrap_err().is_stopped());
        assert_eq!(state, SessionState::Stopped);
        assert!(holder.is_stopped());
        assert!(matches!(manager.new_client(), Err(LockError::ManagerShutdown)));
        manager.shutdown().unwrap();
    }
}

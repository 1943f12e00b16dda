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

//! Point-in-time views of every held lock.
//!
//! All stripes of the resource table and then all stripes of the temporal
//! index are locked in index order, their state is copied, and every stripe
//! is released again before any visitor code runs.

use crate::locking::manager::ManagerInner;
use crate::locking::mode::LockMode;
use crate::locking::resource::{ClientId, ResourceType};
use crate::locking::temporal::TemporalInterval;
use serde::{Serialize, Serializer};
use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// Receives one call per held lock from [`crate::locking::LockManager::accept`].
pub trait LockVisitor {
    fn visit(
        &mut self,
        resource_type: &ResourceType,
        resource_id: u64,
        description: &str,
        estimated_wait: Duration,
        lock_identity: u64,
    );
}

impl<F> LockVisitor for F
where
    F: FnMut(&ResourceType, u64, &str, Duration, u64),
{
    fn visit(
        &mut self,
        resource_type: &ResourceType,
        resource_id: u64,
        description: &str,
        estimated_wait: Duration,
        lock_identity: u64,
    ) {
        self(
            resource_type,
            resource_id,
            description,
            estimated_wait,
            lock_identity,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockSnapshotKind {
    Resource,
    Temporal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HolderSnapshot {
    pub client: ClientId,
    pub mode: LockMode,
    pub count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<TemporalInterval>,
}

/// One held lock as seen by [`crate::locking::LockManager::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockSnapshotEntry {
    pub resource_type_id: u32,
    pub resource_type: String,
    pub resource_id: u64,
    pub kind: LockSnapshotKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_key_id: Option<u32>,
    pub holders: Vec<HolderSnapshot>,
    pub waiting: usize,
    pub description: String,
    #[serde(rename = "estimated_wait_ms", serialize_with = "serialize_millis")]
    pub estimated_wait: Duration,
    /// Age of the oldest queued request.
    #[serde(rename = "longest_wait_ms", serialize_with = "serialize_millis")]
    pub longest_wait: Duration,
    pub lock_identity: u64,
}

fn serialize_millis<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

struct RawEntry {
    type_id: u32,
    resource_id: u64,
    kind: LockSnapshotKind,
    property_key_id: Option<u32>,
    holders: Vec<HolderSnapshot>,
    waiting: usize,
    longest_wait: Duration,
    lock_identity: u64,
}

pub(crate) fn snapshot(manager: &ManagerInner) -> Vec<LockSnapshotEntry> {
    let raw = {
        let table = manager.table.lock_all();
        let temporal = manager.temporal.lock_all();
        let mut raw = Vec::new();

        for entries in table.iter() {
            for (key, state) in entries.iter() {
                if state.holders.is_empty() {
                    continue;
                }
                let mut holders: Vec<HolderSnapshot> = state
                    .holders
                    .iter()
                    .flat_map(|(client, counts)| {
                        [LockMode::Exclusive, LockMode::Shared]
                            .into_iter()
                            .filter(|mode| counts.count(*mode) > 0)
                            .map(|mode| HolderSnapshot {
                                client: *client,
                                mode,
                                count: counts.count(mode),
                                interval: None,
                            })
                    })
                    .collect();
                holders.sort_by_key(|holder| (holder.client, holder.mode == LockMode::Shared));
                raw.push(RawEntry {
                    type_id: key.type_id,
                    resource_id: key.resource_id,
                    kind: LockSnapshotKind::Resource,
                    property_key_id: None,
                    holders,
                    waiting: state.waiters.len(),
                    longest_wait: longest_wait(state.waiters.iter().map(|w| w.enqueued_at)),
                    lock_identity: state.identity,
                });
            }
        }

        for entries in temporal.iter() {
            for (key, state) in entries.iter() {
                if state.holds.is_empty() {
                    continue;
                }
                let mut holders: Vec<HolderSnapshot> = state
                    .holds
                    .iter()
                    .map(|hold| HolderSnapshot {
                        client: hold.client,
                        mode: hold.mode,
                        count: hold.count,
                        interval: Some(hold.interval),
                    })
                    .collect();
                holders.sort_by_key(|holder| (holder.interval, holder.client));
                raw.push(RawEntry {
                    type_id: key.type_id,
                    resource_id: key.entity_id,
                    kind: LockSnapshotKind::Temporal,
                    property_key_id: Some(key.property_key_id),
                    holders,
                    waiting: state.waiters.len(),
                    longest_wait: longest_wait(state.waiters.iter().map(|w| w.enqueued_at)),
                    lock_identity: state.identity,
                });
            }
        }
        raw
    };

    let mut entries: Vec<LockSnapshotEntry> = raw
        .into_iter()
        .filter_map(|entry| {
            let (resource_type, type_slot) = manager.registry.by_id(entry.type_id)?;
            let estimated_wait = manager
                .coordinator
                .latency()
                .estimate(type_slot, entry.waiting);
            Some(LockSnapshotEntry {
                resource_type_id: entry.type_id,
                resource_type: resource_type.name().to_string(),
                resource_id: entry.resource_id,
                description: describe(resource_type, &entry),
                kind: entry.kind,
                property_key_id: entry.property_key_id,
                holders: entry.holders,
                waiting: entry.waiting,
                estimated_wait,
                longest_wait: entry.longest_wait,
                lock_identity: entry.lock_identity,
            })
        })
        .collect();
    entries.sort_by_key(|entry| {
        (
            entry.resource_type_id,
            entry.resource_id,
            entry.kind,
            entry.property_key_id,
        )
    });
    entries
}

pub(crate) fn accept(manager: &ManagerInner, visitor: &mut dyn LockVisitor) {
    for entry in snapshot(manager) {
        let Some((resource_type, _)) = manager.registry.by_id(entry.resource_type_id) else {
            continue;
        };
        visitor.visit(
            resource_type,
            entry.resource_id,
            &entry.description,
            entry.estimated_wait,
            entry.lock_identity,
        );
    }
}

fn longest_wait(enqueued: impl Iterator<Item = Instant>) -> Duration {
    enqueued
        .map(|at| at.elapsed())
        .max()
        .unwrap_or_default()
}

fn describe(resource_type: &ResourceType, entry: &RawEntry) -> String {
    let mut text = resource_type.describe(entry.resource_id);
    if let Some(property_key_id) = entry.property_key_id {
        let _ = write!(text, " property {property_key_id}");
    }
    text.push_str(" held by ");
    for (index, holder) in entry.holders.iter().enumerate() {
        if index > 0 {
            text.push_str(", ");
        }
        let _ = write!(text, "client {} {}", holder.client, holder.mode);
        if let Some(interval) = holder.interval {
            let _ = write!(text, " {interval}");
        }
        if holder.count > 1 {
            let _ = write!(text, " x{}", holder.count);
        }
    }
    if entry.waiting > 0 {
        let _ = write!(text, "; {} waiting", entry.waiting);
    }
    text
}

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

use crate::locking::strategy::WaitStrategy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identity of a client (one per `ClientSession`, usually one per transaction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A category of lockable resources (nodes, relationships, index entries, schema objects).
///
/// Registered once when the `LockManager` is built and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceType {
    id: u32,
    name: Arc<str>,
    strategy: WaitStrategy,
}

impl ResourceType {
    pub fn new(id: u32, name: impl Into<Arc<str>>, strategy: WaitStrategy) -> Self {
        Self {
            id,
            name: name.into(),
            strategy,
        }
    }

    /// Unique among the types of one manager; preferably a dense sequence from 0.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wait_strategy(&self) -> &WaitStrategy {
        &self.strategy
    }

    pub fn key(&self, resource_id: u64) -> LockKey {
        LockKey::new(self.id, resource_id)
    }

    /// Human-readable label used for logging and error reporting.
    pub fn describe(&self, resource_id: u64) -> String {
        format!("{}({resource_id})", self.name)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Identity of one lockable resource: `(resource type, resource id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
    pub type_id: u32,
    pub resource_id: u64,
}

impl LockKey {
    pub const fn new(type_id: u32, resource_id: u64) -> Self {
        Self {
            type_id,
            resource_id,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type {} id {}", self.type_id, self.resource_id)
    }
}

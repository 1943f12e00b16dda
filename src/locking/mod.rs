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

pub mod client;
pub mod guard;
pub mod inspector;
pub mod manager;
pub mod mode;
pub mod resource;
pub mod stats;
pub mod strategy;
mod stripes;
pub mod table;
pub mod temporal;
pub mod timeout;
pub mod wait;
pub mod wait_observer;

pub use client::{ClientSession, HeldLock};
pub use guard::LockGuard;
pub use inspector::{HolderSnapshot, LockSnapshotEntry, LockSnapshotKind, LockVisitor};
pub use manager::{LifecycleState, LockManager, ManagerOptions, ManagerStats, TypeLatency};
pub use mode::LockMode;
pub use resource::{ClientId, LockKey, ResourceType};
pub use stats::{GrantLatency, LockStats, LockStatsSnapshot};
pub use strategy::WaitStrategy;
pub use table::{HeldCounts, LockTable};
pub use temporal::{TemporalInterval, TemporalKey, TemporalRangeIndex};
pub use timeout::{
    LockTimeoutResolution, LockTimeoutResolver, LockTimeoutSource, LockTimeoutValue,
    parse_timeout_override,
};
pub use wait::{LockTimeoutBudget, SessionState, WaitCoordinator};
pub use wait_observer::{LockWaitObserver, LoggingWaitObserver, NoopLockWaitObserver, WaitTarget};

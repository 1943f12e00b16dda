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

mod context;
mod exit_codes;
mod format;

pub use context::ErrorContext;
pub use exit_codes::get_exit_code;
pub use format::{format_error_chain, format_error_for_terminal};

use crate::locking::{LifecycleState, LockMode};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Timed out acquiring lock on {resource} after {waited:?}")]
    AcquireTimeout { resource: String, waited: Duration },

    #[error("Client {session} was stopped while waiting for lock on {resource}")]
    StoppedWait { resource: String, session: u64 },

    #[error("Client {session} released {mode} lock on {resource} that it does not hold")]
    InvalidRelease {
        resource: String,
        mode: LockMode,
        session: u64,
    },

    #[error("Client {session} has been closed")]
    UseAfterClose { session: u64 },

    #[error("Invalid temporal interval [{start}, {end}]")]
    InvalidInterval { start: i64, end: i64 },

    #[error("Resource type {0} is not registered with this lock manager")]
    UnknownResourceType(u32),

    #[error("Lock manager misconfigured: {0}")]
    FactoryMisconfiguration(String),

    #[error("Lock manager has been shut down")]
    ManagerShutdown,

    #[error("Lock manager cannot move from {from} to {to}")]
    InvalidLifecycle {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration file error: {0}")]
    ConfigFile(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LockError {
    /// Bounded wait expired, or the resource type fails fast on contention.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LockError::AcquireTimeout { .. })
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, LockError::StoppedWait { .. })
    }

    /// Contract violations by the caller. These are never retried.
    pub fn is_usage_fault(&self) -> bool {
        matches!(
            self,
            LockError::InvalidRelease { .. }
                | LockError::UseAfterClose { .. }
                | LockError::InvalidInterval { .. }
                | LockError::UnknownResourceType(_)
                | LockError::ManagerShutdown
                | LockError::InvalidLifecycle { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LockError>;

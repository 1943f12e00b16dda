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

//! The single place where a calling thread suspends.
//!
//! A queued request ends in exactly one of three ways: a grant (performed by
//! the releasing thread, which flips the request's [`RequestSlot`] while
//! holding the stripe), the timeout budget expiring, or the owning session
//! being stopped. The last two are decided by the waiting thread itself, also
//! while holding the stripe, and only if the slot is still `Waiting`.

use crate::error::{LockError, Result};
use crate::locking::resource::ClientId;
use crate::locking::stats::{GrantLatency, LockStats};
use crate::locking::strategy::WaitStrategy;
use crate::locking::timeout::LockTimeoutValue;
use crate::locking::wait_observer::{LockWaitObserver, WaitTarget};
use parking_lot::{Condvar, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// Tracks elapsed and remaining time for a lock timeout budget.
#[derive(Debug, Clone)]
pub struct LockTimeoutBudget {
    value: LockTimeoutValue,
    started_at: Instant,
}

impl LockTimeoutBudget {
    pub fn new(value: LockTimeoutValue) -> Self {
        Self {
            value,
            started_at: Instant::now(),
        }
    }

    pub fn with_start(value: LockTimeoutValue, started_at: Instant) -> Self {
        Self { value, started_at }
    }

    pub fn value(&self) -> LockTimeoutValue {
        self.value
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn remaining(&self) -> Option<Duration> {
        match self.value {
            LockTimeoutValue::Infinite => None,
            LockTimeoutValue::Finite(limit) => Some(limit.saturating_sub(self.elapsed())),
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.value, LockTimeoutValue::Finite(limit) if self.elapsed() >= limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestState {
    Waiting,
    Granted,
    Cancelled,
}

const WAITING: u8 = 0;
const GRANTED: u8 = 1;
const CANCELLED: u8 = 2;

/// State tag shared between a queued request and its waiting thread.
#[derive(Debug)]
pub(crate) struct RequestSlot(AtomicU8);

impl RequestSlot {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(WAITING)))
    }

    pub(crate) fn state(&self) -> RequestState {
        match self.0.load(Ordering::Acquire) {
            WAITING => RequestState::Waiting,
            GRANTED => RequestState::Granted,
            _ => RequestState::Cancelled,
        }
    }

    /// Returns false if the request was already cancelled.
    pub(crate) fn grant(&self) -> bool {
        self.transition(GRANTED)
    }

    /// Returns false if the request was already granted.
    pub(crate) fn cancel(&self) -> bool {
        self.transition(CANCELLED)
    }

    fn transition(&self, to: u8) -> bool {
        self.0
            .compare_exchange(WAITING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Stopped,
    Closed,
}

const ACTIVE: u8 = 0;
const STOPPED: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle flag of a client session, observed by its waiting threads.
#[derive(Debug)]
pub(crate) struct SessionSignal(AtomicU8);

impl SessionSignal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(ACTIVE)))
    }

    pub(crate) fn state(&self) -> SessionState {
        match self.0.load(Ordering::SeqCst) {
            ACTIVE => SessionState::Active,
            STOPPED => SessionState::Stopped,
            _ => SessionState::Closed,
        }
    }

    /// True once the session is stopped or closed; waits must end.
    pub(crate) fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst) != ACTIVE
    }

    /// Active → Stopped. Returns true if this call made the transition.
    pub(crate) fn stop(&self) -> bool {
        self.0
            .compare_exchange(ACTIVE, STOPPED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn mark_closed(&self) {
        self.0.store(CLOSED, Ordering::SeqCst);
    }
}

/// Describes one suspended request to the coordinator.
pub(crate) struct WaitRequest<'a> {
    pub(crate) target: WaitTarget<'a>,
    pub(crate) strategy: &'a WaitStrategy,
    pub(crate) type_slot: usize,
    pub(crate) slot: &'a RequestSlot,
    pub(crate) signal: &'a SessionSignal,
    pub(crate) session: ClientId,
}

/// Applies the per-resource-type wait strategy to requests that could not be granted.
pub struct WaitCoordinator {
    observer: Arc<dyn LockWaitObserver>,
    latency: GrantLatency,
    stats: LockStats,
}

impl WaitCoordinator {
    pub fn new(observer: Arc<dyn LockWaitObserver>, type_slots: usize) -> Self {
        Self {
            observer,
            latency: GrantLatency::new(type_slots),
            stats: LockStats::new(),
        }
    }

    pub fn stats(&self) -> &LockStats {
        &self.stats
    }

    pub fn latency(&self) -> &GrantLatency {
        &self.latency
    }

    /// The error a `FailFast` resource type reports on conflict.
    pub(crate) fn reject(&self, target: &WaitTarget<'_>) -> LockError {
        self.stats.record_timeout();
        self.observer.on_timeout(target, Duration::ZERO);
        LockError::AcquireTimeout {
            resource: target.resource.to_string(),
            waited: Duration::ZERO,
        }
    }

    /// Suspends until the queued request is granted, its budget expires or its session stops.
    ///
    /// `guard` must be the stripe that holds the request, and `changed` that
    /// stripe's condition variable. On timeout or stop, `withdraw` is called
    /// with the stripe still held to remove the request from its queue and
    /// promote whatever that unblocks.
    pub(crate) fn await_grant<T>(
        &self,
        request: WaitRequest<'_>,
        guard: &mut MutexGuard<'_, T>,
        changed: &Condvar,
        mut withdraw: impl FnMut(&mut T),
    ) -> Result<()> {
        let budget = LockTimeoutBudget::new(request.strategy.timeout());
        let mut spins_left = request.strategy.spins();
        self.stats.record_wait();
        self.observer.on_wait_start(&request.target, budget.value());

        loop {
            if request.slot.state() == RequestState::Granted {
                let waited = budget.elapsed();
                self.latency.record(request.type_slot, waited);
                self.observer.on_acquired(&request.target, waited);
                return Ok(());
            }

            let stopped = request.signal.is_stopped();
            if (stopped || budget.is_expired()) && request.slot.cancel() {
                withdraw(guard);
                changed.notify_all();
                let waited = budget.elapsed();
                let resource = request.target.resource.to_string();
                return if stopped {
                    self.stats.record_stopped_wait();
                    self.observer.on_cancelled(&request.target, waited);
                    Err(LockError::StoppedWait {
                        resource,
                        session: request.session.0,
                    })
                } else {
                    self.stats.record_timeout();
                    self.observer.on_timeout(&request.target, waited);
                    Err(LockError::AcquireTimeout { resource, waited })
                };
            }

            if spins_left > 0 {
                spins_left -= 1;
                self.observer
                    .on_spin(&request.target, request.strategy.spins() - spins_left);
                MutexGuard::unlocked(guard, || {
                    std::hint::spin_loop();
                    std::thread::yield_now();
                });
                continue;
            }

            match budget.remaining() {
                Some(remaining) => {
                    changed.wait_for(guard, remaining);
                }
                None => changed.wait(guard),
            }
        }
    }
}

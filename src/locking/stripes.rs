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

//! Striped key → state maps.
//!
//! Keys are hashed onto a fixed number of stripes, each with its own mutex and
//! condition variable, so requests for unrelated resources rarely touch the
//! same lock. Waiters park on the condition variable of their key's stripe.
//! At most one stripe is held at a time except by [`StripedMap::lock_all`],
//! which always locks in index order.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

pub(crate) const DEFAULT_STRIPES: usize = 64;

pub(crate) struct Stripe<K, S> {
    pub(crate) entries: Mutex<HashMap<K, S>>,
    pub(crate) changed: Condvar,
}

impl<K, S> Stripe<K, S> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
        }
    }
}

pub(crate) struct StripedMap<K, S> {
    stripes: Box<[Stripe<K, S>]>,
    mask: usize,
}

impl<K: Hash + Eq, S> StripedMap<K, S> {
    /// `count` is rounded up to a power of two.
    pub(crate) fn new(count: usize) -> Self {
        let count = count.max(1).next_power_of_two();
        let stripes = (0..count).map(|_| Stripe::new()).collect();
        Self {
            stripes,
            mask: count - 1,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.stripes.len()
    }

    pub(crate) fn stripe(&self, key: &K) -> &Stripe<K, S> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) & self.mask;
        &self.stripes[index]
    }

    /// Wakes every parked waiter so it re-checks its stop flag.
    ///
    /// The stripe mutex is taken before notifying: a waiter that checked the
    /// flag before it was set is then guaranteed to be parked already.
    pub(crate) fn wake_all(&self) {
        for stripe in self.stripes.iter() {
            drop(stripe.entries.lock());
            stripe.changed.notify_all();
        }
    }

    pub(crate) fn lock_all(&self) -> Vec<MutexGuard<'_, HashMap<K, S>>> {
        self.stripes
            .iter()
            .map(|stripe| stripe.entries.lock())
            .collect()
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.stripes
            .iter()
            .map(|stripe| stripe.entries.lock().len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stripe_count_rounds_to_power_of_two() {
        let map: StripedMap<u64, ()> = StripedMap::new(48);
        assert_eq!(map.len(), 64);
        let single: StripedMap<u64, ()> = StripedMap::new(0);
        assert_eq!(single.len(), 1);
    }

    #[test]
    fn same_key_maps_to_same_stripe() {
        let map: StripedMap<u64, u32> = StripedMap::new(16);
        map.stripe(&7).entries.lock().insert(7, 1);
        assert_eq!(map.stripe(&7).entries.lock().get(&7), Some(&1));
        assert_eq!(map.entry_count(), 1);
    }

    #[test]
    fn lock_all_covers_every_stripe() {
        let map: StripedMap<u64, u32> = StripedMap::new(8);
        for key in 0..32 {
            map.stripe(&key).entries.lock().insert(key, 0);
        }
        let guards = map.lock_all();
        let total: usize = guards.iter().map(|guard| guard.len()).sum();
        assert_eq!(guards.len(), 8);
        assert_eq!(total, 32);
    }
}

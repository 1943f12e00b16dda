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

use crate::error::Result;
use crate::locking::client::ClientSession;
use crate::locking::mode::LockMode;
use crate::locking::resource::ResourceType;
use log::warn;

/// RAII guard that releases one resource lock when dropped.
pub struct LockGuard<'a> {
    session: &'a ClientSession,
    resource_type: ResourceType,
    resource_id: u64,
    mode: LockMode,
    held: bool,
}

impl<'a> LockGuard<'a> {
    pub(crate) fn new(
        session: &'a ClientSession,
        resource_type: ResourceType,
        resource_id: u64,
        mode: LockMode,
    ) -> Self {
        Self {
            session,
            resource_type,
            resource_id,
            mode,
            held: true,
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn resource_id(&self) -> u64 {
        self.resource_id
    }

    pub fn release(mut self) -> Result<()> {
        self.release_once()
    }

    fn release_once(&mut self) -> Result<()> {
        if !std::mem::take(&mut self.held) {
            return Ok(());
        }
        match self.mode {
            LockMode::Shared => self
                .session
                .release_shared(&self.resource_type, self.resource_id),
            LockMode::Exclusive => self
                .session
                .release_exclusive(&self.resource_type, self.resource_id),
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release_once() {
            warn!(
                "Failed to release {} lock on {}: {err}",
                self.mode,
                self.resource_type.describe(self.resource_id)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::locking::manager::LockManager;
    use crate::locking::mode::LockMode;
    use crate::locking::resource::ResourceType;
    use crate::locking::strategy::WaitStrategy;

    fn relationship() -> ResourceType {
        ResourceType::new(1, "relationship", WaitStrategy::FailFast)
    }

    #[test]
    fn guard_release_allows_reacquire() {
        let manager = LockManager::new(vec![relationship()]).unwrap();
        let owner = manager.new_client().unwrap();
        let other = manager.new_client().unwrap();
        let relationship = relationship();
        {
            let guard = owner.exclusive_guard(&relationship, 8).unwrap();
            assert_eq!(guard.mode(), LockMode::Exclusive);
            assert!(!other.try_shared_lock(&relationship, 8).unwrap());
        }
        assert!(other.try_shared_lock(&relationship, 8).unwrap());
    }

    #[test]
    fn explicit_release_returns_ok() {
        let manager = LockManager::new(vec![relationship()]).unwrap();
        let owner = manager.new_client().unwrap();
        let relationship = relationship();
        let guard = owner.shared_guard(&relationship, 2).unwrap();
        guard.release().unwrap();
        assert_eq!(owner.held_count(&relationship, 2, LockMode::Shared), 0);
    }

    #[test]
    fn guard_after_close_only_warns() {
        let manager = LockManager::new(vec![relationship()]).unwrap();
        let owner = manager.new_client().unwrap();
        let relationship = relationship();
        let guard = owner.exclusive_guard(&relationship, 3).unwrap();
        owner.close().unwrap();
        assert!(guard.release().is_err());
    }
}

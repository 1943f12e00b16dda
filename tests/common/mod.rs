#![allow(dead_code)]

use graphlock::locking::{LockManager, LockTimeoutValue, ResourceType, WaitStrategy};
use std::time::{Duration, Instant};

pub const NODE: u32 = 0;
pub const RELATIONSHIP: u32 = 1;

pub fn node(timeout: LockTimeoutValue) -> ResourceType {
    ResourceType::new(NODE, "node", WaitStrategy::block(timeout))
}

pub fn relationship() -> ResourceType {
    ResourceType::new(
        RELATIONSHIP,
        "relationship",
        WaitStrategy::SpinThenBlock {
            spins: 16,
            timeout: LockTimeoutValue::from_secs(10),
        },
    )
}

/// A manager over `node` (10s block) and `relationship` (spin then block).
pub fn manager() -> (LockManager, ResourceType, ResourceType) {
    let node = node(LockTimeoutValue::from_secs(10));
    let relationship = relationship();
    let manager = LockManager::new(vec![node.clone(), relationship.clone()]).unwrap();
    (manager, node, relationship)
}

/// Polls `condition` until it holds, panicking after five seconds.
pub fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "Timed out waiting until {description}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

mod common;

use common::{manager, wait_until};
use graphlock::config::LockManagerConfig;
use graphlock::error::LockError;
use graphlock::locking::{LifecycleState, LockManager, LockMode, SessionState, WaitStrategy};
use std::thread;

#[test]
fn manager_from_config_registers_declared_types() {
    let config = LockManagerConfig::from_toml_str(
        r#"
default_timeout = "1s"
stripes = 8

[[resource_types]]
id = 0
name = "node"

[[resource_types]]
id = 3
name = "schema"
strategy = "fail_fast"
"#,
    )
    .unwrap();
    let manager = LockManager::from_config(&config).unwrap();

    assert_eq!(manager.resource_types().len(), 2);
    let schema = manager.resource_type("schema").unwrap().clone();
    assert_eq!(*schema.wait_strategy(), WaitStrategy::FailFast);
    assert!(manager.resource_type("label").is_none());

    let client = manager.new_client().unwrap();
    client.acquire_exclusive(&schema, &[1]).unwrap();
    client.close().unwrap();
}

#[test]
fn zero_stripes_is_a_misconfiguration() {
    let config = LockManagerConfig::from_toml_str("stripes = 0").unwrap();
    assert!(matches!(
        LockManager::from_config(&config),
        Err(LockError::FactoryMisconfiguration(_))
    ));
}

#[test]
fn unregistered_type_is_rejected() {
    let (manager, _, _) = manager();
    let client = manager.new_client().unwrap();
    let label = graphlock::locking::ResourceType::new(9, "label", WaitStrategy::FailFast);

    assert!(matches!(
        client.acquire_shared(&label, &[1]),
        Err(LockError::UnknownResourceType(9))
    ));
    assert!(matches!(
        client.try_exclusive_lock(&label, 1),
        Err(LockError::UnknownResourceType(9))
    ));
}

#[test]
fn manager_stop_aborts_waits_and_allows_restart() {
    let (manager, node, _) = manager();
    manager.init().unwrap();
    manager.start().unwrap();

    let holder = manager.new_client().unwrap();
    let waiter = manager.new_client().unwrap();
    holder.acquire_exclusive(&node, &[1]).unwrap();

    thread::scope(|scope| {
        let blocked = scope.spawn(|| waiter.acquire_shared(&node, &[1]));
        wait_until("the waiter queues", || manager.waiting_on(&node, 1) == 1);
        manager.stop().unwrap();
        assert!(blocked.join().unwrap().unwrap_err().is_stopped());
    });

    assert_eq!(manager.lifecycle(), LifecycleState::Stopped);
    assert_eq!(waiter.state(), SessionState::Stopped);
    assert_eq!(holder.held_count(&node, 1, LockMode::Exclusive), 1);

    // Stopped sessions may still release.
    holder.release_exclusive(&node, 1).unwrap();
    assert!(matches!(
        holder.acquire_exclusive(&node, &[1]),
        Err(LockError::StoppedWait { .. })
    ));
    assert!(!holder.try_shared_lock(&node, 1).unwrap());

    manager.start().unwrap();
    let fresh = manager.new_client().unwrap();
    fresh.acquire_exclusive(&node, &[1]).unwrap();
}

#[test]
fn shutdown_is_final() {
    let (manager, node, _) = manager();
    let client = manager.new_client().unwrap();
    client.acquire_shared(&node, &[5]).unwrap();

    manager.shutdown().unwrap();
    assert_eq!(manager.lifecycle(), LifecycleState::Shutdown);
    assert!(client.is_stopped());
    assert!(matches!(manager.new_client(), Err(LockError::ManagerShutdown)));
    assert!(matches!(manager.start(), Err(LockError::ManagerShutdown)));

    client.close().unwrap();
    assert!(manager.snapshot().is_empty());
}

#[test]
fn closed_session_refuses_every_call() {
    let (manager, node, _) = manager();
    let client = manager.new_client().unwrap();
    let id = client.lock_session_id().unwrap();
    assert_eq!(id, client.id().0);

    client.close().unwrap();
    assert_eq!(client.state(), SessionState::Closed);
    assert!(matches!(client.close(), Err(LockError::UseAfterClose { .. })));
    assert!(matches!(client.stop(), Err(LockError::UseAfterClose { .. })));
    assert!(matches!(
        client.lock_session_id(),
        Err(LockError::UseAfterClose { .. })
    ));
    assert!(matches!(
        client.try_shared_lock(&node, 1),
        Err(LockError::UseAfterClose { .. })
    ));
    assert!(matches!(
        client.acquire_temporal_prop_exclusive(&node, 1, 1, 0),
        Err(LockError::UseAfterClose { .. })
    ));
    assert_eq!(manager.stats().live_clients, 0);
}

#[test]
fn dropping_a_session_releases_its_locks() {
    let (manager, node, relationship) = manager();
    {
        let client = manager.new_client().unwrap();
        client.acquire_exclusive(&node, &[1]).unwrap();
        client.acquire_shared(&relationship, &[2, 2]).unwrap();
        client
            .acquire_temporal_prop_exclusive(&node, 1, 7, 42)
            .unwrap();
    }
    assert!(manager.snapshot().is_empty());
    assert_eq!(manager.stats().live_clients, 0);

    let fresh = manager.new_client().unwrap();
    {
        let guard = fresh.exclusive_guard(&node, 1).unwrap();
        assert_eq!(guard.mode(), LockMode::Exclusive);
        assert_eq!(guard.resource_id(), 1);
        assert_eq!(fresh.held_count(&node, 1, LockMode::Exclusive), 1);
    }
    assert_eq!(fresh.held_count(&node, 1, LockMode::Exclusive), 0);
}

#[test]
fn invalid_release_stops_the_session() {
    let (manager, node, _) = manager();
    let client = manager.new_client().unwrap();
    client.acquire_shared(&node, &[1, 2]).unwrap();

    assert!(matches!(
        client.release_exclusive(&node, 1),
        Err(LockError::InvalidRelease { .. })
    ));
    assert_eq!(client.state(), SessionState::Stopped);
    assert!(matches!(
        client.acquire_shared(&node, &[3]),
        Err(LockError::StoppedWait { .. })
    ));
    assert!(!client.try_exclusive_lock(&node, 3).unwrap());

    client.release_shared(&node, 1).unwrap();
    assert_eq!(client.held_count(&node, 1, LockMode::Shared), 0);
    client.close().unwrap();
    assert!(manager.snapshot().is_empty());

    let temporal = manager.new_client().unwrap();
    assert!(matches!(
        temporal.release_temporal_prop_shared(&node, 1, 1, 0, 5),
        Err(LockError::InvalidRelease { .. })
    ));
    assert!(temporal.is_stopped());
}

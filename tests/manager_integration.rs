// Integration tests for the leadership manager over the in-memory lease store

use leadership::lease::{ClientError, MemoryClient, MemoryStore};
use leadership::test_utils::{almost_seconds, init_tracing, offset, VirtualClock};
use leadership::{Error, Manager, ManagerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const SETTLE: Duration = Duration::from_millis(20);
const PATIENCE: Duration = Duration::from_secs(5);

struct Fixture {
    clock: Arc<VirtualClock>,
    store: Arc<MemoryStore>,
    manager: Manager,
}

async fn setup() -> Fixture {
    init_tracing();
    let clock = Arc::new(VirtualClock::default());
    let store = MemoryStore::new(clock.clone());
    let client = Arc::new(MemoryClient::new(store.clone()));
    let manager = Manager::new(ManagerConfig::new(clock.clone(), client)).unwrap();
    // The loop arms its first alarm once it is running.
    clock.wait_for_alarms(1).await;
    Fixture {
        clock,
        store,
        manager,
    }
}

fn spawn_waiter(manager: &Manager, name: &str, cancel: CancellationToken) -> JoinHandle<leadership::Result<()>> {
    let manager = manager.clone();
    let name = name.to_string();
    tokio::spawn(async move { manager.block_until_leadership_released(&name, cancel).await })
}

async fn shutdown(manager: &Manager) {
    manager.kill();
    assert_eq!(manager.wait().await, Ok(()));
}

#[tokio::test]
async fn test_claim_check_and_claim_after_expiry() {
    let fix = setup().await;
    let manager = &fix.manager;

    manager
        .claim_leadership("svc-1", "unit-0", Duration::from_secs(60))
        .await
        .unwrap();

    fix.clock.advance(Duration::from_secs(30));
    let token = manager.leadership_check("svc-1", "unit-0").await.unwrap();
    assert_eq!(token.valid_as_of(), offset(Duration::from_secs(30)));
    assert_eq!(
        manager.leadership_check("svc-1", "unit-1").await.unwrap_err(),
        Error::NotLeader {
            name: "svc-1".to_string(),
            holder: "unit-1".to_string()
        }
    );

    fix.clock.advance(Duration::from_secs(31));
    manager
        .claim_leadership("svc-1", "unit-1", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(manager.leadership_check("svc-1", "unit-1").await.is_ok());
    assert_eq!(fix.store.get("svc-1").unwrap().holder, "unit-1");

    shutdown(manager).await;
}

#[tokio::test]
async fn test_reclaim_never_shortens_expiry() {
    let fix = setup().await;
    let manager = &fix.manager;

    manager
        .claim_leadership("svc", "unit-0", Duration::from_secs(60))
        .await
        .unwrap();
    fix.clock.advance(Duration::from_secs(10));

    manager
        .claim_leadership("svc", "unit-0", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(fix.store.get("svc").unwrap().expiry, offset(Duration::from_secs(60)));

    manager
        .claim_leadership("svc", "unit-0", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(fix.store.get("svc").unwrap().expiry, offset(Duration::from_secs(70)));

    shutdown(manager).await;
}

#[tokio::test]
async fn test_other_holder_refused_until_expiry() {
    let fix = setup().await;
    let manager = &fix.manager;

    manager
        .claim_leadership("svc", "unit-0", Duration::from_secs(60))
        .await
        .unwrap();

    fix.clock.advance(almost_seconds(60));
    assert_eq!(
        manager
            .claim_leadership("svc", "unit-1", Duration::from_secs(60))
            .await
            .unwrap_err(),
        Error::LeaseHeldByOther {
            name: "svc".to_string(),
            holder: "unit-0".to_string()
        }
    );
    assert!(manager.leadership_check("svc", "unit-0").await.is_ok());

    fix.clock.advance(Duration::from_nanos(1));
    assert!(manager.leadership_check("svc", "unit-0").await.is_err());
    manager
        .claim_leadership("svc", "unit-1", Duration::from_secs(60))
        .await
        .unwrap();

    shutdown(manager).await;
}

#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
    let fix = setup().await;

    let claims: Vec<_> = ["unit-a", "unit-b"]
        .into_iter()
        .map(|holder| {
            let manager = fix.manager.clone();
            tokio::spawn(async move {
                manager
                    .claim_leadership("svc-2", holder, Duration::from_secs(60))
                    .await
            })
        })
        .collect();

    let mut won = 0;
    let mut lost = 0;
    for claim in claims {
        match claim.await.unwrap() {
            Ok(()) => won += 1,
            Err(Error::LeaseHeldByOther { .. }) => lost += 1,
            Err(other) => panic!("unexpected claim result: {other}"),
        }
    }
    assert_eq!((won, lost), (1, 1));

    shutdown(&fix.manager).await;
}

#[tokio::test]
async fn test_at_most_one_check_succeeds() {
    let fix = setup().await;
    let manager = &fix.manager;
    let holders = ["unit-0", "unit-1", "unit-2"];

    manager
        .claim_leadership("svc", "unit-1", Duration::from_secs(60))
        .await
        .unwrap();

    for step in [Duration::ZERO, Duration::from_secs(30), almost_seconds(30)] {
        fix.clock.advance(step);
        let mut leaders = 0;
        for holder in holders {
            if manager.leadership_check("svc", holder).await.is_ok() {
                leaders += 1;
            }
        }
        assert_eq!(leaders, 1);
    }

    shutdown(manager).await;
}

#[tokio::test]
async fn test_waiter_released_on_expiry() {
    let fix = setup().await;
    let manager = &fix.manager;

    manager
        .claim_leadership("svc-3", "unit-x", Duration::from_secs(60))
        .await
        .unwrap();
    let waiter = spawn_waiter(manager, "svc-3", CancellationToken::new());

    sleep(SETTLE).await;
    fix.clock.advance(almost_seconds(60));
    sleep(SETTLE).await;
    assert!(!waiter.is_finished());

    fix.clock.advance(Duration::from_secs(1));
    let result = timeout(PATIENCE, waiter).await.unwrap().unwrap();
    assert_eq!(result, Ok(()));
    assert!(fix.store.get("svc-3").is_none());

    shutdown(manager).await;
}

#[tokio::test]
async fn test_release_wakes_all_waiters() {
    let fix = setup().await;
    let manager = &fix.manager;

    manager
        .claim_leadership("svc", "unit-0", Duration::from_secs(60))
        .await
        .unwrap();
    let first = spawn_waiter(manager, "svc", CancellationToken::new());
    let second = spawn_waiter(manager, "svc", CancellationToken::new());
    sleep(SETTLE).await;
    assert!(!first.is_finished());
    assert!(!second.is_finished());

    assert_eq!(
        manager.release_leadership("svc", "unit-1").await,
        Err(Error::LeaseNotOwned {
            name: "svc".to_string(),
            holder: "unit-1".to_string()
        })
    );
    manager.release_leadership("svc", "unit-0").await.unwrap();

    assert_eq!(timeout(PATIENCE, first).await.unwrap().unwrap(), Ok(()));
    assert_eq!(timeout(PATIENCE, second).await.unwrap().unwrap(), Ok(()));
    manager
        .claim_leadership("svc", "unit-1", Duration::from_secs(60))
        .await
        .unwrap();

    shutdown(manager).await;
}

#[tokio::test]
async fn test_cancelled_waiter_leaves_others() {
    let fix = setup().await;
    let manager = &fix.manager;

    manager
        .claim_leadership("svc", "unit-0", Duration::from_secs(60))
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    let cancelled = spawn_waiter(manager, "svc", cancel.clone());
    let patient = spawn_waiter(manager, "svc", CancellationToken::new());
    sleep(SETTLE).await;

    cancel.cancel();
    assert_eq!(
        timeout(PATIENCE, cancelled).await.unwrap().unwrap(),
        Err(Error::Cancelled)
    );
    assert!(!patient.is_finished());

    manager.release_leadership("svc", "unit-0").await.unwrap();
    assert_eq!(timeout(PATIENCE, patient).await.unwrap().unwrap(), Ok(()));

    shutdown(manager).await;
}

#[tokio::test]
async fn test_block_on_free_lease_returns_immediately() {
    let fix = setup().await;
    let result = timeout(
        PATIENCE,
        fix.manager
            .block_until_leadership_released("svc", CancellationToken::new()),
    )
    .await
    .unwrap();
    assert_eq!(result, Ok(()));

    shutdown(&fix.manager).await;
}

#[tokio::test]
async fn test_token_lapses_with_lease() {
    let fix = setup().await;
    let manager = &fix.manager;

    manager
        .claim_leadership("svc", "unit-0", Duration::from_secs(60))
        .await
        .unwrap();
    let token = manager.leadership_check("svc", "unit-0").await.unwrap();
    assert_eq!(token.name(), "svc");
    assert_eq!(token.holder(), "unit-0");

    fix.clock.advance(almost_seconds(60));
    assert_eq!(token.clone().check().await, Ok(()));

    fix.clock.advance(Duration::from_nanos(1));
    assert_eq!(
        token.check().await,
        Err(Error::NotLeader {
            name: "svc".to_string(),
            holder: "unit-0".to_string()
        })
    );

    shutdown(manager).await;
}

#[tokio::test]
async fn test_token_follows_renewal() {
    let fix = setup().await;
    let manager = &fix.manager;

    manager
        .claim_leadership("svc", "unit-0", Duration::from_secs(60))
        .await
        .unwrap();
    let token = manager.leadership_check("svc", "unit-0").await.unwrap();

    fix.clock.advance(Duration::from_secs(50));
    manager
        .claim_leadership("svc", "unit-0", Duration::from_secs(60))
        .await
        .unwrap();
    fix.clock.advance(Duration::from_secs(50));
    assert_eq!(token.check().await, Ok(()));

    shutdown(manager).await;
}

#[tokio::test]
async fn test_invalid_duration() {
    let fix = setup().await;
    assert_eq!(
        fix.manager
            .claim_leadership("svc", "unit-0", Duration::ZERO)
            .await,
        Err(Error::InvalidDuration)
    );
    shutdown(&fix.manager).await;
}

#[tokio::test]
async fn test_new_manager_needs_collaborators() {
    let err = Manager::new(ManagerConfig::default()).unwrap_err();
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[tokio::test]
async fn test_kill_is_idempotent_and_stops_everything() {
    let fix = setup().await;
    let manager = &fix.manager;

    manager
        .claim_leadership("svc", "unit-0", Duration::from_secs(60))
        .await
        .unwrap();
    let waiter = spawn_waiter(manager, "svc", CancellationToken::new());
    sleep(SETTLE).await;

    manager.kill();
    manager.kill();
    let observer = manager.clone();
    let (first, second) = tokio::join!(manager.wait(), observer.wait());
    assert_eq!(first, Ok(()));
    assert_eq!(second, Ok(()));

    assert_eq!(
        timeout(PATIENCE, waiter).await.unwrap().unwrap(),
        Err(Error::ManagerStopped)
    );
    assert_eq!(
        manager
            .claim_leadership("svc", "unit-0", Duration::from_secs(60))
            .await,
        Err(Error::ManagerStopped)
    );
    assert!(matches!(
        manager.leadership_check("svc", "unit-0").await,
        Err(Error::ManagerStopped)
    ));
    manager.kill();
    assert_eq!(manager.wait().await, Ok(()));
}

#[tokio::test]
async fn test_request_store_failure_is_surfaced() {
    let fix = setup().await;
    let manager = &fix.manager;

    let failure = ClientError::Transient("connection reset".to_string());
    fix.store.inject_failure(failure.clone());
    assert_eq!(
        manager
            .claim_leadership("svc", "unit-0", Duration::from_secs(60))
            .await,
        Err(Error::Store(failure))
    );

    manager
        .claim_leadership("svc", "unit-0", Duration::from_secs(60))
        .await
        .unwrap();
    shutdown(manager).await;
}

#[tokio::test]
async fn test_background_transient_failure_is_retried() {
    let fix = setup().await;
    let manager = &fix.manager;

    manager
        .claim_leadership("svc", "unit-0", Duration::from_secs(60))
        .await
        .unwrap();
    let waiter = spawn_waiter(manager, "svc", CancellationToken::new());
    sleep(SETTLE).await;

    fix.store
        .inject_failure(ClientError::Transient("connection reset".to_string()));
    let armed = fix.clock.alarms_registered();
    fix.clock.advance(Duration::from_secs(61));
    fix.clock.wait_for_alarms(armed + 1).await;
    sleep(SETTLE).await;
    assert!(!waiter.is_finished());

    fix.clock.advance(Duration::from_secs(1));
    assert_eq!(timeout(PATIENCE, waiter).await.unwrap().unwrap(), Ok(()));

    shutdown(manager).await;
}

#[tokio::test]
async fn test_repeated_unclassified_failures_stop_the_manager() {
    let fix = setup().await;
    let manager = &fix.manager;
    let failure = ClientError::Other("corrupt document".to_string());
    for _ in 0..3 {
        fix.store.inject_failure(failure.clone());
    }

    // First reconciliation comes after max_sleep, then after each backoff.
    for step in [60, 1, 2] {
        let armed = fix.clock.alarms_registered();
        fix.clock.advance(Duration::from_secs(step));
        if step != 2 {
            fix.clock.wait_for_alarms(armed + 1).await;
        }
    }

    let result = timeout(PATIENCE, manager.wait()).await.unwrap();
    assert_eq!(result, Err(Error::Store(failure)));
    assert_eq!(
        manager
            .claim_leadership("svc", "unit-0", Duration::from_secs(60))
            .await,
        Err(Error::ManagerStopped)
    );
}

#[tokio::test]
async fn test_managers_share_a_store() {
    let fix = setup().await;
    let other = Manager::new(ManagerConfig::new(
        fix.clock.clone(),
        Arc::new(MemoryClient::new(fix.store.clone())),
    ))
    .unwrap();

    fix.manager
        .claim_leadership("svc", "unit-0", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(
        other
            .claim_leadership("svc", "unit-1", Duration::from_secs(60))
            .await,
        Err(Error::LeaseHeldByOther {
            name: "svc".to_string(),
            holder: "unit-0".to_string()
        })
    );
    // The failed claim taught the other manager who leads.
    assert!(other.leadership_check("svc", "unit-0").await.is_ok());

    shutdown(&other).await;
    shutdown(&fix.manager).await;
}

#[tokio::test]
async fn test_extension_after_remote_release_and_shorter_reclaim() {
    let fix = setup().await;
    let other = Manager::new(ManagerConfig::new(
        fix.clock.clone(),
        Arc::new(MemoryClient::new(fix.store.clone())),
    ))
    .unwrap();

    fix.manager
        .claim_leadership("svc", "unit-0", Duration::from_secs(60))
        .await
        .unwrap();
    other.release_leadership("svc", "unit-0").await.unwrap();
    other
        .claim_leadership("svc", "unit-0", Duration::from_secs(10))
        .await
        .unwrap();

    // The first manager still caches the 60s lease; the store grants 10s.
    fix.manager
        .claim_leadership("svc", "unit-0", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(
        fix.store.get("svc").unwrap().expiry,
        offset(Duration::from_secs(10))
    );

    fix.clock.advance(almost_seconds(10));
    assert!(fix.manager.leadership_check("svc", "unit-0").await.is_ok());

    shutdown(&other).await;
    shutdown(&fix.manager).await;
}

use super::*;
use chrono::TimeZone;

use crate::clock::ManualClock;

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

fn lease(store: &SqliteTaskStore, holder: &str, clock: &ManualClock) -> RunnerLease {
    RunnerLease::new(
        store,
        RunnerLease::queue_lease_name("Q1"),
        holder,
        Duration::seconds(60),
        Arc::new(clock.clone()),
    )
}

#[tokio::test]
async fn test_acquire_and_release() {
    let store = SqliteTaskStore::in_memory().await.unwrap();
    let clock = ManualClock::new(start_time());
    let a = lease(&store, "runner-a", &clock);

    let info = a.try_acquire().await.unwrap();
    assert_eq!(info.name, "queue:Q1");
    assert_eq!(info.holder, "runner-a");
    assert_eq!(info.expires_at, start_time() + Duration::seconds(60));
    assert_eq!(a.current().await.unwrap(), Some(info));

    assert!(a.release().await.unwrap());
    assert!(a.current().await.unwrap().is_none());
    assert!(!a.release().await.unwrap());
}

#[tokio::test]
async fn test_live_lease_blocks_others() {
    let store = SqliteTaskStore::in_memory().await.unwrap();
    let clock = ManualClock::new(start_time());
    let a = lease(&store, "runner-a", &clock);
    let b = lease(&store, "runner-b", &clock);

    a.try_acquire().await.unwrap();
    clock.advance(Duration::seconds(59));

    match b.try_acquire().await.unwrap_err() {
        QueueError::LeaseHeld { holder, expires_at, .. } => {
            assert_eq!(holder, "runner-a");
            assert_eq!(expires_at, start_time() + Duration::seconds(60));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    // Re-acquiring our own lease refreshes it.
    let again = a.try_acquire().await.unwrap();
    assert_eq!(again.expires_at, start_time() + Duration::seconds(119));
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let store = SqliteTaskStore::in_memory().await.unwrap();
    let clock = ManualClock::new(start_time());
    let a = lease(&store, "runner-a", &clock);
    let b = lease(&store, "runner-b", &clock);

    a.try_acquire().await.unwrap();
    clock.advance(Duration::seconds(60));

    let info = b.try_acquire().await.unwrap();
    assert_eq!(info.holder, "runner-b");

    let err = a.renew().await.unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost { .. }));
    assert!(!a.release().await.unwrap());
    assert_eq!(b.current().await.unwrap().unwrap().holder, "runner-b");
}

#[tokio::test]
async fn test_renew_extends_expiry() {
    let store = SqliteTaskStore::in_memory().await.unwrap();
    let clock = ManualClock::new(start_time());
    let a = lease(&store, "runner-a", &clock);

    assert!(matches!(a.renew().await.unwrap_err(), QueueError::LeaseLost { .. }));

    a.try_acquire().await.unwrap();
    clock.advance(Duration::seconds(20));
    let expires = a.renew().await.unwrap();
    assert_eq!(expires, start_time() + Duration::seconds(80));

    let current = a.current().await.unwrap().unwrap();
    assert_eq!(current.heartbeat_at, start_time() + Duration::seconds(20));
    assert_eq!(current.acquired_at, start_time());
    assert!(!current.is_expired(clock.now()));
}

#[tokio::test]
async fn test_leases_are_independent_by_name() {
    let store = SqliteTaskStore::in_memory().await.unwrap();
    let clock = ManualClock::new(start_time());
    let q1 = lease(&store, "runner-a", &clock);
    let q2 = RunnerLease::new(
        &store,
        RunnerLease::queue_lease_name("Q2"),
        "runner-b",
        Duration::seconds(60),
        Arc::new(clock.clone()),
    );

    q1.try_acquire().await.unwrap();
    q2.try_acquire().await.unwrap();
}

#[test]
fn test_default_holder_is_unique() {
    let a = RunnerLease::default_holder();
    let b = RunnerLease::default_holder();
    assert_ne!(a, b);
    assert!(a.starts_with(&format!("pid-{}-", std::process::id())));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_releases_on_shutdown() {
    let store = SqliteTaskStore::in_memory().await.unwrap();
    let clock = ManualClock::new(start_time());
    let a = Arc::new(lease(&store, "runner-a", &clock));
    a.try_acquire().await.unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let handle = tokio::spawn(
        a.clone()
            .heartbeat_loop(std::time::Duration::from_secs(20), shutdown_rx),
    );
    tokio::time::sleep(std::time::Duration::from_secs(50)).await;
    shutdown_tx.send(()).unwrap();

    handle.await.unwrap().unwrap();
    assert!(a.current().await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_stops_when_lease_lost() {
    let store = SqliteTaskStore::in_memory().await.unwrap();
    let clock = ManualClock::new(start_time());
    let a = Arc::new(lease(&store, "runner-a", &clock));
    let b = lease(&store, "runner-b", &clock);

    a.try_acquire().await.unwrap();
    clock.advance(Duration::seconds(61));
    b.try_acquire().await.unwrap();

    let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let result = a
        .clone()
        .heartbeat_loop(std::time::Duration::from_secs(20), shutdown_rx)
        .await;
    assert!(matches!(result, Err(QueueError::LeaseLost { .. })));
    assert_eq!(b.current().await.unwrap().unwrap().holder, "runner-b");
}

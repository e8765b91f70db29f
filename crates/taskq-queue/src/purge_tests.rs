use super::*;
use chrono::{TimeZone, Utc};
use serde_json::json;

use crate::clock::ManualClock;
use crate::sqlite::SqliteTaskStore;
use crate::task::{Task, TaskPayload, TaskStatus};
use crate::task_class::TaskClass;

async fn create_test_engine() -> (Arc<TaskEngine>, ManualClock, uuid::Uuid) {
    let store = SqliteTaskStore::in_memory().await.unwrap();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
    let engine = Arc::new(TaskEngine::new(Arc::new(store), Arc::new(clock.clone())));
    engine
        .register_task_class(TaskClass::new("STANDARD", 300))
        .await
        .unwrap();
    let queue = engine.create_queue("Q1", "").await.unwrap();
    (engine, clock, queue.id)
}

async fn finished_task(engine: &TaskEngine, queue_id: &uuid::Uuid, succeed: bool) -> Task {
    engine
        .create_task(queue_id, TaskPayload::new("build", json!({})), "STANDARD")
        .await
        .unwrap();
    let task = engine.claim(queue_id, "w1").await.unwrap().unwrap();
    if succeed {
        engine.complete(&task.id, json!({"ok": true})).await.unwrap()
    } else {
        engine.fail(&task.id, "exit 2").await.unwrap()
    }
}

fn three_day_retention() -> PurgeConfig {
    PurgeConfig {
        retention_hours: 72,
        ..PurgeConfig::default()
    }
}

#[tokio::test]
async fn test_purge_respects_retention_window() {
    let (engine, clock, queue_id) = create_test_engine().await;
    let sweeper = PurgeSweeper::new(engine.clone(), three_day_retention());

    let old = finished_task(&engine, &queue_id, true).await;
    clock.advance(Duration::days(2));
    let recent = finished_task(&engine, &queue_id, false).await;
    clock.advance(Duration::days(2));

    assert_eq!(sweeper.run_once().await.unwrap(), 1);
    assert!(engine.get_task(&old.id).await.is_err());
    assert_eq!(engine.get_task(&recent.id).await.unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_purge_is_idempotent() {
    let (engine, clock, queue_id) = create_test_engine().await;
    let sweeper = PurgeSweeper::new(engine.clone(), three_day_retention());

    finished_task(&engine, &queue_id, true).await;
    finished_task(&engine, &queue_id, false).await;
    clock.advance(Duration::days(4));

    assert_eq!(sweeper.run_once().await.unwrap(), 2);
    assert_eq!(sweeper.run_once().await.unwrap(), 0);
    assert_eq!(sweeper.total_purged(), 2);
}

#[tokio::test]
async fn test_purge_never_touches_live_tasks() {
    let (engine, clock, queue_id) = create_test_engine().await;
    let sweeper = PurgeSweeper::new(engine.clone(), three_day_retention());

    engine
        .create_task(&queue_id, TaskPayload::new("build", json!({})), "STANDARD")
        .await
        .unwrap();
    let running = engine.claim(&queue_id, "w1").await.unwrap().unwrap();
    let queued = engine
        .create_task(&queue_id, TaskPayload::new("build", json!({})), "STANDARD")
        .await
        .unwrap();

    clock.advance(Duration::days(30));
    assert_eq!(sweeper.run_once().await.unwrap(), 0);
    assert_eq!(engine.get_task(&running.id).await.unwrap().status, TaskStatus::Running);
    assert_eq!(engine.get_task(&queued.id).await.unwrap().status, TaskStatus::Queued);
}

#[tokio::test]
async fn test_requeued_task_is_not_purged() {
    let (engine, clock, queue_id) = create_test_engine().await;
    let sweeper = PurgeSweeper::new(engine.clone(), three_day_retention());

    let failed = finished_task(&engine, &queue_id, false).await;
    engine.requeue(&failed.id).await.unwrap();

    clock.advance(Duration::days(4));
    assert_eq!(sweeper.run_once().await.unwrap(), 0);
    assert_eq!(engine.get_task(&failed.id).await.unwrap().status, TaskStatus::Queued);
}

#[tokio::test]
async fn test_task_refinished_after_selection_is_kept() {
    let (engine, clock, queue_id) = create_test_engine().await;

    let task = finished_task(&engine, &queue_id, false).await;
    clock.advance(Duration::days(4));
    let cutoff = engine.now() - Duration::days(3);
    let ids = engine.store().finished_before(cutoff).await.unwrap();
    assert_eq!(ids, vec![task.id]);

    // A worker retries it between selection and deletion.
    engine.requeue(&task.id).await.unwrap();
    engine.claim(&queue_id, "w2").await.unwrap().unwrap();
    let refailed = engine.fail(&task.id, "exit 3").await.unwrap();
    assert_eq!(refailed.finished_at, Some(engine.now()));

    let removed = engine
        .store()
        .delete_tasks(&ids, cutoff, engine.now())
        .await
        .unwrap();
    assert_eq!(removed, 0);
    assert_eq!(engine.get_task(&task.id).await.unwrap().error.as_deref(), Some("exit 3"));
}

#[tokio::test]
async fn test_window_beyond_calendar_purges_nothing() {
    let (engine, clock, queue_id) = create_test_engine().await;
    let task = finished_task(&engine, &queue_id, true).await;
    clock.advance(Duration::days(4));

    assert_eq!(engine.purge(Duration::weeks(1_000_000_000)).await.unwrap(), 0);
    assert!(engine.get_task(&task.id).await.is_ok());
}

#[tokio::test]
async fn test_explicit_window_overrides_retention() {
    let (engine, clock, queue_id) = create_test_engine().await;
    let sweeper = PurgeSweeper::new(engine.clone(), three_day_retention());
    assert_eq!(sweeper.retention(), Duration::days(3));

    finished_task(&engine, &queue_id, true).await;
    clock.advance(Duration::hours(2));

    assert_eq!(sweeper.run_once().await.unwrap(), 0);
    assert_eq!(sweeper.purge_older_than(Duration::hours(1)).await.unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_loop_runs_until_shutdown() {
    let (engine, clock, queue_id) = create_test_engine().await;
    let sweeper = Arc::new(PurgeSweeper::new(
        engine.clone(),
        PurgeConfig {
            interval_secs: 60,
            retention_hours: 1,
        },
    ));

    finished_task(&engine, &queue_id, true).await;
    clock.advance(Duration::hours(2));

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let handle = tokio::spawn(sweeper.clone().start_loop(shutdown_rx));
    tokio::time::sleep(std::time::Duration::from_secs(90)).await;
    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();

    assert_eq!(sweeper.total_purged(), 1);
}

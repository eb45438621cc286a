//! Reaper tests: expiry of unclaimed tasks with no dispatcher running.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use pland::events::{ResultBroker, StreamEvent};
use pland::tasks::{reaper, MessagePayload, TaskPayload, TaskStatus, TaskStorage};

fn message(content: &str) -> TaskPayload {
    TaskPayload::Message(MessagePayload {
        content: content.to_string(),
        history: Vec::new(),
        checklist_context: None,
    })
}

/// Backdate a record's created_at so it looks older than the queue age cap.
async fn backdate(storage: &TaskStorage, id: &str, by_ms: i64) {
    sqlx::query("UPDATE tasks SET created_at = created_at - ? WHERE id = ?")
        .bind(by_ms)
        .bind(id)
        .execute(&storage.pool())
        .await
        .unwrap();
}

#[tokio::test]
async fn expire_pass_fails_aged_tasks_without_claiming() {
    let dir = TempDir::new().unwrap();
    let storage = TaskStorage::open(dir.path()).await.unwrap();
    let broker = ResultBroker::new();

    let mut ids = Vec::new();
    for i in 0..3 {
        let task = storage.create(&message(&format!("stale {i}"))).await.unwrap();
        backdate(&storage, &task.id, 10 * 60 * 1000).await;
        ids.push(task.id);
    }
    // A fresh task must survive the pass.
    let fresh = storage.create(&message("fresh")).await.unwrap();

    let expired = reaper::expire_pass(&storage, &broker, Duration::from_secs(120))
        .await
        .unwrap();
    assert_eq!(expired, 3);

    for id in &ids {
        let record = storage.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.owner.is_none(), "expired tasks must never gain an owner");
        assert!(record.error.unwrap().contains("expired before claim"));
    }

    let fresh = storage.get(&fresh.id).await.unwrap().unwrap();
    assert_eq!(fresh.status, TaskStatus::Pending);
}

#[tokio::test]
async fn expire_pass_skips_claimed_and_terminal_tasks() {
    let dir = TempDir::new().unwrap();
    let storage = TaskStorage::open(dir.path()).await.unwrap();
    let broker = ResultBroker::new();

    let claimed = storage.create(&message("claimed")).await.unwrap();
    backdate(&storage, &claimed.id, 10 * 60 * 1000).await;
    assert!(storage.try_claim(&claimed.id, "worker-a").await.unwrap());

    let done = storage.create(&message("done")).await.unwrap();
    backdate(&storage, &done.id, 10 * 60 * 1000).await;
    storage
        .complete(&done.id, &serde_json::json!({ "text": "ok" }))
        .await
        .unwrap();

    let expired = reaper::expire_pass(&storage, &broker, Duration::from_secs(120))
        .await
        .unwrap();
    assert_eq!(expired, 0);

    assert_eq!(
        storage.get(&claimed.id).await.unwrap().unwrap().status,
        TaskStatus::Processing
    );
    assert_eq!(
        storage.get(&done.id).await.unwrap().unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn live_subscriber_sees_expiry_error() {
    let dir = TempDir::new().unwrap();
    let storage = TaskStorage::open(dir.path()).await.unwrap();
    let broker = Arc::new(ResultBroker::new());

    let task = storage.create(&message("stale")).await.unwrap();
    backdate(&storage, &task.id, 10 * 60 * 1000).await;

    let mut sub = broker.subscribe(&task.id);
    reaper::expire_pass(&storage, &broker, Duration::from_secs(120))
        .await
        .unwrap();

    match sub.recv().await.unwrap() {
        StreamEvent::Error { message } => assert!(message.contains("expired before claim")),
        other => panic!("expected error event, got {other:?}"),
    }
}

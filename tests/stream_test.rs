//! Streaming delivery properties: per-request ordering, exactly one
//! terminal event, and the late-subscriber behavior (durable status instead
//! of replay).

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

use pland::config::DispatcherConfig;
use pland::dispatch::{Dispatcher, HandlerError, HandlerRegistry, TaskHandler, TaskOutcome};
use pland::events::{ResultBroker, ResultPublisher, StreamEvent};
use pland::gateway::StreamGateway;
use pland::tasks::{MessagePayload, TaskPayload, TaskRecord, TaskStatus, TaskStorage, TaskType};

fn message(content: &str) -> TaskPayload {
    TaskPayload::Message(MessagePayload {
        content: content.to_string(),
        history: Vec::new(),
        checklist_context: None,
    })
}

/// Handler that publishes a fixed number of ordered chunks, then done.
struct CountingHandler {
    chunks: usize,
}

#[async_trait]
impl TaskHandler for CountingHandler {
    async fn handle(
        &self,
        _task: &TaskRecord,
        publisher: &ResultPublisher,
    ) -> Result<TaskOutcome, HandlerError> {
        for i in 0..self.chunks {
            publisher.chunk(format!("chunk-{i}"));
        }
        let result = json!({ "chunks": self.chunks });
        publisher.done(Some(result.clone()));
        Ok(TaskOutcome { result })
    }
}

#[tokio::test]
async fn chunks_arrive_in_publish_order_with_one_terminal() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(TaskStorage::open(dir.path()).await.unwrap());
    let broker = Arc::new(ResultBroker::new());
    let gateway = StreamGateway::new(Arc::clone(&broker), Duration::from_millis(10));

    let mut registry = HandlerRegistry::new();
    registry.register(TaskType::Message, Arc::new(CountingHandler { chunks: 20 }));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&storage),
        Arc::new(registry),
        Arc::clone(&broker),
        DispatcherConfig {
            poll_interval_ms: 25,
            ..DispatcherConfig::default()
        },
    ));

    let task = storage.create(&message("count for me")).await.unwrap();
    let mut stream = gateway.open(&task.id);
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = stream.next_event().await {
            events.push(event);
        }
        events
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(dispatcher.run(shutdown_rx));

    let events = tokio::time::timeout(Duration::from_secs(5), collector)
        .await
        .expect("stream did not terminate")
        .unwrap();

    let chunks: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    let expected: Vec<String> = (0..20).map(|i| format!("chunk-{i}")).collect();
    assert_eq!(chunks, expected.iter().map(String::as_str).collect::<Vec<_>>());

    let terminals = events.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1);

    let _ = shutdown_tx.send(true);
    let _ = run.await;
}

#[tokio::test]
async fn subscribing_after_terminal_yields_no_events_but_durable_status() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(TaskStorage::open(dir.path()).await.unwrap());
    let broker = Arc::new(ResultBroker::new());
    let gateway = StreamGateway::new(Arc::clone(&broker), Duration::from_millis(10));

    // Task runs to completion with nobody subscribed.
    let task = storage.create(&message("quiet")).await.unwrap();
    storage.try_claim(&task.id, "worker-a").await.unwrap();
    storage
        .complete(&task.id, &json!({ "text": "all done" }))
        .await
        .unwrap();

    // A late subscriber gets the ack and then silence — no replay.
    let mut stream = gateway.open(&task.id);
    assert!(matches!(
        stream.next_event().await,
        Some(StreamEvent::Connected { .. })
    ));
    let next = tokio::time::timeout(Duration::from_millis(200), stream.next_event()).await;
    assert!(next.is_err(), "late subscriber must not receive replayed events");

    // The durable record is the source of truth for the outcome.
    let record = storage.get(&task.id).await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.result, Some(json!({ "text": "all done" })));
}

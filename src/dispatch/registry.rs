//! Handler trait and type → handler routing table.
//!
//! The registry is built once at startup (mutable) and used read-only for
//! the life of the process — no locks needed at dispatch time.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::events::ResultPublisher;
use crate::inference::InferenceError;
use crate::tasks::{TaskRecord, TaskType};

/// Structured result a handler produces on success. Persisted on the task
/// record and mirrored in the handler's `done` event.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub result: Value,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Inference(#[from] InferenceError),
    /// The claimed record's payload variant does not match this handler.
    /// Creation-time validation makes this unreachable in practice, but the
    /// dispatcher still records it as a classification failure.
    #[error("payload does not match handler: {0}")]
    Payload(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Task-type-specific execution logic. Handlers must publish at least one
/// terminal event through `publisher` before returning (the publisher's
/// latch keeps duplicates out), and must catch inference failures rather
/// than panic — a failing handler fails its task, never the dispatcher.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(
        &self,
        task: &TaskRecord,
        publisher: &ResultPublisher,
    ) -> Result<TaskOutcome, HandlerError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a task type. Last registration wins.
    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type, handler);
    }

    pub fn get(&self, task_type: TaskType) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ResultBroker;
    use crate::tasks::{MessagePayload, TaskPayload, TaskStatus};
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        async fn handle(
            &self,
            _task: &TaskRecord,
            publisher: &ResultPublisher,
        ) -> Result<TaskOutcome, HandlerError> {
            publisher.done(Some(json!({ "ok": true })));
            Ok(TaskOutcome { result: json!({ "ok": true }) })
        }
    }

    fn message_task() -> TaskRecord {
        TaskRecord {
            id: "t-1".to_string(),
            task_type: TaskType::Message,
            status: TaskStatus::Processing,
            payload: TaskPayload::Message(MessagePayload {
                content: "hi".to_string(),
                history: Vec::new(),
                checklist_context: None,
            }),
            owner: Some("worker-test".to_string()),
            result: None,
            error: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn registry_routes_by_type() {
        let mut registry = HandlerRegistry::new();
        registry.register(TaskType::Message, Arc::new(EchoHandler));

        assert!(registry.get(TaskType::Message).is_some());
        assert!(registry.get(TaskType::Checklist).is_none());

        let broker = Arc::new(ResultBroker::new());
        let publisher = ResultPublisher::new(broker, "t-1".to_string());
        let handler = registry.get(TaskType::Message).unwrap();
        let outcome = handler.handle(&message_task(), &publisher).await.unwrap();
        assert_eq!(outcome.result, json!({ "ok": true }));
    }
}

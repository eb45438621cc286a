//! Check-in handler.
//!
//! Takes a previously recorded checklist snapshot and produces a free-text
//! analysis of how the plan is going. Single-shot: no follow-on tasks.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use super::publish_text_chunks;
use crate::dispatch::{HandlerError, TaskHandler, TaskOutcome};
use crate::events::ResultPublisher;
use crate::inference::{ChatMessage, InferenceClient, InferenceRequest};
use crate::tasks::{TaskPayload, TaskRecord};

const SYSTEM_PROMPT: &str = "\
You review a user's checklist snapshot and write a short, encouraging \
check-in: what is done, what is slipping, and one concrete suggestion for \
the next day.";

pub struct CheckinHandler {
    inference: Arc<dyn InferenceClient>,
}

impl CheckinHandler {
    pub fn new(inference: Arc<dyn InferenceClient>) -> Self {
        Self { inference }
    }
}

#[async_trait]
impl TaskHandler for CheckinHandler {
    async fn handle(
        &self,
        task: &TaskRecord,
        publisher: &ResultPublisher,
    ) -> Result<TaskOutcome, HandlerError> {
        let TaskPayload::Checkin(payload) = &task.payload else {
            return Err(HandlerError::Payload(format!(
                "expected checkin payload, got {}",
                task.payload.task_type()
            )));
        };

        let mut prompt = format!("Checklist snapshot:\n{}", payload.checklist);
        if let Some(notes) = payload.notes.as_deref().filter(|n| !n.trim().is_empty()) {
            prompt.push_str(&format!("\n\nUser notes:\n{notes}"));
        }

        let analysis = self
            .inference
            .infer(InferenceRequest::new(vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(prompt),
            ]))
            .await?;

        publish_text_chunks(publisher, &analysis);
        let result = json!({ "analysis": analysis });
        publisher.done(Some(result.clone()));
        Ok(TaskOutcome { result })
    }
}

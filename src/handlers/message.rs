//! Free-text message handler.
//!
//! Produces a conversational reply, and — when the model signals that the
//! request calls for structured planning work — enqueues a follow-on
//! `checklist` task. The follow-on is created, never awaited: its id goes
//! into this task's `done` result as `checklist_request_id` so the client
//! can subscribe to the chain transparently.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use super::publish_text_chunks;
use crate::dispatch::{HandlerError, TaskHandler, TaskOutcome};
use crate::events::ResultPublisher;
use crate::inference::{strip_code_fence, ChatMessage, InferenceClient, InferenceRequest};
use crate::tasks::{
    ChecklistOutline, ChecklistPayload, MessagePayload, TaskPayload, TaskRecord, TaskStorage,
};

/// Marker block the model appends when the reply implies checklist work.
const OUTLINE_OPEN: &str = "[[checklist]]";
const OUTLINE_CLOSE: &str = "[[/checklist]]";

const SYSTEM_PROMPT: &str = "\
You are a planning assistant. Reply to the user conversationally.

If, and only if, the user is asking you to plan something concrete and the \
conversation contains enough information to draft a day-by-day outline, end \
your reply with a block of the exact form:

[[checklist]]
{\"days\": [{\"date\": \"YYYY-MM-DD\", \"theme\": \"short theme\"}, ...]}
[[/checklist]]

Otherwise do not emit the block at all.";

pub struct MessageHandler {
    inference: Arc<dyn InferenceClient>,
    storage: Arc<TaskStorage>,
}

impl MessageHandler {
    pub fn new(inference: Arc<dyn InferenceClient>, storage: Arc<TaskStorage>) -> Self {
        Self { inference, storage }
    }

    fn build_request(&self, payload: &MessagePayload) -> InferenceRequest {
        let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
        if let Some(context) = &payload.checklist_context {
            messages.push(ChatMessage::system(format!(
                "The user's current checklist, for reference:\n{context}"
            )));
        }
        for turn in &payload.history {
            match turn.role.as_str() {
                "assistant" => messages.push(ChatMessage::assistant(&turn.content)),
                _ => messages.push(ChatMessage::user(&turn.content)),
            }
        }
        messages.push(ChatMessage::user(&payload.content));
        InferenceRequest::new(messages)
    }
}

#[async_trait]
impl TaskHandler for MessageHandler {
    async fn handle(
        &self,
        task: &TaskRecord,
        publisher: &ResultPublisher,
    ) -> Result<TaskOutcome, HandlerError> {
        let TaskPayload::Message(payload) = &task.payload else {
            return Err(HandlerError::Payload(format!(
                "expected message payload, got {}",
                task.payload.task_type()
            )));
        };

        let reply = self.inference.infer(self.build_request(payload)).await?;
        let (text, outline) = extract_outline(&reply);

        publish_text_chunks(publisher, &text);

        // Enqueue the follow-on checklist task without blocking on it. A
        // failed enqueue degrades to a plain reply — the conversational
        // answer is still worth delivering.
        let mut result = json!({ "text": text });
        if let Some(outline) = outline {
            let followup = TaskPayload::Checklist(ChecklistPayload {
                source_text: Some(payload.content.clone()),
                outline: Some(outline),
                start_date: None,
            });
            match self.storage.create(&followup).await {
                Ok(record) => {
                    debug!(task_id = %task.id, checklist_request_id = %record.id, "enqueued follow-on checklist task");
                    result["checklist_request_id"] = json!(record.id);
                }
                Err(e) => {
                    warn!(task_id = %task.id, err = %e, "failed to enqueue follow-on checklist task");
                }
            }
        }

        publisher.done(Some(result.clone()));
        Ok(TaskOutcome { result })
    }
}

/// Split a reply into the user-visible text and the optional outline block.
/// A malformed block is stripped and ignored — it never fails the message.
fn extract_outline(reply: &str) -> (String, Option<ChecklistOutline>) {
    let Some(open) = reply.find(OUTLINE_OPEN) else {
        return (reply.trim().to_string(), None);
    };
    let Some(close) = reply[open..].find(OUTLINE_CLOSE) else {
        return (reply.trim().to_string(), None);
    };

    let inner = &reply[open + OUTLINE_OPEN.len()..open + close];
    let text = format!(
        "{}{}",
        &reply[..open],
        &reply[open + close + OUTLINE_CLOSE.len()..]
    )
    .trim()
    .to_string();

    match serde_json::from_str::<ChecklistOutline>(strip_code_fence(inner)) {
        Ok(outline) if !outline.days.is_empty() => (text, Some(outline)),
        Ok(_) => (text, None),
        Err(e) => {
            debug!(err = %e, "discarding malformed outline block");
            (text, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_outline_parses_marker_block() {
        let reply = "Here is your plan.\n\n[[checklist]]\n{\"days\": [{\"date\": \"2026-09-01\", \"theme\": \"setup\"}]}\n[[/checklist]]";
        let (text, outline) = extract_outline(reply);
        assert_eq!(text, "Here is your plan.");
        let outline = outline.unwrap();
        assert_eq!(outline.days.len(), 1);
        assert_eq!(outline.days[0].theme, "setup");
    }

    #[test]
    fn extract_outline_without_marker_returns_text() {
        let (text, outline) = extract_outline("Just a chat reply.");
        assert_eq!(text, "Just a chat reply.");
        assert!(outline.is_none());
    }

    #[test]
    fn malformed_outline_is_stripped_not_fatal() {
        let reply = "Reply.\n[[checklist]]\nnot json\n[[/checklist]]";
        let (text, outline) = extract_outline(reply);
        assert_eq!(text, "Reply.");
        assert!(outline.is_none());
    }
}

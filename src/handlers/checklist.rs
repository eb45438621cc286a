//! Checklist handler.
//!
//! Two generation paths:
//! - outline: expand a pre-computed outline date-by-date, one inference
//!   call per day, streaming a `progress` event as each day's items land;
//! - direct: one inference call over free text producing the full item list.
//!
//! Any outline-processing failure falls back to the direct path when source
//! text is available — the fallback is the only retry modelled here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::dispatch::{HandlerError, TaskHandler, TaskOutcome};
use crate::events::ResultPublisher;
use crate::inference::{strip_code_fence, ChatMessage, InferenceClient, InferenceError, InferenceRequest};
use crate::tasks::{ChecklistOutline, ChecklistPayload, TaskPayload, TaskRecord};

const DAY_PROMPT: &str = "\
You expand one day of a plan outline into concrete checklist items. \
Respond with only a JSON array of short item strings, nothing else.";

const DIRECT_PROMPT: &str = "\
You turn a request into a dated checklist. Respond with only a JSON array \
of objects of the form {\"date\": \"YYYY-MM-DD\", \"title\": \"item\"}, \
nothing else.";

/// One dated checklist entry, as stored in the task result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub date: String,
    pub title: String,
}

pub struct ChecklistHandler {
    inference: Arc<dyn InferenceClient>,
}

impl ChecklistHandler {
    pub fn new(inference: Arc<dyn InferenceClient>) -> Self {
        Self { inference }
    }

    /// Expand the outline one day at a time, publishing progress per date.
    async fn expand_outline(
        &self,
        outline: &ChecklistOutline,
        publisher: &ResultPublisher,
    ) -> Result<Vec<ChecklistItem>, HandlerError> {
        let mut items = Vec::new();
        for day in &outline.days {
            let request = InferenceRequest::new(vec![
                ChatMessage::system(DAY_PROMPT),
                ChatMessage::user(format!("Date: {}\nTheme: {}", day.date, day.theme)),
            ]);
            let reply = self.inference.infer(request).await?;
            let titles: Vec<String> = serde_json::from_str(strip_code_fence(&reply))
                .map_err(|e| InferenceError::MalformedOutput(e.to_string()))?;

            publisher.progress(json!({ "date": day.date, "items": titles }));
            items.extend(titles.into_iter().map(|title| ChecklistItem {
                date: day.date.clone(),
                title,
            }));
        }
        Ok(items)
    }

    /// Single-shot generation from free text, progress per item.
    async fn generate_direct(
        &self,
        source_text: &str,
        start_date: Option<&str>,
        publisher: &ResultPublisher,
    ) -> Result<Vec<ChecklistItem>, HandlerError> {
        let prompt = match start_date {
            Some(date) => format!("Start date: {date}\n\n{source_text}"),
            None => source_text.to_string(),
        };
        let request = InferenceRequest::new(vec![
            ChatMessage::system(DIRECT_PROMPT),
            ChatMessage::user(prompt),
        ]);
        let reply = self.inference.infer(request).await?;
        let items: Vec<ChecklistItem> = serde_json::from_str(strip_code_fence(&reply))
            .map_err(|e| InferenceError::MalformedOutput(e.to_string()))?;

        for item in &items {
            publisher.progress(json!({ "date": item.date, "items": [item.title] }));
        }
        Ok(items)
    }

    async fn build_items(
        &self,
        payload: &ChecklistPayload,
        publisher: &ResultPublisher,
    ) -> Result<Vec<ChecklistItem>, HandlerError> {
        if let Some(outline) = &payload.outline {
            match self.expand_outline(outline, publisher).await {
                Ok(items) => return Ok(items),
                Err(e) => match payload.source_text.as_deref() {
                    Some(text) if !text.trim().is_empty() => {
                        warn!(err = %e, "outline expansion failed — falling back to direct generation");
                    }
                    _ => return Err(e),
                },
            }
        }

        // Creation-time validation guarantees source_text when there is no
        // usable outline.
        let text = payload.source_text.as_deref().unwrap_or_default();
        debug!("generating checklist directly from source text");
        self.generate_direct(text, payload.start_date.as_deref(), publisher)
            .await
    }
}

#[async_trait]
impl TaskHandler for ChecklistHandler {
    async fn handle(
        &self,
        task: &TaskRecord,
        publisher: &ResultPublisher,
    ) -> Result<TaskOutcome, HandlerError> {
        let TaskPayload::Checklist(payload) = &task.payload else {
            return Err(HandlerError::Payload(format!(
                "expected checklist payload, got {}",
                task.payload.task_type()
            )));
        };

        let items = self.build_items(payload, publisher).await?;
        let result = json!({ "items": items });
        publisher.done(Some(result.clone()));
        Ok(TaskOutcome { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ResultBroker, StreamEvent};
    use crate::tasks::{OutlineDay, TaskStatus, TaskType};
    use std::sync::Mutex;

    /// Scripted inference fake: pops replies front-to-back.
    struct ScriptedInference {
        replies: Mutex<Vec<Result<String, InferenceError>>>,
    }

    impl ScriptedInference {
        fn new(replies: Vec<Result<String, InferenceError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
            }
        }
    }

    #[async_trait]
    impl InferenceClient for ScriptedInference {
        async fn infer(&self, _request: InferenceRequest) -> Result<String, InferenceError> {
            self.replies
                .lock()
                .unwrap()
                .remove(0)
        }
    }

    fn checklist_task(payload: ChecklistPayload) -> TaskRecord {
        TaskRecord {
            id: "t-cl".to_string(),
            task_type: TaskType::Checklist,
            status: TaskStatus::Processing,
            payload: TaskPayload::Checklist(payload),
            owner: Some("worker-test".to_string()),
            result: None,
            error: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn outline_path_streams_progress_per_day() {
        let inference = Arc::new(ScriptedInference::new(vec![
            Ok("[\"pack bags\"]".to_string()),
            Ok("[\"book hotel\", \"print tickets\"]".to_string()),
        ]));
        let handler = ChecklistHandler::new(inference);

        let broker = Arc::new(ResultBroker::new());
        let mut sub = broker.subscribe("t-cl");
        let publisher = ResultPublisher::new(Arc::clone(&broker), "t-cl".to_string());

        let task = checklist_task(ChecklistPayload {
            source_text: None,
            outline: Some(ChecklistOutline {
                days: vec![
                    OutlineDay { date: "2026-09-01".into(), theme: "prep".into() },
                    OutlineDay { date: "2026-09-02".into(), theme: "travel".into() },
                ],
            }),
            start_date: None,
        });

        let outcome = handler.handle(&task, &publisher).await.unwrap();
        assert_eq!(outcome.result["items"].as_array().unwrap().len(), 3);

        // Two progress events, then done — in order.
        assert!(matches!(sub.recv().await.unwrap(), StreamEvent::Progress { .. }));
        assert!(matches!(sub.recv().await.unwrap(), StreamEvent::Progress { .. }));
        assert!(matches!(sub.recv().await.unwrap(), StreamEvent::Done { .. }));
    }

    #[tokio::test]
    async fn outline_failure_falls_back_to_direct_generation() {
        let inference = Arc::new(ScriptedInference::new(vec![
            Err(InferenceError::MalformedOutput("not json".into())),
            Ok("[{\"date\": \"2026-09-01\", \"title\": \"pack bags\"}]".to_string()),
        ]));
        let handler = ChecklistHandler::new(inference);

        let broker = Arc::new(ResultBroker::new());
        let publisher = ResultPublisher::new(Arc::clone(&broker), "t-cl".to_string());

        let task = checklist_task(ChecklistPayload {
            source_text: Some("plan my trip".to_string()),
            outline: Some(ChecklistOutline {
                days: vec![OutlineDay { date: "2026-09-01".into(), theme: "prep".into() }],
            }),
            start_date: None,
        });

        let outcome = handler.handle(&task, &publisher).await.unwrap();
        assert_eq!(outcome.result["items"][0]["title"], "pack bags");
    }

    #[tokio::test]
    async fn outline_failure_without_source_text_is_terminal() {
        let inference = Arc::new(ScriptedInference::new(vec![Err(
            InferenceError::RateLimited,
        )]));
        let handler = ChecklistHandler::new(inference);

        let broker = Arc::new(ResultBroker::new());
        let publisher = ResultPublisher::new(Arc::clone(&broker), "t-cl".to_string());

        let task = checklist_task(ChecklistPayload {
            source_text: None,
            outline: Some(ChecklistOutline {
                days: vec![OutlineDay { date: "2026-09-01".into(), theme: "prep".into() }],
            }),
            start_date: None,
        });

        let err = handler.handle(&task, &publisher).await.unwrap_err();
        assert!(matches!(err, HandlerError::Inference(InferenceError::RateLimited)));
    }
}

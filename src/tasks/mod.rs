//! Task queue domain types.
//!
//! A `TaskRecord` is the durable unit of work: created `pending` by a
//! producer, claimed by a dispatcher (`processing`), finished exactly once
//! (`completed` | `failed`). Status only moves forward; terminal states
//! never revert.

pub mod reaper;
pub mod storage;

pub use storage::TaskStorage;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ── Task type ────────────────────────────────────────────────────────────────

/// Task types routable to a handler. Unknown strings are rejected at the
/// producer boundary — nothing unroutable ever enters the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Message,
    Checklist,
    Checkin,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Message => "message",
            TaskType::Checklist => "checklist",
            TaskType::Checkin => "checkin",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(TaskType::Message),
            "checklist" => Ok(TaskType::Checklist),
            "checkin" => Ok(TaskType::Checkin),
            other => Err(ValidationError::UnknownType(other.to_string())),
        }
    }
}

// ── Task status ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(ValidationError::Invalid(format!(
                "unknown task status '{other}'"
            ))),
        }
    }
}

// ── Payloads ─────────────────────────────────────────────────────────────────

/// One turn of prior conversation, passed through to the inference prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    /// `"user"` or `"assistant"`.
    pub role: String,
    pub content: String,
}

/// A pre-computed checklist outline: one theme per date, expanded into
/// concrete items by the checklist handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistOutline {
    pub days: Vec<OutlineDay>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlineDay {
    /// ISO date, e.g. `"2026-09-01"`.
    pub date: String,
    /// Short free-text theme for the day.
    pub theme: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub content: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    /// Optional prior checklist the conversation refers to.
    #[serde(default)]
    pub checklist_context: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistPayload {
    /// Free text to derive items from directly.
    #[serde(default)]
    pub source_text: Option<String>,
    /// Pre-computed outline to expand date-by-date. When both are present
    /// the outline path is tried first and `source_text` is the fallback.
    #[serde(default)]
    pub outline: Option<ChecklistOutline>,
    /// ISO date the checklist should start on. Only consulted by the direct
    /// path; outlines carry their own dates.
    #[serde(default)]
    pub start_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckinPayload {
    /// Snapshot of a previously produced checklist.
    pub checklist: Value,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Typed task payload. Producers validate into this at creation time, so
/// handlers pattern-match exhaustively instead of probing dynamic maps.
#[derive(Debug, Clone)]
pub enum TaskPayload {
    Message(MessagePayload),
    Checklist(ChecklistPayload),
    Checkin(CheckinPayload),
}

impl TaskPayload {
    /// Parse and validate a raw payload for the given task type.
    /// Rejected payloads never enter the queue.
    pub fn parse(task_type: TaskType, raw: &Value) -> Result<Self, ValidationError> {
        match task_type {
            TaskType::Message => {
                let p: MessagePayload = serde_json::from_value(raw.clone())
                    .map_err(|e| ValidationError::Invalid(e.to_string()))?;
                if p.content.trim().is_empty() {
                    return Err(ValidationError::MissingField("content"));
                }
                Ok(TaskPayload::Message(p))
            }
            TaskType::Checklist => {
                let p: ChecklistPayload = serde_json::from_value(raw.clone())
                    .map_err(|e| ValidationError::Invalid(e.to_string()))?;
                let has_text = p
                    .source_text
                    .as_deref()
                    .is_some_and(|t| !t.trim().is_empty());
                let has_outline = p.outline.as_ref().is_some_and(|o| !o.days.is_empty());
                if !has_text && !has_outline {
                    return Err(ValidationError::Invalid(
                        "checklist payload needs source_text or a non-empty outline".to_string(),
                    ));
                }
                Ok(TaskPayload::Checklist(p))
            }
            TaskType::Checkin => {
                let p: CheckinPayload = serde_json::from_value(raw.clone())
                    .map_err(|e| ValidationError::Invalid(e.to_string()))?;
                if p.checklist.is_null() {
                    return Err(ValidationError::MissingField("checklist"));
                }
                Ok(TaskPayload::Checkin(p))
            }
        }
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::Message(_) => TaskType::Message,
            TaskPayload::Checklist(_) => TaskType::Checklist,
            TaskPayload::Checkin(_) => TaskType::Checkin,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            TaskPayload::Message(p) => serde_json::to_value(p).unwrap_or(Value::Null),
            TaskPayload::Checklist(p) => serde_json::to_value(p).unwrap_or(Value::Null),
            TaskPayload::Checkin(p) => serde_json::to_value(p).unwrap_or(Value::Null),
        }
    }
}

// ── Record ───────────────────────────────────────────────────────────────────

/// The durable unit of work. `owner` is the dispatcher worker currently
/// processing the record; non-NULL owner implies `status = processing`.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    pub owner: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Unix milliseconds. `(status, created_at)` is the claim-scan index.
    pub created_at: i64,
    pub updated_at: i64,
}

// ── Validation errors ────────────────────────────────────────────────────────

/// Producer-side payload rejection. Maps to HTTP 400 — never enqueued.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unknown task type '{0}'")]
    UnknownType(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid payload: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_payload_requires_content() {
        let err = TaskPayload::parse(TaskType::Message, &json!({ "content": "  " }));
        assert!(err.is_err());

        let ok = TaskPayload::parse(TaskType::Message, &json!({ "content": "plan my day" }));
        assert!(matches!(ok, Ok(TaskPayload::Message(_))));
    }

    #[test]
    fn checklist_payload_requires_text_or_outline() {
        let err = TaskPayload::parse(TaskType::Checklist, &json!({}));
        assert!(err.is_err());

        let ok = TaskPayload::parse(
            TaskType::Checklist,
            &json!({ "outline": { "days": [{ "date": "2026-09-01", "theme": "setup" }] } }),
        );
        assert!(matches!(ok, Ok(TaskPayload::Checklist(_))));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = "birthday".parse::<TaskType>().unwrap_err();
        assert!(err.to_string().contains("birthday"));
    }

    #[test]
    fn status_round_trips_and_knows_terminal() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Processing,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<TaskStatus>().unwrap(), s);
        }
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }
}

//! Task handlers: message, checklist, check-in.
//!
//! Each handler is a pure function of (payload, inference capability,
//! result publisher). They share a contract: publish ordered partial events
//! as output is produced, publish exactly one terminal event before
//! returning, and translate inference failures into errors instead of
//! letting them escape to the dispatcher.

pub mod checkin;
pub mod checklist;
pub mod message;

use std::sync::Arc;

use crate::dispatch::HandlerRegistry;
use crate::events::ResultPublisher;
use crate::inference::InferenceClient;
use crate::tasks::{TaskStorage, TaskType};

/// Build the routing table for all supported task types.
pub fn default_registry(
    storage: Arc<TaskStorage>,
    inference: Arc<dyn InferenceClient>,
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(
        TaskType::Message,
        Arc::new(message::MessageHandler::new(
            Arc::clone(&inference),
            storage,
        )),
    );
    registry.register(
        TaskType::Checklist,
        Arc::new(checklist::ChecklistHandler::new(Arc::clone(&inference))),
    );
    registry.register(
        TaskType::Checkin,
        Arc::new(checkin::CheckinHandler::new(inference)),
    );
    registry
}

/// Publish free text as ordered `chunk` events, one per paragraph, so a
/// live client renders output incrementally instead of all at once.
pub(crate) fn publish_text_chunks(publisher: &ResultPublisher, text: &str) {
    for chunk in text.split_inclusive("\n\n") {
        if !chunk.is_empty() {
            publisher.chunk(chunk);
        }
    }
}

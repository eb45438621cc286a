//! Result channel broker — ephemeral per-request pub/sub.
//!
//! Handlers publish partial and terminal events under a correlation id (the
//! task id); the stream gateway subscribes on the same id and forwards them
//! to the client. Nothing here is durable: events published with no live
//! subscriber are dropped by design, and the task record remains the source
//! of truth for "did this finish".

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

/// Buffered events per topic before slow subscribers start lagging.
const TOPIC_CAPACITY: usize = 256;

// ─── Events ──────────────────────────────────────────────────────────────────

/// One event on a request's result stream.
///
/// `chunk`/`progress` may repeat; `done`/`error` are terminal, at most one
/// per stream, and mutually exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Subscription acknowledgment, emitted by the gateway before any real
    /// event so the client knows it is listening.
    Connected { request_id: String },
    /// Partial free-text output, order-sensitive.
    Chunk { text: String },
    /// Field-by-field construction of a structured result.
    Progress { update: Value },
    Done { result: Option<Value> },
    Error { message: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }

    /// SSE event name for this variant.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Connected { .. } => "connected",
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::Progress { .. } => "progress",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }
}

// ─── Broker ──────────────────────────────────────────────────────────────────

/// Keyed fan-out over tokio broadcast channels. One sender per live
/// correlation id; topics exist only while someone is subscribed.
pub struct ResultBroker {
    topics: Mutex<HashMap<String, broadcast::Sender<StreamEvent>>>,
}

impl Default for ResultBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultBroker {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Publish fire-and-forget. No subscriber on the topic means the event
    /// is dropped — a lost live-stream message must never fail the task.
    pub fn publish(&self, correlation_id: &str, event: StreamEvent) {
        let topics = self.topics.lock().expect("broker lock poisoned");
        match topics.get(correlation_id) {
            Some(tx) => {
                // Send only errors when there are no receivers — same deal
                // as a missing topic.
                let _ = tx.send(event);
            }
            None => {
                debug!(request_id = %correlation_id, event = event.name(), "no subscriber — event dropped");
            }
        }
    }

    /// Subscribe to a correlation id, creating the topic if needed. The
    /// returned guard unsubscribes on drop; the topic is removed when its
    /// last subscriber goes away.
    pub fn subscribe(self: &Arc<Self>, correlation_id: &str) -> Subscription {
        let mut topics = self.topics.lock().expect("broker lock poisoned");
        let tx = topics
            .entry(correlation_id.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        Subscription {
            rx: Some(tx.subscribe()),
            correlation_id: correlation_id.to_string(),
            broker: Arc::clone(self),
        }
    }

    /// Number of live topics (tests and the health endpoint).
    pub fn topic_count(&self) -> usize {
        self.topics.lock().expect("broker lock poisoned").len()
    }

    fn drop_subscriber(&self, correlation_id: &str) {
        let mut topics = self.topics.lock().expect("broker lock poisoned");
        if let Some(tx) = topics.get(correlation_id) {
            // Callers free their receiver before reaching here, so a count
            // of zero means the topic is dead no matter how many drops race.
            if tx.receiver_count() == 0 {
                topics.remove(correlation_id);
            }
        }
    }
}

/// A live subscription to one correlation id. Dropping it always detaches
/// from the broker — subscriptions cannot leak on any exit path.
pub struct Subscription {
    /// Present for the subscription's whole life; taken in `drop`.
    rx: Option<broadcast::Receiver<StreamEvent>>,
    correlation_id: String,
    broker: Arc<ResultBroker>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Result<StreamEvent, broadcast::error::RecvError> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => Err(broadcast::error::RecvError::Closed),
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Free our receiver first, so the broker's count check observes the
        // true number of remaining subscribers even under racing drops.
        self.rx.take();
        self.broker.drop_subscriber(&self.correlation_id);
    }
}

// ─── Publisher ───────────────────────────────────────────────────────────────

/// Publishing handle bound to one correlation id, handed to handlers.
///
/// Enforces the terminal contract: after the first `done` or `error`, any
/// further terminal publish is a no-op, so exactly one terminal event ever
/// reaches a subscriber even when both the handler and the dispatcher try
/// to close the stream.
pub struct ResultPublisher {
    broker: Arc<ResultBroker>,
    request_id: String,
    terminal_sent: AtomicBool,
}

impl ResultPublisher {
    pub fn new(broker: Arc<ResultBroker>, request_id: String) -> Self {
        Self {
            broker,
            request_id,
            terminal_sent: AtomicBool::new(false),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn chunk(&self, text: impl Into<String>) {
        self.broker
            .publish(&self.request_id, StreamEvent::Chunk { text: text.into() });
    }

    pub fn progress(&self, update: Value) {
        self.broker
            .publish(&self.request_id, StreamEvent::Progress { update });
    }

    /// Publish the terminal `done` event. No-op if a terminal event was
    /// already published for this request.
    pub fn done(&self, result: Option<Value>) {
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broker
            .publish(&self.request_id, StreamEvent::Done { result });
    }

    /// Publish the terminal `error` event. Same latch as [`done`](Self::done).
    pub fn error(&self, message: impl Into<String>) {
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broker.publish(
            &self.request_id,
            StreamEvent::Error {
                message: message.into(),
            },
        );
    }
}

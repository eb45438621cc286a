//! Stream gateway — the client-facing side of the result broker.
//!
//! One `EventStream` per client connection: it acknowledges the
//! subscription first (`connected`), then forwards broker events until a
//! terminal event arrives or the client goes away. The receive loop polls
//! with a short timeout so loop exit is detected within one tick instead of
//! blocking forever on an idle channel, and the underlying subscription's
//! drop guard makes unsubscribe unconditional on every exit path.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tracing::debug;

use crate::events::{ResultBroker, StreamEvent, Subscription};

#[derive(Clone)]
pub struct StreamGateway {
    broker: Arc<ResultBroker>,
    poll_interval: Duration,
}

impl StreamGateway {
    pub fn new(broker: Arc<ResultBroker>, poll_interval: Duration) -> Self {
        Self {
            broker,
            poll_interval,
        }
    }

    /// Open a forwarding stream for one correlation id.
    pub fn open(&self, correlation_id: &str) -> EventStream {
        EventStream {
            subscription: self.broker.subscribe(correlation_id),
            poll_interval: self.poll_interval,
            connected_sent: false,
            finished: false,
        }
    }
}

/// Cancellable per-client read loop. `None` from `next_event` means the
/// stream is over: one terminal event was forwarded, or the channel closed.
pub struct EventStream {
    subscription: Subscription,
    poll_interval: Duration,
    connected_sent: bool,
    finished: bool,
}

impl EventStream {
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        if !self.connected_sent {
            self.connected_sent = true;
            return Some(StreamEvent::Connected {
                request_id: self.subscription.correlation_id().to_string(),
            });
        }

        loop {
            match timeout(self.poll_interval, self.subscription.recv()).await {
                // Idle tick — re-poll. Keeps exit latency bounded by the
                // poll interval without busy-spinning.
                Err(_elapsed) => continue,
                Ok(Ok(event)) => {
                    if event.is_terminal() {
                        self.finished = true;
                    }
                    return Some(event);
                }
                Ok(Err(RecvError::Lagged(missed))) => {
                    // At-least-once delivery: skip ahead rather than erroring
                    // out a slow client.
                    debug!(
                        request_id = %self.subscription.correlation_id(),
                        missed,
                        "subscriber lagged — skipping missed events"
                    );
                    continue;
                }
                Ok(Err(RecvError::Closed)) => return None,
            }
        }
    }
}

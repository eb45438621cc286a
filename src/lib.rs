pub mod config;
pub mod dispatch;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod inference;
pub mod rest;
pub mod tasks;

use std::sync::Arc;
use std::time::Duration;

use config::DaemonConfig;
use events::ResultBroker;
use gateway::StreamGateway;
use tasks::TaskStorage;

/// Shared application state passed to every route handler.
///
/// All handles are constructed once at process start and injected
/// explicitly — there is no process-wide singleton to reach for.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    /// Durable task queue (the source of truth for task outcomes).
    pub tasks: Arc<TaskStorage>,
    /// Ephemeral per-request result channels.
    pub broker: Arc<ResultBroker>,
    /// Client-facing forwarding loops over the broker.
    pub gateway: StreamGateway,
    pub started_at: std::time::Instant,
}

impl AppContext {
    pub fn new(config: Arc<DaemonConfig>, tasks: Arc<TaskStorage>, broker: Arc<ResultBroker>) -> Self {
        let gateway = StreamGateway::new(
            Arc::clone(&broker),
            Duration::from_millis(config.stream.forward_poll_ms),
        );
        Self {
            config,
            tasks,
            broker,
            gateway,
            started_at: std::time::Instant::now(),
        }
    }
}

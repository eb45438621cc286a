//! Bounded-concurrency task dispatcher.
//!
//! One dispatcher instance runs a single polling loop: each tick it claims
//! up to `concurrency - in_flight` pending records and launches a supervised
//! execution per successful claim. The counting semaphore is both the
//! concurrency ceiling and the in-flight bookkeeping — permit drop removes
//! the execution from the active set on every exit path, panics included.

pub mod registry;

pub use registry::{HandlerError, HandlerRegistry, TaskHandler, TaskOutcome};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::events::{ResultBroker, ResultPublisher};
use crate::tasks::{TaskRecord, TaskStorage};

pub struct Dispatcher {
    storage: Arc<TaskStorage>,
    registry: Arc<HandlerRegistry>,
    broker: Arc<ResultBroker>,
    semaphore: Arc<Semaphore>,
    config: DispatcherConfig,
    /// Claim owner recorded on every record this instance processes.
    worker_id: String,
}

impl Dispatcher {
    pub fn new(
        storage: Arc<TaskStorage>,
        registry: Arc<HandlerRegistry>,
        broker: Arc<ResultBroker>,
        config: DispatcherConfig,
    ) -> Self {
        let worker_id = format!("worker-{}", &Uuid::new_v4().to_string()[..8]);
        Self {
            storage,
            registry,
            broker,
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            config,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Number of handler executions currently in flight.
    pub fn in_flight(&self) -> usize {
        self.config.concurrency - self.semaphore.available_permits()
    }

    /// Poll-claim-execute loop. Returns after `shutdown` flips true and all
    /// in-flight executions finished or the grace period elapsed.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.worker_id,
            concurrency = self.config.concurrency,
            poll_ms = self.config.poll_interval_ms,
            "dispatcher started"
        );
        let mut ticker = interval(Duration::from_millis(self.config.poll_interval_ms));

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender counts as a shutdown request.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }

        self.drain().await;
        info!(worker_id = %self.worker_id, "dispatcher stopped");
    }

    /// One polling cycle: fetch up to the free capacity, race for claims,
    /// spawn a supervised execution per win.
    pub async fn poll_once(self: &Arc<Self>) {
        let available = self.semaphore.available_permits();
        if available == 0 {
            return;
        }

        let candidates = match self.storage.fetch_pending(available, None).await {
            Ok(records) => records,
            Err(e) => {
                warn!(err = %e, "pending scan failed — skipping poll cycle");
                return;
            }
        };

        for task in candidates {
            // Permit first, claim second: a claim is only attempted when the
            // execution slot to run it is already held.
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };

            match self.storage.try_claim(&task.id, &self.worker_id).await {
                Ok(true) => {
                    debug!(task_id = %task.id, task_type = %task.task_type, "claimed");
                    let dispatcher = Arc::clone(self);
                    tokio::spawn(async move {
                        dispatcher.execute(task, permit).await;
                    });
                }
                Ok(false) => {
                    // Lost the race to another instance — benign, skip.
                }
                Err(e) => {
                    warn!(task_id = %task.id, err = %e, "claim attempt failed");
                }
            }
        }
    }

    /// Supervised execution: route by type, enforce the hard deadline, and
    /// always record a terminal status. The permit held by this future is
    /// released on every path out, including an unwind.
    async fn execute(&self, task: TaskRecord, _permit: OwnedSemaphorePermit) {
        let publisher = ResultPublisher::new(Arc::clone(&self.broker), task.id.clone());

        let Some(handler) = self.registry.get(task.task_type) else {
            let msg = format!("no handler registered for task type '{}'", task.task_type);
            error!(task_id = %task.id, "{msg}");
            self.record_failure(&task.id, &publisher, &msg).await;
            return;
        };

        let deadline = Duration::from_secs(self.config.task_timeout_secs);
        match timeout(deadline, handler.handle(&task, &publisher)).await {
            Ok(Ok(outcome)) => {
                if let Err(e) = self.storage.complete(&task.id, &outcome.result).await {
                    error!(task_id = %task.id, err = %e, "failed to record completion");
                }
                // Normally a latched no-op — the handler publishes its own
                // done event. Covers handlers that forgot.
                publisher.done(Some(outcome.result));
                info!(task_id = %task.id, task_type = %task.task_type, "task completed");
            }
            Ok(Err(e)) => {
                let msg = e.to_string();
                warn!(task_id = %task.id, err = %msg, "handler failed");
                self.record_failure(&task.id, &publisher, &msg).await;
            }
            Err(_elapsed) => {
                // The handler is not trusted to self-report after a deadline
                // breach; the dispatcher writes the terminal state itself.
                let msg = format!("timed out after {}s", self.config.task_timeout_secs);
                warn!(task_id = %task.id, "{msg}");
                self.record_failure(&task.id, &publisher, &msg).await;
            }
        }
    }

    /// Durable failure first, ephemeral mirror second. A broker problem
    /// never escalates into a task failure.
    async fn record_failure(&self, task_id: &str, publisher: &ResultPublisher, msg: &str) {
        if let Err(e) = self.storage.fail(task_id, msg).await {
            error!(task_id = %task_id, err = %e, "failed to record task failure");
        }
        publisher.error(msg);
    }

    /// Wait for in-flight executions, bounded by the shutdown grace period.
    async fn drain(&self) {
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let all = self.config.concurrency as u32;
        match timeout(grace, self.semaphore.acquire_many(all)).await {
            Ok(Ok(_permits)) => {}
            Ok(Err(_closed)) => {}
            Err(_) => warn!(
                in_flight = self.in_flight(),
                "shutdown grace period elapsed with executions still in flight"
            ),
        }
    }
}

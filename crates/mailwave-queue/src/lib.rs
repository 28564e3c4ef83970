//! # Mailwave Queue
//!
//! The task-queue seam of the delivery engine. The dispatcher schedules one
//! task per delivery row with a not-before instant; a queue delivers each
//! task to a handler **at least once**, at or after that instant. Nothing
//! here assumes exactly-once delivery — the delivery worker's idempotency
//! guard is what makes redelivery safe.
//!
//! `LocalQueue` is the built-in implementation: SQLite-persisted (tasks
//! survive restarts), lease-based claiming (a crash mid-task redelivers it),
//! exponential backoff on retry.

pub mod local;

pub use local::{LocalQueue, run_queue};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailwave_core::Result;
use serde::{Deserialize, Serialize};

/// Payload of one scheduled delivery attempt. The delivery id is the
/// contract; the campaign id rides along for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub delivery_id: i64,
    pub campaign_id: i64,
}

/// What the handler wants the queue to do with the task afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Settled — drop the task. Also returned for no-op redeliveries.
    Done,
    /// Transient failure — requeue with backoff.
    Retry,
}

/// The unit of work executed per task. Implementations must be safe under
/// duplicate invocation for the same task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: DeliveryTask) -> Result<TaskOutcome>;
}

/// Scheduling surface consumed by the dispatcher.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Schedule a task to become eligible at or after `not_before`.
    /// Returns the queue's task id.
    async fn schedule(&self, task: DeliveryTask, not_before: DateTime<Utc>) -> Result<String>;

    /// Best-effort cancellation of a task that has not been claimed yet.
    async fn cancel(&self, task_id: &str) -> Result<()>;
}

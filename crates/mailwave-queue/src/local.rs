//! SQLite-backed local task queue.
//!
//! Tasks live in `queue.db` and survive restarts. A tick loop claims due
//! tasks under a lease and runs the handler on each in its own tokio task;
//! a lease that expires without completion makes the task claimable again,
//! which is exactly the at-least-once redelivery the worker contract expects.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, params};

use mailwave_core::config::QueueConfig;
use mailwave_core::error::{MailwaveError, Result};

use crate::{DeliveryTask, TaskHandler, TaskOutcome, TaskQueue};

/// A claimed task: queue id plus payload.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task_id: String,
    pub task: DeliveryTask,
}

/// What happened to a task on requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Scheduled again at the contained instant.
    At(DateTime<Utc>),
    /// Redelivery budget exhausted — parked as dead.
    Dead,
}

/// SQLite-persisted at-least-once task queue.
pub struct LocalQueue {
    conn: Mutex<Connection>,
    lease_secs: i64,
    retry_base_secs: i64,
    max_redeliveries: u32,
}

impl LocalQueue {
    /// Open or create the queue database.
    pub fn open(path: &Path, config: &QueueConfig) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| MailwaveError::Queue(format!("open queue db: {e}")))?;
        let queue = Self {
            conn: Mutex::new(conn),
            lease_secs: config.lease_secs as i64,
            retry_base_secs: config.retry_base_secs as i64,
            max_redeliveries: config.max_redeliveries,
        };
        queue.migrate()?;
        Ok(queue)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS delivery_tasks (
                id TEXT PRIMARY KEY,
                delivery_id INTEGER NOT NULL,
                campaign_id INTEGER NOT NULL,
                not_before TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'queued',   -- queued | leased | dead
                redeliveries INTEGER NOT NULL DEFAULT 0,
                leased_until TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_due
                ON delivery_tasks (state, not_before);
         ",
            )
            .map_err(|e| MailwaveError::Queue(format!("queue migration: {e}")))?;
        Ok(())
    }

    /// Claim up to `limit` tasks that are due at `now`: queued tasks past
    /// their not-before instant, plus leased tasks whose lease expired
    /// (crashed or hung worker — redeliver).
    pub fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ClaimedTask>> {
        let conn = self.conn.lock().unwrap();
        let now_s = now.to_rfc3339();

        let mut stmt = conn
            .prepare(
                "SELECT id, delivery_id, campaign_id FROM delivery_tasks
                 WHERE (state = 'queued' AND not_before <= ?1)
                    OR (state = 'leased' AND leased_until < ?1)
                 ORDER BY not_before
                 LIMIT ?2",
            )
            .map_err(|e| MailwaveError::Queue(format!("claim query: {e}")))?;

        let claimed: Vec<ClaimedTask> = stmt
            .query_map(params![now_s, limit as i64], |row| {
                Ok(ClaimedTask {
                    task_id: row.get(0)?,
                    task: DeliveryTask {
                        delivery_id: row.get(1)?,
                        campaign_id: row.get(2)?,
                    },
                })
            })
            .map_err(|e| MailwaveError::Queue(format!("claim rows: {e}")))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        let leased_until = (now + Duration::seconds(self.lease_secs)).to_rfc3339();
        for c in &claimed {
            conn.execute(
                "UPDATE delivery_tasks SET state = 'leased', leased_until = ?2 WHERE id = ?1",
                params![c.task_id, leased_until],
            )
            .map_err(|e| MailwaveError::Queue(format!("lease task: {e}")))?;
        }

        Ok(claimed)
    }

    /// Drop a settled task.
    pub fn complete(&self, task_id: &str) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute("DELETE FROM delivery_tasks WHERE id = ?1", [task_id])
            .map_err(|e| MailwaveError::Queue(format!("complete task: {e}")))?;
        Ok(())
    }

    /// Requeue a task after a transient failure, with exponential backoff.
    /// Once the redelivery budget is exhausted the task is parked as dead.
    pub fn requeue(&self, task_id: &str, now: DateTime<Utc>) -> Result<Requeue> {
        let conn = self.conn.lock().unwrap();
        let redeliveries: u32 = conn
            .query_row(
                "SELECT redeliveries FROM delivery_tasks WHERE id = ?1",
                [task_id],
                |row| row.get(0),
            )
            .map_err(|e| MailwaveError::Queue(format!("requeue lookup: {e}")))?;

        if redeliveries >= self.max_redeliveries {
            conn.execute(
                "UPDATE delivery_tasks SET state = 'dead', leased_until = NULL WHERE id = ?1",
                [task_id],
            )
            .map_err(|e| MailwaveError::Queue(format!("park dead: {e}")))?;
            tracing::warn!("💀 Task {task_id} parked as dead after {redeliveries} redeliveries");
            return Ok(Requeue::Dead);
        }

        // base * 2^n, exponent capped so the delay stays bounded
        let backoff = self.retry_base_secs << redeliveries.min(6);
        let next = now + Duration::seconds(backoff);
        conn.execute(
            "UPDATE delivery_tasks
             SET state = 'queued', redeliveries = redeliveries + 1,
                 not_before = ?2, leased_until = NULL
             WHERE id = ?1",
            params![task_id, next.to_rfc3339()],
        )
        .map_err(|e| MailwaveError::Queue(format!("requeue: {e}")))?;
        Ok(Requeue::At(next))
    }

    /// Tasks waiting or leased (not dead).
    pub fn live_count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM delivery_tasks WHERE state != 'dead'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| MailwaveError::Queue(format!("count: {e}")))?;
        Ok(n as usize)
    }

    /// Tasks parked as dead.
    pub fn dead_count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM delivery_tasks WHERE state = 'dead'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| MailwaveError::Queue(format!("count: {e}")))?;
        Ok(n as usize)
    }
}

#[async_trait]
impl TaskQueue for LocalQueue {
    async fn schedule(&self, task: DeliveryTask, not_before: DateTime<Utc>) -> Result<String> {
        let task_id = uuid::Uuid::new_v4().to_string();
        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT INTO delivery_tasks
                 (id, delivery_id, campaign_id, not_before, state, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'queued', ?5)",
                params![
                    task_id,
                    task.delivery_id,
                    task.campaign_id,
                    not_before.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| MailwaveError::Queue(format!("schedule task: {e}")))?;
        tracing::debug!(
            "📅 Task {task_id} scheduled for delivery {} not before {}",
            task.delivery_id,
            not_before.to_rfc3339()
        );
        Ok(task_id)
    }

    async fn cancel(&self, task_id: &str) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "DELETE FROM delivery_tasks WHERE id = ?1 AND state = 'queued'",
                [task_id],
            )
            .map_err(|e| MailwaveError::Queue(format!("cancel task: {e}")))?;
        Ok(())
    }
}

/// Run the queue loop: claim due tasks every `tick_secs` and hand each to
/// the handler in its own tokio task. Workers share no memory — the handler
/// owns all coordination through its store.
pub async fn run_queue(queue: Arc<LocalQueue>, handler: Arc<dyn TaskHandler>, tick_secs: u64) {
    tracing::info!("⏰ Delivery queue started (tick every {tick_secs}s)");
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(tick_secs));

    loop {
        interval.tick().await;

        let due = match queue.claim_due(Utc::now(), 32) {
            Ok(due) => due,
            Err(e) => {
                tracing::error!("❌ Queue sweep failed: {e}");
                continue;
            }
        };

        for claimed in due {
            let queue = queue.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let outcome = handler.handle(claimed.task).await;
                let result = match outcome {
                    Ok(TaskOutcome::Done) => queue.complete(&claimed.task_id),
                    Ok(TaskOutcome::Retry) => queue.requeue(&claimed.task_id, Utc::now()).map(|_| ()),
                    Err(e) => {
                        tracing::warn!(
                            "⚠️ Handler error for delivery {}: {e} — requeueing",
                            claimed.task.delivery_id
                        );
                        queue.requeue(&claimed.task_id, Utc::now()).map(|_| ())
                    }
                };
                if let Err(e) = result {
                    tracing::error!("❌ Queue bookkeeping failed for {}: {e}", claimed.task_id);
                }
            });
        }
    }
}

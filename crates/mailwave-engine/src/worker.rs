//! The per-delivery unit of work, safe under at-least-once task redelivery.
//!
//! Contract, in order: re-read the row and no-op if it already settled
//! (the idempotency guard); park the row as skipped when its campaign was
//! stopped; make exactly one transport call — holding no store lock; record
//! the outcome. Retry pacing belongs to the queue: the worker only reports
//! `Retry` while the row's attempt budget lasts.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use mailwave_core::error::{MailwaveError, Result};
use mailwave_core::types::CampaignStatus;
use mailwave_queue::{DeliveryTask, TaskHandler, TaskOutcome};
use mailwave_recipients::RecipientSource;
use mailwave_transport::EmailTransport;

use crate::store::CampaignStore;

/// Executes one delivery per task invocation.
pub struct DeliveryWorker {
    store: Arc<CampaignStore>,
    transport: Arc<dyn EmailTransport>,
    source: Arc<dyn RecipientSource>,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<CampaignStore>,
        transport: Arc<dyn EmailTransport>,
        source: Arc<dyn RecipientSource>,
    ) -> Self {
        Self {
            store,
            transport,
            source,
        }
    }

    /// Best-effort write-back of the sent marker into the source sheet.
    async fn sync_sheet(&self, delivery_id: i64, sheet_id: &str, row_number: Option<u32>) {
        let Some(row) = row_number else { return };
        match self.source.mark_sent(sheet_id, row).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_sheet_synced(delivery_id) {
                    tracing::warn!("⚠️ Could not record sheet sync for delivery {delivery_id}: {e}");
                }
            }
            Err(e) => {
                tracing::warn!("⚠️ Could not mark sheet row {row} as sent: {e}");
            }
        }
    }
}

#[async_trait]
impl TaskHandler for DeliveryWorker {
    async fn handle(&self, task: DeliveryTask) -> Result<TaskOutcome> {
        let delivery = match self.store.delivery(task.delivery_id) {
            Ok(d) => d,
            Err(MailwaveError::NotFound(_)) => {
                // Row deleted out from under the task (campaign removed or
                // reset) — nothing left to do
                tracing::warn!("⚠️ Task for missing delivery {} dropped", task.delivery_id);
                return Ok(TaskOutcome::Done);
            }
            Err(e) => return Err(e),
        };

        // Idempotency guard: a redelivered task for a settled row is success
        if delivery.status.is_terminal() {
            tracing::debug!(
                "Delivery {} already {} — duplicate task ignored",
                delivery.id,
                delivery.status
            );
            return Ok(TaskOutcome::Done);
        }

        let campaign = match self.store.campaign(delivery.campaign_id) {
            Ok(c) => c,
            Err(MailwaveError::NotFound(_)) => {
                tracing::warn!("⚠️ Campaign {} gone; dropping task", delivery.campaign_id);
                return Ok(TaskOutcome::Done);
            }
            Err(e) => return Err(e),
        };

        // Cooperative cancellation, checked just before the transport call.
        // A failed campaign awaits operator recovery — its leftovers must
        // not keep sending either.
        if matches!(
            campaign.status,
            CampaignStatus::Cancelled | CampaignStatus::Failed
        ) {
            self.store.record_skipped(
                delivery.id,
                &format!("campaign {}", campaign.status),
                Utc::now(),
            )?;
            return Ok(TaskOutcome::Done);
        }

        tracing::info!(
            "📧 Sending to {} for campaign '{}'",
            delivery.recipient_email,
            campaign.name
        );

        // The one transport call — no store lock is held across it
        let sent = self
            .transport
            .send(
                &delivery.recipient_email,
                delivery.recipient_name.as_deref(),
                &delivery.personalized_subject,
                &delivery.personalized_message,
            )
            .await;

        match sent {
            Ok(reply) => {
                let flipped = self.store.record_sent(
                    delivery.id,
                    reply.smtp_response.as_deref(),
                    Utc::now(),
                )?;
                if flipped {
                    tracing::info!("✅ Sent to {}", delivery.recipient_email);
                    self.sync_sheet(delivery.id, &campaign.sheet_id, delivery.sheet_row_number)
                        .await;
                } else {
                    // The row settled while the send was in flight (stop or
                    // duplicate task); the snapshot outcome is discarded
                    tracing::debug!("Delivery {} settled concurrently", delivery.id);
                }
                Ok(TaskOutcome::Done)
            }
            Err(err) if err.is_permanent() => {
                tracing::warn!(
                    "📪 Bounce for {}: {err}",
                    delivery.recipient_email
                );
                self.store
                    .record_bounced(delivery.id, &err.to_string(), Utc::now())?;
                Ok(TaskOutcome::Done)
            }
            Err(err) => {
                let attempts = delivery.send_attempts + 1;
                if attempts < delivery.max_send_attempts {
                    tracing::warn!(
                        "🔁 Send to {} failed (attempt {attempts}/{}): {err}",
                        delivery.recipient_email,
                        delivery.max_send_attempts
                    );
                    self.store
                        .record_retry(delivery.id, &err.to_string(), Utc::now())?;
                    Ok(TaskOutcome::Retry)
                } else {
                    tracing::error!(
                        "❌ Send to {} failed permanently after {attempts} attempt(s): {err}",
                        delivery.recipient_email
                    );
                    self.store
                        .record_failed(delivery.id, &err.to_string(), Utc::now())?;
                    Ok(TaskOutcome::Done)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mailwave_core::types::{DeliveryStatus, NewCampaign};
    use mailwave_queue::{LocalQueue, TaskQueue};
    use mailwave_recipients::StaticSource;
    use mailwave_transport::{MockTransport, SendErrorKind};

    use crate::dispatch::Dispatcher;

    struct Fixture {
        store: Arc<CampaignStore>,
        transport: Arc<MockTransport>,
        source: Arc<StaticSource>,
        queue: Arc<LocalQueue>,
        worker: DeliveryWorker,
        dir: std::path::PathBuf,
    }

    impl Fixture {
        fn new(name: &str, pairs: &[(&str, Option<&str>)]) -> Self {
            let dir = std::env::temp_dir().join(format!("mailwave-worker-{name}"));
            std::fs::create_dir_all(&dir).ok();
            let store = Arc::new(CampaignStore::open(&dir.join("campaigns.db")).unwrap());
            let transport = Arc::new(MockTransport::new());
            let source = Arc::new(StaticSource::from_pairs(pairs));
            let queue = Arc::new(
                LocalQueue::open(
                    &dir.join("queue.db"),
                    &mailwave_core::config::QueueConfig::default(),
                )
                .unwrap(),
            );
            let worker = DeliveryWorker::new(store.clone(), transport.clone(), source.clone());
            Self {
                store,
                transport,
                source,
                queue,
                worker,
                dir,
            }
        }

        async fn dispatch(&self, new: &NewCampaign) -> i64 {
            let campaign = self.store.create_campaign(new, Utc::now()).unwrap();
            let dispatcher = Dispatcher::new(
                self.store.clone(),
                self.source.clone(),
                self.queue.clone(),
            );
            dispatcher.dispatch(campaign.id, Utc::now()).await.unwrap();
            campaign.id
        }

        /// Run every due task through the worker, like the queue loop would.
        async fn drain(&self) -> usize {
            let mut handled = 0;
            loop {
                let due = self
                    .queue
                    .claim_due(Utc::now() + chrono::Duration::days(30), 100)
                    .unwrap();
                if due.is_empty() {
                    break;
                }
                for claimed in due {
                    match self.worker.handle(claimed.task).await.unwrap() {
                        TaskOutcome::Done => self.queue.complete(&claimed.task_id).unwrap(),
                        TaskOutcome::Retry => {
                            self.queue.requeue(&claimed.task_id, Utc::now()).unwrap();
                        }
                    }
                    handled += 1;
                }
            }
            handled
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.dir).ok();
        }
    }

    fn plain_campaign() -> NewCampaign {
        NewCampaign {
            name: "Flow".into(),
            description: None,
            subject: "Hi {{name}}".into(),
            message: "Hello {{name}}".into(),
            sheet_id: "1AbCdEfGhIjKl".into(),
            sheet_range: "A:Z".into(),
            use_delay: false,
            delay_min_minutes: 4,
            delay_max_minutes: 7,
            respect_business_hours: false,
            business_hours_start: 9,
            business_hours_end: 17,
            business_days_only: true,
            timezone: "UTC".into(),
            max_send_attempts: 3,
            scheduled_at: None,
        }
    }

    #[tokio::test]
    async fn test_end_to_end_completes_campaign() {
        let fx = Fixture::new(
            "e2e",
            &[
                ("a@acme.com", Some("A")),
                ("b@acme.com", Some("B")),
                ("c@acme.com", None),
                ("d@acme.com", None),
            ],
        );
        let cid = fx.dispatch(&plain_campaign()).await;
        fx.drain().await;

        let c = fx.store.campaign(cid).unwrap();
        assert_eq!(c.status, CampaignStatus::Completed);
        assert_eq!(c.emails_sent, 4);
        assert_eq!(c.emails_pending, 0);
        assert!((c.success_rate() - 100.0).abs() < f64::EPSILON);
        assert_eq!(fx.transport.sent().len(), 4);
        // Sheet write-back happened for every sent row
        assert_eq!(fx.source.marked().len(), 4);
        assert!(
            fx.store
                .deliveries_for(cid, None)
                .unwrap()
                .iter()
                .all(|d| d.marked_as_sent_in_sheet)
        );
    }

    #[tokio::test]
    async fn test_duplicate_task_sends_once() {
        let fx = Fixture::new("dup", &[("a@acme.com", None)]);
        let cid = fx.dispatch(&plain_campaign()).await;
        let rows = fx.store.deliveries_for(cid, None).unwrap();
        let task = DeliveryTask {
            delivery_id: rows[0].id,
            campaign_id: cid,
        };

        // Simulated queue redelivery: same task handled twice
        assert_eq!(fx.worker.handle(task).await.unwrap(), TaskOutcome::Done);
        assert_eq!(fx.worker.handle(task).await.unwrap(), TaskOutcome::Done);

        assert_eq!(fx.transport.call_count(), 1);
        let c = fx.store.campaign(cid).unwrap();
        assert_eq!(c.emails_sent, 1);
        assert_eq!(
            fx.store.delivery(rows[0].id).unwrap().status,
            DeliveryStatus::Sent
        );
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let fx = Fixture::new("retry", &[("flaky@acme.com", None)]);
        fx.transport
            .fail_times("flaky@acme.com", SendErrorKind::Connection, 2);
        let cid = fx.dispatch(&plain_campaign()).await;
        let row_id = fx.store.deliveries_for(cid, None).unwrap()[0].id;
        let task = DeliveryTask {
            delivery_id: row_id,
            campaign_id: cid,
        };

        assert_eq!(fx.worker.handle(task).await.unwrap(), TaskOutcome::Retry);
        assert_eq!(fx.worker.handle(task).await.unwrap(), TaskOutcome::Retry);
        let d = fx.store.delivery(row_id).unwrap();
        assert_eq!(d.status, DeliveryStatus::Pending);
        assert_eq!(d.send_attempts, 2);

        // Third attempt goes through
        assert_eq!(fx.worker.handle(task).await.unwrap(), TaskOutcome::Done);
        let c = fx.store.campaign(cid).unwrap();
        assert_eq!(c.status, CampaignStatus::Completed);
        assert_eq!(c.emails_sent, 1);
        assert_eq!(c.emails_failed, 0);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fail_row_not_campaign() {
        let fx = Fixture::new(
            "exhaust",
            &[("dead@acme.com", None), ("ok@acme.com", None)],
        );
        fx.transport
            .fail_always("dead@acme.com", SendErrorKind::Connection);
        let cid = fx.dispatch(&plain_campaign()).await;
        fx.drain().await;

        let c = fx.store.campaign(cid).unwrap();
        // One recipient failed out; the batch still completed normally
        assert_eq!(c.status, CampaignStatus::Completed);
        assert_eq!(c.emails_sent, 1);
        assert_eq!(c.emails_failed, 1);
        assert_eq!(c.error_count, 1);

        let failed = fx
            .store
            .deliveries_for(cid, Some(DeliveryStatus::Failed))
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].send_attempts, 3);
        assert!(!failed[0].can_retry());
    }

    #[tokio::test]
    async fn test_permanent_rejection_bounces_immediately() {
        let fx = Fixture::new("bounce", &[("gone@acme.com", None)]);
        fx.transport
            .fail_always("gone@acme.com", SendErrorKind::Rejected);
        let cid = fx.dispatch(&plain_campaign()).await;
        fx.drain().await;

        let rows = fx.store.deliveries_for(cid, None).unwrap();
        assert_eq!(rows[0].status, DeliveryStatus::Bounced);
        // One call — no retries for a permanent rejection
        assert_eq!(fx.transport.call_count(), 1);
        let c = fx.store.campaign(cid).unwrap();
        assert_eq!(c.status, CampaignStatus::Completed);
        assert_eq!(c.emails_failed, 1);
    }

    #[tokio::test]
    async fn test_cancellation_skips_remaining() {
        let pairs: Vec<(String, Option<&str>)> = (0..10)
            .map(|i| (format!("r{i}@acme.com"), None))
            .collect();
        let pair_refs: Vec<(&str, Option<&str>)> =
            pairs.iter().map(|(e, n)| (e.as_str(), *n)).collect();
        let fx = Fixture::new("cancel", &pair_refs);
        let cid = fx.dispatch(&plain_campaign()).await;

        // 4 deliveries settle, then the operator stops the campaign
        let rows = fx.store.deliveries_for(cid, None).unwrap();
        for row in rows.iter().take(4) {
            fx.worker
                .handle(DeliveryTask {
                    delivery_id: row.id,
                    campaign_id: cid,
                })
                .await
                .unwrap();
        }
        let report = fx.store.cancel_campaign(cid, Utc::now()).unwrap();
        assert_eq!(report.skipped, 6);
        for task_id in &report.task_ids {
            fx.queue.cancel(task_id).await.unwrap();
        }

        // Whatever the queue still redelivers is a no-op
        fx.drain().await;

        let c = fx.store.campaign(cid).unwrap();
        assert_eq!(c.status, CampaignStatus::Cancelled);
        assert_eq!(c.emails_sent + c.emails_failed, 4);
        assert_eq!(c.emails_skipped(), 6);
        assert_eq!(
            fx.store
                .deliveries_for(cid, Some(DeliveryStatus::Skipped))
                .unwrap()
                .len(),
            6
        );
        assert_eq!(fx.transport.call_count(), 4);
    }

    #[tokio::test]
    async fn test_worker_skips_rows_when_campaign_cancelled_first() {
        let fx = Fixture::new("skip", &[("a@acme.com", None)]);
        let cid = fx.dispatch(&plain_campaign()).await;
        fx.store.cancel_campaign(cid, Utc::now()).unwrap();

        // The row was already parked by the cancel; a straggler task for it
        // hits the idempotency guard, not the transport
        let row_id = fx.store.deliveries_for(cid, None).unwrap()[0].id;
        let outcome = fx
            .worker
            .handle(DeliveryTask {
                delivery_id: row_id,
                campaign_id: cid,
            })
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Done);
        assert_eq!(fx.transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_row_is_dropped() {
        let fx = Fixture::new("missing", &[("a@acme.com", None)]);
        let outcome = fx
            .worker
            .handle(DeliveryTask {
                delivery_id: 424242,
                campaign_id: 1,
            })
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Done);
        assert_eq!(fx.transport.call_count(), 0);
    }
}

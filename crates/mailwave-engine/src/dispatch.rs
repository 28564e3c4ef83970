//! Campaign dispatch: the exactly-once fan-out from a triggered campaign to
//! persisted delivery rows and scheduled queue tasks.
//!
//! Recipients are read once, rendered once, inserted in list order, and each
//! row gets one task whose not-before instant comes from the scheduling
//! chain. A failure after the campaign entered `Sending` moves it to
//! `Failed` — it is never left sending with rows no task will ever cover.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;

use mailwave_core::error::Result;
use mailwave_core::template;
use mailwave_queue::{DeliveryTask, TaskQueue};
use mailwave_recipients::RecipientSource;

use crate::schedule::{ScheduleChain, SendWindow, Spacing};
use crate::store::{CampaignStore, PreparedDelivery};

/// What a dispatch produced.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// Delivery tasks scheduled.
    pub scheduled: usize,
    /// Source rows dropped for failing validation.
    pub skipped_invalid: usize,
    /// Not-before instant of the first and last recipient.
    pub first_at: Option<DateTime<Utc>>,
    pub last_at: Option<DateTime<Utc>>,
}

/// Turns a trigger request into rows + tasks.
pub struct Dispatcher {
    store: Arc<CampaignStore>,
    source: Arc<dyn RecipientSource>,
    queue: Arc<dyn TaskQueue>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<CampaignStore>,
        source: Arc<dyn RecipientSource>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            store,
            source,
            queue,
        }
    }

    /// Dispatch a campaign. Exactly-once: a concurrent second trigger gets a
    /// conflict from the store and nothing is created for it.
    pub async fn dispatch(&self, campaign_id: i64, now: DateTime<Utc>) -> Result<DispatchReport> {
        let campaign = self.store.begin_dispatch(campaign_id, now)?;
        tracing::info!("🚀 Dispatching campaign '{}' ({campaign_id})", campaign.name);

        let recipients = match self
            .source
            .list_recipients(&campaign.sheet_id, &campaign.sheet_range)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                self.store
                    .fail_campaign(campaign_id, &format!("recipient source: {e}"), now)?;
                return Err(e);
            }
        };

        // Render once per recipient, in list order. Invalid rows never become
        // delivery rows; they are logged and counted.
        let mut prepared = Vec::new();
        let mut skipped_invalid = 0usize;
        for row in &recipients {
            if row.email.trim().is_empty() || !row.is_valid {
                tracing::warn!(
                    "⚠️ Skipping sheet row {}: {}",
                    row.row_number,
                    row.validation_error.as_deref().unwrap_or("invalid email")
                );
                skipped_invalid += 1;
                continue;
            }
            let mut vars = template::builtin_vars(&row.email, row.name.as_deref());
            vars.extend(row.extra.iter().cloned());
            prepared.push(PreparedDelivery {
                recipient_email: row.email.trim().to_string(),
                recipient_name: row.name.clone(),
                personalized_subject: template::render(&campaign.subject, &vars),
                personalized_message: template::render(&campaign.message, &vars),
                sheet_row_number: Some(row.row_number),
            });
        }

        let ids = match self
            .store
            .insert_deliveries(campaign_id, campaign.max_send_attempts, &prepared, now)
        {
            Ok(ids) => ids,
            Err(e) => {
                self.store
                    .fail_campaign(campaign_id, &format!("persisting rows: {e}"), now)?;
                return Err(e);
            }
        };

        // Draw the whole schedule up front; the rng does not cross an await.
        let window = SendWindow::from_campaign(&campaign);
        let spacing = Spacing::from_campaign(&campaign);
        let instants: Vec<DateTime<Utc>> = {
            let mut chain = ScheduleChain::new(now, &window, &spacing, StdRng::from_entropy());
            ids.iter().map(|_| chain.next_instant()).collect()
        };

        for (delivery_id, not_before) in ids.iter().zip(&instants) {
            let task = DeliveryTask {
                delivery_id: *delivery_id,
                campaign_id,
            };
            match self.queue.schedule(task, *not_before).await {
                Ok(task_id) => self.store.set_task_id(*delivery_id, &task_id)?,
                Err(e) => {
                    self.store
                        .fail_campaign(campaign_id, &format!("task scheduling: {e}"), now)?;
                    return Err(e);
                }
            }
        }

        tracing::info!(
            "📬 Campaign {campaign_id}: {} delivery task(s) scheduled, {} invalid row(s) skipped",
            ids.len(),
            skipped_invalid
        );
        Ok(DispatchReport {
            scheduled: ids.len(),
            skipped_invalid,
            first_at: instants.first().copied(),
            last_at: instants.last().copied(),
        })
    }
}

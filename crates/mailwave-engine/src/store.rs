//! SQLite-backed campaign store.
//!
//! Owns both state machines: the campaign lifecycle and the per-recipient
//! delivery rows, plus the aggregate counters that tie them together. Every
//! mutation goes through one `Mutex<Connection>` and counter math happens in
//! single SQL UPDATE statements, so concurrent delivery workers can never
//! lose an update. Status flips are conditional UPDATEs — the number of rows
//! affected is the arbiter for exactly-once transitions (trigger, completion,
//! cancellation).

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use mailwave_core::error::{MailwaveError, Result};
use mailwave_core::types::{Campaign, CampaignStatus, Delivery, DeliveryStatus, NewCampaign};

/// A delivery row ready for insertion: rendered content plus recipient data.
#[derive(Debug, Clone)]
pub struct PreparedDelivery {
    pub recipient_email: String,
    pub recipient_name: Option<String>,
    pub personalized_subject: String,
    pub personalized_message: String,
    pub sheet_row_number: Option<u32>,
}

/// Result of a campaign cancellation.
#[derive(Debug, Clone)]
pub struct CancelReport {
    /// Pending rows flipped to skipped at the moment of stop.
    pub skipped: usize,
    /// Queue task ids of those rows, for best-effort queue cancellation.
    pub task_ids: Vec<String>,
}

const CAMPAIGN_COLUMNS: &str = "id, name, description, subject, message, sheet_id, sheet_range, \
     status, total_recipients, emails_sent, emails_failed, emails_pending, error_count, \
     use_delay, delay_min_minutes, delay_max_minutes, \
     respect_business_hours, business_hours_start, business_hours_end, business_days_only, timezone, \
     max_send_attempts, error_message, created_at, updated_at, scheduled_at, started_at, completed_at";

const DELIVERY_COLUMNS: &str = "id, campaign_id, recipient_email, recipient_name, \
     personalized_subject, personalized_message, status, send_attempts, max_send_attempts, \
     sheet_row_number, marked_as_sent_in_sheet, task_id, error_message, smtp_response, \
     created_at, updated_at, sent_at";

/// Campaign + delivery persistence.
pub struct CampaignStore {
    conn: Mutex<Connection>,
}

impl CampaignStore {
    /// Open or create the campaign database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| MailwaveError::Storage(format!("open campaign db: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| MailwaveError::Storage(format!("pragma: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS campaigns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT,
                subject TEXT NOT NULL,
                message TEXT NOT NULL,
                sheet_id TEXT NOT NULL,
                sheet_range TEXT NOT NULL DEFAULT 'A:Z',
                status TEXT NOT NULL DEFAULT 'draft',
                total_recipients INTEGER NOT NULL DEFAULT 0,
                emails_sent INTEGER NOT NULL DEFAULT 0,
                emails_failed INTEGER NOT NULL DEFAULT 0,
                emails_pending INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                use_delay INTEGER NOT NULL DEFAULT 0,
                delay_min_minutes INTEGER NOT NULL DEFAULT 4,
                delay_max_minutes INTEGER NOT NULL DEFAULT 7,
                respect_business_hours INTEGER NOT NULL DEFAULT 0,
                business_hours_start INTEGER NOT NULL DEFAULT 7,
                business_hours_end INTEGER NOT NULL DEFAULT 17,
                business_days_only INTEGER NOT NULL DEFAULT 1,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                max_send_attempts INTEGER NOT NULL DEFAULT 3,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                scheduled_at TEXT,
                started_at TEXT,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS deliveries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                campaign_id INTEGER NOT NULL
                    REFERENCES campaigns(id) ON DELETE CASCADE,
                recipient_email TEXT NOT NULL,
                recipient_name TEXT,
                personalized_subject TEXT NOT NULL,
                personalized_message TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                send_attempts INTEGER NOT NULL DEFAULT 0,
                max_send_attempts INTEGER NOT NULL DEFAULT 3,
                sheet_row_number INTEGER,
                marked_as_sent_in_sheet INTEGER NOT NULL DEFAULT 0,
                task_id TEXT,
                error_message TEXT,
                smtp_response TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                sent_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_campaigns_status ON campaigns (status);
            CREATE INDEX IF NOT EXISTS idx_deliveries_campaign ON deliveries (campaign_id);
            CREATE INDEX IF NOT EXISTS idx_deliveries_status ON deliveries (campaign_id, status);
         ",
            )
            .map_err(|e| MailwaveError::Storage(format!("migration: {e}")))?;
        Ok(())
    }

    // ─── Campaign CRUD ──────────────────────────────────────

    /// Create a campaign in `Draft`, or `Scheduled` when a trigger instant
    /// was supplied. Counters start at zero — rows only exist after dispatch.
    pub fn create_campaign(&self, new: &NewCampaign, now: DateTime<Utc>) -> Result<Campaign> {
        new.validate()?;
        let status = if new.scheduled_at.is_some() {
            CampaignStatus::Scheduled
        } else {
            CampaignStatus::Draft
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO campaigns
             (name, description, subject, message, sheet_id, sheet_range, status,
              use_delay, delay_min_minutes, delay_max_minutes,
              respect_business_hours, business_hours_start, business_hours_end,
              business_days_only, timezone, max_send_attempts,
              created_at, updated_at, scheduled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17, ?18)",
            params![
                new.name,
                new.description,
                new.subject,
                new.message,
                new.sheet_id,
                new.sheet_range,
                status.as_str(),
                new.use_delay as i32,
                new.delay_min_minutes,
                new.delay_max_minutes,
                new.respect_business_hours as i32,
                new.business_hours_start,
                new.business_hours_end,
                new.business_days_only as i32,
                new.timezone,
                new.max_send_attempts,
                now.to_rfc3339(),
                new.scheduled_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| MailwaveError::Storage(format!("create campaign: {e}")))?;

        let id = conn.last_insert_rowid();
        tracing::info!("📝 Campaign '{}' created ({id}, {status})", new.name);
        get_campaign(&conn, id)
    }

    pub fn campaign(&self, id: i64) -> Result<Campaign> {
        let conn = self.conn.lock().unwrap();
        get_campaign(&conn, id)
    }

    /// List campaigns, newest first, optionally filtered by status.
    pub fn list_campaigns(&self, status: Option<CampaignStatus>) -> Result<Vec<Campaign>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS} FROM campaigns {} ORDER BY created_at DESC",
            if status.is_some() {
                "WHERE status = ?1"
            } else {
                ""
            }
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| MailwaveError::Storage(format!("list campaigns: {e}")))?;
        let rows = match status {
            Some(s) => stmt.query_map([s.as_str()], campaign_from_row),
            None => stmt.query_map([], campaign_from_row),
        }
        .map_err(|e| MailwaveError::Storage(format!("list campaigns: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Update an unsent campaign in place. Once dispatch has started the
    /// content is frozen.
    pub fn update_draft(&self, id: i64, new: &NewCampaign, now: DateTime<Utc>) -> Result<Campaign> {
        new.validate()?;
        let conn = self.conn.lock().unwrap();
        let status = if new.scheduled_at.is_some() {
            CampaignStatus::Scheduled
        } else {
            CampaignStatus::Draft
        };
        let changed = conn
            .execute(
                "UPDATE campaigns SET
                 name = ?2, description = ?3, subject = ?4, message = ?5,
                 sheet_id = ?6, sheet_range = ?7, status = ?8,
                 use_delay = ?9, delay_min_minutes = ?10, delay_max_minutes = ?11,
                 respect_business_hours = ?12, business_hours_start = ?13,
                 business_hours_end = ?14, business_days_only = ?15, timezone = ?16,
                 max_send_attempts = ?17, scheduled_at = ?18, updated_at = ?19
                 WHERE id = ?1 AND status IN ('draft', 'scheduled')",
                params![
                    id,
                    new.name,
                    new.description,
                    new.subject,
                    new.message,
                    new.sheet_id,
                    new.sheet_range,
                    status.as_str(),
                    new.use_delay as i32,
                    new.delay_min_minutes,
                    new.delay_max_minutes,
                    new.respect_business_hours as i32,
                    new.business_hours_start,
                    new.business_hours_end,
                    new.business_days_only as i32,
                    new.timezone,
                    new.max_send_attempts,
                    new.scheduled_at.map(|t| t.to_rfc3339()),
                    now.to_rfc3339(),
                ],
            )
            .map_err(|e| MailwaveError::Storage(format!("update campaign: {e}")))?;
        if changed == 0 {
            let existing = get_campaign(&conn, id)?;
            return Err(MailwaveError::Conflict(format!(
                "campaign {id} cannot be edited in status {}",
                existing.status
            )));
        }
        get_campaign(&conn, id)
    }

    /// Delete a campaign and (by cascade) its delivery rows. A campaign that
    /// is actively sending must be stopped first.
    pub fn delete_campaign(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let existing = get_campaign(&conn, id)?;
        if existing.status == CampaignStatus::Sending {
            return Err(MailwaveError::Conflict(format!(
                "campaign {id} is currently sending; stop it before deleting"
            )));
        }
        conn.execute("DELETE FROM campaigns WHERE id = ?1", [id])
            .map_err(|e| MailwaveError::Storage(format!("delete campaign: {e}")))?;
        tracing::info!("🗑️ Campaign {id} deleted");
        Ok(())
    }

    // ─── Dispatch ──────────────────────────────────────

    /// Claim the exclusive right to dispatch: `Draft`/`Scheduled → Sending`.
    /// A concurrent second trigger sees zero rows affected and gets a
    /// conflict; nothing else is mutated.
    pub fn begin_dispatch(&self, id: i64, now: DateTime<Utc>) -> Result<Campaign> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE campaigns
                 SET status = 'sending', started_at = ?2, updated_at = ?2, error_message = NULL
                 WHERE id = ?1 AND status IN ('draft', 'scheduled')",
                params![id, now.to_rfc3339()],
            )
            .map_err(|e| MailwaveError::Storage(format!("begin dispatch: {e}")))?;
        if changed == 0 {
            let existing = get_campaign(&conn, id)?;
            return Err(MailwaveError::Conflict(format!(
                "campaign {id} cannot be sent from status {}",
                existing.status
            )));
        }
        get_campaign(&conn, id)
    }

    /// Persist the rendered delivery rows and set the campaign totals, in one
    /// transaction. Returns the new row ids in recipient order.
    pub fn insert_deliveries(
        &self,
        campaign_id: i64,
        max_send_attempts: i64,
        rows: &[PreparedDelivery],
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| MailwaveError::Storage(format!("insert deliveries: {e}")))?;

        let now_s = now.to_rfc3339();
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            tx.execute(
                "INSERT INTO deliveries
                 (campaign_id, recipient_email, recipient_name,
                  personalized_subject, personalized_message, status,
                  max_send_attempts, sheet_row_number, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?8)",
                params![
                    campaign_id,
                    row.recipient_email,
                    row.recipient_name,
                    row.personalized_subject,
                    row.personalized_message,
                    max_send_attempts,
                    row.sheet_row_number,
                    now_s,
                ],
            )
            .map_err(|e| MailwaveError::Storage(format!("insert delivery: {e}")))?;
            ids.push(tx.last_insert_rowid());
        }

        tx.execute(
            "UPDATE campaigns
             SET total_recipients = ?2, emails_pending = ?2, updated_at = ?3
             WHERE id = ?1",
            params![campaign_id, rows.len() as i64, now_s],
        )
        .map_err(|e| MailwaveError::Storage(format!("set totals: {e}")))?;

        // A batch with no valid recipients has nothing to drain — it is
        // trivially complete, never stuck sending
        if rows.is_empty() {
            complete_if_drained(&tx, campaign_id, now)?;
        }

        tx.commit()
            .map_err(|e| MailwaveError::Storage(format!("insert deliveries: {e}")))?;
        Ok(ids)
    }

    /// Record the queue task covering a delivery row.
    pub fn set_task_id(&self, delivery_id: i64, task_id: &str) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE deliveries SET task_id = ?2 WHERE id = ?1",
                params![delivery_id, task_id],
            )
            .map_err(|e| MailwaveError::Storage(format!("set task id: {e}")))?;
        Ok(())
    }

    /// Systemic dispatch failure: `Sending → Failed`. Individual recipient
    /// failures never come through here.
    pub fn fail_campaign(&self, id: i64, message: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE campaigns
                 SET status = 'failed', error_message = ?2,
                     error_count = error_count + 1, completed_at = ?3, updated_at = ?3
                 WHERE id = ?1 AND status = 'sending'",
                params![id, message, now.to_rfc3339()],
            )
            .map_err(|e| MailwaveError::Storage(format!("fail campaign: {e}")))?;
        tracing::error!("❌ Campaign {id} failed: {message}");
        Ok(())
    }

    // ─── Delivery outcomes ──────────────────────────────────────

    /// Record a successful send. The row flip is conditional on it still
    /// being pending, so a redelivered task (or a cancel racing an in-flight
    /// send) touches nothing; counters move only when the flip happened.
    /// Returns whether this call performed the transition.
    pub fn record_sent(
        &self,
        delivery_id: i64,
        smtp_response: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| MailwaveError::Storage(format!("record sent: {e}")))?;
        let now_s = now.to_rfc3339();

        let flipped = tx
            .execute(
                "UPDATE deliveries
                 SET status = 'sent', sent_at = ?2, smtp_response = ?3,
                     send_attempts = send_attempts + 1, updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![delivery_id, now_s, smtp_response],
            )
            .map_err(|e| MailwaveError::Storage(format!("record sent: {e}")))?;

        if flipped == 1 {
            let campaign_id = delivery_campaign_id(&tx, delivery_id)?;
            tx.execute(
                "UPDATE campaigns
                 SET emails_sent = emails_sent + 1,
                     emails_pending = emails_pending - 1, updated_at = ?2
                 WHERE id = ?1",
                params![campaign_id, now_s],
            )
            .map_err(|e| MailwaveError::Storage(format!("sent counters: {e}")))?;
            complete_if_drained(&tx, campaign_id, now)?;
        }

        tx.commit()
            .map_err(|e| MailwaveError::Storage(format!("record sent: {e}")))?;
        Ok(flipped == 1)
    }

    /// A transient failure with attempts remaining: bump the attempt counter,
    /// leave the row pending. The caller asks the queue to redeliver.
    pub fn record_retry(&self, delivery_id: i64, error: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE deliveries
                 SET send_attempts = send_attempts + 1, error_message = ?2, updated_at = ?3
                 WHERE id = ?1 AND status = 'pending'",
                params![delivery_id, error, now.to_rfc3339()],
            )
            .map_err(|e| MailwaveError::Storage(format!("record retry: {e}")))?;
        Ok(())
    }

    /// Attempts exhausted: the row becomes terminally failed.
    pub fn record_failed(&self, delivery_id: i64, error: &str, now: DateTime<Utc>) -> Result<bool> {
        self.record_terminal_failure(delivery_id, DeliveryStatus::Failed, error, now)
    }

    /// Permanent recipient rejection: the row bounces without retries.
    pub fn record_bounced(&self, delivery_id: i64, error: &str, now: DateTime<Utc>) -> Result<bool> {
        self.record_terminal_failure(delivery_id, DeliveryStatus::Bounced, error, now)
    }

    fn record_terminal_failure(
        &self,
        delivery_id: i64,
        status: DeliveryStatus,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| MailwaveError::Storage(format!("record failure: {e}")))?;
        let now_s = now.to_rfc3339();

        let flipped = tx
            .execute(
                "UPDATE deliveries
                 SET status = ?2, error_message = ?3,
                     send_attempts = send_attempts + 1, updated_at = ?4
                 WHERE id = ?1 AND status = 'pending'",
                params![delivery_id, status.as_str(), error, now_s],
            )
            .map_err(|e| MailwaveError::Storage(format!("record failure: {e}")))?;

        if flipped == 1 {
            let campaign_id = delivery_campaign_id(&tx, delivery_id)?;
            tx.execute(
                "UPDATE campaigns
                 SET emails_failed = emails_failed + 1, error_count = error_count + 1,
                     emails_pending = emails_pending - 1, updated_at = ?2
                 WHERE id = ?1",
                params![campaign_id, now_s],
            )
            .map_err(|e| MailwaveError::Storage(format!("failure counters: {e}")))?;
            complete_if_drained(&tx, campaign_id, now)?;
        }

        tx.commit()
            .map_err(|e| MailwaveError::Storage(format!("record failure: {e}")))?;
        Ok(flipped == 1)
    }

    /// A worker observed campaign-level cancellation before calling the
    /// transport: park the row as skipped.
    pub fn record_skipped(&self, delivery_id: i64, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| MailwaveError::Storage(format!("record skipped: {e}")))?;
        let now_s = now.to_rfc3339();

        let flipped = tx
            .execute(
                "UPDATE deliveries
                 SET status = 'skipped', error_message = ?2, updated_at = ?3
                 WHERE id = ?1 AND status = 'pending'",
                params![delivery_id, format!("skipped: {reason}"), now_s],
            )
            .map_err(|e| MailwaveError::Storage(format!("record skipped: {e}")))?;

        if flipped == 1 {
            let campaign_id = delivery_campaign_id(&tx, delivery_id)?;
            tx.execute(
                "UPDATE campaigns
                 SET emails_pending = emails_pending - 1, updated_at = ?2
                 WHERE id = ?1",
                params![campaign_id, now_s],
            )
            .map_err(|e| MailwaveError::Storage(format!("skip counters: {e}")))?;
            complete_if_drained(&tx, campaign_id, now)?;
        }

        tx.commit()
            .map_err(|e| MailwaveError::Storage(format!("record skipped: {e}")))?;
        Ok(flipped == 1)
    }

    /// Stop a campaign: `Sending`/`Scheduled → Cancelled`, and every row
    /// still pending at this moment is parked as skipped in the same
    /// transaction. In-flight sends settle against their snapshot — their
    /// later `record_sent` finds the row no longer pending and is a no-op.
    pub fn cancel_campaign(&self, id: i64, now: DateTime<Utc>) -> Result<CancelReport> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| MailwaveError::Storage(format!("cancel campaign: {e}")))?;
        let now_s = now.to_rfc3339();

        let changed = tx
            .execute(
                "UPDATE campaigns
                 SET status = 'cancelled', completed_at = ?2, updated_at = ?2
                 WHERE id = ?1 AND status IN ('sending', 'scheduled')",
                params![id, now_s],
            )
            .map_err(|e| MailwaveError::Storage(format!("cancel campaign: {e}")))?;
        if changed == 0 {
            let existing = get_campaign(&tx, id)?;
            return Err(MailwaveError::Conflict(format!(
                "campaign {id} cannot be stopped from status {}",
                existing.status
            )));
        }

        let mut stmt = tx
            .prepare(
                "SELECT task_id FROM deliveries
                 WHERE campaign_id = ?1 AND status = 'pending' AND task_id IS NOT NULL",
            )
            .map_err(|e| MailwaveError::Storage(format!("cancel tasks: {e}")))?;
        let task_ids: Vec<String> = stmt
            .query_map([id], |row| row.get(0))
            .map_err(|e| MailwaveError::Storage(format!("cancel tasks: {e}")))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        let skipped = tx
            .execute(
                "UPDATE deliveries
                 SET status = 'skipped', error_message = 'skipped: campaign cancelled',
                     updated_at = ?2
                 WHERE campaign_id = ?1 AND status = 'pending'",
                params![id, now_s],
            )
            .map_err(|e| MailwaveError::Storage(format!("skip pending: {e}")))?;

        tx.execute(
            "UPDATE campaigns SET emails_pending = 0, updated_at = ?2 WHERE id = ?1",
            params![id, now_s],
        )
        .map_err(|e| MailwaveError::Storage(format!("zero pending: {e}")))?;

        tx.commit()
            .map_err(|e| MailwaveError::Storage(format!("cancel campaign: {e}")))?;
        tracing::info!("🛑 Campaign {id} cancelled ({skipped} pending row(s) skipped)");
        Ok(CancelReport { skipped, task_ids })
    }

    pub fn mark_sheet_synced(&self, delivery_id: i64) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE deliveries SET marked_as_sent_in_sheet = 1 WHERE id = ?1",
                [delivery_id],
            )
            .map_err(|e| MailwaveError::Storage(format!("mark sheet synced: {e}")))?;
        Ok(())
    }

    // ─── Delivery reads ──────────────────────────────────────

    pub fn delivery(&self, id: i64) -> Result<Delivery> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE id = ?1"),
            [id],
            delivery_from_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                MailwaveError::NotFound(format!("delivery {id}"))
            }
            e => MailwaveError::Storage(format!("load delivery: {e}")),
        })
    }

    /// Delivery rows for a campaign, in creation (recipient-list) order.
    pub fn deliveries_for(
        &self,
        campaign_id: i64,
        status: Option<DeliveryStatus>,
    ) -> Result<Vec<Delivery>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE campaign_id = ?1 {} ORDER BY id",
            if status.is_some() {
                "AND status = ?2"
            } else {
                ""
            }
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| MailwaveError::Storage(format!("list deliveries: {e}")))?;
        let rows = match status {
            Some(s) => stmt.query_map(params![campaign_id, s.as_str()], delivery_from_row),
            None => stmt.query_map(params![campaign_id], delivery_from_row),
        }
        .map_err(|e| MailwaveError::Storage(format!("list deliveries: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // ─── Operator recovery ──────────────────────────────────────

    /// Abort-and-clear a partially dispatched campaign: back to `Draft`,
    /// delivery rows deleted, counters zeroed. Explicit operator action only.
    pub fn reset_stuck(&self, id: i64, note: &str, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| MailwaveError::Storage(format!("reset campaign: {e}")))?;

        let changed = tx
            .execute(
                "UPDATE campaigns
                 SET status = 'draft', started_at = NULL, completed_at = NULL,
                     total_recipients = 0, emails_sent = 0, emails_failed = 0,
                     emails_pending = 0, error_count = 0, error_message = ?2, updated_at = ?3
                 WHERE id = ?1 AND status IN ('sending', 'failed')",
                params![id, note, now.to_rfc3339()],
            )
            .map_err(|e| MailwaveError::Storage(format!("reset campaign: {e}")))?;
        if changed == 0 {
            let existing = get_campaign(&tx, id)?;
            return Err(MailwaveError::Conflict(format!(
                "campaign {id} cannot be reset from status {}",
                existing.status
            )));
        }
        tx.execute("DELETE FROM deliveries WHERE campaign_id = ?1", [id])
            .map_err(|e| MailwaveError::Storage(format!("reset deliveries: {e}")))?;

        tx.commit()
            .map_err(|e| MailwaveError::Storage(format!("reset campaign: {e}")))?;
        tracing::info!("🔧 Campaign {id} reset to draft");
        Ok(())
    }

    /// Sweep campaigns stuck in `Sending` with nothing sent for longer than
    /// `max_age_minutes` and reset each. Returns the reset ids.
    pub fn reset_stuck_older_than(
        &self,
        max_age_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let cutoff = (now - chrono::Duration::minutes(max_age_minutes)).to_rfc3339();
        let ids: Vec<i64> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn
                .prepare(
                    "SELECT id FROM campaigns
                     WHERE status = 'sending' AND emails_sent = 0 AND started_at < ?1",
                )
                .map_err(|e| MailwaveError::Storage(format!("stuck sweep: {e}")))?;
            stmt.query_map([cutoff], |row| row.get(0))
                .map_err(|e| MailwaveError::Storage(format!("stuck sweep: {e}")))?
                .filter_map(|r| r.ok())
                .collect()
        };

        for id in &ids {
            let note = format!("reset after being stuck in sending for over {max_age_minutes} minutes");
            self.reset_stuck(*id, &note, now)?;
        }
        Ok(ids)
    }
}

// ─── Row mapping & transition helpers ──────────────────────────────

/// Guarded completion: fires only while the campaign is still sending and
/// its pending counter just drained to zero. Because every decrement runs
/// serialized on the store connection, exactly one caller observes the
/// drained state — two rows finishing together cannot double-fire this.
fn complete_if_drained(conn: &Connection, campaign_id: i64, now: DateTime<Utc>) -> Result<()> {
    let completed = conn
        .execute(
            "UPDATE campaigns SET status = 'completed', completed_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'sending' AND emails_pending = 0",
            params![campaign_id, now.to_rfc3339()],
        )
        .map_err(|e| MailwaveError::Storage(format!("complete campaign: {e}")))?;
    if completed == 1 {
        tracing::info!("🎉 Campaign {campaign_id} completed");
    }
    Ok(())
}

fn delivery_campaign_id(conn: &Connection, delivery_id: i64) -> Result<i64> {
    conn.query_row(
        "SELECT campaign_id FROM deliveries WHERE id = ?1",
        [delivery_id],
        |row| row.get(0),
    )
    .map_err(|e| MailwaveError::Storage(format!("delivery owner: {e}")))
}

fn get_campaign(conn: &Connection, id: i64) -> Result<Campaign> {
    conn.query_row(
        &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"),
        [id],
        campaign_from_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => MailwaveError::NotFound(format!("campaign {id}")),
        e => MailwaveError::Storage(format!("load campaign: {e}")),
    })
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn campaign_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Campaign> {
    let status_str: String = row.get(7)?;
    Ok(Campaign {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        subject: row.get(3)?,
        message: row.get(4)?,
        sheet_id: row.get(5)?,
        sheet_range: row.get(6)?,
        status: CampaignStatus::parse(&status_str).unwrap_or(CampaignStatus::Draft),
        total_recipients: row.get(8)?,
        emails_sent: row.get(9)?,
        emails_failed: row.get(10)?,
        emails_pending: row.get(11)?,
        error_count: row.get(12)?,
        use_delay: row.get::<_, i32>(13)? != 0,
        delay_min_minutes: row.get(14)?,
        delay_max_minutes: row.get(15)?,
        respect_business_hours: row.get::<_, i32>(16)? != 0,
        business_hours_start: row.get(17)?,
        business_hours_end: row.get(18)?,
        business_days_only: row.get::<_, i32>(19)? != 0,
        timezone: row.get(20)?,
        max_send_attempts: row.get(21)?,
        error_message: row.get(22)?,
        created_at: parse_ts(row.get(23)?),
        updated_at: parse_ts(row.get(24)?),
        scheduled_at: row.get::<_, Option<String>>(25)?.map(parse_ts),
        started_at: row.get::<_, Option<String>>(26)?.map(parse_ts),
        completed_at: row.get::<_, Option<String>>(27)?.map(parse_ts),
    })
}

fn delivery_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Delivery> {
    let status_str: String = row.get(6)?;
    Ok(Delivery {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        recipient_email: row.get(2)?,
        recipient_name: row.get(3)?,
        personalized_subject: row.get(4)?,
        personalized_message: row.get(5)?,
        status: DeliveryStatus::parse(&status_str).unwrap_or(DeliveryStatus::Pending),
        send_attempts: row.get(7)?,
        max_send_attempts: row.get(8)?,
        sheet_row_number: row.get(9)?,
        marked_as_sent_in_sheet: row.get::<_, i32>(10)? != 0,
        task_id: row.get(11)?,
        error_message: row.get(12)?,
        smtp_response: row.get(13)?,
        created_at: parse_ts(row.get(14)?),
        updated_at: parse_ts(row.get(15)?),
        sent_at: row.get::<_, Option<String>>(16)?.map(parse_ts),
    })
}

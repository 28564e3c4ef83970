//! Campaign and delivery domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MailwaveError, Result};

/// Campaign lifecycle state.
///
/// `Draft → Scheduled → Sending → {Completed, Failed, Cancelled}`; the three
/// right-hand states are terminal and never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Completed,
    Failed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Scheduled => "scheduled",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(CampaignStatus::Draft),
            "scheduled" => Some(CampaignStatus::Scheduled),
            "sending" => Some(CampaignStatus::Sending),
            "completed" => Some(CampaignStatus::Completed),
            "failed" => Some(CampaignStatus::Failed),
            "cancelled" => Some(CampaignStatus::Cancelled),
            _ => None,
        }
    }

    /// No transition is defined out of a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Completed | CampaignStatus::Failed | CampaignStatus::Cancelled
        )
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-recipient delivery state.
///
/// `Sent`, `Bounced`, and `Skipped` are terminal. `Failed` is terminal once
/// send attempts are exhausted; before that the row stays `Pending` and the
/// attempt counter carries the retry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    Bounced,
    Skipped,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Bounced => "bounced",
            DeliveryStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "sent" => Some(DeliveryStatus::Sent),
            "failed" => Some(DeliveryStatus::Failed),
            "bounced" => Some(DeliveryStatus::Bounced),
            "skipped" => Some(DeliveryStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A batch send: shared template, schedule configuration, and aggregate
/// counters over its delivery rows.
///
/// Counter invariant, held at every observable instant:
/// `emails_sent + emails_failed + emails_pending + emails_skipped() ==
/// total_recipients`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    /// Subject template with `{{var}}` merge tags.
    pub subject: String,
    /// Plain-text body template with `{{var}}` merge tags.
    pub message: String,
    /// Spreadsheet the recipient list is read from at dispatch time.
    pub sheet_id: String,
    pub sheet_range: String,
    pub status: CampaignStatus,

    pub total_recipients: i64,
    pub emails_sent: i64,
    pub emails_failed: i64,
    pub emails_pending: i64,
    pub error_count: i64,

    pub use_delay: bool,
    pub delay_min_minutes: i64,
    pub delay_max_minutes: i64,

    pub respect_business_hours: bool,
    pub business_hours_start: u8,
    pub business_hours_end: u8,
    pub business_days_only: bool,
    /// IANA timezone name the business-hours window is evaluated in.
    pub timezone: String,

    pub max_send_attempts: i64,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// Rows parked as skipped — the complement of the three live counters.
    pub fn emails_skipped(&self) -> i64 {
        self.total_recipients - self.emails_sent - self.emails_failed - self.emails_pending
    }

    /// Percentage of recipients delivered successfully.
    pub fn success_rate(&self) -> f64 {
        if self.total_recipients == 0 {
            return 0.0;
        }
        (self.emails_sent as f64 / self.total_recipients as f64) * 100.0
    }

    /// Percentage of recipients that terminally failed (including bounces).
    pub fn failure_rate(&self) -> f64 {
        if self.total_recipients == 0 {
            return 0.0;
        }
        (self.emails_failed as f64 / self.total_recipients as f64) * 100.0
    }

    /// Queued or in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            CampaignStatus::Scheduled | CampaignStatus::Sending
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Creation payload for a campaign. Everything that can be validated is
/// validated here, before any row or task exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub subject: String,
    pub message: String,
    pub sheet_id: String,
    #[serde(default = "default_sheet_range")]
    pub sheet_range: String,
    #[serde(default)]
    pub use_delay: bool,
    #[serde(default = "default_delay_min")]
    pub delay_min_minutes: i64,
    #[serde(default = "default_delay_max")]
    pub delay_max_minutes: i64,
    #[serde(default)]
    pub respect_business_hours: bool,
    #[serde(default = "default_hours_start")]
    pub business_hours_start: u8,
    #[serde(default = "default_hours_end")]
    pub business_hours_end: u8,
    #[serde(default = "default_business_days_only")]
    pub business_days_only: bool,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: i64,
    /// When set, the campaign is created parked as `Scheduled` instead of
    /// `Draft`; firing it at that instant is the operator's job.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

fn default_sheet_range() -> String {
    "A:Z".into()
}
fn default_delay_min() -> i64 {
    4
}
fn default_delay_max() -> i64 {
    7
}
fn default_hours_start() -> u8 {
    7
}
fn default_hours_end() -> u8 {
    17
}
fn default_business_days_only() -> bool {
    true
}
fn default_timezone() -> String {
    "UTC".into()
}
fn default_max_send_attempts() -> i64 {
    3
}

impl NewCampaign {
    /// Creation-time validation. Configuration errors are rejected here and
    /// never reach the dispatcher.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MailwaveError::Validation("campaign name is required".into()));
        }
        if self.subject.trim().is_empty() {
            return Err(MailwaveError::Validation("email subject is required".into()));
        }
        if self.message.trim().is_empty() {
            return Err(MailwaveError::Validation("email message is required".into()));
        }
        if self.sheet_id.len() < 10
            || !self
                .sheet_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(MailwaveError::Validation(
                "sheet id must be at least 10 characters of [A-Za-z0-9_-]".into(),
            ));
        }
        if !(1..=60).contains(&self.delay_min_minutes) || !(1..=60).contains(&self.delay_max_minutes)
        {
            return Err(MailwaveError::Validation(
                "delay minutes must be between 1 and 60".into(),
            ));
        }
        if self.delay_min_minutes > self.delay_max_minutes {
            return Err(MailwaveError::Validation(
                "delay_min_minutes must not exceed delay_max_minutes".into(),
            ));
        }
        if self.business_hours_start > 23 {
            return Err(MailwaveError::Validation(
                "business_hours_start must be between 0 and 23".into(),
            ));
        }
        if self.business_hours_end < 1 || self.business_hours_end > 24 {
            return Err(MailwaveError::Validation(
                "business_hours_end must be between 1 and 24".into(),
            ));
        }
        if self.business_hours_end <= self.business_hours_start {
            return Err(MailwaveError::Validation(
                "business_hours_end must be after business_hours_start".into(),
            ));
        }
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(MailwaveError::Validation(format!(
                "unknown timezone '{}'",
                self.timezone
            )));
        }
        if self.max_send_attempts < 1 {
            return Err(MailwaveError::Validation(
                "max_send_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// One recipient's send record within a campaign. Created in bulk at dispatch
/// time, in recipient-list order; never outlives its campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: i64,
    pub campaign_id: i64,
    pub recipient_email: String,
    pub recipient_name: Option<String>,
    /// Materialized once at dispatch; later template edits never touch it.
    pub personalized_subject: String,
    pub personalized_message: String,
    pub status: DeliveryStatus,
    pub send_attempts: i64,
    pub max_send_attempts: i64,
    /// Back-reference into the source spreadsheet; not an ownership edge.
    pub sheet_row_number: Option<u32>,
    pub marked_as_sent_in_sheet: bool,
    /// Queue task covering this row, recorded for best-effort cancellation.
    pub task_id: Option<String>,
    pub error_message: Option<String>,
    pub smtp_response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl Delivery {
    /// Whether another transport attempt is allowed for this row.
    pub fn can_retry(&self) -> bool {
        self.status == DeliveryStatus::Pending && self.send_attempts < self.max_send_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_new() -> NewCampaign {
        NewCampaign {
            name: "Spring launch".into(),
            description: None,
            subject: "Hi {{name}}".into(),
            message: "Hello {{name}}, welcome.".into(),
            sheet_id: "1AbC-dEfGhIjKlMnOp".into(),
            sheet_range: default_sheet_range(),
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

    #[test]
    fn test_validate_ok() {
        assert!(valid_new().validate().is_ok());
    }

    #[test]
    fn test_validate_delay_range() {
        let mut c = valid_new();
        c.delay_min_minutes = 10;
        c.delay_max_minutes = 5;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validate_business_hours() {
        let mut c = valid_new();
        c.business_hours_start = 17;
        c.business_hours_end = 9;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validate_timezone() {
        let mut c = valid_new();
        c.timezone = "Mars/Olympus_Mons".into();
        assert!(c.validate().is_err());
        c.timezone = "America/New_York".into();
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_validate_sheet_id() {
        let mut c = valid_new();
        c.sheet_id = "short".into();
        assert!(c.validate().is_err());
        c.sheet_id = "has spaces in it!!".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_skipped_complement_and_rates() {
        let mut c = Campaign {
            id: 1,
            name: "t".into(),
            description: None,
            subject: "s".into(),
            message: "m".into(),
            sheet_id: "x".into(),
            sheet_range: "A:Z".into(),
            status: CampaignStatus::Sending,
            total_recipients: 10,
            emails_sent: 4,
            emails_failed: 1,
            emails_pending: 2,
            error_count: 1,
            use_delay: false,
            delay_min_minutes: 4,
            delay_max_minutes: 7,
            respect_business_hours: false,
            business_hours_start: 9,
            business_hours_end: 17,
            business_days_only: true,
            timezone: "UTC".into(),
            max_send_attempts: 3,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
        };
        assert_eq!(c.emails_skipped(), 3);
        assert!((c.success_rate() - 40.0).abs() < f64::EPSILON);
        assert!((c.failure_rate() - 10.0).abs() < f64::EPSILON);
        c.total_recipients = 0;
        c.emails_sent = 0;
        c.emails_failed = 0;
        c.emails_pending = 0;
        assert_eq!(c.success_rate(), 0.0);
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            CampaignStatus::Draft,
            CampaignStatus::Scheduled,
            CampaignStatus::Sending,
            CampaignStatus::Completed,
            CampaignStatus::Failed,
            CampaignStatus::Cancelled,
        ] {
            assert_eq!(CampaignStatus::parse(s.as_str()), Some(s));
        }
        assert!(CampaignStatus::Completed.is_terminal());
        assert!(!CampaignStatus::Sending.is_terminal());
        assert!(DeliveryStatus::Skipped.is_terminal());
        assert!(!DeliveryStatus::Pending.is_terminal());
    }
}

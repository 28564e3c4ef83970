//! # Mailwave Recipients
//!
//! The recipient-source seam: a campaign's recipient list is read exactly
//! once, at dispatch time, from a spreadsheet-like source. Rows carry the
//! email, an optional display name, and the remaining columns as an ordered
//! key/value list of merge variables.

pub mod sheets;

pub use sheets::SheetsSource;

use async_trait::async_trait;
use mailwave_core::Result;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, OnceLock};

/// One recipient row as read from the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientRow {
    /// 1-based row number in the source sheet.
    pub row_number: u32,
    pub email: String,
    pub name: Option<String>,
    /// Extra merge columns, in sheet column order.
    pub extra: Vec<(String, String)>,
    pub is_valid: bool,
    pub validation_error: Option<String>,
}

impl RecipientRow {
    /// A valid row with no extras — the common test fixture.
    pub fn valid(row_number: u32, email: &str, name: Option<&str>) -> Self {
        Self {
            row_number,
            email: email.to_string(),
            name: name.map(str::to_string),
            extra: Vec::new(),
            is_valid: true,
            validation_error: None,
        }
    }
}

/// Where recipient lists come from and where send confirmations go back to.
#[async_trait]
pub trait RecipientSource: Send + Sync {
    /// Read the recipient list, in sheet order.
    async fn list_recipients(&self, source_id: &str, range: &str) -> Result<Vec<RecipientRow>>;

    /// Write the "sent" marker back next to one row. Best-effort from the
    /// caller's point of view.
    async fn mark_sent(&self, source_id: &str, row_number: u32) -> Result<()>;
}

/// Syntactic email check — enough to keep junk rows out of the dispatcher.
pub fn is_valid_email(s: &str) -> bool {
    static EMAIL_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = EMAIL_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$")
            .expect("email regex is valid")
    });
    re.is_match(s)
}

/// Fixed in-memory source for tests and dry runs.
#[derive(Default)]
pub struct StaticSource {
    rows: Vec<RecipientRow>,
    marked: Mutex<Vec<u32>>,
}

impl StaticSource {
    pub fn new(rows: Vec<RecipientRow>) -> Self {
        Self {
            rows,
            marked: Mutex::new(Vec::new()),
        }
    }

    /// Build from `(email, name)` pairs; rows are validated syntactically.
    pub fn from_pairs(pairs: &[(&str, Option<&str>)]) -> Self {
        let rows = pairs
            .iter()
            .enumerate()
            .map(|(i, (email, name))| {
                let ok = is_valid_email(email);
                RecipientRow {
                    row_number: (i + 2) as u32, // row 1 is the header
                    email: email.to_string(),
                    name: name.map(str::to_string),
                    extra: Vec::new(),
                    is_valid: ok,
                    validation_error: (!ok).then(|| "invalid email syntax".to_string()),
                }
            })
            .collect();
        Self::new(rows)
    }

    /// Rows marked as sent so far.
    pub fn marked(&self) -> Vec<u32> {
        self.marked.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecipientSource for StaticSource {
    async fn list_recipients(&self, _source_id: &str, _range: &str) -> Result<Vec<RecipientRow>> {
        Ok(self.rows.clone())
    }

    async fn mark_sent(&self, _source_id: &str, row_number: u32) -> Result<()> {
        self.marked.lock().unwrap().push(row_number);
        Ok(())
    }
}

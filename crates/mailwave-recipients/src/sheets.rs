//! Google Sheets values API client.
//!
//! Reads the recipient table from a sheet's values range, auto-detecting the
//! email and name columns from the header row, and writes a "Sent" marker
//! back into the configured status column.

use mailwave_core::config::SheetsConfig;
use mailwave_core::error::{MailwaveError, Result};
use async_trait::async_trait;

use crate::{RecipientRow, RecipientSource, is_valid_email};

/// Header names recognized as the email column.
const EMAIL_COLUMN_NAMES: &[&str] = &[
    "email",
    "email address",
    "e-mail",
    "mail",
    "email_address",
    "user_email",
    "contact_email",
];

/// Header names recognized as the recipient-name column.
const NAME_COLUMN_NAMES: &[&str] = &[
    "name",
    "full name",
    "first name",
    "firstname",
    "last name",
    "lastname",
    "full_name",
    "contact_name",
    "recipient",
    "recipient_name",
    "user_name",
    "username",
];

const SENT_MARKER: &str = "Sent";

/// Spreadsheet-backed recipient source.
pub struct SheetsSource {
    client: reqwest::Client,
    config: SheetsConfig,
}

impl SheetsSource {
    pub fn new(config: SheetsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn fetch_values(&self, sheet_id: &str, range: &str) -> Result<Vec<Vec<String>>> {
        let url = format!(
            "{}/{}/values/{}",
            self.config.base_url, sheet_id, range
        );
        let resp = self
            .client
            .get(&url)
            .query(&[("key", self.config.api_key.as_str())])
            .timeout(std::time::Duration::from_secs(20))
            .send()
            .await
            .map_err(|e| MailwaveError::Source(format!("sheet fetch: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(MailwaveError::Source(format!(
                "sheet fetch {status}: {body}"
            )));
        }

        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| MailwaveError::Source(format!("sheet response parse: {e}")))?;

        let values = payload["values"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|row| {
                row.as_array()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|cell| cell.as_str().unwrap_or_default().to_string())
                    .collect()
            })
            .collect();
        Ok(values)
    }
}

/// Index of the first header matching one of `candidates` (case-insensitive).
fn detect_column(headers: &[String], candidates: &[&str]) -> Option<usize> {
    headers.iter().position(|h| {
        let h = h.trim().to_lowercase();
        candidates.contains(&h.as_str())
    })
}

/// Turn a value table into recipient rows. The first row is the header;
/// data rows keep their 1-based sheet row numbers.
pub fn parse_rows(values: &[Vec<String>]) -> Result<Vec<RecipientRow>> {
    let Some(headers) = values.first() else {
        return Ok(Vec::new());
    };
    let Some(email_col) = detect_column(headers, EMAIL_COLUMN_NAMES) else {
        return Err(MailwaveError::Source(
            "no email column found in sheet header".into(),
        ));
    };
    let name_col = detect_column(headers, NAME_COLUMN_NAMES);

    let mut rows = Vec::new();
    for (i, cells) in values.iter().enumerate().skip(1) {
        let row_number = (i + 1) as u32;
        let email = cells.get(email_col).map(|s| s.trim()).unwrap_or_default();
        if email.is_empty() {
            // Blank line in the sheet — not a recipient
            continue;
        }
        let name = name_col
            .and_then(|c| cells.get(c))
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        // Remaining headered columns become merge variables, in sheet order
        let extra: Vec<(String, String)> = headers
            .iter()
            .enumerate()
            .filter(|(c, h)| {
                *c != email_col && Some(*c) != name_col && !h.trim().is_empty()
            })
            .filter_map(|(c, h)| {
                cells
                    .get(c)
                    .map(|v| (h.trim().to_lowercase(), v.trim().to_string()))
            })
            .collect();

        let ok = is_valid_email(email);
        rows.push(RecipientRow {
            row_number,
            email: email.to_string(),
            name,
            extra,
            is_valid: ok,
            validation_error: (!ok).then(|| format!("invalid email: {email}")),
        });
    }
    Ok(rows)
}

#[async_trait]
impl RecipientSource for SheetsSource {
    async fn list_recipients(&self, source_id: &str, range: &str) -> Result<Vec<RecipientRow>> {
        let values = self.fetch_values(source_id, range).await?;
        let rows = parse_rows(&values)?;
        tracing::info!(
            "📋 Sheet {source_id}: {} recipient row(s), {} valid",
            rows.len(),
            rows.iter().filter(|r| r.is_valid).count()
        );
        Ok(rows)
    }

    async fn mark_sent(&self, source_id: &str, row_number: u32) -> Result<()> {
        let cell = format!("{}{}", self.config.status_column, row_number);
        let url = format!(
            "{}/{}/values/{}",
            self.config.base_url, source_id, cell
        );
        let body = serde_json::json!({
            "range": cell,
            "values": [[SENT_MARKER]],
        });
        let resp = self
            .client
            .put(&url)
            .query(&[
                ("key", self.config.api_key.as_str()),
                ("valueInputOption", "RAW"),
            ])
            .json(&body)
            .timeout(std::time::Duration::from_secs(20))
            .send()
            .await
            .map_err(|e| MailwaveError::Source(format!("sheet mark-sent: {e}")))?;

        if !resp.status().is_success() {
            return Err(MailwaveError::Source(format!(
                "sheet mark-sent {}: row {row_number}",
                resp.status()
            )));
        }
        tracing::debug!("✅ Row {row_number} marked as sent in sheet {source_id}");
        Ok(())
    }
}

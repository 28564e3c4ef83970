//! Mailwave configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MailwaveError, Result};

/// Root configuration, loaded from `~/.mailwave/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MailwaveConfig {
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub sheets: SheetsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl MailwaveConfig {
    /// Load config from the default path, falling back to defaults when the
    /// file does not exist yet.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MailwaveError::Config(format!("failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| MailwaveError::Config(format!("failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| MailwaveError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// The Mailwave home directory (`~/.mailwave`).
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mailwave")
    }
}

/// SMTP transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Envelope/From address for outgoing mail.
    #[serde(default)]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    /// When false, deliveries are recorded against the mock transport instead
    /// of a live SMTP relay (dry-run mode).
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_smtp_host() -> String {
    "smtp.gmail.com".into()
}
fn default_smtp_port() -> u16 {
    587
}
fn default_from_name() -> String {
    "Mailwave".into()
}
fn default_true() -> bool {
    true
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: String::new(),
            password: String::new(),
            from_email: String::new(),
            from_name: default_from_name(),
            enabled: true,
        }
    }
}

/// Spreadsheet recipient-source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetsConfig {
    /// API key passed as the `key` query parameter.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_sheets_base_url")]
    pub base_url: String,
    /// Column letter that receives the "Sent" marker on write-back.
    #[serde(default = "default_status_column")]
    pub status_column: String,
}

fn default_sheets_base_url() -> String {
    "https://sheets.googleapis.com/v4/spreadsheets".into()
}
fn default_status_column() -> String {
    "Z".into()
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_sheets_base_url(),
            status_column: default_status_column(),
        }
    }
}

/// Local task-queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Seconds between due-task sweeps.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// How long a claimed task stays leased before it becomes re-claimable.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// Base of the exponential backoff applied on requeue.
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    /// Redeliveries after which a task is parked as dead.
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u32,
}

fn default_tick_secs() -> u64 {
    5
}
fn default_lease_secs() -> u64 {
    120
}
fn default_retry_base_secs() -> u64 {
    60
}
fn default_max_redeliveries() -> u32 {
    5
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            lease_secs: default_lease_secs(),
            retry_base_secs: default_retry_base_secs(),
            max_redeliveries: default_max_redeliveries(),
        }
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}
fn default_gateway_port() -> u16 {
    8700
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
        }
    }
}

/// On-disk storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding `campaigns.db` and `queue.db`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    MailwaveConfig::home_dir().join("data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = MailwaveConfig::default();
        assert_eq!(cfg.smtp.port, 587);
        assert_eq!(cfg.queue.tick_secs, 5);
        assert_eq!(cfg.gateway.port, 8700);
        assert!(cfg.smtp.enabled);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: MailwaveConfig = toml::from_str(
            r#"
            [smtp]
            host = "mail.example.com"
            from_email = "no-reply@example.com"

            [gateway]
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.smtp.host, "mail.example.com");
        assert_eq!(cfg.smtp.port, 587);
        assert_eq!(cfg.gateway.port, 9000);
        assert_eq!(cfg.sheets.status_column, "Z");
    }
}

//! # Mailwave Core
//!
//! Shared foundation for the Mailwave workspace: the error type, the TOML
//! configuration file, the campaign/delivery domain model, and the merge-tag
//! template renderer. Everything here is dependency-light so every other
//! crate can build on it.

pub mod config;
pub mod error;
pub mod template;
pub mod types;

pub use config::MailwaveConfig;
pub use error::{MailwaveError, Result};
pub use types::{Campaign, CampaignStatus, Delivery, DeliveryStatus, NewCampaign};

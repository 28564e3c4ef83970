//! # Mailwave Engine
//!
//! The campaign delivery engine: everything between "trigger this batch" and
//! "every recipient row reached a terminal status".
//!
//! ## Architecture
//! ```text
//! trigger ──▶ Dispatcher
//!               ├── reads recipients once (RecipientSource)
//!               ├── renders subject/body once per recipient
//!               ├── bulk-inserts delivery rows (CampaignStore)
//!               └── schedules one task per row (TaskQueue),
//!                   not-before chained by the scheduling policy
//!
//! queue ──▶ DeliveryWorker (idempotent, at-least-once safe)
//!               ├── no-op when the row is already settled
//!               ├── skip when the campaign was cancelled
//!               ├── one transport call, outside any store lock
//!               └── records the outcome; counters stay consistent
//!
//! CampaignStore serializes every counter mutation; the completion
//! transition is a guarded decrement-and-test that fires exactly once.
//! ```

pub mod dispatch;
pub mod schedule;
pub mod store;
pub mod worker;

pub use dispatch::{DispatchReport, Dispatcher};
pub use schedule::{ScheduleChain, SendWindow, Spacing, next_send_instant};
pub use store::CampaignStore;
pub use worker::DeliveryWorker;

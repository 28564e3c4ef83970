//! # Mailwave Gateway
//!
//! HTTP control surface over the delivery engine: create, trigger, stop,
//! inspect, and reset campaigns. The gateway stays thin — every rule lives
//! in the engine; handlers translate engine errors into status codes.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};

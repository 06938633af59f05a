//! # Connector Sync Engine
//!
//! Interval sync scheduling, OAuth token lifecycle and webhook admission for
//! third-party provider connections. The background services ([`scheduler`],
//! [`token_refresh`], [`sync_executor`]) share one database and coordinate only
//! through row locks and unique indexes, so any number of instances can run.

pub mod auth;
pub mod backoff;
pub mod clock;
pub mod config;
pub mod connectors;
pub mod crypto;
pub mod cursor;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod repositories;
pub mod scheduler;
pub mod server;
pub mod single_flight;
pub mod sync_executor;
pub mod task;
pub mod telemetry;
pub mod token_refresh;
pub mod webhook_verification;
pub use migration;

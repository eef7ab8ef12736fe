//! wgkeeper Daemon Library
//!
//! Subscription lifecycle on top of the provisioning engine:
//! - SQLite storage for servers, users, plans and subscriptions
//! - Periodic reconciliation of subscriptions against wall-clock time
//! - Bounded-wait administrator actions
//! - Purchase fulfilment
//! - Notification delivery through the Telegram Bot API

pub mod admin;
pub mod error;
pub mod notify;
pub mod purchase;
pub mod reconciler;
pub mod storage;
pub mod store;

pub use error::DaemonError;

//! `SQLite` storage for the wgkeeper daemon.
//!
//! Persists servers, users, plans and subscriptions. Only the columns the
//! provisioning and reconciliation paths need are modelled.

mod db;
mod models;
mod queries;
mod queries_subscriptions;

pub use db::{Database, DatabaseError};
pub use models::*;

//! Daemon-level errors.

use wgkeeper_provision::ProvisionError;

use crate::notify::NotifyError;
use crate::storage::DatabaseError;

/// Failure of a lifecycle step that spans storage, provisioning and
/// notification.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("No server has a free client slot")]
    NoCapacity,

    #[error("Plan {0} is not offered")]
    PlanUnavailable(i64),

    #[error("Subscription {id} is {status}")]
    WrongStatus { id: i64, status: String },
}

pub type Result<T> = std::result::Result<T, DaemonError>;

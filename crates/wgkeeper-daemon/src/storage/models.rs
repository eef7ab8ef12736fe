//! Database models for the wgkeeper daemon.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use wgkeeper_provision::{Credentials, HostTarget};

use super::db::DatabaseError;

/// Provisioning target record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Server {
    pub id: i64,
    pub address: String,
    pub port: i64,
    pub ssh_user: String,
    #[serde(skip_serializing)]
    pub ssh_password: Option<String>,
    pub ssh_key_path: Option<String>,
    pub max_clients: i64,
    pub current_clients: i64,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Server {
    /// Whether the server can take another client.
    pub const fn has_capacity(&self) -> bool {
        self.is_active && self.current_clients < self.max_clients
    }

    /// Connection parameters for the provisioning engine. A key file wins
    /// over a password when both are stored.
    pub fn host_target(&self) -> Result<HostTarget, DatabaseError> {
        let port = u16::try_from(self.port).map_err(|_| {
            DatabaseError::InvalidState(format!("server {} has invalid port {}", self.id, self.port))
        })?;
        let credentials = match (&self.ssh_key_path, &self.ssh_password) {
            (Some(path), _) => Credentials::KeyFile(PathBuf::from(path)),
            (None, Some(password)) => Credentials::Password(password.clone()),
            (None, None) => {
                return Err(DatabaseError::InvalidState(format!(
                    "server {} has no credentials",
                    self.id
                )));
            }
        };
        Ok(HostTarget {
            id: self.id,
            address: self.address.clone(),
            port,
            user: self.ssh_user.clone(),
            credentials,
        })
    }
}

/// Parameters for registering a server.
#[derive(Debug, Clone)]
pub struct NewServer {
    pub address: String,
    pub port: u16,
    pub ssh_user: String,
    pub ssh_password: Option<String>,
    pub ssh_key_path: Option<String>,
    pub max_clients: i64,
}

/// Bot user record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub telegram_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub is_admin: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl User {
    /// `@username`, else the full name, else the chat id.
    pub fn display_name(&self) -> String {
        if let Some(username) = self.username.as_deref().filter(|u| !u.is_empty()) {
            return format!("@{username}");
        }
        let full = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if full.is_empty() {
            format!("ID: {}", self.telegram_id)
        } else {
            full
        }
    }
}

/// Subscription plan record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub price: f64,
    pub duration_days: i64,
    pub is_active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Subscription record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub server_id: i64,
    pub plan_id: i64,
    pub start_date: i64,
    pub end_date: i64,
    pub status: String,
    pub config_file_path: Option<String>,
    pub data_usage: i64,
    pub last_connection_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Subscription {
    pub fn status(&self) -> Result<SubscriptionStatus, DatabaseError> {
        self.status.parse()
    }

    pub fn set_status(&mut self, status: SubscriptionStatus) {
        self.status = status.as_str().to_string();
    }

    pub fn end(&self) -> DateTime<Utc> {
        timestamp_to_datetime(self.end_date)
    }

    /// Local artifact path; empty when none was recorded.
    pub fn config_path(&self) -> PathBuf {
        PathBuf::from(self.config_file_path.as_deref().unwrap_or_default())
    }
}

/// Parameters for recording a fulfilled purchase.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: i64,
    pub server_id: i64,
    pub plan_id: i64,
    pub start_date: i64,
    pub end_date: i64,
    pub config_file_path: String,
}

/// Subscription status enum.
///
/// Allowed transitions: `active -> expired | revoked | blocked`,
/// `blocked -> active | revoked`. `expired` and `revoked` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Blocked,
    Revoked,
}

impl SubscriptionStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Blocked => "blocked",
            Self::Revoked => "revoked",
        }
    }

    /// Whether a subscription in `self` may move to `next`. Staying in the
    /// same state is always allowed.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Active | Self::Expired | Self::Revoked | Self::Blocked)
                | (Self::Blocked, Self::Blocked | Self::Active | Self::Revoked)
                | (Self::Expired, Self::Expired)
                | (Self::Revoked, Self::Revoked)
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "blocked" => Ok(Self::Blocked),
            "revoked" => Ok(Self::Revoked),
            other => Err(DatabaseError::InvalidState(format!(
                "unknown subscription status '{other}'"
            ))),
        }
    }
}

/// Unix seconds to UTC; out-of-range values clamp to the epoch.
pub fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

/// `dd.mm.yyyy`, the date format used in user-facing messages.
pub fn format_date(ts: i64) -> String {
    timestamp_to_datetime(ts).format("%d.%m.%Y").to_string()
}

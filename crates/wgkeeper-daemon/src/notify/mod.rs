//! Notification sink.
//!
//! - [`Notifier`], the interface the reconciler and admin actions send through
//! - [`TelegramNotifier`], delivery via the Telegram Bot API
//! - [`LogNotifier`], used when no bot token is configured

pub mod telegram;

use async_trait::async_trait;
use tracing::info;

pub use telegram::TelegramNotifier;

/// Errors that can occur while delivering a notification.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The notifier could not be constructed.
    #[error("Notifier configuration error: {0}")]
    Config(String),

    /// HTTP request to the Bot API failed.
    #[error("Bot API request error: {0}")]
    Request(String),

    /// The Bot API returned a non-success status code.
    #[error("Bot API error (status {status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The Bot API answered 200 but refused the message.
    #[error("Bot API rejected message: {0}")]
    Rejected(String),
}

/// Delivers a text message to a chat destination.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, destination: i64, text: &str) -> Result<(), NotifyError>;
}

/// Logs messages instead of sending them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, destination: i64, text: &str) -> Result<(), NotifyError> {
        info!(destination, text, "Notification (no bot token configured)");
        Ok(())
    }
}

//! Administrator block / unblock / revoke actions.
//!
//! The remote operation runs in its own task and the caller waits a bounded
//! time for it. A timed-out operation is not cancelled; it may still finish
//! on the server after the caller has moved on.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use wgkeeper_provision::{HostTarget, ProvisionError, ProvisioningEngine};

use crate::error::{DaemonError, Result};
use crate::notify::Notifier;
use crate::storage::{Subscription, SubscriptionStatus};
use crate::store::SubscriptionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    Block,
    Unblock,
    Revoke,
}

impl AdminAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Unblock => "unblock",
            Self::Revoke => "revoke",
        }
    }

    /// Statuses the action can start from.
    const fn accepts(self, status: SubscriptionStatus) -> bool {
        matches!(
            (self, status),
            (Self::Block, SubscriptionStatus::Active)
                | (Self::Unblock, SubscriptionStatus::Blocked)
                | (
                    Self::Revoke,
                    SubscriptionStatus::Active | SubscriptionStatus::Blocked
                )
        )
    }

    const fn past_tense(self) -> &'static str {
        match self {
            Self::Block => "blocked",
            Self::Unblock => "unblocked",
            Self::Revoke => "revoked",
        }
    }
}

impl fmt::Display for AdminAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the remote half of an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Completed,
    /// The bounded wait expired; the remote operation may still complete.
    TimedOut,
    /// The remote operation failed; carries the cause.
    Failed(String),
}

/// What an administrator is told after an action.
#[derive(Debug, Clone)]
pub struct ActionReport {
    pub subscription_id: i64,
    pub action: AdminAction,
    pub outcome: ActionOutcome,
    /// Status stored after the action.
    pub status: SubscriptionStatus,
    pub message: String,
}

/// Runs administrator actions against subscriptions.
pub struct AdminActions {
    store: Arc<dyn SubscriptionStore>,
    engine: Arc<ProvisioningEngine>,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
}

impl AdminActions {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        engine: Arc<ProvisioningEngine>,
        notifier: Arc<dyn Notifier>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            notifier,
            timeout,
        }
    }

    pub async fn block(&self, subscription_id: i64) -> Result<ActionReport> {
        self.run(AdminAction::Block, subscription_id).await
    }

    pub async fn unblock(&self, subscription_id: i64) -> Result<ActionReport> {
        self.run(AdminAction::Unblock, subscription_id).await
    }

    pub async fn revoke(&self, subscription_id: i64) -> Result<ActionReport> {
        self.run(AdminAction::Revoke, subscription_id).await
    }

    /// Ask the server whether the subscription's peer is currently blocked.
    pub async fn is_blocked(&self, subscription_id: i64) -> Result<bool> {
        let subscription = self.store.subscription_by_id(subscription_id).await?;
        let host = self
            .store
            .server_by_id(subscription.server_id)
            .await?
            .host_target()?;
        Ok(self
            .engine
            .is_client_blocked(&host, &subscription.config_path())
            .await?)
    }

    /// Run `action`. Errors are returned only for problems found before the
    /// remote operation starts; remote failures are reported in the outcome.
    pub async fn run(&self, action: AdminAction, subscription_id: i64) -> Result<ActionReport> {
        let mut subscription = self.store.subscription_by_id(subscription_id).await?;
        let current = subscription.status()?;
        if !action.accepts(current) {
            return Err(DaemonError::WrongStatus {
                id: subscription_id,
                status: current.to_string(),
            });
        }
        let host = self
            .store
            .server_by_id(subscription.server_id)
            .await?
            .host_target()?;

        info!(subscription_id, %action, server_id = host.id, "Running admin action");
        let outcome = self.remote(action, host, &subscription).await;
        match &outcome {
            ActionOutcome::Completed => info!(subscription_id, %action, "Admin action completed"),
            ActionOutcome::TimedOut => warn!(subscription_id, %action, "Admin action timed out"),
            ActionOutcome::Failed(cause) => {
                warn!(subscription_id, %action, error = %cause, "Admin action failed");
            }
        }

        // Revocation is recorded whatever the server did; block state only
        // changes once the server confirmed it.
        let next = match (action, &outcome) {
            (AdminAction::Revoke, _) => Some(SubscriptionStatus::Revoked),
            (AdminAction::Block, ActionOutcome::Completed) => Some(SubscriptionStatus::Blocked),
            (AdminAction::Unblock, ActionOutcome::Completed) => Some(SubscriptionStatus::Active),
            _ => None,
        };
        let mut save_error = None;
        if let Some(next) = next {
            subscription.set_status(next);
            if let Err(e) = self.store.update_subscription(&subscription).await {
                warn!(subscription_id, error = %e, "Failed to save subscription status");
                save_error = Some(e.to_string());
            }
        }
        let status = if save_error.is_some() {
            current
        } else {
            next.unwrap_or(current)
        };

        if outcome == ActionOutcome::Completed {
            if action == AdminAction::Revoke
                && let Err(e) = self
                    .store
                    .adjust_server_clients(subscription.server_id, -1)
                    .await
            {
                warn!(server_id = subscription.server_id, error = %e, "Failed to update server occupancy");
            }
            if let Err(e) = self.notify_user(action, &subscription).await {
                warn!(user_id = subscription.user_id, error = %e, "Failed to notify user");
            }
        }

        let message = admin_message(
            action,
            subscription_id,
            &outcome,
            save_error.as_deref(),
            self.timeout,
        );
        Ok(ActionReport {
            subscription_id,
            action,
            outcome,
            status,
            message,
        })
    }

    async fn remote(
        &self,
        action: AdminAction,
        host: HostTarget,
        subscription: &Subscription,
    ) -> ActionOutcome {
        let engine = Arc::clone(&self.engine);
        let path = subscription.config_path();
        let task = tokio::spawn(async move {
            match action {
                AdminAction::Block => engine.block_client(&host, &path).await,
                AdminAction::Unblock => engine.unblock_client(&host, &path).await,
                AdminAction::Revoke => engine.revoke_client_config(&host, &path).await,
            }
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(()))) => ActionOutcome::Completed,
            Ok(Ok(Err(e))) => ActionOutcome::Failed(describe(&e)),
            Ok(Err(e)) => ActionOutcome::Failed(format!("task failed: {e}")),
            Err(_) => ActionOutcome::TimedOut,
        }
    }

    async fn notify_user(&self, action: AdminAction, subscription: &Subscription) -> Result<()> {
        let user = self.store.user_by_id(subscription.user_id).await?;
        let plan = self.store.plan_by_id(subscription.plan_id).await?;
        let text = format!(
            "Your subscription #{} ({}) was {} by an administrator.",
            subscription.id,
            plan.name,
            action.past_tense()
        );
        self.notifier.notify(user.telegram_id, &text).await?;
        Ok(())
    }
}

fn describe(e: &ProvisionError) -> String {
    if e.is_connection_error() {
        format!("could not reach the VPN server: {e}")
    } else {
        e.to_string()
    }
}

fn admin_message(
    action: AdminAction,
    subscription_id: i64,
    outcome: &ActionOutcome,
    save_error: Option<&str>,
    timeout: Duration,
) -> String {
    let mut text = match (action, outcome) {
        (_, ActionOutcome::Completed) => {
            format!("Subscription #{subscription_id} {}.", action.past_tense())
        }
        (AdminAction::Revoke, ActionOutcome::Failed(cause)) => format!(
            "Subscription #{subscription_id} marked revoked, but the server did not confirm: {cause}. The peer may still be active."
        ),
        (AdminAction::Revoke, ActionOutcome::TimedOut) => format!(
            "Subscription #{subscription_id} marked revoked. The server did not answer within {}s; the peer may still be removed later or need manual cleanup.",
            timeout.as_secs()
        ),
        (_, ActionOutcome::Failed(cause)) => {
            format!("Failed to {action} subscription #{subscription_id}: {cause}")
        }
        (_, ActionOutcome::TimedOut) => format!(
            "The server did not answer within {}s while trying to {action} subscription #{subscription_id}. The operation may still complete; check again later.",
            timeout.as_secs()
        ),
    };
    if let Some(e) = save_error {
        use std::fmt::Write as _;
        let _ = write!(text, " Saving the new status failed: {e}");
    }
    text
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn actions_accept_only_valid_statuses() {
        use SubscriptionStatus::{Active, Blocked, Expired, Revoked};
        assert!(AdminAction::Block.accepts(Active));
        assert!(!AdminAction::Block.accepts(Blocked));
        assert!(AdminAction::Unblock.accepts(Blocked));
        assert!(!AdminAction::Unblock.accepts(Active));
        assert!(AdminAction::Revoke.accepts(Active));
        assert!(AdminAction::Revoke.accepts(Blocked));
        for terminal in [Expired, Revoked] {
            for action in [AdminAction::Block, AdminAction::Unblock, AdminAction::Revoke] {
                assert!(!action.accepts(terminal), "{action} from {terminal}");
            }
        }
    }

    #[test]
    fn timeout_message_says_operation_may_complete() {
        let text = admin_message(
            AdminAction::Block,
            4,
            &ActionOutcome::TimedOut,
            None,
            Duration::from_secs(10),
        );
        assert!(text.contains("10s"));
        assert!(text.contains("may still complete"));
    }

    #[test]
    fn failure_message_carries_cause() {
        let text = admin_message(
            AdminAction::Unblock,
            4,
            &ActionOutcome::Failed("peer user_1 not found".into()),
            None,
            Duration::from_secs(10),
        );
        assert_eq!(text, "Failed to unblock subscription #4: peer user_1 not found");
    }

    #[test]
    fn revoke_failure_still_reports_revoked() {
        let text = admin_message(
            AdminAction::Revoke,
            4,
            &ActionOutcome::Failed("connection refused".into()),
            Some("disk full"),
            Duration::from_secs(10),
        );
        assert!(text.starts_with("Subscription #4 marked revoked"));
        assert!(text.ends_with("Saving the new status failed: disk full"));
    }
}

//! Subscription lifecycle reconciliation.
//!
//! A sweep loads every `active` subscription and compares its end date with
//! the current time:
//! - ended subscriptions are marked `expired`, their peer is revoked on the
//!   server, the user is told and the server's occupancy drops by one;
//! - subscriptions ending within the warning window get a reminder;
//! - when anything expired, every administrator receives one report.
//!
//! Failures affect only the subscription being processed. A sweep never
//! aborts half-way because one host is down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use wgkeeper_core::config::ReconcilerConfig;
use wgkeeper_provision::ProvisioningEngine;

use crate::error::Result;
use crate::notify::Notifier;
use crate::storage::{Subscription, SubscriptionStatus, format_date};
use crate::store::SubscriptionStore;

/// One subscription expired during a sweep.
#[derive(Debug, Clone)]
pub struct ExpiredSubscription {
    pub subscription: Subscription,
    /// Whether the peer was removed from the server.
    pub revoked: bool,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Active subscriptions examined.
    pub checked: usize,
    pub expired: Vec<ExpiredSubscription>,
    /// Near-expiry warnings delivered.
    pub warnings_sent: usize,
    /// Administrators who received the report.
    pub admins_notified: usize,
    /// Subscriptions left untouched because their status could not be saved.
    pub skipped: usize,
}

impl SweepReport {
    pub fn revoke_failures(&self) -> usize {
        self.expired.iter().filter(|e| !e.revoked).count()
    }
}

/// Clears the busy flag when a sweep ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic subscription reconciler.
pub struct Reconciler {
    store: Arc<dyn SubscriptionStore>,
    engine: Arc<ProvisioningEngine>,
    notifier: Arc<dyn Notifier>,
    config: ReconcilerConfig,
    busy: AtomicBool,
}

/// A started reconciler loop.
pub struct ReconcilerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Stop ticking and wait for an in-flight sweep to drain.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Reconciler task ended abnormally");
        }
    }
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        engine: Arc<ProvisioningEngine>,
        notifier: Arc<dyn Notifier>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            engine,
            notifier,
            config,
            busy: AtomicBool::new(false),
        }
    }

    /// Start the loop with its own stop signal.
    pub fn start(self: Arc<Self>) -> ReconcilerHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = self.spawn(rx);
        ReconcilerHandle { shutdown, task }
    }

    /// Spawn the loop: one sweep immediately, then one per interval, until
    /// `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.config.interval_secs.max(1));
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                interval_secs = period.as_secs(),
                "Subscription reconciler started"
            );

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = timer.tick() => {
                        self.sweep().await;
                    }
                }
            }

            info!("Subscription reconciler stopped");
        })
    }

    /// Run one sweep now. Returns `None` when another sweep is in progress.
    pub async fn sweep(&self) -> Option<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep as of `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Option<SweepReport> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sweep already running; skipping");
            return None;
        }
        let _guard = BusyGuard(&self.busy);

        info!("Checking subscriptions");
        let mut report = SweepReport::default();

        let subscriptions = match self.store.active_subscriptions().await {
            Ok(subs) => subs,
            Err(e) => {
                error!(error = %e, "Failed to load active subscriptions");
                return Some(report);
            }
        };
        report.checked = subscriptions.len();

        for subscription in subscriptions {
            if now.timestamp() >= subscription.end_date {
                if let Some(expired) = self.expire(subscription).await {
                    report.expired.push(expired);
                } else {
                    report.skipped += 1;
                }
            } else {
                let days_left = (subscription.end() - now).num_days();
                if (0..=self.config.warning_days).contains(&days_left)
                    && self.warn_user(&subscription, days_left).await
                {
                    report.warnings_sent += 1;
                }
            }
        }

        if !report.expired.is_empty() {
            report.admins_notified = self.report_to_admins(&report.expired).await;
        }

        info!(
            checked = report.checked,
            expired = report.expired.len(),
            revoke_failures = report.revoke_failures(),
            warnings = report.warnings_sent,
            skipped = report.skipped,
            "Subscription check complete"
        );
        Some(report)
    }

    /// Expire one subscription. `None` when its new status could not be saved.
    async fn expire(&self, mut subscription: Subscription) -> Option<ExpiredSubscription> {
        info!(
            subscription_id = subscription.id,
            user_id = subscription.user_id,
            end = %format_date(subscription.end_date),
            "Subscription expired"
        );

        subscription.set_status(SubscriptionStatus::Expired);
        if let Err(e) = self.store.update_subscription(&subscription).await {
            warn!(subscription_id = subscription.id, error = %e, "Failed to mark subscription expired");
            return None;
        }

        let revoked = match self.revoke(&subscription).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    subscription_id = subscription.id,
                    server_id = subscription.server_id,
                    error = %e,
                    "Failed to revoke VPN peer"
                );
                false
            }
        };

        if revoked {
            if let Err(e) = self.notify_expired(&subscription).await {
                warn!(user_id = subscription.user_id, error = %e, "Failed to notify user of expiry");
            }
            if let Err(e) = self
                .store
                .adjust_server_clients(subscription.server_id, -1)
                .await
            {
                warn!(server_id = subscription.server_id, error = %e, "Failed to update server occupancy");
            }
        }

        Some(ExpiredSubscription {
            subscription,
            revoked,
        })
    }

    async fn revoke(&self, subscription: &Subscription) -> Result<()> {
        let server = self.store.server_by_id(subscription.server_id).await?;
        let host = server.host_target()?;
        self.engine
            .revoke_client_config(&host, &subscription.config_path())
            .await?;
        Ok(())
    }

    async fn notify_expired(&self, subscription: &Subscription) -> Result<()> {
        let user = self.store.user_by_id(subscription.user_id).await?;
        let plan = self.store.plan_by_id(subscription.plan_id).await?;
        let text = expired_message(subscription, &plan.name);
        self.notifier.notify(user.telegram_id, &text).await?;
        Ok(())
    }

    async fn send_warning(&self, subscription: &Subscription, days_left: i64) -> Result<()> {
        let user = self.store.user_by_id(subscription.user_id).await?;
        let plan = self.store.plan_by_id(subscription.plan_id).await?;
        let text = warning_message(subscription, &plan.name, days_left);
        self.notifier.notify(user.telegram_id, &text).await?;
        Ok(())
    }

    /// Returns whether the warning was delivered.
    async fn warn_user(&self, subscription: &Subscription, days_left: i64) -> bool {
        match self.send_warning(subscription, days_left).await {
            Ok(()) => {
                debug!(subscription_id = subscription.id, days_left, "Expiry warning sent");
                true
            }
            Err(e) => {
                warn!(subscription_id = subscription.id, error = %e, "Failed to send expiry warning");
                false
            }
        }
    }

    /// Send the aggregated report; returns how many admins received it.
    async fn report_to_admins(&self, expired: &[ExpiredSubscription]) -> usize {
        let admins = match self.store.admins().await {
            Ok(admins) => admins,
            Err(e) => {
                error!(error = %e, "Failed to load administrators");
                return 0;
            }
        };
        if admins.is_empty() {
            info!("No administrators to report to");
            return 0;
        }

        let mut lines = Vec::with_capacity(expired.len());
        for entry in expired {
            let sub = &entry.subscription;
            let user = match self.store.user_by_id(sub.user_id).await {
                Ok(user) => user,
                Err(e) => {
                    warn!(user_id = sub.user_id, error = %e, "Report line skipped");
                    continue;
                }
            };
            let plan = match self.store.plan_by_id(sub.plan_id).await {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(plan_id = sub.plan_id, error = %e, "Report line skipped");
                    continue;
                }
            };
            lines.push(ReportLine {
                subscription_id: sub.id,
                user: user.display_name(),
                plan: plan.name,
                end_date: sub.end_date,
                revoked: entry.revoked,
            });
        }
        let text = admin_report(expired.len(), &lines);

        let mut delivered = 0;
        for admin in &admins {
            match self.notifier.notify(admin.telegram_id, &text).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(admin = admin.telegram_id, error = %e, "Failed to send report to administrator");
                }
            }
        }
        delivered
    }
}

/// One resolved line of the administrator report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLine {
    pub subscription_id: i64,
    pub user: String,
    pub plan: String,
    pub end_date: i64,
    pub revoked: bool,
}

pub fn expired_message(subscription: &Subscription, plan: &str) -> String {
    format!(
        "Your subscription has expired.\n\n\
         Subscription: #{}\n\
         Plan: {plan}\n\
         Started: {}\n\
         Ended: {}\n\n\
         Your VPN access has been disabled. Use /buy to get a new subscription.",
        subscription.id,
        format_date(subscription.start_date),
        format_date(subscription.end_date),
    )
}

pub fn warning_message(subscription: &Subscription, plan: &str, days_left: i64) -> String {
    format!(
        "Your subscription ends soon.\n\n\
         Subscription: #{}\n\
         Plan: {plan}\n\
         Ends: {}\n\
         Days left: {days_left}\n\n\
         Use /buy to renew. VPN access is disabled automatically when the subscription ends.",
        subscription.id,
        format_date(subscription.end_date),
    )
}

/// Administrator report for `total` expired subscriptions, of which `lines`
/// could be resolved.
pub fn admin_report(total: usize, lines: &[ReportLine]) -> String {
    use std::fmt::Write;

    let mut text = format!("Expired subscriptions report\n\nProcessed: {total}\n");
    for (i, line) in lines.iter().enumerate() {
        let _ = write!(
            text,
            "\n{}. Subscription #{} - user: {} - plan: {} - ended: {}",
            i + 1,
            line.subscription_id,
            line.user,
            line.plan,
            format_date(line.end_date),
        );
        if !line.revoked {
            text.push_str(" - REVOKE FAILED, peer still on server");
        }
    }
    let failures = lines.iter().filter(|l| !l.revoked).count();
    if failures == 0 {
        text.push_str("\n\nAll listed subscriptions were marked expired and their VPN peers revoked.");
    } else {
        let _ = write!(
            text,
            "\n\nAll listed subscriptions were marked expired. {failures} peer(s) could not be revoked and need attention."
        );
    }
    text
}

//! Purchase fulfilment: provision first, persist second.
//!
//! A subscription row is written only once the client configuration file
//! exists locally. If saving fails afterwards the new peer is removed again
//! so the server does not carry an unpaid-for client.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tracing::{error, info, warn};
use wgkeeper_provision::ProvisioningEngine;

use crate::error::{DaemonError, Result};
use crate::storage::{Database, NewSubscription, Subscription};

/// Peer name used for a user's client configuration.
pub fn client_name(user_id: i64) -> String {
    format!("user_{user_id}")
}

pub struct Fulfilment {
    db: Database,
    engine: Arc<ProvisioningEngine>,
}

impl Fulfilment {
    pub const fn new(db: Database, engine: Arc<ProvisioningEngine>) -> Self {
        Self { db, engine }
    }

    /// Give `user_id` a new subscription on `plan_id`.
    ///
    /// Picks the first active server with a free slot, makes sure it is set
    /// up, adds a peer for the user, then records the subscription and bumps
    /// the server's occupancy.
    pub async fn fulfil(&self, user_id: i64, plan_id: i64) -> Result<Subscription> {
        let plan = self.db.get_plan(plan_id).await?;
        if !plan.is_active {
            return Err(DaemonError::PlanUnavailable(plan_id));
        }
        let user = self.db.get_user(user_id).await?;
        let server = self
            .db
            .first_available_server()
            .await?
            .ok_or(DaemonError::NoCapacity)?;
        let host = server.host_target()?;

        let start = Utc::now();
        let end = TimeDelta::try_days(plan.duration_days)
            .and_then(|d| start.checked_add_signed(d))
            .ok_or(DaemonError::PlanUnavailable(plan_id))?;

        info!(user_id = user.id, plan = %plan.name, server_id = server.id, "Fulfilling purchase");

        self.engine.setup_server(&host).await?;
        let artifact = self
            .engine
            .create_client_config(&host, &client_name(user.id))
            .await?;

        let record = NewSubscription {
            user_id: user.id,
            server_id: server.id,
            plan_id: plan.id,
            start_date: start.timestamp(),
            end_date: end.timestamp(),
            config_file_path: artifact.to_string_lossy().into_owned(),
        };

        let subscription = match self.db.insert_subscription(&record).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(user_id = user.id, error = %e, "Failed to save subscription; removing new peer");
                if let Err(cleanup) = self.engine.revoke_client_config(&host, &artifact).await {
                    warn!(server_id = server.id, error = %cleanup, "Failed to remove orphaned peer");
                }
                return Err(e.into());
            }
        };

        if let Err(e) = self.db.adjust_server_clients(server.id, 1).await {
            warn!(server_id = server.id, error = %e, "Failed to update server occupancy");
        }

        info!(
            subscription_id = subscription.id,
            path = %artifact.display(),
            "Subscription created"
        );
        Ok(subscription)
    }
}

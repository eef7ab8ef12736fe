//! Subscription queries.

use super::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{NewSubscription, Subscription, SubscriptionStatus};

impl Database {
    /// Record an `active` subscription.
    pub async fn insert_subscription(
        &self,
        subscription: &NewSubscription,
    ) -> Result<Subscription, DatabaseError> {
        let now = unix_timestamp();

        let id = sqlx::query(
            r"
            INSERT INTO subscriptions (user_id, server_id, plan_id, start_date, end_date,
                                       status, config_file_path, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(subscription.user_id)
        .bind(subscription.server_id)
        .bind(subscription.plan_id)
        .bind(subscription.start_date)
        .bind(subscription.end_date)
        .bind(SubscriptionStatus::Active.as_str())
        .bind(&subscription.config_file_path)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        self.get_subscription(id).await
    }

    /// Get a subscription by ID.
    pub async fn get_subscription(&self, id: i64) -> Result<Subscription, DatabaseError> {
        sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Subscription {id}")))
    }

    /// All subscriptions currently in `active` status.
    pub async fn list_active_subscriptions(&self) -> Result<Vec<Subscription>, DatabaseError> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE status = 'active' ORDER BY end_date, id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(subscriptions)
    }

    /// A user's subscriptions, newest first.
    pub async fn list_user_subscriptions(
        &self,
        user_id: i64,
    ) -> Result<Vec<Subscription>, DatabaseError> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE user_id = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(subscriptions)
    }

    /// Persist status and usage telemetry.
    ///
    /// The write only applies while the stored status may still move to the
    /// new one, so an `expired` or `revoked` subscription can never become
    /// `active` again, even when another writer got there first.
    pub async fn update_subscription(
        &self,
        subscription: &Subscription,
    ) -> Result<(), DatabaseError> {
        use SubscriptionStatus::{Active, Blocked, Expired, Revoked};

        let next = subscription.status()?;
        let from: Vec<SubscriptionStatus> = [Active, Blocked, Expired, Revoked]
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect();
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            "UPDATE subscriptions \
             SET status = ?, data_usage = ?, last_connection_at = ?, updated_at = ? \
             WHERE id = ? AND status IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql)
            .bind(next.as_str())
            .bind(subscription.data_usage)
            .bind(subscription.last_connection_at)
            .bind(unix_timestamp())
            .bind(subscription.id);
        for status in &from {
            query = query.bind(status.as_str());
        }
        let result = query.execute(self.pool()).await?;

        if result.rows_affected() == 0 {
            let current = self.get_subscription(subscription.id).await?.status()?;
            return Err(DatabaseError::InvalidState(format!(
                "subscription {} cannot move from {current} to {next}",
                subscription.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::NewServer;

    async fn seeded() -> (Database, NewSubscription) {
        let db = Database::open_in_memory().await.unwrap();
        let server = db
            .insert_server(&NewServer {
                address: "198.51.100.4".into(),
                port: 22,
                ssh_user: "root".into(),
                ssh_password: Some("secret".into()),
                ssh_key_path: None,
                max_clients: 5,
            })
            .await
            .unwrap();
        let user = db.upsert_user(10, Some("u"), None, None).await.unwrap();
        let plan = db.insert_plan("Week", "", 50.0, 7).await.unwrap();
        let new = NewSubscription {
            user_id: user.id,
            server_id: server.id,
            plan_id: plan.id,
            start_date: 1_000,
            end_date: 2_000,
            config_file_path: "vpn_configs/user_1.conf".into(),
        };
        (db, new)
    }

    #[tokio::test]
    async fn inserted_subscription_is_active() {
        let (db, new) = seeded().await;
        let sub = db.insert_subscription(&new).await.unwrap();
        assert_eq!(sub.status().unwrap(), SubscriptionStatus::Active);
        assert_eq!(db.list_active_subscriptions().await.unwrap().len(), 1);
        assert_eq!(db.list_user_subscriptions(new.user_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expiring_removes_from_active_list() {
        let (db, new) = seeded().await;
        let mut sub = db.insert_subscription(&new).await.unwrap();
        sub.set_status(SubscriptionStatus::Expired);
        db.update_subscription(&sub).await.unwrap();
        assert!(db.list_active_subscriptions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_status_cannot_be_reactivated() {
        let (db, new) = seeded().await;
        let mut sub = db.insert_subscription(&new).await.unwrap();
        sub.set_status(SubscriptionStatus::Revoked);
        db.update_subscription(&sub).await.unwrap();

        sub.set_status(SubscriptionStatus::Active);
        let err = db.update_subscription(&sub).await.unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidState(_)));
        assert_eq!(
            db.get_subscription(sub.id).await.unwrap().status().unwrap(),
            SubscriptionStatus::Revoked
        );
    }

    #[tokio::test]
    async fn stale_copy_cannot_overwrite_newer_status() {
        let (db, new) = seeded().await;
        let mut fresh = db.insert_subscription(&new).await.unwrap();
        let mut stale = fresh.clone();

        fresh.set_status(SubscriptionStatus::Blocked);
        db.update_subscription(&fresh).await.unwrap();

        stale.set_status(SubscriptionStatus::Expired);
        stale.data_usage = 99;
        let err = db.update_subscription(&stale).await.unwrap_err();

        assert!(matches!(
            err,
            DatabaseError::InvalidState(ref m) if m.contains("from blocked to expired")
        ));
        let stored = db.get_subscription(fresh.id).await.unwrap();
        assert_eq!(stored.status().unwrap(), SubscriptionStatus::Blocked);
        assert_eq!(stored.data_usage, 0);
    }

    #[tokio::test]
    async fn block_and_unblock_round_trip() {
        let (db, new) = seeded().await;
        let mut sub = db.insert_subscription(&new).await.unwrap();
        sub.set_status(SubscriptionStatus::Blocked);
        db.update_subscription(&sub).await.unwrap();
        sub.set_status(SubscriptionStatus::Active);
        db.update_subscription(&sub).await.unwrap();
        assert_eq!(
            db.get_subscription(sub.id).await.unwrap().status().unwrap(),
            SubscriptionStatus::Active
        );
    }

    #[tokio::test]
    async fn telemetry_is_persisted() {
        let (db, new) = seeded().await;
        let mut sub = db.insert_subscription(&new).await.unwrap();
        sub.data_usage = 4096;
        sub.last_connection_at = Some(1_500);
        db.update_subscription(&sub).await.unwrap();
        let stored = db.get_subscription(sub.id).await.unwrap();
        assert_eq!(stored.data_usage, 4096);
        assert_eq!(stored.last_connection_at, Some(1_500));
    }
}

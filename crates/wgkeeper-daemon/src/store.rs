//! Persistence interface consumed by the reconciler and admin actions.

use async_trait::async_trait;

use crate::storage::{Database, DatabaseError, Plan, Server, Subscription, User};

/// The subset of storage the subscription lifecycle depends on. Lookups fail
/// with [`DatabaseError::NotFound`] for unknown ids.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn active_subscriptions(&self) -> Result<Vec<Subscription>, DatabaseError>;

    async fn subscription_by_id(&self, id: i64) -> Result<Subscription, DatabaseError>;

    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), DatabaseError>;

    async fn server_by_id(&self, id: i64) -> Result<Server, DatabaseError>;

    async fn user_by_id(&self, id: i64) -> Result<User, DatabaseError>;

    async fn plan_by_id(&self, id: i64) -> Result<Plan, DatabaseError>;

    async fn admins(&self) -> Result<Vec<User>, DatabaseError>;

    /// Add `delta` to a server's occupancy.
    async fn adjust_server_clients(&self, server_id: i64, delta: i64) -> Result<(), DatabaseError>;
}

#[async_trait]
impl SubscriptionStore for Database {
    async fn active_subscriptions(&self) -> Result<Vec<Subscription>, DatabaseError> {
        self.list_active_subscriptions().await
    }

    async fn subscription_by_id(&self, id: i64) -> Result<Subscription, DatabaseError> {
        self.get_subscription(id).await
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<(), DatabaseError> {
        Self::update_subscription(self, subscription).await
    }

    async fn server_by_id(&self, id: i64) -> Result<Server, DatabaseError> {
        self.get_server(id).await
    }

    async fn user_by_id(&self, id: i64) -> Result<User, DatabaseError> {
        self.get_user(id).await
    }

    async fn plan_by_id(&self, id: i64) -> Result<Plan, DatabaseError> {
        self.get_plan(id).await
    }

    async fn admins(&self) -> Result<Vec<User>, DatabaseError> {
        self.list_admins().await
    }

    async fn adjust_server_clients(&self, server_id: i64, delta: i64) -> Result<(), DatabaseError> {
        Self::adjust_server_clients(self, server_id, delta).await
    }
}

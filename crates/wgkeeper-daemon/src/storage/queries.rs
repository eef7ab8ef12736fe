//! Server, user and plan queries.

use super::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{NewServer, Plan, Server, User};

impl Database {
    // =========================================================================
    // Server queries
    // =========================================================================

    /// Register a provisioning target.
    pub async fn insert_server(&self, server: &NewServer) -> Result<Server, DatabaseError> {
        if server.ssh_password.is_none() && server.ssh_key_path.is_none() {
            return Err(DatabaseError::InvalidState(
                "a server needs a password or a key file".into(),
            ));
        }
        let now = unix_timestamp();

        let id = sqlx::query(
            r"
            INSERT INTO servers (address, port, ssh_user, ssh_password, ssh_key_path,
                                 max_clients, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&server.address)
        .bind(i64::from(server.port))
        .bind(&server.ssh_user)
        .bind(&server.ssh_password)
        .bind(&server.ssh_key_path)
        .bind(server.max_clients)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        self.get_server(id).await
    }

    /// Get a server by ID.
    pub async fn get_server(&self, id: i64) -> Result<Server, DatabaseError> {
        sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Server {id}")))
    }

    /// List all servers, oldest first.
    pub async fn list_servers(&self) -> Result<Vec<Server>, DatabaseError> {
        let servers = sqlx::query_as::<_, Server>("SELECT * FROM servers ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        Ok(servers)
    }

    /// First active server with a free client slot.
    pub async fn first_available_server(&self) -> Result<Option<Server>, DatabaseError> {
        let server = sqlx::query_as::<_, Server>(
            "SELECT * FROM servers WHERE is_active = 1 AND current_clients < max_clients ORDER BY id LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;
        Ok(server)
    }

    /// Enable or disable a server for new purchases.
    pub async fn set_server_active(&self, id: i64, active: bool) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE servers SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Server {id}")));
        }
        Ok(())
    }

    /// Add `delta` to the server's occupancy, never going below zero.
    pub async fn adjust_server_clients(&self, id: i64, delta: i64) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE servers SET current_clients = MAX(0, current_clients + ?), updated_at = ? WHERE id = ?",
        )
        .bind(delta)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Server {id}")));
        }
        Ok(())
    }

    // =========================================================================
    // User queries
    // =========================================================================

    /// Create a user, or refresh the profile of an existing chat id.
    pub async fn upsert_user(
        &self,
        telegram_id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> Result<User, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO users (telegram_id, username, first_name, last_name, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(telegram_id) DO UPDATE SET
                username = excluded.username,
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                updated_at = excluded.updated_at
            ",
        )
        .bind(telegram_id)
        .bind(username)
        .bind(first_name)
        .bind(last_name)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_user_by_telegram_id(telegram_id).await
    }

    /// Get a user by ID.
    pub async fn get_user(&self, id: i64) -> Result<User, DatabaseError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("User {id}")))
    }

    /// Get a user by chat id.
    pub async fn get_user_by_telegram_id(&self, telegram_id: i64) -> Result<User, DatabaseError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE telegram_id = ?")
            .bind(telegram_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("User with chat id {telegram_id}")))
    }

    /// Grant or drop administrator rights.
    pub async fn set_user_admin(&self, id: i64, is_admin: bool) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE users SET is_admin = ?, updated_at = ? WHERE id = ?")
            .bind(is_admin)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("User {id}")));
        }
        Ok(())
    }

    /// All administrators.
    pub async fn list_admins(&self) -> Result<Vec<User>, DatabaseError> {
        let admins = sqlx::query_as::<_, User>("SELECT * FROM users WHERE is_admin = 1 ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        Ok(admins)
    }

    // =========================================================================
    // Plan queries
    // =========================================================================

    /// Create a subscription plan.
    pub async fn insert_plan(
        &self,
        name: &str,
        description: &str,
        price: f64,
        duration_days: i64,
    ) -> Result<Plan, DatabaseError> {
        if duration_days <= 0 {
            return Err(DatabaseError::InvalidState(format!(
                "plan duration must be positive (got {duration_days})"
            )));
        }
        let now = unix_timestamp();

        let id = sqlx::query(
            r"
            INSERT INTO subscription_plans (name, description, price, duration_days, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(name)
        .bind(description)
        .bind(price)
        .bind(duration_days)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        self.get_plan(id).await
    }

    /// Get a plan by ID.
    pub async fn get_plan(&self, id: i64) -> Result<Plan, DatabaseError> {
        sqlx::query_as::<_, Plan>("SELECT * FROM subscription_plans WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Plan {id}")))
    }

    /// Plans offered for purchase.
    pub async fn list_active_plans(&self) -> Result<Vec<Plan>, DatabaseError> {
        let plans = sqlx::query_as::<_, Plan>(
            "SELECT * FROM subscription_plans WHERE is_active = 1 ORDER BY price, id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(plans)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn new_server(max_clients: i64) -> NewServer {
        NewServer {
            address: "198.51.100.4".into(),
            port: 22,
            ssh_user: "root".into(),
            ssh_password: Some("secret".into()),
            ssh_key_path: None,
            max_clients,
        }
    }

    #[tokio::test]
    async fn server_round_trip_and_lookup_miss() {
        let db = Database::open_in_memory().await.unwrap();
        let server = db.insert_server(&new_server(5)).await.unwrap();
        assert_eq!(server.port, 22);
        assert_eq!(server.current_clients, 0);
        assert!(server.is_active);

        let err = db.get_server(999).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }

    #[tokio::test]
    async fn server_without_credentials_is_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        let mut server = new_server(5);
        server.ssh_password = None;
        assert!(matches!(
            db.insert_server(&server).await,
            Err(DatabaseError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn occupancy_never_goes_negative() {
        let db = Database::open_in_memory().await.unwrap();
        let server = db.insert_server(&new_server(5)).await.unwrap();
        db.adjust_server_clients(server.id, 2).await.unwrap();
        db.adjust_server_clients(server.id, -5).await.unwrap();
        assert_eq!(db.get_server(server.id).await.unwrap().current_clients, 0);
        assert!(db.adjust_server_clients(999, 1).await.is_err());
    }

    #[tokio::test]
    async fn first_available_skips_full_and_inactive() {
        let db = Database::open_in_memory().await.unwrap();
        let full = db.insert_server(&new_server(1)).await.unwrap();
        db.adjust_server_clients(full.id, 1).await.unwrap();
        let inactive = db.insert_server(&new_server(3)).await.unwrap();
        db.set_server_active(inactive.id, false).await.unwrap();
        assert!(db.first_available_server().await.unwrap().is_none());

        let open = db.insert_server(&new_server(3)).await.unwrap();
        let picked = db.first_available_server().await.unwrap().unwrap();
        assert_eq!(picked.id, open.id);

        let listed: Vec<_> = db
            .list_servers()
            .await
            .unwrap()
            .into_iter()
            .map(|s| (s.id, s.has_capacity()))
            .collect();
        assert_eq!(listed, vec![(full.id, false), (inactive.id, false), (open.id, true)]);
    }

    #[tokio::test]
    async fn upsert_user_refreshes_profile() {
        let db = Database::open_in_memory().await.unwrap();
        let first = db.upsert_user(100, Some("old"), None, None).await.unwrap();
        let second = db.upsert_user(100, Some("new"), Some("N"), None).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.username.as_deref(), Some("new"));
        assert!(!second.is_admin);
    }

    #[tokio::test]
    async fn admins_are_listed() {
        let db = Database::open_in_memory().await.unwrap();
        let a = db.upsert_user(1, Some("a"), None, None).await.unwrap();
        db.upsert_user(2, Some("b"), None, None).await.unwrap();
        db.set_user_admin(a.id, true).await.unwrap();

        let admins = db.list_admins().await.unwrap();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].telegram_id, 1);
    }

    #[tokio::test]
    async fn plans_require_positive_duration() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(db.insert_plan("broken", "", 1.0, 0).await.is_err());

        let plan = db.insert_plan("Month", "30 days", 199.0, 30).await.unwrap();
        assert_eq!(db.get_plan(plan.id).await.unwrap().duration_days, 30);
        assert_eq!(db.list_active_plans().await.unwrap().len(), 1);
    }
}

//! Shared fixtures: in-memory database, fake remote host and a notifier that
//! records what it was asked to send.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use wgkeeper_core::config::{ProvisioningConfig, ReconcilerConfig};
use wgkeeper_daemon::admin::AdminActions;
use wgkeeper_daemon::notify::{Notifier, NotifyError};
use wgkeeper_daemon::purchase::{Fulfilment, client_name};
use wgkeeper_daemon::reconciler::Reconciler;
use wgkeeper_daemon::storage::{Database, NewServer, NewSubscription, Plan, Server, Subscription, User};
use wgkeeper_provision::testing::FakeHost;
use wgkeeper_provision::{HostTarget, ProvisioningEngine};

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(i64, String)>>,
    unreachable: Mutex<HashSet<i64>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, destination: i64) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(d, _)| *d == destination)
            .map(|(_, text)| text)
            .collect()
    }

    /// Make deliveries to `destination` fail.
    pub fn fail_for(&self, destination: i64) {
        self.unreachable.lock().unwrap().insert(destination);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, destination: i64, text: &str) -> Result<(), NotifyError> {
        if self.unreachable.lock().unwrap().contains(&destination) {
            return Err(NotifyError::Rejected("chat not found".into()));
        }
        self.sent.lock().unwrap().push((destination, text.to_string()));
        Ok(())
    }
}

pub struct Fixture {
    pub db: Database,
    pub fake: FakeHost,
    pub engine: Arc<ProvisioningEngine>,
    pub notifier: Arc<RecordingNotifier>,
    pub server: Server,
    pub user: User,
    pub admin: User,
    pub plan: Plan,
    pub artifacts: TempDir,
}

pub const USER_CHAT: i64 = 1001;
pub const ADMIN_CHAT: i64 = 9001;

impl Fixture {
    /// A provisioned host, one server, one user, one admin and one plan.
    pub async fn new() -> Self {
        Self::with_host(FakeHost::provisioned(), 10).await
    }

    pub async fn with_host(fake: FakeHost, max_clients: i64) -> Self {
        let db = Database::open_in_memory().await.unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let config = ProvisioningConfig {
            artifact_dir: artifacts.path().to_path_buf(),
            ..ProvisioningConfig::default()
        };
        let engine = Arc::new(ProvisioningEngine::new(Arc::new(fake.clone()), config));

        let server = db
            .insert_server(&NewServer {
                address: "198.51.100.20".into(),
                port: 22,
                ssh_user: "root".into(),
                ssh_password: Some("secret".into()),
                ssh_key_path: None,
                max_clients,
            })
            .await
            .unwrap();
        let user = db
            .upsert_user(USER_CHAT, Some("alice"), Some("Alice"), None)
            .await
            .unwrap();
        let admin = db
            .upsert_user(ADMIN_CHAT, Some("boss"), None, None)
            .await
            .unwrap();
        db.set_user_admin(admin.id, true).await.unwrap();
        let plan = db.insert_plan("Month", "30 days", 199.0, 30).await.unwrap();

        Self {
            db,
            fake,
            engine,
            notifier: Arc::new(RecordingNotifier::default()),
            server,
            user,
            admin,
            plan,
            artifacts,
        }
    }

    pub fn host(&self) -> HostTarget {
        self.server.host_target().unwrap()
    }

    /// Provision a peer for the fixture user and record a subscription
    /// ending at `end`.
    pub async fn subscription_ending(&self, end: DateTime<Utc>) -> Subscription {
        let path = self
            .engine
            .create_client_config(&self.host(), &client_name(self.user.id))
            .await
            .unwrap();
        let subscription = self
            .db
            .insert_subscription(&NewSubscription {
                user_id: self.user.id,
                server_id: self.server.id,
                plan_id: self.plan.id,
                start_date: (end - chrono::TimeDelta::days(30)).timestamp(),
                end_date: end.timestamp(),
                config_file_path: path.to_string_lossy().into_owned(),
            })
            .await
            .unwrap();
        self.db.adjust_server_clients(self.server.id, 1).await.unwrap();
        subscription
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        self.reconciler_with(ReconcilerConfig::default())
    }

    pub fn reconciler_with(&self, config: ReconcilerConfig) -> Arc<Reconciler> {
        Arc::new(Reconciler::new(
            Arc::new(self.db.clone()),
            Arc::clone(&self.engine),
            self.notifier.clone(),
            config,
        ))
    }

    pub fn admin_actions(&self, timeout: Duration) -> AdminActions {
        AdminActions::new(
            Arc::new(self.db.clone()),
            Arc::clone(&self.engine),
            self.notifier.clone(),
            timeout,
        )
    }

    pub fn fulfilment(&self) -> Fulfilment {
        Fulfilment::new(self.db.clone(), Arc::clone(&self.engine))
    }

    pub async fn occupancy(&self) -> i64 {
        self.db.get_server(self.server.id).await.unwrap().current_clients
    }

    pub fn registry(&self) -> String {
        self.fake.registry().unwrap_or_default()
    }
}

#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

mod common;

use common::Fixture;
use wgkeeper_daemon::DaemonError;
use wgkeeper_daemon::purchase::client_name;
use wgkeeper_daemon::storage::SubscriptionStatus;
use wgkeeper_provision::registry;
use wgkeeper_provision::testing::{ConnectFailure, FakeHost};

#[tokio::test]
async fn purchase_on_fresh_host_sets_up_and_provisions() {
    let f = Fixture::with_host(FakeHost::new(), 10).await;

    let sub = f.fulfilment().fulfil(f.user.id, f.plan.id).await.unwrap();

    assert!(f.fake.wireguard_installed());
    assert_eq!(sub.status().unwrap(), SubscriptionStatus::Active);
    assert_eq!(sub.server_id, f.server.id);
    assert_eq!(sub.end_date - sub.start_date, 30 * 24 * 60 * 60);

    let artifact = std::fs::read_to_string(sub.config_path()).unwrap();
    assert!(artifact.contains("Endpoint = 203.0.113.10:51820"));
    assert!(registry::contains_peer(&f.registry(), &client_name(f.user.id)));
    assert_eq!(f.occupancy().await, 1);
}

#[tokio::test]
async fn second_purchase_gets_a_distinct_peer() {
    let f = Fixture::new().await;
    let fulfilment = f.fulfilment();

    let first = fulfilment.fulfil(f.user.id, f.plan.id).await.unwrap();
    let second = fulfilment.fulfil(f.user.id, f.plan.id).await.unwrap();

    assert_ne!(first.config_path(), second.config_path());
    let stem = second.config_path().file_stem().unwrap().to_string_lossy().into_owned();
    assert_eq!(stem, format!("{}-2", client_name(f.user.id)));
    assert_eq!(f.occupancy().await, 2);
    assert_eq!(f.db.list_user_subscriptions(f.user.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn full_servers_are_refused() {
    let f = Fixture::with_host(FakeHost::provisioned(), 1).await;
    let fulfilment = f.fulfilment();
    fulfilment.fulfil(f.user.id, f.plan.id).await.unwrap();

    let err = fulfilment.fulfil(f.user.id, f.plan.id).await.unwrap_err();

    assert!(matches!(err, DaemonError::NoCapacity));
    assert_eq!(f.occupancy().await, 1);
}

#[tokio::test]
async fn inactive_servers_are_not_used() {
    let f = Fixture::new().await;
    f.db.set_server_active(f.server.id, false).await.unwrap();

    let err = f.fulfilment().fulfil(f.user.id, f.plan.id).await.unwrap_err();

    assert!(matches!(err, DaemonError::NoCapacity));
    assert_eq!(f.fake.connects(), 0);
}

#[tokio::test]
async fn provisioning_failure_records_nothing() {
    let f = Fixture::new().await;
    let _ = f.fake.clone().refuse(ConnectFailure::AuthFailed);

    let err = f.fulfilment().fulfil(f.user.id, f.plan.id).await.unwrap_err();

    assert!(matches!(err, DaemonError::Provision(_)));
    assert!(f.db.list_user_subscriptions(f.user.id).await.unwrap().is_empty());
    assert_eq!(f.occupancy().await, 0);
}

#[tokio::test]
async fn unknown_plan_is_rejected_before_touching_servers() {
    let f = Fixture::new().await;

    let err = f.fulfilment().fulfil(f.user.id, 999).await.unwrap_err();

    assert!(matches!(err, DaemonError::Database(_)));
    assert_eq!(f.fake.connects(), 0);
}

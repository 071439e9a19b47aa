use super::*;
use crate::fakes::{descriptor, FakeKeyService, Harness};
use chrono::Utc;
use shared::{
    domain::{ContactAddress, DeviceOrdinal, Platform, SessionRecord},
    error::RemoteError,
};

const ALICE_SESSION: &str = "6f1c2a3e-9b4d-4e5f-8a7b-1c2d3e4f5a6b";

async fn seed_alice(harness: &Harness) {
    harness
        .storage
        .upsert_session(&SessionRecord {
            contact: ContactAddress::new("alice"),
            device: DeviceOrdinal::PRIMARY,
            cipher_state: b"alice".to_vec(),
            last_updated: Utc::now(),
        })
        .await
        .expect("seed");
}

#[tokio::test]
async fn spawned_worker_provisions_then_synchronizes() {
    let harness = Harness::new().await;
    seed_alice(&harness).await;
    harness
        .remote
        .serve_sessions(vec![descriptor("alice", ALICE_SESSION, Platform::Ios)]);

    let report = harness
        .bootstrap()
        .await
        .spawn()
        .await
        .expect("join")
        .expect("report");

    assert_eq!(report.provisioning, ProvisionOutcome::Provisioned);
    assert!(matches!(report.synchronization, SyncOutcome::Synchronized(_)));
    assert_eq!(
        harness.storage.load_sync_flags().await.expect("flags"),
        SyncFlags {
            keys_provisioned: true,
            sessions_synchronized: true,
        }
    );
    assert_eq!(harness.remote.push_calls(), 1);
    assert_eq!(harness.remote.fetch_calls(), 1);
}

#[tokio::test]
async fn completed_bootstrap_makes_no_remote_calls() {
    let harness = Harness::new().await;
    harness.bootstrap().await.run().await.expect("first run");
    let pushes = harness.remote.push_calls();

    let report = harness.bootstrap().await.run().await.expect("second run");

    assert_eq!(report.provisioning, ProvisionOutcome::AlreadyProvisioned);
    assert_eq!(report.synchronization, SyncOutcome::AlreadySynchronized);
    assert_eq!(harness.remote.push_calls(), pushes);
    assert_eq!(harness.remote.fetch_calls(), 0);
}

#[tokio::test]
async fn unauthorized_provisioning_skips_synchronization() {
    let harness = Harness::new().await;
    seed_alice(&harness).await;
    harness
        .remote
        .script_push(vec![Err(RemoteError::unauthorized("expired"))]);

    let err = harness
        .bootstrap()
        .await
        .spawn()
        .await
        .expect("join")
        .expect_err("terminal");

    assert!(err.is_terminal_auth());
    assert_eq!(harness.remote.fetch_calls(), 0);
    assert_eq!(
        harness.storage.load_sync_flags().await.expect("flags"),
        SyncFlags::default()
    );
}

#[tokio::test]
async fn logged_out_run_defers_both_steps() {
    let harness = Harness::with_remote(FakeKeyService::logged_out()).await;
    seed_alice(&harness).await;

    let report = harness.bootstrap().await.run().await.expect("run");

    assert_eq!(report.provisioning, ProvisionOutcome::Deferred);
    assert_eq!(report.synchronization, SyncOutcome::Deferred);

    harness.remote.set_authenticated(true);
    harness
        .remote
        .serve_sessions(vec![descriptor("alice", ALICE_SESSION, Platform::Ios)]);
    let report = harness.bootstrap().await.run().await.expect("after login");
    assert_eq!(report.provisioning, ProvisionOutcome::Provisioned);
    assert!(matches!(report.synchronization, SyncOutcome::Synchronized(_)));
}

#[tokio::test]
async fn unreadable_sync_state_fails_to_load() {
    let harness = Harness::new().await;
    seed_alice(&harness).await;
    sqlx::query("DROP TABLE sync_state")
        .execute(harness.storage.pool())
        .await
        .expect("drop");

    let err = SessionBootstrap::load(
        harness.storage.clone(),
        harness.remote.clone(),
        BootstrapOptions::default(),
    )
    .await
    .err()
    .expect("flags unreadable");

    assert!(matches!(
        err,
        SyncError::LocalData {
            operation: "load_sync_flags",
            ..
        }
    ));
}

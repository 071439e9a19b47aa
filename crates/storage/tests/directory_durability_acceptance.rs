use chrono::Utc;
use shared::domain::{ContactAddress, DeviceOrdinal, SessionRecord};
use storage::Storage;

#[tokio::test]
async fn interrupted_sync_is_invisible_after_reopen() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("session_sync_durability_{suffix}"));
    let database_url = format!(
        "sqlite://{}",
        temp_root
            .join("signal.db")
            .to_string_lossy()
            .replace('\\', "/")
    );

    let original = SessionRecord {
        contact: ContactAddress::new("durable-alice"),
        device: DeviceOrdinal(3),
        cipher_state: b"ratchet-state".to_vec(),
        last_updated: Utc::now(),
    };

    {
        let storage = Storage::new(&database_url).await.expect("db");
        storage.upsert_session(&original).await.expect("seed");

        let mut tx = storage.begin_sync().await.expect("begin");
        tx.replace_sessions(&[]).await.expect("clear directory");
        tx.mark_sessions_synchronized().await.expect("flag");
        drop(tx);
        storage.pool().close().await;
    }

    let reopened = Storage::new(&database_url).await.expect("reopen");
    let sessions = reopened.load_sessions().await.expect("sessions");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].contact, original.contact);
    assert_eq!(sessions[0].device, original.device);
    assert_eq!(sessions[0].cipher_state, original.cipher_state);
    assert!(
        !reopened
            .load_sync_flags()
            .await
            .expect("flags")
            .sessions_synchronized
    );

    reopened.pool().close().await;
    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

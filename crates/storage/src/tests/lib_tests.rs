use super::*;
use chrono::TimeZone;
use keys::{DalekPreKeyGenerator, LocalIdentity, PreKeyGenerator};

fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .expect("timestamp")
}

fn session(contact: &str, device: i32, cipher: &[u8], seconds: i64) -> SessionRecord {
    SessionRecord {
        contact: ContactAddress::new(contact),
        device: DeviceOrdinal(device),
        cipher_state: cipher.to_vec(),
        last_updated: at(seconds),
    }
}

fn sender_key(group: &str, contact: &str, device: i32, cipher: &[u8]) -> SenderKeyRecord {
    SenderKeyRecord {
        group_id: GroupId::new(group),
        sender: SenderAddress::new(ContactAddress::new(contact), DeviceOrdinal(device)),
        cipher_state: cipher.to_vec(),
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("session_sync_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("signal.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn sync_flags_default_unset_and_clear_on_logout() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    assert_eq!(
        storage.load_sync_flags().await.expect("flags"),
        SyncFlags::default()
    );

    storage.mark_keys_provisioned().await.expect("mark");
    storage.mark_keys_provisioned().await.expect("mark twice");
    let flags = storage.load_sync_flags().await.expect("flags");
    assert!(flags.keys_provisioned);
    assert!(!flags.sessions_synchronized);

    storage.clear_sync_flags().await.expect("clear");
    assert_eq!(
        storage.load_sync_flags().await.expect("flags"),
        SyncFlags::default()
    );
}

#[tokio::test]
async fn dropped_sync_transaction_leaves_directory_untouched() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .upsert_session(&session("alice", 3, b"alice-ratchet", 1))
        .await
        .expect("seed");

    {
        let mut tx = storage.begin_sync().await.expect("begin");
        let removed = tx
            .replace_sessions(&[session("alice", 9, b"alice-ratchet", 1)])
            .await
            .expect("replace");
        assert_eq!(removed, 1);
        tx.mark_sessions_synchronized().await.expect("flag");
    }

    let sessions = storage.load_sessions().await.expect("sessions");
    assert_eq!(sessions, vec![session("alice", 3, b"alice-ratchet", 1)]);
    assert!(
        !storage
            .load_sync_flags()
            .await
            .expect("flags")
            .sessions_synchronized
    );
}

#[tokio::test]
async fn committed_sync_transaction_replaces_directory_and_sets_flag() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .upsert_session(&session("alice", 3, b"a", 1))
        .await
        .expect("seed alice");
    storage
        .upsert_session(&session("bob", 7, b"b", 2))
        .await
        .expect("seed bob");

    let mut tx = storage.begin_sync().await.expect("begin");
    tx.replace_sessions(&[session("alice", 5, b"a", 1)])
        .await
        .expect("replace");
    tx.mark_sessions_synchronized().await.expect("flag");
    tx.commit().await.expect("commit");

    assert_eq!(
        storage.load_sessions().await.expect("sessions"),
        vec![session("alice", 5, b"a", 1)]
    );
    assert!(
        storage
            .load_sync_flags()
            .await
            .expect("flags")
            .sessions_synchronized
    );
}

#[tokio::test]
async fn malformed_sender_ids_surface_as_malformed_rows() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .upsert_sender_key(&sender_key("g1", "alice", 1, b"k"))
        .await
        .expect("insert");
    sqlx::query("INSERT INTO sender_keys (group_id, sender_id, record) VALUES ('g1', 'garbage', x'00')")
        .execute(storage.pool())
        .await
        .expect("raw insert");

    let rows = storage.load_sender_keys().await.expect("rows");
    assert_eq!(rows.len(), 2);
    assert!(rows
        .iter()
        .any(|row| matches!(row, SenderKeyRow::Parsed(record) if record.sender.encode() == "alice:1")));
    assert!(rows.iter().any(|row| matches!(
        row,
        SenderKeyRow::Malformed { group_id, error: SenderAddressError::MissingSeparator(raw) }
            if group_id.as_str() == "g1" && raw == "garbage"
    )));
}

#[tokio::test]
async fn rewrite_sender_key_moves_record_to_new_address() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let original = sender_key("g1", "alice", 3, b"group-chain");
    storage.upsert_sender_key(&original).await.expect("seed");

    let mut tx = storage.begin_sync().await.expect("begin");
    let moved = sender_key("g1", "alice", 5, b"group-chain");
    tx.rewrite_sender_key(&original.sender, &moved)
        .await
        .expect("rewrite");
    tx.commit().await.expect("commit");

    let rows = storage.load_sender_keys().await.expect("rows");
    assert_eq!(rows, vec![SenderKeyRow::Parsed(moved)]);
}

#[tokio::test]
async fn delete_sender_key_removes_only_that_address() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let stale = sender_key("g1", "alice", 3, b"stale");
    let current = sender_key("g1", "alice", 5, b"current");
    storage.upsert_sender_key(&stale).await.expect("seed");
    storage.upsert_sender_key(&current).await.expect("seed");

    let mut tx = storage.begin_sync().await.expect("begin");
    tx.delete_sender_key(&stale.group_id, &stale.sender)
        .await
        .expect("delete");
    tx.commit().await.expect("commit");

    let rows = storage.load_sender_keys().await.expect("rows");
    assert_eq!(rows, vec![SenderKeyRow::Parsed(current)]);
}

#[tokio::test]
async fn clears_only_session_jobs() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let conversation = ConversationId::new("c1");
    storage
        .enqueue_job("j1", "SEND_SESSION_MESSAGE", Some(&conversation), None)
        .await
        .expect("job");
    storage
        .enqueue_job("j2", "SEND_SESSION_MESSAGES", None, Some("{}"))
        .await
        .expect("job");
    storage
        .enqueue_job("j3", "SEND_MESSAGE", Some(&conversation), None)
        .await
        .expect("job");

    assert_eq!(storage.clear_session_jobs().await.expect("clear"), 2);
    let remaining = storage.list_jobs().await.expect("jobs");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].job_id, "j3");
}

#[tokio::test]
async fn preferences_round_trip_and_clear() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .set_preference(EXTENSION_SESSION_PREFERENCE, "token-1")
        .await
        .expect("set");
    assert_eq!(
        storage
            .preference(EXTENSION_SESSION_PREFERENCE)
            .await
            .expect("get")
            .as_deref(),
        Some("token-1")
    );
    assert!(storage
        .clear_preference(EXTENSION_SESSION_PREFERENCE)
        .await
        .expect("clear"));
    assert!(!storage
        .clear_preference(EXTENSION_SESSION_PREFERENCE)
        .await
        .expect("clear again"));
}

#[tokio::test]
async fn identity_and_prekeys_persist() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    assert!(storage
        .load_local_identity()
        .await
        .expect("load")
        .is_none());
    assert_eq!(storage.last_prekey_id().await.expect("last"), None);

    let identity = LocalIdentity::generate();
    storage
        .save_local_identity(&identity.to_stored())
        .await
        .expect("save identity");
    let batch = DalekPreKeyGenerator
        .generate(&identity, 1, 4)
        .expect("generate");
    storage.save_prekeys(&batch).await.expect("save prekeys");

    let restored = LocalIdentity::from_stored(
        &storage
            .load_local_identity()
            .await
            .expect("load")
            .expect("identity present"),
    );
    assert_eq!(restored.identity_public(), identity.identity_public());
    assert_eq!(restored.registration_id(), identity.registration_id());
    assert_eq!(storage.last_prekey_id().await.expect("last"), Some(4));
    assert_eq!(storage.count_prekeys().await.expect("count"), 4);
}

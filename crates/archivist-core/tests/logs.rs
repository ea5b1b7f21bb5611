//! Integration tests for the audit and notification logs.

use std::time::Duration;

use archivist_core::audit::{AuditEntry, AuditLog, Outcome};
use archivist_core::config::{AuditConfig, NotificationConfig};
use archivist_core::notify::{EmitOutcome, NewNotification, NotificationFilter, NotificationStore};
use archivist_core::store::StoreObserver;
use archivist_core::{RecordKey, RecordStore, StoreOptions};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

fn audit_log() -> (tempfile::TempDir, AuditLog) {
    let dir = tempfile::tempdir().expect("temp dir");
    let log = AuditLog::open(dir.path(), &AuditConfig::default()).expect("open audit");
    (dir, log)
}

proptest! {
    #[test]
    fn human_line_never_contains_an_email(
        local in "[a-z][a-z0-9._]{2,12}",
        domain in "[a-z]{2,10}",
        tld in "(com|ir|org|ac\\.ir)",
        prefix in "[A-Za-z ]{0,20}",
    ) {
        let (_dir, log) = audit_log();
        let email = format!("{local}@{domain}.{tld}");
        let entry = AuditEntry::info(email.clone(), "LOGIN")
            .with_detail(format!("{prefix} {email} signed in"))
            .with_field("contact", email.clone());
        let line = log.human_line("2026-10-18T09:00:00.000Z", &entry);
        prop_assert!(!line.contains(&email), "email leaked: {}", line);
        prop_assert_eq!(line.matches(" | ").count(), 5);
    }
}

#[test]
fn append_writes_both_streams_without_secrets() {
    let (_dir, log) = audit_log();
    log.append(
        &AuditEntry::security("admin", "PASSWORD_RESET", Outcome::Success)
            .with_detail("password=hunter2hunter2 for 40012345678")
            .with_field("email", "sara@example.com"),
    )
    .expect("append");

    let human = std::fs::read_to_string(log.human_path()).expect("human");
    let structured = std::fs::read_to_string(log.structured_path()).expect("structured");
    for stream in [&human, &structured] {
        assert!(!stream.contains("hunter2hunter2"));
        assert!(!stream.contains("sara@example.com"));
        assert!(!stream.contains("40012345678"));
    }
    let record: Value = serde_json::from_str(structured.trim()).expect("json line");
    assert_eq!(record["action"], json!("PASSWORD_RESET"));
    assert_eq!(log.dropped_writes(), 0);
}

#[test]
fn store_recovery_is_audited() {
    let dir = tempfile::tempdir().expect("temp dir");
    let log = std::sync::Arc::new(
        AuditLog::open(&dir.path().join("logs"), &AuditConfig::default()).expect("audit"),
    );
    let store = RecordStore::open(dir.path().join("data"), StoreOptions::default())
        .expect("store")
        .with_observer(log.clone() as std::sync::Arc<dyn StoreObserver>);

    let mut patch = Map::new();
    patch.insert("name".into(), json!("A"));
    for code in ["1", "2"] {
        store
            .merge_upsert::<archivist_core::records::Student>(&RecordKey::single(code), &patch, "t")
            .expect("upsert");
    }
    std::fs::write(store.collection_path("students"), b"[{").expect("corrupt");
    store
        .read_collection::<archivist_core::records::Student>()
        .expect("recover");

    let human = std::fs::read_to_string(log.human_path()).expect("audit");
    assert!(human.contains("COLLECTION_RECOVERED"));
    assert!(human.contains("recovered"));
}

#[test]
fn notifications_survive_restart_with_dedupe() {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = NotificationConfig::default();
    let reminder = || {
        NewNotification::new("defense_reminder")
            .topic("defense")
            .correlation_id("400/CS-501")
            .dedupe("400/CS-501", Duration::from_secs(3600))
    };

    {
        let store = NotificationStore::open(dir.path(), &config).expect("open");
        assert!(store.emit(reminder()).expect("emit").is_emitted());
        store
            .emit(NewNotification::new("thesis_approved").topic("request"))
            .expect("emit");
    }

    let store = NotificationStore::open(dir.path(), &config).expect("reopen");
    assert!(matches!(
        store.emit(reminder()).expect("emit"),
        EmitOutcome::Suppressed { .. }
    ));
    let defense = store
        .list_recent(
            &NotificationFilter {
                correlation_id: Some("400/CS-501".into()),
                ..NotificationFilter::default()
            },
            0,
            10,
        )
        .expect("list");
    assert_eq!(defense.len(), 1);
    assert_eq!(defense[0].event, "defense_reminder");
}

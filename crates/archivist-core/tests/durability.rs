//! Cross-instance durability tests for the record store.
//!
//! Each thread opens its own [`RecordStore`] on a shared directory, which is
//! how separate processes see the data: the only shared state is the
//! filesystem.
//!
//! # Properties Verified
//!
//! - Concurrent disjoint upserts lose no record, on distinct keys or one key
//! - Stray temp files and truncated writes never surface as partial data
//! - Snapshot count after M writes is min(M, retention)
//! - A lock timeout leaves the collection untouched

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use archivist_core::lock::LockManager;
use archivist_core::records::{Student, Thesis};
use archivist_core::store::{ReadOutcome, StoreError, LOCK_DIR};
use archivist_core::{RecordKey, RecordStore, StoreOptions};
use serde_json::{json, Map, Value};

fn patch(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("patch must be an object, got {other}"),
    }
}

fn open(dir: &std::path::Path, options: StoreOptions) -> RecordStore {
    RecordStore::open(dir, options).expect("open store")
}

#[test]
fn concurrent_disjoint_upserts_lose_nothing() {
    const WRITERS: usize = 6;
    const PER_WRITER: usize = 8;

    let dir = tempfile::tempdir().expect("temp dir");
    let root = Arc::new(dir.path().to_path_buf());
    let options = StoreOptions {
        lock_wait: Duration::from_secs(30),
        ..StoreOptions::default()
    };

    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let root = Arc::clone(&root);
            thread::spawn(move || {
                let store = open(&root, options);
                for i in 0..PER_WRITER {
                    let code = format!("4001{w:02}{i:02}");
                    store
                        .merge_upsert::<Student>(
                            &RecordKey::single(&code),
                            &patch(json!({"name": format!("writer {w}")})),
                            &format!("writer-{w}"),
                        )
                        .expect("upsert");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    let students = open(&root, options)
        .read_collection::<Student>()
        .expect("read");
    assert_eq!(students.len(), WRITERS * PER_WRITER);
}

#[test]
fn concurrent_patches_to_one_record_all_land() {
    const WRITERS: usize = 8;

    let dir = tempfile::tempdir().expect("temp dir");
    let root = Arc::new(dir.path().to_path_buf());
    let options = StoreOptions {
        lock_wait: Duration::from_secs(30),
        ..StoreOptions::default()
    };
    let key = RecordKey::single("400123");

    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let root = Arc::clone(&root);
            let key = key.clone();
            thread::spawn(move || {
                open(&root, options)
                    .merge_upsert::<Student>(
                        &key,
                        &patch(json!({ (format!("field_{w}")): w })),
                        &format!("writer-{w}"),
                    )
                    .expect("upsert");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    let students = open(&root, options)
        .read_collection::<Student>()
        .expect("read");
    assert_eq!(students.len(), 1);
    for w in 0..WRITERS {
        assert_eq!(students[0].extra.get(&format!("field_{w}")), Some(&json!(w)));
    }
}

#[test]
fn stray_temp_file_is_ignored_by_readers() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open(dir.path(), StoreOptions::default());
    store
        .merge_upsert::<Student>(&RecordKey::single("1"), &patch(json!({"name": "A"})), "t")
        .expect("upsert");

    // A writer that died between temp write and rename leaves this behind.
    std::fs::write(dir.path().join(".tmpDEAD01"), b"[{\"student_code\": \"2\"").expect("stray");

    let loaded = store.read_collection_with_outcome::<Student>().expect("read");
    assert_eq!(loaded.outcome, ReadOutcome::Clean);
    assert_eq!(loaded.records.len(), 1);

    store
        .merge_upsert::<Student>(&RecordKey::single("2"), &patch(json!({"name": "B"})), "t")
        .expect("upsert after crash");
    assert_eq!(store.read_collection::<Student>().expect("read").len(), 2);
}

#[test]
fn truncated_file_reads_last_committed_state() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open(dir.path(), StoreOptions::default());
    for code in ["1", "2", "3"] {
        store
            .merge_upsert::<Student>(&RecordKey::single(code), &patch(json!({})), "t")
            .expect("upsert");
    }

    let path = store.collection_path("students");
    let full = std::fs::read(&path).expect("read current");
    std::fs::write(&path, &full[..full.len() / 2]).expect("truncate");

    let loaded = store.read_collection_with_outcome::<Student>().expect("recover");
    assert!(matches!(loaded.outcome, ReadOutcome::Recovered { .. }));
    // The newest snapshot is the state before the third write.
    let codes: Vec<_> = loaded.records.iter().map(|s| s.student_code.as_str()).collect();
    assert_eq!(codes, vec!["1", "2"]);

    let quarantined = path.with_extension("json.corrupt");
    assert!(quarantined.exists());
    assert_eq!(
        store.read_collection_with_outcome::<Student>().expect("read").outcome,
        ReadOutcome::Clean
    );
}

#[test]
fn snapshot_count_is_bounded_by_retention() {
    for (writes, retention) in [(3usize, 5usize), (5, 5), (9, 4)] {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = open(
            dir.path(),
            StoreOptions {
                backup_retention: retention,
                ..StoreOptions::default()
            },
        );
        for i in 0..writes {
            store
                .merge_upsert::<Student>(
                    &RecordKey::single("1"),
                    &patch(json!({"name": format!("v{i}")})),
                    "t",
                )
                .expect("upsert");
        }
        assert_eq!(
            store.snapshots("students").expect("list").len(),
            writes.min(retention),
            "writes={writes} retention={retention}"
        );
    }
}

#[test]
fn lock_timeout_leaves_data_untouched() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open(
        dir.path(),
        StoreOptions {
            lock_wait: Duration::from_millis(150),
            ..StoreOptions::default()
        },
    );
    let key = RecordKey::composite(["400", "CS-501"]);
    store
        .merge_upsert::<Thesis>(&key, &patch(json!({"status": "pending"})), "student")
        .expect("seed");
    let before = std::fs::read(store.collection_path("theses")).expect("read");

    let other = LockManager::new(dir.path().join(LOCK_DIR));
    let held = other
        .acquire("theses", "other-process", Duration::from_secs(60), Duration::ZERO)
        .expect("hold lock");

    let err = store
        .merge_upsert::<Thesis>(&key, &patch(json!({"status": "approved"})), "admin")
        .unwrap_err();
    assert!(matches!(err, StoreError::Lock(_)), "unexpected error: {err}");
    assert_eq!(std::fs::read(store.collection_path("theses")).expect("read"), before);

    other.release(&held).expect("release");
    let thesis: Thesis = store
        .merge_upsert(&key, &patch(json!({"status": "approved"})), "admin")
        .expect("upsert after release");
    assert_eq!(thesis.status, "approved");
}

#[test]
fn unknown_fields_survive_typed_updates() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open(dir.path(), StoreOptions::default());
    std::fs::write(
        store.collection_path("students"),
        serde_json::to_vec(&json!([{
            "student_code": "1",
            "name": "Old",
            "legacy_flag": {"nested": [1, 2, 3]},
        }]))
        .expect("encode"),
    )
    .expect("seed");

    store
        .merge_upsert::<Student>(&RecordKey::single("1"), &patch(json!({"name": "New"})), "t")
        .expect("upsert");
    let raw: Value =
        serde_json::from_slice(&std::fs::read(store.collection_path("students")).expect("read"))
            .expect("parse");
    assert_eq!(raw[0]["name"], json!("New"));
    assert_eq!(raw[0]["legacy_flag"], json!({"nested": [1, 2, 3]}));
}

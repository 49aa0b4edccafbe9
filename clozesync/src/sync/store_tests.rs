use super::*;
use tempfile::tempdir;

fn fp(content: &str) -> Fingerprint {
    Fingerprint::of(content)
}

#[test]
fn commit_entry_keeps_entries_sorted_and_replaces_by_position() {
    let mut store = FingerprintStore::in_memory();
    store.commit_entry("test.md", 2, fp("c"), NoteId(3));
    store.commit_entry("test.md", 0, fp("a"), NoteId(1));
    store.commit_entry("test.md", 1, fp("b"), NoteId(2));
    store.commit_entry("test.md", 1, fp("b2"), NoteId(22));

    let record = store.get("test.md").unwrap();
    let positions: Vec<_> = record.entries.iter().map(|e| e.position).collect();
    assert_eq!(positions, vec![0, 1, 2]);
    let entry = record.entry(1).unwrap();
    assert_eq!(entry.note_id, NoteId(22));
    assert_eq!(entry.fingerprint, fp("b2"));
    assert!(entry.seen);
}

#[test]
fn remove_entries_reports_count() {
    let mut store = FingerprintStore::in_memory();
    store.commit_entry("a.md", 0, fp("a"), NoteId(1));
    store.commit_entry("a.md", 1, fp("b"), NoteId(2));
    store.commit_entry("a.md", 2, fp("c"), NoteId(3));

    assert_eq!(store.remove_entries("a.md", &[0, 2, 9]), 2);
    assert_eq!(store.remove_entries("missing.md", &[0]), 0);
    let record = store.get("a.md").unwrap();
    assert_eq!(record.entries.len(), 1);
    assert_eq!(record.entries[0].note_id, NoteId(2));
}

#[test]
fn persist_then_load_restores_records() {
    let dir = tempdir().unwrap();
    let location = dir.path().join("clozesync/cache.json");

    let mut store = FingerprintStore::empty_at(&location);
    store.commit_entry("Uni/test.md", 0, fp("{{c1::Definition}}"), NoteId(10));
    store.set_file_state("Uni/test.md", Some("abc".to_string()), 1_700_000_000);
    store.persist().unwrap();

    let loaded = FingerprintStore::load(&location).unwrap();
    assert_eq!(loaded.records(), store.records());
    assert_eq!(loaded.location(), Some(location.as_path()));
    let record = loaded.get("Uni/test.md").unwrap();
    assert_eq!(record.content_hash.as_deref(), Some("abc"));
    assert_eq!(record.last_seen, 1_700_000_000);
}

#[test]
fn vault_root_survives_a_round_trip() {
    let dir = tempdir().unwrap();
    let location = dir.path().join("cache.json");

    let mut store = FingerprintStore::empty_at(&location);
    assert_eq!(store.root(), None);
    store.set_root("/home/me/vault");
    store.persist().unwrap();

    let loaded = FingerprintStore::load(&location).unwrap();
    assert_eq!(loaded.root(), Some(Path::new("/home/me/vault")));
}

#[test]
fn cache_without_root_still_loads() {
    let dir = tempdir().unwrap();
    let location = dir.path().join("cache.json");
    std::fs::write(&location, r#"{"version":1,"files":{}}"#).unwrap();

    let loaded = FingerprintStore::load(&location).unwrap();
    assert_eq!(loaded.root(), None);
    assert!(loaded.records().is_empty());
}

#[test]
fn missing_file_loads_empty() {
    let dir = tempdir().unwrap();
    let location = dir.path().join("cache.json");
    let store = FingerprintStore::load(&location).unwrap();
    assert!(store.records().is_empty());
    assert_eq!(store.location(), Some(location.as_path()));
}

#[test]
fn garbage_is_reported_as_corrupt() {
    let dir = tempdir().unwrap();
    let location = dir.path().join("cache.json");
    std::fs::write(&location, b"{ not json").unwrap();

    let err = FingerprintStore::load(&location).unwrap_err();
    assert!(matches!(err, StoreError::Corrupt { .. }));
    assert!(err.to_string().contains("--no-cache"));
}

#[test]
fn unknown_version_is_rejected() {
    let dir = tempdir().unwrap();
    let location = dir.path().join("cache.json");
    std::fs::write(&location, br#"{"version": 9, "files": {}}"#).unwrap();

    let err = FingerprintStore::load(&location).unwrap_err();
    assert!(matches!(err, StoreError::UnsupportedVersion { version: 9, .. }));
}

#[test]
fn in_memory_persist_writes_nothing() {
    let mut store = FingerprintStore::in_memory();
    store.commit_entry("a.md", 0, fp("a"), NoteId(1));
    store.persist().unwrap();
    assert!(store.location().is_none());
}

#[test]
fn seen_flags_are_cleared_and_restored_per_file() {
    let mut store = FingerprintStore::in_memory();
    store.commit_entry("a.md", 0, fp("a"), NoteId(1));
    store.commit_entry("b.md", 0, fp("b"), NoteId(2));

    store.clear_seen();
    assert!(store.records().values().flat_map(|r| &r.entries).all(|e| !e.seen));

    store.mark_all_seen("a.md");
    assert!(store.get("a.md").unwrap().entries[0].seen);
    assert!(!store.get("b.md").unwrap().entries[0].seen);
}

#[test]
fn owners_of_lists_every_binding() {
    let mut store = FingerprintStore::in_memory();
    store.commit_entry("a.md", 0, fp("a"), NoteId(7));
    store.commit_entry("b.md", 3, fp("a"), NoteId(7));
    store.commit_entry("b.md", 4, fp("x"), NoteId(8));

    assert_eq!(
        store.owners_of(NoteId(7)),
        vec![("a.md".to_string(), 0), ("b.md".to_string(), 3)]
    );
    assert!(store.owners_of(NoteId(99)).is_empty());
}

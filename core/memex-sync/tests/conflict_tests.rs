use memex_storage::MemoryKvStore;
use memex_sync::conflict::extract_timestamp;
use memex_sync::{
    auto_resolve, shallow_merge, ConflictKind, ConflictResolver, ResolutionChoice, SyncError,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;

// ── Timestamp extraction ─────────────────────────────────────────

#[test]
fn extract_timestamp_accepts_numbers_and_strings() {
    assert_eq!(extract_timestamp(&json!({"timestamp": 42})), Some(42));
    assert_eq!(extract_timestamp(&json!({"timestamp": "42"})), Some(42));
    assert_eq!(
        extract_timestamp(&json!({"timestamp": "1970-01-01T00:00:01Z"})),
        Some(1000)
    );
    assert_eq!(extract_timestamp(&json!({"timestamp": "yesterday"})), None);
    assert_eq!(extract_timestamp(&json!({"title": "x"})), None);
    assert_eq!(extract_timestamp(&json!("scalar")), None);
}

// ── Automatic rules ──────────────────────────────────────────────

#[test]
fn newer_side_wins_whole() {
    let local = json!({"title": "local", "extra": 1, "timestamp": 100});
    let remote = json!({"title": "remote", "timestamp": 200});
    assert_eq!(auto_resolve(&local, &remote), Some(remote.clone()));
    assert_eq!(auto_resolve(&remote, &local), Some(remote));
}

#[test]
fn equal_timestamps_fall_back_to_shallow_merge() {
    let local = json!({"title": "local", "a": 1, "timestamp": 100});
    let remote = json!({"title": "remote", "b": 2, "timestamp": 100});
    assert_eq!(
        auto_resolve(&local, &remote),
        Some(json!({"title": "local", "a": 1, "b": 2, "timestamp": 100}))
    );
}

#[test]
fn shallow_merge_prefers_local_and_max_timestamp() {
    let local = json!({"title": "local", "timestamp": 5});
    let remote = json!({"title": "remote", "tags": ["x"], "timestamp": 9});
    assert_eq!(
        shallow_merge(&local, &remote),
        Some(json!({"title": "local", "tags": ["x"], "timestamp": 9}))
    );
}

#[test]
fn shallow_merge_needs_two_objects() {
    assert_eq!(shallow_merge(&json!([1]), &json!({"a": 1})), None);
    assert_eq!(auto_resolve(&json!("a"), &json!("b")), None);
}

proptest! {
    #[test]
    fn last_write_wins_is_order_independent(l in 0u64..1_000_000, r in 0u64..1_000_000) {
        prop_assume!(l != r);
        let local = json!({"v": "local", "timestamp": l});
        let remote = json!({"v": "remote", "timestamp": r});
        let forward = auto_resolve(&local, &remote).unwrap();
        let backward = auto_resolve(&remote, &local).unwrap();
        prop_assert_eq!(&forward, &backward);
        let newest = if l > r { &local } else { &remote };
        prop_assert_eq!(&forward, newest);
    }

    #[test]
    fn merge_timestamp_is_max(l in 0u64..1_000_000, r in 0u64..1_000_000) {
        let merged = shallow_merge(&json!({"timestamp": l}), &json!({"timestamp": r})).unwrap();
        prop_assert_eq!(extract_timestamp(&merged), Some(l.max(r)));
    }
}

// ── ConflictResolver ─────────────────────────────────────────────

#[test]
fn auto_resolved_conflicts_are_not_tracked() {
    let resolver = ConflictResolver::in_memory();
    let resolution = resolver
        .detect_and_resolve(
            "doc-1",
            json!({"v": 1, "timestamp": 1}),
            json!({"v": 2, "timestamp": 2}),
        )
        .unwrap();
    assert_eq!(resolution.kind, ConflictKind::Merge);
    assert_eq!(resolution.resolved, Some(json!({"v": 2, "timestamp": 2})));
    assert_eq!(resolution.resolved_by.as_deref(), Some("auto"));
    assert_eq!(resolver.pending_count(), 0);
}

#[test]
fn unmergeable_conflict_waits_for_a_person() {
    let resolver = ConflictResolver::in_memory();
    let conflict = resolver
        .detect_and_resolve("doc-1", json!("left"), json!("right"))
        .unwrap();
    assert_eq!(conflict.kind, ConflictKind::Manual);
    assert!(!conflict.is_resolved());
    assert_eq!(resolver.pending_conflicts(), vec![conflict]);
}

#[test]
fn manual_resolution_happens_once() {
    let resolver = ConflictResolver::in_memory();
    let conflict = resolver
        .detect_and_resolve("doc-1", json!("left"), json!("right"))
        .unwrap();

    let settled = resolver
        .resolve_conflict(conflict.id, ResolutionChoice::Remote, None)
        .unwrap();
    assert_eq!(settled.kind, ConflictKind::Override);
    assert_eq!(settled.resolved, Some(json!("right")));
    assert_eq!(settled.resolved_by.as_deref(), Some("user"));
    assert_eq!(resolver.pending_count(), 0);

    assert!(matches!(
        resolver.resolve_conflict(conflict.id, ResolutionChoice::Local, None),
        Err(SyncError::NotFound(_))
    ));
}

#[test]
fn merge_choice_uses_custom_value_or_fails() {
    let resolver = ConflictResolver::in_memory();
    let a = resolver
        .detect_and_resolve("doc-a", json!(1), json!(2))
        .unwrap();
    let b = resolver
        .detect_and_resolve("doc-b", json!(1), json!(2))
        .unwrap();

    let merged = resolver
        .resolve_conflict(a.id, ResolutionChoice::Merge, Some(json!(3)))
        .unwrap();
    assert_eq!(merged.kind, ConflictKind::Merge);
    assert_eq!(merged.resolved, Some(json!(3)));

    assert!(matches!(
        resolver.resolve_conflict(b.id, ResolutionChoice::Merge, None),
        Err(SyncError::ConflictUnresolved(id)) if id == b.id
    ));
    assert_eq!(resolver.pending_count(), 1);
}

#[test]
fn pending_conflicts_survive_reopen() {
    let kv = Arc::new(MemoryKvStore::new());
    let resolver = ConflictResolver::open(kv.clone()).unwrap();
    let conflict = resolver
        .detect_and_resolve("doc-1", json!(true), json!(false))
        .unwrap();
    drop(resolver);

    let reopened = ConflictResolver::open(kv).unwrap();
    assert_eq!(reopened.pending_conflicts(), vec![conflict]);
}

#[test]
fn failed_write_keeps_conflict_pending() {
    let kv = Arc::new(MemoryKvStore::new());
    let resolver = ConflictResolver::open(kv.clone()).unwrap();
    let conflict = resolver
        .detect_and_resolve("doc-1", json!(1), json!(2))
        .unwrap();

    kv.fail_writes(true);
    assert!(matches!(
        resolver.resolve_conflict(conflict.id, ResolutionChoice::Local, None),
        Err(SyncError::PersistenceFailure(_))
    ));
    assert_eq!(resolver.pending_count(), 1);
    assert!(matches!(
        resolver.detect_and_resolve("doc-2", json!(1), json!(2)),
        Err(SyncError::PersistenceFailure(_))
    ));
    assert_eq!(resolver.pending_count(), 1);
}

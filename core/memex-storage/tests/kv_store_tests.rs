use memex_storage::{keys, KeyValueStore, KeyValueStoreExt, MemoryKvStore, SqliteKvStore};
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Sample {
    name: String,
    count: u32,
}

fn exercise(store: &dyn KeyValueStore) {
    assert!(store.get("missing").unwrap().is_none());

    store.set("a", json!({"x": 1})).unwrap();
    assert_eq!(store.get("a").unwrap(), Some(json!({"x": 1})));

    store.set("a", json!([1, 2, 3])).unwrap();
    assert_eq!(store.get("a").unwrap(), Some(json!([1, 2, 3])));

    store.remove("a").unwrap();
    assert!(store.get("a").unwrap().is_none());

    // Removing a missing key is fine.
    store.remove("a").unwrap();
}

// ── MemoryKvStore ────────────────────────────────────────────────

#[test]
fn memory_store_basic_operations() {
    exercise(&MemoryKvStore::new());
}

#[test]
fn memory_store_typed_roundtrip() {
    let store = MemoryKvStore::new();
    let sample = Sample {
        name: "queue".into(),
        count: 3,
    };
    store.save(keys::OFFLINE_QUEUE, &sample).unwrap();
    let loaded: Option<Sample> = store.load(keys::OFFLINE_QUEUE).unwrap();
    assert_eq!(loaded, Some(sample));
}

#[test]
fn memory_store_failed_writes_leave_state_untouched() {
    let store = MemoryKvStore::new();
    store.set("k", json!(1)).unwrap();

    store.fail_writes(true);
    assert!(store.set("k", json!(2)).is_err());
    assert!(store.remove("k").is_err());
    assert_eq!(store.get("k").unwrap(), Some(json!(1)));

    store.fail_writes(false);
    store.set("k", json!(2)).unwrap();
    assert_eq!(store.get("k").unwrap(), Some(json!(2)));
}

#[test]
fn memory_store_len() {
    let store = MemoryKvStore::new();
    assert!(store.is_empty());
    store.set("a", json!(null)).unwrap();
    store.set("b", json!(null)).unwrap();
    assert_eq!(store.len(), 2);
}

#[test]
fn load_of_wrong_shape_is_an_error() {
    let store = MemoryKvStore::new();
    store.set("k", json!("not a sample")).unwrap();
    let loaded: Result<Option<Sample>, _> = store.load("k");
    assert!(loaded.is_err());
}

// ── SqliteKvStore ────────────────────────────────────────────────

#[test]
fn sqlite_store_basic_operations() {
    exercise(&SqliteKvStore::open_in_memory().unwrap());
}

#[test]
fn sqlite_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("memex.db");

    {
        let store = SqliteKvStore::open(&path).unwrap();
        store
            .save(
                keys::REGISTRY,
                &Sample {
                    name: "reg".into(),
                    count: 1,
                },
            )
            .unwrap();
        store.set(keys::SUBSCRIPTIONS, json!([])).unwrap();
    }

    let reopened = SqliteKvStore::open(&path).unwrap();
    let loaded: Option<Sample> = reopened.load(keys::REGISTRY).unwrap();
    assert_eq!(loaded.unwrap().name, "reg");
    assert_eq!(
        reopened.keys().unwrap(),
        vec![keys::REGISTRY.to_string(), keys::SUBSCRIPTIONS.to_string()]
    );
}

#[test]
fn sqlite_store_clones_share_connection() {
    let store = SqliteKvStore::open_in_memory().unwrap();
    let clone = store.clone();
    store.set("shared", json!(true)).unwrap();
    assert_eq!(clone.get("shared").unwrap(), Some(json!(true)));
}

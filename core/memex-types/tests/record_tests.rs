use memex_types::{MemoryRecord, Timestamp, UserId, Visibility};

fn record(id: &str) -> MemoryRecord {
    MemoryRecord::new(id, "Title", "Body", UserId::new("alice"))
}

#[test]
fn new_record_is_private_without_cid() {
    let r = record("r1");
    assert_eq!(r.visibility, Visibility::Private);
    assert!(r.content_cid.is_none());
    assert!(!r.is_publishable());
}

#[test]
fn public_record_with_cid_is_publishable() {
    let r = record("r1")
        .with_visibility(Visibility::Public)
        .with_content_cid("QmBody");
    assert!(r.is_publishable());
}

#[test]
fn public_record_with_blank_cid_is_not_publishable() {
    let r = record("r1")
        .with_visibility(Visibility::Public)
        .with_content_cid("  ");
    assert!(!r.is_publishable());
}

#[test]
fn shared_record_is_not_publishable() {
    let r = record("r1")
        .with_visibility(Visibility::Shared)
        .with_content_cid("QmBody");
    assert!(!r.is_publishable());
}

#[test]
fn record_json_uses_camel_case() {
    let mut r = record("r1")
        .with_visibility(Visibility::Public)
        .with_content_cid("QmBody")
        .with_tags(["rust", "sync"]);
    r.timestamp = Timestamp::from_millis(5);
    let json = serde_json::to_value(&r).unwrap();
    assert_eq!(json["contentCid"], "QmBody");
    assert_eq!(json["authorId"], "alice");
    assert_eq!(json["visibility"], "public");
    assert_eq!(json["timestamp"], 5);
}

#[test]
fn record_deserializes_with_defaults() {
    let json = r#"{"id":"r9","title":"t","content":"c","authorId":"bob","timestamp":1}"#;
    let r: MemoryRecord = serde_json::from_str(json).unwrap();
    assert_eq!(r.visibility, Visibility::Private);
    assert!(r.tags.is_empty());
    assert!(r.author_name.is_none());
}

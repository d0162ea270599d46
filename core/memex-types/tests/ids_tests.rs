use memex_types::{Cid, ConflictId, Error, OperationId, SpaceId, SubscriptionId, UserId};
use std::collections::HashSet;
use std::str::FromStr;

// ── UUID handles ─────────────────────────────────────────────────

#[test]
fn subscription_id_new_is_unique() {
    let a = SubscriptionId::new();
    let b = SubscriptionId::new();
    assert_ne!(a, b);
}

#[test]
fn subscription_id_from_uuid_roundtrip() {
    let uuid = uuid::Uuid::now_v7();
    let id = SubscriptionId::from_uuid(uuid);
    assert_eq!(id.as_uuid(), uuid);
}

#[test]
fn operation_id_display_and_parse() {
    let id = OperationId::new();
    let parsed = OperationId::parse(&id.to_string()).unwrap();
    assert_eq!(id, parsed);
}

#[test]
fn conflict_id_from_str_invalid() {
    assert!(matches!(
        ConflictId::from_str("garbage"),
        Err(Error::InvalidUuid(_))
    ));
    assert!(matches!(
        SubscriptionId::parse(""),
        Err(Error::InvalidUuid(_))
    ));
}

#[test]
fn uuid_ids_are_time_ordered() {
    let first = OperationId::new();
    std::thread::sleep(std::time::Duration::from_millis(2));
    let second = OperationId::new();
    assert!(first < second);
}

#[test]
fn subscription_id_serializes_as_plain_string() {
    let id = SubscriptionId::new();
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, format!("\"{id}\""));
    let parsed: SubscriptionId = serde_json::from_str(&json).unwrap();
    assert_eq!(id, parsed);
}

// ── Cid ──────────────────────────────────────────────────────────

#[test]
fn cid_parse_trims_whitespace() {
    let cid = Cid::parse("  Qm123 ").unwrap();
    assert_eq!(cid.as_str(), "Qm123");
}

#[test]
fn cid_parse_rejects_blank() {
    assert!(Cid::parse("").is_err());
    assert!(Cid::parse("   ").is_err());
}

#[test]
fn cid_from_str_and_display() {
    let cid: Cid = "bafy-abc".parse().unwrap();
    assert_eq!(cid.to_string(), "bafy-abc");
}

#[test]
fn cid_hash_and_eq() {
    let mut set = HashSet::new();
    set.insert(Cid::parse("Qm1").unwrap());
    set.insert(Cid::parse("Qm1").unwrap());
    set.insert(Cid::parse("Qm2").unwrap());
    assert_eq!(set.len(), 2);
}

#[test]
fn cid_serialization_is_transparent() {
    let cid = Cid::parse("Qm123").unwrap();
    assert_eq!(serde_json::to_string(&cid).unwrap(), "\"Qm123\"");
}

// ── String ids ───────────────────────────────────────────────────

#[test]
fn user_and_space_ids_wrap_strings() {
    let user = UserId::new("alice");
    let space: SpaceId = "space-1".into();
    assert_eq!(user.as_str(), "alice");
    assert_eq!(space.to_string(), "space-1");
    assert_eq!(UserId::from("alice"), user);
}

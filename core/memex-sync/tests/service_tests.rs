use memex_storage::MemoryKvStore;
use memex_sync::content_store::mock::MemoryContentStore;
use memex_sync::space::mock::{MemorySpace, MemorySpaceTransport};
use memex_sync::{
    backoff_delay, ContentStore, DaemonState, ManualConnectivity, Memex, MemexConfig,
    OperationKind, OperationStatus, Outcome, ProfileSummary, Registry, RegistryEntry,
    ResolutionChoice, SpaceRecord, StaticRecordSource, SyncError,
};
use memex_types::{Cid, MemoryRecord, Timestamp, UserId, Visibility};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    memex: Memex,
    kv: Arc<MemoryKvStore>,
    store: Arc<MemoryContentStore>,
    net: Arc<ManualConnectivity>,
    records: Arc<StaticRecordSource>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_test_writer()
        .try_init();
}

fn harness_with(online: bool, config: MemexConfig) -> Harness {
    init_tracing();
    let kv = Arc::new(MemoryKvStore::new());
    let store = Arc::new(MemoryContentStore::new());
    let net = Arc::new(ManualConnectivity::new(online));
    let records = Arc::new(StaticRecordSource::default());
    let memex = Memex::builder(config, kv.clone(), store.clone(), net.clone())
        .records(records.clone())
        .build()
        .unwrap();
    Harness {
        memex,
        kv,
        store,
        net,
        records,
    }
}

fn harness(online: bool) -> Harness {
    harness_with(online, MemexConfig::default())
}

fn alice() -> UserId {
    UserId::new("alice")
}

fn public_record(id: &str) -> MemoryRecord {
    MemoryRecord::new(id, format!("title {id}"), format!("content {id}"), alice())
        .with_visibility(Visibility::Public)
        .with_content_cid(format!("bafy-{id}"))
}

/// Stores a registry for `owner` under `cid`, as if a peer had published it.
fn seed_remote(store: &MemoryContentStore, cid: &str, owner: &str, ids: &[&str]) -> Cid {
    let mut registry = Registry::new(UserId::new(owner), ProfileSummary::named(owner));
    let entries = ids
        .iter()
        .map(|id| {
            let record = MemoryRecord::new(*id, "remote", "remote body", UserId::new(owner))
                .with_visibility(Visibility::Public)
                .with_content_cid(format!("bafy-{id}"));
            RegistryEntry::project(&record, false).unwrap()
        })
        .collect();
    registry.replace_entries(entries);
    let cid = Cid::parse(cid).unwrap();
    store.insert(cid.clone(), registry.to_canonical_bytes().unwrap());
    cid
}

// ── Publishing ───────────────────────────────────────────────────

#[tokio::test]
async fn publish_update_republish_changes_cid() {
    let h = harness(true);
    h.memex
        .create_registry(alice(), ProfileSummary::named("Alice"))
        .await
        .unwrap();
    h.memex.update_registry_from_memories().await.unwrap();
    let first = h.memex.publish_registry().await.unwrap().into_value().unwrap();

    h.records.push(public_record("m1"));
    h.records
        .push(MemoryRecord::new("m2", "private", "hidden", alice()).with_content_cid("bafy-m2"));
    let registry = h.memex.update_registry_from_memories().await.unwrap();
    assert_eq!(registry.metadata.total_entries, 1);

    let second = h.memex.publish_registry().await.unwrap().into_value().unwrap();
    assert_ne!(first.cid, second.cid);

    let fetched = Registry::from_bytes(&h.store.get(&second.cid).await.unwrap()).unwrap();
    assert_eq!(fetched.metadata.total_entries, 1);
    assert_eq!(fetched.public_memories[0].id, "m1");
    assert_eq!(
        h.memex.get_stats().registry.last_published_cid,
        Some(second.cid)
    );
}

#[tokio::test]
async fn publish_without_registry_is_an_error() {
    let h = harness(true);
    assert!(matches!(
        h.memex.publish_registry().await,
        Err(SyncError::NotFound(_))
    ));
    assert_eq!(h.memex.get_enhanced_stats().queue_depth, 0);
}

#[tokio::test]
async fn offline_publish_is_queued_once_and_replayed() {
    let h = harness(false);
    h.memex
        .create_registry(alice(), ProfileSummary::named("Alice"))
        .await
        .unwrap();

    let outcome = h.memex.publish_registry().await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Queued {
            reason: "offline".into()
        }
    );
    assert!(h.memex.publish_registry().await.unwrap().is_cached());
    assert_eq!(h.memex.queued_operations().len(), 1);
    assert_eq!(h.store.put_count(), 0);

    h.net.set_online(true);
    let report = h.memex.process_offline_queue().await;
    assert_eq!((report.processed, report.failed), (1, 0));
    assert!(h.memex.registry().unwrap().ipfs_metadata.is_some());
    assert_eq!(h.store.put_count(), 1);
}

#[tokio::test]
async fn gateway_outage_queues_publish() {
    let h = harness(true);
    h.memex
        .create_registry(alice(), ProfileSummary::named("Alice"))
        .await
        .unwrap();
    h.store.set_available(false);

    assert!(h.memex.publish_registry().await.unwrap().is_cached());

    let skipped = h.memex.process_offline_queue().await;
    assert_eq!(skipped.processed, 0);
    assert_eq!(skipped.errors, vec!["gateway unreachable".to_string()]);
    assert_eq!(h.memex.queued_operations()[0].retry_count, 0);

    h.store.set_available(true);
    assert_eq!(h.memex.process_offline_queue().await.processed, 1);
}

#[tokio::test]
async fn update_without_record_source_is_not_found() {
    let memex = Memex::builder(
        MemexConfig::default(),
        Arc::new(MemoryKvStore::new()),
        Arc::new(MemoryContentStore::new()),
        Arc::new(ManualConnectivity::default()),
    )
    .build()
    .unwrap();
    memex
        .create_registry(alice(), ProfileSummary::named("Alice"))
        .await
        .unwrap();
    assert!(matches!(
        memex.update_registry_from_memories().await,
        Err(SyncError::NotFound(_))
    ));
}

// ── Subscribing ──────────────────────────────────────────────────

#[tokio::test]
async fn offline_add_is_replayed_when_back_online() {
    let h = harness(false);
    let cid = seed_remote(&h.store, "Qm123", "bob", &["b1"]);

    let outcome = h.memex.add_subscription(cid.clone(), false).await.unwrap();
    assert_eq!(
        outcome,
        Outcome::Queued {
            reason: "offline".into()
        }
    );
    assert!(h.memex.subscriptions().is_empty());

    h.net.set_online(true);
    let report = h.memex.process_offline_queue().await;
    assert_eq!((report.processed, report.failed), (1, 0));

    let subs = h.memex.subscriptions();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0].registry_cid.as_str(), "Qm123");
    assert_eq!(h.memex.get_enhanced_stats().queue_depth, 0);
}

#[tokio::test]
async fn duplicate_add_is_rejected_even_offline() {
    let h = harness(true);
    let cid = seed_remote(&h.store, "QmBob", "bob", &[]);
    assert!(h.memex.add_subscription(cid.clone(), false).await.unwrap().value().is_some());

    h.net.set_online(false);
    assert!(matches!(
        h.memex.add_subscription(cid, true).await,
        Err(SyncError::DuplicateSubscription(_))
    ));
    assert_eq!(h.memex.subscriptions().len(), 1);
}

#[tokio::test]
async fn queued_add_counts_as_done_if_already_subscribed() {
    let h = harness(false);
    let cid = seed_remote(&h.store, "QmBob", "bob", &[]);
    h.memex.add_subscription(cid.clone(), false).await.unwrap();

    h.net.set_online(true);
    // Subscribed directly before the queue got to it.
    h.memex.add_subscription(cid, false).await.unwrap();
    let report = h.memex.process_offline_queue().await;
    assert_eq!((report.processed, report.failed), (1, 0));
    assert_eq!(h.memex.subscriptions().len(), 1);
}

#[tokio::test]
async fn missing_registry_is_not_queued() {
    let h = harness(true);
    let err = h
        .memex
        .add_subscription(Cid::parse("QmNothing").unwrap(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
    assert_eq!(h.memex.get_enhanced_stats().queue_depth, 0);
}

#[tokio::test]
async fn sync_offline_is_queued_and_remove_drops_it() {
    let h = harness(true);
    let cid = seed_remote(&h.store, "QmBob", "bob", &["b1"]);
    let sub = h
        .memex
        .add_subscription(cid, false)
        .await
        .unwrap()
        .into_value()
        .unwrap();

    h.net.set_online(false);
    assert!(h.memex.sync_subscription(sub.id).await.unwrap().is_cached());
    let queued = h.memex.queued_operations();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind, OperationKind::SyncSubscription);

    h.memex.remove_subscription(sub.id).await.unwrap();
    assert!(h.memex.queued_operations().is_empty());
}

#[tokio::test]
async fn sync_all_requeues_connectivity_failures() {
    let h = harness(true);
    let a = seed_remote(&h.store, "QmA", "a", &["a1"]);
    let b = seed_remote(&h.store, "QmB", "b", &["b1"]);
    h.memex.add_subscription(a, false).await.unwrap();
    h.memex.add_subscription(b, false).await.unwrap();

    let ops = h.memex.sync_all_subscriptions().await.unwrap().into_value().unwrap();
    assert!(ops.iter().all(|op| op.status == OperationStatus::Completed));
    assert_eq!(h.memex.discovered_entries().len(), 2);

    h.store.set_available(false);
    let ops = h.memex.sync_all_subscriptions().await.unwrap().into_value().unwrap();
    assert!(ops.iter().all(|op| op.status == OperationStatus::Failed));
    assert_eq!(h.memex.queued_operations().len(), 2);

    h.store.set_available(true);
    assert_eq!(h.memex.process_offline_queue().await.processed, 2);
}

#[tokio::test]
async fn sync_all_offline_queues_every_enabled_subscription() {
    let h = harness(true);
    let a = seed_remote(&h.store, "QmA", "a", &[]);
    h.memex.add_subscription(a, false).await.unwrap();

    h.net.set_online(false);
    assert!(h.memex.sync_all_subscriptions().await.unwrap().is_cached());
    assert_eq!(h.memex.queued_operations().len(), 1);
}

// ── Conflicts ────────────────────────────────────────────────────

#[tokio::test]
async fn conflicts_are_listed_and_resolved_through_the_facade() {
    let h = harness(true);
    assert!(h.memex.pending_conflicts().is_empty());
    assert!(matches!(
        h.memex
            .resolve_conflict(memex_types::ConflictId::new(), ResolutionChoice::Local, None),
        Err(SyncError::NotFound(_))
    ));
    assert_eq!(h.memex.get_stats().pending_conflicts, 0);
}

// ── Stats and resync ─────────────────────────────────────────────

#[tokio::test]
async fn stats_reflect_state() {
    let h = harness(true);
    let empty = h.memex.get_stats();
    assert!(!empty.registry.has_registry);

    h.memex
        .create_registry(alice(), ProfileSummary::named("Alice"))
        .await
        .unwrap();
    h.records.replace(vec![public_record("m1"), public_record("m2")]);
    h.memex.update_registry_from_memories().await.unwrap();
    let cid = seed_remote(&h.store, "QmBob", "bob", &["b1"]);
    let sub = h.memex.add_subscription(cid, true).await.unwrap().into_value().unwrap();
    h.memex.sync_subscription(sub.id).await.unwrap();

    let stats = h.memex.get_enhanced_stats();
    assert!(stats.base.registry.has_registry);
    assert_eq!(stats.base.registry.total_entries, 2);
    assert_eq!(stats.base.subscriptions.total_subscriptions, 1);
    assert_eq!(stats.base.subscriptions.discovered_entries, 1);
    assert!(stats.online);
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.daemon_state, None);
}

#[tokio::test]
async fn force_resync_republishes_and_syncs_everything() {
    let h = harness(true);
    h.memex
        .create_registry(alice(), ProfileSummary::named("Alice"))
        .await
        .unwrap();
    let cid = seed_remote(&h.store, "QmBob", "bob", &["b1"]);
    let sub = h.memex.add_subscription(cid, true).await.unwrap().into_value().unwrap();
    h.memex.sync_subscription(sub.id).await.unwrap();
    let synced_at = h.memex.subscriptions()[0].last_sync_at.unwrap();

    let report = h.memex.force_resync().await.unwrap();
    assert!(report.publish.unwrap().value().is_some());
    let syncs = report.syncs.into_value().unwrap();
    assert_eq!(syncs.len(), 1);
    assert!(h.memex.subscriptions()[0].last_sync_at.unwrap() >= synced_at);
}

#[tokio::test]
async fn state_survives_restart() {
    let h = harness(false);
    h.memex
        .create_registry(alice(), ProfileSummary::named("Alice"))
        .await
        .unwrap();
    h.memex.publish_registry().await.unwrap();
    let kv = h.kv.clone();
    drop(h.memex);

    let memex = Memex::builder(
        MemexConfig::default(),
        kv,
        h.store.clone(),
        Arc::new(ManualConnectivity::new(true)),
    )
    .build()
    .unwrap();
    assert_eq!(memex.registry().unwrap().owner, alice());
    assert_eq!(memex.queued_operations().len(), 1);
    assert_eq!(memex.process_offline_queue().await.processed, 1);
}

// ── Cross-space ──────────────────────────────────────────────────

#[tokio::test]
async fn cross_space_cycle_through_the_facade() {
    let kv = Arc::new(MemoryKvStore::new());
    let transport = Arc::new(MemorySpaceTransport::new());
    let a = Arc::new(MemorySpace::new("a"));
    let b = Arc::new(MemorySpace::new("b"));
    transport.join(a.clone());
    transport.join(b.clone());
    a.seed(SpaceRecord {
        id: "m1".into(),
        title: "t".into(),
        content: "c".into(),
        timestamp: Timestamp::now(),
        tags: vec![],
        author_id: alice(),
        author_name: Some("Alice".into()),
        visibility: Visibility::Public,
        origin_space_id: None,
        content_digest: None,
    });

    let memex = Memex::builder(
        MemexConfig::default(),
        kv,
        Arc::new(MemoryContentStore::new()),
        Arc::new(ManualConnectivity::default()),
    )
    .spaces(transport)
    .build()
    .unwrap();

    let report = memex.run_cross_space_cycle().await.unwrap();
    assert_eq!(report.propagated, 1);
    assert_eq!(b.records().len(), 1);
    assert_eq!(
        memex.get_enhanced_stats().daemon_state,
        Some(DaemonState::Idle)
    );
}

#[tokio::test]
async fn cross_space_cycle_without_spaces_is_not_found() {
    let h = harness(true);
    assert!(matches!(
        h.memex.run_cross_space_cycle().await,
        Err(SyncError::NotFound(_))
    ));
}

// ── Background work ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn reconnect_drains_queue_in_background() {
    let h = harness(false);
    let cid = seed_remote(&h.store, "Qm123", "bob", &[]);
    h.memex.add_subscription(cid, false).await.unwrap();
    h.memex.start_background();

    h.net.set_online(true);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.memex.subscriptions().len(), 1);
    assert_eq!(h.memex.queued_operations().len(), 0);

    h.memex.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn timer_drains_queue_in_background() {
    let config = MemexConfig {
        queue_retry_interval_secs: 5,
        ..Default::default()
    };
    let h = harness_with(true, config);
    h.memex
        .create_registry(alice(), ProfileSummary::named("Alice"))
        .await
        .unwrap();
    h.store.set_available(false);
    assert!(h.memex.publish_registry().await.unwrap().is_cached());

    h.memex.start_background();
    h.store.set_available(true);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(h.memex.registry().unwrap().ipfs_metadata.is_some());

    h.memex.shutdown().await;
}

#[test]
fn backoff_doubles_up_to_cap() {
    let base = Duration::from_secs(60);
    assert_eq!(backoff_delay(base, 0, 16), base);
    assert_eq!(backoff_delay(base, 1, 16), base * 2);
    assert_eq!(backoff_delay(base, 3, 16), base * 8);
    assert_eq!(backoff_delay(base, 10, 16), base * 16);
    assert_eq!(backoff_delay(base, 200, 16), base * 16);
    assert_eq!(backoff_delay(base, 5, 0), base);
}

#[test]
fn outcome_serializes_with_status_tag() {
    let done: Outcome<u32> = Outcome::Done(7);
    assert_eq!(
        serde_json::to_value(&done).unwrap(),
        serde_json::json!({"status": "done", "value": 7})
    );
    let queued: Outcome<u32> = Outcome::Queued {
        reason: "offline".into(),
    };
    assert_eq!(
        serde_json::to_value(&queued).unwrap(),
        serde_json::json!({"status": "queued", "value": {"reason": "offline"}})
    );
}

use memex_sync::content_store::mock::MemoryContentStore;
use memex_sync::{
    check_reachability, ConnectivityMonitor, ContentStore, ManualConnectivity, SyncError,
};
use memex_types::Cid;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn probe() -> Cid {
    Cid::parse("bafkqaaa").unwrap()
}

#[test]
fn default_monitor_is_online() {
    assert!(ManualConnectivity::default().is_online());
    assert!(!ManualConnectivity::new(false).is_online());
}

#[test]
fn callbacks_fire_only_on_transitions() {
    let monitor = ManualConnectivity::new(true);
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    monitor.on_change(Box::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    monitor.set_online(true);
    assert_eq!(seen.load(Ordering::SeqCst), 0);
    monitor.set_online(false);
    monitor.set_online(false);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    monitor.set_online(true);
    assert_eq!(seen.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn watch_observes_transitions() {
    let monitor = ManualConnectivity::new(false);
    let mut rx = monitor.watch();
    monitor.set_online(true);
    rx.changed().await.unwrap();
    assert!(*rx.borrow());
}

#[tokio::test]
async fn reachability_requires_online_and_gateway() {
    let monitor = ManualConnectivity::new(false);
    let memory = Arc::new(MemoryContentStore::new());
    let store: Arc<dyn ContentStore> = memory.clone();
    let timeout = Duration::from_secs(1);

    assert!(matches!(
        check_reachability(&monitor, &store, &probe(), timeout).await,
        Err(SyncError::Offline)
    ));

    monitor.set_online(true);
    check_reachability(&monitor, &store, &probe(), timeout)
        .await
        .unwrap();

    memory.set_available(false);
    assert!(matches!(
        check_reachability(&monitor, &store, &probe(), timeout).await,
        Err(SyncError::GatewayUnreachable)
    ));
}

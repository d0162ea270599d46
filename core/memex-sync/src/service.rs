//! The service facade.
//!
//! [`Memex`] wires the registry, publisher, subscriptions, offline queue,
//! conflict resolver and cross-space daemon together and exposes the
//! operations an application calls. It is constructed explicitly with its
//! collaborators, so tests can build isolated instances.
//!
//! Network-facing operations are offline-aware: connectivity failures are
//! turned into a queued intent and [`Outcome::Queued`], while failures that
//! retrying would not fix propagate as `Err`.

use crate::config::MemexConfig;
use crate::conflict::{ConflictResolution, ConflictResolver, ResolutionChoice};
use crate::connectivity::{check_reachability, ConnectivityMonitor};
use crate::content_store::ContentStore;
use crate::cross_space::{CrossSpaceSyncDaemon, CycleReport, DaemonState};
use crate::error::{SyncError, SyncResult};
use crate::offline_queue::{OfflineQueue, QueueExecutor, QueueReport};
use crate::publish::{PublishPipeline, PublishReceipt};
use crate::registry::{ProfileSummary, Registry};
use crate::registry_store::RegistryStore;
use crate::safety::{AllowAll, SafetyCheck};
use crate::space::SpaceTransport;
use crate::subscription::{
    DiscoveredEntry, OperationKind, RegistryResolver, RegistrySubscription, SubscriptionManager,
    SubscriptionSettings, SubscriptionStats, SyncOperation,
};
use async_trait::async_trait;
use memex_storage::KeyValueStore;
use memex_types::{Cid, ConflictId, MemoryRecord, SubscriptionId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of an offline-aware operation that did not fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum Outcome<T> {
    /// The operation completed.
    Done(T),
    /// The operation was parked in the offline queue and will run later.
    Queued { reason: String },
}

impl<T> Outcome<T> {
    /// Whether the operation was deferred rather than performed.
    pub fn is_cached(&self) -> bool {
        matches!(self, Outcome::Queued { .. })
    }

    /// The completed value, if any.
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Done(v) => Some(v),
            Outcome::Queued { .. } => None,
        }
    }

    /// Consumes the outcome, returning the completed value if any.
    pub fn into_value(self) -> Option<T> {
        match self {
            Outcome::Done(v) => Some(v),
            Outcome::Queued { .. } => None,
        }
    }
}

/// Supplies the local records a registry is projected from.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Returns candidate records. Filtering for publishability happens in
    /// the registry store.
    async fn public_candidates(&self) -> SyncResult<Vec<MemoryRecord>>;
}

/// A record source holding a fixed, editable list.
#[derive(Debug, Default)]
pub struct StaticRecordSource {
    records: Mutex<Vec<MemoryRecord>>,
}

impl StaticRecordSource {
    /// Creates a source over `records`.
    pub fn new(records: Vec<MemoryRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    /// Appends a record.
    pub fn push(&self, record: MemoryRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }

    /// Replaces all records.
    pub fn replace(&self, records: Vec<MemoryRecord>) {
        if let Ok(mut current) = self.records.lock() {
            *current = records;
        }
    }
}

#[async_trait]
impl RecordSource for StaticRecordSource {
    async fn public_candidates(&self) -> SyncResult<Vec<MemoryRecord>> {
        Ok(self.records.lock().map(|r| r.clone()).unwrap_or_default())
    }
}

/// Registry-side summary numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub has_registry: bool,
    pub total_entries: usize,
    pub total_size: u64,
    pub updated: Option<Timestamp>,
    pub last_published_cid: Option<Cid>,
    pub last_published_at: Option<Timestamp>,
}

/// Summary returned by [`Memex::get_stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemexStats {
    pub registry: RegistryStats,
    pub subscriptions: SubscriptionStats,
    pub pending_conflicts: usize,
}

/// Summary returned by [`Memex::get_enhanced_stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedStats {
    #[serde(flatten)]
    pub base: MemexStats,
    pub online: bool,
    pub queue_depth: usize,
    pub daemon_state: Option<DaemonState>,
}

/// What [`Memex::force_resync`] did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncReport {
    /// `None` when there is no registry to publish.
    pub publish: Option<Outcome<PublishReceipt>>,
    pub syncs: Outcome<Vec<SyncOperation>>,
}

/// Builds a [`Memex`] from its collaborators.
pub struct MemexBuilder {
    config: MemexConfig,
    kv: Arc<dyn KeyValueStore>,
    store: Arc<dyn ContentStore>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    records: Option<Arc<dyn RecordSource>>,
    spaces: Option<Arc<dyn SpaceTransport>>,
    safety: Arc<dyn SafetyCheck>,
    resolver: Option<Arc<dyn RegistryResolver>>,
}

impl MemexBuilder {
    /// Sets the source of local records.
    pub fn records(mut self, records: Arc<dyn RecordSource>) -> Self {
        self.records = Some(records);
        self
    }

    /// Enables the cross-space daemon over `spaces`.
    pub fn spaces(mut self, spaces: Arc<dyn SpaceTransport>) -> Self {
        self.spaces = Some(spaces);
        self
    }

    /// Sets the safety check for foreign content.
    pub fn safety(mut self, safety: Arc<dyn SafetyCheck>) -> Self {
        self.safety = safety;
        self
    }

    /// Sets the resolver for remote registries' current CIDs.
    pub fn resolver(mut self, resolver: Arc<dyn RegistryResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Opens every component, loading persisted state.
    pub fn build(self) -> SyncResult<Memex> {
        let config = self.config;
        let timeout = config.request_timeout();
        let probe_cid = Cid::parse(&config.gateway_probe_cid).map_err(|e| {
            SyncError::InvalidRegistry(format!("bad gateway probe cid: {e}"))
        })?;

        let registry = Arc::new(RegistryStore::open(
            self.kv.clone(),
            config.anonymize_authors,
        )?);
        let publisher = PublishPipeline::new(registry.clone(), self.store.clone(), timeout);
        let conflicts = Arc::new(ConflictResolver::open(self.kv.clone())?);
        let mut subscriptions = SubscriptionManager::open(
            self.kv.clone(),
            self.store.clone(),
            conflicts.clone(),
            self.safety.clone(),
            timeout,
        )?;
        if let Some(resolver) = self.resolver {
            subscriptions = subscriptions.with_resolver(resolver);
        }
        let queue = OfflineQueue::open(self.kv.clone(), config.max_retries)?;
        let daemon = self.spaces.map(|spaces| {
            CrossSpaceSyncDaemon::new(
                spaces,
                self.safety.clone(),
                config.cross_space_interval(),
                timeout,
            )
        });

        let (shutdown, _) = watch::channel(false);
        Ok(Memex {
            inner: Arc::new(MemexInner {
                config,
                probe_cid,
                store: self.store,
                connectivity: self.connectivity,
                records: self.records,
                registry,
                publisher,
                subscriptions,
                queue,
                conflicts,
                daemon,
            }),
            shutdown,
            retry_task: Mutex::new(None),
        })
    }
}

struct MemexInner {
    config: MemexConfig,
    probe_cid: Cid,
    store: Arc<dyn ContentStore>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    records: Option<Arc<dyn RecordSource>>,
    registry: Arc<RegistryStore>,
    publisher: PublishPipeline,
    subscriptions: SubscriptionManager,
    queue: OfflineQueue,
    conflicts: Arc<ConflictResolver>,
    daemon: Option<CrossSpaceSyncDaemon>,
}

/// The registry publishing and subscription service.
pub struct Memex {
    inner: Arc<MemexInner>,
    shutdown: watch::Sender<bool>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
}

impl Memex {
    /// Starts building a service.
    pub fn builder(
        config: MemexConfig,
        kv: Arc<dyn KeyValueStore>,
        store: Arc<dyn ContentStore>,
        connectivity: Arc<dyn ConnectivityMonitor>,
    ) -> MemexBuilder {
        MemexBuilder {
            config,
            kv,
            store,
            connectivity,
            records: None,
            spaces: None,
            safety: Arc::new(AllowAll),
            resolver: None,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &MemexConfig {
        &self.inner.config
    }

    // ── Registry ─────────────────────────────────────────────────

    /// Creates the local registry. Idempotent per user.
    pub async fn create_registry(
        &self,
        owner: UserId,
        profile: ProfileSummary,
    ) -> SyncResult<Registry> {
        self.inner.registry.create(owner, profile).await
    }

    /// The last persisted registry.
    pub fn registry(&self) -> Option<Registry> {
        self.inner.registry.current()
    }

    /// Updates the embedded profile summary.
    pub async fn update_profile(&self, profile: ProfileSummary) -> SyncResult<Registry> {
        self.inner.registry.update_profile(profile).await
    }

    /// Re-projects the registry from the record source.
    pub async fn update_registry_from_memories(&self) -> SyncResult<Registry> {
        let source = self
            .inner
            .records
            .as_ref()
            .ok_or_else(|| SyncError::NotFound("no record source configured".into()))?;
        let records = source.public_candidates().await?;
        self.inner.registry.project_from_records(&records).await
    }

    /// Publishes the registry, or queues the publish if the network or
    /// content store is unavailable.
    pub async fn publish_registry(&self) -> SyncResult<Outcome<PublishReceipt>> {
        self.inner.publish_registry().await
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Subscribes to the registry at `cid`, or queues the subscription if
    /// the registry cannot be fetched right now.
    pub async fn add_subscription(
        &self,
        cid: Cid,
        auto_sync: bool,
    ) -> SyncResult<Outcome<RegistrySubscription>> {
        let inner = &self.inner;
        if inner.subscriptions.is_subscribed(&cid) {
            return Err(SyncError::DuplicateSubscription(cid));
        }
        if !inner.connectivity.is_online() {
            return inner.defer_add(cid, auto_sync, &SyncError::Offline);
        }
        match inner.subscriptions.add_subscription(cid.clone(), auto_sync).await {
            Ok(sub) => Ok(Outcome::Done(sub)),
            Err(e) if e.is_deferrable() => inner.defer_add(cid, auto_sync, &e),
            Err(e) => Err(e),
        }
    }

    /// Unsubscribes and drops any queued sync for the subscription.
    pub async fn remove_subscription(&self, id: SubscriptionId) -> SyncResult<()> {
        self.inner.subscriptions.remove_subscription(id).await?;
        self.inner.queue.remove_sync(id)?;
        Ok(())
    }

    /// All subscriptions in list order.
    pub fn subscriptions(&self) -> Vec<RegistrySubscription> {
        self.inner.subscriptions.subscriptions()
    }

    /// Edits a subscription's settings.
    pub async fn update_subscription_settings(
        &self,
        id: SubscriptionId,
        settings: SubscriptionSettings,
    ) -> SyncResult<RegistrySubscription> {
        self.inner.subscriptions.update_settings(id, settings).await
    }

    /// Entries discovered through subscriptions.
    pub fn discovered_entries(&self) -> Vec<DiscoveredEntry> {
        self.inner.subscriptions.discovered_entries()
    }

    /// Syncs one subscription, or queues the sync if offline.
    pub async fn sync_subscription(&self, id: SubscriptionId) -> SyncResult<Outcome<SyncOperation>> {
        self.inner.sync_subscription(id).await
    }

    /// Syncs every enabled subscription. Subscriptions that fail for
    /// connectivity reasons get a queued sync.
    pub async fn sync_all_subscriptions(&self) -> SyncResult<Outcome<Vec<SyncOperation>>> {
        self.inner.sync_all_subscriptions().await
    }

    // ── Conflicts ────────────────────────────────────────────────

    /// Conflicts awaiting a manual decision.
    pub fn pending_conflicts(&self) -> Vec<ConflictResolution> {
        self.inner.conflicts.pending_conflicts()
    }

    /// Settles a pending conflict.
    pub fn resolve_conflict(
        &self,
        id: ConflictId,
        choice: ResolutionChoice,
        custom: Option<Value>,
    ) -> SyncResult<ConflictResolution> {
        self.inner.conflicts.resolve_conflict(id, choice, custom)
    }

    // ── Offline queue and stats ──────────────────────────────────

    /// Drains the offline queue if online and the gateway answers.
    pub async fn process_offline_queue(&self) -> QueueReport {
        self.inner.process_queue().await
    }

    /// Queued operations in processing order.
    pub fn queued_operations(&self) -> Vec<SyncOperation> {
        self.inner.queue.pending()
    }

    /// Registry, subscription and conflict counts.
    pub fn get_stats(&self) -> MemexStats {
        self.inner.stats()
    }

    /// [`get_stats`](Self::get_stats) plus connectivity, queue depth and
    /// daemon state.
    pub fn get_enhanced_stats(&self) -> EnhancedStats {
        let inner = &self.inner;
        EnhancedStats {
            base: inner.stats(),
            online: inner.connectivity.is_online(),
            queue_depth: inner.queue.depth(),
            daemon_state: inner.daemon.as_ref().map(CrossSpaceSyncDaemon::state),
        }
    }

    /// Marks every subscription as never synced, republishes, and syncs
    /// everything.
    pub async fn force_resync(&self) -> SyncResult<ResyncReport> {
        let inner = &self.inner;
        info!("Forcing full resync");
        inner.subscriptions.reset_sync_times().await?;
        let publish = if inner.registry.current().is_some() {
            Some(inner.publish_registry().await?)
        } else {
            None
        };
        let syncs = inner.sync_all_subscriptions().await?;
        Ok(ResyncReport { publish, syncs })
    }

    // ── Cross-space ──────────────────────────────────────────────

    /// Runs one cross-space cycle now.
    pub async fn run_cross_space_cycle(&self) -> SyncResult<CycleReport> {
        match &self.inner.daemon {
            Some(daemon) => daemon.run_cycle().await,
            None => Err(SyncError::NotFound("no space transport configured".into())),
        }
    }

    /// The cross-space daemon, if spaces were configured.
    pub fn cross_space(&self) -> Option<&CrossSpaceSyncDaemon> {
        self.inner.daemon.as_ref()
    }

    // ── Background work ──────────────────────────────────────────

    /// Starts the cross-space daemon and the offline retry loop. Must be
    /// called inside a Tokio runtime. Calling it twice has no effect.
    pub fn start_background(&self) {
        let Ok(mut task) = self.retry_task.lock() else {
            return;
        };
        if task.is_some() || *self.shutdown.borrow() {
            return;
        }
        if let Some(daemon) = &self.inner.daemon {
            daemon.initialize();
        }

        let reconnected = Arc::new(Notify::new());
        let notify = reconnected.clone();
        self.inner.connectivity.on_change(Box::new(move |online| {
            if online {
                notify.notify_one();
            }
        }));

        let inner = self.inner.clone();
        let shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(retry_loop(inner, reconnected, shutdown)));
        info!("Background sync started");
    }

    /// Stops background work. In-flight operations finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(daemon) = &self.inner.daemon {
            daemon.stop_and_wait().await;
        }
        let handle = self.retry_task.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Background sync stopped");
    }
}

impl Drop for Memex {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Drains the queue on a timer and on reconnect, backing off while drains
/// keep failing, and runs auto-syncs that are due.
async fn retry_loop(
    inner: Arc<MemexInner>,
    reconnected: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let base = inner.config.queue_retry_interval();
    let max_multiplier = inner.config.max_backoff_multiplier;
    let mut failures = 0u32;

    loop {
        let delay = backoff_delay(base, failures, max_multiplier);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = reconnected.notified() => {
                debug!("Reconnected, draining offline queue");
                failures = 0;
            }
            _ = shutdown.changed() => break,
        }

        let report = inner.process_queue().await;
        let due = inner.subscriptions.due_subscriptions(Timestamp::now());
        for id in due {
            if let Err(e) = inner.sync_subscription(id).await {
                warn!("Auto-sync of {} failed: {}", id, e);
            }
        }

        if report.failed > 0 || (report.processed == 0 && !report.errors.is_empty()) {
            failures = failures.saturating_add(1);
            debug!("Queue drain failed {} times in a row", failures);
        } else {
            failures = 0;
        }
    }
}

impl MemexInner {
    async fn publish_registry(&self) -> SyncResult<Outcome<PublishReceipt>> {
        self.registry.require()?;
        if !self.connectivity.is_online() {
            return self.defer_publish(&SyncError::Offline);
        }
        match self.publisher.publish().await {
            Ok(receipt) => Ok(Outcome::Done(receipt)),
            Err(e) if e.is_deferrable() => self.defer_publish(&e),
            Err(e) => Err(e),
        }
    }

    async fn sync_subscription(&self, id: SubscriptionId) -> SyncResult<Outcome<SyncOperation>> {
        if self.subscriptions.get(id).is_none() {
            return Err(SyncError::NotFound(format!("subscription {id}")));
        }
        if !self.connectivity.is_online() {
            return self.defer_sync(id, &SyncError::Offline);
        }
        let op = SyncOperation::new(OperationKind::SyncSubscription, id.to_string());
        match self.subscriptions.try_sync_subscription(id).await {
            Ok(merged) => Ok(Outcome::Done(op.completed(merged))),
            Err(e) if e.is_deferrable() => self.defer_sync(id, &e),
            Err(e) => Err(e),
        }
    }

    async fn sync_all_subscriptions(&self) -> SyncResult<Outcome<Vec<SyncOperation>>> {
        if !self.connectivity.is_online() {
            let enabled: Vec<SubscriptionId> = self
                .subscriptions
                .subscriptions()
                .into_iter()
                .filter(|s| s.sync_enabled)
                .map(|s| s.id)
                .collect();
            for id in enabled {
                self.queue.enqueue_sync(id)?;
            }
            return Ok(Outcome::Queued {
                reason: SyncError::Offline.reason(),
            });
        }

        let results = self.subscriptions.sync_all_detailed().await;
        let mut ops = Vec::with_capacity(results.len());
        for (id, op, error) in results {
            if error.as_ref().is_some_and(SyncError::is_deferrable) {
                self.queue.enqueue_sync(id)?;
            }
            ops.push(op);
        }
        Ok(Outcome::Done(ops))
    }

    async fn process_queue(&self) -> QueueReport {
        let gate = check_reachability(
            self.connectivity.as_ref(),
            &self.store,
            &self.probe_cid,
            self.config.request_timeout(),
        )
        .await;
        self.queue.process(self, gate).await
    }

    fn defer_publish<T>(&self, cause: &SyncError) -> SyncResult<Outcome<T>> {
        if self.queue.enqueue_publish()? {
            info!("Queued registry publish: {}", cause);
        }
        Ok(Outcome::Queued {
            reason: cause.reason(),
        })
    }

    fn defer_sync<T>(&self, id: SubscriptionId, cause: &SyncError) -> SyncResult<Outcome<T>> {
        if self.queue.enqueue_sync(id)? {
            info!("Queued sync of subscription {}: {}", id, cause);
        }
        Ok(Outcome::Queued {
            reason: cause.reason(),
        })
    }

    fn defer_add<T>(&self, cid: Cid, auto_sync: bool, cause: &SyncError) -> SyncResult<Outcome<T>> {
        let target = cid.to_string();
        if self.queue.enqueue_add(cid, auto_sync)? {
            info!("Queued subscription to {}: {}", target, cause);
        }
        Ok(Outcome::Queued {
            reason: cause.reason(),
        })
    }

    fn stats(&self) -> MemexStats {
        let registry = match self.registry.current() {
            Some(r) => RegistryStats {
                has_registry: true,
                total_entries: r.metadata.total_entries,
                total_size: r.metadata.total_size,
                updated: Some(r.metadata.updated),
                last_published_cid: r.ipfs_metadata.as_ref().map(|m| m.cid.clone()),
                last_published_at: r.ipfs_metadata.as_ref().map(|m| m.published_at),
            },
            None => RegistryStats::default(),
        };
        MemexStats {
            registry,
            subscriptions: self.subscriptions.stats(),
            pending_conflicts: self.conflicts.pending_count(),
        }
    }
}

#[async_trait]
impl QueueExecutor for MemexInner {
    async fn execute_publish(&self) -> SyncResult<()> {
        self.publisher.publish().await.map(|_| ())
    }

    async fn execute_sync(&self, id: SubscriptionId) -> SyncResult<()> {
        self.subscriptions.try_sync_subscription(id).await.map(|_| ())
    }

    async fn execute_add(&self, cid: Cid, auto_sync: bool) -> SyncResult<()> {
        match self.subscriptions.add_subscription(cid, auto_sync).await {
            Ok(_) => Ok(()),
            // Subscribed in the meantime: the intent is satisfied.
            Err(SyncError::DuplicateSubscription(cid)) => {
                debug!("Queued subscription to {} already exists", cid);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Backoff delay after `failures` consecutive failed drains.
pub fn backoff_delay(base: Duration, failures: u32, max_multiplier: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures).min(max_multiplier.max(1));
    base * factor
}

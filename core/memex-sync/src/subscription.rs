//! Subscriptions to other users' registries.
//!
//! A subscription is a standing reference to a remote registry CID. Syncing
//! a subscription fetches the registry, diffs its entries by id against the
//! local discovery index, inserts what is new and routes what changed
//! through the [`ConflictResolver`].
//!
//! Syncs for the same subscription are serialized; syncs for different
//! subscriptions run concurrently.

use crate::conflict::ConflictResolver;
use crate::content_store::{with_timeout, ContentStore};
use crate::error::{SyncError, SyncResult};
use crate::registry::{Registry, RegistryEntry};
use crate::safety::SafetyCheck;
use async_trait::async_trait;
use memex_storage::{keys, KeyValueStore, KeyValueStoreExt};
use memex_types::{Cid, OperationId, SubscriptionId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often an auto-sync subscription wants to be refreshed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncFrequency {
    #[default]
    Manual,
    Hourly,
    Daily,
}

impl SyncFrequency {
    /// The refresh interval, or `None` for manual.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            SyncFrequency::Manual => None,
            SyncFrequency::Hourly => Some(Duration::from_secs(60 * 60)),
            SyncFrequency::Daily => Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

/// A followed remote registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySubscription {
    pub id: SubscriptionId,
    pub registry_id: String,
    pub user_id: UserId,
    /// CID the registry was last fetched from.
    pub registry_cid: Cid,
    pub display_name: String,
    pub subscribed_at: Timestamp,
    pub sync_enabled: bool,
    pub auto_sync: bool,
    pub sync_frequency: SyncFrequency,
    pub last_sync_at: Option<Timestamp>,
    /// Tags of the remote registry as of the last fetch.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl RegistrySubscription {
    /// Whether an auto-sync is due at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        if !self.sync_enabled || !self.auto_sync {
            return false;
        }
        let Some(interval) = self.sync_frequency.interval() else {
            return false;
        };
        match self.last_sync_at {
            Some(last) => now.since(last) >= interval,
            None => true,
        }
    }
}

/// Editable subscription settings. `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSettings {
    pub sync_enabled: Option<bool>,
    pub auto_sync: Option<bool>,
    pub sync_frequency: Option<SyncFrequency>,
    pub display_name: Option<String>,
}

/// Kind of deferred or tracked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    PublishRegistry,
    SyncSubscription,
    AddSubscription,
}

/// Lifecycle of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
}

/// A sync, publish or subscribe attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    /// Subscription id, registry CID, or registry id depending on `kind`.
    pub target: String,
    pub created_at: Timestamp,
    pub retry_count: u32,
    pub status: OperationStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Entries inserted or replaced by a completed sync.
    #[serde(default)]
    pub entries_merged: usize,
}

impl SyncOperation {
    /// Creates a pending operation.
    pub fn new(kind: OperationKind, target: impl Into<String>) -> Self {
        Self {
            id: OperationId::new(),
            kind,
            target: target.into(),
            created_at: Timestamp::now(),
            retry_count: 0,
            status: OperationStatus::Pending,
            last_error: None,
            entries_merged: 0,
        }
    }

    pub(crate) fn completed(mut self, entries_merged: usize) -> Self {
        self.status = OperationStatus::Completed;
        self.entries_merged = entries_merged;
        self
    }

    pub(crate) fn failed(mut self, error: &SyncError) -> Self {
        self.status = OperationStatus::Failed;
        self.last_error = Some(error.to_string());
        self
    }
}

/// An entry found through a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredEntry {
    pub entry: RegistryEntry,
    pub subscription_id: SubscriptionId,
    pub discovered_at: Timestamp,
}

/// Resolves the latest CID of a remote registry (a mutable name pointing at
/// immutable content). Without a resolver the stored CID is used.
#[async_trait]
pub trait RegistryResolver: Send + Sync {
    /// Returns the newest known CID for `subscription`, if any.
    async fn resolve(&self, subscription: &RegistrySubscription) -> SyncResult<Option<Cid>>;
}

/// Summary numbers for the subscription side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStats {
    pub total_subscriptions: usize,
    pub enabled_subscriptions: usize,
    pub discovered_entries: usize,
    pub last_sync_at: Option<Timestamp>,
}

/// Tracks subscriptions and the discovery index.
pub struct SubscriptionManager {
    kv: Arc<dyn KeyValueStore>,
    store: Arc<dyn ContentStore>,
    conflicts: Arc<ConflictResolver>,
    safety: Arc<dyn SafetyCheck>,
    resolver: Option<Arc<dyn RegistryResolver>>,
    timeout: Duration,
    subscriptions: RwLock<Vec<RegistrySubscription>>,
    discovery: RwLock<HashMap<String, DiscoveredEntry>>,
    /// Serializes read-modify-persist cycles on the discovery index.
    discovery_writer: Mutex<()>,
    /// Serializes list mutations (add/remove/settings) with persistence.
    list_writer: tokio::sync::Mutex<()>,
    /// One lock per subscription id, held for the duration of a sync.
    sync_locks: Mutex<HashMap<SubscriptionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SubscriptionManager {
    /// Opens the manager, loading persisted subscriptions and discoveries.
    pub fn open(
        kv: Arc<dyn KeyValueStore>,
        store: Arc<dyn ContentStore>,
        conflicts: Arc<ConflictResolver>,
        safety: Arc<dyn SafetyCheck>,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let subscriptions: Vec<RegistrySubscription> =
            kv.load(keys::SUBSCRIPTIONS)?.unwrap_or_default();
        let discovered: Vec<DiscoveredEntry> = kv.load(keys::DISCOVERY)?.unwrap_or_default();
        debug!(
            "Loaded {} subscriptions and {} discovered entries",
            subscriptions.len(),
            discovered.len()
        );
        Ok(Self {
            kv,
            store,
            conflicts,
            safety,
            resolver: None,
            timeout,
            subscriptions: RwLock::new(subscriptions),
            discovery: RwLock::new(
                discovered
                    .into_iter()
                    .map(|d| (d.entry.id.clone(), d))
                    .collect(),
            ),
            discovery_writer: Mutex::new(()),
            list_writer: tokio::sync::Mutex::new(()),
            sync_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Sets the resolver used to find a registry's current CID.
    pub fn with_resolver(mut self, resolver: Arc<dyn RegistryResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Snapshot of all subscriptions in list order.
    pub fn subscriptions(&self) -> Vec<RegistrySubscription> {
        self.subscriptions
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Looks up a subscription by id.
    pub fn get(&self, id: SubscriptionId) -> Option<RegistrySubscription> {
        self.subscriptions
            .read()
            .ok()?
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    /// Whether `cid` is already subscribed.
    pub fn is_subscribed(&self, cid: &Cid) -> bool {
        self.subscriptions
            .read()
            .map(|s| s.iter().any(|sub| &sub.registry_cid == cid))
            .unwrap_or(false)
    }

    /// Whether the registry with `registry_id` is already followed, under
    /// any CID.
    pub fn follows_registry(&self, registry_id: &str) -> bool {
        self.subscriptions
            .read()
            .map(|s| s.iter().any(|sub| sub.registry_id == registry_id))
            .unwrap_or(false)
    }

    /// Snapshot of discovered entries, sorted by entry id.
    pub fn discovered_entries(&self) -> Vec<DiscoveredEntry> {
        let mut entries: Vec<DiscoveredEntry> = self
            .discovery
            .read()
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.entry.id.cmp(&b.entry.id));
        entries
    }

    /// Subscriptions whose auto-sync interval has elapsed at `now`.
    pub fn due_subscriptions(&self, now: Timestamp) -> Vec<SubscriptionId> {
        self.subscriptions()
            .into_iter()
            .filter(|s| s.is_due(now))
            .map(|s| s.id)
            .collect()
    }

    /// Summary counts.
    pub fn stats(&self) -> SubscriptionStats {
        let subscriptions = self.subscriptions();
        SubscriptionStats {
            total_subscriptions: subscriptions.len(),
            enabled_subscriptions: subscriptions.iter().filter(|s| s.sync_enabled).count(),
            discovered_entries: self.discovery.read().map(|d| d.len()).unwrap_or(0),
            last_sync_at: subscriptions.iter().filter_map(|s| s.last_sync_at).max(),
        }
    }

    /// Subscribes to the registry stored at `cid`.
    ///
    /// Fails with `DuplicateSubscription` if `cid` is already followed, or if
    /// the registry it holds is followed under an older CID; the list is
    /// unchanged in that case.
    pub async fn add_subscription(
        &self,
        cid: Cid,
        auto_sync: bool,
    ) -> SyncResult<RegistrySubscription> {
        if self.is_subscribed(&cid) {
            return Err(SyncError::DuplicateSubscription(cid));
        }

        let registry = self.fetch_registry(&cid).await?;

        let _guard = self.list_writer.lock().await;
        // Re-check: another add may have finished while we were fetching.
        if self.is_subscribed(&cid) || self.follows_registry(&registry.id()) {
            return Err(SyncError::DuplicateSubscription(cid));
        }

        let subscription = RegistrySubscription {
            id: SubscriptionId::new(),
            registry_id: registry.id(),
            user_id: registry.owner.clone(),
            registry_cid: cid,
            display_name: registry.profile.display_name.clone(),
            subscribed_at: Timestamp::now(),
            sync_enabled: true,
            auto_sync,
            sync_frequency: if auto_sync {
                SyncFrequency::Daily
            } else {
                SyncFrequency::Manual
            },
            last_sync_at: None,
            tags: registry.metadata.tags.clone(),
        };

        let mut next = self.subscriptions();
        next.push(subscription.clone());
        self.commit_subscriptions(next)?;

        info!(
            "Subscribed to {} ({}) at {}",
            subscription.display_name, subscription.registry_id, subscription.registry_cid
        );
        Ok(subscription)
    }

    /// Unsubscribes and forgets everything discovered through it.
    pub async fn remove_subscription(&self, id: SubscriptionId) -> SyncResult<()> {
        let lock = self.sync_lock(id);
        let _sync = lock.lock().await;
        let _guard = self.list_writer.lock().await;

        let mut next = self.subscriptions();
        let before = next.len();
        next.retain(|s| s.id != id);
        if next.len() == before {
            return Err(SyncError::NotFound(format!("subscription {id}")));
        }
        self.commit_subscriptions(next)?;

        let _index = self.lock_discovery()?;
        let mut discovery = self.snapshot_discovery();
        discovery.retain(|_, d| d.subscription_id != id);
        self.commit_discovery(discovery)?;

        if let Ok(mut locks) = self.sync_locks.lock() {
            locks.remove(&id);
        }
        info!("Removed subscription {}", id);
        Ok(())
    }

    /// Edits a subscription's settings.
    pub async fn update_settings(
        &self,
        id: SubscriptionId,
        settings: SubscriptionSettings,
    ) -> SyncResult<RegistrySubscription> {
        self.modify(id, |s| {
            if let Some(enabled) = settings.sync_enabled {
                s.sync_enabled = enabled;
            }
            if let Some(auto) = settings.auto_sync {
                s.auto_sync = auto;
            }
            if let Some(frequency) = settings.sync_frequency {
                s.sync_frequency = frequency;
            }
            if let Some(name) = &settings.display_name {
                s.display_name = name.clone();
            }
        })
        .await
    }

    /// Clears `last_sync_at` on every subscription so all are due again.
    pub async fn reset_sync_times(&self) -> SyncResult<()> {
        let _guard = self.list_writer.lock().await;
        let mut next = self.subscriptions();
        for sub in &mut next {
            sub.last_sync_at = None;
        }
        self.commit_subscriptions(next)
    }

    /// Syncs one subscription.
    ///
    /// Returns `Err` only for an unknown id. Fetch and merge failures come
    /// back as a `Failed` operation carrying the error text; callers that
    /// need the typed error use [`try_sync_subscription`](Self::try_sync_subscription).
    pub async fn sync_subscription(&self, id: SubscriptionId) -> SyncResult<SyncOperation> {
        if self.get(id).is_none() {
            return Err(SyncError::NotFound(format!("subscription {id}")));
        }
        let op = SyncOperation::new(OperationKind::SyncSubscription, id.to_string());
        Ok(match self.try_sync_subscription(id).await {
            Ok(merged) => op.completed(merged),
            Err(e) => {
                warn!("Sync of subscription {} failed: {}", id, e);
                op.failed(&e)
            }
        })
    }

    /// Syncs every enabled subscription.
    ///
    /// Fetches run concurrently; the returned operations follow subscription
    /// list order. A failing subscription yields a `Failed` operation and
    /// does not stop the rest.
    pub async fn sync_all_subscriptions(&self) -> Vec<SyncOperation> {
        self.sync_all_detailed()
            .await
            .into_iter()
            .map(|(_, op, _)| op)
            .collect()
    }

    /// Like [`sync_all_subscriptions`](Self::sync_all_subscriptions), also
    /// returning each subscription id and the typed error of a failed sync.
    pub(crate) async fn sync_all_detailed(
        &self,
    ) -> Vec<(SubscriptionId, SyncOperation, Option<SyncError>)> {
        let enabled: Vec<SubscriptionId> = self
            .subscriptions()
            .into_iter()
            .filter(|s| s.sync_enabled)
            .map(|s| s.id)
            .collect();
        debug!("Syncing {} enabled subscriptions", enabled.len());

        let syncs = enabled.into_iter().map(|id| async move {
            let op = SyncOperation::new(OperationKind::SyncSubscription, id.to_string());
            match self.try_sync_subscription(id).await {
                Ok(merged) => (id, op.completed(merged), None),
                Err(e) => {
                    warn!("Sync of subscription {} failed: {}", id, e);
                    (id, op.failed(&e), Some(e))
                }
            }
        });
        futures::future::join_all(syncs).await
    }

    /// Syncs one subscription and returns the number of entries merged.
    pub async fn try_sync_subscription(&self, id: SubscriptionId) -> SyncResult<usize> {
        let lock = self.sync_lock(id);
        let _sync = lock.lock().await;

        let subscription = self
            .get(id)
            .ok_or_else(|| SyncError::NotFound(format!("subscription {id}")))?;

        let cid = self.current_cid(&subscription).await;
        let registry = self.fetch_registry(&cid).await?;
        if registry.owner != subscription.user_id {
            warn!(
                "Registry at {} is owned by {}, expected {}",
                cid, registry.owner, subscription.user_id
            );
        }

        let merged = self.merge_entries(id, &registry.public_memories)?;

        let tags = registry.metadata.tags.clone();
        self.modify(id, move |s| {
            s.registry_cid = cid;
            s.last_sync_at = Some(Timestamp::now());
            s.tags = tags;
        })
        .await?;

        info!(
            "Synced subscription {}: {} of {} entries merged",
            id,
            merged,
            registry.public_memories.len()
        );
        Ok(merged)
    }

    async fn current_cid(&self, subscription: &RegistrySubscription) -> Cid {
        let Some(resolver) = &self.resolver else {
            return subscription.registry_cid.clone();
        };
        match with_timeout(self.timeout, resolver.resolve(subscription)).await {
            Ok(Some(cid)) => {
                if cid != subscription.registry_cid {
                    debug!(
                        "Registry {} moved from {} to {}",
                        subscription.registry_id, subscription.registry_cid, cid
                    );
                }
                cid
            }
            Ok(None) => subscription.registry_cid.clone(),
            Err(e) => {
                debug!("Resolver failed for {}, using stored CID: {}", subscription.id, e);
                subscription.registry_cid.clone()
            }
        }
    }

    async fn fetch_registry(&self, cid: &Cid) -> SyncResult<Registry> {
        let bytes = with_timeout(self.timeout, self.store.get(cid)).await?;
        Registry::from_bytes(&bytes)
    }

    /// Diffs remote entries against the index. New ids are inserted and
    /// identical entries skipped. A changed entry first seen through this
    /// same subscription is replaced outright, since the registry is the
    /// authority on its own entries; one held by another subscription is
    /// reconciled.
    fn merge_entries(&self, id: SubscriptionId, remote: &[RegistryEntry]) -> SyncResult<usize> {
        let _index = self.lock_discovery()?;
        let mut discovery = self.snapshot_discovery();
        let mut merged = 0;

        for entry in remote {
            let verdict = self.safety.check_entry(entry);
            if !verdict.is_allowed() {
                debug!("Safety check rejected entry {}: {:?}", entry.id, verdict);
                continue;
            }

            let incoming = match discovery.get(&entry.id) {
                None => Some(entry.clone()),
                Some(existing) if existing.entry == *entry => None,
                Some(existing) if existing.subscription_id == id => Some(entry.clone()),
                Some(existing) => self.reconcile(&existing.entry, entry)?,
            };

            if let Some(next) = incoming {
                discovery.insert(
                    next.id.clone(),
                    DiscoveredEntry {
                        entry: next,
                        subscription_id: id,
                        discovered_at: Timestamp::now(),
                    },
                );
                merged += 1;
            }
        }

        if merged > 0 {
            self.commit_discovery(discovery)?;
        }
        Ok(merged)
    }

    /// Returns the entry to store, or `None` to keep the existing one.
    fn reconcile(
        &self,
        local: &RegistryEntry,
        remote: &RegistryEntry,
    ) -> SyncResult<Option<RegistryEntry>> {
        let resolution = self.conflicts.detect_and_resolve(
            local.id.clone(),
            serde_json::to_value(local)?,
            serde_json::to_value(remote)?,
        )?;
        let Some(resolved) = resolution.resolved else {
            return Ok(None);
        };
        match serde_json::from_value::<RegistryEntry>(resolved) {
            Ok(entry) if entry == *local => Ok(None),
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!("Merged entry {} is malformed, keeping local: {}", local.id, e);
                Ok(None)
            }
        }
    }

    async fn modify<F>(&self, id: SubscriptionId, edit: F) -> SyncResult<RegistrySubscription>
    where
        F: FnOnce(&mut RegistrySubscription),
    {
        let _guard = self.list_writer.lock().await;
        let mut next = self.subscriptions();
        let sub = next
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| SyncError::NotFound(format!("subscription {id}")))?;
        edit(sub);
        let updated = sub.clone();
        self.commit_subscriptions(next)?;
        Ok(updated)
    }

    fn sync_lock(&self, id: SubscriptionId) -> Arc<tokio::sync::Mutex<()>> {
        match self.sync_locks.lock() {
            Ok(mut locks) => locks.entry(id).or_default().clone(),
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn lock_discovery(&self) -> SyncResult<std::sync::MutexGuard<'_, ()>> {
        self.discovery_writer
            .lock()
            .map_err(|_| SyncError::PersistenceFailure("discovery lock poisoned".into()))
    }

    fn snapshot_discovery(&self) -> HashMap<String, DiscoveredEntry> {
        self.discovery.read().map(|d| d.clone()).unwrap_or_default()
    }

    fn commit_subscriptions(&self, next: Vec<RegistrySubscription>) -> SyncResult<()> {
        self.kv.save(keys::SUBSCRIPTIONS, &next)?;
        if let Ok(mut subscriptions) = self.subscriptions.write() {
            *subscriptions = next;
        }
        Ok(())
    }

    fn commit_discovery(&self, next: HashMap<String, DiscoveredEntry>) -> SyncResult<()> {
        let mut list: Vec<&DiscoveredEntry> = next.values().collect();
        list.sort_by(|a, b| a.entry.id.cmp(&b.entry.id));
        self.kv.save(keys::DISCOVERY, &list)?;
        if let Ok(mut discovery) = self.discovery.write() {
            *discovery = next;
        }
        Ok(())
    }
}

//! Durable queue of operations deferred by connectivity failures.
//!
//! Three intent kinds are kept, each keyed by its natural id so that
//! re-queuing the same intent is a no-op:
//!
//! - at most one registry publish
//! - subscription syncs keyed by subscription id
//! - subscription adds keyed by registry CID
//!
//! Draining runs publishes first (peers may be waiting for a fresh CID),
//! then syncs, then adds. A failed item keeps its place until it has used up
//! its attempts.

use crate::error::{SyncError, SyncResult};
use crate::subscription::{OperationKind, OperationStatus, SyncOperation};
use async_trait::async_trait;
use memex_storage::{keys, KeyValueStore, KeyValueStoreExt};
use memex_types::{Cid, OperationId, SubscriptionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Runs the real operation behind a queued intent.
#[async_trait]
pub trait QueueExecutor: Send + Sync {
    /// Publishes the local registry.
    async fn execute_publish(&self) -> SyncResult<()>;

    /// Syncs one subscription.
    async fn execute_sync(&self, id: SubscriptionId) -> SyncResult<()>;

    /// Subscribes to the registry at `cid`.
    async fn execute_add(&self, cid: Cid, auto_sync: bool) -> SyncResult<()>;
}

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueReport {
    /// Items that succeeded and were removed.
    pub processed: usize,
    /// Items that failed this round, whether kept for retry or dropped.
    pub failed: usize,
    /// One message per failure, or the reason nothing ran.
    pub errors: Vec<String>,
}

impl QueueReport {
    fn skipped(reason: String) -> Self {
        Self {
            processed: 0,
            failed: 0,
            errors: vec![reason],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueuedSync {
    subscription_id: SubscriptionId,
    operation: SyncOperation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueuedAdd {
    cid: Cid,
    auto_sync: bool,
    operation: SyncOperation,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedQueue {
    publish: Option<SyncOperation>,
    syncs: Vec<QueuedSync>,
    adds: Vec<QueuedAdd>,
}

#[derive(Debug, Default, Clone)]
struct QueueState {
    publish: Option<SyncOperation>,
    syncs: HashMap<SubscriptionId, QueuedSync>,
    adds: HashMap<Cid, QueuedAdd>,
}

impl QueueState {
    fn len(&self) -> usize {
        usize::from(self.publish.is_some()) + self.syncs.len() + self.adds.len()
    }

    fn to_persisted(&self) -> PersistedQueue {
        let mut syncs: Vec<QueuedSync> = self.syncs.values().cloned().collect();
        syncs.sort_by_key(|s| (s.operation.created_at, s.operation.id));
        let mut adds: Vec<QueuedAdd> = self.adds.values().cloned().collect();
        adds.sort_by_key(|a| (a.operation.created_at, a.operation.id));
        PersistedQueue {
            publish: self.publish.clone(),
            syncs,
            adds,
        }
    }

    fn from_persisted(persisted: PersistedQueue) -> Self {
        Self {
            publish: persisted.publish,
            syncs: persisted
                .syncs
                .into_iter()
                .map(|s| (s.subscription_id, s))
                .collect(),
            adds: persisted.adds.into_iter().map(|a| (a.cid.clone(), a)).collect(),
        }
    }

    fn operation_mut(&mut self, item: &WorkItem) -> Option<&mut SyncOperation> {
        match item {
            WorkItem::Publish { .. } => self.publish.as_mut(),
            WorkItem::Sync { id, .. } => self.syncs.get_mut(id).map(|s| &mut s.operation),
            WorkItem::Add { cid, .. } => self.adds.get_mut(cid).map(|a| &mut a.operation),
        }
    }

    fn remove(&mut self, item: &WorkItem) {
        match item {
            WorkItem::Publish { .. } => self.publish = None,
            WorkItem::Sync { id, .. } => {
                self.syncs.remove(id);
            }
            WorkItem::Add { cid, .. } => {
                self.adds.remove(cid);
            }
        }
    }
}

enum WorkItem {
    Publish { op: OperationId },
    Sync { id: SubscriptionId, op: OperationId },
    Add { cid: Cid, auto_sync: bool, op: OperationId },
}

impl WorkItem {
    fn operation_id(&self) -> OperationId {
        match self {
            WorkItem::Publish { op } | WorkItem::Sync { op, .. } | WorkItem::Add { op, .. } => *op,
        }
    }

    fn describe(&self) -> String {
        match self {
            WorkItem::Publish { .. } => "publish registry".to_string(),
            WorkItem::Sync { id, .. } => format!("sync subscription {id}"),
            WorkItem::Add { cid, .. } => format!("add subscription {cid}"),
        }
    }
}

/// The offline operation queue.
pub struct OfflineQueue {
    kv: Arc<dyn KeyValueStore>,
    max_retries: u32,
    state: Mutex<QueueState>,
    drain: tokio::sync::Mutex<()>,
}

impl OfflineQueue {
    /// Opens the queue, loading persisted intents.
    pub fn open(kv: Arc<dyn KeyValueStore>, max_retries: u32) -> SyncResult<Self> {
        let persisted: PersistedQueue = kv.load(keys::OFFLINE_QUEUE)?.unwrap_or_default();
        let state = QueueState::from_persisted(persisted);
        if state.len() > 0 {
            info!("Loaded {} queued operations", state.len());
        }
        Ok(Self {
            kv,
            max_retries: max_retries.max(1),
            state: Mutex::new(state),
            drain: tokio::sync::Mutex::new(()),
        })
    }

    /// Queues a registry publish. Returns false if one is already queued.
    pub fn enqueue_publish(&self) -> SyncResult<bool> {
        self.mutate(|state| {
            if state.publish.is_some() {
                return false;
            }
            state.publish = Some(SyncOperation::new(OperationKind::PublishRegistry, "registry"));
            true
        })
    }

    /// Queues a subscription sync. Returns false if one is already queued
    /// for `id`.
    pub fn enqueue_sync(&self, id: SubscriptionId) -> SyncResult<bool> {
        self.mutate(|state| {
            if state.syncs.contains_key(&id) {
                return false;
            }
            state.syncs.insert(
                id,
                QueuedSync {
                    subscription_id: id,
                    operation: SyncOperation::new(OperationKind::SyncSubscription, id.to_string()),
                },
            );
            true
        })
    }

    /// Queues a subscription add. Returns false if one is already queued
    /// for `cid`.
    pub fn enqueue_add(&self, cid: Cid, auto_sync: bool) -> SyncResult<bool> {
        self.mutate(|state| {
            if state.adds.contains_key(&cid) {
                return false;
            }
            let operation = SyncOperation::new(OperationKind::AddSubscription, cid.to_string());
            state.adds.insert(
                cid.clone(),
                QueuedAdd {
                    cid,
                    auto_sync,
                    operation,
                },
            );
            true
        })
    }

    /// Drops a queued sync, e.g. after the subscription was removed.
    pub fn remove_sync(&self, id: SubscriptionId) -> SyncResult<bool> {
        self.mutate(|state| state.syncs.remove(&id).is_some())
    }

    /// Drops every queued intent.
    pub fn clear(&self) -> SyncResult<()> {
        self.mutate(|state| {
            *state = QueueState::default();
        })
    }

    /// Number of queued intents.
    pub fn depth(&self) -> usize {
        self.state.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Queued operations in processing order.
    pub fn pending(&self) -> Vec<SyncOperation> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        let persisted = state.to_persisted();
        persisted
            .publish
            .into_iter()
            .chain(persisted.syncs.into_iter().map(|s| s.operation))
            .chain(persisted.adds.into_iter().map(|a| a.operation))
            .collect()
    }

    /// Whether a publish intent is queued.
    pub fn has_publish(&self) -> bool {
        self.state.lock().map(|s| s.publish.is_some()).unwrap_or(false)
    }

    /// Whether an add intent is queued for `cid`.
    pub fn has_add(&self, cid: &Cid) -> bool {
        self.state
            .lock()
            .map(|s| s.adds.contains_key(cid))
            .unwrap_or(false)
    }

    /// Drains the queue through `executor`.
    ///
    /// `gate` is the result of the connectivity check. If it failed, nothing
    /// is touched and the report carries the reason. Only one drain runs at
    /// a time; enqueueing stays possible while a drain is in progress.
    pub async fn process(&self, executor: &dyn QueueExecutor, gate: SyncResult<()>) -> QueueReport {
        if let Err(e) = gate {
            debug!("Skipping queue drain: {}", e.reason());
            return QueueReport::skipped(e.reason());
        }

        let _drain = self.drain.lock().await;
        let work = match self.work_items() {
            Ok(work) => work,
            Err(e) => return QueueReport::skipped(e.reason()),
        };
        if work.is_empty() {
            return QueueReport::default();
        }
        info!("Draining {} queued operations", work.len());

        let mut report = QueueReport::default();
        for item in work {
            let started = self.mutate(|state| {
                if let Some(op) = state.operation_mut(&item) {
                    op.status = OperationStatus::Syncing;
                }
            });
            if let Err(e) = started {
                warn!("Failed to persist queue state: {}", e);
            }

            let result = match &item {
                WorkItem::Publish { .. } => executor.execute_publish().await,
                WorkItem::Sync { id, .. } => executor.execute_sync(*id).await,
                WorkItem::Add { cid, auto_sync, .. } => {
                    executor.execute_add(cid.clone(), *auto_sync).await
                }
            };

            match result {
                Ok(()) => {
                    debug!("Queued {} succeeded", item.describe());
                    report.processed += 1;
                    if let Err(e) = self.mutate(|state| state.remove(&item)) {
                        warn!("Failed to persist queue state: {}", e);
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    let message = self.record_failure(&item, &err);
                    report.errors.push(message);
                }
            }
        }

        info!(
            "Queue drain finished: {} processed, {} failed, {} remaining",
            report.processed,
            report.failed,
            self.depth()
        );
        report
    }

    /// Bumps the retry count of a failed item, dropping it when it is out of
    /// attempts or the error is permanent. Returns the report message.
    fn record_failure(&self, item: &WorkItem, err: &SyncError) -> String {
        let max_retries = self.max_retries;
        let outcome = self.mutate(|state| {
            let Some(op) = state.operation_mut(item) else {
                return true;
            };
            if op.id != item.operation_id() {
                return false;
            }
            op.retry_count += 1;
            op.last_error = Some(err.to_string());
            op.status = OperationStatus::Failed;
            let drop_it = !err.is_retryable() || op.retry_count >= max_retries;
            if drop_it {
                state.remove(item);
            } else {
                op.status = OperationStatus::Pending;
            }
            drop_it
        });

        match outcome {
            Ok(true) => {
                warn!("Dropping queued {}: {}", item.describe(), err);
                format!("{}: {} (dropped)", item.describe(), err)
            }
            Ok(false) => {
                debug!("Queued {} failed, will retry: {}", item.describe(), err);
                format!("{}: {}", item.describe(), err)
            }
            Err(e) => {
                warn!("Failed to persist queue state: {}", e);
                format!("{}: {}", item.describe(), err)
            }
        }
    }

    fn work_items(&self) -> SyncResult<Vec<WorkItem>> {
        let state = self.lock_state()?;
        let persisted = state.to_persisted();
        let mut work = Vec::with_capacity(state.len());
        if let Some(op) = persisted.publish {
            work.push(WorkItem::Publish { op: op.id });
        }
        work.extend(persisted.syncs.into_iter().map(|s| WorkItem::Sync {
            id: s.subscription_id,
            op: s.operation.id,
        }));
        work.extend(persisted.adds.into_iter().map(|a| WorkItem::Add {
            cid: a.cid,
            auto_sync: a.auto_sync,
            op: a.operation.id,
        }));
        Ok(work)
    }

    fn lock_state(&self) -> SyncResult<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::PersistenceFailure("queue lock poisoned".into()))
    }

    /// Applies `edit` and persists the result. On a failed write the
    /// in-memory queue is restored.
    fn mutate<T>(&self, edit: impl FnOnce(&mut QueueState) -> T) -> SyncResult<T> {
        let mut state = self.lock_state()?;
        let previous = state.clone();
        let out = edit(&mut state);
        if let Err(e) = self.kv.save(keys::OFFLINE_QUEUE, &state.to_persisted()) {
            *state = previous;
            return Err(SyncError::PersistenceFailure(e.to_string()));
        }
        Ok(out)
    }
}

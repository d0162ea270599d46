//! Cross-space propagation daemon.
//!
//! Public records are authored into one space but should be discoverable
//! from any space the user has joined. Each cycle the daemon scans every
//! joined space, caches all public records keyed by id, and appends a copy
//! of each record to the spaces that lack it. Copies carry the id of the
//! space holding the original, which stays the source of truth.
//!
//! ```text
//!  Idle ──initialize──▶ Running ──stop──▶ Stopped
//! ```

use crate::content_store::with_timeout;
use crate::error::{SyncError, SyncResult};
use crate::safety::SafetyCheck;
use crate::space::{Space, SpaceFilter, SpaceRecord, SpaceTransport};
use memex_types::{SpaceId, Timestamp, UserId, Visibility};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Display name used when no author name is known.
pub const UNKNOWN_AUTHOR: &str = "Anonymous";

/// Lifecycle of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Idle,
    Running,
    Stopped,
}

/// A public record as seen by the last cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossSpaceMemory {
    pub id: String,
    pub title: String,
    pub content: String,
    pub timestamp: Timestamp,
    pub tags: Vec<String>,
    pub author_id: UserId,
    pub author_name: String,
    /// Space holding the authoritative record.
    pub origin_space_id: SpaceId,
    /// Content size in bytes.
    pub size: u64,
    /// SHA-256 over title and content.
    pub content_digest: String,
}

impl CrossSpaceMemory {
    fn to_propagated_record(&self) -> SpaceRecord {
        SpaceRecord {
            id: self.id.clone(),
            title: self.title.clone(),
            content: self.content.clone(),
            timestamp: self.timestamp,
            tags: self.tags.clone(),
            author_id: self.author_id.clone(),
            author_name: Some(self.author_name.clone()),
            visibility: Visibility::Public,
            origin_space_id: Some(self.origin_space_id.clone()),
            content_digest: Some(self.content_digest.clone()),
        }
    }
}

/// Computes the digest carried by propagated copies.
pub fn content_digest(title: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(b"\n");
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub spaces_scanned: usize,
    pub memories_found: usize,
    pub propagated: usize,
    /// One message per failed scan or propagation.
    pub failures: Vec<String>,
}

struct DaemonInner {
    transport: Arc<dyn SpaceTransport>,
    safety: Arc<dyn SafetyCheck>,
    timeout: Duration,
    cache: RwLock<HashMap<String, CrossSpaceMemory>>,
    cycle: tokio::sync::Mutex<()>,
}

/// Periodically fans public records out across joined spaces.
pub struct CrossSpaceSyncDaemon {
    inner: Arc<DaemonInner>,
    interval: Duration,
    state: Mutex<DaemonState>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CrossSpaceSyncDaemon {
    /// Creates an idle daemon.
    pub fn new(
        transport: Arc<dyn SpaceTransport>,
        safety: Arc<dyn SafetyCheck>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(DaemonInner {
                transport,
                safety,
                timeout,
                cache: RwLock::new(HashMap::new()),
                cycle: tokio::sync::Mutex::new(()),
            }),
            interval,
            state: Mutex::new(DaemonState::Idle),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DaemonState {
        self.state.lock().map(|s| *s).unwrap_or(DaemonState::Stopped)
    }

    /// Starts periodic cycles; the first runs immediately. Must be called
    /// inside a Tokio runtime.
    ///
    /// Only an idle daemon starts. Returns whether it did.
    pub fn initialize(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if *state != DaemonState::Idle {
            debug!("Cross-space daemon not started from state {:?}", *state);
            return false;
        }

        let inner = self.inner.clone();
        let interval = self.interval;
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // A started cycle always runs to completion.
                        if let Err(e) = inner.run_cycle().await {
                            warn!("Cross-space cycle failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Cross-space daemon loop exited");
        });

        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
        *state = DaemonState::Running;
        info!("Cross-space daemon started (interval {:?})", interval);
        true
    }

    /// Cancels future cycles. An in-flight cycle finishes. Idempotent.
    pub fn stop(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if *state == DaemonState::Stopped {
            return;
        }
        let _ = self.shutdown.send(true);
        *state = DaemonState::Stopped;
        info!("Cross-space daemon stopped");
    }

    /// Stops the daemon and waits for its loop to exit.
    pub async fn stop_and_wait(&self) {
        self.stop();
        let handle = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Runs one cycle now, serialized with timer-driven cycles.
    pub async fn run_cycle(&self) -> SyncResult<CycleReport> {
        self.inner.run_cycle().await
    }

    /// Records seen by the last cycle, sorted by id.
    pub fn cached_memories(&self) -> Vec<CrossSpaceMemory> {
        let mut list: Vec<CrossSpaceMemory> = self
            .inner
            .cache
            .read()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}

impl Drop for CrossSpaceSyncDaemon {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl DaemonInner {
    async fn run_cycle(&self) -> SyncResult<CycleReport> {
        let _cycle = self.cycle.lock().await;
        let mut report = CycleReport::default();

        let spaces = with_timeout(self.timeout, self.transport.list_spaces()).await?;

        // Scan. Spaces that fail to answer are skipped for propagation too,
        // since we cannot tell what they already hold.
        let mut scanned: Vec<(Arc<dyn Space>, Vec<SpaceRecord>)> = Vec::new();
        for space in spaces {
            match with_timeout(self.timeout, space.query(SpaceFilter::public())).await {
                Ok(records) => {
                    report.spaces_scanned += 1;
                    scanned.push((space, records));
                }
                Err(e) => {
                    warn!("Failed to scan space {}: {}", space.id(), e);
                    report.failures.push(format!("scan {}: {}", space.id(), e));
                }
            }
        }

        let authors = best_known_authors(&scanned);

        let mut cache: HashMap<String, CrossSpaceMemory> = HashMap::new();
        for (space, records) in &scanned {
            let space_id = space.id();
            for record in records {
                let author_name = record
                    .author_name
                    .clone()
                    .filter(|n| !n.trim().is_empty())
                    .or_else(|| authors.get(&record.author_id).cloned())
                    .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string());
                cache.insert(
                    record.id.clone(),
                    CrossSpaceMemory {
                        id: record.id.clone(),
                        title: record.title.clone(),
                        content: record.content.clone(),
                        timestamp: record.timestamp,
                        tags: record.tags.clone(),
                        author_id: record.author_id.clone(),
                        author_name,
                        origin_space_id: record
                            .origin_space_id
                            .clone()
                            .unwrap_or_else(|| space_id.clone()),
                        size: record.content.len() as u64,
                        content_digest: record
                            .content_digest
                            .clone()
                            .unwrap_or_else(|| content_digest(&record.title, &record.content)),
                    },
                );
            }
        }
        report.memories_found = cache.len();

        let mut memories: Vec<&CrossSpaceMemory> = cache.values().collect();
        memories.sort_by(|a, b| a.id.cmp(&b.id));

        for (space, records) in &scanned {
            let present: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
            let target = space.id();
            for memory in &memories {
                if present.contains(memory.id.as_str()) {
                    continue;
                }
                let copy = memory.to_propagated_record();
                let verdict = self.safety.check_record(&copy);
                if !verdict.is_allowed() {
                    debug!("Safety check blocked {} from {}: {:?}", copy.id, target, verdict);
                    continue;
                }
                match with_timeout(self.timeout, space.add(copy)).await {
                    Ok(()) => {
                        report.propagated += 1;
                        debug!(
                            "Propagated {} from {} into {}",
                            memory.id, memory.origin_space_id, target
                        );
                    }
                    Err(e) => {
                        warn!("Failed to propagate {} into {}: {}", memory.id, target, e);
                        report
                            .failures
                            .push(format!("propagate {} into {}: {}", memory.id, target, e));
                    }
                }
            }
        }

        match self.cache.write() {
            Ok(mut current) => *current = cache,
            Err(_) => {
                return Err(SyncError::PersistenceFailure(
                    "cross-space cache lock poisoned".into(),
                ));
            }
        }

        info!(
            "Cross-space cycle: {} spaces, {} memories, {} propagated, {} failures",
            report.spaces_scanned,
            report.memories_found,
            report.propagated,
            report.failures.len()
        );
        Ok(report)
    }
}

/// Author display names learned from any scanned record.
fn best_known_authors(scanned: &[(Arc<dyn Space>, Vec<SpaceRecord>)]) -> HashMap<UserId, String> {
    let mut names = HashMap::new();
    for (_, records) in scanned {
        for record in records {
            if let Some(name) = record.author_name.as_ref().filter(|n| !n.trim().is_empty()) {
                names
                    .entry(record.author_id.clone())
                    .or_insert_with(|| name.clone());
            }
        }
    }
    names
}

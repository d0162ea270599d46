//! Reconciling divergent versions of the same object.
//!
//! Automatic rules, applied in order:
//!
//! 1. **Last write wins.** If both versions carry distinct `timestamp`
//!    fields, the newer version is taken whole.
//! 2. **Shallow merge.** If both are JSON objects, remote fields form the
//!    base and local fields override on key collision; the merged
//!    `timestamp` is the larger of the two.
//! 3. Otherwise the conflict is parked for a manual decision.
//!
//! Timestamps may be millisecond numbers or RFC 3339 strings, since remote
//! peers are not required to run this crate.

use crate::error::{SyncError, SyncResult};
use memex_storage::{keys, KeyValueStore, KeyValueStoreExt};
use memex_types::{ConflictId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Resolver identity recorded for automatic decisions.
pub const AUTO_RESOLVER: &str = "auto";

/// Resolver identity recorded for manual decisions.
pub const USER_RESOLVER: &str = "user";

/// How a conflict was (or must be) settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    /// Settled by a merge rule (including last-write-wins).
    Merge,
    /// One side was chosen wholesale by a person.
    Override,
    /// Waiting for a person.
    Manual,
}

/// A manual decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionChoice {
    Local,
    Remote,
    Merge,
}

/// A detected conflict and, once settled, its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub id: ConflictId,
    /// Id of the object the two versions belong to.
    pub object_id: String,
    pub kind: ConflictKind,
    pub local: Value,
    pub remote: Value,
    pub resolved: Option<Value>,
    pub timestamp: Timestamp,
    pub resolved_by: Option<String>,
}

impl ConflictResolution {
    /// Whether a resolved version exists.
    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }
}

/// Reads the `timestamp` field of an object as milliseconds.
pub fn extract_timestamp(value: &Value) -> Option<u64> {
    match value.get("timestamp")? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.parse::<u64>().ok().or_else(|| {
            chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis().max(0) as u64)
        }),
        _ => None,
    }
}

/// Remote fields as base, local fields on top, `timestamp` set to the
/// larger of the two. `None` unless both sides are objects.
pub fn shallow_merge(local: &Value, remote: &Value) -> Option<Value> {
    let (Value::Object(local_map), Value::Object(remote_map)) = (local, remote) else {
        return None;
    };
    let mut merged: Map<String, Value> = remote_map.clone();
    for (key, value) in local_map {
        merged.insert(key.clone(), value.clone());
    }
    let newest = match (extract_timestamp(local), extract_timestamp(remote)) {
        (Some(l), Some(r)) => Some(l.max(r)),
        (l, r) => l.or(r),
    };
    if let Some(ts) = newest {
        merged.insert("timestamp".to_string(), Value::from(ts));
    }
    Some(Value::Object(merged))
}

/// Applies the automatic rules. `None` means a person has to decide.
pub fn auto_resolve(local: &Value, remote: &Value) -> Option<Value> {
    if let (Some(l), Some(r)) = (extract_timestamp(local), extract_timestamp(remote)) {
        if l > r {
            return Some(local.clone());
        }
        if r > l {
            return Some(remote.clone());
        }
    }
    shallow_merge(local, remote)
}

/// Detects, auto-resolves, and tracks conflicts awaiting a decision.
pub struct ConflictResolver {
    kv: Option<Arc<dyn KeyValueStore>>,
    pending: Mutex<HashMap<ConflictId, ConflictResolution>>,
}

impl ConflictResolver {
    /// Creates a resolver that persists pending conflicts in `kv`.
    pub fn open(kv: Arc<dyn KeyValueStore>) -> SyncResult<Self> {
        let stored: Vec<ConflictResolution> = kv.load(keys::CONFLICTS)?.unwrap_or_default();
        let pending = stored.into_iter().map(|c| (c.id, c)).collect();
        Ok(Self {
            kv: Some(kv),
            pending: Mutex::new(pending),
        })
    }

    /// Creates a resolver that keeps pending conflicts in memory only.
    pub fn in_memory() -> Self {
        Self {
            kv: None,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Reconciles two versions of `object_id`.
    ///
    /// Auto-resolvable conflicts come back with `resolved` set and are not
    /// tracked. Others are parked as `Manual` and listed by
    /// [`pending_conflicts`](Self::pending_conflicts).
    pub fn detect_and_resolve(
        &self,
        object_id: impl Into<String>,
        local: Value,
        remote: Value,
    ) -> SyncResult<ConflictResolution> {
        let object_id = object_id.into();
        let resolved = auto_resolve(&local, &remote);
        let manual = resolved.is_none();
        let conflict = ConflictResolution {
            id: ConflictId::new(),
            object_id,
            kind: if manual {
                ConflictKind::Manual
            } else {
                ConflictKind::Merge
            },
            local,
            remote,
            resolved,
            timestamp: Timestamp::now(),
            resolved_by: if manual {
                None
            } else {
                Some(AUTO_RESOLVER.to_string())
            },
        };

        if manual {
            info!(
                "Conflict {} on {} needs manual resolution",
                conflict.id, conflict.object_id
            );
            let mut pending = self.lock_pending()?;
            pending.insert(conflict.id, conflict.clone());
            if let Err(e) = self.persist(&pending) {
                pending.remove(&conflict.id);
                return Err(e);
            }
        } else {
            debug!("Auto-resolved conflict on {}", conflict.object_id);
        }
        Ok(conflict)
    }

    /// Settles a pending conflict. Each conflict can be resolved once; a
    /// second call reports `NotFound`.
    pub fn resolve_conflict(
        &self,
        id: ConflictId,
        choice: ResolutionChoice,
        custom: Option<Value>,
    ) -> SyncResult<ConflictResolution> {
        let mut pending = self.lock_pending()?;
        let conflict = pending
            .get(&id)
            .ok_or_else(|| SyncError::NotFound(format!("conflict {id}")))?;

        let (kind, resolved) = match choice {
            ResolutionChoice::Local => (ConflictKind::Override, conflict.local.clone()),
            ResolutionChoice::Remote => (ConflictKind::Override, conflict.remote.clone()),
            ResolutionChoice::Merge => {
                let merged = custom
                    .or_else(|| shallow_merge(&conflict.local, &conflict.remote))
                    .ok_or(SyncError::ConflictUnresolved(id))?;
                (ConflictKind::Merge, merged)
            }
        };

        let original = conflict.clone();
        let mut settled = conflict.clone();
        settled.kind = kind;
        settled.resolved = Some(resolved);
        settled.timestamp = Timestamp::now();
        settled.resolved_by = Some(USER_RESOLVER.to_string());

        pending.remove(&id);
        if let Err(e) = self.persist(&pending) {
            pending.insert(id, original);
            return Err(e);
        }
        info!("Resolved conflict {} on {} ({:?})", id, settled.object_id, choice);
        Ok(settled)
    }

    /// Conflicts awaiting a decision, oldest first.
    pub fn pending_conflicts(&self) -> Vec<ConflictResolution> {
        let mut list: Vec<ConflictResolution> = match self.pending.lock() {
            Ok(pending) => pending.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        list.sort_by_key(|c| (c.timestamp, c.id));
        list
    }

    /// Number of conflicts awaiting a decision.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn lock_pending(
        &self,
    ) -> SyncResult<std::sync::MutexGuard<'_, HashMap<ConflictId, ConflictResolution>>> {
        self.pending
            .lock()
            .map_err(|_| SyncError::PersistenceFailure("conflict table lock poisoned".into()))
    }

    fn persist(&self, pending: &HashMap<ConflictId, ConflictResolution>) -> SyncResult<()> {
        let Some(kv) = &self.kv else {
            return Ok(());
        };
        let mut list: Vec<&ConflictResolution> = pending.values().collect();
        list.sort_by_key(|c| (c.timestamp, c.id));
        kv.save(keys::CONFLICTS, &list).map_err(|e| {
            warn!("Failed to persist pending conflicts: {}", e);
            SyncError::PersistenceFailure(e.to_string())
        })
    }
}

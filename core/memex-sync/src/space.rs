//! Peer space abstraction.
//!
//! A space is a replicated collection of records shared with a set of peers.
//! The transport that keeps spaces replicated is external; the core only
//! lists joined spaces, queries them, and appends to them.

use crate::error::SyncResult;
use async_trait::async_trait;
use memex_types::{SpaceId, Timestamp, UserId, Visibility};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A record as stored in a space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceRecord {
    /// Record id, stable across spaces.
    pub id: String,
    pub title: String,
    pub content: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub tags: Vec<String>,
    pub author_id: UserId,
    #[serde(default)]
    pub author_name: Option<String>,
    pub visibility: Visibility,
    /// Set on propagated copies: the space holding the authoritative record.
    #[serde(default)]
    pub origin_space_id: Option<SpaceId>,
    /// SHA-256 of title and content, set on propagated copies.
    #[serde(default)]
    pub content_digest: Option<String>,
}

impl SpaceRecord {
    /// Whether this record is a propagated copy rather than the original.
    pub fn is_propagated(&self) -> bool {
        self.origin_space_id.is_some()
    }
}

/// Selects records in a space.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpaceFilter {
    /// Only records with this visibility.
    pub visibility: Option<Visibility>,
    /// Only records with one of these ids.
    pub ids: Option<Vec<String>>,
}

impl SpaceFilter {
    /// Matches public records.
    pub fn public() -> Self {
        Self {
            visibility: Some(Visibility::Public),
            ids: None,
        }
    }

    /// Whether `record` passes this filter.
    pub fn matches(&self, record: &SpaceRecord) -> bool {
        if let Some(visibility) = self.visibility {
            if record.visibility != visibility {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &record.id) {
                return false;
            }
        }
        true
    }
}

/// Callback invoked for records added to a space after subscribing.
pub type SpaceCallback = Box<dyn Fn(&SpaceRecord) + Send + Sync>;

/// A joined network space.
#[async_trait]
pub trait Space: Send + Sync {
    /// The space's id.
    fn id(&self) -> SpaceId;

    /// Returns records matching `filter`.
    async fn query(&self, filter: SpaceFilter) -> SyncResult<Vec<SpaceRecord>>;

    /// Appends a record.
    async fn add(&self, record: SpaceRecord) -> SyncResult<()>;

    /// Registers a callback for future records matching `filter`.
    async fn subscribe(&self, filter: SpaceFilter, callback: SpaceCallback) -> SyncResult<()>;
}

/// Lists the spaces the local user has joined.
#[async_trait]
pub trait SpaceTransport: Send + Sync {
    /// Returns joined spaces in a stable order.
    async fn list_spaces(&self) -> SyncResult<Vec<Arc<dyn Space>>>;
}

/// In-memory spaces for testing.
pub mod mock {
    use super::*;
    use crate::error::SyncError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// A space held in memory.
    pub struct MemorySpace {
        id: SpaceId,
        records: Mutex<Vec<SpaceRecord>>,
        subscribers: Mutex<Vec<(SpaceFilter, SpaceCallback)>>,
        reject_adds: AtomicBool,
    }

    impl MemorySpace {
        /// Creates an empty space.
        pub fn new(id: impl Into<String>) -> Self {
            Self {
                id: SpaceId::new(id),
                records: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
                reject_adds: AtomicBool::new(false),
            }
        }

        /// Inserts a record directly, bypassing subscribers.
        pub fn seed(&self, record: SpaceRecord) {
            self.records.lock().unwrap().push(record);
        }

        /// Makes `add` fail while `reject` is true.
        pub fn reject_adds(&self, reject: bool) {
            self.reject_adds.store(reject, Ordering::SeqCst);
        }

        /// Snapshot of every record.
        pub fn records(&self) -> Vec<SpaceRecord> {
            self.records.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Space for MemorySpace {
        fn id(&self) -> SpaceId {
            self.id.clone()
        }

        async fn query(&self, filter: SpaceFilter) -> SyncResult<Vec<SpaceRecord>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect())
        }

        async fn add(&self, record: SpaceRecord) -> SyncResult<()> {
            if self.reject_adds.load(Ordering::SeqCst) {
                return Err(SyncError::StoreUnavailable(format!(
                    "space {} rejected write",
                    self.id
                )));
            }
            for (filter, callback) in self.subscribers.lock().unwrap().iter() {
                if filter.matches(&record) {
                    callback(&record);
                }
            }
            self.records.lock().unwrap().push(record);
            Ok(())
        }

        async fn subscribe(
            &self,
            filter: SpaceFilter,
            callback: SpaceCallback,
        ) -> SyncResult<()> {
            self.subscribers.lock().unwrap().push((filter, callback));
            Ok(())
        }
    }

    /// A fixed list of in-memory spaces.
    #[derive(Default)]
    pub struct MemorySpaceTransport {
        spaces: Mutex<Vec<Arc<MemorySpace>>>,
    }

    impl MemorySpaceTransport {
        /// Creates a transport with no spaces.
        pub fn new() -> Self {
            Self::default()
        }

        /// Joins a space, appending it to the list.
        pub fn join(&self, space: Arc<MemorySpace>) {
            self.spaces.lock().unwrap().push(space);
        }
    }

    #[async_trait]
    impl SpaceTransport for MemorySpaceTransport {
        async fn list_spaces(&self) -> SyncResult<Vec<Arc<dyn Space>>> {
            Ok(self
                .spaces
                .lock()
                .unwrap()
                .iter()
                .map(|s| s.clone() as Arc<dyn Space>)
                .collect())
        }
    }
}

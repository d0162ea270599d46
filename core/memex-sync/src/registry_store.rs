//! Ownership and persistence of the local registry.
//!
//! The store is the single writer of the `registry` key. Writers are
//! serialized through an async mutex; readers get the last persisted
//! snapshot without waiting for writers. A write becomes visible only after
//! it has been persisted, so a failed write leaves the previous value in
//! place.

use crate::error::{SyncError, SyncResult};
use crate::registry::{ProfileSummary, Registry, RegistryEntry};
use memex_storage::{keys, KeyValueStore, KeyValueStoreExt};
use memex_types::{MemoryRecord, UserId};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Owns the local user's registry document.
pub struct RegistryStore {
    kv: Arc<dyn KeyValueStore>,
    anonymize_authors: bool,
    snapshot: RwLock<Option<Registry>>,
    writer: Mutex<()>,
}

impl RegistryStore {
    /// Opens the store, loading any previously persisted registry.
    pub fn open(kv: Arc<dyn KeyValueStore>, anonymize_authors: bool) -> SyncResult<Self> {
        let persisted: Option<Registry> = kv.load(keys::REGISTRY)?;
        if let Some(registry) = &persisted {
            debug!(
                "Loaded registry for {} with {} entries",
                registry.owner, registry.metadata.total_entries
            );
        }
        Ok(Self {
            kv,
            anonymize_authors,
            snapshot: RwLock::new(persisted),
            writer: Mutex::new(()),
        })
    }

    /// Returns the last persisted registry.
    pub fn current(&self) -> Option<Registry> {
        self.snapshot.read().ok().and_then(|r| r.clone())
    }

    /// Returns the last persisted registry, or `NotFound` if none exists.
    pub fn require(&self) -> SyncResult<Registry> {
        self.current()
            .ok_or_else(|| SyncError::NotFound("registry not created".into()))
    }

    /// Creates the registry for `owner`.
    ///
    /// Idempotent per owner: if a registry for the same user already exists
    /// it is returned unchanged.
    pub async fn create(&self, owner: UserId, profile: ProfileSummary) -> SyncResult<Registry> {
        let writer = self.begin().await;
        if let Some(existing) = writer.current() {
            if existing.owner == owner {
                debug!("Registry for {} already exists", owner);
                return Ok(existing);
            }
            warn!(
                "Replacing registry owned by {} with a new one for {}",
                existing.owner, owner
            );
        }
        let registry = Registry::new(owner, profile);
        info!("Created registry {}", registry.id());
        writer.commit(registry)
    }

    /// Rebuilds entries from local records.
    ///
    /// Keeps only public records with a content identifier; each record id
    /// appears at most once (first occurrence wins).
    pub async fn project_from_records(&self, records: &[MemoryRecord]) -> SyncResult<Registry> {
        let writer = self.begin().await;
        let mut registry = writer
            .current()
            .ok_or_else(|| SyncError::NotFound("registry not created".into()))?;

        let mut seen = HashSet::new();
        let entries: Vec<RegistryEntry> = records
            .iter()
            .filter_map(|r| RegistryEntry::project(r, self.anonymize_authors))
            .filter(|e| seen.insert(e.id.clone()))
            .collect();

        debug!(
            "Projected {} of {} records into registry",
            entries.len(),
            records.len()
        );
        registry.replace_entries(entries);
        writer.commit(registry)
    }

    /// Updates the profile summary.
    pub async fn update_profile(&self, profile: ProfileSummary) -> SyncResult<Registry> {
        let writer = self.begin().await;
        let mut registry = writer
            .current()
            .ok_or_else(|| SyncError::NotFound("registry not created".into()))?;
        registry.profile = profile;
        registry.metadata.updated = registry.metadata.updated.tick();
        writer.commit(registry)
    }

    /// Takes the write lock. Held across a whole read-modify-persist cycle,
    /// including network calls made on the registry's behalf.
    pub(crate) async fn begin(&self) -> RegistryWriter<'_> {
        RegistryWriter {
            store: self,
            _guard: self.writer.lock().await,
        }
    }

    fn persist(&self, registry: Registry) -> SyncResult<Registry> {
        if let Err(e) = self.kv.save(keys::REGISTRY, &registry) {
            warn!("Failed to persist registry, keeping previous version: {}", e);
            return Err(SyncError::PersistenceFailure(e.to_string()));
        }
        let mut snapshot = self.snapshot.write().map_err(|_| {
            SyncError::PersistenceFailure("registry snapshot lock poisoned".into())
        })?;
        *snapshot = Some(registry.clone());
        Ok(registry)
    }
}

/// Exclusive access to the registry for one read-modify-persist cycle.
pub(crate) struct RegistryWriter<'a> {
    store: &'a RegistryStore,
    _guard: MutexGuard<'a, ()>,
}

impl RegistryWriter<'_> {
    pub(crate) fn current(&self) -> Option<Registry> {
        self.store.current()
    }

    pub(crate) fn commit(&self, registry: Registry) -> SyncResult<Registry> {
        self.store.persist(registry)
    }
}

//! Durable key/value persistence for Memex.
//!
//! Every piece of local state the sync core owns (the registry document, the
//! subscription list, the offline queue, the discovery index and pending
//! conflicts) is stored as one JSON value under a namespaced key.
//!
//! # Backends
//!
//! - [`SqliteKvStore`]: a single SQLite table, used on devices
//! - [`MemoryKvStore`]: a map in memory, used in tests and ephemeral sessions
//!
//! Both implement [`KeyValueStore`]; typed access goes through
//! [`KeyValueStoreExt`].

mod error;
mod memory;
mod sqlite;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryKvStore;
pub use sqlite::SqliteKvStore;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Well-known keys used by the sync core.
pub mod keys {
    /// The local user's registry document.
    pub const REGISTRY: &str = "registry";
    /// The list of registry subscriptions.
    pub const SUBSCRIPTIONS: &str = "registry_subscriptions";
    /// Operations deferred while offline.
    pub const OFFLINE_QUEUE: &str = "offline_queue";
    /// Entries discovered through subscriptions.
    pub const DISCOVERY: &str = "registry_discovery";
    /// Conflicts awaiting manual resolution.
    pub const CONFLICTS: &str = "registry_conflicts";
}

/// A durable store of JSON values keyed by string.
///
/// Implementations must make `set` durable before returning `Ok`.
pub trait KeyValueStore: Send + Sync {
    /// Reads the value stored under `key`.
    fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: Value) -> StorageResult<()>;

    /// Removes `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> StorageResult<()>;
}

/// Typed helpers over any [`KeyValueStore`].
pub trait KeyValueStoreExt {
    /// Reads and deserializes the value under `key`.
    fn load<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>>;

    /// Serializes and stores `value` under `key`.
    fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {
    fn load<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.get(key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        self.set(key, serde_json::to_value(value)?)
    }
}

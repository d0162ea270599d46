//! Registry publishing and subscription sync for Memex.
//!
//! A user's public records are projected into a registry document, which is
//! published to a content-addressed store. Other users subscribe to the
//! registry by its CID and periodically merge its entries into their own
//! discovery feed.
//!
//! # Architecture
//!
//! Every network-facing operation tolerates being offline. Work that cannot
//! run now is parked in a persistent queue and replayed when connectivity
//! returns.
//!
//! ## Components
//!
//! - **RegistryStore**: The single persisted registry document
//! - **PublishPipeline**: Serializes and uploads the registry
//! - **SubscriptionManager**: Followed registries and discovered entries
//! - **OfflineQueue**: Deduplicated, retry-bounded deferred work
//! - **ConflictResolver**: Last-write-wins, shallow merge, or manual
//! - **CrossSpaceSyncDaemon**: Fans public records out across joined spaces
//! - **Memex**: The facade wiring all of the above together
//!
//! ## Publish Process
//!
//! 1. **Project**: Public records with a content CID become entries
//! 2. **Serialize**: The registry is encoded as JSON
//! 3. **Upload**: The bytes are put to the content store
//! 4. **Record**: The returned CID is stored on the registry
//!
//! # Example
//!
//! ```
//! use memex_storage::MemoryKvStore;
//! use memex_sync::content_store::mock::MemoryContentStore;
//! use memex_sync::{ManualConnectivity, Memex, MemexConfig};
//! use std::sync::Arc;
//!
//! let memex = Memex::builder(
//!     MemexConfig::default(),
//!     Arc::new(MemoryKvStore::new()),
//!     Arc::new(MemoryContentStore::new()),
//!     Arc::new(ManualConnectivity::new(true)),
//! )
//! .build()
//! .unwrap();
//!
//! assert!(memex.registry().is_none());
//! ```

pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod content_store;
pub mod cross_space;
mod error;
pub mod offline_queue;
pub mod publish;
pub mod registry;
pub mod registry_store;
pub mod safety;
mod service;
pub mod space;
pub mod subscription;

pub use config::{MemexConfig, MAX_RETRIES, REGISTRY_FORMAT, REGISTRY_VERSION};
pub use conflict::{
    auto_resolve, shallow_merge, ConflictKind, ConflictResolution, ConflictResolver,
    ResolutionChoice,
};
pub use connectivity::{check_reachability, ConnectivityMonitor, ManualConnectivity};
pub use content_store::{ContentStore, PutMetadata, PutResult};
pub use cross_space::{CrossSpaceMemory, CrossSpaceSyncDaemon, CycleReport, DaemonState};
pub use error::{SyncError, SyncResult};
pub use offline_queue::{OfflineQueue, QueueExecutor, QueueReport};
pub use publish::{PublishPipeline, PublishReceipt};
pub use registry::{ProfileSummary, PublishMetadata, Registry, RegistryEntry, RegistryMetadata};
pub use registry_store::RegistryStore;
pub use safety::{AllowAll, SafetyCheck, SafetyVerdict};
pub use service::{
    backoff_delay, EnhancedStats, Memex, MemexBuilder, MemexStats, Outcome, RecordSource,
    RegistryStats, ResyncReport, StaticRecordSource,
};
pub use space::{Space, SpaceFilter, SpaceRecord, SpaceTransport};
pub use subscription::{
    DiscoveredEntry, OperationKind, OperationStatus, RegistryResolver, RegistrySubscription,
    SubscriptionManager, SubscriptionSettings, SubscriptionStats, SyncFrequency, SyncOperation,
};

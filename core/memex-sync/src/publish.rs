//! Publishing the registry to the content store.

use crate::content_store::{with_timeout, ContentStore, PutMetadata};
use crate::error::{SyncError, SyncResult};
use crate::registry::PublishMetadata;
use crate::registry_store::RegistryStore;
use memex_types::{Cid, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of a completed publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub cid: Cid,
    pub size: u64,
    pub published_at: Timestamp,
}

/// Serializes the registry and pushes it to the content store.
///
/// The pipeline never retries. Callers that want deferral on connectivity
/// failures go through the offline-aware service methods.
pub struct PublishPipeline {
    registry: Arc<RegistryStore>,
    store: Arc<dyn ContentStore>,
    timeout: Duration,
}

impl PublishPipeline {
    /// Creates a pipeline over a registry store and a content store.
    pub fn new(
        registry: Arc<RegistryStore>,
        store: Arc<dyn ContentStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            timeout,
        }
    }

    /// Publishes the current registry.
    ///
    /// The `updated` timestamp is advanced before serialization, so
    /// publishing an unchanged registry still yields new bytes and a new CID.
    pub async fn publish(&self) -> SyncResult<PublishReceipt> {
        let writer = self.registry.begin().await;
        let mut registry = writer
            .current()
            .ok_or_else(|| SyncError::NotFound("registry not created".into()))?;
        registry.validate()?;
        registry.metadata.updated = registry.metadata.updated.tick();

        let bytes = registry.to_canonical_bytes()?;
        debug!(
            "Publishing registry {} ({} entries, {} bytes)",
            registry.id(),
            registry.metadata.total_entries,
            bytes.len()
        );

        let metadata = PutMetadata {
            name: Some(format!("{}.json", registry.id())),
            content_type: Some("application/json".to_string()),
        };
        let put = match with_timeout(self.timeout, self.store.put(bytes, Some(metadata))).await {
            Ok(put) => put,
            Err(e) => {
                warn!("Registry publish failed: {}", e);
                return Err(e);
            }
        };

        registry.ipfs_metadata = Some(PublishMetadata {
            cid: put.cid.clone(),
            published_at: put.timestamp,
            size: put.size,
        });
        writer.commit(registry)?;

        info!("Published registry as {} ({} bytes)", put.cid, put.size);
        Ok(PublishReceipt {
            cid: put.cid,
            size: put.size,
            published_at: put.timestamp,
        })
    }
}

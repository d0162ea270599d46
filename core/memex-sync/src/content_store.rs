//! Content-addressed store abstraction.
//!
//! The storage network itself (upload, pinning, gateway fetch) lives outside
//! this crate. The core only needs to put bytes, get bytes back by CID, and
//! ask whether a CID is reachable.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use memex_types::{Cid, Timestamp};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Optional metadata attached to an upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PutMetadata {
    /// Human-readable name of the object.
    pub name: Option<String>,
    /// MIME type of the bytes.
    pub content_type: Option<String>,
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutResult {
    /// Address of the stored bytes.
    pub cid: Cid,
    /// Stored size in bytes.
    pub size: u64,
    /// When the store accepted the bytes.
    pub timestamp: Timestamp,
}

/// A client for the content-addressed storage network.
///
/// Implementations report every transport failure as
/// [`SyncError::StoreUnavailable`] and a missing CID as
/// [`SyncError::NotFound`].
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Uploads bytes and returns their content identifier.
    async fn put(&self, bytes: Vec<u8>, metadata: Option<PutMetadata>) -> SyncResult<PutResult>;

    /// Fetches the bytes stored under `cid`.
    async fn get(&self, cid: &Cid) -> SyncResult<Vec<u8>>;

    /// Checks whether `cid` is retrievable. An `Err` means the gateway did
    /// not answer at all.
    async fn head_check(&self, cid: &Cid) -> SyncResult<bool>;
}

/// Runs a network future under a deadline. Expiry maps to
/// [`SyncError::Timeout`]: the outcome is unknown and retrying is safe.
pub(crate) async fn with_timeout<T, F>(limit: Duration, fut: F) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Timeout),
    }
}

/// An in-memory content store for testing and offline demos.
pub mod mock {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Stores blobs in a map, addressed by a SHA-256 derived CID.
    #[derive(Debug)]
    pub struct MemoryContentStore {
        blobs: Mutex<HashMap<Cid, Vec<u8>>>,
        available: AtomicBool,
        puts: AtomicUsize,
        gets: AtomicUsize,
    }

    impl Default for MemoryContentStore {
        fn default() -> Self {
            Self {
                blobs: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                puts: AtomicUsize::new(0),
                gets: AtomicUsize::new(0),
            }
        }
    }

    impl MemoryContentStore {
        /// Creates an empty, available store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Computes the CID this store assigns to `bytes`.
        pub fn cid_for(bytes: &[u8]) -> Cid {
            let digest = Sha256::digest(bytes);
            Cid::parse(&format!("bafk{}", hex::encode(digest)))
                .expect("hex digest is never blank")
        }

        /// Seeds bytes under an arbitrary CID.
        pub fn insert(&self, cid: Cid, bytes: Vec<u8>) {
            self.blobs.lock().unwrap().insert(cid, bytes);
        }

        /// Toggles availability. While unavailable every call fails with
        /// `StoreUnavailable`.
        pub fn set_available(&self, available: bool) {
            self.available.store(available, Ordering::SeqCst);
        }

        /// Number of successful uploads.
        pub fn put_count(&self) -> usize {
            self.puts.load(Ordering::SeqCst)
        }

        /// Number of successful fetches.
        pub fn get_count(&self) -> usize {
            self.gets.load(Ordering::SeqCst)
        }

        /// Whether `cid` is stored.
        pub fn contains(&self, cid: &Cid) -> bool {
            self.blobs.lock().unwrap().contains_key(cid)
        }

        fn check_available(&self) -> SyncResult<()> {
            if self.available.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(SyncError::StoreUnavailable("gateway down".into()))
            }
        }
    }

    #[async_trait]
    impl ContentStore for MemoryContentStore {
        async fn put(
            &self,
            bytes: Vec<u8>,
            _metadata: Option<PutMetadata>,
        ) -> SyncResult<PutResult> {
            self.check_available()?;
            let cid = Self::cid_for(&bytes);
            let size = bytes.len() as u64;
            self.blobs.lock().unwrap().insert(cid.clone(), bytes);
            self.puts.fetch_add(1, Ordering::SeqCst);
            Ok(PutResult {
                cid,
                size,
                timestamp: Timestamp::now(),
            })
        }

        async fn get(&self, cid: &Cid) -> SyncResult<Vec<u8>> {
            self.check_available()?;
            let bytes = self
                .blobs
                .lock()
                .unwrap()
                .get(cid)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(format!("cid {cid}")))?;
            self.gets.fetch_add(1, Ordering::SeqCst);
            Ok(bytes)
        }

        async fn head_check(&self, cid: &Cid) -> SyncResult<bool> {
            self.check_available()?;
            Ok(self.contains(cid))
        }
    }
}

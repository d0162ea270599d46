//! Core type definitions for Memex.
//!
//! This crate defines the fundamental types shared by the registry,
//! storage and sync layers:
//! - Content identifiers, user/space identifiers and UUID v7 handles
//! - Millisecond timestamps with a monotonic `tick`
//! - The local record model that registries are projected from
//!
//! Registry documents themselves live in `memex-sync`, next to the code
//! that publishes and merges them.

mod ids;
mod record;
mod timestamp;

pub use ids::{Cid, ConflictId, OperationId, SpaceId, SubscriptionId, UserId};
pub use record::{MemoryRecord, Visibility};
pub use timestamp::Timestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid content identifier: {0:?}")]
    InvalidCid(String),
}

//! The registry document.
//!
//! A registry is a user's published list of public entries plus metadata.
//! It is serialized to canonical JSON bytes and stored in the content store;
//! the resulting CID is what other users subscribe to.

use crate::config::{REGISTRY_FORMAT, REGISTRY_VERSION};
use crate::error::{SyncError, SyncResult};
use memex_types::{Cid, MemoryRecord, Timestamp, UserId, Visibility};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Profile summary embedded in a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSummary {
    pub display_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
}

impl ProfileSummary {
    /// Creates a profile with only a display name.
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            avatar: None,
            contact: None,
        }
    }
}

/// Aggregate facts about a registry's entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryMetadata {
    pub created: Timestamp,
    pub updated: Timestamp,
    /// Always equal to the number of entries.
    pub total_entries: usize,
    /// Sum of entry content sizes in bytes.
    pub total_size: u64,
    /// Sorted union of entry tags.
    pub tags: Vec<String>,
}

/// Where and when the registry was last published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishMetadata {
    pub cid: Cid,
    pub published_at: Timestamp,
    pub size: u64,
}

/// A shareable projection of a public record.
///
/// Entries are never edited in place; re-projection replaces them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    /// Same as the source record id.
    pub id: String,
    pub title: String,
    pub content: String,
    pub content_cid: Cid,
    pub author_id: UserId,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_avatar: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub timestamp: Timestamp,
    pub visibility: Visibility,
}

impl RegistryEntry {
    /// Projects a record into an entry. Returns `None` unless the record is
    /// public and has a non-blank content identifier.
    pub fn project(record: &MemoryRecord, anonymize: bool) -> Option<Self> {
        if !record.is_publishable() {
            return None;
        }
        let content_cid = Cid::parse(record.content_cid.as_deref()?).ok()?;
        let (author_id, author_name, author_avatar) = if anonymize {
            (UserId::new("anonymous"), Some("Anonymous".to_string()), None)
        } else {
            (
                record.author_id.clone(),
                record.author_name.clone(),
                record.author_avatar.clone(),
            )
        };
        Some(Self {
            id: record.id.clone(),
            title: record.title.clone(),
            content: record.content.clone(),
            content_cid,
            author_id,
            author_name,
            author_avatar,
            tags: record.tags.clone(),
            timestamp: record.timestamp,
            visibility: Visibility::Public,
        })
    }

    /// Content size in bytes.
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// A user's registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    pub format: String,
    pub version: u32,
    pub owner: UserId,
    pub profile: ProfileSummary,
    pub metadata: RegistryMetadata,
    pub public_memories: Vec<RegistryEntry>,
    #[serde(default)]
    pub ipfs_metadata: Option<PublishMetadata>,
}

impl Registry {
    /// Creates an empty registry for `owner`.
    pub fn new(owner: UserId, profile: ProfileSummary) -> Self {
        let now = Timestamp::now();
        Self {
            format: REGISTRY_FORMAT.to_string(),
            version: REGISTRY_VERSION,
            owner,
            profile,
            metadata: RegistryMetadata {
                created: now,
                updated: now,
                total_entries: 0,
                total_size: 0,
                tags: Vec::new(),
            },
            public_memories: Vec::new(),
            ipfs_metadata: None,
        }
    }

    /// Stable id of this registry, derived from its owner.
    pub fn id(&self) -> String {
        format!("registry-{}", self.owner)
    }

    /// Replaces all entries and recomputes metadata. `updated` always
    /// advances.
    pub fn replace_entries(&mut self, entries: Vec<RegistryEntry>) {
        self.public_memories = entries;
        self.recompute_metadata();
    }

    /// Recomputes totals and tags and advances `updated`.
    pub fn recompute_metadata(&mut self) {
        let tags: BTreeSet<&str> = self
            .public_memories
            .iter()
            .flat_map(|e| e.tags.iter().map(String::as_str))
            .collect();
        self.metadata.total_entries = self.public_memories.len();
        self.metadata.total_size = self.public_memories.iter().map(RegistryEntry::size).sum();
        self.metadata.tags = tags.into_iter().map(str::to_string).collect();
        self.metadata.updated = self.metadata.updated.tick();
    }

    /// Checks the document invariants.
    pub fn validate(&self) -> SyncResult<()> {
        if self.format != REGISTRY_FORMAT {
            return Err(SyncError::InvalidRegistry(format!(
                "unknown format tag {:?}",
                self.format
            )));
        }
        if self.version > REGISTRY_VERSION {
            return Err(SyncError::InvalidRegistry(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.metadata.total_entries != self.public_memories.len() {
            return Err(SyncError::InvalidRegistry(format!(
                "totalEntries {} but {} entries",
                self.metadata.total_entries,
                self.public_memories.len()
            )));
        }
        Ok(())
    }

    /// Serializes to the bytes that get content-addressed.
    ///
    /// Field order follows the struct declaration, so equal registries
    /// always produce equal bytes.
    pub fn to_canonical_bytes(&self) -> SyncResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes and validates fetched bytes.
    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        let registry: Registry = serde_json::from_slice(bytes)
            .map_err(|e| SyncError::InvalidRegistry(e.to_string()))?;
        registry.validate()?;
        Ok(registry)
    }
}

//! Local records, the private source material of a registry.
//!
//! A record is owned by the application embedding Memex. The registry layer
//! only reads records and projects the public ones into shareable entries.

use crate::{Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// Who may see a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Visible only to the owner.
    #[default]
    Private,
    /// Visible to explicitly chosen peers.
    Shared,
    /// Visible to anyone; eligible for registry publication.
    Public,
}

/// A user-authored record held in local storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    /// Stable record id. Becomes the registry entry id.
    pub id: String,
    /// Short title.
    pub title: String,
    /// Body or a reference to it.
    pub content: String,
    /// Content identifier of the uploaded body, once it has been stored.
    #[serde(default)]
    pub content_cid: Option<String>,
    /// Author id.
    pub author_id: UserId,
    /// Author display name.
    #[serde(default)]
    pub author_name: Option<String>,
    /// Author avatar URL.
    #[serde(default)]
    pub author_avatar: Option<String>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Last modification time.
    pub timestamp: Timestamp,
    /// Visibility of the record.
    #[serde(default)]
    pub visibility: Visibility,
}

impl MemoryRecord {
    /// Creates a private record with no content identifier.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        author_id: UserId,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            content_cid: None,
            author_id,
            author_name: None,
            author_avatar: None,
            tags: Vec::new(),
            timestamp: Timestamp::now(),
            visibility: Visibility::Private,
        }
    }

    /// Sets the visibility.
    #[must_use]
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// Sets the content identifier.
    #[must_use]
    pub fn with_content_cid(mut self, cid: impl Into<String>) -> Self {
        self.content_cid = Some(cid.into());
        self
    }

    /// Sets the tags.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the author display name.
    #[must_use]
    pub fn with_author_name(mut self, name: impl Into<String>) -> Self {
        self.author_name = Some(name.into());
        self
    }

    /// Returns true if the record may be projected into a registry:
    /// it is public and carries a non-blank content identifier.
    #[must_use]
    pub fn is_publishable(&self) -> bool {
        self.visibility == Visibility::Public
            && self
                .content_cid
                .as_deref()
                .is_some_and(|cid| !cid.trim().is_empty())
    }
}

//! Pluggable safety check for content crossing a trust boundary.
//!
//! Entries pulled from subscribed registries and records propagated between
//! spaces pass through a [`SafetyCheck`] first. Moderation policy itself is
//! the embedder's business; the default allows everything.

use crate::registry::RegistryEntry;
use crate::space::SpaceRecord;

/// The verdict for a single item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Allow,
    Reject { reason: String },
}

impl SafetyVerdict {
    /// Whether the item may pass.
    pub fn is_allowed(&self) -> bool {
        matches!(self, SafetyVerdict::Allow)
    }
}

/// Decides whether foreign content may enter local indexes or other spaces.
pub trait SafetyCheck: Send + Sync {
    /// Checks an entry discovered through a subscription.
    fn check_entry(&self, entry: &RegistryEntry) -> SafetyVerdict;

    /// Checks a record about to be propagated into another space.
    fn check_record(&self, record: &SpaceRecord) -> SafetyVerdict;
}

/// Lets everything through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl SafetyCheck for AllowAll {
    fn check_entry(&self, _entry: &RegistryEntry) -> SafetyVerdict {
        SafetyVerdict::Allow
    }

    fn check_record(&self, _record: &SpaceRecord) -> SafetyVerdict {
        SafetyVerdict::Allow
    }
}

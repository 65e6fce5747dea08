//! Stamped entities and the keys that partition them.
//!
//! Every aggregate cached by Keystone carries a *concurrency stamp*: an
//! opaque version string regenerated by the backing store on every successful
//! write. The stamp is what makes optimistic-concurrency conflict detection
//! (and the cache's reconciliation probe) possible.

use crate::EntityId;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// CONCURRENCY STAMP
// ============================================================================

/// Opaque version string attached to every stored row.
///
/// The backing store replaces the stamp on every successful write, so two
/// observers holding the same stamp are guaranteed to be looking at the same
/// version of the row. An *empty* stamp is the base recorded when a write is
/// announced for an entity that does not exist yet (an insert in flight).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ConcurrencyStamp(String);

impl ConcurrencyStamp {
    /// Generate a fresh stamp. Called by the store on every successful write.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// The empty base stamp used when announcing a write for a row that does
    /// not exist yet.
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Returns true if this is the empty base stamp.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw stamp string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConcurrencyStamp {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConcurrencyStamp {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ConcurrencyStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// STAMPED ENTITY TRAIT
// ============================================================================

/// An aggregate that can be stored, stamped, and cached.
///
/// # Implementation Requirements
///
/// - `kind()` must return a consistent value for all instances
/// - `id()` must return the unique identifier for this instance
/// - `set_stamp()` is called only by the backing store after a successful write
/// - Implementations must be `Clone`, `Serialize`, and `DeserializeOwned` so
///   stores can persist them
/// - Implementations must be `Send + Sync + 'static` for async compatibility
pub trait StampedEntity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable name of this aggregate type, used to partition actors, stamp
    /// slots, and lock names.
    fn kind() -> &'static str;

    /// Get the unique identifier for this entity.
    fn id(&self) -> EntityId;

    /// Get the current concurrency stamp.
    fn stamp(&self) -> &ConcurrencyStamp;

    /// Replace the concurrency stamp. Reserved for the backing store.
    fn set_stamp(&mut self, stamp: ConcurrencyStamp);
}

// ============================================================================
// ENTITY KEY
// ============================================================================

/// The `(kind, id)` pair that partitions every per-key component.
///
/// The cache actor, the pending-stamp slot, and the distributed lock for one
/// aggregate all derive their identity from this key, so operations on
/// different keys never contend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    kind: &'static str,
    id: EntityId,
}

impl EntityKey {
    /// Create a key for the given aggregate type and id.
    pub fn new<E: StampedEntity>(id: EntityId) -> Self {
        Self { kind: E::kind(), id }
    }

    /// Create a key from raw parts.
    pub fn from_parts(kind: &'static str, id: EntityId) -> Self {
        Self { kind, id }
    }

    /// The aggregate type name.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// The entity id.
    pub fn id(&self) -> EntityId {
        self.id
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::new_entity_id;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Widget {
        id: EntityId,
        stamp: ConcurrencyStamp,
    }

    impl StampedEntity for Widget {
        fn kind() -> &'static str {
            "Widget"
        }

        fn id(&self) -> EntityId {
            self.id
        }

        fn stamp(&self) -> &ConcurrencyStamp {
            &self.stamp
        }

        fn set_stamp(&mut self, stamp: ConcurrencyStamp) {
            self.stamp = stamp;
        }
    }

    #[test]
    fn test_stamp_generate_is_unique() {
        assert_ne!(ConcurrencyStamp::generate(), ConcurrencyStamp::generate());
    }

    #[test]
    fn test_empty_stamp() {
        assert!(ConcurrencyStamp::empty().is_empty());
        assert!(!ConcurrencyStamp::generate().is_empty());
    }

    #[test]
    fn test_entity_key_display() {
        let id = new_entity_id();
        let key = EntityKey::new::<Widget>(id);
        assert_eq!(format!("{}", key), format!("Widget:{}", id));
    }

    #[test]
    fn test_entity_key_partitions_by_kind_and_id() {
        let id = new_entity_id();
        let a = EntityKey::new::<Widget>(id);
        let b = EntityKey::from_parts("Widget", id);
        let c = EntityKey::from_parts("Gadget", id);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Stamps are opaque: whatever the store hands back round-trips
        /// unchanged, and only the empty string is the empty base.
        #[test]
        fn prop_stamp_round_trips_opaquely(s in "[ -~]{0,32}") {
            let stamp = ConcurrencyStamp::from(s.as_str());
            prop_assert_eq!(stamp.as_str(), s.as_str());
            prop_assert_eq!(stamp.to_string(), s.clone());
            prop_assert_eq!(stamp.is_empty(), s.is_empty());
        }

        #[test]
        fn prop_generated_stamps_never_collide(n in 1usize..32) {
            let stamps: Vec<ConcurrencyStamp> =
                (0..n).map(|_| ConcurrencyStamp::generate()).collect();
            let mut distinct = stamps.clone();
            distinct.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            distinct.dedup();
            prop_assert_eq!(distinct.len(), stamps.len());
        }
    }
}

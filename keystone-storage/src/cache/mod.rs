//! Actor-backed cache protocol keeping snapshots consistent with the store.
//!
//! Each key gets two single-writer components: a [`StampSlot`] holding the
//! pending concurrency stamp of an in-flight write, and an
//! [`EntityCacheActor`] holding the last-known snapshot. Writers announce a
//! write by opening the slot, mutate the store inside a unit of work, and
//! close the slot from a completion hook; readers that find the slot open
//! run a bounded reconciliation probe against the store instead of trusting
//! the snapshot.
//!
//! # Why a probe instead of a wait
//!
//! Because the store enforces optimistic concurrency, force-persisting the
//! *currently observed* row either succeeds (proving nothing changed, and
//! doubling as a safe refresh point) or conflicts (proving the in-flight
//! write just landed). Staleness resolution costs one round trip, never a
//! poll loop, and never touches the writers' distributed lock.

pub mod actor;
pub mod registry;
pub mod repository;
pub mod stamp;

pub use actor::{EntityCacheActor, Reconciliation};
pub use registry::CacheRegistry;
pub use repository::{CachedRepository, RepositoryConfig};
pub use stamp::{InMemoryStampJournal, StampJournal, StampSlot};

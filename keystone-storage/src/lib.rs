//! Keystone Storage - Store Traits, Unit of Work, and the Cache Protocol
//!
//! Defines the backing-store abstraction the cache core is specified
//! against, plus an in-memory transactional reference implementation used in
//! tests and single-process deployments. The actor-backed cache protocol
//! lives under [`cache`].

pub mod cache;
pub mod lock;
pub mod uow;

pub use cache::{
    CacheRegistry, CachedRepository, EntityCacheActor, InMemoryStampJournal, Reconciliation,
    RepositoryConfig, StampJournal, StampSlot,
};
pub use lock::{InProcessLockProvider, LockProvider};
pub use uow::{TxnId, TxnParticipant, UnitOfWork};

use async_trait::async_trait;
use keystone_core::{ConcurrencyStamp, EntityId, EntityKey, StampedEntity, StoreError, StoreResult};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

// ============================================================================
// ENTITY STORE TRAIT
// ============================================================================

/// Backing store for one aggregate type.
///
/// Every mutating operation executes against a [`UnitOfWork`]: transactional
/// scopes stage the write until the scope completes, non-transactional
/// scopes apply it immediately. The store regenerates the concurrency stamp
/// on every successful write and enforces the optimistic check on
/// `update_checked` and `delete`.
#[async_trait]
pub trait EntityStore<E: StampedEntity>: Send + Sync + 'static {
    /// Load an entity by id. Sees committed state plus this unit of work's
    /// own staged writes (read-committed visibility).
    async fn load(&self, uow: &UnitOfWork, id: EntityId) -> StoreResult<Option<E>>;

    /// Insert a new entity. Fails with `DuplicateKey` if the row exists.
    /// Returns the entity with its freshly generated stamp.
    async fn insert(&self, uow: &UnitOfWork, entity: E) -> StoreResult<E>;

    /// Update an entity, enforcing the optimistic-concurrency check: fails
    /// with `ConcurrencyConflict` if the stored stamp differs from the
    /// entity's stamp. A successful write regenerates the stamp.
    async fn update_checked(&self, uow: &UnitOfWork, entity: E) -> StoreResult<E>;

    /// Delete an entity, with the same optimistic-check semantics as
    /// `update_checked`.
    async fn delete(&self, uow: &UnitOfWork, entity: E) -> StoreResult<()>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

enum StagedWrite<E> {
    Upsert(E),
    Delete(EntityId),
}

struct StoreState<E> {
    /// Committed rows, visible to every unit of work.
    rows: HashMap<EntityId, E>,
    /// Writes staged by open transactional units of work.
    staged: HashMap<TxnId, Vec<StagedWrite<E>>>,
    /// Row write marks: a row mutated by an uncommitted transaction is
    /// unavailable to writers in other scopes until commit or rollback.
    marks: HashMap<EntityId, TxnId>,
}

/// In-memory transactional store with read-committed visibility.
///
/// A row mutated inside an open transactional scope is write-marked; a
/// second scope attempting to write it gets `RowBusy` (the signal the cache
/// actor's reconciliation probe relies on to detect a write that has neither
/// committed nor rolled back). Readers always see committed state, plus
/// their own staged writes.
pub struct InMemoryStore<E: StampedEntity> {
    participant_id: Uuid,
    state: Arc<RwLock<StoreState<E>>>,
}

impl<E: StampedEntity> Default for InMemoryStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: StampedEntity> InMemoryStore<E> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            participant_id: Uuid::now_v7(),
            state: Arc::new(RwLock::new(StoreState {
                rows: HashMap::new(),
                staged: HashMap::new(),
                marks: HashMap::new(),
            })),
        }
    }

    /// Number of committed rows.
    pub fn row_count(&self) -> usize {
        self.state.read().unwrap().rows.len()
    }

    fn participant(&self) -> Arc<dyn TxnParticipant> {
        Arc::new(StoreParticipant {
            id: self.participant_id,
            state: self.state.clone(),
        })
    }

    /// Current view of a row for one unit of work: the scope's own staged
    /// writes shadow committed state.
    fn view(state: &StoreState<E>, txn: TxnId, id: EntityId) -> Option<E> {
        if let Some(writes) = state.staged.get(&txn) {
            for write in writes.iter().rev() {
                match write {
                    StagedWrite::Upsert(e) if e.id() == id => return Some(e.clone()),
                    StagedWrite::Delete(deleted) if *deleted == id => return None,
                    _ => {}
                }
            }
        }
        state.rows.get(&id).cloned()
    }

    fn check_mark(state: &StoreState<E>, txn: TxnId, id: EntityId) -> StoreResult<()> {
        match state.marks.get(&id) {
            Some(owner) if *owner != txn => Err(StoreError::RowBusy {
                key: EntityKey::from_parts(E::kind(), id),
            }),
            _ => Ok(()),
        }
    }

    fn stage(
        state: &mut StoreState<E>,
        uow: &UnitOfWork,
        id: EntityId,
        write: StagedWrite<E>,
    ) {
        if uow.is_transactional() {
            state.marks.insert(id, uow.id());
            state.staged.entry(uow.id()).or_default().push(write);
        } else {
            match write {
                StagedWrite::Upsert(e) => {
                    state.rows.insert(id, e);
                }
                StagedWrite::Delete(deleted) => {
                    state.rows.remove(&deleted);
                }
            }
        }
    }
}

/// Commit/rollback half of the store, enlisted into units of work.
struct StoreParticipant<E> {
    id: Uuid,
    state: Arc<RwLock<StoreState<E>>>,
}

impl<E: StampedEntity> TxnParticipant for StoreParticipant<E> {
    fn participant_id(&self) -> Uuid {
        self.id
    }

    fn commit(&self, txn: TxnId) {
        let mut state = self.state.write().unwrap();
        if let Some(writes) = state.staged.remove(&txn) {
            for write in writes {
                match write {
                    StagedWrite::Upsert(e) => {
                        state.rows.insert(e.id(), e);
                    }
                    StagedWrite::Delete(id) => {
                        state.rows.remove(&id);
                    }
                }
            }
        }
        state.marks.retain(|_, owner| *owner != txn);
    }

    fn rollback(&self, txn: TxnId) {
        let mut state = self.state.write().unwrap();
        state.staged.remove(&txn);
        state.marks.retain(|_, owner| *owner != txn);
    }
}

#[async_trait]
impl<E: StampedEntity> EntityStore<E> for InMemoryStore<E> {
    async fn load(&self, uow: &UnitOfWork, id: EntityId) -> StoreResult<Option<E>> {
        uow.ensure_open()?;
        let state = self.state.read().unwrap();
        Ok(Self::view(&state, uow.id(), id))
    }

    async fn insert(&self, uow: &UnitOfWork, mut entity: E) -> StoreResult<E> {
        uow.ensure_open()?;
        uow.enlist(self.participant())?;
        let mut state = self.state.write().unwrap();
        let id = entity.id();
        Self::check_mark(&state, uow.id(), id)?;
        if Self::view(&state, uow.id(), id).is_some() {
            return Err(StoreError::DuplicateKey {
                key: EntityKey::from_parts(E::kind(), id),
            });
        }
        entity.set_stamp(ConcurrencyStamp::generate());
        Self::stage(&mut state, uow, id, StagedWrite::Upsert(entity.clone()));
        Ok(entity)
    }

    async fn update_checked(&self, uow: &UnitOfWork, mut entity: E) -> StoreResult<E> {
        uow.ensure_open()?;
        uow.enlist(self.participant())?;
        let mut state = self.state.write().unwrap();
        let id = entity.id();
        let key = EntityKey::from_parts(E::kind(), id);
        Self::check_mark(&state, uow.id(), id)?;
        let current = Self::view(&state, uow.id(), id).ok_or(StoreError::NotFound {
            key: key.clone(),
        })?;
        if current.stamp() != entity.stamp() {
            return Err(StoreError::ConcurrencyConflict {
                key,
                stored: current.stamp().to_string(),
                expected: entity.stamp().to_string(),
            });
        }
        entity.set_stamp(ConcurrencyStamp::generate());
        Self::stage(&mut state, uow, id, StagedWrite::Upsert(entity.clone()));
        Ok(entity)
    }

    async fn delete(&self, uow: &UnitOfWork, entity: E) -> StoreResult<()> {
        uow.ensure_open()?;
        uow.enlist(self.participant())?;
        let mut state = self.state.write().unwrap();
        let id = entity.id();
        let key = EntityKey::from_parts(E::kind(), id);
        Self::check_mark(&state, uow.id(), id)?;
        let current = Self::view(&state, uow.id(), id).ok_or(StoreError::NotFound {
            key: key.clone(),
        })?;
        if current.stamp() != entity.stamp() {
            return Err(StoreError::ConcurrencyConflict {
                key,
                stored: current.stamp().to_string(),
                expected: entity.stamp().to_string(),
            });
        }
        Self::stage(&mut state, uow, id, StagedWrite::Delete(id));
        Ok(())
    }
}

// ============================================================================
// TEST SUPPORT
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use keystone_core::{ConcurrencyStamp, EntityId, StampedEntity};
    use serde::{Deserialize, Serialize};

    /// The demo aggregate from the cache protocol scenarios: a book with a
    /// running sold counter.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Book {
        pub id: EntityId,
        pub name: String,
        pub sold: i32,
        pub stamp: ConcurrencyStamp,
    }

    impl Book {
        pub fn new(id: EntityId, name: &str) -> Self {
            Self {
                id,
                name: name.to_string(),
                sold: 0,
                stamp: ConcurrencyStamp::empty(),
            }
        }

        pub fn increase_sold(&mut self, number: i32) {
            self.sold += number;
        }
    }

    impl StampedEntity for Book {
        fn kind() -> &'static str {
            "Book"
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
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::testing::Book;
    use super::*;
    use keystone_core::new_entity_id;

    #[tokio::test]
    async fn test_insert_generates_stamp_and_loads_back() {
        let store = InMemoryStore::<Book>::new();
        let uow = UnitOfWork::begin(false);

        let saved = store
            .insert(&uow, Book::new(new_entity_id(), "MyBook"))
            .await
            .unwrap();
        assert!(!saved.stamp.is_empty());

        let loaded = store.load(&uow, saved.id).await.unwrap().unwrap();
        assert_eq!(loaded, saved);
    }

    #[tokio::test]
    async fn test_insert_duplicate_fails() {
        let store = InMemoryStore::<Book>::new();
        let uow = UnitOfWork::begin(false);
        let id = new_entity_id();

        store.insert(&uow, Book::new(id, "MyBook")).await.unwrap();
        let result = store.insert(&uow, Book::new(id, "Other")).await;
        assert!(matches!(result, Err(StoreError::DuplicateKey { .. })));
    }

    #[tokio::test]
    async fn test_update_checked_regenerates_stamp() {
        let store = InMemoryStore::<Book>::new();
        let uow = UnitOfWork::begin(false);

        let mut book = store
            .insert(&uow, Book::new(new_entity_id(), "MyBook"))
            .await
            .unwrap();
        let first_stamp = book.stamp.clone();

        book.increase_sold(2);
        let updated = store.update_checked(&uow, book).await.unwrap();
        assert_eq!(updated.sold, 2);
        assert_ne!(updated.stamp, first_stamp);
    }

    #[tokio::test]
    async fn test_update_checked_with_stale_stamp_conflicts() {
        let store = InMemoryStore::<Book>::new();
        let uow = UnitOfWork::begin(false);

        let book = store
            .insert(&uow, Book::new(new_entity_id(), "MyBook"))
            .await
            .unwrap();

        let mut winner = book.clone();
        winner.increase_sold(2);
        store.update_checked(&uow, winner).await.unwrap();

        let mut loser = book;
        loser.increase_sold(5);
        let result = store.update_checked(&uow, loser).await;
        assert!(matches!(result, Err(StoreError::ConcurrencyConflict { .. })));
    }

    #[tokio::test]
    async fn test_update_missing_row_is_not_found() {
        let store = InMemoryStore::<Book>::new();
        let uow = UnitOfWork::begin(false);
        let result = store
            .update_checked(&uow, Book::new(new_entity_id(), "Ghost"))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_removes_row() {
        let store = InMemoryStore::<Book>::new();
        let uow = UnitOfWork::begin(false);

        let book = store
            .insert(&uow, Book::new(new_entity_id(), "MyBook"))
            .await
            .unwrap();
        assert_eq!(store.row_count(), 1);
        store.delete(&uow, book.clone()).await.unwrap();
        assert!(store.load(&uow, book.id).await.unwrap().is_none());
        assert_eq!(store.row_count(), 0);
    }

    #[tokio::test]
    async fn test_transactional_write_invisible_until_commit() {
        let store = Arc::new(InMemoryStore::<Book>::new());
        let setup = UnitOfWork::begin(false);
        let book = store
            .insert(&setup, Book::new(new_entity_id(), "MyBook"))
            .await
            .unwrap();

        let writer = UnitOfWork::begin(true);
        let mut change = book.clone();
        change.increase_sold(2);
        store.update_checked(&writer, change).await.unwrap();

        // Another scope still sees the committed row, and nothing has been
        // applied yet.
        let reader = UnitOfWork::begin(false);
        let seen = store.load(&reader, book.id).await.unwrap().unwrap();
        assert_eq!(seen.sold, 0);
        assert_eq!(store.row_count(), 1);

        writer.complete().await.unwrap();
        let seen = store.load(&reader, book.id).await.unwrap().unwrap();
        assert_eq!(seen.sold, 2);
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_writes() {
        let store = Arc::new(InMemoryStore::<Book>::new());
        let setup = UnitOfWork::begin(false);
        let book = store
            .insert(&setup, Book::new(new_entity_id(), "MyBook"))
            .await
            .unwrap();

        let writer = UnitOfWork::begin(true);
        let mut change = book.clone();
        change.increase_sold(5);
        store.update_checked(&writer, change).await.unwrap();
        writer.rollback().await.unwrap();

        let reader = UnitOfWork::begin(false);
        let seen = store.load(&reader, book.id).await.unwrap().unwrap();
        assert_eq!(seen.sold, 0);
        assert_eq!(seen.stamp, book.stamp);
    }

    #[tokio::test]
    async fn test_marked_row_is_busy_for_other_writers() {
        let store = Arc::new(InMemoryStore::<Book>::new());
        let setup = UnitOfWork::begin(false);
        let book = store
            .insert(&setup, Book::new(new_entity_id(), "MyBook"))
            .await
            .unwrap();

        let writer = UnitOfWork::begin(true);
        let mut change = book.clone();
        change.increase_sold(2);
        store.update_checked(&writer, change).await.unwrap();

        // A second scope probing the same row is refused, not blocked.
        let prober = UnitOfWork::begin(false);
        let result = store.update_checked(&prober, book.clone()).await;
        assert!(matches!(result, Err(StoreError::RowBusy { .. })));

        writer.complete().await.unwrap();
        let result = store.update_checked(&prober, book).await;
        assert!(matches!(result, Err(StoreError::ConcurrencyConflict { .. })));
    }

    #[tokio::test]
    async fn test_own_staged_writes_are_visible() {
        let store = InMemoryStore::<Book>::new();
        let setup = UnitOfWork::begin(false);
        let book = store
            .insert(&setup, Book::new(new_entity_id(), "MyBook"))
            .await
            .unwrap();

        let writer = UnitOfWork::begin(true);
        let mut change = book.clone();
        change.increase_sold(3);
        store.update_checked(&writer, change).await.unwrap();

        let seen = store.load(&writer, book.id).await.unwrap().unwrap();
        assert_eq!(seen.sold, 3);
    }

    #[tokio::test]
    async fn test_row_mark_released_after_rollback() {
        let store = Arc::new(InMemoryStore::<Book>::new());
        let setup = UnitOfWork::begin(false);
        let book = store
            .insert(&setup, Book::new(new_entity_id(), "MyBook"))
            .await
            .unwrap();

        let writer = UnitOfWork::begin(true);
        let mut change = book.clone();
        change.increase_sold(2);
        store.update_checked(&writer, change).await.unwrap();
        writer.rollback().await.unwrap();

        // The mark is gone and the original stamp is still current.
        let late = UnitOfWork::begin(false);
        let updated = store.update_checked(&late, book).await.unwrap();
        assert_eq!(updated.sold, 0);
    }
}

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================

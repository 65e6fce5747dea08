//! Cache-aware repository.
//!
//! The only component allowed to mutate backing-store rows. Every write
//! follows the announce → mutate → finish protocol: the key's stamp slot is
//! opened before the store operation, and a completion hook registered on
//! the unit of work closes it after commit *or* rollback, forcing the cache
//! actor to reload on next access. Updates and deletes additionally run
//! under the distributed lock; inserts cannot conflict with an existing row
//! and skip it.

use crate::cache::actor::EntityCacheActor;
use crate::cache::registry::CacheRegistry;
use crate::lock::LockProvider;
use crate::uow::UnitOfWork;
use crate::EntityStore;
use keystone_core::{CacheError, EntityId, EntityKey, KeystoneResult, StampedEntity};
use std::sync::Arc;
use std::time::Duration;

/// Timeouts for the write protocol.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Bounded wait for the distributed lock on update/delete.
    pub lock_timeout: Duration,
    /// Bounded wait for an outstanding write to finish before a new one may
    /// be announced for the same key.
    pub write_in_flight_wait: Duration,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(3),
            write_in_flight_wait: Duration::from_secs(3),
        }
    }
}

/// Repository wrapping one aggregate type's store with the cache protocol.
pub struct CachedRepository<E, S, L>
where
    E: StampedEntity,
    S: EntityStore<E>,
    L: LockProvider,
{
    store: Arc<S>,
    registry: Arc<CacheRegistry<E, S>>,
    locks: Arc<L>,
    config: RepositoryConfig,
}

impl<E, S, L> CachedRepository<E, S, L>
where
    E: StampedEntity,
    S: EntityStore<E>,
    L: LockProvider,
{
    /// Create a repository with default timeouts.
    pub fn new(store: Arc<S>, registry: Arc<CacheRegistry<E, S>>, locks: Arc<L>) -> Self {
        Self::with_config(store, registry, locks, RepositoryConfig::default())
    }

    /// Create a repository with explicit timeouts.
    pub fn with_config(
        store: Arc<S>,
        registry: Arc<CacheRegistry<E, S>>,
        locks: Arc<L>,
        config: RepositoryConfig,
    ) -> Self {
        Self {
            store,
            registry,
            locks,
            config,
        }
    }

    /// Insert a new entity.
    ///
    /// No distributed lock: an insert cannot conflict with an existing row.
    /// The write is announced with the empty base stamp, and the completion
    /// hook converges the cache whether the unit of work commits or rolls
    /// back.
    pub async fn insert(&self, uow: &UnitOfWork, entity: E) -> KeystoneResult<E> {
        let actor = self.registry.actor(entity.id()).await?;
        actor.start_update(self.config.write_in_flight_wait).await?;
        let saved = self.store.insert(uow, entity).await?;
        self.finish_on_completed(uow, actor);
        Ok(saved)
    }

    /// Update an entity under the distributed lock, enforcing the store's
    /// optimistic-concurrency check.
    pub async fn update(&self, uow: &UnitOfWork, entity: E) -> KeystoneResult<E> {
        let guard = self.acquire_lock(entity.id()).await?;
        let actor = self.registry.actor(entity.id()).await?;
        actor.start_update(self.config.write_in_flight_wait).await?;
        let updated = self.store.update_checked(uow, entity).await?;
        drop(guard);
        self.finish_on_completed(uow, actor);
        Ok(updated)
    }

    /// Delete an entity under the distributed lock, with the same
    /// optimistic-check semantics as `update`.
    pub async fn delete(&self, uow: &UnitOfWork, entity: E) -> KeystoneResult<()> {
        let guard = self.acquire_lock(entity.id()).await?;
        let actor = self.registry.actor(entity.id()).await?;
        actor.start_update(self.config.write_in_flight_wait).await?;
        self.store.delete(uow, entity).await?;
        drop(guard);
        self.finish_on_completed(uow, actor);
        Ok(())
    }

    /// Read through the cache actor, retrying exactly once if a racing
    /// write could not be reconciled on the first attempt.
    pub async fn find(&self, id: EntityId) -> KeystoneResult<Option<E>> {
        let actor = self.registry.actor(id).await?;
        match actor.get_or_none().await {
            Err(CacheError::EntityChanging { .. }) => {
                tracing::info!(key = %actor.key(), "entity is changing; trying the read again");
                actor.get_or_none().await
            }
            other => other,
        }
    }

    /// Like [`find`](Self::find), but absent entities are an error.
    pub async fn get(&self, id: EntityId) -> KeystoneResult<E> {
        self.find(id).await?.ok_or(CacheError::NotFound {
            key: EntityKey::from_parts(E::kind(), id),
        })
    }

    async fn acquire_lock(&self, id: EntityId) -> KeystoneResult<L::Guard> {
        let name = EntityKey::from_parts(E::kind(), id).to_string();
        self.locks
            .try_acquire(&name, self.config.lock_timeout)
            .await
            .ok_or(CacheError::LockTimeout {
                name,
                timeout: self.config.lock_timeout,
            })
    }

    fn finish_on_completed(&self, uow: &UnitOfWork, actor: Arc<EntityCacheActor<E, S>>) {
        uow.on_completed(move || async move {
            if let Err(err) = actor.finish_update().await {
                tracing::warn!(key = %actor.key(), error = %err, "finish after completion failed");
            }
        });
    }
}

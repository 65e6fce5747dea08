//! Key-to-actor registry.
//!
//! One cache actor per key, created on first reference and retained for the
//! process lifetime. Entries are cheap, so there is no mid-life teardown;
//! in-process this is what makes "at most one live actor per key" true.

use crate::cache::actor::EntityCacheActor;
use crate::cache::stamp::StampJournal;
use crate::EntityStore;
use keystone_core::{EntityId, KeystoneResult, StampedEntity};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Concurrent registry of cache actors for one aggregate type.
pub struct CacheRegistry<E, S>
where
    E: StampedEntity,
    S: EntityStore<E>,
{
    store: Arc<S>,
    journal: Arc<dyn StampJournal>,
    actors: Mutex<HashMap<EntityId, Arc<EntityCacheActor<E, S>>>>,
}

impl<E, S> CacheRegistry<E, S>
where
    E: StampedEntity,
    S: EntityStore<E>,
{
    /// Create a registry over a store and a stamp journal shared by all of
    /// the registry's slots.
    pub fn new(store: Arc<S>, journal: Arc<dyn StampJournal>) -> Self {
        Self {
            store,
            journal,
            actors: Mutex::new(HashMap::new()),
        }
    }

    /// Get the actor for a key, creating it on first reference.
    pub async fn actor(&self, id: EntityId) -> KeystoneResult<Arc<EntityCacheActor<E, S>>> {
        if let Some(actor) = self.actors.lock().await.get(&id) {
            return Ok(actor.clone());
        }
        // Build outside the map lock: opening the slot awaits the journal,
        // and one key's journal load must not stall other keys. Re-check on
        // insert so a racing same-key creator settles on one actor.
        let actor = Arc::new(
            EntityCacheActor::new(id, self.store.clone(), self.journal.clone()).await?,
        );
        let mut actors = self.actors.lock().await;
        Ok(actors.entry(id).or_insert(actor).clone())
    }

    /// Number of actors created so far.
    pub async fn actor_count(&self) -> usize {
        self.actors.lock().await.len()
    }
}

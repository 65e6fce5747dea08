//! Per-key pending-stamp slot.
//!
//! `None` means no write is in flight and the cached snapshot is
//! trustworthy; `Some(stamp)` means a write targeting base version `stamp`
//! is in flight (an empty stamp marks an insert, where no row exists yet).
//! The slot is a pure state holder: all protocol decisions live in the cache
//! actor.

use async_trait::async_trait;
use keystone_core::{ConcurrencyStamp, EntityKey, StoreError, StoreResult};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Durable backing for slot values.
///
/// The slot writes through the journal before updating its in-memory state,
/// so a slot re-created for a key observes the last persisted value.
/// Persistence failure is fatal to the call and surfaces to the caller.
#[async_trait]
pub trait StampJournal: Send + Sync {
    /// Load the persisted value for a key, if any.
    async fn load(&self, key: &EntityKey) -> StoreResult<Option<ConcurrencyStamp>>;

    /// Persist the value for a key. `None` clears the entry.
    async fn persist(&self, key: &EntityKey, value: Option<&ConcurrencyStamp>) -> StoreResult<()>;
}

/// In-memory journal for tests and single-process deployments.
#[derive(Default)]
pub struct InMemoryStampJournal {
    entries: RwLock<HashMap<EntityKey, ConcurrencyStamp>>,
}

impl InMemoryStampJournal {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StampJournal for InMemoryStampJournal {
    async fn load(&self, key: &EntityKey) -> StoreResult<Option<ConcurrencyStamp>> {
        Ok(self.entries.read().unwrap().get(key).cloned())
    }

    async fn persist(&self, key: &EntityKey, value: Option<&ConcurrencyStamp>) -> StoreResult<()> {
        let mut entries = self.entries.write().unwrap();
        match value {
            Some(stamp) => {
                entries.insert(key.clone(), stamp.clone());
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(())
    }
}

/// Single-writer holder of one key's pending stamp.
pub struct StampSlot {
    key: EntityKey,
    journal: std::sync::Arc<dyn StampJournal>,
    state: Mutex<Option<ConcurrencyStamp>>,
    cleared: Notify,
}

impl StampSlot {
    /// Open the slot for a key, loading the persisted value if present.
    pub async fn open(
        key: EntityKey,
        journal: std::sync::Arc<dyn StampJournal>,
    ) -> StoreResult<Self> {
        let initial = journal.load(&key).await?;
        Ok(Self {
            key,
            journal,
            state: Mutex::new(initial),
            cleared: Notify::new(),
        })
    }

    /// The key this slot belongs to.
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Current value. No side effects, never fails.
    pub async fn get(&self) -> Option<ConcurrencyStamp> {
        self.state.lock().await.clone()
    }

    /// Replace the value, persisting before the in-memory state changes.
    /// Clearing wakes any waiter blocked in [`wait_cleared`](Self::wait_cleared).
    pub async fn set(&self, value: Option<ConcurrencyStamp>) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        self.journal
            .persist(&self.key, value.as_ref())
            .await
            .map_err(|err| StoreError::PersistFailed {
                key: self.key.clone(),
                reason: err.to_string(),
            })?;
        let cleared = value.is_none();
        *state = value;
        drop(state);
        if cleared {
            self.cleared.notify_waiters();
        }
        Ok(())
    }

    /// Atomically set `base` iff the slot is empty. Returns whether the slot
    /// was opened.
    pub async fn try_open(&self, base: ConcurrencyStamp) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(false);
        }
        self.journal
            .persist(&self.key, Some(&base))
            .await
            .map_err(|err| StoreError::PersistFailed {
                key: self.key.clone(),
                reason: err.to_string(),
            })?;
        *state = Some(base);
        Ok(true)
    }

    /// Wait up to `timeout` for the slot to become empty. Returns `true` if
    /// it is empty on return.
    pub async fn wait_cleared(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.cleared.notified();
            if self.state.lock().await.is_none() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.state.lock().await.is_none();
            }
        }
    }
}

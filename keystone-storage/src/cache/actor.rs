//! Per-key entity cache actor.
//!
//! Holds the last-known snapshot of one aggregate and resolves staleness on
//! read. All state transitions run under the actor's mutex, so for a given
//! key every operation is strictly serialized; different keys proceed fully
//! in parallel.
//!
//! The per-key state machine:
//!
//! ```text
//! Clean (slot empty) ── start_update ──→ WriteAnnounced (slot holds base stamp)
//!        ↑                                        │
//!        └── finish_update / reconcile ───────────┘
//! ```

use crate::cache::stamp::{StampJournal, StampSlot};
use crate::uow::UnitOfWork;
use crate::EntityStore;
use keystone_core::{
    CacheError, ConcurrencyStamp, EntityId, EntityKey, KeystoneResult, StampedEntity, StoreError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Outcome of a reconciliation attempt.
///
/// `Stale` means the in-flight write has neither committed nor rolled back,
/// so the cached value is not authoritative; the caller maps it to
/// `EntityChanging` and retries once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// The pending write has been accounted for; the snapshot is current.
    Resolved,
    /// The pending write is still undecided; the snapshot must not be served.
    Stale,
}

struct ActorState<E> {
    snapshot: Option<E>,
    loaded: bool,
}

/// Single-writer cache actor for one `(kind, id)` key.
pub struct EntityCacheActor<E, S>
where
    E: StampedEntity,
    S: EntityStore<E>,
{
    key: EntityKey,
    store: Arc<S>,
    slot: StampSlot,
    state: Mutex<ActorState<E>>,
}

impl<E, S> EntityCacheActor<E, S>
where
    E: StampedEntity,
    S: EntityStore<E>,
{
    /// Create the actor for a key, opening its stamp slot. The snapshot is
    /// loaded lazily on first use.
    pub async fn new(
        id: EntityId,
        store: Arc<S>,
        journal: Arc<dyn StampJournal>,
    ) -> KeystoneResult<Self> {
        let key = EntityKey::new::<E>(id);
        let slot = StampSlot::open(key.clone(), journal).await?;
        Ok(Self {
            key,
            store,
            slot,
            state: Mutex::new(ActorState {
                snapshot: None,
                loaded: false,
            }),
        })
    }

    /// The key this actor serves.
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Read the snapshot, resolving staleness first.
    ///
    /// Fast path: slot empty means no write is in flight and the snapshot is
    /// returned without touching the store. Otherwise a reconciliation probe
    /// runs; if it cannot resolve the pending write the read fails with
    /// `EntityChanging` and the caller retries exactly once.
    pub async fn get_or_none(&self) -> KeystoneResult<Option<E>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        if self.slot.get().await.is_none() {
            return Ok(state.snapshot.clone());
        }

        match self.reconcile_locked(&mut state).await? {
            Reconciliation::Resolved => Ok(state.snapshot.clone()),
            Reconciliation::Stale => Err(CacheError::EntityChanging {
                key: self.key.clone(),
            }),
        }
    }

    /// Announce a write, recording the snapshot's stamp (or the empty base
    /// for a row that does not exist yet) in the slot.
    ///
    /// If another write is already announced, waits up to `wait` for it to
    /// finish, then fails with `WriteInFlight`.
    pub async fn start_update(&self, wait: Duration) -> KeystoneResult<()> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            {
                let mut state = self.state.lock().await;
                self.ensure_loaded(&mut state).await?;
                let base = state
                    .snapshot
                    .as_ref()
                    .map(|e| e.stamp().clone())
                    .unwrap_or_else(ConcurrencyStamp::empty);
                if self.slot.try_open(base).await? {
                    return Ok(());
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() || !self.slot.wait_cleared(remaining).await {
                return Err(CacheError::WriteInFlight {
                    key: self.key.clone(),
                    waited: wait,
                });
            }
        }
    }

    /// Close a pending write: authoritative reload from the store, then
    /// clear the slot. No-op when the slot is already empty; safe to call
    /// repeatedly.
    pub async fn finish_update(&self) -> KeystoneResult<()> {
        let mut state = self.state.lock().await;
        self.finish_locked(&mut state).await
    }

    /// Run one reconciliation probe. Exposed for the repository's tests; in
    /// normal operation it is driven by [`get_or_none`](Self::get_or_none).
    pub async fn reconcile(&self) -> KeystoneResult<Reconciliation> {
        let mut state = self.state.lock().await;
        self.reconcile_locked(&mut state).await
    }

    async fn ensure_loaded(&self, state: &mut ActorState<E>) -> KeystoneResult<()> {
        if !state.loaded {
            self.read_state(state).await?;
        }
        Ok(())
    }

    /// Reload the snapshot from the store in a fresh non-transactional
    /// scope.
    async fn read_state(&self, state: &mut ActorState<E>) -> KeystoneResult<()> {
        let uow = UnitOfWork::begin(false);
        state.snapshot = self.store.load(&uow, self.key.id()).await?;
        state.loaded = true;
        uow.complete().await?;
        Ok(())
    }

    async fn finish_locked(&self, state: &mut ActorState<E>) -> KeystoneResult<()> {
        if self.slot.get().await.is_none() {
            return Ok(());
        }
        self.read_state(state).await?;
        self.slot.set(None).await?;
        Ok(())
    }

    /// The probe-based staleness resolution.
    ///
    /// Runs in a fresh non-transactional scope so the read is isolated from
    /// other local work and never blocks on the distributed lock.
    async fn reconcile_locked(&self, state: &mut ActorState<E>) -> KeystoneResult<Reconciliation> {
        let uow = UnitOfWork::begin(false);
        let fresh = self.store.load(&uow, self.key.id()).await?;

        // Re-read the slot: the writer may have finished while we loaded.
        let Some(base) = self.slot.get().await else {
            uow.complete().await?;
            return Ok(Reconciliation::Resolved);
        };

        let fresh = match fresh {
            Some(fresh) => fresh,
            None if base.is_empty() => {
                // Insert still in flight: no row to probe yet.
                uow.complete().await?;
                return Ok(Reconciliation::Stale);
            }
            None => {
                // The announced base stamp belonged to a row that is gone:
                // the pending delete landed.
                uow.complete().await?;
                self.finish_locked(state).await?;
                return Ok(Reconciliation::Resolved);
            }
        };

        if fresh.stamp() != &base {
            // The store moved past the announced base; the write (and
            // possibly later ones) committed.
            uow.complete().await?;
            self.finish_locked(state).await?;
            return Ok(Reconciliation::Resolved);
        }

        // The store still shows the pre-write stamp. Force-persist the
        // observed row unchanged: the optimistic check turns "is this row
        // stale?" into a single round trip.
        match self.store.update_checked(&uow, fresh).await {
            Ok(probed) => {
                uow.complete().await?;
                self.slot.set(None).await?;
                state.snapshot = Some(probed);
                state.loaded = true;
                tracing::info!(key = %self.key, "try update stamp succeeded");
                Ok(Reconciliation::Resolved)
            }
            Err(StoreError::ConcurrencyConflict { .. }) => {
                // The real writer committed between our load and the probe.
                tracing::info!(key = %self.key, "try update stamp failed; writer has committed");
                uow.complete().await?;
                self.finish_locked(state).await?;
                Ok(Reconciliation::Resolved)
            }
            Err(StoreError::RowBusy { .. }) => {
                // The write has neither committed nor rolled back.
                tracing::info!(key = %self.key, "row still held by the in-flight write");
                uow.complete().await?;
                Ok(Reconciliation::Stale)
            }
            Err(err) => Err(err.into()),
        }
    }
}

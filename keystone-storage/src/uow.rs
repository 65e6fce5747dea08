//! Unit of work with completion hooks.
//!
//! Writers mutate the backing store inside a unit of work and register
//! completion hooks that run exactly once after the work commits *or* rolls
//! back, never before. The cache protocol relies on this ordering: the hook
//! that closes a pending stamp must not fire while the mutation is still
//! undecided.
//!
//! Units of work are explicit handles. There is no ambient "current"
//! transaction; every `begin` starts a new, independent scope.

use futures_util::future::BoxFuture;
use keystone_core::{StoreError, StoreResult};
use std::future::Future;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Identifier of one unit of work, used by stores to key staged writes.
pub type TxnId = Uuid;

/// A store that stages writes against a unit of work.
///
/// Stores enlist themselves when the first operation executes against a
/// handle; `commit`/`rollback` are then driven by [`UnitOfWork::complete`]
/// and [`UnitOfWork::rollback`].
pub trait TxnParticipant: Send + Sync {
    /// Stable identity used to deduplicate enlistment.
    fn participant_id(&self) -> Uuid;

    /// Apply all writes staged against `txn`.
    fn commit(&self, txn: TxnId);

    /// Discard all writes staged against `txn` and release row marks.
    fn rollback(&self, txn: TxnId);
}

type CompletionHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct UowState {
    finished: bool,
    participants: Vec<Arc<dyn TxnParticipant>>,
    hooks: Vec<CompletionHook>,
}

/// A transactional scope over one or more enlisted stores.
///
/// - `transactional = true`: writes are staged and become visible atomically
///   at [`complete`](Self::complete); [`rollback`](Self::rollback) discards
///   them.
/// - `transactional = false`: writes apply immediately as each operation
///   executes; `complete` only flushes completion hooks. The cache actor's
///   reconciliation probe runs in such a scope so it never blocks on the
///   distributed lock.
pub struct UnitOfWork {
    id: TxnId,
    transactional: bool,
    state: Mutex<UowState>,
}

impl UnitOfWork {
    /// Begin a new, independent unit of work.
    pub fn begin(transactional: bool) -> Self {
        Self {
            id: Uuid::now_v7(),
            transactional,
            state: Mutex::new(UowState {
                finished: false,
                participants: Vec::new(),
                hooks: Vec::new(),
            }),
        }
    }

    /// The identifier stores use to key staged writes.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Whether writes are staged until `complete`.
    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    /// Fails with `TransactionClosed` once the scope has completed or rolled
    /// back. Stores call this before executing any operation.
    pub fn ensure_open(&self) -> StoreResult<()> {
        let state = self.state.lock().expect("uow state poisoned");
        if state.finished {
            return Err(StoreError::TransactionClosed);
        }
        Ok(())
    }

    /// Enlist a participant store. Idempotent per participant id.
    pub fn enlist(&self, participant: Arc<dyn TxnParticipant>) -> StoreResult<()> {
        let mut state = self.state.lock().expect("uow state poisoned");
        if state.finished {
            return Err(StoreError::TransactionClosed);
        }
        let id = participant.participant_id();
        if !state.participants.iter().any(|p| p.participant_id() == id) {
            state.participants.push(participant);
        }
        Ok(())
    }

    /// Register a hook that runs exactly once after this unit of work
    /// commits or rolls back, in registration order.
    pub fn on_completed<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock().expect("uow state poisoned");
        if state.finished {
            // Late registration after completion is a protocol violation.
            tracing::warn!(uow = %self.id, "completion hook registered on a closed unit of work");
            return;
        }
        state.hooks.push(Box::new(move || Box::pin(hook())));
    }

    /// Commit staged writes on every enlisted store, then run completion
    /// hooks.
    pub async fn complete(self) -> StoreResult<()> {
        let (participants, hooks) = self.finish()?;
        for participant in &participants {
            participant.commit(self.id);
        }
        for hook in hooks {
            hook().await;
        }
        Ok(())
    }

    /// Discard staged writes on every enlisted store, then run completion
    /// hooks. Hooks run on rollback too: the cache converges by reloading
    /// the (unchanged) row.
    pub async fn rollback(self) -> StoreResult<()> {
        let (participants, hooks) = self.finish()?;
        for participant in &participants {
            participant.rollback(self.id);
        }
        for hook in hooks {
            hook().await;
        }
        Ok(())
    }

    fn finish(&self) -> StoreResult<(Vec<Arc<dyn TxnParticipant>>, Vec<CompletionHook>)> {
        let mut state = self.state.lock().expect("uow state poisoned");
        if state.finished {
            return Err(StoreError::TransactionClosed);
        }
        state.finished = true;
        Ok((
            std::mem::take(&mut state.participants),
            std::mem::take(&mut state.hooks),
        ))
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        let mut state = self.state.lock().expect("uow state poisoned");
        if state.finished {
            return;
        }
        state.finished = true;
        // Release staged writes and row marks so the store does not leak
        // them, but async completion hooks cannot run here.
        for participant in state.participants.drain(..) {
            participant.rollback(self.id);
        }
        if !state.hooks.is_empty() || self.transactional {
            tracing::warn!(
                uow = %self.id,
                "unit of work dropped without complete() or rollback(); staged writes discarded"
            );
        }
        state.hooks.clear();
    }
}

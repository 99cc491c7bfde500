//! Transition plumbing shared by processors and command handlers.
//!
//! [`Lifecycle`] is the one place that calls [`EntityState::transition_to`],
//! so `state_count` bookkeeping, listener notification and persistence always
//! happen in the same order:
//!
//! ```text
//! transition(entity, state)
//!  → entity.transition_to(state, now)   state_count bookkeeping
//!  → observable.notify_before(..)       synchronous listeners
//!  → store.save(entity)                 releases the lease
//!  → observable.notify_after(..)        spawned listeners
//! ```
//!
//! [`EntityState::transition_to`]: crate::entity::EntityState::transition_to

use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::entity::StatefulEntity;
use crate::error::EngineError;
use crate::observable::{Observable, Transition, TransitionKind};
use crate::retry::RetryPolicy;
use crate::store::StateEntityStore;

pub struct Lifecycle<T: StatefulEntity> {
    store: Arc<dyn StateEntityStore<T>>,
    observable: Arc<Observable<T>>,
    clock: Arc<dyn Clock>,
}

impl<T: StatefulEntity> Clone for Lifecycle<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            observable: Arc::clone(&self.observable),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<T: StatefulEntity> Lifecycle<T> {
    pub fn new(
        store: Arc<dyn StateEntityStore<T>>,
        observable: Arc<Observable<T>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            observable,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn StateEntityStore<T>> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Persist a new entity and announce it.
    pub async fn create(&self, entity: &mut T) -> Result<Transition, EngineError> {
        let state = entity.state();
        let transition = Transition::of(entity, TransitionKind::Created, state);
        self.persist(entity, transition).await
    }

    /// Move the entity into `state` and persist it.
    ///
    /// A stale save error is returned unchanged; the in-memory mutation is then
    /// meaningless and the caller should drop the entity.
    pub async fn transition(&self, entity: &mut T, state: i32) -> Result<Transition, EngineError> {
        let now = self.now();
        let from = entity.entity_state_mut().transition_to(state, now);
        let transition = Transition::of(entity, TransitionKind::Transitioned, from);
        self.persist(entity, transition).await
    }

    /// Like [`Lifecycle::transition`], recording why the entity moved.
    pub async fn transition_with_error(
        &self,
        entity: &mut T,
        state: i32,
        detail: impl Into<String>,
    ) -> Result<Transition, EngineError> {
        entity.entity_state_mut().error_detail = Some(detail.into());
        self.transition(entity, state).await
    }

    /// Record a failed attempt.
    ///
    /// The entity re-enters its current state, advancing `state_count`. Once
    /// `policy` reports the retries exhausted it moves on to `terminal`
    /// instead. Either way a single write is made.
    pub async fn retry_or_terminate(
        &self,
        entity: &mut T,
        policy: &RetryPolicy,
        terminal: i32,
        detail: impl Into<String>,
    ) -> Result<Transition, EngineError> {
        let now = self.now();
        let current = entity.state();
        let base = entity.entity_state_mut();
        base.error_detail = Some(detail.into());
        base.transition_to(current, now);

        if policy.retries_exhausted(entity) {
            warn!(
                entity_id = %entity.id(),
                state = current,
                attempts = entity.state_count(),
                "retries exhausted"
            );
            entity.entity_state_mut().transition_to(terminal, now);
        }

        let transition = Transition::of(entity, TransitionKind::Transitioned, current);
        self.persist(entity, transition).await
    }

    /// Save field changes without a state transition. Listeners are not
    /// notified.
    pub async fn update(&self, entity: &mut T) -> Result<(), EngineError> {
        entity.entity_state_mut().updated_at = self.now();
        self.store.save(entity).await?;
        Ok(())
    }

    /// Mark the entity as awaiting an external acknowledgment.
    pub async fn mark_pending(&self, entity: &mut T) -> Result<(), EngineError> {
        entity.entity_state_mut().pending = true;
        self.update(entity).await
    }

    /// Release this holder's lease without writing anything.
    pub async fn release(&self, entity: &T) -> Result<(), EngineError> {
        self.store.break_lease(entity.id()).await?;
        debug!(entity_id = %entity.id(), "released lease");
        Ok(())
    }

    async fn persist(&self, entity: &mut T, transition: Transition) -> Result<Transition, EngineError> {
        self.observable.notify_before(entity, &transition);

        if let Err(e) = self.store.save(entity).await {
            if e.is_contention() {
                debug!(entity_id = %transition.entity_id, error = %e, "discarding stale transition");
            }
            return Err(e.into());
        }

        debug!(
            entity_id = %transition.entity_id,
            from = transition.from,
            to = transition.to,
            state_count = transition.state_count,
            "entity transitioned"
        );
        self.observable.notify_after(entity, &transition);
        Ok(transition)
    }
}

impl<T: StatefulEntity> std::fmt::Debug for Lifecycle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("holder_id", &self.store.holder_id())
            .field("observable", &self.observable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observable::{EntityListener, ListenerFailurePolicy};
    use crate::store::{InMemoryStateEntityStore, StoreError};
    use crate::testing::{ManualClock, TestEntity};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct SeenBeforeSave(Arc<Mutex<Vec<(i32, u32, u64)>>>);

    #[async_trait]
    impl EntityListener<TestEntity> for SeenBeforeSave {
        fn before_save(&self, entity: &TestEntity, t: &Transition) -> anyhow::Result<()> {
            self.0
                .lock()
                .unwrap()
                .push((t.to, t.state_count, entity.version()));
            Ok(())
        }
    }

    struct Rejecting;

    #[async_trait]
    impl EntityListener<TestEntity> for Rejecting {
        fn before_save(&self, _e: &TestEntity, _t: &Transition) -> anyhow::Result<()> {
            anyhow::bail!("nope")
        }
    }

    fn setup(
        observable: Observable<TestEntity>,
    ) -> (Lifecycle<TestEntity>, Arc<InMemoryStateEntityStore<TestEntity>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(InMemoryStateEntityStore::new("holder-a", clock.clone()));
        let lifecycle = Lifecycle::new(store.clone(), Arc::new(observable), clock.clone());
        (lifecycle, store, clock)
    }

    #[tokio::test]
    async fn test_transition_runs_listeners_before_save() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (lifecycle, store, clock) =
            setup(Observable::default().with_listener(SeenBeforeSave(seen.clone())));

        let mut entity = TestEntity::new("e-1", 100, 1_000);
        lifecycle.create(&mut entity).await.unwrap();

        clock.advance(10);
        let t = lifecycle.transition(&mut entity, 200).await.unwrap();
        assert_eq!((t.from, t.to, t.state_count), (100, 200, 0));

        clock.advance(10);
        lifecycle.transition(&mut entity, 200).await.unwrap();

        // listeners see the pre-save version
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(100, 0, 0), (200, 0, 1), (200, 1, 2)]
        );
        let stored = store.find_by_id("e-1").await.unwrap().unwrap();
        assert_eq!(stored.state(), 200);
        assert_eq!(stored.state_count(), 1);
        assert_eq!(stored.state_timestamp(), 1_020);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_save() {
        let (lifecycle, store, _clock) = setup(
            Observable::new(ListenerFailurePolicy::Halt).with_listener(Rejecting),
        );

        let mut entity = TestEntity::new("e-1", 100, 1_000);
        lifecycle.create(&mut entity).await.unwrap();
        lifecycle.transition(&mut entity, 300).await.unwrap();

        assert_eq!(store.find_by_id("e-1").await.unwrap().unwrap().state(), 300);
    }

    #[tokio::test]
    async fn test_transition_with_error_records_detail() {
        let (lifecycle, store, _clock) = setup(Observable::default());
        let mut entity = TestEntity::new("e-1", 100, 1_000);
        lifecycle.create(&mut entity).await.unwrap();

        lifecycle
            .transition_with_error(&mut entity, 900, "provider rejected")
            .await
            .unwrap();

        let stored = store.find_by_id("e-1").await.unwrap().unwrap();
        assert_eq!(stored.base.error_detail.as_deref(), Some("provider rejected"));
    }

    #[tokio::test]
    async fn test_stale_transition_is_rejected() {
        let (lifecycle, store, _clock) = setup(Observable::default());
        let mut entity = TestEntity::new("e-1", 100, 1_000);
        lifecycle.create(&mut entity).await.unwrap();

        store.with_holder("holder-b").find_by_id_and_lease("e-1").await.unwrap();

        let err = lifecycle.transition(&mut entity, 200).await.unwrap_err();
        assert!(err.is_contention());
        assert!(matches!(err, EngineError::Store(StoreError::AlreadyLeased { .. })));
    }

    #[tokio::test]
    async fn test_mark_pending_and_release() {
        let (lifecycle, store, _clock) = setup(Observable::default());
        let mut entity = TestEntity::new("e-1", 100, 1_000);
        lifecycle.create(&mut entity).await.unwrap();

        let leased = store.find_by_id_and_lease("e-1").await.unwrap();
        lifecycle.release(&leased).await.unwrap();
        assert!(store.lease_holder("e-1").is_none());

        let mut leased = store.find_by_id_and_lease("e-1").await.unwrap();
        lifecycle.mark_pending(&mut leased).await.unwrap();
        let stored = store.find_by_id("e-1").await.unwrap().unwrap();
        assert!(stored.is_pending());
        assert!(store.lease_holder("e-1").is_none());
    }

    #[tokio::test]
    async fn test_retry_or_terminate() {
        let (lifecycle, store, _clock) = setup(Observable::default());
        let policy = RetryPolicy::immediate(2);
        let mut entity = TestEntity::new("e-1", 200, 1_000);
        lifecycle.create(&mut entity).await.unwrap();

        let t = lifecycle
            .retry_or_terminate(&mut entity, &policy, 900, "timeout")
            .await
            .unwrap();
        assert_eq!((t.from, t.to, t.state_count), (200, 200, 1));
        assert!(t.is_retry());

        let t = lifecycle
            .retry_or_terminate(&mut entity, &policy, 900, "timeout again")
            .await
            .unwrap();
        assert_eq!((t.from, t.to), (200, 900));

        let stored = store.find_by_id("e-1").await.unwrap().unwrap();
        assert_eq!(stored.state(), 900);
        assert_eq!(stored.state_count(), 0);
        assert_eq!(stored.base.error_detail.as_deref(), Some("timeout again"));
    }
}

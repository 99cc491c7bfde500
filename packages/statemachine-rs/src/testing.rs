//! Test doubles for engine users.
//!
//! Enabled for this crate's own tests and, through the `testing` feature, for
//! downstream crates' tests.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::criteria::Criterion;
use crate::entity::{EntityState, StatefulEntity};
use crate::store::{StateEntityStore, StoreError};
use crate::wait::WaitStrategy;

// =============================================================================
// Clock
// =============================================================================

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Entity
// =============================================================================

/// Minimal entity with one free-form field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestEntity {
    pub base: EntityState,
    pub payload: Option<String>,
}

impl TestEntity {
    pub fn new(id: impl Into<String>, state: i32, state_timestamp: i64) -> Self {
        Self {
            base: EntityState::new(id, state, state_timestamp),
            payload: None,
        }
    }
}

impl StatefulEntity for TestEntity {
    fn entity_state(&self) -> &EntityState {
        &self.base
    }

    fn entity_state_mut(&mut self) -> &mut EntityState {
        &mut self.base
    }
}

// =============================================================================
// Wait Strategy
// =============================================================================

/// Fixed wait that counts how often the manager consulted it.
#[derive(Debug, Default)]
pub struct RecordingWaitStrategy {
    millis: u64,
    retry_calls: AtomicUsize,
    success_calls: AtomicUsize,
}

impl RecordingWaitStrategy {
    pub fn new(millis: u64) -> Self {
        Self {
            millis,
            ..Default::default()
        }
    }

    pub fn retry_calls(&self) -> usize {
        self.retry_calls.load(Ordering::SeqCst)
    }

    pub fn success_calls(&self) -> usize {
        self.success_calls.load(Ordering::SeqCst)
    }
}

impl WaitStrategy for RecordingWaitStrategy {
    fn retry_in_millis(&self) -> u64 {
        self.retry_calls.fetch_add(1, Ordering::SeqCst);
        self.millis
    }

    fn success(&self) {
        self.success_calls.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Failure Injection
// =============================================================================

/// Wraps a store and fails selected calls with [`StoreError::Backend`].
pub struct FlakyStore<T: StatefulEntity> {
    inner: Arc<dyn StateEntityStore<T>>,
    failing_batches: AtomicUsize,
    fail_saves: AtomicBool,
}

impl<T: StatefulEntity> FlakyStore<T> {
    pub fn new(inner: Arc<dyn StateEntityStore<T>>) -> Self {
        Self {
            inner,
            failing_batches: AtomicUsize::new(0),
            fail_saves: AtomicBool::new(false),
        }
    }

    /// Make the next `count` `next_not_leased` calls fail.
    pub fn fail_next_batches(&self, count: usize) {
        self.failing_batches.store(count, Ordering::SeqCst);
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    fn unavailable(op: &str) -> StoreError {
        StoreError::Backend(anyhow::anyhow!("injected failure in {}", op))
    }
}

#[async_trait]
impl<T: StatefulEntity> StateEntityStore<T> for FlakyStore<T> {
    fn holder_id(&self) -> &str {
        self.inner.holder_id()
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<T>, StoreError> {
        self.inner.find_by_id(id).await
    }

    async fn next_not_leased(
        &self,
        max: usize,
        criteria: &[Criterion<T>],
    ) -> Result<Vec<T>, StoreError> {
        let failing = self
            .failing_batches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Self::unavailable("next_not_leased"));
        }
        self.inner.next_not_leased(max, criteria).await
    }

    async fn find_by_id_and_lease(&self, id: &str) -> Result<T, StoreError> {
        self.inner.find_by_id_and_lease(id).await
    }

    async fn save(&self, entity: &mut T) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Self::unavailable("save"));
        }
        self.inner.save(entity).await
    }

    async fn query(&self, criteria: &[Criterion<T>], limit: usize) -> Result<Vec<T>, StoreError> {
        self.inner.query(criteria, limit).await
    }

    async fn delete_by_id(&self, id: &str, version: u64) -> Result<T, StoreError> {
        self.inner.delete_by_id(id, version).await
    }

    async fn break_lease(&self, id: &str) -> Result<(), StoreError> {
        self.inner.break_lease(id).await
    }
}

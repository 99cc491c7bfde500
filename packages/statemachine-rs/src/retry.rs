//! Per-entity retry bookkeeping helpers.
//!
//! The engine never decides when a business operation has failed too often;
//! process functions do. [`RetryPolicy`] packages the two questions they ask,
//! both answered from the centrally maintained `state_count`:
//!
//! - [`RetryPolicy::is_due`]: has the backoff delay for the current retry
//!   elapsed? A process function returns `false` ("not yet due") otherwise.
//! - [`RetryPolicy::retries_exhausted`]: has the entity re-entered its state
//!   `limit` times? The process function then moves it to a terminal state.
//!
//! [`RetryPolicy::due_criterion`] lifts `is_due` into a batch criterion so
//! entities still backing off never take a slot in a leased batch.

use std::sync::Arc;

use crate::clock::Clock;
use crate::criteria::Criterion;
use crate::entity::StatefulEntity;
use crate::error::EngineError;
use crate::wait::exponential_delay;

/// Retry limit plus exponential delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    limit: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(limit: u32, base_delay_ms: u64, max_delay_ms: u64) -> Result<Self, EngineError> {
        let policy = Self {
            limit,
            base_delay_ms,
            max_delay_ms,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// No delay between attempts.
    pub fn immediate(limit: u32) -> Self {
        Self {
            limit,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err(EngineError::InvalidConfig(format!(
                "retry max delay {}ms is below base delay {}ms",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        Ok(())
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Delay before the `state_count`-th retry.
    pub fn delay_for(&self, state_count: u32) -> u64 {
        exponential_delay(self.base_delay_ms, self.max_delay_ms, state_count)
    }

    /// Whether the entity may be attempted at `now`.
    ///
    /// First attempts (`state_count == 0`) are always due.
    pub fn is_due<T: StatefulEntity>(&self, entity: &T, now: i64) -> bool {
        let delay = self.delay_for(entity.state_count());
        let due_at = entity
            .state_timestamp()
            .saturating_add(i64::try_from(delay).unwrap_or(i64::MAX));
        now >= due_at
    }

    /// Batch criterion matching entities that are due at the clock's time
    /// when the batch is selected.
    pub fn due_criterion<T: StatefulEntity>(self, clock: Arc<dyn Clock>) -> Criterion<T> {
        Criterion::predicate(move |entity: &T| self.is_due(entity, clock.now_millis()))
    }

    /// Whether another failure must end the retry cycle.
    pub fn retries_exhausted<T: StatefulEntity>(&self, entity: &T) -> bool {
        entity.state_count() >= self.limit
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 7,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualClock, TestEntity};

    #[test]
    fn test_first_attempt_always_due() {
        let policy = RetryPolicy::new(3, 1_000, 10_000).unwrap();
        let entity = TestEntity::new("e", 100, 5_000);
        assert!(policy.is_due(&entity, 5_000));
    }

    #[test]
    fn test_retry_waits_for_backoff() {
        let policy = RetryPolicy::new(3, 1_000, 10_000).unwrap();
        let mut entity = TestEntity::new("e", 100, 0);
        entity.base.transition_to(100, 5_000);
        entity.base.transition_to(100, 5_000);
        assert_eq!(entity.state_count(), 2);

        // second retry waits 2s
        assert!(!policy.is_due(&entity, 6_999));
        assert!(policy.is_due(&entity, 7_000));
    }

    #[test]
    fn test_due_criterion_follows_clock() {
        let policy = RetryPolicy::new(3, 1_000, 10_000).unwrap();
        let clock = Arc::new(ManualClock::new(5_500));
        let due = policy.due_criterion::<TestEntity>(clock.clone());

        let fresh = TestEntity::new("fresh", 100, 5_000);
        let mut backing_off = TestEntity::new("retry", 100, 0);
        backing_off.base.transition_to(100, 5_000);

        assert!(due.matches(&fresh));
        assert!(!due.matches(&backing_off));
        clock.advance(500);
        assert!(due.matches(&backing_off));
    }

    #[test]
    fn test_retries_exhausted_at_limit() {
        let policy = RetryPolicy::immediate(3);
        let mut entity = TestEntity::new("e", 100, 0);
        for _ in 0..2 {
            entity.base.transition_to(100, 1);
        }
        assert!(!policy.retries_exhausted(&entity));
        entity.base.transition_to(100, 1);
        assert!(policy.retries_exhausted(&entity));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let err = RetryPolicy::new(3, 5_000, 1_000).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }
}

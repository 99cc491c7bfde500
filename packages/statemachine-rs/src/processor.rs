//! Processors: one batch of leased entities per round.
//!
//! A [`Processor`] is built from
//! - a batch generator (usually [`Processor::leasing`], which calls
//!   `next_not_leased` with a fixed set of criteria),
//! - an ordered list of guards, each a predicate plus an alternative process
//!   function; the first matching guard wins,
//! - a default process function,
//! - an optional not-processed callback.
//!
//! Each entity of a round is handled in isolation: an error or panic in one
//! process function is logged, counted as "not processed" and the round moves
//! on to the next entity.
//!
//! ```ignore
//! let processor = Processor::leasing("requesting", store.clone(), 20, vec![has_state(REQUESTING)],
//!     move |entity| { let manager = manager.clone(); async move { manager.send_request(entity).await } })
//!     .with_pending_guard(|e: &Negotiation| e.awaits_ack(), lifecycle.clone());
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::criteria::Criterion;
use crate::entity::StatefulEntity;
use crate::error::EngineError;
use crate::lifecycle::Lifecycle;
use crate::store::{StateEntityStore, StoreError};

pub type BatchFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<T>, StoreError>> + Send + Sync>;

/// Returns `Ok(true)` if the entity was handled (usually transitioned).
pub type ProcessFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

pub type NotProcessedFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub type GuardPredicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Counts from one round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundReport {
    /// Entities (or commands) that made progress.
    pub processed: usize,
    /// Entities (or whole rounds) that failed.
    pub failed: usize,
}

impl RoundReport {
    pub fn merge(&mut self, other: RoundReport) {
        self.processed += other.processed;
        self.failed += other.failed;
    }

    pub fn is_productive(&self) -> bool {
        self.processed > 0
    }
}

/// A unit of work the manager runs once per loop iteration.
#[async_trait]
pub trait ProcessRound: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run_round(&self) -> Result<RoundReport, EngineError>;
}

struct Guard<T> {
    predicate: GuardPredicate<T>,
    process: ProcessFn<T>,
}

pub struct Processor<T: StatefulEntity> {
    name: String,
    batch: BatchFn<T>,
    guards: Vec<Guard<T>>,
    process: ProcessFn<T>,
    on_not_processed: Option<NotProcessedFn<T>>,
}

impl<T: StatefulEntity> Processor<T> {
    pub fn new<B, BF, P, PF>(name: impl Into<String>, batch: B, process: P) -> Self
    where
        B: Fn() -> BF + Send + Sync + 'static,
        BF: Future<Output = Result<Vec<T>, StoreError>> + Send + 'static,
        P: Fn(T) -> PF + Send + Sync + 'static,
        PF: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Self {
            name: name.into(),
            batch: Arc::new(move || batch().boxed()),
            guards: Vec::new(),
            process: boxed_process(process),
            on_not_processed: None,
        }
    }

    /// Lease up to `max` entities matching `criteria` each round.
    ///
    /// Entities that are not processed get their lease released right away.
    pub fn leasing<P, PF>(
        name: impl Into<String>,
        store: Arc<dyn StateEntityStore<T>>,
        max: usize,
        criteria: Vec<Criterion<T>>,
        process: P,
    ) -> Self
    where
        P: Fn(T) -> PF + Send + Sync + 'static,
        PF: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        let criteria = Arc::new(criteria);
        let batch_store = Arc::clone(&store);
        let batch = move || {
            let store = Arc::clone(&batch_store);
            let criteria = Arc::clone(&criteria);
            async move { store.next_not_leased(max, &criteria).await }
        };

        Self::new(name, batch, process).with_on_not_processed(move |entity: T| {
            let store = Arc::clone(&store);
            async move {
                store.break_lease(entity.id()).await?;
                Ok(())
            }
        })
    }

    /// Route entities matching `predicate` to `process` instead of the default.
    pub fn with_guard<G, P, PF>(mut self, predicate: G, process: P) -> Self
    where
        G: Fn(&T) -> bool + Send + Sync + 'static,
        P: Fn(T) -> PF + Send + Sync + 'static,
        PF: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        self.guards.push(Guard {
            predicate: Arc::new(predicate),
            process: boxed_process(process),
        });
        self
    }

    /// Entities matching `predicate` are marked pending and saved instead of
    /// processed.
    pub fn with_pending_guard<G>(self, predicate: G, lifecycle: Lifecycle<T>) -> Self
    where
        G: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.with_guard(predicate, move |mut entity: T| {
            let lifecycle = lifecycle.clone();
            async move {
                lifecycle.mark_pending(&mut entity).await?;
                Ok(true)
            }
        })
    }

    pub fn with_on_not_processed<F, FF>(mut self, callback: F) -> Self
    where
        F: Fn(T) -> FF + Send + Sync + 'static,
        FF: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_not_processed = Some(Arc::new(move |entity| callback(entity).boxed()));
        self
    }

    pub fn guard_count(&self) -> usize {
        self.guards.len()
    }

    fn select(&self, entity: &T) -> &ProcessFn<T> {
        self.guards
            .iter()
            .find(|g| (g.predicate)(entity))
            .map(|g| &g.process)
            .unwrap_or(&self.process)
    }

    /// Obtain one batch and run every entity of it.
    ///
    /// Only a failing batch generator fails the whole round.
    pub async fn process(&self) -> Result<RoundReport, EngineError> {
        let batch = (self.batch)().await?;
        let mut report = RoundReport::default();

        for entity in batch {
            let entity_id = entity.id().to_string();
            let process = Arc::clone(self.select(&entity));
            let candidate = entity.clone();
            let outcome = AssertUnwindSafe(async move { process(candidate).await })
                .catch_unwind()
                .await;

            let processed = match outcome {
                Ok(Ok(processed)) => processed,
                Ok(Err(e)) => {
                    let contention = is_contention(&e);
                    let err = EngineError::process(&entity_id, e);
                    if contention {
                        debug!(processor = %self.name, error = %err, "entity changed underneath");
                    } else {
                        warn!(processor = %self.name, entity_id = %entity_id, error = %err, "process failed");
                    }
                    report.failed += 1;
                    false
                }
                Err(payload) => {
                    let err = EngineError::from_panic(format!("processor {}", self.name), payload);
                    error!(processor = %self.name, entity_id = %entity_id, error = %err, "process panicked");
                    report.failed += 1;
                    false
                }
            };

            if processed {
                report.processed += 1;
            } else {
                self.not_processed(entity, &entity_id).await;
            }
        }

        Ok(report)
    }

    async fn not_processed(&self, entity: T, entity_id: &str) {
        let Some(callback) = &self.on_not_processed else {
            return;
        };
        let callback = Arc::clone(callback);
        let outcome = AssertUnwindSafe(async move { callback(entity).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(processor = %self.name, entity_id = %entity_id, error = %e, "not-processed callback failed")
            }
            Err(_) => {
                error!(processor = %self.name, entity_id = %entity_id, "not-processed callback panicked")
            }
        }
    }
}

/// Stale saves surface from process functions wrapped in `anyhow`.
fn is_contention(err: &anyhow::Error) -> bool {
    err.downcast_ref::<EngineError>()
        .is_some_and(EngineError::is_contention)
        || err
            .downcast_ref::<StoreError>()
            .is_some_and(StoreError::is_contention)
}

fn boxed_process<T, P, PF>(process: P) -> ProcessFn<T>
where
    P: Fn(T) -> PF + Send + Sync + 'static,
    PF: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    Arc::new(move |entity| process(entity).boxed())
}

#[async_trait]
impl<T: StatefulEntity> ProcessRound for Processor<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_round(&self) -> Result<RoundReport, EngineError> {
        self.process().await
    }
}

impl<T: StatefulEntity> std::fmt::Debug for Processor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("name", &self.name)
            .field("guards", &self.guards.len())
            .field("on_not_processed", &self.on_not_processed.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::has_state;
    use crate::observable::Observable;
    use crate::store::InMemoryStateEntityStore;
    use crate::testing::{ManualClock, TestEntity};
    use std::sync::Mutex;

    async fn seeded(ids: &[&str]) -> Arc<InMemoryStateEntityStore<TestEntity>> {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InMemoryStateEntityStore::new("holder-a", clock));
        for (i, id) in ids.iter().enumerate() {
            let mut entity = TestEntity::new(*id, 100, i as i64);
            store.save(&mut entity).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_guard_order_and_default() {
        let store = seeded(&["a", "b", "c"]).await;
        let log = Arc::new(Mutex::new(Vec::new()));

        let (l1, l2, l3) = (log.clone(), log.clone(), log.clone());
        let processor = Processor::leasing(
            "test",
            store.clone(),
            10,
            vec![has_state(100)],
            move |e: TestEntity| {
                let log = l1.clone();
                async move {
                    log.lock().unwrap().push(format!("default:{}", e.id()));
                    Ok(true)
                }
            },
        )
        .with_guard(
            |e: &TestEntity| e.id() != "c",
            move |e: TestEntity| {
                let log = l2.clone();
                async move {
                    log.lock().unwrap().push(format!("first:{}", e.id()));
                    Ok(true)
                }
            },
        )
        .with_guard(
            |_: &TestEntity| true,
            move |e: TestEntity| {
                let log = l3.clone();
                async move {
                    log.lock().unwrap().push(format!("second:{}", e.id()));
                    Ok(true)
                }
            },
        );

        let report = processor.process().await.unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:a", "first:b", "second:c"]
        );
        assert_eq!(processor.guard_count(), 2);
    }

    #[tokio::test]
    async fn test_not_processed_releases_lease() {
        let store = seeded(&["a"]).await;
        let processor = Processor::leasing("idle", store.clone(), 10, vec![], |_e: TestEntity| async {
            Ok(false)
        });

        let report = processor.process().await.unwrap();
        assert_eq!(report, RoundReport::default());
        assert!(store.lease_holder("a").is_none());
    }

    #[tokio::test]
    async fn test_errors_and_panics_are_isolated() {
        let store = seeded(&["a", "b", "c"]).await;
        let processor = Processor::leasing("isolated", store.clone(), 10, vec![], |e: TestEntity| async move {
            match e.id() {
                "a" => anyhow::bail!("remote refused"),
                "b" => panic!("handler bug"),
                _ => Ok(true),
            }
        });

        let report = processor.process().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 2);
        assert!(store.lease_holder("a").is_none());
        assert!(store.lease_holder("b").is_none());
        assert_eq!(store.lease_holder("c").as_deref(), Some("holder-a"));
    }

    #[tokio::test]
    async fn test_batch_failure_fails_round() {
        let processor = Processor::new(
            "broken",
            || async { Err::<Vec<TestEntity>, _>(StoreError::Backend(anyhow::anyhow!("db down"))) },
            |_e: TestEntity| async { Ok(true) },
        );

        let err = processor.run_round().await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Backend(_))));
        assert_eq!(processor.name(), "broken");
    }

    #[tokio::test]
    async fn test_pending_guard_marks_and_saves() {
        let store = seeded(&["a", "b"]).await;
        let clock = Arc::new(ManualClock::new(10));
        let lifecycle = Lifecycle::new(store.clone(), Arc::new(Observable::default()), clock);

        let processor = Processor::leasing("pending", store.clone(), 10, vec![], |_e: TestEntity| async {
            Ok(false)
        })
        .with_pending_guard(|e: &TestEntity| e.id() == "a", lifecycle);

        let report = processor.process().await.unwrap();
        assert_eq!(report.processed, 1);

        let a = store.find_by_id("a").await.unwrap().unwrap();
        let b = store.find_by_id("b").await.unwrap().unwrap();
        assert!(a.is_pending());
        assert!(!b.is_pending());
        assert!(store.lease_holder("a").is_none());
    }
}

//! Transition listeners.
//!
//! Listeners observe transitions; they never decide or mutate. An
//! [`Observable`] owns an explicit, ordered list of them and notifies in two
//! phases:
//!
//! ```text
//! transition_to()
//!  → before_save   (synchronous, in registration order)
//!  → store.save()
//!  → after_save    (spawned, concurrent, fire-and-forget)
//! ```
//!
//! `before_save` runs before the write is durable, so a listener may observe a
//! transition that a crash later loses. Persisted state is the source of
//! truth; listeners get at-least-once semantics.
//!
//! # Failure Policy
//!
//! A failing (or panicking) `before_save` listener never affects the entity
//! or the save. [`ListenerFailurePolicy`] decides only whether the remaining
//! listeners of that fan-out still run. `after_save` failures are logged.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::entity::StatefulEntity;
use crate::error::EngineError;

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionKind {
    /// First write of a new entity.
    Created,
    /// State code (re-)entered.
    Transitioned,
    /// Fields changed without a state transition (e.g. marked pending).
    Updated,
}

/// Description of one observed change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub entity_id: String,
    pub kind: TransitionKind,
    pub from: i32,
    pub to: i32,
    pub state_count: u32,
    pub timestamp: i64,
}

impl Transition {
    pub fn of<T: StatefulEntity>(entity: &T, kind: TransitionKind, from: i32) -> Self {
        let base = entity.entity_state();
        Self {
            entity_id: base.id.clone(),
            kind,
            from,
            to: base.state,
            state_count: base.state_count,
            timestamp: base.updated_at,
        }
    }

    /// Whether this re-entered the same state (a retry).
    pub fn is_retry(&self) -> bool {
        self.kind == TransitionKind::Transitioned && self.from == self.to
    }
}

/// Observer of entity transitions.
#[async_trait]
pub trait EntityListener<T: StatefulEntity>: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Called synchronously before the transition is persisted.
    fn before_save(&self, _entity: &T, _transition: &Transition) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called on a spawned task after the transition was persisted.
    async fn after_save(&self, _entity: &T, _transition: &Transition) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Whether a failing synchronous listener stops the rest of the fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListenerFailurePolicy {
    /// Log and keep notifying the remaining listeners.
    #[default]
    Continue,
    /// Log and skip the remaining listeners for this transition.
    Halt,
}

/// Outcome of a synchronous notification fan-out.
#[derive(Debug, Default)]
pub struct FanOutReport {
    /// Listeners that returned `Ok`.
    pub notified: usize,
    /// Listeners that failed or panicked.
    pub failures: Vec<EngineError>,
    /// Whether remaining listeners were skipped.
    pub halted: bool,
}

impl FanOutReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Ordered listener registry owned by one component.
pub struct Observable<T: StatefulEntity> {
    listeners: Vec<Arc<dyn EntityListener<T>>>,
    policy: ListenerFailurePolicy,
}

impl<T: StatefulEntity> Observable<T> {
    pub fn new(policy: ListenerFailurePolicy) -> Self {
        Self {
            listeners: Vec::new(),
            policy,
        }
    }

    pub fn with_listener<L: EntityListener<T>>(mut self, listener: L) -> Self {
        self.register(Arc::new(listener));
        self
    }

    pub fn register(&mut self, listener: Arc<dyn EntityListener<T>>) {
        self.listeners.push(listener);
    }

    pub fn policy(&self) -> ListenerFailurePolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Run every `before_save` hook in registration order.
    pub fn notify_before(&self, entity: &T, transition: &Transition) -> FanOutReport {
        let mut report = FanOutReport::default();

        for listener in &self.listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.before_save(entity, transition)));
            let failure = match outcome {
                Ok(Ok(())) => {
                    report.notified += 1;
                    continue;
                }
                Ok(Err(source)) => EngineError::Listener {
                    listener: listener.name().to_string(),
                    entity_id: transition.entity_id.clone(),
                    source,
                },
                Err(payload) => EngineError::from_panic(
                    format!("listener {}", listener.name()),
                    payload,
                ),
            };

            warn!(
                entity_id = %transition.entity_id,
                listener = %listener.name(),
                error = %failure,
                "transition listener failed"
            );
            report.failures.push(failure);

            if self.policy == ListenerFailurePolicy::Halt {
                report.halted = true;
                break;
            }
        }

        report
    }

    /// Spawn every `after_save` hook; failures are logged.
    ///
    /// Returns the spawned handles so callers (and tests) may await them.
    pub fn notify_after(&self, entity: &T, transition: &Transition) -> Vec<JoinHandle<()>> {
        self.listeners
            .iter()
            .map(|listener| {
                let listener = Arc::clone(listener);
                let entity = entity.clone();
                let transition = transition.clone();
                tokio::spawn(async move {
                    let outcome = AssertUnwindSafe(listener.after_save(&entity, &transition))
                        .catch_unwind()
                        .await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(
                            entity_id = %transition.entity_id,
                            listener = %listener.name(),
                            error = %e,
                            "post-save listener failed"
                        ),
                        Err(_) => error!(
                            entity_id = %transition.entity_id,
                            listener = %listener.name(),
                            "post-save listener panicked"
                        ),
                    }
                })
            })
            .collect()
    }
}

impl<T: StatefulEntity> Default for Observable<T> {
    fn default() -> Self {
        Self::new(ListenerFailurePolicy::default())
    }
}

impl<T: StatefulEntity> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field(
                "listeners",
                &self.listeners.iter().map(|l| l.name().to_string()).collect::<Vec<_>>(),
            )
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEntity;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EntityListener<TestEntity> for Recorder {
        fn name(&self) -> &str {
            self.label
        }

        fn before_save(&self, entity: &TestEntity, _t: &Transition) -> anyhow::Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:before:{}", self.label, entity.id()));
            Ok(())
        }

        async fn after_save(&self, entity: &TestEntity, _t: &Transition) -> anyhow::Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:after:{}", self.label, entity.id()));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EntityListener<TestEntity> for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn before_save(&self, _e: &TestEntity, _t: &Transition) -> anyhow::Result<()> {
            anyhow::bail!("publisher unavailable")
        }

        async fn after_save(&self, _e: &TestEntity, _t: &Transition) -> anyhow::Result<()> {
            anyhow::bail!("publisher unavailable")
        }
    }

    struct Panicking;

    #[async_trait]
    impl EntityListener<TestEntity> for Panicking {
        fn before_save(&self, _e: &TestEntity, _t: &Transition) -> anyhow::Result<()> {
            panic!("listener bug")
        }
    }

    fn setup(policy: ListenerFailurePolicy) -> (Observable<TestEntity>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let observable = Observable::new(policy)
            .with_listener(Recorder {
                label: "first",
                log: log.clone(),
            })
            .with_listener(Failing)
            .with_listener(Recorder {
                label: "last",
                log: log.clone(),
            });
        (observable, log)
    }

    fn transition(entity: &TestEntity) -> Transition {
        Transition::of(entity, TransitionKind::Transitioned, 100)
    }

    #[test]
    fn test_continue_policy_notifies_everyone() {
        let (observable, log) = setup(ListenerFailurePolicy::Continue);
        let entity = TestEntity::new("e-1", 200, 0);

        let report = observable.notify_before(&entity, &transition(&entity));
        assert_eq!(report.notified, 2);
        assert_eq!(report.failures.len(), 1);
        assert!(!report.halted);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:before:e-1".to_string(), "last:before:e-1".to_string()]
        );
    }

    #[test]
    fn test_halt_policy_stops_fan_out() {
        let (observable, log) = setup(ListenerFailurePolicy::Halt);
        let entity = TestEntity::new("e-1", 200, 0);

        let report = observable.notify_before(&entity, &transition(&entity));
        assert_eq!(report.notified, 1);
        assert!(report.halted);
        assert!(!report.is_clean());
        assert_eq!(*log.lock().unwrap(), vec!["first:before:e-1".to_string()]);
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let observable = Observable::new(ListenerFailurePolicy::Continue).with_listener(Panicking);
        let entity = TestEntity::new("e-1", 200, 0);

        let report = observable.notify_before(&entity, &transition(&entity));
        assert!(matches!(report.failures[0], EngineError::Panicked { .. }));
    }

    #[tokio::test]
    async fn test_after_save_runs_on_spawned_tasks() {
        let (observable, log) = setup(ListenerFailurePolicy::Continue);
        let entity = TestEntity::new("e-1", 200, 0);

        let handles = observable.notify_after(&entity, &transition(&entity));
        assert_eq!(handles.len(), 3);
        for handle in handles {
            handle.await.unwrap();
        }

        let mut entries = log.lock().unwrap().clone();
        entries.sort();
        assert_eq!(entries, vec!["first:after:e-1", "last:after:e-1"]);
    }

    #[test]
    fn test_transition_retry_detection() {
        let entity = TestEntity::new("e-1", 200, 0);
        assert!(Transition::of(&entity, TransitionKind::Transitioned, 200).is_retry());
        assert!(!Transition::of(&entity, TransitionKind::Transitioned, 100).is_retry());
        assert!(!Transition::of(&entity, TransitionKind::Updated, 200).is_retry());
    }
}

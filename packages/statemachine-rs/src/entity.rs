//! Entity records managed by the engine.
//!
//! Every stateful business record (a contract negotiation, a transfer process,
//! a data flow) embeds an [`EntityState`] and exposes it through the
//! [`StatefulEntity`] trait. The engine only ever reads and writes the common
//! base; domain fields stay opaque to it.
//!
//! # Bookkeeping
//!
//! `state_count` is maintained centrally by [`EntityState::transition_to`]:
//!
//! | Transition                 | `state_count` |
//! |----------------------------|---------------|
//! | into a different state     | reset to `0`  |
//! | back into the same state   | `+1`          |
//!
//! Retry policies rely on this being accurate, so domain code never assigns
//! the counter directly.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque observability propagation data.
///
/// Carried across transitions and persisted with the entity, never
/// interpreted by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext(BTreeMap<String, String>);

impl TraceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

/// The common base every managed entity carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    /// Globally unique, immutable identifier.
    pub id: String,
    /// Current lifecycle state code.
    pub state: i32,
    /// Number of times the entity re-entered its current state.
    pub state_count: u32,
    /// Epoch millis of the last transition.
    pub state_timestamp: i64,
    /// Awaiting an external acknowledgment; not eligible for polling.
    pub pending: bool,
    /// Epoch millis of creation.
    pub created_at: i64,
    /// Epoch millis of the last mutation of any kind.
    pub updated_at: i64,
    /// Optimistic concurrency version, advanced by the store on every write.
    pub version: u64,
    /// Last failure recorded by a process function.
    pub error_detail: Option<String>,
    pub trace_context: TraceContext,
}

impl EntityState {
    /// Create the base for a new entity in `initial_state`.
    pub fn new(id: impl Into<String>, initial_state: i32, now: i64) -> Self {
        Self {
            id: id.into(),
            state: initial_state,
            state_count: 0,
            state_timestamp: now,
            pending: false,
            created_at: now,
            updated_at: now,
            version: 0,
            error_detail: None,
            trace_context: TraceContext::default(),
        }
    }

    /// Create the base with a freshly generated id.
    pub fn generate(initial_state: i32, now: i64) -> Self {
        Self::new(Uuid::new_v4().to_string(), initial_state, now)
    }

    /// Move into `state`, keeping `state_count` accurate.
    ///
    /// Returns the previous state code.
    pub fn transition_to(&mut self, state: i32, now: i64) -> i32 {
        let previous = self.state;
        if previous == state {
            self.state_count = self.state_count.saturating_add(1);
        } else {
            self.state = state;
            self.state_count = 0;
        }
        self.state_timestamp = now;
        self.updated_at = now;
        previous
    }

    /// Whether this entity was never written to a store.
    pub fn is_new(&self) -> bool {
        self.version == 0
    }
}

/// A record whose lifecycle is driven by the engine.
///
/// Implementors embed an [`EntityState`] and return it from the accessors.
/// `PartialEq` lets stores detect no-op saves.
pub trait StatefulEntity: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    fn entity_state(&self) -> &EntityState;

    fn entity_state_mut(&mut self) -> &mut EntityState;

    fn id(&self) -> &str {
        &self.entity_state().id
    }

    fn state(&self) -> i32 {
        self.entity_state().state
    }

    fn state_count(&self) -> u32 {
        self.entity_state().state_count
    }

    fn state_timestamp(&self) -> i64 {
        self.entity_state().state_timestamp
    }

    fn is_pending(&self) -> bool {
        self.entity_state().pending
    }

    fn version(&self) -> u64 {
        self.entity_state().version
    }
}

/// A domain enumeration of state codes.
///
/// Lets domain code work with named states while the engine stores integers.
pub trait StateCode: Copy + fmt::Debug + Send + Sync + 'static {
    fn code(self) -> i32;

    fn from_code(code: i32) -> Option<Self>;

    /// Name used in logs; defaults to the debug representation.
    fn name(self) -> String {
        format!("{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_defaults() {
        let state = EntityState::new("e-1", 100, 1_000);
        assert_eq!(state.id, "e-1");
        assert_eq!(state.state, 100);
        assert_eq!(state.state_count, 0);
        assert_eq!(state.state_timestamp, 1_000);
        assert_eq!(state.created_at, 1_000);
        assert!(!state.pending);
        assert!(state.is_new());
    }

    #[test]
    fn test_transition_to_new_state_resets_count() {
        let mut state = EntityState::new("e-1", 100, 1_000);
        state.transition_to(100, 1_100);
        state.transition_to(100, 1_200);
        assert_eq!(state.state_count, 2);

        let previous = state.transition_to(200, 1_300);
        assert_eq!(previous, 100);
        assert_eq!(state.state, 200);
        assert_eq!(state.state_count, 0);
        assert_eq!(state.state_timestamp, 1_300);
        assert_eq!(state.updated_at, 1_300);
    }

    #[test]
    fn test_transition_to_same_state_increments_count() {
        let mut state = EntityState::new("e-1", 200, 1_000);
        for expected in 1..=3 {
            state.transition_to(200, 1_000 + expected as i64);
            assert_eq!(state.state_count, expected);
        }
    }

    #[test]
    fn test_generate_produces_distinct_ids() {
        let a = EntityState::generate(0, 0);
        let b = EntityState::generate(0, 0);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_trace_context_is_carried_verbatim() {
        let ctx = TraceContext::new().with("traceparent", "00-abc-def-01");
        assert_eq!(ctx.get("traceparent"), Some("00-abc-def-01"));
        assert!(!ctx.is_empty());
        assert_eq!(ctx.iter().count(), 1);
    }
}

//! Transition events.
//!
//! [`EventLogListener`] turns every persisted transition into a JSON event and
//! hands it to an [`EventPublisher`]. Publishing happens after the save, so a
//! failed publish never affects the entity.

use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use statemachine::{EntityListener, StateCode, StatefulEntity, TraceContext, Transition, TransitionKind};
use tracing::info;

/// Payload published for one transition.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionEvent {
    pub entity_type: &'static str,
    pub entity_id: String,
    pub kind: TransitionKind,
    pub from: String,
    pub to: String,
    pub state_count: u32,
    pub at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "TraceContext::is_empty")]
    pub trace_context: TraceContext,
}

/// Sink for transition events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, subject: String, payload: Value) -> Result<()>;
}

/// Publisher that writes events to the log.
#[derive(Debug, Default)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, subject: String, payload: Value) -> Result<()> {
        info!(subject = %subject, payload = %payload, "transition event");
        Ok(())
    }
}

/// Publishes `<entity_type>.<state>` events using `S` to name state codes.
pub struct EventLogListener<S> {
    entity_type: &'static str,
    publisher: Arc<dyn EventPublisher>,
    _states: PhantomData<fn() -> S>,
}

impl<S: StateCode> EventLogListener<S> {
    pub fn new(entity_type: &'static str, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            entity_type,
            publisher,
            _states: PhantomData,
        }
    }

    fn state_name(code: i32) -> String {
        S::from_code(code)
            .map(StateCode::name)
            .unwrap_or_else(|| code.to_string())
    }

    pub fn event<T: StatefulEntity>(&self, entity: &T, transition: &Transition) -> TransitionEvent {
        let base = entity.entity_state();
        TransitionEvent {
            entity_type: self.entity_type,
            entity_id: transition.entity_id.clone(),
            kind: transition.kind,
            from: Self::state_name(transition.from),
            to: Self::state_name(transition.to),
            state_count: transition.state_count,
            at: DateTime::from_timestamp_millis(transition.timestamp),
            error_detail: base.error_detail.clone(),
            trace_context: base.trace_context.clone(),
        }
    }
}

#[async_trait]
impl<T, S> EntityListener<T> for EventLogListener<S>
where
    T: StatefulEntity,
    S: StateCode,
{
    fn name(&self) -> &str {
        "event-log"
    }

    async fn after_save(&self, entity: &T, transition: &Transition) -> Result<()> {
        let event = self.event(entity, transition);
        let subject = format!("{}.{}", self.entity_type, event.to.to_lowercase());
        self.publisher
            .publish(subject, serde_json::to_value(&event)?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::negotiation::NegotiationState;
    use statemachine::testing::TestEntity;
    use statemachine::TransitionKind;

    fn listener() -> EventLogListener<NegotiationState> {
        EventLogListener::new("negotiation", Arc::new(TracingPublisher))
    }

    #[test]
    fn test_event_names_known_states() {
        let mut entity = TestEntity::new("n-1", NegotiationState::Requested.code(), 1_000);
        entity.base.trace_context = TraceContext::new().with("traceparent", "00-1-2-01");
        let transition = Transition::of(
            &entity,
            TransitionKind::Transitioned,
            NegotiationState::Requesting.code(),
        );

        let event = listener().event(&entity, &transition);
        assert_eq!(event.from, "Requesting");
        assert_eq!(event.to, "Requested");
        assert_eq!(event.trace_context.get("traceparent"), Some("00-1-2-01"));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["entity_type"], "negotiation");
        assert_eq!(json["kind"], "Transitioned");
        assert!(json.get("error_detail").is_none());
    }

    #[test]
    fn test_unknown_state_code_falls_back_to_number() {
        let entity = TestEntity::new("n-1", 4242, 1_000);
        let transition = Transition::of(&entity, TransitionKind::Created, 4242);
        let event = listener().event(&entity, &transition);
        assert_eq!(event.to, "4242");
    }
}

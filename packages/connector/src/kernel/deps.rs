// ConnectorDeps - external collaborators of the domain managers
//
// Everything a manager talks to outside its own store goes through one of
// these trait objects, so tests can swap in the doubles from
// test_dependencies.rs.

use std::sync::Arc;

use statemachine::{Clock, SystemClock};

use super::{
    EventPublisher, LocalProvisioner, LoggingDispatcher, ProtocolDispatcher, Provisioner,
    TracingPublisher,
};

#[derive(Clone)]
pub struct ConnectorDeps {
    pub dispatcher: Arc<dyn ProtocolDispatcher>,
    pub provisioner: Arc<dyn Provisioner>,
    pub publisher: Arc<dyn EventPublisher>,
    pub clock: Arc<dyn Clock>,
}

impl ConnectorDeps {
    pub fn new(
        dispatcher: Arc<dyn ProtocolDispatcher>,
        provisioner: Arc<dyn Provisioner>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dispatcher,
            provisioner,
            publisher,
            clock,
        }
    }

    /// Collaborators for a standalone instance with no protocol adapters
    /// attached.
    pub fn local() -> Self {
        Self::new(
            Arc::new(LoggingDispatcher),
            Arc::new(LocalProvisioner),
            Arc::new(TracingPublisher),
            Arc::new(SystemClock),
        )
    }
}

//! Kernel module - collaborators and wiring shared by the domain managers.

pub mod connector_kernel;
pub mod deps;
pub mod dispatcher;
pub mod events;
pub mod provisioner;
pub mod test_dependencies;

pub use connector_kernel::ConnectorKernel;
pub use deps::ConnectorDeps;
pub use dispatcher::{LoggingDispatcher, MessageBody, ProtocolDispatcher, RemoteMessage};
pub use events::{EventLogListener, EventPublisher, TracingPublisher, TransitionEvent};
pub use provisioner::{LocalProvisioner, ProvisionResponse, Provisioner};

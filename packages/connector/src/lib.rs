// Dataspace Connector - Core
//
// Consumer-side contract negotiation and transfer process state machines,
// driven by the lease-coordinated engine in the `statemachine` crate.
//
// Each domain lives in domains/<name>/ with its entity model, command enum
// and the manager that wires processors and commands into the engine.

pub mod config;
pub mod domains;
pub mod error;
pub mod kernel;

pub use config::*;
pub use error::ConnectorError;

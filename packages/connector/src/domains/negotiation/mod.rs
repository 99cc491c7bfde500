pub mod commands;
pub mod manager;
pub mod model;

// Re-export commands
pub use commands::NegotiationCommand;

// Re-export manager
pub use manager::NegotiationManager;

// Re-export models
pub use model::{ContractAgreement, ContractNegotiation, ContractRequest, NegotiationState};

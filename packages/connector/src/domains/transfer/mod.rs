pub mod commands;
pub mod manager;
pub mod model;

// Re-export commands
pub use commands::TransferCommand;

// Re-export manager
pub use manager::TransferManager;

// Re-export models
pub use model::{TransferProcess, TransferRequest, TransferState};

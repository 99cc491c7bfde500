// Business domains
pub mod negotiation;
pub mod transfer;

// Common test utilities

pub mod harness;

pub use harness::*;

/// Counter-party used by every test.
pub const PROVIDER: &str = "https://provider.example/api/dsp";

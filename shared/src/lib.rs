//! Shared utilities for the package analysis worker

// Re-export common dependencies
pub use serde;
pub use thiserror;
pub use tracing;

pub mod crypto;
pub mod observability;

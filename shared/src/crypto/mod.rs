//! Content hashing used for telemetry digests and artifact integrity

pub mod hashing;

pub use hashing::*;

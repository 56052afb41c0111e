//! Dynamic analysis of third-party packages
//!
//! Runs a package through its install, import and execute phases inside a
//! disposable sandbox while syscall, packet and DNS telemetry is collected,
//! persists the aggregated result and signals completion to the control plane.

pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod reporter;
pub mod sandbox;
pub mod storage;
pub mod telemetry;

pub use engine::DynamicAnalysisEngine;
pub use error::{EngineError, ReportError, SandboxError, StorageError};
pub use models::{AnalysisResult, Package, Phase};
pub use reporter::CompletionReporter;

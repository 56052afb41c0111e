//! Data model for dynamic analysis runs

pub mod analysis_result;
pub mod package;
pub mod phase;
pub mod telemetry;

// Re-export commonly used types for convenience
pub use analysis_result::{AnalysisResult, RunStatus};
pub use package::{Ecosystem, Package, DEFAULT_SANDBOX_IMAGE};
pub use phase::{
    CapturedOutput, ExitInfo, Phase, PhaseFailure, PhaseOutcome, PhaseStatus, MAX_CAPTURED_OUTPUT,
};
pub use telemetry::{
    CommandExec, DnsRecord, FileWrite, FileWriteKind, Flow, NetworkSummary, SyscallEntry,
    TelemetryWarning, TransportProtocol,
};

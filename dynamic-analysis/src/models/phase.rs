use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Upper bound on captured stdout/stderr per stream and phase
pub const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

/// One step of a package's analysis lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Install,
    Import,
    Execute,
}

impl Phase {
    /// Fixed execution order
    pub const ALL: [Phase; 3] = [Phase::Install, Phase::Import, Phase::Execute];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Install => "install",
            Phase::Import => "import",
            Phase::Execute => "execute",
        }
    }

    /// Phase that follows this one, if any
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Install => Some(Phase::Import),
            Phase::Import => Some(Phase::Execute),
            Phase::Execute => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Why a phase was marked failed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum PhaseFailure {
    Timeout {
        #[serde(with = "duration_secs")]
        after: Duration,
    },
    ExitCode(i32),
    Signal(i32),
    Execution(String),
    Cancelled,
}

/// How a sandboxed command terminated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn code(code: i32) -> Self {
        Self { code: Some(code), signal: None }
    }

    pub fn signal(signal: i32) -> Self {
        Self { code: None, signal: Some(signal) }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    #[cfg(unix)]
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        Self { code: status.code(), signal: None }
    }
}

/// Size-bounded capture of a command's output stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CapturedOutput {
    pub text: String,
    pub truncated: bool,
    pub total_bytes: usize,
}

impl CapturedOutput {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::bounded(bytes, MAX_CAPTURED_OUTPUT)
    }

    pub fn bounded(bytes: &[u8], limit: usize) -> Self {
        Self::from_prefix(&bytes[..bytes.len().min(limit)], bytes.len())
    }

    /// Build from the first bytes of a stream that was `total_bytes` long
    pub fn from_prefix(kept: &[u8], total_bytes: usize) -> Self {
        Self {
            text: String::from_utf8_lossy(kept).into_owned(),
            truncated: total_bytes > kept.len(),
            total_bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }
}

/// Record of one attempted (or skipped) phase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseOutcome {
    pub phase: Phase,
    pub status: PhaseStatus,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub stdout: CapturedOutput,
    #[serde(default)]
    pub stderr: CapturedOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<PhaseFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PhaseOutcome {
    pub fn skipped(phase: Phase) -> Self {
        Self {
            phase,
            status: PhaseStatus::Skipped,
            command: Vec::new(),
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            exit: None,
            failure: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == PhaseStatus::Failed
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_is_fixed() {
        assert_eq!(Phase::ALL, [Phase::Install, Phase::Import, Phase::Execute]);
        assert!(Phase::Install < Phase::Import && Phase::Import < Phase::Execute);
    }

    #[test]
    fn test_captured_output_is_bounded() {
        let data = vec![b'a'; 100];
        let out = CapturedOutput::bounded(&data, 10);
        assert_eq!(out.text.len(), 10);
        assert!(out.truncated);
        assert_eq!(out.total_bytes, 100);

        let small = CapturedOutput::bounded(b"ok", 10);
        assert!(!small.truncated);
        assert_eq!(small.text, "ok");
    }

    #[test]
    fn test_skipped_outcome_has_no_timestamps() {
        let outcome = PhaseOutcome::skipped(Phase::Execute);
        assert_eq!(outcome.status, PhaseStatus::Skipped);
        assert!(outcome.started_at.is_none());
        assert!(outcome.duration().is_none());
    }

    #[test]
    fn test_failure_serialization() {
        let json = serde_json::to_value(PhaseFailure::Timeout { after: Duration::from_secs(5) }).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["detail"]["after"], 5.0);
        let code = serde_json::to_value(PhaseFailure::ExitCode(3)).unwrap();
        assert_eq!(code, serde_json::json!({"kind": "exit_code", "detail": 3}));
    }
}

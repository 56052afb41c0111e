use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use uuid::Uuid;

use super::package::Package;
use super::phase::{Phase, PhaseOutcome, PhaseStatus};
use super::telemetry::{
    CommandExec, DnsRecord, FileWrite, NetworkSummary, SyscallEntry, TelemetryWarning,
};

/// Overall status of a run that produced a result
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// Aggregate record for one dynamic analysis run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub run_id: Uuid,
    pub package: Package,
    pub sandbox_backend: String,
    pub phases: Vec<PhaseOutcome>,
    pub last_run_phase: Option<Phase>,
    pub last_status: RunStatus,
    pub syscalls: BTreeMap<Phase, Vec<SyscallEntry>>,
    pub commands: Vec<CommandExec>,
    pub file_writes: Vec<FileWrite>,
    pub network: Option<NetworkSummary>,
    pub dns: Vec<DnsRecord>,
    pub warnings: Vec<TelemetryWarning>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn phase(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.phases.iter().find(|outcome| outcome.phase == phase)
    }

    pub fn is_completed(&self) -> bool {
        self.last_status == RunStatus::Completed
    }

    /// Phases that actually executed, in order
    pub fn ran_phases(&self) -> impl Iterator<Item = Phase> + '_ {
        self.phases
            .iter()
            .filter(|outcome| outcome.status != PhaseStatus::Skipped)
            .map(|outcome| outcome.phase)
    }

    pub fn syscall_count(&self) -> usize {
        self.syscalls.values().map(Vec::len).sum()
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    /// Plain-text log of every phase's command and output
    pub fn execution_log(&self) -> String {
        let mut log = String::new();
        for outcome in &self.phases {
            let _ = writeln!(log, "=== {} ({:?}) ===", outcome.phase, outcome.status);
            if outcome.status == PhaseStatus::Skipped {
                continue;
            }
            if !outcome.command.is_empty() {
                let _ = writeln!(log, "$ {}", outcome.command.join(" "));
            }
            if let Some(failure) = &outcome.failure {
                let _ = writeln!(log, "failure: {:?}", failure);
            }
            let _ = writeln!(log, "--- stdout ---\n{}", outcome.stdout.text);
            if outcome.stdout.truncated {
                let _ = writeln!(log, "[stdout truncated, {} bytes total]", outcome.stdout.total_bytes);
            }
            let _ = writeln!(log, "--- stderr ---\n{}", outcome.stderr.text);
            if outcome.stderr.truncated {
                let _ = writeln!(log, "[stderr truncated, {} bytes total]", outcome.stderr.total_bytes);
            }
        }
        log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::package::Ecosystem;
    use crate::models::phase::CapturedOutput;

    fn result_with(phases: Vec<PhaseOutcome>, status: RunStatus) -> AnalysisResult {
        AnalysisResult {
            run_id: Uuid::new_v4(),
            package: Package::new(Ecosystem::Npm, "left-pad", "1.3.0"),
            sandbox_backend: "test".to_string(),
            phases,
            last_run_phase: Some(Phase::Install),
            last_status: status,
            syscalls: BTreeMap::new(),
            commands: vec![],
            file_writes: vec![],
            network: None,
            dns: vec![],
            warnings: vec![],
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_execution_log_includes_output_and_skips() {
        let mut install = PhaseOutcome::skipped(Phase::Install);
        install.status = PhaseStatus::Succeeded;
        install.command = vec!["npm".into(), "install".into()];
        install.stdout = CapturedOutput::from_bytes(b"added 1 package");

        let result = result_with(
            vec![install, PhaseOutcome::skipped(Phase::Import)],
            RunStatus::Failed,
        );
        let log = result.execution_log();
        assert!(log.contains("$ npm install"));
        assert!(log.contains("added 1 package"));
        assert!(log.contains("=== import (Skipped) ==="));
        assert_eq!(result.ran_phases().collect::<Vec<_>>(), vec![Phase::Install]);
    }

    #[test]
    fn test_json_uses_snake_case_phases() {
        let result = result_with(vec![PhaseOutcome::skipped(Phase::Execute)], RunStatus::Completed);
        let json: serde_json::Value = serde_json::from_slice(&result.to_json().unwrap()).unwrap();
        assert_eq!(json["last_status"], "completed");
        assert_eq!(json["last_run_phase"], "install");
        assert_eq!(json["phases"][0]["status"], "skipped");
        assert_eq!(json["package"]["ecosystem"], "npm");
    }
}

//! Assembly of the final analysis result. No I/O happens here.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::models::{AnalysisResult, Package, Phase, PhaseOutcome, PhaseStatus, RunStatus, SyscallEntry};
use crate::telemetry::CollectedTelemetry;

/// Bookkeeping the engine keeps while driving the phases
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub package: Package,
    pub sandbox_backend: String,
    pub phases: Vec<PhaseOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Merge phase outcomes and telemetry into an `AnalysisResult`
pub fn assemble(run: RunRecord, telemetry: CollectedTelemetry) -> AnalysisResult {
    let last_run = run
        .phases
        .iter()
        .rev()
        .find(|outcome| outcome.status != PhaseStatus::Skipped);

    let last_run_phase = last_run.map(|outcome| outcome.phase);
    let all_succeeded = Phase::ALL.iter().all(|phase| {
        run.phases
            .iter()
            .any(|outcome| outcome.phase == *phase && outcome.status == PhaseStatus::Succeeded)
    });
    let last_status = if all_succeeded { RunStatus::Completed } else { RunStatus::Failed };

    let mut commands = telemetry.commands;
    commands.sort_by_key(|command| command.timestamp);
    let mut file_writes = telemetry.file_writes;
    file_writes.sort_by_key(|write| write.timestamp);

    AnalysisResult {
        run_id: run.run_id,
        package: run.package,
        sandbox_backend: run.sandbox_backend,
        phases: run.phases,
        last_run_phase,
        last_status,
        syscalls: group_by_phase(telemetry.syscalls),
        commands,
        file_writes,
        network: telemetry.network,
        dns: telemetry.dns,
        warnings: telemetry.warnings,
        started_at: run.started_at,
        finished_at: run.finished_at,
    }
}

fn group_by_phase(entries: Vec<SyscallEntry>) -> BTreeMap<Phase, Vec<SyscallEntry>> {
    let mut grouped: BTreeMap<Phase, Vec<SyscallEntry>> = BTreeMap::new();
    for entry in entries {
        grouped.entry(entry.phase).or_default().push(entry);
    }
    for entries in grouped.values_mut() {
        entries.sort_by_key(|entry| entry.timestamp);
    }
    grouped
}

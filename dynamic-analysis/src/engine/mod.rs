/// Dynamic analysis engine
///
/// Drives one package through Install, Import and Execute inside a single
/// sandbox, strictly in order and failing fast:
/// - a failed phase stops the run and every later phase is recorded as skipped
/// - telemetry collectors stay attached for the whole sandbox lifetime
/// - the sandbox is destroyed exactly once, whatever happened
///
/// Only sandbox setup failures are raised as errors. Everything that goes
/// wrong afterwards is part of the returned `AnalysisResult`.

pub mod aggregate;
pub mod phase_runner;

pub use aggregate::{assemble, RunRecord};
pub use phase_runner::{CommandTemplate, DefaultCommandTemplate, PhaseRunner, DEFAULT_PHASE_TIMEOUT};

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{AnalysisResult, Package, Phase, PhaseOutcome, PhaseStatus};
use crate::sandbox::{FileCopy, SandboxBackend, SandboxConfig, SandboxGuard};
use crate::telemetry::{PhaseTag, TelemetryConfig, TelemetrySession};

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Pending,
    Installing,
    Importing,
    Executing,
    Completed,
    Failed,
}

impl EngineState {
    /// State while `phase` is executing
    pub fn for_phase(phase: Phase) -> Self {
        match phase {
            Phase::Install => EngineState::Installing,
            Phase::Import => EngineState::Importing,
            Phase::Execute => EngineState::Executing,
        }
    }

    /// Leave `Pending` and start with the first phase
    pub fn begin(self) -> Self {
        match self {
            EngineState::Pending => EngineState::Installing,
            other => other,
        }
    }

    /// Move on after the current phase finished with `status`
    pub fn advance(self, status: PhaseStatus) -> Self {
        let Some(phase) = self.phase() else {
            return self;
        };
        if status != PhaseStatus::Succeeded {
            return EngineState::Failed;
        }
        match phase.next() {
            Some(next) => EngineState::for_phase(next),
            None => EngineState::Completed,
        }
    }

    /// Phase being executed in this state
    pub fn phase(&self) -> Option<Phase> {
        match self {
            EngineState::Installing => Some(Phase::Install),
            EngineState::Importing => Some(Phase::Import),
            EngineState::Executing => Some(Phase::Execute),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Completed | EngineState::Failed)
    }
}

/// Runs packages through the analysis phases on one sandbox backend
pub struct DynamicAnalysisEngine {
    backend: Arc<dyn SandboxBackend>,
    sandbox_config: SandboxConfig,
    runner: PhaseRunner,
    telemetry: TelemetryConfig,
}

impl DynamicAnalysisEngine {
    pub fn new(backend: Arc<dyn SandboxBackend>, sandbox_config: SandboxConfig, runner: PhaseRunner) -> Self {
        let telemetry = TelemetryConfig::from(&sandbox_config);
        Self {
            backend,
            sandbox_config,
            runner,
            telemetry,
        }
    }

    pub fn with_telemetry_config(mut self, telemetry: TelemetryConfig) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Sandbox configuration for one package; local archives are copied in
    /// at the same path they have on the host
    fn config_for(&self, package: &Package) -> SandboxConfig {
        let mut config = self.sandbox_config.clone();
        if let Some(local) = &package.local_path {
            config.copies.push(FileCopy {
                host_path: local.clone(),
                sandbox_path: local.to_string_lossy().into_owned(),
            });
        }
        config
    }

    /// Analyze `package`. Phase failures, timeouts and cancellation during a
    /// phase are recorded in the result; only setup failures are errors.
    pub async fn run(&self, package: &Package, cancel: &CancellationToken) -> Result<AnalysisResult, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let config = self.config_for(package);

        info!(
            %run_id,
            package = %package,
            backend = self.backend.name(),
            image = %config.image_ref(),
            "Starting dynamic analysis"
        );

        let sandbox = self.backend.create(&config).await.map_err(|e| {
            error!(%run_id, package = %package, "Failed to create sandbox: {}", e);
            EngineError::SandboxSetup(e)
        })?;

        let guard = SandboxGuard::new(Arc::clone(&sandbox));
        let phase_tag = PhaseTag::default();
        let session = TelemetrySession::attach(&sandbox, &phase_tag, &self.telemetry);

        let mut phases: Vec<PhaseOutcome> = Vec::with_capacity(Phase::ALL.len());
        let mut state = EngineState::Pending.begin();

        while let Some(phase) = state.phase() {
            phase_tag.set(phase);
            let outcome = self.runner.run(sandbox.as_ref(), package, phase, cancel).await;
            state = state.advance(outcome.status);
            phases.push(outcome);
        }

        for phase in Phase::ALL {
            if !phases.iter().any(|outcome| outcome.phase == phase) {
                phases.push(PhaseOutcome::skipped(phase));
            }
        }

        let telemetry = session.detach().await;
        guard.release().await;

        let result = assemble(
            RunRecord {
                run_id,
                package: package.clone(),
                sandbox_backend: self.backend.name().to_string(),
                phases,
                started_at,
                finished_at: Utc::now(),
            },
            telemetry,
        );

        info!(
            %run_id,
            package = %package,
            last_run_phase = ?result.last_run_phase,
            last_status = ?result.last_status,
            syscalls = result.syscall_count(),
            warnings = result.warnings.len(),
            "Dynamic analysis finished"
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_happy_path_transitions() {
        let mut state = EngineState::Pending.begin();
        let mut seen = Vec::new();
        while let Some(phase) = state.phase() {
            seen.push(phase);
            state = state.advance(PhaseStatus::Succeeded);
        }
        assert_eq!(seen, Phase::ALL.to_vec());
        assert_eq!(state, EngineState::Completed);
    }

    #[test]
    fn test_failure_stops_the_machine() {
        let state = EngineState::Pending.begin().advance(PhaseStatus::Succeeded);
        assert_eq!(state, EngineState::Importing);
        let state = state.advance(PhaseStatus::Failed);
        assert_eq!(state, EngineState::Failed);
        assert!(state.is_terminal());
        assert_eq!(state.phase(), None);
    }

    #[test]
    fn test_terminal_and_pending_states_do_not_move() {
        assert_eq!(EngineState::Failed.advance(PhaseStatus::Succeeded), EngineState::Failed);
        assert_eq!(EngineState::Completed.begin(), EngineState::Completed);
        assert_eq!(EngineState::Pending.advance(PhaseStatus::Succeeded), EngineState::Pending);
    }

    #[test]
    fn test_local_package_is_copied_to_same_path() {
        let engine = DynamicAnalysisEngine::new(
            crate::sandbox::backend_for(crate::sandbox::SandboxRuntime::Process),
            SandboxConfig::default(),
            PhaseRunner::new(Arc::new(DefaultCommandTemplate::new()), DEFAULT_PHASE_TIMEOUT),
        );
        let pkg = Package::new(crate::models::Ecosystem::Npm, "left-pad", "").with_local_path("/tmp/left-pad.tgz");
        let config = engine.config_for(&pkg);
        assert_eq!(config.copies.len(), 1);
        assert_eq!(config.copies[0].sandbox_path, "/tmp/left-pad.tgz");
    }
}

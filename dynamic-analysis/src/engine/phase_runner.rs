//! Running a single analysis phase inside a sandbox

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::SandboxError;
use crate::models::{Ecosystem, Package, Phase, PhaseFailure, PhaseOutcome, PhaseStatus};
use crate::sandbox::Sandbox;

/// Default per-phase command timeout
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(600);

/// Maps a package and phase to the command run in the sandbox
pub trait CommandTemplate: Send + Sync {
    fn command(&self, package: &Package, phase: Phase) -> Vec<String>;
}

/// The analysis-script convention of the default sandbox image:
/// `<script> [--local <path> | --version <version>] <phase> <name>`
#[derive(Debug, Clone, Default)]
pub struct DefaultCommandTemplate {
    /// Replaces the per-ecosystem script, for custom sandbox images
    pub analysis_command: Option<Vec<String>>,
}

impl DefaultCommandTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_analysis_command(command: Vec<String>) -> Self {
        Self {
            analysis_command: if command.is_empty() { None } else { Some(command) },
        }
    }

    fn script(&self, ecosystem: Ecosystem) -> Vec<String> {
        match &self.analysis_command {
            Some(command) => command.clone(),
            None => vec![ecosystem.analysis_script().to_string()],
        }
    }
}

impl CommandTemplate for DefaultCommandTemplate {
    fn command(&self, package: &Package, phase: Phase) -> Vec<String> {
        let mut argv = self.script(package.ecosystem);

        if let Some(local) = &package.local_path {
            argv.push("--local".to_string());
            argv.push(local.to_string_lossy().into_owned());
        } else if package.version != "latest" {
            argv.push("--version".to_string());
            argv.push(package.version.clone());
        }

        argv.push(phase.as_str().to_string());
        argv.push(package.name.clone());
        argv
    }
}

/// Executes one phase and turns whatever happened into a `PhaseOutcome`
#[derive(Clone)]
pub struct PhaseRunner {
    template: Arc<dyn CommandTemplate>,
    timeout: Duration,
}

impl PhaseRunner {
    pub fn new(template: Arc<dyn CommandTemplate>, timeout: Duration) -> Self {
        Self { template, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `phase`. Never fails: every problem is recorded in the outcome.
    pub async fn run(
        &self,
        sandbox: &dyn Sandbox,
        package: &Package,
        phase: Phase,
        cancel: &CancellationToken,
    ) -> PhaseOutcome {
        let command = self.template.command(package, phase);
        let started_at = Utc::now();

        info!(phase = %phase, sandbox_id = %sandbox.id(), "Running phase: {}", command.join(" "));

        let mut outcome = PhaseOutcome {
            phase,
            status: PhaseStatus::Failed,
            command: command.clone(),
            started_at: Some(started_at),
            ..PhaseOutcome::skipped(phase)
        };

        match sandbox.run(phase, &command, self.timeout, cancel).await {
            Ok(output) => {
                outcome.stdout = output.stdout;
                outcome.stderr = output.stderr;
                outcome.exit = Some(output.exit);

                if output.exit.success() {
                    outcome.status = PhaseStatus::Succeeded;
                } else {
                    outcome.failure = Some(match (output.exit.code, output.exit.signal) {
                        (Some(code), _) => PhaseFailure::ExitCode(code),
                        (None, Some(signal)) => PhaseFailure::Signal(signal),
                        (None, None) => PhaseFailure::Execution("process ended without exit status".to_string()),
                    });
                }
            }
            Err(e) => {
                outcome.failure = Some(match e {
                    SandboxError::CommandTimeout { after } => PhaseFailure::Timeout { after },
                    SandboxError::Cancelled => PhaseFailure::Cancelled,
                    SandboxError::CommandExecution(message) => PhaseFailure::Execution(message),
                    other => PhaseFailure::Execution(other.to_string()),
                });
            }
        }

        outcome.finished_at = Some(Utc::now());

        match &outcome.failure {
            None => info!(phase = %phase, "Phase succeeded"),
            Some(failure) => warn!(phase = %phase, ?failure, "Phase failed"),
        }

        outcome
    }
}

/// Host-process sandboxes
///
/// Lighter than a container: each run gets a private temporary working
/// directory, and offline runs are moved into an empty network namespace
/// with `unshare`. Meant for hosts without a container runtime.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{phase_log, run_bounded, traced_argv, CommandOutput, Sandbox, SandboxBackend, SandboxConfig};
use crate::error::SandboxError;
use crate::models::Phase;

const TRACE_LOG_NAME: &str = ".strace.log";

pub struct ProcessBackend;

impl ProcessBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn create(&self, config: &SandboxConfig) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let workdir = tempfile::Builder::new()
            .prefix("dynamic-analysis-")
            .tempdir()
            .map_err(|e| SandboxError::Setup(format!("failed to create working directory: {}", e)))?;

        let root = workdir.path().to_path_buf();
        let id = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dynamic-analysis".to_string());

        for copy in &config.copies {
            if copy.host_path.as_path() == Path::new(&copy.sandbox_path) {
                // Already visible at the expected path
                continue;
            }
            let dest = rebase(&root, &copy.sandbox_path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SandboxError::Setup(format!("failed to create {}: {}", parent.display(), e)))?;
            }
            info!("Copying file to sandbox: {} -> {}", copy.host_path.display(), dest.display());
            tokio::fs::copy(&copy.host_path, &dest).await.map_err(|e| {
                SandboxError::Setup(format!("failed to copy {}: {}", copy.host_path.display(), e))
            })?;
        }

        let trace_log = config
            .trace_syscalls
            .then(|| root.join(TRACE_LOG_NAME).to_string_lossy().into_owned());

        info!(sandbox_id = %id, "Created process sandbox in {}", root.display());

        Ok(Arc::new(ProcessSandbox {
            id,
            root,
            workdir: Mutex::new(Some(workdir)),
            offline: config.offline,
            trace_log,
            trace_string_limit: config.trace_string_limit,
            capture_interface: config.capture_packets.then(|| config.capture_interface.clone()),
        }))
    }
}

/// Map an absolute sandbox path under the working directory
fn rebase(root: &Path, sandbox_path: &str) -> PathBuf {
    root.join(sandbox_path.trim_start_matches('/'))
}

pub struct ProcessSandbox {
    id: String,
    root: PathBuf,
    workdir: Mutex<Option<TempDir>>,
    offline: bool,
    trace_log: Option<String>,
    trace_string_limit: usize,
    capture_interface: Option<String>,
}

impl ProcessSandbox {
    fn command_argv(&self, phase: Phase, argv: &[String], timeout: Duration) -> Vec<String> {
        // timeout(1) signals its whole process group, so forked children die too
        let mut full = vec![
            "timeout".to_string(),
            "--signal=KILL".to_string(),
            format!("{}", timeout.as_secs() + 1),
        ];

        if self.offline {
            full.extend(["unshare", "--user", "--map-root-user", "--net"].map(String::from));
        }

        match &self.trace_log {
            Some(base) => full.extend(traced_argv(argv, &phase_log(base, phase), self.trace_string_limit)),
            None => full.extend(argv.iter().cloned()),
        }

        full
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(
        &self,
        phase: Phase,
        argv: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, SandboxError> {
        if argv.is_empty() {
            return Err(SandboxError::CommandExecution("empty command".to_string()));
        }

        let full = self.command_argv(phase, argv, timeout);
        debug!(sandbox_id = %self.id, "Executing command in process sandbox: {:?}", full);

        let mut cmd = Command::new(&full[0]);
        cmd.args(&full[1..]).current_dir(&self.root).env("HOME", &self.root);
        run_bounded(cmd, timeout, cancel).await
    }

    fn observe(&self, argv: &[String]) -> Command {
        let program = argv.first().map(String::as_str).unwrap_or("true");
        let mut cmd = Command::new(program);
        if argv.len() > 1 {
            cmd.args(&argv[1..]);
        }
        cmd.current_dir(&self.root);
        cmd
    }

    fn capture_command(&self) -> Option<Command> {
        if self.offline {
            debug!(sandbox_id = %self.id, "Offline process sandbox has a private network namespace, host capture skipped");
            return None;
        }
        let interface = self.capture_interface.as_ref()?;
        let mut cmd = Command::new("tcpdump");
        cmd.args(["-U", "-n", "-i", interface, "-w", "-"]);
        Some(cmd)
    }

    fn trace_log(&self, phase: Phase) -> Option<String> {
        self.trace_log.as_deref().map(|base| phase_log(base, phase))
    }

    async fn destroy(&self) -> Result<(), SandboxError> {
        let workdir = match self.workdir.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(workdir) = workdir {
            info!(sandbox_id = %self.id, "Removing process sandbox");
            workdir
                .close()
                .map_err(|e| SandboxError::Teardown(format!("failed to remove working directory: {}", e)))?;
        }

        Ok(())
    }
}

/// Container sandboxes driven through the docker or podman CLI
///
/// Each run gets one long-lived container. Phase commands are executed in it
/// with `exec`, and the container is force-removed on destroy.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    phase_log, run_bounded, traced_argv, CommandOutput, Sandbox, SandboxBackend, SandboxConfig, SandboxRuntime,
};
use crate::error::SandboxError;
use crate::models::Phase;

/// Trace log location inside the container; each phase gets a suffixed copy
const CONTAINER_TRACE_LOG: &str = "/tmp/.dynamic-analysis-strace.log";

/// Working directory phase commands start in
const CONTAINER_WORKDIR: &str = "/workspace";

/// Capabilities re-added after dropping everything
const ADDED_CAPABILITIES: [&str; 6] = ["SYS_PTRACE", "CHOWN", "DAC_OVERRIDE", "FOWNER", "SETUID", "SETGID"];

/// Creates container sandboxes with a container runtime CLI
pub struct ContainerBackend {
    runtime: SandboxRuntime,
    cli: &'static str,
}

impl ContainerBackend {
    pub fn new(runtime: SandboxRuntime) -> Self {
        Self {
            runtime,
            cli: runtime.container_cli().unwrap_or("docker"),
        }
    }

    /// Check if the runtime CLI is available on the system
    async fn check_cli_available(&self) -> bool {
        Command::new(self.cli)
            .arg("--version")
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    /// Make sure the image exists locally, pulling it when allowed
    async fn ensure_image(&self, image: &str, pull: bool) -> Result<(), SandboxError> {
        debug!("Checking if image exists: {}", image);

        let check = Command::new(self.cli)
            .args(["image", "inspect", image])
            .output()
            .await
            .map_err(|e| SandboxError::Setup(format!("failed to inspect image {}: {}", image, e)))?;

        if check.status.success() {
            debug!("Image already exists: {}", image);
            return Ok(());
        }

        if !pull {
            return Err(SandboxError::Setup(format!(
                "image {} is not available locally and pulling is disabled",
                image
            )));
        }

        info!("Pulling image: {}", image);
        let output = Command::new(self.cli)
            .args(["pull", image])
            .output()
            .await
            .map_err(|e| SandboxError::Setup(format!("failed to pull image {}: {}", image, e)))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::Setup(format!("failed to pull image {}: {}", image, error.trim())));
        }

        Ok(())
    }

    /// Arguments for `<cli> create`
    fn create_args(&self, config: &SandboxConfig, name: &str) -> Vec<String> {
        let network = if config.offline {
            "none".to_string()
        } else {
            config.network_name.clone()
        };

        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--memory".to_string(),
            format!("{}m", config.memory_limit_mb),
            "--cpus".to_string(),
            format!("{}", config.cpu_limit),
            "--network".to_string(),
            network,
            "--workdir".to_string(),
            CONTAINER_WORKDIR.to_string(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
        ];

        for cap in ADDED_CAPABILITIES {
            args.push("--cap-add".to_string());
            args.push(cap.to_string());
        }

        for opt in ["no-new-privileges", "seccomp=unconfined"] {
            args.push("--security-opt".to_string());
            args.push(opt.to_string());
        }

        for env in ["LANG=C.UTF-8", "TZ=UTC"] {
            args.push("--env".to_string());
            args.push(env.to_string());
        }

        args.push(config.image_ref());
        match &config.entry_command {
            Some(entry) if !entry.is_empty() => args.extend(entry.iter().cloned()),
            _ => {
                // Keep container running
                args.push("sleep".to_string());
                args.push("infinity".to_string());
            }
        }

        args
    }

    async fn cli_checked(&self, args: &[&str], what: &str) -> Result<(), SandboxError> {
        let output = Command::new(self.cli)
            .args(args)
            .output()
            .await
            .map_err(|e| SandboxError::Setup(format!("failed to {}: {}", what, e)))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::Setup(format!("failed to {}: {}", what, error.trim())));
        }

        Ok(())
    }

    async fn start_and_populate(&self, id: &str, config: &SandboxConfig) -> Result<(), SandboxError> {
        self.cli_checked(&["start", id], "start container").await?;

        for copy in &config.copies {
            let host = copy.host_path.to_string_lossy();
            info!("Copying file to container: {} -> {}", host, copy.sandbox_path);

            if let Some(parent) = Path::new(&copy.sandbox_path).parent() {
                let parent = parent.to_string_lossy();
                if !parent.is_empty() {
                    self.cli_checked(&["exec", id, "mkdir", "-p", &parent], "create copy destination")
                        .await?;
                }
            }

            let dest = format!("{}:{}", id, copy.sandbox_path);
            self.cli_checked(&["cp", &host, &dest], "copy file into container").await?;
        }

        Ok(())
    }
}

#[async_trait]
impl SandboxBackend for ContainerBackend {
    fn name(&self) -> &'static str {
        self.runtime.as_str()
    }

    async fn create(&self, config: &SandboxConfig) -> Result<Arc<dyn Sandbox>, SandboxError> {
        if !self.check_cli_available().await {
            return Err(SandboxError::Setup(format!("{} is not available", self.cli)));
        }

        let image = config.image_ref();
        self.ensure_image(&image, config.pull).await?;

        let name = format!("dynamic-analysis-{}", Uuid::new_v4());
        info!(sandbox_id = %name, "Creating sandbox container with image: {}", image);

        let args = self.create_args(config, &name);
        debug!("{} create arguments: {:?}", self.cli, args);

        let output = Command::new(self.cli)
            .args(&args)
            .output()
            .await
            .map_err(|e| SandboxError::Setup(format!("failed to create container: {}", e)))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            error!("Failed to create container: {}", error);
            return Err(SandboxError::Setup(format!("{} create failed: {}", self.cli, error.trim())));
        }

        let sandbox = ContainerSandbox {
            cli: self.cli,
            id: name,
            image,
            trace_log: config.trace_syscalls.then(|| CONTAINER_TRACE_LOG.to_string()),
            trace_string_limit: config.trace_string_limit,
            capture_packets: config.capture_packets,
            destroyed: AtomicBool::new(false),
        };

        if let Err(e) = self.start_and_populate(&sandbox.id, config).await {
            // The container exists but is unusable, remove it before reporting
            if let Err(cleanup) = sandbox.destroy().await {
                warn!(sandbox_id = %sandbox.id, "Cleanup after failed setup also failed: {}", cleanup);
            }
            return Err(e);
        }

        info!(sandbox_id = %sandbox.id, "Container created and started");
        Ok(Arc::new(sandbox))
    }
}

/// A running container
pub struct ContainerSandbox {
    cli: &'static str,
    id: String,
    image: String,
    trace_log: Option<String>,
    trace_string_limit: usize,
    capture_packets: bool,
    destroyed: AtomicBool,
}

impl ContainerSandbox {
    fn capture_name(&self) -> String {
        format!("{}-capture", self.id)
    }

    /// Arguments for `<cli> exec` of a phase command
    fn exec_args(&self, phase: Phase, argv: &[String], timeout: Duration) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            self.id.clone(),
            // Second guard: the in-container process tree outlives a killed exec client
            "timeout".to_string(),
            "--signal=KILL".to_string(),
            format!("{}", timeout.as_secs() + 1),
        ];

        match &self.trace_log {
            Some(base) => args.extend(traced_argv(argv, &phase_log(base, phase), self.trace_string_limit)),
            None => args.extend(argv.iter().cloned()),
        }

        args
    }

    /// Arguments for the tcpdump sidecar sharing the sandbox network namespace
    fn capture_args(&self) -> Vec<String> {
        vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            self.capture_name(),
            "--network".to_string(),
            format!("container:{}", self.id),
            "--cap-add".to_string(),
            "NET_RAW".to_string(),
            "--cap-add".to_string(),
            "NET_ADMIN".to_string(),
            "--entrypoint".to_string(),
            "tcpdump".to_string(),
            self.image.clone(),
            "-U".to_string(),
            "-n".to_string(),
            "-i".to_string(),
            "any".to_string(),
            "-w".to_string(),
            "-".to_string(),
        ]
    }
}

#[async_trait]
impl Sandbox for ContainerSandbox {
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

        debug!(sandbox_id = %self.id, phase = %phase, "Executing command in container: {:?}", argv);

        let mut cmd = Command::new(self.cli);
        cmd.args(self.exec_args(phase, argv, timeout));
        run_bounded(cmd, timeout, cancel).await
    }

    fn observe(&self, argv: &[String]) -> Command {
        let mut cmd = Command::new(self.cli);
        cmd.arg("exec").arg(&self.id).args(argv);
        cmd
    }

    fn capture_command(&self) -> Option<Command> {
        if !self.capture_packets {
            return None;
        }
        let mut cmd = Command::new(self.cli);
        cmd.args(self.capture_args());
        Some(cmd)
    }

    fn trace_log(&self, phase: Phase) -> Option<String> {
        self.trace_log.as_deref().map(|base| phase_log(base, phase))
    }

    async fn destroy(&self) -> Result<(), SandboxError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(sandbox_id = %self.id, "Removing container");

        if self.capture_packets {
            let _ = Command::new(self.cli)
                .args(["rm", "-f", &self.capture_name()])
                .output()
                .await;
        }

        let output = Command::new(self.cli)
            .args(["rm", "-f", &self.id])
            .output()
            .await
            .map_err(|e| SandboxError::Teardown(format!("failed to remove container: {}", e)))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::Teardown(format!("failed to remove container: {}", error.trim())));
        }

        Ok(())
    }
}

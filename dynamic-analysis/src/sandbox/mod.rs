/// Sandbox module for isolated package execution
///
/// A sandbox is a disposable execution environment that phase commands run
/// in. Backends are picked at runtime from `SandboxRuntime`:
/// - Container isolation through the docker or podman CLI
/// - Lightweight host-process isolation in a private working directory

pub mod container;
pub mod network;
pub mod process;

pub use container::{ContainerBackend, ContainerSandbox};
pub use network::init_network;
pub use process::{ProcessBackend, ProcessSandbox};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SandboxError;
use crate::models::{CapturedOutput, ExitInfo, Phase, DEFAULT_SANDBOX_IMAGE, MAX_CAPTURED_OUTPUT};

/// Default strace string capture length (bytes per buffer argument)
pub const DEFAULT_TRACE_STRING_LIMIT: usize = 4096;

/// Default name of the bridge network sandboxes attach to when online
pub const DEFAULT_NETWORK_NAME: &str = "analysis-net";

/// Mechanism used to isolate the analyzed package
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SandboxRuntime {
    Docker,
    Podman,
    Process,
}

impl SandboxRuntime {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxRuntime::Docker => "docker",
            SandboxRuntime::Podman => "podman",
            SandboxRuntime::Process => "process",
        }
    }

    /// Container CLI binary, if this runtime uses one
    pub fn container_cli(&self) -> Option<&'static str> {
        match self {
            SandboxRuntime::Docker => Some("docker"),
            SandboxRuntime::Podman => Some("podman"),
            SandboxRuntime::Process => None,
        }
    }
}

impl fmt::Display for SandboxRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxRuntime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(SandboxRuntime::Docker),
            "podman" => Ok(SandboxRuntime::Podman),
            "process" | "host" => Ok(SandboxRuntime::Process),
            other => Err(format!("unknown sandbox runtime '{}'", other)),
        }
    }
}

/// A host file placed into the sandbox before the first phase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileCopy {
    pub host_path: PathBuf,
    pub sandbox_path: String,
}

/// Immutable description of the sandbox to create for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub image: String,
    pub tag: String,
    /// When false the image must already exist locally
    pub pull: bool,
    pub offline: bool,
    pub copies: Vec<FileCopy>,
    /// Long-running entry command; defaults to `sleep infinity`
    pub entry_command: Option<Vec<String>>,
    pub runtime: SandboxRuntime,
    pub network_name: String,
    pub memory_limit_mb: u64,
    pub cpu_limit: f32,
    pub trace_syscalls: bool,
    pub trace_string_limit: usize,
    pub capture_packets: bool,
    /// Host interface for captures outside a container
    pub capture_interface: String,
}

impl SandboxConfig {
    /// Full image reference; an empty tag means `latest`
    pub fn image_ref(&self) -> String {
        let tag = if self.tag.trim().is_empty() { "latest" } else { self.tag.trim() };
        format!("{}:{}", self.image, tag)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_SANDBOX_IMAGE.to_string(),
            tag: "latest".to_string(),
            pull: true,
            offline: false,
            copies: Vec::new(),
            entry_command: None,
            runtime: SandboxRuntime::Docker,
            network_name: DEFAULT_NETWORK_NAME.to_string(),
            memory_limit_mb: 2048,
            cpu_limit: 1.0,
            trace_syscalls: true,
            trace_string_limit: DEFAULT_TRACE_STRING_LIMIT,
            capture_packets: true,
            capture_interface: "any".to_string(),
        }
    }
}

/// Result of a command run inside a sandbox, with size-bounded output
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub exit: ExitInfo,
}

/// Factory for sandboxes of one runtime
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create and start a sandbox. Errors are always `SandboxError::Setup`.
    async fn create(&self, config: &SandboxConfig) -> Result<Arc<dyn Sandbox>, SandboxError>;
}

/// A live sandbox instance
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    /// Run a phase command to completion, honouring timeout and cancellation.
    /// Syscalls are traced into the log for `phase`.
    async fn run(
        &self,
        phase: Phase,
        argv: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, SandboxError>;

    /// Unspawned command that runs `argv` inside the sandbox for a collector
    fn observe(&self, argv: &[String]) -> Command;

    /// Unspawned packet capture writing pcap to stdout, if enabled
    fn capture_command(&self) -> Option<Command>;

    /// Path of the syscall trace log of `phase` as seen by `observe`, if tracing is on
    fn trace_log(&self, phase: Phase) -> Option<String>;

    async fn destroy(&self) -> Result<(), SandboxError>;
}

/// Pick the backend for a runtime
pub fn backend_for(runtime: SandboxRuntime) -> Arc<dyn SandboxBackend> {
    match runtime {
        SandboxRuntime::Docker | SandboxRuntime::Podman => Arc::new(ContainerBackend::new(runtime)),
        SandboxRuntime::Process => Arc::new(ProcessBackend::new()),
    }
}

/// Per-phase trace log next to `base`
pub(crate) fn phase_log(base: &str, phase: Phase) -> String {
    format!("{}.{}", base, phase)
}

/// Syscalls the tracer keeps. File and process calls plus the descriptor
/// bookkeeping needed to map writes back to paths.
const TRACED_SYSCALLS: &str = "trace=%file,%process,read,write,pwrite64,close,dup,dup2,dup3,fcntl";

/// Prefix `argv` with strace so every descendant process is traced into `log`
pub(crate) fn traced_argv(argv: &[String], log: &str, string_limit: usize) -> Vec<String> {
    let mut traced = vec![
        "strace".to_string(),
        "-f".to_string(),
        "-ttt".to_string(),
        "-qq".to_string(),
        "-s".to_string(),
        string_limit.to_string(),
        "-xx".to_string(),
        "-e".to_string(),
        TRACED_SYSCALLS.to_string(),
        "-o".to_string(),
        log.to_string(),
    ];
    traced.extend(argv.iter().cloned());
    traced
}

/// Spawn `cmd` and wait for it, killing it on timeout or cancellation
pub(crate) async fn run_bounded(
    mut cmd: Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CommandOutput, SandboxError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("Spawning sandbox command: {:?}", cmd);

    let mut child = cmd
        .spawn()
        .map_err(|e| SandboxError::CommandExecution(format!("failed to spawn command: {}", e)))?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let collect = async {
        let (stdout, stderr, status) = tokio::try_join!(
            read_bounded(stdout, MAX_CAPTURED_OUTPUT),
            read_bounded(stderr, MAX_CAPTURED_OUTPUT),
            child.wait(),
        )?;
        Ok::<_, std::io::Error>(CommandOutput {
            stdout,
            stderr,
            exit: ExitInfo::from_status(status),
        })
    };

    // Losing the race drops the child on return, and kill_on_drop reaps it
    tokio::select! {
        output = collect => output
            .map_err(|e| SandboxError::CommandExecution(format!("failed to wait for command: {}", e))),
        _ = tokio::time::sleep(timeout) => Err(SandboxError::CommandTimeout { after: timeout }),
        _ = cancel.cancelled() => Err(SandboxError::Cancelled),
    }
}

/// Read `reader` to its end, keeping at most `limit` bytes and counting the rest
async fn read_bounded<R>(reader: Option<R>, limit: usize) -> std::io::Result<CapturedOutput>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(CapturedOutput::default());
    };

    let mut kept = Vec::new();
    let mut total = 0usize;
    let mut chunk = vec![0u8; 8 * 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        total = total.saturating_add(n);
        let room = limit.saturating_sub(kept.len());
        kept.extend_from_slice(&chunk[..n.min(room)]);
    }

    Ok(CapturedOutput::from_prefix(&kept, total))
}

/// Scoped ownership of a sandbox that guarantees a single destroy
pub struct SandboxGuard {
    sandbox: Option<Arc<dyn Sandbox>>,
}

impl SandboxGuard {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Self { sandbox: Some(sandbox) }
    }

    /// Destroy the sandbox. Teardown errors are logged, never returned.
    pub async fn release(mut self) {
        if let Some(sandbox) = self.sandbox.take() {
            if let Err(e) = sandbox.destroy().await {
                warn!(sandbox_id = %sandbox.id(), "Failed to destroy sandbox: {}", e);
            }
        }
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        let Some(sandbox) = self.sandbox.take() else {
            return;
        };

        warn!(sandbox_id = %sandbox.id(), "Sandbox guard dropped without release, destroying in background");

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = sandbox.destroy().await {
                        warn!(sandbox_id = %sandbox.id(), "Background sandbox destroy failed: {}", e);
                    }
                });
            }
            Err(_) => {
                warn!(sandbox_id = %sandbox.id(), "No runtime available, sandbox leaked");
            }
        }
    }
}

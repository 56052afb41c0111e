//! Process-wide analysis network setup

use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::SandboxRuntime;
use crate::error::SandboxError;

static ANALYSIS_NETWORK: OnceCell<String> = OnceCell::const_new();

/// Create the bridge network online sandboxes attach to, once per process.
///
/// Safe to call repeatedly; a failed attempt leaves the cell empty so a
/// later call retries. Host-process sandboxes need no network.
pub async fn init_network(
    runtime: SandboxRuntime,
    name: &str,
    subnet: Option<&str>,
) -> Result<(), SandboxError> {
    let Some(cli) = runtime.container_cli() else {
        debug!("Runtime {} needs no analysis network", runtime);
        return Ok(());
    };

    let initialized = ANALYSIS_NETWORK
        .get_or_try_init(|| async { ensure_network(cli, name, subnet).await.map(|_| name.to_string()) })
        .await?;

    if initialized != name {
        warn!(
            network = %initialized,
            requested = %name,
            "Analysis network already initialized under a different name"
        );
    }

    Ok(())
}

async fn ensure_network(cli: &str, name: &str, subnet: Option<&str>) -> Result<(), SandboxError> {
    let inspect = Command::new(cli)
        .args(["network", "inspect", name])
        .output()
        .await
        .map_err(|e| SandboxError::Setup(format!("failed to inspect network {}: {}", name, e)))?;

    if inspect.status.success() {
        debug!(network = %name, "Analysis network already exists");
        return Ok(());
    }

    let mut cmd = Command::new(cli);
    cmd.args(["network", "create", "--driver", "bridge"]);
    if let Some(subnet) = subnet {
        cmd.args(["--subnet", subnet]);
    }
    cmd.arg(name);

    let output = cmd
        .output()
        .await
        .map_err(|e| SandboxError::Setup(format!("failed to create network {}: {}", name, e)))?;

    if !output.status.success() {
        let error = String::from_utf8_lossy(&output.stderr);
        return Err(SandboxError::Setup(format!("failed to create network {}: {}", name, error.trim())));
    }

    info!(network = %name, "Created analysis network");
    Ok(())
}

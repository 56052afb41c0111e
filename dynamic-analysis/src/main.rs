use anyhow::{Context, Result};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dynamic_analysis::config::{Config, LoggingConfig, StorageConfig};
use dynamic_analysis::engine::{DefaultCommandTemplate, DynamicAnalysisEngine, PhaseRunner};
use dynamic_analysis::error::ConfigError;
use dynamic_analysis::reporter::CompletionReporter;
use dynamic_analysis::sandbox::{backend_for, init_network};
use dynamic_analysis::storage::{open_store, save_dynamic_analysis, ResultStore, ResultStores};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let logging = LoggingConfig::from_env().unwrap_or_default();
    if let Err(e) = shared::observability::init_logging(logging.log_config()) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.downcast_ref::<ConfigError>().is_some() => {
            error!("Usage error: {:#}", e);
            eprintln!("Usage error: {:#}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            error!("Error: {:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;
    config.validate()?;

    let package = config.package();
    info!(
        package = %package,
        local_package = ?package.local_path,
        runtime = %config.sandbox.runtime,
        "Got analysis request"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(cancel.clone()));

    let stores = open_stores(&config.storage).await?;
    if stores.is_empty() {
        warn!("No result buckets configured, results will not be persisted");
    }

    if !config.sandbox.offline {
        init_network(
            config.sandbox.runtime,
            &config.sandbox.network,
            config.sandbox.network_subnet.as_deref(),
        )
        .await
        .context("Failed to initialize analysis network")?;
    }

    let template = match &config.sandbox.analysis_command {
        Some(command) => DefaultCommandTemplate::with_analysis_command(command.clone()),
        None => DefaultCommandTemplate::new(),
    };
    let runner = PhaseRunner::new(Arc::new(template), config.sandbox.phase_timeout());
    let engine = DynamicAnalysisEngine::new(backend_for(config.sandbox.runtime), config.sandbox_config(), runner);

    let reporter = CompletionReporter::new(
        config.worker.task_id.clone(),
        config.worker.api_url.clone(),
        config.worker.internal_api_token.clone(),
    );

    info!(package = %package, "Starting dynamic analysis");
    let outcome = match engine.run(&package, &cancel).await {
        Ok(result) => {
            if !result.is_completed() {
                info!(
                    package = %package,
                    last_run_phase = ?result.last_run_phase,
                    status = ?result.last_status,
                    "Dynamic analysis did not complete"
                );
            }
            save_dynamic_analysis(&stores, &result, &package)
                .await
                .context("Upload error")
        }
        Err(e) => Err(anyhow::Error::new(e).context("Dynamic analysis aborted")),
    };

    let status = if outcome.is_ok() { "done" } else { "error" };
    if let Err(e) = reporter.report_done(status, &cancel).await {
        // Reporting failures never fail the run
        error!(task_id = %reporter.task_id(), "Failed to report completion: {}", e);
    }

    outcome
}

async fn open_stores(storage: &StorageConfig) -> Result<ResultStores> {
    async fn open(key: &'static str, location: &Option<String>) -> Result<Option<Arc<dyn ResultStore>>> {
        match location {
            Some(uri) => open_store(uri)
                .await
                .map(Some)
                .map_err(|e| ConfigError::Invalid { key, message: e.to_string() }.into()),
            None => Ok(None),
        }
    }

    Ok(ResultStores {
        dynamic_analysis: open("DYNAMIC_BUCKET", &storage.dynamic_bucket).await?,
        execution_log: open("EXECUTION_LOG_BUCKET", &storage.execution_log_bucket).await?,
        file_writes: open("FILE_WRITES_BUCKET", &storage.file_writes_bucket).await?,
        analyzed_package: open("ANALYZED_PKG_BUCKET", &storage.analyzed_pkg_bucket).await?,
    })
}

async fn cancel_on_shutdown(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    warn!("Shutdown signal received, cancelling analysis");
    cancel.cancel();
}

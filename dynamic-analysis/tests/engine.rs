//! Engine integration tests against a scripted sandbox backend

use async_trait::async_trait;
use mockito::Matcher;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use dynamic_analysis::engine::{DefaultCommandTemplate, DynamicAnalysisEngine, PhaseRunner};
use dynamic_analysis::models::{
    CapturedOutput, Ecosystem, ExitInfo, FileWriteKind, Package, Phase, PhaseFailure, PhaseStatus, RunStatus,
};
use dynamic_analysis::reporter::{CompletionReporter, RetryPolicy};
use dynamic_analysis::sandbox::{CommandOutput, Sandbox, SandboxBackend, SandboxConfig};
use dynamic_analysis::storage::{save_dynamic_analysis, LocalResultStore, ResultStore, ResultStores};
use dynamic_analysis::telemetry::TelemetryConfig;
use dynamic_analysis::{EngineError, SandboxError};

/// What the fake sandbox does for a phase
#[derive(Clone, Copy)]
enum Step {
    Exit(i32),
    Signal(i32),
    /// Never finishes; ends by timeout or cancellation
    Hang,
}

#[derive(Default)]
struct Record {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    commands: Mutex<Vec<Vec<String>>>,
    configs: Mutex<Vec<SandboxConfig>>,
}

struct FakeBackend {
    steps: HashMap<Phase, Step>,
    fail_setup: bool,
    record: Arc<Record>,
    trace_dir: Arc<TempDir>,
}

impl FakeBackend {
    fn new(steps: &[(Phase, Step)]) -> Self {
        Self {
            steps: steps.iter().copied().collect(),
            fail_setup: false,
            record: Arc::new(Record::default()),
            trace_dir: Arc::new(tempfile::tempdir().unwrap()),
        }
    }

    fn failing_setup() -> Self {
        Self {
            fail_setup: true,
            ..Self::new(&[])
        }
    }
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(&self, config: &SandboxConfig) -> Result<Arc<dyn Sandbox>, SandboxError> {
        self.record.configs.lock().unwrap().push(config.clone());
        if self.fail_setup {
            return Err(SandboxError::Setup("image not found locally and pulling is disabled".to_string()));
        }
        let n = self.record.created.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(FakeSandbox {
            id: format!("fake-{}", n),
            steps: self.steps.clone(),
            record: Arc::clone(&self.record),
            trace_base: self.trace_dir.path().join(format!("trace-{}.log", n)),
            clock: AtomicUsize::new(0),
        }))
    }
}

struct FakeSandbox {
    id: String,
    steps: HashMap<Phase, Step>,
    record: Arc<Record>,
    trace_base: PathBuf,
    clock: AtomicUsize,
}

fn hex(s: &str) -> String {
    format!("\"{}\"", s.bytes().map(|b| format!("\\x{:02x}", b)).collect::<String>())
}

impl FakeSandbox {
    fn log_path(&self, phase: Phase) -> PathBuf {
        PathBuf::from(format!("{}.{}", self.trace_base.display(), phase))
    }

    /// Write the strace lines a phase command would have produced
    fn trace(&self, phase: Phase) {
        let tick = self.clock.fetch_add(3, Ordering::SeqCst);
        let path = format!("/tmp/{}-marker", phase);
        let lines = [
            format!("100 1700000000.{:06} openat(AT_FDCWD, {}, O_WRONLY|O_CREAT|O_TRUNC, 0644) = 3", tick, hex(&path)),
            format!("100 1700000000.{:06} write(3, {}, 2) = 2", tick + 1, hex("ok")),
            format!("100 1700000000.{:06} close(3) = 0", tick + 2),
        ];
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(phase))
            .unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
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
        self.record.commands.lock().unwrap().push(argv.to_vec());

        // The default template puts the phase right before the package name
        assert_eq!(argv.get(argv.len().saturating_sub(2)).map(String::as_str), Some(phase.as_str()));
        self.trace(phase);

        match self.steps.get(&phase).copied().unwrap_or(Step::Exit(0)) {
            Step::Exit(code) => Ok(CommandOutput {
                stdout: CapturedOutput::from_bytes(format!("{} output\n", phase).as_bytes()),
                stderr: CapturedOutput::default(),
                exit: ExitInfo::code(code),
            }),
            Step::Signal(signal) => Ok(CommandOutput {
                exit: ExitInfo::signal(signal),
                ..Default::default()
            }),
            Step::Hang => tokio::select! {
                _ = tokio::time::sleep(timeout) => Err(SandboxError::CommandTimeout { after: timeout }),
                _ = cancel.cancelled() => Err(SandboxError::Cancelled),
            },
        }
    }

    fn observe(&self, argv: &[String]) -> Command {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(["-s", "0.05"]).args(&argv[1..]);
        cmd
    }

    fn capture_command(&self) -> Option<Command> {
        None
    }

    fn trace_log(&self, phase: Phase) -> Option<String> {
        Some(self.log_path(phase).display().to_string())
    }

    async fn destroy(&self) -> Result<(), SandboxError> {
        self.record.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn engine_for(backend: FakeBackend, timeout: Duration) -> (DynamicAnalysisEngine, Arc<Record>) {
    let record = Arc::clone(&backend.record);
    let runner = PhaseRunner::new(Arc::new(DefaultCommandTemplate::new()), timeout);
    let telemetry = TelemetryConfig {
        syscalls: true,
        packets: false,
        grace_period: Duration::from_secs(5),
        ..TelemetryConfig::default()
    };
    let engine = DynamicAnalysisEngine::new(Arc::new(backend), SandboxConfig::default(), runner)
        .with_telemetry_config(telemetry);
    (engine, record)
}

fn lodash() -> Package {
    Package::new(Ecosystem::Npm, "lodash", "4.17.21")
}

#[tokio::test]
async fn test_all_phases_succeed() {
    let (engine, record) = engine_for(FakeBackend::new(&[]), Duration::from_secs(5));
    let result = engine.run(&lodash(), &CancellationToken::new()).await.unwrap();

    assert_eq!(result.last_run_phase, Some(Phase::Execute));
    assert_eq!(result.last_status, RunStatus::Completed);
    let statuses: Vec<_> = result.phases.iter().map(|o| o.status).collect();
    assert_eq!(statuses, vec![PhaseStatus::Succeeded; 3]);
    assert_eq!(result.phase(Phase::Import).unwrap().stdout.text, "import output\n");
    assert_eq!(result.sandbox_backend, "fake");

    assert_eq!(record.created.load(Ordering::SeqCst), 1);
    assert_eq!(record.destroyed.load(Ordering::SeqCst), 1);
    let commands = record.commands.lock().unwrap().clone();
    assert_eq!(
        commands[0],
        vec!["/usr/local/bin/analyze-node.js", "--version", "4.17.21", "install", "lodash"]
    );
}

#[tokio::test]
async fn test_import_failure_skips_execute() {
    let backend = FakeBackend::new(&[(Phase::Import, Step::Exit(1))]);
    let (engine, record) = engine_for(backend, Duration::from_secs(5));
    let result = engine.run(&lodash(), &CancellationToken::new()).await.unwrap();

    assert_eq!(result.last_run_phase, Some(Phase::Import));
    assert_eq!(result.last_status, RunStatus::Failed);
    assert_eq!(result.phase(Phase::Install).unwrap().status, PhaseStatus::Succeeded);
    let import = result.phase(Phase::Import).unwrap();
    assert_eq!(import.status, PhaseStatus::Failed);
    assert_eq!(import.failure, Some(PhaseFailure::ExitCode(1)));
    let execute = result.phase(Phase::Execute).unwrap();
    assert_eq!(execute.status, PhaseStatus::Skipped);
    assert!(execute.command.is_empty());

    assert_eq!(record.commands.lock().unwrap().len(), 2);
    assert_eq!(record.destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_signal_is_recorded() {
    let backend = FakeBackend::new(&[(Phase::Install, Step::Signal(9))]);
    let (engine, _) = engine_for(backend, Duration::from_secs(5));
    let result = engine.run(&lodash(), &CancellationToken::new()).await.unwrap();

    assert_eq!(result.last_run_phase, Some(Phase::Install));
    assert_eq!(result.phase(Phase::Install).unwrap().failure, Some(PhaseFailure::Signal(9)));
    assert_eq!(result.ran_phases().count(), 1);
}

#[tokio::test]
async fn test_timeout_fails_phase_and_destroys_once() {
    let backend = FakeBackend::new(&[(Phase::Install, Step::Hang)]);
    let (engine, record) = engine_for(backend, Duration::from_millis(100));
    let result = engine.run(&lodash(), &CancellationToken::new()).await.unwrap();

    let install = result.phase(Phase::Install).unwrap();
    assert_eq!(
        install.failure,
        Some(PhaseFailure::Timeout { after: Duration::from_millis(100) })
    );
    assert_eq!(result.last_status, RunStatus::Failed);
    assert_eq!(result.phase(Phase::Import).unwrap().status, PhaseStatus::Skipped);
    assert_eq!(record.destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancellation_during_phase() {
    let backend = FakeBackend::new(&[(Phase::Import, Step::Hang)]);
    let (engine, record) = engine_for(backend, Duration::from_secs(60));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let result = engine.run(&lodash(), &cancel).await.unwrap();

    assert_eq!(result.last_run_phase, Some(Phase::Import));
    assert_eq!(result.phase(Phase::Import).unwrap().failure, Some(PhaseFailure::Cancelled));
    assert_eq!(result.phase(Phase::Execute).unwrap().status, PhaseStatus::Skipped);
    assert_eq!(record.destroyed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let (engine, record) = engine_for(FakeBackend::new(&[]), Duration::from_secs(5));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = engine.run(&lodash(), &cancel).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
    assert_eq!(record.created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_setup_failure_is_fatal() {
    let (engine, record) = engine_for(FakeBackend::failing_setup(), Duration::from_secs(5));
    let err = engine.run(&lodash(), &CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, EngineError::SandboxSetup(SandboxError::Setup(_))));
    assert!(record.commands.lock().unwrap().is_empty());
    assert_eq!(record.destroyed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_local_package_is_copied_in() {
    let (engine, record) = engine_for(FakeBackend::new(&[]), Duration::from_secs(5));
    let package = Package::new(Ecosystem::PyPI, "requests", "").with_local_path("/tmp/requests-2.31.0.tar.gz");
    engine.run(&package, &CancellationToken::new()).await.unwrap();

    let configs = record.configs.lock().unwrap();
    assert_eq!(configs[0].copies.len(), 1);
    assert_eq!(configs[0].copies[0].sandbox_path, "/tmp/requests-2.31.0.tar.gz");
    let commands = record.commands.lock().unwrap();
    assert!(commands[0].windows(2).any(|w| w[0] == "--local" && w[1] == "/tmp/requests-2.31.0.tar.gz"));
}

#[tokio::test]
async fn test_syscalls_are_tagged_with_ran_phases() {
    let backend = FakeBackend::new(&[(Phase::Import, Step::Exit(2))]);
    let (engine, _) = engine_for(backend, Duration::from_secs(5));
    let result = engine.run(&lodash(), &CancellationToken::new()).await.unwrap();

    let ran: Vec<Phase> = result.ran_phases().collect();
    assert_eq!(ran, vec![Phase::Install, Phase::Import]);
    assert!(result.syscall_count() > 0);
    for phase in result.syscalls.keys() {
        assert!(ran.contains(phase), "syscalls tagged with {:?}", phase);
    }
    assert!(!result.syscalls.contains_key(&Phase::Execute));

    // Every marker write belongs to the phase that produced it
    for write in &result.file_writes {
        assert_eq!(write.path, format!("/tmp/{}-marker", write.phase));
    }
    for phase in &ran {
        assert!(result.file_writes.iter().any(|w| w.phase == *phase));
    }

    let install_marker = result
        .file_writes
        .iter()
        .find(|w| w.path == "/tmp/install-marker" && w.kind == FileWriteKind::Write)
        .expect("install marker write");
    assert_eq!(install_marker.bytes_written, 2);
    // No capture command on this backend
    assert!(result.network.is_none());
}

#[tokio::test]
async fn test_phase_tags_hold_across_repeated_runs() {
    for _ in 0..5 {
        let (engine, _) = engine_for(FakeBackend::new(&[]), Duration::from_secs(5));
        let result = engine.run(&lodash(), &CancellationToken::new()).await.unwrap();

        assert_eq!(result.file_writes.len(), 6);
        for write in &result.file_writes {
            assert_eq!(write.path, format!("/tmp/{}-marker", write.phase));
        }
        for phase in Phase::ALL {
            assert_eq!(result.syscalls.get(&phase).map(Vec::len), Some(3));
        }
    }
}

#[tokio::test]
async fn test_lodash_end_to_end() {
    let (engine, _) = engine_for(FakeBackend::new(&[]), Duration::from_secs(5));
    let package = lodash();
    let result = engine.run(&package, &CancellationToken::new()).await.unwrap();
    assert!(result.is_completed());

    let results_dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ResultStore> = Arc::new(LocalResultStore::new(results_dir.path()));
    let stores = ResultStores {
        dynamic_analysis: Some(Arc::clone(&store)),
        execution_log: Some(Arc::clone(&store)),
        file_writes: Some(store),
        analyzed_package: None,
    };
    save_dynamic_analysis(&stores, &result, &package).await.unwrap();

    let saved: serde_json::Value =
        serde_json::from_slice(&std::fs::read(results_dir.path().join("npm/lodash/4.17.21.json")).unwrap()).unwrap();
    assert_eq!(saved["last_run_phase"], "execute");
    assert_eq!(saved["package"]["name"], "lodash");
    let log = std::fs::read_to_string(results_dir.path().join("npm/lodash/4.17.21.log")).unwrap();
    assert!(log.contains("execute output"));

    let mut server = mockito::Server::new_async().await;
    let callback = server
        .mock("POST", "/api/internal/callback/")
        .match_header("authorization", "Bearer token")
        .match_body(Matcher::Json(json!({"task_id": "task-lodash", "status": "done"})))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let reporter = CompletionReporter::with_policy(
        "task-lodash",
        format!("{}/api/internal/callback/", server.url()),
        "token",
        RetryPolicy {
            initial_wait: Duration::from_millis(1),
            ..RetryPolicy::default()
        },
    );
    reporter.report_done("done", &CancellationToken::new()).await.unwrap();
    callback.assert_async().await;
}

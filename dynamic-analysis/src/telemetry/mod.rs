/// Telemetry collection for a running sandbox
///
/// Collectors run as independent tasks for the whole sandbox lifetime:
/// - Syscall tracer following the per-phase strace logs of phase commands
/// - Packet capturer reading pcap data from a capture command
///
/// DNS activity is derived from the packet capture after detach. Collector
/// failures never abort a run; they are reported as `TelemetryWarning`s.

pub mod dns;
pub mod packet;
pub mod syscall;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{
    CommandExec, DnsRecord, FileWrite, NetworkSummary, Phase, SyscallEntry, TelemetryWarning,
};
use crate::sandbox::{Sandbox, SandboxConfig};

/// Default time a collector gets to drain after detach is requested
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// The phase currently executing, shared read-only with collectors
#[derive(Clone)]
pub struct PhaseTag {
    sender: Arc<watch::Sender<Phase>>,
}

impl PhaseTag {
    pub fn new(initial: Phase) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender: Arc::new(sender) }
    }

    /// Only the engine calls this, before each phase starts
    pub fn set(&self, phase: Phase) {
        self.sender.send_replace(phase);
    }

    pub fn current(&self) -> Phase {
        *self.sender.borrow()
    }

    pub fn reader(&self) -> watch::Receiver<Phase> {
        self.sender.subscribe()
    }
}

impl Default for PhaseTag {
    fn default() -> Self {
        Self::new(Phase::Install)
    }
}

/// Append-only buffer shared between a collector task and the session
pub struct TelemetryBuffer<T> {
    inner: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for TelemetryBuffer<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> Default for TelemetryBuffer<T> {
    fn default() -> Self {
        Self { inner: Arc::new(Mutex::new(Vec::new())) }
    }
}

impl<T> TelemetryBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        // A panicking collector must not take the data down with it
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, item: T) {
        self.lock().push(item);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take everything collected so far, leaving the buffer empty
    pub fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.lock())
    }
}

impl<T: Clone> TelemetryBuffer<T> {
    pub fn extend_from_slice(&self, items: &[T]) {
        self.lock().extend_from_slice(items);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.lock().clone()
    }
}

/// Which collectors to start
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub syscalls: bool,
    pub packets: bool,
    /// Packet capture bytes kept before the capture is stopped
    pub max_capture_bytes: usize,
    pub grace_period: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            syscalls: true,
            packets: true,
            max_capture_bytes: packet::MAX_CAPTURE_BYTES,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl From<&SandboxConfig> for TelemetryConfig {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            syscalls: config.trace_syscalls,
            packets: config.capture_packets,
            max_capture_bytes: packet::MAX_CAPTURE_BYTES,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// Everything the collectors gathered over a sandbox lifetime
#[derive(Debug, Clone, Default)]
pub struct CollectedTelemetry {
    pub syscalls: Vec<SyscallEntry>,
    pub commands: Vec<CommandExec>,
    pub file_writes: Vec<FileWrite>,
    /// Raw capture, kept for callers that want to persist it
    pub pcap: Option<Vec<u8>>,
    pub network: Option<NetworkSummary>,
    pub dns: Vec<DnsRecord>,
    pub warnings: Vec<TelemetryWarning>,
}

type CollectorTask = JoinHandle<Result<(), String>>;

/// Running collectors attached to one sandbox
pub struct TelemetrySession {
    sandbox_id: String,
    stop: CancellationToken,
    grace_period: Duration,
    syscall_task: Option<CollectorTask>,
    syscall_sink: syscall::SyscallSink,
    packet_task: Option<CollectorTask>,
    packet_data: TelemetryBuffer<u8>,
    packet_started: bool,
    warnings: Vec<TelemetryWarning>,
}

impl TelemetrySession {
    /// Start every enabled collector against `sandbox`
    pub fn attach(sandbox: &Arc<dyn Sandbox>, phase_tag: &PhaseTag, config: &TelemetryConfig) -> Self {
        let stop = CancellationToken::new();
        let syscall_sink = syscall::SyscallSink::default();
        let packet_data = TelemetryBuffer::new();
        let mut warnings = Vec::new();

        let syscall_task = if config.syscalls {
            match sandbox.trace_log(Phase::Install) {
                Some(_) => Some(tokio::spawn(syscall::follow_phases(
                    Arc::clone(sandbox),
                    phase_tag.reader(),
                    syscall_sink.clone(),
                    stop.clone(),
                ))),
                None => {
                    warnings.push(TelemetryWarning::new(
                        syscall::COLLECTOR,
                        "sandbox does not provide a syscall trace log",
                    ));
                    None
                }
            }
        } else {
            None
        };

        let packet_task = if config.packets {
            match sandbox.capture_command() {
                Some(capture) => Some(tokio::spawn(packet::capture(
                    capture,
                    packet_data.clone(),
                    config.max_capture_bytes,
                    stop.clone(),
                ))),
                None => {
                    warnings.push(TelemetryWarning::new(
                        packet::COLLECTOR,
                        "sandbox does not support packet capture",
                    ));
                    None
                }
            }
        } else {
            None
        };

        info!(
            sandbox_id = %sandbox.id(),
            syscalls = syscall_task.is_some(),
            packets = packet_task.is_some(),
            "Telemetry collectors attached"
        );

        Self {
            sandbox_id: sandbox.id().to_string(),
            stop,
            grace_period: config.grace_period,
            syscall_task,
            syscall_sink,
            packet_started: packet_task.is_some(),
            packet_task,
            packet_data,
            warnings,
        }
    }

    /// Stop the collectors and gather their data. Never fails.
    pub async fn detach(mut self) -> CollectedTelemetry {
        self.stop.cancel();

        let grace = self.grace_period;
        let mut warnings = std::mem::take(&mut self.warnings);

        if let Some(task) = self.syscall_task.take() {
            if let Some(warning) = Self::finish(syscall::COLLECTOR, task, grace).await {
                warnings.push(warning);
            }
        }

        if let Some(task) = self.packet_task.take() {
            if let Some(warning) = Self::finish(packet::COLLECTOR, task, grace).await {
                warnings.push(warning);
            }
        }

        let stats = self.syscall_sink.stats();
        if stats.unparsed > 0 {
            warnings.push(TelemetryWarning::new(
                syscall::COLLECTOR,
                format!("{} trace lines could not be parsed", stats.unparsed),
            ));
        }
        if stats.dropped > 0 {
            warnings.push(TelemetryWarning::new(
                syscall::COLLECTOR,
                format!("{} syscall entries dropped after reaching the entry limit", stats.dropped),
            ));
        }

        let mut collected = CollectedTelemetry {
            syscalls: self.syscall_sink.syscalls.take(),
            commands: self.syscall_sink.commands.take(),
            file_writes: self.syscall_sink.file_writes.take(),
            ..Default::default()
        };

        let raw = self.packet_data.take();
        if !raw.is_empty() {
            match packet::parse_pcap(&raw) {
                Ok(capture) => {
                    collected.network = Some(packet::summarize(&capture));
                    collected.dns = dns::extract(&capture);
                    if capture.truncated {
                        warnings.push(TelemetryWarning::new(packet::COLLECTOR, "capture ended mid-record"));
                    }
                }
                Err(e) => {
                    warnings.push(TelemetryWarning::new(packet::COLLECTOR, format!("unreadable capture: {}", e)));
                }
            }
            collected.pcap = Some(raw);
        } else if self.packet_started && !warnings.iter().any(|w| w.collector == packet::COLLECTOR) {
            warnings.push(TelemetryWarning::new(packet::COLLECTOR, "capture produced no data"));
        }

        for warning in &warnings {
            warn!(sandbox_id = %self.sandbox_id, collector = %warning.collector, "{}", warning.message);
        }
        debug!(
            sandbox_id = %self.sandbox_id,
            syscalls = collected.syscalls.len(),
            file_writes = collected.file_writes.len(),
            dns = collected.dns.len(),
            "Telemetry collectors detached"
        );

        collected.warnings = warnings;
        collected
    }

    async fn finish(collector: &str, mut task: CollectorTask, grace: Duration) -> Option<TelemetryWarning> {
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(message))) => Some(TelemetryWarning::new(collector, message)),
            Ok(Err(e)) => Some(TelemetryWarning::new(collector, format!("collector task failed: {}", e))),
            Err(_) => {
                task.abort();
                Some(TelemetryWarning::new(
                    collector,
                    format!("collector did not stop within {:?}", grace),
                ))
            }
        }
    }
}

impl Drop for TelemetrySession {
    fn drop(&mut self) {
        self.stop.cancel();
        for task in [self.syscall_task.take(), self.packet_task.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_tag_is_shared() {
        let tag = PhaseTag::default();
        let reader = tag.reader();
        tag.set(Phase::Execute);
        assert_eq!(*reader.borrow(), Phase::Execute);
        assert_eq!(tag.clone().current(), Phase::Execute);
    }

    #[test]
    fn test_buffer_clones_share_storage() {
        let buffer = TelemetryBuffer::new();
        let writer = buffer.clone();
        writer.push(1u32);
        writer.extend_from_slice(&[2, 3]);
        assert_eq!(buffer.snapshot(), vec![1, 2, 3]);
        assert_eq!(buffer.take(), vec![1, 2, 3]);
        assert!(writer.is_empty());
    }

    #[tokio::test]
    async fn test_finish_times_out_slow_collector() {
        let task: CollectorTask = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let warning = TelemetrySession::finish("slow", task, Duration::from_millis(20)).await.unwrap();
        assert_eq!(warning.collector, "slow");
        assert!(warning.message.contains("did not stop"));
    }

    #[tokio::test]
    async fn test_finish_reports_collector_error() {
        let task: CollectorTask = tokio::spawn(async { Err("spawn failed".to_string()) });
        let warning = TelemetrySession::finish("packet", task, Duration::from_secs(1)).await.unwrap();
        assert_eq!(warning.message, "spawn failed");
    }
}

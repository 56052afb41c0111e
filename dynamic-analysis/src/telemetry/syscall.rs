/// Syscall tracing from strace logs
///
/// Phase commands run under `strace -f -ttt -qq -xx`, each writing its own
/// log, so every line has the form `<pid> <epoch>.<usec> <name>(<args>) =
/// <result>`, with string arguments hex-escaped. Calls interrupted by another
/// process show up as an `<unfinished ...>` line followed later by a
/// `<... name resumed>` line.
///
/// A follower is started for a phase's log once the phase tag reaches it,
/// and everything read from that log is tagged with that phase.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use shared::crypto::sha256;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::TelemetryBuffer;
use crate::models::{CommandExec, FileWrite, FileWriteKind, Phase, SyscallEntry};
use crate::sandbox::Sandbox;

pub const COLLECTOR: &str = "syscall";

/// Entries kept per run before further syscalls are only counted
pub const MAX_SYSCALL_ENTRIES: usize = 1_000_000;

/// How long to wait for more trace lines once detach was requested
const DRAIN_IDLE: Duration = Duration::from_millis(250);

/// Startup allowance for a follower that had printed nothing before detach
const DRAIN_FIRST_LINE: Duration = Duration::from_secs(2);

lazy_static! {
    static ref LINE: Regex = Regex::new(r"^(\d+)\s+(\d+)\.(\d+)\s+(.*)$").unwrap();
    static ref COMPLETE: Regex = Regex::new(r"^(\w+)\((.*)\)\s+=\s+(.+)$").unwrap();
    static ref UNFINISHED: Regex = Regex::new(r"^(\w+)\((.*?)\s*<unfinished \.\.\.>$").unwrap();
    static ref RESUMED: Regex = Regex::new(r"^<\.\.\. (\w+) resumed>\s?(.*)$").unwrap();
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TracerStats {
    pub unparsed: u64,
    pub dropped: u64,
}

/// Buffers the syscall tracer appends to
#[derive(Clone, Default)]
pub struct SyscallSink {
    pub syscalls: TelemetryBuffer<SyscallEntry>,
    pub commands: TelemetryBuffer<CommandExec>,
    pub file_writes: TelemetryBuffer<FileWrite>,
    unparsed: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    recorded: Arc<AtomicUsize>,
}

impl SyscallSink {
    pub fn stats(&self) -> TracerStats {
        TracerStats {
            unparsed: self.unparsed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Claim room for one more entry; the limit is shared by every follower
    fn reserve(&self, limit: usize) -> bool {
        let claimed = self
            .recorded
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| (n < limit).then_some(n + 1))
            .is_ok();
        if !claimed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        claimed
    }
}

/// Follow the trace log of every phase the tag reaches until `stop` fires.
///
/// The engine moves the tag before starting a phase, so a follower is
/// always started before or while its phase writes. Phases the tag skipped
/// past between two wakeups are caught up in order.
pub async fn follow_phases(
    sandbox: Arc<dyn Sandbox>,
    mut phase: watch::Receiver<Phase>,
    sink: SyscallSink,
    stop: CancellationToken,
) -> Result<(), String> {
    let mut followers = JoinSet::new();
    let mut next = Some(Phase::Install);

    loop {
        let current = *phase.borrow_and_update();
        start_followers(&sandbox, &mut next, current, &sink, &stop, &mut followers)?;

        tokio::select! {
            changed = phase.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = stop.cancelled() => break,
        }
    }

    // The tag may have moved right before detach
    let current = *phase.borrow();
    start_followers(&sandbox, &mut next, current, &sink, &stop, &mut followers)?;

    let mut first_error = None;
    while let Some(joined) = followers.join_next().await {
        let outcome = joined.map_err(|e| format!("trace follower failed: {}", e)).and_then(|r| r);
        if let Err(e) = outcome {
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn start_followers(
    sandbox: &Arc<dyn Sandbox>,
    next: &mut Option<Phase>,
    current: Phase,
    sink: &SyscallSink,
    stop: &CancellationToken,
    followers: &mut JoinSet<Result<(), String>>,
) -> Result<(), String> {
    while let Some(phase) = next.filter(|p| *p <= current) {
        let log = sandbox
            .trace_log(phase)
            .ok_or_else(|| format!("sandbox has no trace log for the {} phase", phase))?;
        let argv = ["tail", "-n", "+1", "-F", log.as_str()].map(String::from);
        debug!(phase = %phase, "Following trace log {}", log);
        followers.spawn(follow(sandbox.observe(&argv), phase, sink.clone(), stop.clone()));
        *next = phase.next();
    }
    Ok(())
}

/// Run `follower` (a command printing the trace log of `phase`) and parse
/// its output until `stop` fires and the output goes idle.
pub async fn follow(
    mut follower: Command,
    phase: Phase,
    sink: SyscallSink,
    stop: CancellationToken,
) -> Result<(), String> {
    follower
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = follower
        .spawn()
        .map_err(|e| format!("failed to start trace follower: {}", e))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "trace follower has no stdout".to_string())?;

    let mut lines = BufReader::new(stdout).split(b'\n');
    let mut parser = StraceParser::new(sink, MAX_SYSCALL_ENTRIES);
    let mut seen_output = false;

    loop {
        tokio::select! {
            biased;
            segment = lines.next_segment() => match segment {
                Ok(Some(raw)) => {
                    seen_output = true;
                    parser.ingest(&String::from_utf8_lossy(&raw), phase);
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = child.kill().await;
                    return Err(format!("failed to read trace log: {}", e));
                }
            },
            _ = stop.cancelled() => break,
        }
    }

    if stop.is_cancelled() {
        // The phase may have flushed lines the follower has not printed yet
        loop {
            let idle = if seen_output { DRAIN_IDLE } else { DRAIN_FIRST_LINE };
            match tokio::time::timeout(idle, lines.next_segment()).await {
                Ok(Ok(Some(raw))) => {
                    seen_output = true;
                    parser.ingest(&String::from_utf8_lossy(&raw), phase);
                }
                _ => break,
            }
        }
    }

    let _ = child.kill().await;
    parser.finish();
    debug!(phase = %phase, "Trace follower stopped");
    Ok(())
}

struct PendingCall {
    name: String,
    args: String,
    timestamp: DateTime<Utc>,
    phase: Phase,
}

struct RawCall {
    pid: u32,
    timestamp: DateTime<Utc>,
    phase: Phase,
    name: String,
    args: String,
    result: Option<String>,
}

/// Incremental strace log parser with per-process file descriptor tables
pub struct StraceParser {
    sink: SyscallSink,
    max_entries: usize,
    pending: HashMap<u32, PendingCall>,
    fds: HashMap<u32, HashMap<i64, String>>,
}

impl StraceParser {
    pub fn new(sink: SyscallSink, max_entries: usize) -> Self {
        Self {
            sink,
            max_entries,
            pending: HashMap::new(),
            fds: HashMap::new(),
        }
    }

    pub fn ingest(&mut self, line: &str, phase: Phase) {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }

        let Some(caps) = LINE.captures(line) else {
            self.unparsed();
            return;
        };

        let (Ok(pid), Some(timestamp)) = (caps[1].parse::<u32>(), parse_timestamp(&caps[2], &caps[3])) else {
            self.unparsed();
            return;
        };
        let body = &caps[4];

        // Process exit and signal notices
        if body.starts_with("+++") || body.starts_with("---") {
            return;
        }

        if let Some(caps) = UNFINISHED.captures(body) {
            self.pending.insert(
                pid,
                PendingCall {
                    name: caps[1].to_string(),
                    args: caps[2].to_string(),
                    timestamp,
                    phase,
                },
            );
            return;
        }

        let (text, timestamp, phase) = match RESUMED.captures(body) {
            Some(caps) => {
                let name = &caps[1];
                match self.pending.remove(&pid) {
                    Some(pending) if pending.name == name => {
                        (format!("{}({}{}", name, pending.args, &caps[2]), pending.timestamp, pending.phase)
                    }
                    _ => (format!("{}({}", name, &caps[2]), timestamp, phase),
                }
            }
            None => (body.to_string(), timestamp, phase),
        };

        match COMPLETE.captures(&text) {
            Some(caps) => self.handle(RawCall {
                pid,
                timestamp,
                phase,
                name: caps[1].to_string(),
                args: caps[2].to_string(),
                result: Some(caps[3].trim().to_string()),
            }),
            None => self.unparsed(),
        }
    }

    /// Record calls that never resumed, e.g. because the process was killed
    pub fn finish(&mut self) {
        let pending: Vec<(u32, PendingCall)> = self.pending.drain().collect();
        for (pid, call) in pending {
            self.handle(RawCall {
                pid,
                timestamp: call.timestamp,
                phase: call.phase,
                name: call.name,
                args: call.args,
                result: None,
            });
        }
    }

    fn unparsed(&self) {
        self.sink.unparsed.fetch_add(1, Ordering::Relaxed);
    }

    fn handle(&mut self, call: RawCall) {
        let args = split_args(&call.args);
        let ret = call.result.as_deref().and_then(return_value);

        self.apply_effects(&call, &args, ret);

        if !self.sink.reserve(self.max_entries) {
            return;
        }
        self.sink.syscalls.push(SyscallEntry {
            phase: call.phase,
            pid: call.pid,
            timestamp: call.timestamp,
            args: args.iter().map(|arg| render_arg(arg)).collect::<Vec<_>>().join(", "),
            name: call.name,
            result: call.result,
        });
    }

    fn apply_effects(&mut self, call: &RawCall, args: &[String], ret: Option<i64>) {
        let pid = call.pid;
        let succeeded = ret.map(|r| r >= 0).unwrap_or(false);

        match call.name.as_str() {
            "open" | "openat" | "creat" => {
                let (dirfd, path, flags) = match call.name.as_str() {
                    "openat" => (args.first(), args.get(1), args.get(2).map(String::as_str)),
                    "creat" => (None, args.first(), Some("O_CREAT|O_WRONLY|O_TRUNC")),
                    _ => (None, args.first(), args.get(1).map(String::as_str)),
                };
                let (Some(path), Some(fd)) = (path.and_then(|p| decode_path(p)), ret.filter(|r| *r >= 0)) else {
                    return;
                };
                let path = self.resolve(pid, dirfd, path);
                self.fds.entry(pid).or_default().insert(fd, path.clone());

                let flags = flags.unwrap_or("");
                let kind = if flags.contains("O_TRUNC") && is_write_mode(flags) {
                    Some(FileWriteKind::Truncate)
                } else if flags.contains("O_CREAT") {
                    Some(FileWriteKind::Create)
                } else {
                    None
                };
                if let Some(kind) = kind {
                    self.file_write(call, path, kind, None, 0, None);
                }
            }
            "write" | "pwrite64" => {
                let (Some(fd), Some(written)) = (args.first().and_then(|a| a.parse::<i64>().ok()), ret) else {
                    return;
                };
                if written < 0 {
                    return;
                }
                let Some(path) = self.fds.get(&pid).and_then(|table| table.get(&fd)).cloned() else {
                    return;
                };
                let buffer = args.get(1).and_then(|b| decode_string(b)).map(|(bytes, _)| bytes);
                let digest = buffer.filter(|b| !b.is_empty()).map(|b| sha256(&b));
                self.file_write(call, path, FileWriteKind::Write, None, written as u64, digest);
            }
            "close" => {
                if let Some(fd) = args.first().and_then(|a| a.parse::<i64>().ok()) {
                    if let Some(table) = self.fds.get_mut(&pid) {
                        table.remove(&fd);
                    }
                }
            }
            "dup" | "dup2" | "dup3" | "fcntl" => {
                if call.name == "fcntl" && !args.get(1).map(|c| c.starts_with("F_DUPFD")).unwrap_or(false) {
                    return;
                }
                let (Some(old), Some(new)) = (args.first().and_then(|a| a.parse::<i64>().ok()), ret) else {
                    return;
                };
                if new < 0 {
                    return;
                }
                if let Some(table) = self.fds.get_mut(&pid) {
                    if let Some(path) = table.get(&old).cloned() {
                        table.insert(new, path);
                    }
                }
            }
            "unlink" | "unlinkat" | "rmdir" => {
                let path = if call.name == "unlinkat" { args.get(1) } else { args.first() };
                if let (Some(path), true) = (path.and_then(|p| decode_path(p)), succeeded) {
                    let dirfd = if call.name == "unlinkat" { args.first() } else { None };
                    let path = self.resolve(pid, dirfd, path);
                    self.file_write(call, path, FileWriteKind::Delete, None, 0, None);
                }
            }
            "rename" | "renameat" | "renameat2" => {
                let (from, to, from_dir, to_dir) = if call.name == "rename" {
                    (args.first(), args.get(1), None, None)
                } else {
                    (args.get(1), args.get(3), args.first(), args.get(2))
                };
                let (Some(from), Some(to)) = (from.and_then(|p| decode_path(p)), to.and_then(|p| decode_path(p))) else {
                    return;
                };
                if succeeded {
                    let from = self.resolve(pid, from_dir, from);
                    let to = self.resolve(pid, to_dir, to);
                    self.file_write(call, from, FileWriteKind::Rename, Some(to), 0, None);
                }
            }
            "execve" => {
                if ret != Some(0) {
                    return;
                }
                let argv = args
                    .get(1)
                    .map(|list| decode_string_array(list))
                    .filter(|argv| !argv.is_empty())
                    .or_else(|| args.first().and_then(|p| decode_path(p)).map(|p| vec![p]))
                    .unwrap_or_default();
                self.sink.commands.push(CommandExec {
                    phase: call.phase,
                    pid,
                    argv,
                    timestamp: call.timestamp,
                });
            }
            "clone" | "clone3" | "fork" | "vfork" => {
                if let Some(child) = ret.filter(|r| *r > 0) {
                    if let Some(table) = self.fds.get(&pid).cloned() {
                        self.fds.insert(child as u32, table);
                    }
                }
            }
            _ => {}
        }
    }

    fn resolve(&self, pid: u32, dirfd: Option<&String>, path: String) -> String {
        if path.starts_with('/') {
            return path;
        }
        let base = dirfd
            .and_then(|fd| fd.parse::<i64>().ok())
            .and_then(|fd| self.fds.get(&pid).and_then(|table| table.get(&fd)));
        match base {
            Some(dir) => format!("{}/{}", dir.trim_end_matches('/'), path),
            None => path,
        }
    }

    fn file_write(
        &self,
        call: &RawCall,
        path: String,
        kind: FileWriteKind,
        target: Option<String>,
        bytes_written: u64,
        digest: Option<String>,
    ) {
        self.sink.file_writes.push(FileWrite {
            phase: call.phase,
            pid: call.pid,
            path,
            kind,
            target,
            bytes_written,
            digest,
            timestamp: call.timestamp,
        });
    }
}

fn is_write_mode(flags: &str) -> bool {
    flags.contains("O_WRONLY") || flags.contains("O_RDWR")
}

fn parse_timestamp(secs: &str, frac: &str) -> Option<DateTime<Utc>> {
    let secs: i64 = secs.parse().ok()?;
    let digits: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
    let nanos: u32 = digits.parse().ok()?;
    DateTime::from_timestamp(secs, nanos)
}

/// First token of a result such as `3` or `-1 ENOENT (No such file or directory)`
fn return_value(result: &str) -> Option<i64> {
    result.split_whitespace().next()?.parse().ok()
}

/// Split an argument list on top-level commas
pub fn split_args(args: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for c in args.chars() {
        if in_string {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                current.push(c);
            }
            '[' | '{' | '(' => {
                depth += 1;
                current.push(c);
            }
            ']' | '}' | ')' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                out.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }

    let last = current.trim();
    if !last.is_empty() {
        out.push(last.to_string());
    }
    out
}

/// Decode a quoted strace string, returning the bytes and whether strace cut it short
pub fn decode_string(arg: &str) -> Option<(Vec<u8>, bool)> {
    let arg = arg.trim();
    let (body, truncated) = match arg.strip_suffix("...") {
        Some(rest) => (rest, true),
        None => (arg, false),
    };
    let inner = body.strip_prefix('"')?.strip_suffix('"')?;

    let mut out = Vec::with_capacity(inner.len() / 4 + 1);
    let bytes = inner.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 >= bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        match bytes[i + 1] {
            b'x' if i + 3 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 2..i + 4]).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 4;
            }
            b'n' => {
                out.push(b'\n');
                i += 2;
            }
            b't' => {
                out.push(b'\t');
                i += 2;
            }
            b'r' => {
                out.push(b'\r');
                i += 2;
            }
            b'v' => {
                out.push(0x0b);
                i += 2;
            }
            b'f' => {
                out.push(0x0c);
                i += 2;
            }
            b'0'..=b'7' => {
                let mut value: u32 = 0;
                let mut j = i + 1;
                while j < bytes.len() && j < i + 4 && (b'0'..=b'7').contains(&bytes[j]) {
                    value = value * 8 + u32::from(bytes[j] - b'0');
                    j += 1;
                }
                out.push(value as u8);
                i = j;
            }
            other => {
                out.push(other);
                i += 2;
            }
        }
    }

    Some((out, truncated))
}

fn decode_path(arg: &str) -> Option<String> {
    decode_string(arg).map(|(bytes, _)| String::from_utf8_lossy(&bytes).into_owned())
}

/// Decode `["a", "b", ...]`, as printed for execve argv
fn decode_string_array(arg: &str) -> Vec<String> {
    let Some(inner) = arg.trim().strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) else {
        return Vec::new();
    };
    split_args(inner)
        .iter()
        .filter_map(|item| decode_path(item))
        .collect()
}

/// Human-readable form of one argument
fn render_arg(arg: &str) -> String {
    if let Some((bytes, truncated)) = decode_string(arg) {
        let text = format!("{:?}", String::from_utf8_lossy(&bytes));
        return if truncated { format!("{}...", text) } else { text };
    }
    if let Some(inner) = arg.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
        let items: Vec<String> = split_args(inner).iter().map(|item| render_arg(item)).collect();
        return format!("[{}]", items.join(", "));
    }
    arg.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn hex(s: &str) -> String {
        let body: String = s.bytes().map(|b| format!("\\x{:02x}", b)).collect();
        format!("\"{}\"", body)
    }

    fn parser() -> (StraceParser, SyscallSink) {
        let sink = SyscallSink::default();
        (StraceParser::new(sink.clone(), 100), sink)
    }

    #[test]
    fn test_decode_hex_and_escapes() {
        assert_eq!(decode_string(&hex("/tmp/x")).unwrap(), (b"/tmp/x".to_vec(), false));
        assert_eq!(decode_string(r#""a\nb"..."#).unwrap(), (b"a\nb".to_vec(), true));
        assert_eq!(decode_string(r#""\0""#).unwrap().0, vec![0u8]);
        assert!(decode_string("AT_FDCWD").is_none());
    }

    #[test]
    fn test_split_args_respects_nesting() {
        let args = split_args(r#"AT_FDCWD, "a,b", [1, 2], {st_mode=S_IFREG, st_size=3}, 0"#);
        assert_eq!(args.len(), 5);
        assert_eq!(args[1], r#""a,b""#);
        assert_eq!(args[2], "[1, 2]");
    }

    #[test]
    fn test_open_write_close_produces_digest() {
        let (mut p, sink) = parser();
        let path = hex("/tmp/out.txt");
        p.ingest(&format!("100 1700000000.000001 openat(AT_FDCWD, {}, O_WRONLY|O_CREAT|O_TRUNC, 0644) = 3", path), Phase::Install);
        p.ingest(&format!("100 1700000000.000002 write(3, {}, 5) = 5", hex("hello")), Phase::Install);
        p.ingest("100 1700000000.000003 close(3) = 0", Phase::Install);
        p.ingest(&format!("100 1700000000.000004 write(3, {}, 5) = -1 EBADF (Bad file descriptor)", hex("again")), Phase::Install);

        let writes = sink.file_writes.snapshot();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].kind, FileWriteKind::Truncate);
        assert_eq!(writes[0].path, "/tmp/out.txt");
        assert_eq!(writes[1].kind, FileWriteKind::Write);
        assert_eq!(writes[1].bytes_written, 5);
        assert_eq!(
            writes[1].digest.as_deref(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
        assert_eq!(sink.syscalls.len(), 4);
        assert_eq!(sink.stats(), TracerStats::default());
    }

    #[test]
    fn test_unfinished_and_resumed_are_joined() {
        let (mut p, sink) = parser();
        p.ingest(&format!("7 1700000000.100000 execve({}, [{}, {}], 0x7ffd /* 3 vars */ <unfinished ...>", hex("/usr/bin/node"), hex("node"), hex("index.js")), Phase::Import);
        p.ingest("8 1700000000.100001 getpid() = 8", Phase::Import);
        p.ingest("7 1700000000.200000 <... execve resumed>) = 0", Phase::Execute);

        let commands = sink.commands.snapshot();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].argv, vec!["node".to_string(), "index.js".to_string()]);
        // Tagged with the phase active when the call started
        assert_eq!(commands[0].phase, Phase::Import);
        assert_eq!(commands[0].pid, 7);

        let names: Vec<String> = sink.syscalls.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["getpid".to_string(), "execve".to_string()]);
    }

    #[test]
    fn test_unlink_rename_and_fork_inheritance() {
        let (mut p, sink) = parser();
        p.ingest(&format!("1 1.0 openat(AT_FDCWD, {}, O_RDONLY|O_DIRECTORY) = 4", hex("/home/app")), Phase::Execute);
        p.ingest("1 1.1 clone(child_stack=NULL, flags=CLONE_CHILD_CLEARTID|SIGCHLD) = 2", Phase::Execute);
        p.ingest(&format!("2 1.2 unlinkat(4, {}, 0) = 0", hex("secret")), Phase::Execute);
        p.ingest(&format!("2 1.3 rename({}, {}) = 0", hex("/tmp/a"), hex("/tmp/b")), Phase::Execute);
        p.ingest(&format!("2 1.4 unlink({}) = -1 ENOENT (No such file or directory)", hex("/tmp/missing")), Phase::Execute);

        let writes = sink.file_writes.snapshot();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].kind, FileWriteKind::Delete);
        assert_eq!(writes[0].path, "/home/app/secret");
        assert_eq!(writes[1].kind, FileWriteKind::Rename);
        assert_eq!(writes[1].target.as_deref(), Some("/tmp/b"));
    }

    #[test]
    fn test_garbage_is_counted_and_notices_ignored() {
        let (mut p, sink) = parser();
        p.ingest("not a trace line", Phase::Install);
        p.ingest("5 1700000000.000000 +++ exited with 0 +++", Phase::Install);
        p.ingest("5 1700000000.000000 --- SIGCHLD {si_signo=SIGCHLD} ---", Phase::Install);
        assert_eq!(sink.stats().unparsed, 1);
        assert!(sink.syscalls.is_empty());
    }

    #[test]
    fn test_entry_limit_drops_and_counts() {
        let sink = SyscallSink::default();
        let mut p = StraceParser::new(sink.clone(), 1);
        p.ingest("1 1.0 getpid() = 1", Phase::Install);
        p.ingest("1 1.1 getpid() = 1", Phase::Install);
        assert_eq!(sink.syscalls.len(), 1);
        assert_eq!(sink.stats().dropped, 1);
    }

    #[test]
    fn test_finish_flushes_pending_calls() {
        let (mut p, sink) = parser();
        p.ingest("9 1.0 wait4(-1,  <unfinished ...>", Phase::Execute);
        p.finish();
        let entries = sink.syscalls.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].result, None);
    }

    #[test]
    fn test_timestamp_parsing() {
        let ts = parse_timestamp("1700000000", "123456").unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_micros(), 123_456);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_follow_reads_until_eof() {
        let mut log = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        writeln!(log, "3 1700000000.000001 getuid() = 0").unwrap();
        writeln!(log, "3 1700000000.000002 getgid() = 0").unwrap();

        let mut cmd = Command::new("cat");
        cmd.arg(log.path());
        let sink = SyscallSink::default();

        follow(cmd, Phase::Execute, sink.clone(), CancellationToken::new()).await.unwrap();
        let entries = sink.syscalls.snapshot();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.phase == Phase::Execute));
    }

    #[test]
    fn test_entry_limit_is_shared_between_parsers() {
        let sink = SyscallSink::default();
        let mut install = StraceParser::new(sink.clone(), 2);
        let mut import = StraceParser::new(sink.clone(), 2);
        install.ingest("1 1.0 getpid() = 1", Phase::Install);
        import.ingest("2 2.0 getpid() = 2", Phase::Import);
        import.ingest("2 2.1 getpid() = 2", Phase::Import);
        assert_eq!(sink.syscalls.len(), 2);
        assert_eq!(sink.stats().dropped, 1);
    }

    /// Sandbox whose per-phase trace logs are plain files read with `cat`
    #[cfg(unix)]
    struct LogDirSandbox {
        dir: tempfile::TempDir,
    }

    #[cfg(unix)]
    #[async_trait::async_trait]
    impl Sandbox for LogDirSandbox {
        fn id(&self) -> &str {
            "log-dir"
        }

        async fn run(
            &self,
            _phase: Phase,
            _argv: &[String],
            _timeout: Duration,
            _cancel: &CancellationToken,
        ) -> Result<crate::sandbox::CommandOutput, crate::error::SandboxError> {
            Ok(Default::default())
        }

        fn observe(&self, argv: &[String]) -> Command {
            let mut cmd = Command::new("cat");
            cmd.arg(argv.last().map(String::as_str).unwrap_or("/dev/null"));
            cmd
        }

        fn capture_command(&self) -> Option<Command> {
            None
        }

        fn trace_log(&self, phase: Phase) -> Option<String> {
            Some(self.dir.path().join(format!("trace.{}", phase)).display().to_string())
        }

        async fn destroy(&self) -> Result<(), crate::error::SandboxError> {
            Ok(())
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_follow_phases_tags_by_log() {
        let sandbox = LogDirSandbox { dir: tempfile::tempdir().unwrap() };
        for (phase, ts) in [(Phase::Install, 1), (Phase::Import, 2)] {
            let path = hex(&format!("/tmp/{}-marker", phase));
            let line = format!("10 {}.0 openat(AT_FDCWD, {}, O_WRONLY|O_CREAT, 0644) = 3\n", ts, path);
            std::fs::write(sandbox.trace_log(phase).unwrap(), line).unwrap();
        }
        let sandbox: Arc<dyn Sandbox> = Arc::new(sandbox);

        // The tag already moved past install before the tracer woke up
        let (tx, rx) = watch::channel(Phase::Import);
        let sink = SyscallSink::default();
        let stop = CancellationToken::new();
        let tracer = tokio::spawn(follow_phases(Arc::clone(&sandbox), rx, sink.clone(), stop.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
        tracer.await.unwrap().unwrap();
        drop(tx);

        let mut writes = sink.file_writes.snapshot();
        writes.sort_by_key(|w| w.phase);
        assert_eq!(writes.len(), 2);
        for write in &writes {
            assert_eq!(write.path, format!("/tmp/{}-marker", write.phase));
        }
        assert_eq!(writes[0].phase, Phase::Install);
        assert_eq!(writes[1].phase, Phase::Import);
    }
}

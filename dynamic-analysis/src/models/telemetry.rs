use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use super::phase::Phase;

/// One traced system call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyscallEntry {
    pub phase: Phase,
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub args: String,
    pub result: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileWriteKind {
    Create,
    Truncate,
    Write,
    Delete,
    Rename,
}

/// A filesystem mutation attributed to a phase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileWrite {
    pub phase: Phase,
    pub pid: u32,
    pub path: String,
    pub kind: FileWriteKind,
    /// Destination for renames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub bytes_written: u64,
    /// SHA-256 of the captured write buffer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A process image executed inside the sandbox
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandExec {
    pub phase: Phase,
    pub pid: u32,
    pub argv: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Icmp,
    Other,
}

/// Aggregated traffic between two endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flow {
    pub protocol: TransportProtocol,
    pub src: IpAddr,
    pub src_port: Option<u16>,
    pub dst: IpAddr,
    pub dst_port: Option<u16>,
    pub packets: u64,
    pub bytes: u64,
    /// Seconds since capture start
    pub first_seen: f64,
    pub last_seen: f64,
}

/// Summary of the packet capture for the sandbox lifetime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NetworkSummary {
    pub packet_count: u64,
    pub total_bytes: u64,
    /// Seconds between first and last packet
    pub duration: f64,
    pub flows: Vec<Flow>,
    /// Frames that could not be decoded
    pub undecoded: u64,
}

/// A DNS query observed in the capture, paired with its response when seen
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DnsRecord {
    /// Seconds since capture start
    pub offset: f64,
    pub transaction_id: u16,
    pub query_name: String,
    pub record_type: String,
    pub addresses: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u8>,
    pub answered: bool,
}

/// A collector problem that degraded the result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelemetryWarning {
    pub collector: String,
    pub message: String,
}

impl TelemetryWarning {
    pub fn new(collector: &str, message: impl Into<String>) -> Self {
        Self {
            collector: collector.to_string(),
            message: message.into(),
        }
    }
}

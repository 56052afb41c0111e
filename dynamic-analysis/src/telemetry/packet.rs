/// Packet capture for the sandbox lifetime
///
/// The capture command writes classic pcap to stdout. The bytes are buffered
/// as they arrive and decoded once the capture stops.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::TelemetryBuffer;
use crate::models::{Flow, NetworkSummary, TransportProtocol};

pub const COLLECTOR: &str = "packet";

const PCAP_MAGIC_MICROS: u32 = 0xa1b2_c3d4;
const PCAP_MAGIC_NANOS: u32 = 0xa1b2_3c4d;
const GLOBAL_HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 16;

const LINKTYPE_ETHERNET: u32 = 1;
const LINKTYPE_RAW: u32 = 101;
const LINKTYPE_RAW_ALT: u32 = 12;
const LINKTYPE_LINUX_SLL: u32 = 113;
const LINKTYPE_IPV4: u32 = 228;
const LINKTYPE_IPV6: u32 = 229;
const LINKTYPE_LINUX_SLL2: u32 = 276;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;

/// How long to keep reading once the capture was asked to stop
const DRAIN_IDLE: Duration = Duration::from_millis(250);

/// Capture bytes kept per sandbox
pub const MAX_CAPTURE_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("capture is shorter than a pcap header")]
    TooShort,

    #[error("unknown pcap magic {0:#010x}")]
    BadMagic(u32),
}

/// One decoded IP packet
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    /// Seconds since the first captured frame
    pub offset: f64,
    /// Original length on the wire
    pub length: u32,
    pub protocol: TransportProtocol,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    /// UDP payload; empty for other protocols
    pub payload: Vec<u8>,
}

/// A parsed capture file
#[derive(Debug, Clone, Default)]
pub struct Capture {
    pub link_type: u32,
    pub frames: u64,
    pub total_bytes: u64,
    pub duration: f64,
    pub packets: Vec<DecodedPacket>,
    pub undecoded: u64,
    /// The data ended inside a record
    pub truncated: bool,
}

/// Run the capture command, appending its stdout to `data` until `stop` fires.
/// At most `limit` bytes are kept; reaching it ends the capture with an error
/// while the kept prefix stays in `data`.
pub async fn capture(
    mut command: Command,
    data: TelemetryBuffer<u8>,
    limit: usize,
    stop: CancellationToken,
) -> Result<(), String> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| format!("failed to start packet capture: {}", e))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| "packet capture has no stdout".to_string())?;

    let mut chunk = vec![0u8; 64 * 1024];
    let mut exited_early = false;

    loop {
        tokio::select! {
            read = stdout.read(&mut chunk) => match read {
                Ok(0) => {
                    exited_early = !stop.is_cancelled();
                    break;
                }
                Ok(n) => {
                    if !keep_bounded(&data, &chunk[..n], limit) {
                        let _ = child.kill().await;
                        return Err(format!("packet capture stopped after reaching {} bytes", limit));
                    }
                }
                Err(e) => {
                    let _ = child.kill().await;
                    return Err(format!("failed to read packet capture: {}", e));
                }
            },
            _ = stop.cancelled() => break,
        }
    }

    if stop.is_cancelled() && !exited_early {
        while let Ok(Ok(n)) = tokio::time::timeout(DRAIN_IDLE, stdout.read(&mut chunk)).await {
            if n == 0 {
                break;
            }
            if !keep_bounded(&data, &chunk[..n], limit) {
                let _ = child.kill().await;
                return Err(format!("packet capture stopped after reaching {} bytes", limit));
            }
        }
    }

    let _ = child.kill().await;
    debug!(bytes = data.len(), "Packet capture stopped");

    if exited_early && data.is_empty() {
        return Err("packet capture exited before producing data".to_string());
    }
    Ok(())
}

/// Append as much of `bytes` as fits under `limit`; false once the limit is hit
fn keep_bounded(data: &TelemetryBuffer<u8>, bytes: &[u8], limit: usize) -> bool {
    let room = limit.saturating_sub(data.len());
    data.extend_from_slice(&bytes[..bytes.len().min(room)]);
    bytes.len() <= room
}

struct Reader {
    big_endian: bool,
}

impl Reader {
    fn u32(&self, bytes: &[u8]) -> u32 {
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if self.big_endian {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        }
    }
}

/// Parse a classic pcap stream
pub fn parse_pcap(data: &[u8]) -> Result<Capture, PacketError> {
    if data.len() < GLOBAL_HEADER_LEN {
        return Err(PacketError::TooShort);
    }

    let le_magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let be_magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let (reader, nanos) = match (le_magic, be_magic) {
        (PCAP_MAGIC_MICROS, _) => (Reader { big_endian: false }, false),
        (PCAP_MAGIC_NANOS, _) => (Reader { big_endian: false }, true),
        (_, PCAP_MAGIC_MICROS) => (Reader { big_endian: true }, false),
        (_, PCAP_MAGIC_NANOS) => (Reader { big_endian: true }, true),
        _ => return Err(PacketError::BadMagic(le_magic)),
    };

    let mut capture = Capture {
        link_type: reader.u32(&data[20..24]),
        ..Default::default()
    };

    let mut first: Option<f64> = None;
    let mut last = 0.0;
    let mut pos = GLOBAL_HEADER_LEN;

    while pos < data.len() {
        if pos + RECORD_HEADER_LEN > data.len() {
            capture.truncated = true;
            break;
        }
        let header = &data[pos..pos + RECORD_HEADER_LEN];
        let secs = reader.u32(&header[0..4]) as f64;
        let frac = reader.u32(&header[4..8]) as f64;
        let incl_len = reader.u32(&header[8..12]) as usize;
        let orig_len = reader.u32(&header[12..16]);
        pos += RECORD_HEADER_LEN;

        if pos + incl_len > data.len() {
            capture.truncated = true;
            break;
        }
        let frame = &data[pos..pos + incl_len];
        pos += incl_len;

        let ts = secs + if nanos { frac / 1e9 } else { frac / 1e6 };
        let start = *first.get_or_insert(ts);
        last = ts;

        capture.frames += 1;
        capture.total_bytes += u64::from(orig_len);

        match decode_frame(capture.link_type, frame) {
            Some(mut packet) => {
                packet.offset = ts - start;
                packet.length = orig_len;
                capture.packets.push(packet);
            }
            None => capture.undecoded += 1,
        }
    }

    capture.duration = first.map(|start| last - start).unwrap_or(0.0);
    Ok(capture)
}

fn be16(bytes: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*bytes.get(at)?, *bytes.get(at + 1)?]))
}

fn decode_frame(link_type: u32, frame: &[u8]) -> Option<DecodedPacket> {
    match link_type {
        LINKTYPE_ETHERNET => {
            let mut ethertype = be16(frame, 12)?;
            let mut offset = 14;
            while ethertype == ETHERTYPE_VLAN {
                ethertype = be16(frame, offset + 2)?;
                offset += 4;
            }
            decode_network(ethertype, frame.get(offset..)?)
        }
        LINKTYPE_LINUX_SLL => decode_network(be16(frame, 14)?, frame.get(16..)?),
        LINKTYPE_LINUX_SLL2 => decode_network(be16(frame, 0)?, frame.get(20..)?),
        LINKTYPE_RAW | LINKTYPE_RAW_ALT => match frame.first()? >> 4 {
            4 => decode_ipv4(frame),
            6 => decode_ipv6(frame),
            _ => None,
        },
        LINKTYPE_IPV4 => decode_ipv4(frame),
        LINKTYPE_IPV6 => decode_ipv6(frame),
        _ => None,
    }
}

fn decode_network(ethertype: u16, payload: &[u8]) -> Option<DecodedPacket> {
    match ethertype {
        ETHERTYPE_IPV4 => decode_ipv4(payload),
        ETHERTYPE_IPV6 => decode_ipv6(payload),
        _ => None,
    }
}

fn decode_ipv4(packet: &[u8]) -> Option<DecodedPacket> {
    let first = *packet.first()?;
    let header_len = usize::from(first & 0x0f) * 4;
    if first >> 4 != 4 || header_len < 20 || packet.len() < header_len {
        return None;
    }
    let total_len = usize::from(be16(packet, 2)?).clamp(header_len, packet.len());
    let src = IpAddr::V4(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]));
    let dst = IpAddr::V4(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]));
    Some(decode_transport(packet[9], src, dst, &packet[header_len..total_len]))
}

fn decode_ipv6(packet: &[u8]) -> Option<DecodedPacket> {
    if packet.first()? >> 4 != 6 || packet.len() < 40 {
        return None;
    }
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&packet[8..24]);
    dst.copy_from_slice(&packet[24..40]);
    let payload_len = usize::from(be16(packet, 4)?);
    let body = &packet[40..(40 + payload_len).min(packet.len())];
    Some(decode_transport(
        packet[6],
        IpAddr::V6(Ipv6Addr::from(src)),
        IpAddr::V6(Ipv6Addr::from(dst)),
        body,
    ))
}

fn decode_transport(next: u8, src: IpAddr, dst: IpAddr, body: &[u8]) -> DecodedPacket {
    let mut packet = DecodedPacket {
        offset: 0.0,
        length: 0,
        protocol: TransportProtocol::Other,
        src,
        dst,
        src_port: None,
        dst_port: None,
        payload: Vec::new(),
    };

    match next {
        6 => {
            packet.protocol = TransportProtocol::Tcp;
            packet.src_port = be16(body, 0);
            packet.dst_port = be16(body, 2);
        }
        17 => {
            packet.protocol = TransportProtocol::Udp;
            packet.src_port = be16(body, 0);
            packet.dst_port = be16(body, 2);
            if let Some(payload) = body.get(8..) {
                packet.payload = payload.to_vec();
            }
        }
        1 | 58 => packet.protocol = TransportProtocol::Icmp,
        _ => {}
    }

    packet
}

type FlowKey = (TransportProtocol, IpAddr, Option<u16>, IpAddr, Option<u16>);

/// Aggregate decoded packets into directional flows
pub fn summarize(capture: &Capture) -> NetworkSummary {
    let mut flows: BTreeMap<FlowKey, Flow> = BTreeMap::new();

    for packet in &capture.packets {
        let key = (packet.protocol, packet.src, packet.src_port, packet.dst, packet.dst_port);
        let flow = flows.entry(key).or_insert_with(|| Flow {
            protocol: packet.protocol,
            src: packet.src,
            src_port: packet.src_port,
            dst: packet.dst,
            dst_port: packet.dst_port,
            packets: 0,
            bytes: 0,
            first_seen: packet.offset,
            last_seen: packet.offset,
        });
        flow.packets += 1;
        flow.bytes += u64::from(packet.length);
        flow.first_seen = flow.first_seen.min(packet.offset);
        flow.last_seen = flow.last_seen.max(packet.offset);
    }

    let mut flows: Vec<Flow> = flows.into_values().collect();
    flows.sort_by(|a, b| a.first_seen.total_cmp(&b.first_seen));

    NetworkSummary {
        packet_count: capture.frames,
        total_bytes: capture.total_bytes,
        duration: capture.duration,
        flows,
        undecoded: capture.undecoded,
    }
}

//! DNS activity derived from a packet capture

use std::net::IpAddr;
use trust_dns_proto::op::{Message, MessageType};
use trust_dns_proto::rr::RData;

use super::packet::Capture;
use crate::models::{DnsRecord, TransportProtocol};

const DNS_PORT: u16 = 53;

/// Pair DNS queries with their responses, in capture order
pub fn extract(capture: &Capture) -> Vec<DnsRecord> {
    let mut records: Vec<DnsRecord> = Vec::new();

    for packet in &capture.packets {
        if packet.protocol != TransportProtocol::Udp
            || (packet.src_port != Some(DNS_PORT) && packet.dst_port != Some(DNS_PORT))
        {
            continue;
        }
        let Ok(message) = Message::from_vec(&packet.payload) else {
            continue;
        };
        let Some(query) = message.queries().first() else {
            continue;
        };

        let name = query.name().to_utf8().trim_end_matches('.').to_string();
        let record_type = query.query_type().to_string();

        if message.message_type() == MessageType::Query {
            records.push(DnsRecord {
                offset: packet.offset,
                transaction_id: message.id(),
                query_name: name,
                record_type,
                addresses: Vec::new(),
                response_code: None,
                answered: false,
            });
            continue;
        }

        let addresses = answer_addresses(&message);
        let response_code = message.response_code().low();

        let pending = records.iter_mut().find(|record| {
            !record.answered
                && record.transaction_id == message.id()
                && record.query_name.eq_ignore_ascii_case(&name)
        });

        match pending {
            Some(record) => {
                record.addresses = addresses;
                record.response_code = Some(response_code);
                record.answered = true;
            }
            None => records.push(DnsRecord {
                // Query was not captured
                offset: packet.offset,
                transaction_id: message.id(),
                query_name: name,
                record_type,
                addresses,
                response_code: Some(response_code),
                answered: true,
            }),
        }
    }

    records
}

fn answer_addresses(message: &Message) -> Vec<IpAddr> {
    message
        .answers()
        .iter()
        .filter_map(|answer| match answer.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

//! DNS message helpers: synthesized replies, answer extraction and UDP sizing.

use std::net::IpAddr;

use hickory_proto::op::{Header, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::RData;

use crate::error::{Error, Result};
use crate::transport::MAX_DNS_PACKET_SIZE;

/// Size of the fixed DNS header.
pub const HEADER_LEN: usize = 12;

/// UDP payload limit for clients that do not advertise EDNS.
pub const MAX_UDP_PAYLOAD_NO_EDNS: usize = 512;

/// Build an empty reply to `request` carrying `code`.
///
/// The question section is echoed back; answers are left empty.
pub fn reply(request: &Message, code: ResponseCode) -> Message {
    let mut header = Header::response_from_request(request.header());
    header.set_response_code(code);
    header.set_recursion_available(true);
    header.set_authoritative(false);

    let mut response = Message::new();
    response.set_header(header);
    response.add_queries(request.queries().iter().cloned());
    response
}

/// FORMERR for a request that could not be parsed.
///
/// Only the id is taken from the raw header; anything shorter than a header
/// gets no reply at all.
pub fn format_error(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.len() < HEADER_LEN {
        return None;
    }

    let mut header = Header::new();
    header
        .set_id(u16::from_be_bytes([raw[0], raw[1]]))
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_response_code(ResponseCode::FormErr)
        .set_recursion_available(true);

    let mut response = Message::new();
    response.set_header(header);
    response.to_vec().ok()
}

/// The queried name of the first question in wire (ASCII) form.
///
/// Punycode labels stay encoded and the case is kept as sent.
pub fn question_name(request: &Message) -> Option<String> {
    request.queries().first().map(|q| q.name().to_ascii())
}

/// Every A and AAAA address in the answer section.
pub fn answer_ips(response: &Message) -> Vec<IpAddr> {
    response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

/// Largest UDP response the client accepts.
pub fn udp_payload_limit(request: &Message) -> usize {
    request
        .extensions()
        .as_ref()
        .map(|edns| usize::from(edns.max_payload()))
        .unwrap_or(MAX_UDP_PAYLOAD_NO_EDNS)
        .clamp(MAX_UDP_PAYLOAD_NO_EDNS, MAX_DNS_PACKET_SIZE)
}

/// Encode `response`, falling back to a TC reply when it exceeds `limit`.
///
/// The truncated form keeps only the header and question so the client
/// retries over TCP.
pub fn encode_with_limit(response: &Message, limit: usize) -> Result<Vec<u8>> {
    let wire = response.to_vec().map_err(Error::Serialize)?;
    if wire.len() <= limit {
        return Ok(wire);
    }

    let mut header = *response.header();
    header.set_truncated(true);
    let mut truncated = Message::new();
    truncated.set_header(header);
    truncated.add_queries(response.queries().iter().cloned());
    truncated.to_vec().map_err(Error::Serialize)
}

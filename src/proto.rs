//! Minimal DNS wire helpers
//!
//! The engine does not parse DNS beyond what routing and validation
//! require: the 12-byte header plus the first question (qname, qtype,
//! qclass). Everything else is relayed as opaque bytes. This module holds
//! the header accessors, the 2-byte big-endian frame length helpers, the
//! NOTIMP in-place synthesis, and the question parser built on
//! hickory-proto's name decoding.

use hickory_proto::rr::Name;
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder};

use crate::error::{GateError, GateResult};

/// Size of the fixed DNS header
pub const DNS_HEADER_SIZE: usize = 12;

/// Maximum DNS message size over TCP (RFC 1035)
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// AXFR query type (RFC 5936)
pub const QTYPE_AXFR: u16 = 252;

/// IXFR query type (RFC 1995)
pub const QTYPE_IXFR: u16 = 251;

/// NOTIMP response code
pub const RCODE_NOTIMP: u8 = 4;

/// The first question of a DNS message
#[derive(Debug, Clone)]
pub struct Question {
    /// Query name
    pub name: Name,
    /// Query type, raw
    pub qtype: u16,
    /// Query class, raw
    pub qclass: u16,
    /// Length of the qname on the wire
    pub qname_wire_len: usize,
}

impl Question {
    /// Whether this question starts a zone transfer (AXFR/IXFR)
    #[must_use]
    pub fn is_xfr(&self) -> bool {
        self.qtype == QTYPE_AXFR || self.qtype == QTYPE_IXFR
    }
}

/// Encode a frame length as the 2-byte big-endian TCP prefix
#[must_use]
pub fn encode_frame_length(len: usize) -> [u8; 2] {
    [(len / 256) as u8, (len % 256) as u8]
}

/// Decode a 2-byte big-endian TCP frame length prefix
#[must_use]
pub fn decode_frame_length(prefix: [u8; 2]) -> usize {
    usize::from(prefix[0]) * 256 + usize::from(prefix[1])
}

/// Prepend the 2-byte length prefix to a message buffer in place
///
/// The length written is the buffer length before insertion; the result is
/// exactly `[len_hi, len_lo, message...]`.
///
/// # Errors
///
/// Returns `GateError::Framing` if the message exceeds the TCP limit.
pub fn prepend_frame_length(buffer: &mut Vec<u8>) -> GateResult<()> {
    if buffer.len() > MAX_MESSAGE_SIZE {
        return Err(GateError::framing(format!(
            "message too large to frame: {} bytes",
            buffer.len()
        )));
    }
    let prefix = encode_frame_length(buffer.len());
    buffer.splice(0..0, prefix);
    Ok(())
}

/// Read the message id from a raw DNS header
#[must_use]
pub fn message_id(message: &[u8]) -> u16 {
    u16::from_be_bytes([message[0], message[1]])
}

/// Whether the QR bit is set (the message is a response)
#[must_use]
pub fn is_response(message: &[u8]) -> bool {
    message[2] & 0x80 != 0
}

/// Read the opcode from a raw DNS header
#[must_use]
pub fn opcode(message: &[u8]) -> u8 {
    (message[2] >> 3) & 0x0f
}

/// Read the response code from a raw DNS header
#[must_use]
pub fn rcode(message: &[u8]) -> u8 {
    message[3] & 0x0f
}

/// Read the question count from a raw DNS header
#[must_use]
pub fn qdcount(message: &[u8]) -> u16 {
    u16::from_be_bytes([message[4], message[5]])
}

/// Validate a query header before any further processing
///
/// Messages with the QR bit set are responses masquerading as queries and
/// are never answered.
#[must_use]
pub fn check_query_headers(message: &[u8]) -> bool {
    message.len() >= DNS_HEADER_SIZE && !is_response(message)
}

/// Rewrite a query in place into a NOTIMP response
///
/// Sets `qr = 1` and `rcode = NOTIMP`, leaving everything else untouched so
/// the client sees its own id and flags reflected back.
pub fn set_notimp(message: &mut [u8]) {
    message[2] |= 0x80;
    message[3] = (message[3] & 0xf0) | RCODE_NOTIMP;
}

/// Parse the first question of a message
///
/// # Errors
///
/// Returns `GateError::Framing` when the message is truncated or the qname
/// cannot be decoded.
pub fn parse_question(message: &[u8]) -> GateResult<Question> {
    if message.len() < DNS_HEADER_SIZE {
        return Err(GateError::framing("message shorter than the DNS header"));
    }
    if qdcount(message) == 0 {
        return Err(GateError::framing("message carries no question"));
    }

    let question_section = &message[DNS_HEADER_SIZE..];
    let mut decoder = BinDecoder::new(question_section);
    let name = Name::read(&mut decoder)
        .map_err(|e| GateError::framing(format!("unreadable qname: {e}")))?;
    let qname_wire_len = decoder.index();
    let qtype = decoder
        .read_u16()
        .map_err(|_| GateError::framing("truncated qtype"))?
        .unverified();
    let qclass = decoder
        .read_u16()
        .map_err(|_| GateError::framing("truncated qclass"))?
        .unverified();

    Ok(Question {
        name,
        qtype,
        qclass,
        qname_wire_len,
    })
}

/// Check that a backend response answers the question we forwarded
///
/// Responses without a question section (some NOTIMP/FORMERR answers) are
/// accepted; otherwise qname, qtype, and qclass must all match. Mismatches
/// are dropped silently by the caller.
#[must_use]
pub fn response_content_matches(
    response: &[u8],
    qname: &Name,
    qtype: u16,
    qclass: u16,
) -> bool {
    if response.len() < DNS_HEADER_SIZE {
        return false;
    }
    if qdcount(response) == 0 {
        return true;
    }
    match parse_question(response) {
        Ok(question) => {
            question.qtype == qtype && question.qclass == qclass && question.name == *qname
        }
        Err(_) => false,
    }
}

//! PROXY protocol v1/v2 codec
//!
//! Connections from peers on a listener's `proxy_protocol_from` list must
//! start with a PROXY preamble (HAProxy's out-of-band header carrying the
//! original client address through an L4 proxy). The decoder is
//! incremental: it inspects whatever prefix of the stream has been read so
//! far and reports either that the preamble is invalid, that a known number
//! of additional bytes is required, or the decoded header and how many
//! bytes it consumed.
//!
//! The encoder produces v2 binary payloads for backend-bound connections,
//! including TLV extensions.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// v2 binary signature
const V2_SIGNATURE: [u8; 12] = [
    0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
];

/// v1 text signature
const V1_SIGNATURE: &[u8; 6] = b"PROXY ";

/// Longest possible v1 line including CRLF
const V1_MAX_LINE: usize = 107;

/// Minimum bytes needed before the preamble variant can be decided
pub const PROXY_HEADER_MIN_SIZE: usize = 16;

/// One type-length-value extension from a v2 header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTlv {
    /// TLV type byte
    pub kind: u8,
    /// Raw TLV value
    pub value: Vec<u8>,
}

/// A fully decoded PROXY preamble
#[derive(Debug, Clone)]
pub struct ProxyHeader {
    /// Bytes of the stream consumed by the preamble
    pub consumed: usize,
    /// Proxied (source, destination) addresses; `None` for LOCAL commands
    /// and v1 `UNKNOWN` lines
    pub addresses: Option<(SocketAddr, SocketAddr)>,
    /// v2 TLV extensions, in wire order
    pub tlvs: Vec<ProxyTlv>,
}

/// Outcome of inspecting a stream prefix for a PROXY preamble
#[derive(Debug)]
pub enum ProxyDecode {
    /// The prefix can never become a valid preamble; drop the connection
    Invalid,
    /// The preamble is incomplete; read at least this many more bytes
    Incomplete {
        /// Additional bytes required before the next decode attempt
        needed: usize,
    },
    /// The preamble decoded successfully
    Complete(ProxyHeader),
}

/// Inspect a stream prefix for a PROXY v1 or v2 preamble
#[must_use]
pub fn decode_header(buf: &[u8]) -> ProxyDecode {
    if buf.len() < PROXY_HEADER_MIN_SIZE {
        // not enough to even identify v2; check what we can
        if !could_be_v2(buf) && !could_be_v1(buf) {
            return ProxyDecode::Invalid;
        }
        return ProxyDecode::Incomplete {
            needed: PROXY_HEADER_MIN_SIZE - buf.len(),
        };
    }

    if buf[..12] == V2_SIGNATURE {
        return decode_v2(buf);
    }
    if buf[..V1_SIGNATURE.len()] == V1_SIGNATURE[..] {
        return decode_v1(buf);
    }
    ProxyDecode::Invalid
}

fn could_be_v2(buf: &[u8]) -> bool {
    let n = buf.len().min(V2_SIGNATURE.len());
    buf[..n] == V2_SIGNATURE[..n]
}

fn could_be_v1(buf: &[u8]) -> bool {
    let n = buf.len().min(V1_SIGNATURE.len());
    buf[..n] == V1_SIGNATURE[..n]
}

fn decode_v2(buf: &[u8]) -> ProxyDecode {
    let version_command = buf[12];
    if version_command >> 4 != 0x2 {
        return ProxyDecode::Invalid;
    }
    let command = version_command & 0x0f;
    if command > 1 {
        return ProxyDecode::Invalid;
    }

    let family_protocol = buf[13];
    let payload_len = usize::from(u16::from_be_bytes([buf[14], buf[15]]));
    let total = PROXY_HEADER_MIN_SIZE + payload_len;
    if buf.len() < total {
        return ProxyDecode::Incomplete {
            needed: total - buf.len(),
        };
    }

    let payload = &buf[PROXY_HEADER_MIN_SIZE..total];

    // LOCAL: addresses are unspecified, any payload is TLVs
    if command == 0 {
        return match decode_tlvs(payload) {
            Some(tlvs) => ProxyDecode::Complete(ProxyHeader {
                consumed: total,
                addresses: None,
                tlvs,
            }),
            None => ProxyDecode::Invalid,
        };
    }

    let (addresses, address_len) = match family_protocol {
        // TCP or UDP over IPv4
        0x11 | 0x12 => {
            if payload.len() < 12 {
                return ProxyDecode::Invalid;
            }
            let src = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
            let dst = Ipv4Addr::new(payload[4], payload[5], payload[6], payload[7]);
            let src_port = u16::from_be_bytes([payload[8], payload[9]]);
            let dst_port = u16::from_be_bytes([payload[10], payload[11]]);
            (
                Some((
                    SocketAddr::new(IpAddr::V4(src), src_port),
                    SocketAddr::new(IpAddr::V4(dst), dst_port),
                )),
                12,
            )
        }
        // TCP or UDP over IPv6
        0x21 | 0x22 => {
            if payload.len() < 36 {
                return ProxyDecode::Invalid;
            }
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&payload[0..16]);
            dst.copy_from_slice(&payload[16..32]);
            let src_port = u16::from_be_bytes([payload[32], payload[33]]);
            let dst_port = u16::from_be_bytes([payload[34], payload[35]]);
            (
                Some((
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), src_port),
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dst_port),
                )),
                36,
            )
        }
        // UNSPEC: sender knows no addresses
        0x00 => (None, 0),
        _ => return ProxyDecode::Invalid,
    };

    match decode_tlvs(&payload[address_len..]) {
        Some(tlvs) => ProxyDecode::Complete(ProxyHeader {
            consumed: total,
            addresses,
            tlvs,
        }),
        None => ProxyDecode::Invalid,
    }
}

fn decode_tlvs(mut data: &[u8]) -> Option<Vec<ProxyTlv>> {
    let mut tlvs = Vec::new();
    while !data.is_empty() {
        if data.len() < 3 {
            return None;
        }
        let kind = data[0];
        let len = usize::from(u16::from_be_bytes([data[1], data[2]]));
        if data.len() < 3 + len {
            return None;
        }
        tlvs.push(ProxyTlv {
            kind,
            value: data[3..3 + len].to_vec(),
        });
        data = &data[3 + len..];
    }
    Some(tlvs)
}

fn decode_v1(buf: &[u8]) -> ProxyDecode {
    let search = &buf[..buf.len().min(V1_MAX_LINE)];
    let Some(end) = search.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() >= V1_MAX_LINE {
            return ProxyDecode::Invalid;
        }
        return ProxyDecode::Incomplete { needed: 2 };
    };

    let Ok(line) = std::str::from_utf8(&buf[..end]) else {
        return ProxyDecode::Invalid;
    };
    let consumed = end + 2;
    let fields: Vec<&str> = line.split(' ').collect();

    // "PROXY UNKNOWN" may omit the address fields entirely
    if fields.len() >= 2 && fields[1] == "UNKNOWN" {
        return ProxyDecode::Complete(ProxyHeader {
            consumed,
            addresses: None,
            tlvs: Vec::new(),
        });
    }

    if fields.len() != 6 || fields[0] != "PROXY" {
        return ProxyDecode::Invalid;
    }
    let v4 = match fields[1] {
        "TCP4" => true,
        "TCP6" => false,
        _ => return ProxyDecode::Invalid,
    };

    let (Ok(src_ip), Ok(dst_ip)) = (fields[2].parse::<IpAddr>(), fields[3].parse::<IpAddr>())
    else {
        return ProxyDecode::Invalid;
    };
    if v4 != src_ip.is_ipv4() || v4 != dst_ip.is_ipv4() {
        return ProxyDecode::Invalid;
    }
    let (Ok(src_port), Ok(dst_port)) = (fields[4].parse::<u16>(), fields[5].parse::<u16>())
    else {
        return ProxyDecode::Invalid;
    };

    ProxyDecode::Complete(ProxyHeader {
        consumed,
        addresses: Some((
            SocketAddr::new(src_ip, src_port),
            SocketAddr::new(dst_ip, dst_port),
        )),
        tlvs: Vec::new(),
    })
}

/// Encode a PROXY v2 payload for a backend-bound connection
///
/// `addresses` of `None` produces a LOCAL command (health checks,
/// self-generated traffic). TLVs are appended in order.
#[must_use]
pub fn encode_v2(
    addresses: Option<(SocketAddr, SocketAddr)>,
    tlvs: &[ProxyTlv],
) -> Vec<u8> {
    let mut tlv_bytes = Vec::new();
    for tlv in tlvs {
        tlv_bytes.push(tlv.kind);
        tlv_bytes.extend_from_slice(&(tlv.value.len() as u16).to_be_bytes());
        tlv_bytes.extend_from_slice(&tlv.value);
    }

    let mut out = Vec::with_capacity(PROXY_HEADER_MIN_SIZE + 36 + tlv_bytes.len());
    out.extend_from_slice(&V2_SIGNATURE);

    match addresses {
        Some((source, destination)) => {
            out.push(0x21); // version 2, PROXY
            match (source, destination) {
                (SocketAddr::V4(src), SocketAddr::V4(dst)) => {
                    out.push(0x11); // TCP over IPv4
                    let len = 12 + tlv_bytes.len();
                    out.extend_from_slice(&(len as u16).to_be_bytes());
                    out.extend_from_slice(&src.ip().octets());
                    out.extend_from_slice(&dst.ip().octets());
                    out.extend_from_slice(&src.port().to_be_bytes());
                    out.extend_from_slice(&dst.port().to_be_bytes());
                }
                _ => {
                    out.push(0x21); // TCP over IPv6
                    let len = 36 + tlv_bytes.len();
                    out.extend_from_slice(&(len as u16).to_be_bytes());
                    out.extend_from_slice(&to_v6(source.ip()).octets());
                    out.extend_from_slice(&to_v6(destination.ip()).octets());
                    out.extend_from_slice(&source.port().to_be_bytes());
                    out.extend_from_slice(&destination.port().to_be_bytes());
                }
            }
        }
        None => {
            out.push(0x20); // version 2, LOCAL
            out.push(0x00); // UNSPEC
            out.extend_from_slice(&(tlv_bytes.len() as u16).to_be_bytes());
        }
    }

    out.extend_from_slice(&tlv_bytes);
    out
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    // ========================================================================
    // v2 Decode Tests
    // ========================================================================

    #[test]
    fn test_v2_roundtrip_ipv4() {
        let encoded = encode_v2(Some((sa("10.0.0.7:5353"), sa("192.0.2.1:53"))), &[]);
        match decode_header(&encoded) {
            ProxyDecode::Complete(header) => {
                assert_eq!(header.consumed, encoded.len());
                let (src, dst) = header.addresses.unwrap();
                assert_eq!(src, sa("10.0.0.7:5353"));
                assert_eq!(dst, sa("192.0.2.1:53"));
                assert!(header.tlvs.is_empty());
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn test_v2_roundtrip_ipv6() {
        let encoded = encode_v2(Some((sa("[2001:db8::1]:5353"), sa("[2001:db8::2]:853"))), &[]);
        match decode_header(&encoded) {
            ProxyDecode::Complete(header) => {
                let (src, dst) = header.addresses.unwrap();
                assert_eq!(src, sa("[2001:db8::1]:5353"));
                assert_eq!(dst, sa("[2001:db8::2]:853"));
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn test_v2_roundtrip_tlvs() {
        let tlvs = vec![
            ProxyTlv {
                kind: 0xe0,
                value: b"edge-1".to_vec(),
            },
            ProxyTlv {
                kind: 0x02,
                value: b"dot.example".to_vec(),
            },
        ];
        let encoded = encode_v2(Some((sa("10.0.0.7:5353"), sa("192.0.2.1:53"))), &tlvs);
        match decode_header(&encoded) {
            ProxyDecode::Complete(header) => assert_eq!(header.tlvs, tlvs),
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn test_v2_local_command() {
        let encoded = encode_v2(None, &[]);
        match decode_header(&encoded) {
            ProxyDecode::Complete(header) => {
                assert!(header.addresses.is_none());
                assert_eq!(header.consumed, PROXY_HEADER_MIN_SIZE);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn test_v2_incomplete_reports_needed() {
        let encoded = encode_v2(Some((sa("10.0.0.7:5353"), sa("192.0.2.1:53"))), &[]);
        match decode_header(&encoded[..10]) {
            ProxyDecode::Incomplete { needed } => assert_eq!(needed, 6),
            other => panic!("expected Incomplete, got {other:?}"),
        }
        match decode_header(&encoded[..20]) {
            ProxyDecode::Incomplete { needed } => assert_eq!(needed, encoded.len() - 20),
            other => panic!("expected Incomplete, got {other:?}"),
        }
    }

    #[test]
    fn test_v2_bad_version_invalid() {
        let mut encoded = encode_v2(Some((sa("10.0.0.7:5353"), sa("192.0.2.1:53"))), &[]);
        encoded[12] = 0x31;
        assert!(matches!(decode_header(&encoded), ProxyDecode::Invalid));
    }

    #[test]
    fn test_v2_truncated_tlv_invalid() {
        let mut encoded = encode_v2(
            Some((sa("10.0.0.7:5353"), sa("192.0.2.1:53"))),
            &[ProxyTlv {
                kind: 0xe0,
                value: b"x".to_vec(),
            }],
        );
        // lie about the TLV length
        let last = encoded.len() - 2;
        encoded[last] = 0xff;
        assert!(matches!(decode_header(&encoded), ProxyDecode::Invalid));
    }

    // ========================================================================
    // v1 Decode Tests
    // ========================================================================

    #[test]
    fn test_v1_tcp4() {
        let line = b"PROXY TCP4 10.0.0.7 192.0.2.1 5353 53\r\n";
        match decode_header(line) {
            ProxyDecode::Complete(header) => {
                assert_eq!(header.consumed, line.len());
                let (src, dst) = header.addresses.unwrap();
                assert_eq!(src, sa("10.0.0.7:5353"));
                assert_eq!(dst, sa("192.0.2.1:53"));
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn test_v1_tcp6() {
        let line = b"PROXY TCP6 2001:db8::1 2001:db8::2 5353 853\r\n";
        match decode_header(line) {
            ProxyDecode::Complete(header) => {
                let (src, _) = header.addresses.unwrap();
                assert_eq!(src, sa("[2001:db8::1]:5353"));
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn test_v1_unknown() {
        let line = b"PROXY UNKNOWN\r\n";
        match decode_header(line) {
            ProxyDecode::Complete(header) => assert!(header.addresses.is_none()),
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn test_v1_incomplete_without_crlf() {
        let line = b"PROXY TCP4 10.0.0.7 192.0";
        assert!(matches!(
            decode_header(line),
            ProxyDecode::Incomplete { .. }
        ));
    }

    #[test]
    fn test_v1_family_mismatch_invalid() {
        let line = b"PROXY TCP4 2001:db8::1 192.0.2.1 5353 53\r\n";
        assert!(matches!(decode_header(line), ProxyDecode::Invalid));
    }

    #[test]
    fn test_v1_garbage_ports_invalid() {
        let line = b"PROXY TCP4 10.0.0.7 192.0.2.1 banana 53\r\n";
        assert!(matches!(decode_header(line), ProxyDecode::Invalid));
    }

    // ========================================================================
    // Signature Tests
    // ========================================================================

    #[test]
    fn test_dns_frame_is_invalid_immediately() {
        // a plain DNS query can never be a PROXY preamble
        let frame = [0x00, 0x1d, 0x12, 0x34, 0x01, 0x00, 0x00, 0x01];
        assert!(matches!(decode_header(&frame), ProxyDecode::Invalid));
    }

    #[test]
    fn test_short_matching_prefix_incomplete() {
        assert!(matches!(
            decode_header(&V2_SIGNATURE[..4]),
            ProxyDecode::Incomplete { .. }
        ));
        assert!(matches!(
            decode_header(b"PROX"),
            ProxyDecode::Incomplete { .. }
        ));
    }
}

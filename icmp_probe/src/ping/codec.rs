//! ICMPv4 Echo Request construction and inbound message classification.

use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::{EchoRequestPacket, MutableEchoRequestPacket};
use pnet::packet::icmp::time_exceeded::TimeExceededPacket;
use pnet::packet::icmp::{IcmpCode, IcmpPacket, IcmpTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet;
use thiserror::Error;

use super::ProbeError;

/// Type, code, checksum, identifier and sequence.
pub const ECHO_HEADER_LEN: usize = 8;
const ICMP_HEADER_LEN: usize = 4;
const TIME_EXCEEDED_HEADER_LEN: usize = 8;
const PAYLOAD_MARKER: u8 = b'x';

/// Data carried by every echo request: the sequence as a little-endian
/// `u32` followed by a fixed marker byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationPayload([u8; 5]);

impl CorrelationPayload {
    pub fn new(sequence: u16) -> Self {
        let seq = u32::from(sequence).to_le_bytes();
        Self([seq[0], seq[1], seq[2], seq[3], PAYLOAD_MARKER])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Datagram too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },
}

/// One inbound ICMP message, borrowed from the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedMessage<'a> {
    /// Carries the original datagram quoted by the router.
    TimeExceeded { original: &'a [u8] },
    /// `body` is the echo data following identifier and sequence. Replies are
    /// matched on `body`; identifier and sequence are informational.
    EchoReply {
        identifier: u16,
        sequence: u16,
        body: &'a [u8],
    },
    Other { icmp_type: u8 },
}

/// Echo fields parsed from an echo request or reply.
///
/// Correlation only needs `sequence`; the other fields are kept for callers
/// inspecting quoted requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Echo<'a> {
    pub identifier: u16,
    pub sequence: u16,
    pub data: &'a [u8],
}

/// Builds a complete ICMPv4 Echo Request, checksum included.
pub fn encode_echo_request(identifier: u16, sequence: u16) -> Result<Vec<u8>, ProbeError> {
    let payload = CorrelationPayload::new(sequence);
    let mut buffer = vec![0u8; ECHO_HEADER_LEN + payload.as_bytes().len()];

    let mut echo_packet = MutableEchoRequestPacket::new(&mut buffer)
        .ok_or_else(|| ProbeError::Encode("buffer too small for echo request".to_string()))?;
    echo_packet.set_icmp_type(IcmpTypes::EchoRequest);
    echo_packet.set_icmp_code(IcmpCode::new(0));
    echo_packet.set_identifier(identifier);
    echo_packet.set_sequence_number(sequence);
    echo_packet.set_payload(payload.as_bytes());
    let csum = pnet::packet::util::checksum(echo_packet.packet(), 1);
    echo_packet.set_checksum(csum);

    Ok(buffer)
}

/// Classifies a bare ICMP message (no IP header).
pub fn decode_message(message: &[u8]) -> Result<DecodedMessage<'_>, DecodeError> {
    let packet = IcmpPacket::new(message).ok_or(DecodeError::TooShort {
        expected: ICMP_HEADER_LEN,
        actual: message.len(),
    })?;
    let too_short = DecodeError::TooShort {
        expected: ECHO_HEADER_LEN,
        actual: message.len(),
    };

    match packet.get_icmp_type() {
        IcmpTypes::TimeExceeded => {
            TimeExceededPacket::new(message).ok_or(too_short)?;
            Ok(DecodedMessage::TimeExceeded {
                original: &message[TIME_EXCEEDED_HEADER_LEN..],
            })
        }
        IcmpTypes::EchoReply => {
            let reply = EchoReplyPacket::new(message).ok_or(too_short)?;
            Ok(DecodedMessage::EchoReply {
                identifier: reply.get_identifier(),
                sequence: reply.get_sequence_number(),
                body: &message[ECHO_HEADER_LEN..],
            })
        }
        other => Ok(DecodedMessage::Other {
            icmp_type: other.0,
        }),
    }
}

/// Parses echo fields from the start of `bytes`.
///
/// Routers usually quote only the first eight bytes of the original ICMP
/// message, so `data` may be empty.
pub fn parse_echo(bytes: &[u8]) -> Option<Echo<'_>> {
    let echo = EchoRequestPacket::new(bytes)?;
    match echo.get_icmp_type() {
        IcmpTypes::EchoRequest | IcmpTypes::EchoReply => Some(Echo {
            identifier: echo.get_identifier(),
            sequence: echo.get_sequence_number(),
            data: &bytes[ECHO_HEADER_LEN..],
        }),
        _ => None,
    }
}

/// Returns the ICMP message inside a raw IPv4 datagram.
pub fn strip_ipv4_header(datagram: &[u8]) -> Option<&[u8]> {
    let ip_packet = Ipv4Packet::new(datagram)?;
    if ip_packet.get_version() != 4
        || ip_packet.get_next_level_protocol() != IpNextHeaderProtocols::Icmp
    {
        return None;
    }
    let header_len = usize::from(ip_packet.get_header_length()) * 4;
    if header_len < 20 {
        return None;
    }
    datagram.get(header_len..)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_payload_layout() {
        let payload = CorrelationPayload::new(0x0102);
        assert_eq!(payload.as_bytes(), &[0x02, 0x01, 0x00, 0x00, b'x']);
    }

    #[test]
    fn test_payload_injective() {
        let payloads: HashSet<_> = (0..=u16::MAX).map(CorrelationPayload::new).collect();
        assert_eq!(payloads.len(), usize::from(u16::MAX) + 1);
    }

    #[test]
    fn test_encode_echo_request() {
        let packet = encode_echo_request(0xABCD, 7).unwrap();

        assert_eq!(packet.len(), ECHO_HEADER_LEN + 5);
        // Echo Request, code 0
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 0xABCD);
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 7);
        assert_eq!(&packet[8..], CorrelationPayload::new(7).as_bytes());
    }

    #[test]
    fn test_encode_checksum_verifies() {
        let packet = encode_echo_request(100, 42).unwrap();
        let stored = u16::from_be_bytes([packet[2], packet[3]]);
        assert_ne!(stored, 0);
        assert_eq!(pnet::packet::util::checksum(&packet, 1), stored);
    }

    #[test]
    fn test_parse_encoded_request() {
        let packet = encode_echo_request(100, 7).unwrap();
        let echo = parse_echo(&packet).unwrap();

        assert_eq!(echo.identifier, 100);
        assert_eq!(echo.sequence, 7);
        assert_eq!(echo.data, CorrelationPayload::new(7).as_bytes());
    }

    #[test]
    fn test_parse_truncated_quote() {
        let packet = encode_echo_request(100, 7).unwrap();
        let echo = parse_echo(&packet[..ECHO_HEADER_LEN]).unwrap();
        assert_eq!(echo.sequence, 7);
        assert!(echo.data.is_empty());

        assert!(parse_echo(&packet[..ECHO_HEADER_LEN - 1]).is_none());
    }

    #[test]
    fn test_parse_echo_rejects_other_types() {
        let mut packet = encode_echo_request(100, 7).unwrap();
        packet[0] = 11;
        assert!(parse_echo(&packet).is_none());
    }

    #[test]
    fn test_decode_echo_reply() {
        let mut packet = encode_echo_request(100, 7).unwrap();
        packet[0] = 0;

        match decode_message(&packet).unwrap() {
            DecodedMessage::EchoReply {
                identifier,
                sequence,
                body,
            } => {
                assert_eq!(identifier, 100);
                assert_eq!(sequence, 7);
                assert_eq!(body, CorrelationPayload::new(7).as_bytes());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_decode_time_exceeded() {
        let original = [0x45u8, 0, 0, 28, 1, 2, 3, 4];
        let mut message = vec![11, 0, 0, 0, 0, 0, 0, 0];
        message.extend_from_slice(&original);

        assert_eq!(
            decode_message(&message).unwrap(),
            DecodedMessage::TimeExceeded {
                original: &original
            }
        );
    }

    #[test]
    fn test_decode_other_types() {
        let request = encode_echo_request(1, 1).unwrap();
        assert_eq!(
            decode_message(&request).unwrap(),
            DecodedMessage::Other { icmp_type: 8 }
        );

        // Destination Unreachable
        let unreachable = [3u8, 1, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            decode_message(&unreachable).unwrap(),
            DecodedMessage::Other { icmp_type: 3 }
        );
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(
            decode_message(&[0, 0]),
            Err(DecodeError::TooShort {
                expected: 4,
                actual: 2
            })
        );
        assert_eq!(
            decode_message(&[11, 0, 0, 0, 0]),
            Err(DecodeError::TooShort {
                expected: 8,
                actual: 5
            })
        );
        assert!(decode_message(&[0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_strip_ipv4_header() {
        let icmp = encode_echo_request(1, 2).unwrap();
        let mut datagram = vec![0u8; 20];
        datagram[0] = 0x45;
        datagram[9] = 1;
        datagram.extend_from_slice(&icmp);

        assert_eq!(strip_ipv4_header(&datagram), Some(&icmp[..]));
    }

    #[test]
    fn test_strip_ipv4_header_with_options() {
        let icmp = encode_echo_request(1, 2).unwrap();
        let mut datagram = vec![0u8; 24];
        datagram[0] = 0x46;
        datagram[9] = 1;
        datagram.extend_from_slice(&icmp);

        assert_eq!(strip_ipv4_header(&datagram), Some(&icmp[..]));
    }

    #[test]
    fn test_strip_rejects_non_icmp() {
        let mut datagram = vec![0u8; 28];
        datagram[0] = 0x45;
        // UDP
        datagram[9] = 17;
        assert_eq!(strip_ipv4_header(&datagram), None);

        datagram[0] = 0x65;
        datagram[9] = 1;
        assert_eq!(strip_ipv4_header(&datagram), None);

        assert_eq!(strip_ipv4_header(&[0x45, 0, 0]), None);
    }
}

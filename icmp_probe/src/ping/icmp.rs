use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::codec::{self, CorrelationPayload, DecodedMessage};
use super::socket::{self, IcmpSocket, RawIcmpSocket};
use super::*;

/// Large enough for any ICMP datagram on an Ethernet path.
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Number of leading bytes of the sent request searched for in quoted datagrams.
const QUOTE_KEY_LEN: usize = 4;

/// Sends one echo request and waits for the reply that correlates with it.
///
/// Opens a fresh raw socket bound to the request's local address and closes
/// it on every exit path. Blocks for at most the request timeout once the
/// socket is configured.
pub fn probe(request: &ProbeRequest) -> Result<ProbeResult, ProbeError> {
    let mut socket =
        RawIcmpSocket::bind(request.local_addr()).map_err(|source| ProbeError::SocketOpen {
            addr: request.local_addr(),
            source,
        })?;
    debug!(local = %request.local_addr(), "opened ICMP listener");
    probe_with(&mut socket, request)
}

/// Runs the probe transaction over an already open socket.
pub fn probe_with<S: IcmpSocket>(
    socket: &mut S,
    request: &ProbeRequest,
) -> Result<ProbeResult, ProbeError> {
    socket
        .set_ttl(u32::from(request.ttl()))
        .map_err(ProbeError::SocketConfig)?;
    // One deadline for the whole receive loop, never extended per discard.
    let deadline = Instant::now() + request.timeout();

    let packet = codec::encode_echo_request(request.identifier(), request.sequence())?;
    let matcher = ReplyMatcher::new(request, &packet);

    let start = Instant::now();
    socket
        .send_to(&packet, request.destination())
        .map_err(ProbeError::Send)?;
    debug!(
        destination = %request.destination(),
        ttl = request.ttl(),
        id = request.identifier(),
        seq = request.sequence(),
        "sent echo request"
    );

    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (n, peer) = match socket.recv_from(&mut buf, deadline) {
            Ok(received) => received,
            Err(e) if socket::is_timeout(&e) => {
                debug!(seq = request.sequence(), "no correlated reply before deadline");
                return Err(ProbeError::Timeout);
            }
            Err(e) => return Err(ProbeError::Receive(e)),
        };

        if let Some(reply) = matcher.correlate(peer, &buf[..n]) {
            let elapsed = start.elapsed();
            debug!(responder = %peer, ?reply, ?elapsed, "correlated reply");
            return Ok(ProbeResult {
                responder: peer,
                elapsed,
                reply,
            });
        }
    }
}

/// Probes `destination` and accepts replies only from `target`, if given.
#[allow(clippy::too_many_arguments)]
pub fn send_icmp(
    local_addr: Ipv4Addr,
    destination: Ipv4Addr,
    target: Option<Ipv4Addr>,
    ttl: u8,
    identifier: u16,
    timeout: Duration,
    sequence: u16,
) -> Result<ProbeResult, ProbeError> {
    let request = ProbeRequest::builder(destination)
        .local_addr(local_addr)
        .target_filter(target)
        .ttl(ttl)
        .identifier(identifier)
        .timeout(timeout)
        .sequence(sequence)
        .build()?;
    probe(&request)
}

/// Probes `destination` with the given TTL, accepting a reply from any hop.
pub fn discover_hop(
    local_addr: Ipv4Addr,
    destination: Ipv4Addr,
    ttl: u8,
    identifier: u16,
    timeout: Duration,
    sequence: u16,
) -> Result<ProbeResult, ProbeError> {
    send_icmp(
        local_addr,
        destination,
        None,
        ttl,
        identifier,
        timeout,
        sequence,
    )
}

/// Decides whether a received ICMP message answers one specific request.
struct ReplyMatcher {
    quote_key: [u8; QUOTE_KEY_LEN],
    payload: CorrelationPayload,
    sequence: u16,
    target_filter: Option<Ipv4Addr>,
}

impl ReplyMatcher {
    fn new(request: &ProbeRequest, sent: &[u8]) -> Self {
        let mut quote_key = [0u8; QUOTE_KEY_LEN];
        quote_key.copy_from_slice(&sent[..QUOTE_KEY_LEN]);
        Self {
            quote_key,
            payload: CorrelationPayload::new(request.sequence()),
            sequence: request.sequence(),
            target_filter: request.target_filter(),
        }
    }

    fn correlate(&self, peer: Ipv4Addr, message: &[u8]) -> Option<ReplyKind> {
        if message.is_empty() {
            return None;
        }
        if let Some(target) = self.target_filter {
            if peer != target {
                trace!(%peer, %target, "discarding reply from unexpected peer");
                return None;
            }
        }

        let decoded = match codec::decode_message(message) {
            Ok(decoded) => decoded,
            Err(e) => {
                trace!(%peer, error = %e, "discarding malformed ICMP message");
                return None;
            }
        };

        match decoded {
            DecodedMessage::TimeExceeded { original } => {
                if self.quotes_request(original) {
                    Some(ReplyKind::Hop)
                } else {
                    trace!(%peer, "discarding unrelated time exceeded");
                    None
                }
            }
            DecodedMessage::EchoReply {
                identifier,
                sequence,
                body,
            } => {
                if body == self.payload.as_bytes() {
                    Some(ReplyKind::Destination)
                } else {
                    trace!(
                        %peer,
                        identifier,
                        sequence,
                        "discarding echo reply with foreign payload"
                    );
                    None
                }
            }
            DecodedMessage::Other { icmp_type } => {
                trace!(%peer, icmp_type, "discarding ICMP message");
                None
            }
        }
    }

    /// The router quotes our request after the original IP header; the
    /// checksum in the key ties it to this request's payload.
    fn quotes_request(&self, original: &[u8]) -> bool {
        let offset = match original
            .windows(QUOTE_KEY_LEN)
            .position(|window| window == &self.quote_key[..])
        {
            Some(offset) => offset,
            None => return false,
        };
        match codec::parse_echo(&original[offset..]) {
            Some(echo) => echo.sequence == self.sequence,
            None => false,
        }
    }
}

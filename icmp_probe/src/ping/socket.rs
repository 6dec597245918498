//! Raw ICMPv4 socket access.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};
use tracing::trace;

use super::codec;

/// The socket operations a probe needs.
///
/// `recv_from` writes a bare ICMP message (IP header removed) into `buf`. A
/// returned length of zero means the datagram carried nothing usable. Once
/// `deadline` has passed it fails with `TimedOut` or `WouldBlock`.
pub trait IcmpSocket {
    fn set_ttl(&mut self, ttl: u32) -> io::Result<()>;

    fn send_to(&mut self, packet: &[u8], destination: Ipv4Addr) -> io::Result<usize>;

    fn recv_from(&mut self, buf: &mut [u8], deadline: Instant) -> io::Result<(usize, Ipv4Addr)>;
}

/// Receive buffer size; larger datagrams are truncated.
const RECV_BUFFER_LEN: usize = 1500;

/// `SO_RCVTIMEO` has microsecond resolution and treats zero as "block
/// forever", so anything left before the deadline is at least 1 µs.
fn read_timeout(deadline: Instant, now: Instant) -> Option<Duration> {
    let remaining = deadline.saturating_duration_since(now);
    if remaining.is_zero() {
        None
    } else {
        Some(remaining.max(Duration::from_micros(1)))
    }
}

pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// `SOCK_RAW`/`IPPROTO_ICMP` socket. Needs root or `CAP_NET_RAW`.
///
/// The kernel hands every inbound ICMP datagram for the host to this socket,
/// so callers must correlate replies themselves. Closed on drop.
pub struct RawIcmpSocket {
    socket: Socket,
}

impl RawIcmpSocket {
    pub fn bind(local_addr: Ipv4Addr) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.bind(&SockAddr::from(SocketAddrV4::new(local_addr, 0)))?;
        Ok(Self { socket })
    }
}

impl IcmpSocket for RawIcmpSocket {
    fn set_ttl(&mut self, ttl: u32) -> io::Result<()> {
        self.socket.set_ttl(ttl)
    }

    fn send_to(&mut self, packet: &[u8], destination: Ipv4Addr) -> io::Result<usize> {
        let addr = SockAddr::from(SocketAddrV4::new(destination, 0));
        self.socket.send_to(packet, &addr)
    }

    fn recv_from(&mut self, buf: &mut [u8], deadline: Instant) -> io::Result<(usize, Ipv4Addr)> {
        let mut raw = [MaybeUninit::<u8>::uninit(); RECV_BUFFER_LEN];
        loop {
            // SO_RCVTIMEO is relative, so re-arm it with what is left.
            let timeout = read_timeout(deadline, Instant::now()).ok_or_else(|| {
                io::Error::new(io::ErrorKind::TimedOut, "receive deadline exceeded")
            })?;
            self.socket.set_read_timeout(Some(timeout))?;

            let (n, from) = match self.socket.recv_from(&mut raw) {
                Ok(received) => received,
                Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            // SAFETY: recv_from initialized the first `n` bytes.
            let datagram: &[u8] =
                unsafe { std::slice::from_raw_parts(raw.as_ptr() as *const u8, n) };

            let peer = match from.as_socket() {
                Some(SocketAddr::V4(addr)) => *addr.ip(),
                _ => {
                    trace!(len = n, "ignoring datagram without an IPv4 source");
                    continue;
                }
            };

            return match codec::strip_ipv4_header(datagram) {
                Some(message) => {
                    let len = message.len().min(buf.len());
                    buf[..len].copy_from_slice(&message[..len]);
                    Ok((len, peer))
                }
                None => Ok((0, peer)),
            };
        }
    }
}

pub mod codec;
pub mod icmp;
pub mod socket;

use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_TTL: u8 = 64;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Identifier used to tag this process's echo requests.
pub fn default_identifier() -> u16 {
    (std::process::id() & 0xFFFF) as u16
}

/// Everything that can end a probe without a correlated reply.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to open ICMP listener on {addr}: {source}")]
    SocketOpen {
        addr: Ipv4Addr,
        #[source]
        source: io::Error,
    },

    #[error("Failed to configure socket: {0}")]
    SocketConfig(#[source] io::Error),

    #[error("Invalid probe request: {0}")]
    InvalidRequest(String),

    #[error("Failed to encode echo request: {0}")]
    Encode(String),

    #[error("Failed to send echo request: {0}")]
    Send(#[source] io::Error),

    #[error("No correlated reply before deadline")]
    Timeout,

    #[error("Failed to receive: {0}")]
    Receive(#[source] io::Error),
}

impl ProbeError {
    /// Returns true when the probe simply got no answer in time.
    ///
    /// This is the expected outcome for hops that do not respond, and callers
    /// should report it as a silent hop rather than a failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Parameters of one outstanding probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    local_addr: Ipv4Addr,
    destination: Ipv4Addr,
    target_filter: Option<Ipv4Addr>,
    ttl: u8,
    identifier: u16,
    sequence: u16,
    timeout: Duration,
}

impl ProbeRequest {
    pub fn builder(destination: Ipv4Addr) -> ProbeRequestBuilder {
        ProbeRequestBuilder::new(destination)
    }

    pub fn local_addr(&self) -> Ipv4Addr {
        self.local_addr
    }

    pub fn destination(&self) -> Ipv4Addr {
        self.destination
    }

    /// Only replies sent by this address are considered, when set.
    pub fn target_filter(&self) -> Option<Ipv4Addr> {
        self.target_filter
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[derive(Debug, Clone)]
pub struct ProbeRequestBuilder {
    local_addr: Ipv4Addr,
    destination: Ipv4Addr,
    target_filter: Option<Ipv4Addr>,
    ttl: u8,
    identifier: u16,
    sequence: u16,
    timeout: Duration,
}

impl ProbeRequestBuilder {
    fn new(destination: Ipv4Addr) -> Self {
        Self {
            local_addr: Ipv4Addr::UNSPECIFIED,
            destination,
            target_filter: None,
            ttl: DEFAULT_TTL,
            identifier: default_identifier(),
            sequence: 0,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn local_addr(mut self, local_addr: Ipv4Addr) -> Self {
        self.local_addr = local_addr;
        self
    }

    pub fn target_filter(mut self, target: Option<Ipv4Addr>) -> Self {
        self.target_filter = target;
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn identifier(mut self, identifier: u16) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn sequence(mut self, sequence: u16) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ProbeRequest, ProbeError> {
        if self.ttl == 0 {
            return Err(ProbeError::InvalidRequest(
                "TTL must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ProbeError::InvalidRequest(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(ProbeRequest {
            local_addr: self.local_addr,
            destination: self.destination,
            target_filter: self.target_filter,
            ttl: self.ttl,
            identifier: self.identifier,
            sequence: self.sequence,
            timeout: self.timeout,
        })
    }
}

/// Which kind of ICMP message answered the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// A router dropped the request and sent back Time Exceeded.
    Hop,
    /// The destination itself sent an Echo Reply.
    Destination,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub responder: Ipv4Addr,
    pub elapsed: Duration,
    pub reply: ReplyKind,
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.reply {
            ReplyKind::Hop => "time exceeded",
            ReplyKind::Destination => "echo reply",
        };
        write!(
            f,
            "{} ({}) {:.3} ms",
            self.responder,
            kind,
            self.elapsed.as_secs_f64() * 1000.0
        )
    }
}

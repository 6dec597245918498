//! Single-shot ICMPv4 probes for hop discovery and reachability checks.
//!
//! A probe sends one Echo Request with a chosen TTL and waits for either a
//! Time Exceeded from the router that dropped it or an Echo Reply from the
//! destination, whichever correlates with the request first.

pub mod ping;

pub use crate::ping::icmp::{discover_hop, probe, probe_with, send_icmp};
pub use crate::ping::{
    default_identifier, ProbeError, ProbeRequest, ProbeRequestBuilder, ProbeResult, ReplyKind,
};

#![cfg(unix)]

use icmp_probe::{default_identifier, discover_hop, send_icmp, ReplyKind};
use std::net::Ipv4Addr;
use std::time::Duration;

fn target() -> Ipv4Addr {
    std::env::var("ICMP_PROBE_TARGET")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or_else(|| Ipv4Addr::new(8, 8, 8, 8))
}

#[test]
#[ignore]
fn icmp_probe_reaches_destination() {
    let target = target();
    let result = send_icmp(
        Ipv4Addr::UNSPECIFIED,
        target,
        Some(target),
        64,
        default_identifier(),
        Duration::from_secs(3),
        1,
    )
    .expect("echo reply from target");
    assert_eq!(result.reply, ReplyKind::Destination);
    assert_eq!(result.responder, target);
}

#[test]
#[ignore]
fn icmp_probe_first_hop() {
    let result = discover_hop(
        Ipv4Addr::UNSPECIFIED,
        target(),
        1,
        default_identifier(),
        Duration::from_secs(3),
        2,
    );

    match result {
        Ok(result) => assert_eq!(result.reply, ReplyKind::Hop),
        Err(err) => assert!(err.is_timeout(), "unexpected error: {}", err),
    }
}

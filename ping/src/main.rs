use anyhow::{Context, Result};
use clap::Parser;
use icmp_probe::{default_identifier, ProbeRequest};
use std::net::Ipv4Addr;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Send one ICMP echo probe with a chosen TTL.
#[derive(Parser, Debug)]
#[command(name = "ping")]
#[command(version)]
struct Args {
    /// Destination IPv4 address.
    target: Ipv4Addr,

    /// Outbound TTL.
    #[arg(short, long, default_value = "64")]
    ttl: u8,

    /// Timeout in milliseconds.
    #[arg(short = 'W', long, default_value = "1000")]
    timeout: u64,

    /// Local address to bind the listener to.
    #[arg(short = 'I', long, default_value = "0.0.0.0")]
    local: Ipv4Addr,

    /// Sequence number of the request.
    #[arg(short, long, default_value = "1")]
    sequence: u16,

    /// Only accept replies sent by the target itself.
    #[arg(long)]
    strict: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let request = ProbeRequest::builder(args.target)
        .local_addr(args.local)
        .target_filter(args.strict.then_some(args.target))
        .ttl(args.ttl)
        .identifier(default_identifier())
        .sequence(args.sequence)
        .timeout(Duration::from_millis(args.timeout))
        .build()
        .context("invalid probe parameters")?;

    match icmp_probe::probe(&request) {
        Ok(result) => {
            println!("{}", result);
            Ok(ExitCode::SUCCESS)
        }
        Err(err) if err.is_timeout() => {
            println!("{}: no reply within {} ms", args.target, args.timeout);
            Ok(ExitCode::FAILURE)
        }
        Err(err) => Err(err).with_context(|| format!("probe to {} failed", args.target)),
    }
}

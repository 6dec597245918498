use anyhow::{bail, Context, Result};
use clap::Parser;
use icmp_probe::{default_identifier, ProbeError, ProbeRequest, ProbeResult, ReplyKind};
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Discover the hops towards a destination with TTL-limited ICMP probes.
#[derive(Parser, Debug)]
#[command(name = "traceroute")]
#[command(version)]
struct Args {
    /// Destination IPv4 address.
    target: Ipv4Addr,

    /// Maximum TTL.
    #[arg(short = 'm', long = "max-ttl", default_value = "30")]
    max_ttl: u8,

    /// Probes per hop, sent concurrently on separate sockets.
    #[arg(short, long, default_value = "3")]
    queries: u16,

    /// Timeout per probe in milliseconds.
    #[arg(short = 'W', long, default_value = "1000")]
    timeout: u64,

    /// Local address to bind listeners to.
    #[arg(short = 'I', long, default_value = "0.0.0.0")]
    local: Ipv4Addr,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

async fn probe_hop(
    args: &Args,
    ttl: u8,
    identifier: u16,
    first_sequence: u16,
) -> Result<Vec<Result<ProbeResult, ProbeError>>> {
    let mut tasks = Vec::with_capacity(usize::from(args.queries));
    for query in 0..args.queries {
        let request = ProbeRequest::builder(args.target)
            .local_addr(args.local)
            .ttl(ttl)
            .identifier(identifier)
            .sequence(first_sequence.wrapping_add(query))
            .timeout(Duration::from_millis(args.timeout))
            .build()?;
        tasks.push(tokio::task::spawn_blocking(move || {
            icmp_probe::probe(&request)
        }));
    }

    let mut results = Vec::with_capacity(tasks.len());
    for joined in futures::future::join_all(tasks).await {
        results.push(joined.context("probe task panicked")?);
    }
    Ok(results)
}

fn format_hop(ttl: u8, results: &[Result<ProbeResult, ProbeError>]) -> String {
    let mut line = format!("{:>2} ", ttl);
    let mut last_responder = None;
    for result in results {
        match result {
            Ok(result) => {
                if last_responder != Some(result.responder) {
                    line.push_str(&format!(" {}", result.responder));
                    last_responder = Some(result.responder);
                }
                line.push_str(&format!(" {:.3} ms", result.elapsed.as_secs_f64() * 1000.0));
            }
            Err(_) => line.push_str(" *"),
        }
    }
    line
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
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

    if args.queries == 0 {
        bail!("at least one query per hop is required");
    }

    let identifier = default_identifier();
    info!(destination = %args.target, max_ttl = args.max_ttl, identifier, "starting traceroute");

    let mut sequence: u16 = 0;
    for ttl in 1..=args.max_ttl {
        let results = probe_hop(&args, ttl, identifier, sequence).await?;
        sequence = sequence.wrapping_add(args.queries);

        for result in &results {
            if let Err(err) = result {
                if !err.is_timeout() {
                    bail!("probe with TTL {} failed: {}", ttl, err);
                }
            }
        }
        println!("{}", format_hop(ttl, &results));

        let reached = results
            .iter()
            .any(|result| matches!(result, Ok(r) if r.reply == ReplyKind::Destination));
        if reached {
            debug!(ttl, "destination answered");
            return Ok(());
        }
    }

    info!(destination = %args.target, "destination not reached within max TTL");
    Ok(())
}

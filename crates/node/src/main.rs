//! `crlink` node: runs one end of the half-duplex link over UDP.
//!
//! `-m` makes this node the master, `-s` the slave. Ctrl-C stops the link
//! through the control loop, which lets every worker finish cleanly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crlink_core::NodeId;
use crlink_radio::{Link, LinkConfig, RadioFrontEnd, RetryPolicy, Role, UdpRadio};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

/// Half-duplex master/slave radio link with stop-and-wait ARQ.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Run as master (sends data, waits for acks)
    #[arg(short, long)]
    master: bool,

    /// Run as slave (acks every data packet); the default
    #[arg(short, long, conflicts_with = "master")]
    slave: bool,

    /// Node id, decimal or 0x-prefixed hex; random when omitted
    #[arg(short = 'i', long = "id", value_parser = parse_node_id)]
    node_id: Option<NodeId>,

    /// Local UDP address standing in for the radio
    #[arg(long, default_value = "0.0.0.0:7400")]
    bind: SocketAddr,

    /// UDP address of the other node
    #[arg(long, default_value = "127.0.0.1:7401")]
    peer: SocketAddr,

    /// Destination node id for data packets; broadcast when omitted
    #[arg(long, value_parser = parse_node_id)]
    peer_id: Option<NodeId>,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Ack timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    ack_timeout_ms: u64,

    /// Transmissions per packet before the link fails (0 = retry forever)
    #[arg(long, default_value_t = 64)]
    max_attempts: u32,

    /// Master stops after this many acknowledged packets
    #[arg(long)]
    packets: Option<u64>,
}

fn parse_node_id(s: &str) -> Result<NodeId, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => NodeId::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid node id '{s}': {e}"))
}

impl Cli {
    fn link_config(&self) -> LinkConfig {
        let role = if self.master { Role::Master } else { Role::Slave };
        LinkConfig {
            node_id: self.node_id.unwrap_or_else(rand::random),
            role,
            peer: self.peer_id,
            retry: RetryPolicy {
                ack_timeout: Duration::from_millis(self.ack_timeout_ms),
                max_attempts: (self.max_attempts > 0).then_some(self.max_attempts),
                ..Default::default()
            },
            run_for: self.duration.map(Duration::from_secs),
            max_packets: self.packets,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.link_config();
    info!("node id {:#06x}, role {}", config.node_id, config.role);

    let radio: Arc<dyn RadioFrontEnd> = Arc::new(
        UdpRadio::bind(cli.bind, cli.peer)
            .await
            .with_context(|| format!("binding {}", cli.bind))?,
    );

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, stopping link"),
            Err(e) => warn!("cannot listen for ctrl-c: {e}"),
        }
        ctrl_c.cancel();
    });

    let handle = Link::new(config, radio).spawn(cancel).await?;
    let report = handle.join().await?;

    let stats = &report.stats;
    println!("link stopped: {}", report.reason);
    println!(
        "frames: {} received, {} valid, {} header CRC failures, {} payload CRC failures",
        stats.frames_received, stats.frames_valid, stats.header_crc_failures, stats.payload_crc_failures
    );
    println!(
        "data: {} sent, {} retransmitted, {} acked, {} timeouts, {} bad acks",
        stats.data_sent, stats.retransmissions, stats.packets_acked, stats.ack_timeouts, stats.ack_mismatches
    );
    println!("acks: {} sent, {} duplicates", stats.acks_sent, stats.duplicates);

    if report.reason.is_fault() {
        anyhow::bail!("link failed: {}", report.reason);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_parse_in_decimal_and_hex() {
        assert_eq!(parse_node_id("42"), Ok(42));
        assert_eq!(parse_node_id("0xbeef"), Ok(0xbeef));
        assert!(parse_node_id("0x1ffff").is_err());
        assert!(parse_node_id("node").is_err());
    }

    #[test]
    fn role_flags_are_exclusive() {
        assert!(Cli::try_parse_from(["crlink", "-m", "-s"]).is_err());
        let cli = Cli::try_parse_from(["crlink"]).unwrap();
        assert_eq!(cli.link_config().role, Role::Slave);

        let cli = Cli::try_parse_from(["crlink", "-m", "-i", "7", "--max-attempts", "0"]).unwrap();
        let config = cli.link_config();
        assert_eq!(config.role, Role::Master);
        assert_eq!(config.node_id, 7);
        assert_eq!(config.retry.max_attempts, None);
    }

    #[test]
    fn slave_defaults() {
        let cli = Cli::try_parse_from(["crlink", "-s", "--duration", "3"]).unwrap();
        let config = cli.link_config();
        assert_eq!(config.role, Role::Slave);
        assert_eq!(config.run_for, Some(Duration::from_secs(3)));
        assert_eq!(config.retry.max_attempts, Some(64));
        assert_eq!(config.retry.ack_timeout, Duration::from_secs(1));
    }
}

//! Master/slave scenarios over one simulated channel pair.

use std::sync::Arc;
use std::time::Duration;

use crlink_radio::{
    ChannelConfig, ChannelStats, Link, LinkConfig, LinkError, LinkReport, RadioFrontEnd,
    RetryPolicy, SimulatedRadio,
};
use log::info;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const MASTER_ID: u16 = 0x0001;
pub const SLAVE_ID: u16 = 0x0002;

pub struct PairReport {
    pub master: LinkReport,
    pub slave: LinkReport,
    pub uplink: ChannelStats,
    pub downlink: ChannelStats,
    pub elapsed: Duration,
}

impl PairReport {
    /// Acknowledged payload bits per second.
    pub fn goodput_bps(&self) -> f64 {
        let bits = self.master.stats.packets_acked as f64 * (crlink_core::PAYLOAD_LEN * 8) as f64;
        bits / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }

    /// Share of data transmissions that ended up acknowledged.
    pub fn efficiency(&self) -> f64 {
        match self.master.stats.data_sent {
            0 => 0.0,
            sent => self.master.stats.packets_acked as f64 / sent as f64,
        }
    }
}

/// An ack timeout that covers one data/ack round trip on `channel`.
pub fn retry_for(channel: &ChannelConfig, max_attempts: Option<u32>) -> RetryPolicy {
    let one_way = channel.airtime() + channel.latency + channel.latency_jitter * 3;
    let ack_timeout = one_way * 2 + channel.block_interval * 2 + Duration::from_millis(20);
    RetryPolicy {
        ack_timeout,
        max_attempts,
        backoff_factor: 1,
        max_timeout: ack_timeout * 4,
    }
}

/// Run a master against a slave until `packets` are acknowledged or the
/// master gives up, then stop the slave.
pub async fn run_pair(
    channel: ChannelConfig,
    packets: u64,
    retry: RetryPolicy,
) -> Result<PairReport, LinkError> {
    let (uplink, downlink) = SimulatedRadio::pair(channel);
    let (uplink, downlink) = (Arc::new(uplink), Arc::new(downlink));

    let slave_cancel = CancellationToken::new();
    let slave_radio: Arc<dyn RadioFrontEnd> = downlink.clone();
    let slave = Link::new(LinkConfig::slave(SLAVE_ID), slave_radio)
        .spawn(slave_cancel.clone())
        .await?;

    let master_config = LinkConfig {
        peer: Some(SLAVE_ID),
        retry,
        max_packets: Some(packets),
        ..LinkConfig::master(MASTER_ID)
    };
    let master_radio: Arc<dyn RadioFrontEnd> = uplink.clone();
    let started = Instant::now();
    let master = Link::new(master_config, master_radio)
        .spawn(CancellationToken::new())
        .await?;

    let master = master.join().await?;
    let elapsed = started.elapsed();
    info!("scenario: master finished ({}) after {elapsed:?}", master.reason);

    slave_cancel.cancel();
    let slave = slave.join().await?;

    Ok(PairReport {
        master,
        slave,
        uplink: uplink.get_stats().await,
        downlink: downlink.get_stats().await,
        elapsed,
    })
}

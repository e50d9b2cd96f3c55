//! Simulated radio channel for testing

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use crlink_core::{PacketHeader, Payload, HEADER_LEN, PAYLOAD_LEN};
use log::{debug, trace, warn};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};

use crate::frontend::{Direction, RadioFrontEnd, RxBlock, RxFrame, TransportError, TxReport};

const CHANNEL_DEPTH: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Zero means no airtime is simulated.
    pub bandwidth_bps: u32,
    pub loss: f32,
    pub header_corruption: f32,
    pub payload_corruption: f32,
    pub underrun: f32,
    pub overrun: f32,
    pub latency: Duration,
    pub latency_jitter: Duration,
    /// Longest a `receive` call waits on a silent channel.
    pub block_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            bandwidth_bps: 9600,
            loss: 0.05,
            header_corruption: 0.02,
            payload_corruption: 0.02,
            underrun: 0.0,
            overrun: 0.0,
            latency: Duration::from_millis(20),
            latency_jitter: Duration::from_millis(5),
            block_interval: Duration::from_millis(50),
        }
    }
}

impl ChannelConfig {
    /// Lossless, instantaneous channel.
    pub fn ideal() -> Self {
        Self {
            bandwidth_bps: 0,
            loss: 0.0,
            header_corruption: 0.0,
            payload_corruption: 0.0,
            underrun: 0.0,
            overrun: 0.0,
            latency: Duration::ZERO,
            latency_jitter: Duration::ZERO,
            block_interval: Duration::from_millis(20),
        }
    }

    /// Time one frame occupies the channel.
    pub fn airtime(&self) -> Duration {
        if self.bandwidth_bps == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(((HEADER_LEN + PAYLOAD_LEN) * 8) as f64 / self.bandwidth_bps as f64)
    }

    fn jitter(&self) -> Duration {
        let std_dev = self.latency_jitter.as_secs_f64();
        if std_dev <= 0.0 {
            return Duration::ZERO;
        }
        match Normal::new(0.0, std_dev) {
            Ok(normal) => Duration::from_secs_f64(normal.sample(&mut rand::rng()).abs()),
            Err(_) => Duration::ZERO,
        }
    }
}

/// What happens to a frame on its way to the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fate {
    Deliver,
    Drop,
    CorruptHeader,
    CorruptPayload,
    /// Deliver with a different header.
    Rewrite(PacketHeader),
}

type FaultRule = Box<dyn FnMut(&PacketHeader) -> Fate + Send>;

#[derive(Debug, Clone)]
struct AirFrame {
    header: [u8; HEADER_LEN],
    payload: Payload,
    header_valid: bool,
    payload_valid: bool,
}

impl From<AirFrame> for RxFrame {
    fn from(frame: AirFrame) -> Self {
        RxFrame {
            header: frame.header.to_vec(),
            header_valid: frame.header_valid,
            payload: frame.payload,
            payload_valid: frame.payload_valid,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub frames_corrupted: u64,
}

/// One end of a simulated point-to-point channel. Frames transmitted here
/// arrive at the peer end created by the same [`SimulatedRadio::pair`] call.
pub struct SimulatedRadio {
    config: ChannelConfig,
    outgoing: mpsc::Sender<AirFrame>,
    incoming: Mutex<mpsc::Receiver<AirFrame>>,
    fault_rule: Mutex<Option<FaultRule>>,
    injected_error: Mutex<Option<TransportError>>,
    transmitted: Mutex<Vec<PacketHeader>>,
    stats: Mutex<ChannelStats>,
    tx_active: AtomicBool,
    rx_active: AtomicBool,
}

impl SimulatedRadio {
    pub fn pair(config: ChannelConfig) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_DEPTH);
        (
            Self::new(config.clone(), a_tx, b_rx),
            Self::new(config, b_tx, a_rx),
        )
    }

    fn new(
        config: ChannelConfig,
        outgoing: mpsc::Sender<AirFrame>,
        incoming: mpsc::Receiver<AirFrame>,
    ) -> Self {
        Self {
            config,
            outgoing,
            incoming: Mutex::new(incoming),
            fault_rule: Mutex::new(None),
            injected_error: Mutex::new(None),
            transmitted: Mutex::new(Vec::new()),
            stats: Mutex::new(ChannelStats::default()),
            tx_active: AtomicBool::new(false),
            rx_active: AtomicBool::new(false),
        }
    }

    /// Decide the fate of every frame this end transmits, on top of the
    /// random channel impairments.
    pub async fn set_fault_rule<F>(&self, rule: F)
    where
        F: FnMut(&PacketHeader) -> Fate + Send + 'static,
    {
        *self.fault_rule.lock().await = Some(Box::new(rule));
    }

    /// Make the next `transmit` call fail with `err`.
    pub async fn inject_tx_error(&self, err: TransportError) {
        *self.injected_error.lock().await = Some(err);
    }

    /// Headers of every frame handed to `transmit`, in order.
    pub async fn transmitted(&self) -> Vec<PacketHeader> {
        self.transmitted.lock().await.clone()
    }

    pub async fn get_stats(&self) -> ChannelStats {
        self.stats.lock().await.clone()
    }

    pub fn is_active(&self, direction: Direction) -> bool {
        match direction {
            Direction::Tx => self.tx_active.load(Ordering::Acquire),
            Direction::Rx => self.rx_active.load(Ordering::Acquire),
        }
    }

    async fn fate_of(&self, header: &PacketHeader) -> Fate {
        if let Some(rule) = self.fault_rule.lock().await.as_mut() {
            let fate = rule(header);
            if fate != Fate::Deliver {
                return fate;
            }
        }

        let mut rng = rand::rng();
        if rng.random::<f32>() < self.config.loss {
            Fate::Drop
        } else if rng.random::<f32>() < self.config.header_corruption {
            Fate::CorruptHeader
        } else if rng.random::<f32>() < self.config.payload_corruption {
            Fate::CorruptPayload
        } else {
            Fate::Deliver
        }
    }
}

#[async_trait]
impl RadioFrontEnd for SimulatedRadio {
    async fn set_frequency(&self, hz: f64) -> Result<(), TransportError> {
        debug!("sim: center frequency {:.3} MHz", hz / 1e6);
        Ok(())
    }

    async fn set_gain(&self, tx_gain: f32, rx_gain: f32) -> Result<(), TransportError> {
        debug!("sim: tx gain {tx_gain}, rx gain {rx_gain}");
        Ok(())
    }

    async fn start(&self, direction: Direction) -> Result<(), TransportError> {
        match direction {
            Direction::Tx => self.tx_active.store(true, Ordering::Release),
            Direction::Rx => self.rx_active.store(true, Ordering::Release),
        }
        Ok(())
    }

    async fn stop(&self, direction: Direction) -> Result<(), TransportError> {
        match direction {
            Direction::Tx => self.tx_active.store(false, Ordering::Release),
            Direction::Rx => self.rx_active.store(false, Ordering::Release),
        }
        Ok(())
    }

    async fn transmit(
        &self,
        header: &[u8; HEADER_LEN],
        payload: &Payload,
    ) -> Result<TxReport, TransportError> {
        if let Some(err) = self.injected_error.lock().await.take() {
            return Err(err);
        }

        let decoded = PacketHeader::from_bytes(header)
            .map_err(|e| TransportError::Device(e.to_string()))?;
        self.transmitted.lock().await.push(decoded);

        let delay = self.config.airtime() + self.config.latency + self.config.jitter();
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let mut frame = AirFrame {
            header: *header,
            payload: *payload,
            header_valid: true,
            payload_valid: true,
        };
        match self.fate_of(&decoded).await {
            Fate::Deliver => {}
            Fate::Drop => {
                self.stats.lock().await.frames_dropped += 1;
                debug!("sim: dropped {decoded}");
                return Ok(self.tx_report());
            }
            Fate::CorruptHeader => {
                frame.header_valid = false;
                frame.header[HEADER_LEN - 1] ^= 0xa5;
                self.stats.lock().await.frames_corrupted += 1;
            }
            Fate::CorruptPayload => {
                frame.payload_valid = false;
                frame.payload[0] ^= 0xff;
                self.stats.lock().await.frames_corrupted += 1;
            }
            Fate::Rewrite(replacement) => {
                trace!("sim: rewriting {decoded} as {replacement}");
                frame.header = replacement.to_bytes();
            }
        }

        match self.outgoing.try_send(frame) {
            Ok(()) => {
                self.stats.lock().await.frames_sent += 1;
                trace!("sim: sent {decoded}");
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("sim: peer queue full, dropping {decoded}");
                self.stats.lock().await.frames_dropped += 1;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("sim: nobody listening for {decoded}");
                self.stats.lock().await.frames_dropped += 1;
            }
        }
        Ok(self.tx_report())
    }

    async fn receive(&self) -> Result<RxBlock, TransportError> {
        let mut incoming = self.incoming.lock().await;
        let mut block = RxBlock {
            frames: Vec::new(),
            overrun: rand::rng().random::<f32>() < self.config.overrun,
        };

        match timeout(self.config.block_interval, incoming.recv()).await {
            Ok(Some(frame)) => block.frames.push(frame.into()),
            // peer end gone: behave like a silent channel
            Ok(None) => sleep(self.config.block_interval).await,
            Err(_) => {}
        }
        while let Ok(frame) = incoming.try_recv() {
            block.frames.push(frame.into());
        }
        Ok(block)
    }
}

impl SimulatedRadio {
    fn tx_report(&self) -> TxReport {
        TxReport {
            underrun: rand::rng().random::<f32>() < self.config.underrun,
        }
    }
}

#[cfg(test)]
mod tests {
    use crlink_core::Address;

    use super::*;

    fn header(packet_id: u8) -> PacketHeader {
        PacketHeader::data(Address::node(1), Address::node(2), packet_id)
    }

    #[tokio::test]
    async fn ideal_channel_delivers_in_order() {
        let (a, b) = SimulatedRadio::pair(ChannelConfig::ideal());
        for id in 1..=3 {
            a.transmit(&header(id).to_bytes(), &[id; PAYLOAD_LEN]).await.unwrap();
        }

        let block = b.receive().await.unwrap();
        let ids: Vec<u8> = block
            .frames
            .iter()
            .map(|f| PacketHeader::from_bytes(&f.header).unwrap().packet_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(block.frames.iter().all(|f| f.header_valid && f.payload_valid));
        assert_eq!(a.transmitted().await.len(), 3);
        assert_eq!(a.get_stats().await.frames_sent, 3);
    }

    #[tokio::test]
    async fn silent_channel_returns_empty_block() {
        let (_a, b) = SimulatedRadio::pair(ChannelConfig::ideal());
        let block = b.receive().await.unwrap();
        assert!(block.frames.is_empty());
    }

    #[tokio::test]
    async fn fault_rule_drops_and_corrupts() {
        let (a, b) = SimulatedRadio::pair(ChannelConfig::ideal());
        a.set_fault_rule(|h| match h.packet_id {
            1 => Fate::Drop,
            2 => Fate::CorruptHeader,
            3 => Fate::CorruptPayload,
            _ => Fate::Deliver,
        })
        .await;
        for id in 1..=4 {
            a.transmit(&header(id).to_bytes(), &[0; PAYLOAD_LEN]).await.unwrap();
        }

        let frames = b.receive().await.unwrap().frames;
        assert_eq!(frames.len(), 3);
        assert!(!frames[0].header_valid);
        assert!(frames[1].header_valid && !frames[1].payload_valid);
        assert!(frames[2].header_valid && frames[2].payload_valid);

        let stats = a.get_stats().await;
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.frames_corrupted, 2);
    }

    #[tokio::test]
    async fn injected_error_fails_once() {
        let (a, _b) = SimulatedRadio::pair(ChannelConfig::ideal());
        a.inject_tx_error(TransportError::ShortWrite { expected: 75, written: 10 })
            .await;
        let first = a.transmit(&header(1).to_bytes(), &[0; PAYLOAD_LEN]).await;
        assert!(matches!(first, Err(TransportError::ShortWrite { .. })));
        assert!(a.transmit(&header(1).to_bytes(), &[0; PAYLOAD_LEN]).await.is_ok());
    }

    #[test]
    fn airtime_follows_bandwidth() {
        let config = ChannelConfig {
            bandwidth_bps: 600,
            ..ChannelConfig::ideal()
        };
        assert_eq!(config.airtime(), Duration::from_secs(1));
        assert_eq!(ChannelConfig::ideal().airtime(), Duration::ZERO);
    }
}

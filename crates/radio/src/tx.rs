//! Transmit worker: pushes each outbound packet through the front end exactly once.

use std::sync::Arc;

use log::{error, info, trace, warn};
use tokio::sync::mpsc;

use crate::frontend::{Direction, RadioFrontEnd};
use crate::state::LinkState;
use crate::{ShutdownReason, Worker};

pub struct TransmitWorker {
    state: Arc<LinkState>,
    radio: Arc<dyn RadioFrontEnd>,
    escalate: mpsc::Sender<ShutdownReason>,
}

impl TransmitWorker {
    pub fn new(
        state: Arc<LinkState>,
        radio: Arc<dyn RadioFrontEnd>,
        escalate: mpsc::Sender<ShutdownReason>,
    ) -> Self {
        Self { state, radio, escalate }
    }

    pub async fn run(self) {
        if let Err(e) = self.radio.start(Direction::Tx).await {
            error!("tx: failed to start transfer: {e}");
            self.fault(e.to_string()).await;
            return;
        }
        info!("tx transfer started");

        // the slot guard is released inside next_outbound before the hardware call
        while let Some(packet) = self.state.next_outbound().await {
            trace!("tx: {}", packet.header);
            match self.radio.transmit(&packet.header_bytes, &packet.payload).await {
                Ok(report) => {
                    let underruns = self
                        .state
                        .record(|s| {
                            s.frames_transmitted += 1;
                            if report.underrun {
                                s.tx_underruns += 1;
                            }
                            s.tx_underruns
                        })
                        .await;
                    if report.underrun {
                        warn!("tx underrun ({underruns} total)");
                    }
                }
                Err(e) => {
                    error!("tx: transport fault on {}: {e}", packet.header);
                    self.fault(e.to_string()).await;
                    break;
                }
            }
        }

        if let Err(e) = self.radio.stop(Direction::Tx).await {
            warn!("tx: stop failed: {e}");
        }
        info!("tx transfer stopped");
    }

    async fn fault(&self, detail: String) {
        let reason = ShutdownReason::TransportFault {
            worker: Worker::Transmit,
            detail,
        };
        if self.escalate.send(reason).await.is_err() {
            warn!("tx: control loop gone, fault not escalated");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crlink_core::{Address, PacketHeader, PAYLOAD_LEN};
    use tokio::time::timeout;

    use super::*;
    use crate::frontend::TransportError;
    use crate::simulated::{ChannelConfig, SimulatedRadio};

    #[tokio::test]
    async fn transmits_each_post_once() {
        let state = Arc::new(LinkState::new());
        let (radio, peer) = SimulatedRadio::pair(ChannelConfig::ideal());
        let radio = Arc::new(radio);
        let (esc_tx, _esc_rx) = mpsc::channel(1);
        let handle = tokio::spawn(TransmitWorker::new(state.clone(), radio.clone(), esc_tx).run());

        let header = PacketHeader::data(Address::node(1), Address::BROADCAST, 33);
        state.post_outbound(header, [1; PAYLOAD_LEN]).await;

        let frames = timeout(Duration::from_secs(1), async {
            loop {
                let block = peer.receive().await.unwrap();
                if !block.frames.is_empty() {
                    break block.frames;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header, header.to_bytes().to_vec());
        assert_eq!(radio.transmitted().await, vec![header]);

        state.request_shutdown(ShutdownReason::Cancelled);
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(!radio.is_active(Direction::Tx));
        assert_eq!(state.stats().await.frames_transmitted, 1);
    }

    #[tokio::test]
    async fn short_write_is_escalated() {
        let state = Arc::new(LinkState::new());
        let (radio, _peer) = SimulatedRadio::pair(ChannelConfig::ideal());
        radio
            .inject_tx_error(TransportError::ShortWrite { expected: 75, written: 0 })
            .await;
        let (esc_tx, mut esc_rx) = mpsc::channel(1);
        let handle = tokio::spawn(TransmitWorker::new(state.clone(), Arc::new(radio), esc_tx).run());

        let header = PacketHeader::data(Address::node(1), Address::BROADCAST, 1);
        state.post_outbound(header, [0; PAYLOAD_LEN]).await;

        let reason = timeout(Duration::from_secs(1), esc_rx.recv()).await.unwrap().unwrap();
        assert!(matches!(
            reason,
            ShutdownReason::TransportFault { worker: Worker::Transmit, .. }
        ));
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn underrun_is_counted_and_transmitting_continues() {
        let state = Arc::new(LinkState::new());
        let channel = ChannelConfig {
            underrun: 1.0,
            ..ChannelConfig::ideal()
        };
        let (radio, peer) = SimulatedRadio::pair(channel);
        let (esc_tx, mut esc_rx) = mpsc::channel(1);
        let handle = tokio::spawn(TransmitWorker::new(state.clone(), Arc::new(radio), esc_tx).run());

        for packet_id in [1, 2] {
            let header = PacketHeader::data(Address::node(1), Address::BROADCAST, packet_id);
            state.post_outbound(header, [0; PAYLOAD_LEN]).await;
            timeout(Duration::from_secs(1), async {
                while peer.receive().await.unwrap().frames.is_empty() {}
            })
            .await
            .unwrap();
        }

        state.request_shutdown(ShutdownReason::Cancelled);
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        let stats = state.stats().await;
        assert_eq!(stats.frames_transmitted, 2);
        assert_eq!(stats.tx_underruns, 2);
        assert!(esc_rx.try_recv().is_err());
    }
}

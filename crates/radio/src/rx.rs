//! Receive worker: pulls sample blocks from the front end and runs the decode
//! callback for every frame the synchronizer hands back.

use std::sync::Arc;

use crlink_core::{PacketHeader, HEADER_LEN};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::frontend::{Direction, RadioFrontEnd, RxFrame};
use crate::state::{InboundFrame, LinkState};
use crate::{ShutdownReason, Worker};

pub struct ReceiveWorker {
    state: Arc<LinkState>,
    radio: Arc<dyn RadioFrontEnd>,
    escalate: mpsc::Sender<ShutdownReason>,
    status_every: u64,
}

impl ReceiveWorker {
    pub fn new(
        state: Arc<LinkState>,
        radio: Arc<dyn RadioFrontEnd>,
        escalate: mpsc::Sender<ShutdownReason>,
        status_every: u64,
    ) -> Self {
        Self {
            state,
            radio,
            escalate,
            status_every: status_every.max(1),
        }
    }

    pub async fn run(self) {
        if let Err(e) = self.radio.start(Direction::Rx).await {
            error!("rx: failed to start transfer: {e}");
            self.fault(e.to_string()).await;
            return;
        }
        info!("rx transfer started");

        while !self.state.is_shutdown() {
            let block = tokio::select! {
                biased;
                () = self.state.halted() => break,
                res = self.radio.receive() => res,
            };

            let block = match block {
                Ok(block) => block,
                Err(e) => {
                    error!("rx: transport fault: {e}");
                    self.fault(e.to_string()).await;
                    break;
                }
            };

            if block.overrun {
                let overruns = self
                    .state
                    .record(|s| {
                        s.rx_overruns += 1;
                        s.rx_overruns
                    })
                    .await;
                warn!("rx overrun ({overruns} total)");
            }

            for frame in block.frames {
                self.on_frame(frame).await;
            }
        }

        if let Err(e) = self.radio.stop(Direction::Rx).await {
            warn!("rx: stop failed: {e}");
        }
        info!("rx transfer stopped");
    }

    /// Decode callback, run once per demodulated frame.
    async fn on_frame(&self, frame: RxFrame) {
        // a valid CRC over a header of the wrong length is still a header failure
        let decoded = if frame.header_valid {
            PacketHeader::from_bytes(&frame.header).map(Some)
        } else {
            Ok(None)
        };
        let fully_valid = matches!(decoded, Ok(Some(_))) && frame.payload_valid;
        let (valid, total) = self
            .state
            .record(|s| {
                s.frames_received += 1;
                if fully_valid {
                    s.frames_valid += 1;
                }
                (s.frames_valid, s.frames_received)
            })
            .await;
        if total % self.status_every == 0 {
            info!("rx: {valid}/{total} valid frames");
        }

        let header = match decoded {
            Ok(Some(header)) => header,
            Ok(None) => {
                self.state.record(|s| s.header_crc_failures += 1).await;
                warn!("rx: header CRC failure ({valid}/{total})");
                return;
            }
            Err(e) => {
                self.state.record(|s| s.header_crc_failures += 1).await;
                warn!("rx: undecodable header: {e}");
                return;
            }
        };

        if !frame.payload_valid {
            self.state.record(|s| s.payload_crc_failures += 1).await;
            warn!(
                "rx: payload CRC failure on packet {} ({valid}/{total})",
                header.packet_id
            );
            return;
        }

        debug!("rx: {header} ({valid}/{total})");
        let mut header_bytes = [0u8; HEADER_LEN];
        header_bytes.copy_from_slice(&frame.header);
        self.state
            .publish_inbound(InboundFrame {
                header_bytes,
                payload: frame.payload,
                header_valid: frame.header_valid,
                payload_valid: frame.payload_valid,
                header,
            })
            .await;
    }

    async fn fault(&self, detail: String) {
        let reason = ShutdownReason::TransportFault {
            worker: Worker::Receive,
            detail,
        };
        if self.escalate.send(reason).await.is_err() {
            warn!("rx: control loop gone, fault not escalated");
        }
    }
}

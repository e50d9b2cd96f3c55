//! Shared link state.
//!
//! Every field sits behind a guard. The outbound and inbound slots each pair a
//! [`Mutex`] with a [`Notify`]; the shutdown flag lives in a [`watch`] channel,
//! whose internal lock is its guard and whose change notification lets the
//! receive worker race hardware reads against shutdown.
//!
//! Waiters arm their notification before checking the predicate and re-check
//! it after every wakeup, so a stale permit or a broadcast only costs one extra
//! pass through the loop.

use std::pin::pin;

use crlink_core::{PacketHeader, Payload, HEADER_LEN};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Notify};

use crate::ShutdownReason;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundPacket {
    pub header: PacketHeader,
    pub header_bytes: [u8; HEADER_LEN],
    pub payload: Payload,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundFrame {
    pub header_bytes: [u8; HEADER_LEN],
    pub payload: Payload,
    pub header_valid: bool,
    pub payload_valid: bool,
    pub header: PacketHeader,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub frames_received: u64,
    pub frames_valid: u64,
    pub header_crc_failures: u64,
    pub payload_crc_failures: u64,
    pub rx_overruns: u64,
    pub frames_transmitted: u64,
    pub tx_underruns: u64,
    pub data_sent: u64,
    pub retransmissions: u64,
    pub ack_timeouts: u64,
    pub ack_mismatches: u64,
    pub packets_acked: u64,
    pub acks_sent: u64,
    pub duplicates: u64,
}

#[derive(Debug, Default)]
struct OutboundSlot {
    pending: Option<OutboundPacket>,
}

#[derive(Debug, Default)]
struct InboundSlot {
    latest: Option<InboundFrame>,
    fresh: bool,
}

#[derive(Debug)]
pub struct LinkState {
    outbound: Mutex<OutboundSlot>,
    outbound_ready: Notify,
    inbound: Mutex<InboundSlot>,
    inbound_ready: Notify,
    stats: Mutex<LinkStats>,
    shutdown: watch::Sender<Option<ShutdownReason>>,
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkState {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(None);
        Self {
            outbound: Mutex::new(OutboundSlot::default()),
            outbound_ready: Notify::new(),
            inbound: Mutex::new(InboundSlot::default()),
            inbound_ready: Notify::new(),
            stats: Mutex::new(LinkStats::default()),
            shutdown,
        }
    }

    /// Fill the outbound slot and wake the transmit worker.
    ///
    /// A packet the transmit worker has not picked up yet is overwritten.
    pub async fn post_outbound(&self, header: PacketHeader, payload: Payload) {
        let packet = OutboundPacket {
            header,
            header_bytes: header.to_bytes(),
            payload,
        };
        {
            let mut slot = self.outbound.lock().await;
            if let Some(stale) = slot.pending.replace(packet) {
                debug!("outbound slot overwritten before transmit: {}", stale.header);
            }
        }
        self.outbound_ready.notify_one();
    }

    /// Wait for the next outbound packet. `None` once shutdown is requested.
    pub async fn next_outbound(&self) -> Option<OutboundPacket> {
        loop {
            let mut notified = pin!(self.outbound_ready.notified());
            notified.as_mut().enable();

            if self.is_shutdown() {
                return None;
            }
            if let Some(packet) = self.outbound.lock().await.pending.take() {
                return Some(packet);
            }
            notified.await;
        }
    }

    /// Overwrite the inbound slot with a decoded frame and wake the packet manager.
    pub async fn publish_inbound(&self, frame: InboundFrame) {
        {
            let mut slot = self.inbound.lock().await;
            trace!("inbound slot <- {}", frame.header);
            slot.latest = Some(frame);
            slot.fresh = true;
        }
        self.inbound_ready.notify_one();
    }

    /// Wait for a frame published after the last call. `None` once shutdown is requested.
    pub async fn next_inbound(&self) -> Option<InboundFrame> {
        loop {
            let mut notified = pin!(self.inbound_ready.notified());
            notified.as_mut().enable();

            if self.is_shutdown() {
                return None;
            }
            {
                let mut slot = self.inbound.lock().await;
                if slot.fresh {
                    slot.fresh = false;
                    return slot.latest.clone();
                }
            }
            notified.await;
        }
    }

    /// Mark whatever sits in the inbound slot as already seen.
    pub async fn discard_inbound(&self) {
        let mut slot = self.inbound.lock().await;
        if slot.fresh {
            if let Some(stale) = &slot.latest {
                debug!("discarding stale inbound {}", stale.header);
            }
            slot.fresh = false;
        }
    }

    pub async fn latest_inbound(&self) -> Option<InboundFrame> {
        self.inbound.lock().await.latest.clone()
    }

    /// Update the counters under their guard and return whatever `f` returns.
    pub async fn record<R>(&self, f: impl FnOnce(&mut LinkStats) -> R) -> R {
        let mut stats = self.stats.lock().await;
        f(&mut stats)
    }

    pub async fn stats(&self) -> LinkStats {
        self.stats.lock().await.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.borrow().is_some()
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.shutdown.borrow().clone()
    }

    /// Resolves once shutdown has been requested.
    pub async fn halted(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|reason| reason.is_some()).await;
    }

    /// Set the shutdown flag, then wake every waiter on both slots.
    ///
    /// Returns `false` if shutdown was already requested; the first reason wins.
    pub(crate) fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        let set = self.shutdown.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if set {
            self.outbound_ready.notify_waiters();
            self.outbound_ready.notify_one();
            self.inbound_ready.notify_waiters();
            self.inbound_ready.notify_one();
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crlink_core::{Address, PAYLOAD_LEN};
    use tokio::time::timeout;

    use super::*;

    fn frame(packet_id: u8) -> InboundFrame {
        let header = PacketHeader::data(Address::node(1), Address::node(2), packet_id);
        InboundFrame {
            header_bytes: header.to_bytes(),
            payload: [packet_id; PAYLOAD_LEN],
            header_valid: true,
            payload_valid: true,
            header,
        }
    }

    #[tokio::test]
    async fn outbound_is_taken_once() {
        let state = LinkState::new();
        let header = PacketHeader::data(Address::node(1), Address::BROADCAST, 3);
        state.post_outbound(header, [7; PAYLOAD_LEN]).await;

        let packet = state.next_outbound().await.unwrap();
        assert_eq!(packet.header, header);
        assert_eq!(packet.header_bytes, header.to_bytes());

        let again = timeout(Duration::from_millis(50), state.next_outbound()).await;
        assert!(again.is_err(), "slot must be empty after one take");
    }

    #[tokio::test]
    async fn latest_post_wins() {
        let state = LinkState::new();
        for id in 1..=3 {
            let header = PacketHeader::data(Address::node(1), Address::BROADCAST, id);
            state.post_outbound(header, [0; PAYLOAD_LEN]).await;
        }
        assert_eq!(state.next_outbound().await.unwrap().header.packet_id, 3);
    }

    #[tokio::test]
    async fn waiter_wakes_on_publish() {
        let state = Arc::new(LinkState::new());
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.next_inbound().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        state.publish_inbound(frame(9)).await;

        let got = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got.map(|f| f.header.packet_id), Some(9));
    }

    #[tokio::test]
    async fn discarded_frame_is_not_delivered() {
        let state = LinkState::new();
        state.publish_inbound(frame(4)).await;
        state.discard_inbound().await;

        let res = timeout(Duration::from_millis(50), state.next_inbound()).await;
        assert!(res.is_err());
        assert_eq!(state.latest_inbound().await.map(|f| f.header.packet_id), Some(4));
    }

    #[tokio::test]
    async fn shutdown_releases_all_waiters() {
        let state = Arc::new(LinkState::new());
        let tx = {
            let state = state.clone();
            tokio::spawn(async move { state.next_outbound().await })
        };
        let rx = {
            let state = state.clone();
            tokio::spawn(async move { state.next_inbound().await })
        };
        let halted = {
            let state = state.clone();
            tokio::spawn(async move { state.halted().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(state.request_shutdown(ShutdownReason::Cancelled));
        assert!(!state.request_shutdown(ShutdownReason::DurationElapsed));

        let deadline = Duration::from_secs(1);
        assert_eq!(timeout(deadline, tx).await.unwrap().unwrap(), None);
        assert_eq!(timeout(deadline, rx).await.unwrap().unwrap(), None);
        timeout(deadline, halted).await.unwrap().unwrap();
        assert_eq!(state.shutdown_reason(), Some(ShutdownReason::Cancelled));
    }

    #[tokio::test]
    async fn record_returns_snapshot() {
        let state = LinkState::new();
        let total = state
            .record(|s| {
                s.frames_received += 2;
                s.frames_received
            })
            .await;
        assert_eq!(total, 2);
        assert_eq!(state.stats().await.frames_received, 2);
    }
}

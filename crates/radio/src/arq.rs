//! Packet manager: stop-and-wait ARQ on top of the shared link state.
//!
//! Master: `PREPARE -> SEND -> AWAIT_ACK -> DONE`, one unacknowledged data
//! packet at a time. A timeout, a non-ack frame or an ack for another id all
//! send the same packet again.
//!
//! Slave: `WAIT_DATA -> ACK`. Every data frame is acknowledged, duplicates
//! included; duplicates are only counted.

use std::sync::Arc;
use std::time::Duration;

use crlink_core::{Address, PacketHeader, PacketId, PacketType, Payload, PAYLOAD_LEN};
use log::{debug, info, trace, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use crate::state::LinkState;
use crate::{LinkConfig, LinkError, Role, ShutdownReason};

/// Ack timeout and retry limits for the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub ack_timeout: Duration,
    /// Transmissions per packet before giving up; `None` or `Some(0)` retries forever.
    pub max_attempts: Option<u32>,
    /// Timeout multiplier applied after each unanswered attempt.
    pub backoff_factor: u32,
    pub max_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(1),
            max_attempts: Some(64),
            backoff_factor: 1,
            max_timeout: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            ..Default::default()
        }
    }

    /// Ack timeout for the attempt numbered `attempt` (zero based).
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1);
        if factor == 1 {
            return self.ack_timeout;
        }
        let mut wait = self.ack_timeout;
        for _ in 0..attempt {
            if wait >= self.max_timeout {
                break;
            }
            wait = wait.saturating_mul(factor);
        }
        wait.min(self.max_timeout.max(self.ack_timeout))
    }

    /// Whether another transmission is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts
            .filter(|&max| max > 0)
            .map_or(true, |max| attempts < max)
    }
}

/// Where data payloads come from.
pub trait PayloadSource: Send + Sync {
    fn next_payload(&mut self, packet_id: PacketId) -> Payload;
}

/// Pseudo-random payloads standing in for application data.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPayload;

impl PayloadSource for RandomPayload {
    fn next_payload(&mut self, _packet_id: PacketId) -> Payload {
        let mut payload = [0u8; PAYLOAD_LEN];
        rand::rng().fill(&mut payload[..]);
        payload
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MasterState {
    Prepare,
    Send,
    AwaitAck,
    Done,
}

/// Progress of one data packet through the master state machine. Exhaustion
/// is reported as [`LinkError::RetriesExhausted`] instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArqSession {
    pub packet_id: PacketId,
    pub attempts: u32,
}

impl ArqSession {
    fn new(packet_id: PacketId) -> Self {
        Self {
            packet_id,
            attempts: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AckCheck {
    Accepted,
    WrongType(PacketType),
    WrongId(PacketId),
}

fn check_ack(header: &PacketHeader, expected: PacketId) -> AckCheck {
    if header.packet_type != PacketType::Ack {
        AckCheck::WrongType(header.packet_type)
    } else if header.packet_id != expected {
        AckCheck::WrongId(header.packet_id)
    } else {
        AckCheck::Accepted
    }
}

pub struct PacketManager {
    state: Arc<LinkState>,
    role: Role,
    own: Address,
    peer: Address,
    retry: RetryPolicy,
    max_packets: Option<u64>,
    payloads: Box<dyn PayloadSource>,
    escalate: mpsc::Sender<ShutdownReason>,
}

impl PacketManager {
    pub fn new(
        state: Arc<LinkState>,
        config: &LinkConfig,
        payloads: Box<dyn PayloadSource>,
        escalate: mpsc::Sender<ShutdownReason>,
    ) -> Self {
        Self {
            state,
            role: config.role,
            own: Address::node(config.node_id),
            peer: config.peer.map_or(Address::BROADCAST, Address::node),
            retry: config.retry.clone(),
            max_packets: config.max_packets,
            payloads,
            escalate,
        }
    }

    pub async fn run(mut self) {
        info!("pm started, mode: {}, node {}", self.role, self.own);
        let outcome = match self.role {
            Role::Master => self.run_master().await,
            Role::Slave => {
                self.run_slave().await;
                None
            }
        };
        if let Some(reason) = outcome {
            if self.escalate.send(reason).await.is_err() {
                warn!("pm: control loop gone, outcome not escalated");
            }
        }
        info!("pm stopped");
    }

    async fn run_master(&mut self) -> Option<ShutdownReason> {
        let mut packet_id: PacketId = 0;
        let mut acked = 0u64;

        while !self.state.is_shutdown() {
            if self.max_packets.is_some_and(|max| acked >= max) {
                info!("pm: {acked} packets acknowledged, done");
                return Some(ShutdownReason::Completed { packets: acked });
            }

            trace!("pm: {:?}", MasterState::Prepare);
            packet_id = packet_id.wrapping_add(1);
            match self.send_reliable(packet_id).await {
                Ok(session) => {
                    trace!("pm: {:?} after {} attempt(s)", MasterState::Done, session.attempts);
                    acked += 1;
                }
                Err(LinkError::RetriesExhausted { packet_id, attempts }) => {
                    warn!("pm: giving up on packet {packet_id} after {attempts} attempts");
                    return Some(ShutdownReason::LinkFailure { packet_id, attempts });
                }
                Err(_) => break,
            }
        }
        None
    }

    /// SEND / AWAIT_ACK until `packet_id` is acknowledged.
    async fn send_reliable(&mut self, packet_id: PacketId) -> Result<ArqSession, LinkError> {
        let mut session = ArqSession::new(packet_id);
        let header = PacketHeader::data(self.own, self.peer, packet_id);
        let payload = self.payloads.next_payload(packet_id);

        loop {
            if self.state.is_shutdown() {
                return Err(LinkError::Shutdown);
            }
            if !self.retry.allows(session.attempts) {
                return Err(LinkError::RetriesExhausted {
                    packet_id,
                    attempts: session.attempts,
                });
            }

            trace!("pm: {:?}", MasterState::Send);
            info!("pm: transmitting packet {packet_id} (attempt {})", session.attempts);
            self.state.discard_inbound().await;
            self.state.post_outbound(header, payload).await;
            let retransmit = session.attempts > 0;
            self.state
                .record(|s| {
                    s.data_sent += 1;
                    if retransmit {
                        s.retransmissions += 1;
                    }
                })
                .await;
            let wait = self.retry.timeout_for(session.attempts);
            session.attempts += 1;

            trace!("pm: {:?} for {wait:?}", MasterState::AwaitAck);
            if self.await_ack(packet_id, Instant::now() + wait).await? {
                self.state.record(|s| s.packets_acked += 1).await;
                info!("pm: received ack on packet {packet_id}");
                return Ok(session);
            }
            self.state.record(|s| s.ack_timeouts += 1).await;
            warn!("pm: ack timeout on packet {packet_id}");
        }
    }

    /// AWAIT_ACK for one attempt. Frames that are not the expected ack are
    /// counted and skipped; only the deadline sends the packet again.
    async fn await_ack(&self, packet_id: PacketId, deadline: Instant) -> Result<bool, LinkError> {
        loop {
            let frame = match timeout_at(deadline, self.state.next_inbound()).await {
                Err(_) => return Ok(false),
                Ok(None) => return Err(LinkError::Shutdown),
                Ok(Some(frame)) => frame,
            };

            match check_ack(&frame.header, packet_id) {
                AckCheck::Accepted => return Ok(true),
                AckCheck::WrongType(packet_type) => {
                    self.state.record(|s| s.ack_mismatches += 1).await;
                    warn!("pm: wrong packet type {packet_type} (expecting ACK)");
                }
                AckCheck::WrongId(received) => {
                    self.state.record(|s| s.ack_mismatches += 1).await;
                    warn!("pm: wrong packet id (received {received}, expected {packet_id})");
                }
            }
        }
    }

    async fn run_slave(&mut self) {
        let mut last_data: Option<PacketId> = None;

        while let Some(frame) = self.state.next_inbound().await {
            let header = frame.header;
            debug!("pm: received {header}");

            if header.packet_type != PacketType::Data {
                debug!("pm: ignoring {} frame", header.packet_type);
                continue;
            }

            let duplicate = last_data == Some(header.packet_id);
            if duplicate {
                debug!("pm: duplicate data packet {}", header.packet_id);
            }
            last_data = Some(header.packet_id);

            info!("pm: transmitting ack on packet {}", header.packet_id);
            let ack = PacketHeader::ack_for(self.own, &header);
            self.state.post_outbound(ack, [0u8; PAYLOAD_LEN]).await;
            self.state
                .record(|s| {
                    s.acks_sent += 1;
                    if duplicate {
                        s.duplicates += 1;
                    }
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_timeout_by_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.timeout_for(0), Duration::from_secs(1));
        assert_eq!(policy.timeout_for(10), Duration::from_secs(1));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy {
            ack_timeout: Duration::from_millis(100),
            backoff_factor: 2,
            max_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(policy.timeout_for(0), Duration::from_millis(100));
        assert_eq!(policy.timeout_for(1), Duration::from_millis(200));
        assert_eq!(policy.timeout_for(2), Duration::from_millis(400));
        assert_eq!(policy.timeout_for(3), Duration::from_millis(500));
        assert_eq!(policy.timeout_for(1000), Duration::from_millis(500));
    }

    #[test]
    fn attempt_limit() {
        let capped = RetryPolicy {
            max_attempts: Some(3),
            ..Default::default()
        };
        assert!(capped.allows(2));
        assert!(!capped.allows(3));
        assert!(RetryPolicy::unbounded().allows(u32::MAX - 1));
    }

    #[test]
    fn zero_attempt_cap_means_unbounded() {
        let policy = RetryPolicy {
            max_attempts: Some(0),
            ..Default::default()
        };
        assert!(policy.allows(0));
        assert!(policy.allows(1_000));
    }

    #[test]
    fn constant_timeout_for_any_attempt() {
        let policy = RetryPolicy {
            ack_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        assert_eq!(policy.timeout_for(u32::MAX), Duration::from_millis(300));

        let doubling = RetryPolicy {
            backoff_factor: 2,
            ..policy
        };
        assert_eq!(doubling.timeout_for(u32::MAX), Duration::from_secs(8));
    }

    #[test]
    fn ack_check_distinguishes_failures() {
        let own = Address::node(1);
        let data = PacketHeader::data(own, Address::BROADCAST, 5);
        let ack5 = PacketHeader::ack_for(Address::node(2), &data);
        let mut ack4 = ack5;
        ack4.packet_id = 4;

        assert_eq!(check_ack(&ack5, 5), AckCheck::Accepted);
        assert_eq!(check_ack(&ack4, 5), AckCheck::WrongId(4));
        assert_eq!(check_ack(&data, 5), AckCheck::WrongType(PacketType::Data));
    }

    #[test]
    fn random_payload_is_full_length() {
        let payload = RandomPayload.next_payload(1);
        assert_eq!(payload.len(), PAYLOAD_LEN);
    }
}

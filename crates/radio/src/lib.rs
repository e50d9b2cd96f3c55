//! link-layer coordination engine for the crlink half-duplex radio link

use std::fmt;
use std::time::Duration;

use crlink_core::{NodeId, PacketId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod arq;
pub mod control;
pub mod frontend;
pub mod link;
pub mod rx;
pub mod simulated;
pub mod state;
pub mod tx;
pub mod udp;

pub use arq::{ArqSession, PacketManager, PayloadSource, RandomPayload, RetryPolicy};
pub use control::{ControlLoop, ControlPolicy, Decision, NoAdaptation};
pub use frontend::{Direction, RadioFrontEnd, RxBlock, RxFrame, TransportError, TxReport};
pub use link::{Link, LinkHandle, LinkReport};
pub use simulated::{ChannelConfig, ChannelStats, Fate, SimulatedRadio};
pub use state::{InboundFrame, LinkState, LinkStats, OutboundPacket};
pub use udp::UdpRadio;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no ack for packet {packet_id} after {attempts} attempts")]
    RetriesExhausted { packet_id: PacketId, attempts: u32 },

    #[error("transport fault: {0}")]
    Transport(#[from] TransportError),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("link is shutting down")]
    Shutdown,
}

/// The concurrently running parts of a link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Worker {
    Transmit,
    Receive,
    PacketManager,
    Control,
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Worker::Transmit => "tx",
            Worker::Receive => "rx",
            Worker::PacketManager => "pm",
            Worker::Control => "ce",
        };
        f.write_str(name)
    }
}

/// Why a link stopped. Only the control loop turns one of these into the
/// shutdown flag; workers escalate theirs over a channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownReason {
    Cancelled,
    DurationElapsed,
    Completed { packets: u64 },
    TransportFault { worker: Worker, detail: String },
    LinkFailure { packet_id: PacketId, attempts: u32 },
    Policy(String),
}

impl ShutdownReason {
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            ShutdownReason::TransportFault { .. } | ShutdownReason::LinkFailure { .. }
        )
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Cancelled => write!(f, "cancelled"),
            ShutdownReason::DurationElapsed => write!(f, "run duration elapsed"),
            ShutdownReason::Completed { packets } => write!(f, "completed {packets} packets"),
            ShutdownReason::TransportFault { worker, detail } => {
                write!(f, "transport fault in {worker}: {detail}")
            }
            ShutdownReason::LinkFailure { packet_id, attempts } => {
                write!(f, "link failure: packet {packet_id} unacked after {attempts} attempts")
            }
            ShutdownReason::Policy(why) => write!(f, "policy: {why}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Master,
    Slave,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => write!(f, "master"),
            Role::Slave => write!(f, "slave"),
        }
    }
}

/// Front-end settings applied once before the workers start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioSettings {
    pub center_freq_hz: f64,
    pub tx_gain: f32,
    pub rx_gain: f32,
}

impl Default for RadioSettings {
    fn default() -> Self {
        Self {
            center_freq_hz: 462e6,
            tx_gain: 8000.0,
            rx_gain: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub node_id: NodeId,
    pub role: Role,
    /// Destination for data packets; broadcast when unset.
    pub peer: Option<NodeId>,
    pub retry: RetryPolicy,
    pub radio: RadioSettings,
    pub run_for: Option<Duration>,
    pub status_interval: Duration,
    /// Receive worker logs valid/total every this many frames.
    pub status_every: u64,
    /// Master stops after this many acknowledged packets.
    pub max_packets: Option<u64>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            node_id: rand::random(),
            role: Role::Slave,
            peer: None,
            retry: RetryPolicy::default(),
            radio: RadioSettings::default(),
            run_for: None,
            status_interval: Duration::from_secs(5),
            status_every: 100,
            max_packets: None,
        }
    }
}

impl LinkConfig {
    pub fn master(node_id: NodeId) -> Self {
        Self {
            node_id,
            role: Role::Master,
            ..Default::default()
        }
    }

    pub fn slave(node_id: NodeId) -> Self {
        Self {
            node_id,
            role: Role::Slave,
            ..Default::default()
        }
    }
}

//! Boundary with the radio front end (modulator, frame sync, RF hardware).

use async_trait::async_trait;
use crlink_core::{Payload, HEADER_LEN};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },

    #[error("device error: {0}")]
    Device(String),

    #[error("socket io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("front end closed")]
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxReport {
    pub underrun: bool,
}

/// One demodulated frame with the validity flags from the frame synchronizer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RxFrame {
    pub header: Vec<u8>,
    pub header_valid: bool,
    pub payload: Payload,
    pub payload_valid: bool,
}

/// Everything the synchronizer produced from one block of samples.
#[derive(Clone, Debug, Default)]
pub struct RxBlock {
    pub frames: Vec<RxFrame>,
    pub overrun: bool,
}

/// Half-duplex front end shared by the transmit and receive workers.
///
/// `transmit` and `receive` block the calling worker until the hardware call
/// completes. `receive` must come back within a bounded time even on a silent
/// channel (an empty block is fine), so the receive worker keeps observing
/// shutdown.
#[async_trait]
pub trait RadioFrontEnd: Send + Sync {
    async fn set_frequency(&self, hz: f64) -> Result<(), TransportError>;

    async fn set_gain(&self, tx_gain: f32, rx_gain: f32) -> Result<(), TransportError>;

    async fn start(&self, direction: Direction) -> Result<(), TransportError>;

    async fn stop(&self, direction: Direction) -> Result<(), TransportError>;

    async fn transmit(
        &self,
        header: &[u8; HEADER_LEN],
        payload: &Payload,
    ) -> Result<TxReport, TransportError>;

    async fn receive(&self) -> Result<RxBlock, TransportError>;
}

//! Front end that carries frames as UDP datagrams, one datagram per frame.
//!
//! Stands in for the SDR transport when two nodes run on ordinary hosts. Each
//! section of the frame carries its own checksum so the receiver can report
//! header and payload validity the way a frame synchronizer does.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use crlink_core::{Payload, HEADER_LEN, PAYLOAD_LEN};
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::frontend::{Direction, RadioFrontEnd, RxBlock, RxFrame, TransportError, TxReport};

const MAX_DATAGRAM: usize = 512;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Datagram {
    header: [u8; HEADER_LEN],
    header_check: u16,
    payload: Vec<u8>,
    payload_check: u16,
}

impl Datagram {
    fn new(header: &[u8; HEADER_LEN], payload: &Payload) -> Self {
        Self {
            header: *header,
            header_check: checksum(header),
            payload: payload.to_vec(),
            payload_check: checksum(payload),
        }
    }

    fn into_frame(self) -> RxFrame {
        let header_valid = checksum(&self.header) == self.header_check;
        let mut payload = [0u8; PAYLOAD_LEN];
        let payload_valid = self.payload.len() == PAYLOAD_LEN
            && checksum(&self.payload) == self.payload_check;
        if payload_valid {
            payload.copy_from_slice(&self.payload);
        }
        RxFrame {
            header: self.header.to_vec(),
            header_valid,
            payload,
            payload_valid,
        }
    }
}

/// Ones' complement sum of big-endian 16-bit words, odd byte padded with zero.
fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|w| u32::from(u16::from_be_bytes([w[0], *w.get(1).unwrap_or(&0)])))
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

pub struct UdpRadio {
    socket: UdpSocket,
    peer: SocketAddr,
    block_interval: Duration,
}

impl UdpRadio {
    pub async fn bind(local: SocketAddr, peer: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(local).await?;
        info!("udp front end on {} -> {}", socket.local_addr()?, peer);
        Ok(Self {
            socket,
            peer,
            block_interval: Duration::from_millis(100),
        })
    }

    pub fn with_block_interval(mut self, block_interval: Duration) -> Self {
        self.block_interval = block_interval;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl RadioFrontEnd for UdpRadio {
    async fn set_frequency(&self, hz: f64) -> Result<(), TransportError> {
        debug!("udp: ignoring center frequency {:.3} MHz", hz / 1e6);
        Ok(())
    }

    async fn set_gain(&self, tx_gain: f32, rx_gain: f32) -> Result<(), TransportError> {
        debug!("udp: ignoring gains tx {tx_gain} rx {rx_gain}");
        Ok(())
    }

    async fn start(&self, direction: Direction) -> Result<(), TransportError> {
        debug!("udp: {direction:?} started");
        Ok(())
    }

    async fn stop(&self, direction: Direction) -> Result<(), TransportError> {
        debug!("udp: {direction:?} stopped");
        Ok(())
    }

    async fn transmit(
        &self,
        header: &[u8; HEADER_LEN],
        payload: &Payload,
    ) -> Result<TxReport, TransportError> {
        let bytes = bincode::serde::encode_to_vec(
            Datagram::new(header, payload),
            bincode::config::standard(),
        )
        .map_err(|e| TransportError::Device(e.to_string()))?;

        let written = self.socket.send_to(&bytes, self.peer).await?;
        if written != bytes.len() {
            return Err(TransportError::ShortWrite {
                expected: bytes.len(),
                written,
            });
        }
        trace!("udp: sent {written} bytes to {}", self.peer);
        Ok(TxReport::default())
    }

    async fn receive(&self) -> Result<RxBlock, TransportError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let mut block = RxBlock::default();

        let (n, from) = match timeout(self.block_interval, self.socket.recv_from(&mut buf)).await {
            Err(_) => return Ok(block),
            Ok(res) => res?,
        };
        match bincode::serde::decode_from_slice::<Datagram, _>(&buf[..n], bincode::config::standard()) {
            Ok((datagram, _)) => block.frames.push(datagram.into_frame()),
            // no frame sync: nothing the decode callback could see
            Err(e) => debug!("udp: undecodable datagram from {from}: {e}"),
        }
        Ok(block)
    }
}

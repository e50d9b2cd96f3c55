//! Wires the four workers around one shared [`LinkState`].

use std::sync::Arc;

use log::info;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::arq::{PacketManager, PayloadSource, RandomPayload};
use crate::control::{ControlLoop, ControlPolicy, NoAdaptation};
use crate::frontend::RadioFrontEnd;
use crate::rx::ReceiveWorker;
use crate::state::{LinkState, LinkStats};
use crate::tx::TransmitWorker;
use crate::{LinkConfig, LinkError, ShutdownReason};

pub struct Link {
    config: LinkConfig,
    radio: Arc<dyn RadioFrontEnd>,
    payloads: Box<dyn PayloadSource>,
    policy: Box<dyn ControlPolicy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkReport {
    pub reason: ShutdownReason,
    pub stats: LinkStats,
}

pub struct LinkHandle {
    state: Arc<LinkState>,
    control: JoinHandle<ShutdownReason>,
    tx: JoinHandle<()>,
    rx: JoinHandle<()>,
    pm: JoinHandle<()>,
}

impl Link {
    pub fn new(config: LinkConfig, radio: Arc<dyn RadioFrontEnd>) -> Self {
        Self {
            config,
            radio,
            payloads: Box::new(RandomPayload),
            policy: Box::new(NoAdaptation),
        }
    }

    pub fn with_payloads(mut self, payloads: impl PayloadSource + 'static) -> Self {
        self.payloads = Box::new(payloads);
        self
    }

    pub fn with_policy(mut self, policy: impl ControlPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Configure the front end and start all workers. `cancel` is the external
    /// trigger handed to the control loop.
    pub async fn spawn(self, cancel: CancellationToken) -> Result<LinkHandle, LinkError> {
        let Link {
            config,
            radio,
            payloads,
            policy,
        } = self;

        radio.set_frequency(config.radio.center_freq_hz).await?;
        radio
            .set_gain(config.radio.tx_gain, config.radio.rx_gain)
            .await?;

        info!(
            "link starting: node {:04x} as {}, {:.1} MHz",
            config.node_id,
            config.role,
            config.radio.center_freq_hz / 1e6
        );

        let state = Arc::new(LinkState::new());
        let (escalate, escalations) = mpsc::channel(8);

        let control = ControlLoop::new(
            state.clone(),
            cancel,
            escalations,
            config.run_for,
            config.status_interval,
            policy,
        );
        let tx = TransmitWorker::new(state.clone(), radio.clone(), escalate.clone());
        let rx = ReceiveWorker::new(
            state.clone(),
            radio.clone(),
            escalate.clone(),
            config.status_every,
        );
        let pm = PacketManager::new(state.clone(), &config, payloads, escalate);

        Ok(LinkHandle {
            state,
            control: tokio::spawn(control.run()),
            tx: tokio::spawn(tx.run()),
            rx: tokio::spawn(rx.run()),
            pm: tokio::spawn(pm.run()),
        })
    }
}

impl LinkHandle {
    pub fn state(&self) -> &Arc<LinkState> {
        &self.state
    }

    /// Wait for the control loop to stop the link and every worker to exit.
    pub async fn join(self) -> Result<LinkReport, LinkError> {
        let reason = self.control.await?;
        let (tx, rx, pm) = tokio::join!(self.tx, self.rx, self.pm);
        tx?;
        rx?;
        pm?;

        let stats = self.state.stats().await;
        info!("link stopped ({reason})");
        Ok(LinkReport { reason, stats })
    }
}

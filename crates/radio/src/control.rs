//! Control loop ("cognitive engine"): the only place that sets the shutdown flag.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::state::{LinkState, LinkStats};
use crate::ShutdownReason;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Continue,
    Shutdown(String),
}

/// Hook for adaptive behaviour, consulted on every status tick.
pub trait ControlPolicy: Send {
    fn observe(&mut self, stats: &LinkStats) -> Decision;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoAdaptation;

impl ControlPolicy for NoAdaptation {
    fn observe(&mut self, _stats: &LinkStats) -> Decision {
        Decision::Continue
    }
}

pub struct ControlLoop {
    state: Arc<LinkState>,
    cancel: CancellationToken,
    escalations: mpsc::Receiver<ShutdownReason>,
    run_for: Option<Duration>,
    status_interval: Duration,
    policy: Box<dyn ControlPolicy>,
}

impl ControlLoop {
    pub fn new(
        state: Arc<LinkState>,
        cancel: CancellationToken,
        escalations: mpsc::Receiver<ShutdownReason>,
        run_for: Option<Duration>,
        status_interval: Duration,
        policy: Box<dyn ControlPolicy>,
    ) -> Self {
        Self {
            state,
            cancel,
            escalations,
            run_for,
            status_interval,
            policy,
        }
    }

    pub async fn run(mut self) -> ShutdownReason {
        let deadline = self.run_for.map(|d| Instant::now() + d);
        let mut status = tokio::time::interval(self.status_interval.max(Duration::from_millis(1)));
        status.set_missed_tick_behavior(MissedTickBehavior::Skip);
        status.tick().await;

        let reason = loop {
            tokio::select! {
                () = self.cancel.cancelled() => break ShutdownReason::Cancelled,
                () = expiry(deadline) => break ShutdownReason::DurationElapsed,
                Some(reason) = self.escalations.recv() => break reason,
                _ = status.tick() => {
                    let stats = self.state.stats().await;
                    report(&stats);
                    if let Decision::Shutdown(why) = self.policy.observe(&stats) {
                        break ShutdownReason::Policy(why);
                    }
                }
            }
        };

        if reason.is_fault() {
            warn!("ce: shutting down link: {reason}");
        } else {
            info!("ce: shutting down link: {reason}");
        }
        self.state.request_shutdown(reason.clone());
        report(&self.state.stats().await);
        reason
    }
}

async fn expiry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn report(stats: &LinkStats) {
    info!(
        "status: {}/{} valid frames, {} acked, {} retransmitted, {} acks sent",
        stats.frames_valid,
        stats.frames_received,
        stats.packets_acked,
        stats.retransmissions,
        stats.acks_sent
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(
        state: &Arc<LinkState>,
        cancel: &CancellationToken,
        run_for: Option<Duration>,
        policy: Box<dyn ControlPolicy>,
    ) -> (ControlLoop, mpsc::Sender<ShutdownReason>) {
        let (tx, rx) = mpsc::channel(4);
        let ce = ControlLoop::new(
            state.clone(),
            cancel.clone(),
            rx,
            run_for,
            Duration::from_millis(10),
            policy,
        );
        (ce, tx)
    }

    #[tokio::test]
    async fn external_cancel_sets_flag() {
        let state = Arc::new(LinkState::new());
        let cancel = CancellationToken::new();
        let (ce, _tx) = control(&state, &cancel, None, Box::new(NoAdaptation));
        let handle = tokio::spawn(ce.run());

        assert!(!state.is_shutdown());
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), ShutdownReason::Cancelled);
        assert_eq!(state.shutdown_reason(), Some(ShutdownReason::Cancelled));
    }

    #[tokio::test]
    async fn run_duration_expires() {
        let state = Arc::new(LinkState::new());
        let cancel = CancellationToken::new();
        let (ce, _tx) = control(
            &state,
            &cancel,
            Some(Duration::from_millis(30)),
            Box::new(NoAdaptation),
        );
        assert_eq!(ce.run().await, ShutdownReason::DurationElapsed);
        assert!(state.is_shutdown());
    }

    #[tokio::test]
    async fn escalation_wins() {
        let state = Arc::new(LinkState::new());
        let cancel = CancellationToken::new();
        let (ce, tx) = control(&state, &cancel, None, Box::new(NoAdaptation));
        let reason = ShutdownReason::LinkFailure {
            packet_id: 3,
            attempts: 4,
        };
        tx.send(reason.clone()).await.unwrap();
        assert_eq!(ce.run().await, reason);
        assert_eq!(state.shutdown_reason(), Some(reason));
    }

    struct StopAfter(u32);

    impl ControlPolicy for StopAfter {
        fn observe(&mut self, _stats: &LinkStats) -> Decision {
            if self.0 == 0 {
                return Decision::Shutdown("enough".into());
            }
            self.0 -= 1;
            Decision::Continue
        }
    }

    #[tokio::test]
    async fn policy_can_stop_the_link() {
        let state = Arc::new(LinkState::new());
        let cancel = CancellationToken::new();
        let (ce, _tx) = control(&state, &cancel, None, Box::new(StopAfter(2)));
        assert_eq!(ce.run().await, ShutdownReason::Policy("enough".into()));
    }
}

//! Broker connection supervisor
//!
//! ```text
//! Disconnected ─► Connecting ─► Connected ─► (closed by peer) ─► Disconnected
//!       ▲              │                                              │
//!       └── backoff ◄──┘ (dial failed)            cancelled ─► Stopped
//! ```
//!
//! Dial failures are retried forever with a doubling, capped backoff until
//! the broker answers or the token is cancelled. A successful connection
//! resets the schedule.

use crate::broker::{BrokerConnector, BrokerSession};
use crate::config::BrokerConfig;
use crate::error::Error;
use crate::intake::{BatchIntakeLoop, IntakeExit};
use crate::metrics::{BROKER_CONNECT_ATTEMPTS, BROKER_STATE};
use crate::retry::{sleep_or_cancel, RetryConfig, RetryStrategy};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Broker connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    /// No connection, waiting to dial
    Disconnected,
    /// Dial in progress
    Connecting,
    /// Consuming
    Connected,
    /// Supervisor has exited
    Stopped,
}

impl SupervisorState {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Disconnected => "disconnected",
            SupervisorState::Connecting => "connecting",
            SupervisorState::Connected => "connected",
            SupervisorState::Stopped => "stopped",
        }
    }

    fn gauge_value(&self) -> i64 {
        match self {
            SupervisorState::Disconnected => 0,
            SupervisorState::Connecting => 1,
            SupervisorState::Connected => 2,
            SupervisorState::Stopped => 3,
        }
    }
}

/// Keeps one broker session alive and feeds it to the intake loop
pub struct ConnectionSupervisor {
    connector: Arc<dyn BrokerConnector>,
    intake: Arc<BatchIntakeLoop>,
    backoff: RetryStrategy,
    state: watch::Sender<SupervisorState>,
}

impl ConnectionSupervisor {
    /// Supervisor dialing through `connector`
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        intake: Arc<BatchIntakeLoop>,
        config: &BrokerConfig,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        Self {
            connector,
            intake,
            backoff: RetryStrategy::new(RetryConfig::unbounded(
                config.initial_backoff(),
                config.max_backoff(),
            )),
            state,
        }
    }

    /// Current state
    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SupervisorState) {
        BROKER_STATE.set(state.gauge_value());
        self.state.send_replace(state);
    }

    /// Dial until connected. Returns `None` only when cancelled.
    pub async fn connect_with_backoff(&self, cancel: &CancellationToken) -> Option<BrokerSession> {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return None;
            }
            self.set_state(SupervisorState::Connecting);

            let result = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = self.connector.connect() => result,
            };

            match result {
                Ok(session) => {
                    BROKER_CONNECT_ATTEMPTS.with_label_values(&["success"]).inc();
                    if attempt > 0 {
                        info!(attempts = attempt + 1, "Broker connection established after retries");
                    } else {
                        info!("Broker connection established");
                    }
                    return Some(session);
                }
                Err(e) => {
                    BROKER_CONNECT_ATTEMPTS.with_label_values(&["failure"]).inc();
                    let delay = self.backoff.calculate_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    self.set_state(SupervisorState::Disconnected);
                    warn!(
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        "Broker connection failed: {}",
                        e
                    );
                    if !sleep_or_cancel(delay, cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Supervise until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Connection supervisor started");

        while let Some(mut session) = self.connect_with_backoff(&cancel).await {
            self.set_state(SupervisorState::Connected);
            let exit = self.intake.run(&mut session, &cancel).await;
            session.close();
            self.set_state(SupervisorState::Disconnected);

            match exit {
                IntakeExit::Cancelled => break,
                IntakeExit::ConnectionLost(reason) => {
                    let err = Error::ConnectionClosed(reason);
                    error!(code = err.code(), "{}, reconnecting", err);
                }
                IntakeExit::StreamEnded => {
                    let delay = self.backoff.config().initial_delay;
                    warn!(
                        backoff_ms = delay.as_millis() as u64,
                        "Broker delivery stream ended, reconnecting"
                    );
                    if !sleep_or_cancel(delay, &cancel).await {
                        break;
                    }
                }
            }
        }

        self.set_state(SupervisorState::Stopped);
        info!("Connection supervisor stopped");
    }
}

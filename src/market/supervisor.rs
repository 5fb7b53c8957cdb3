use crate::market::registry::RegistrySlot;
use crate::market::transport::{BoxTransport, TransportEvent, TransportFactory};
use crate::market::types::{
    ConnectionKey, ConnectionState, ConnectionStatusSnapshot, ABNORMAL_CLOSURE_CODE,
    DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_DELAY_MS, NORMAL_CLOSURE_CODE,
};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    /// Doubles the base delay per attempt up to `cap`.
    Exponential { cap: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(
            DEFAULT_MAX_RECONNECT_ATTEMPTS,
            Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
        )
    }
}

impl ReconnectPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    /// Any abnormal close settles straight to `failed`.
    pub fn disabled() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { cap } => {
                let exponent = attempt.saturating_sub(1).min(16);
                self.delay.saturating_mul(1_u32 << exponent).min(cap)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Intentional close; no retry is scheduled.
    Settle,
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

/// Per-key connection state machine. Pure: the caller performs the I/O and
/// the timers and feeds lifecycle callbacks in here.
#[derive(Debug, Clone)]
pub struct Supervisor {
    key: ConnectionKey,
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempt: u32,
}

impl Supervisor {
    pub fn new(key: ConnectionKey, policy: ReconnectPolicy) -> Self {
        Self {
            key,
            policy,
            state: ConnectionState::Idle,
            attempt: 0,
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn transition(
        &mut self,
        state: ConnectionState,
        reason: Option<String>,
    ) -> ConnectionStatusSnapshot {
        self.state = state;
        ConnectionStatusSnapshot {
            key: self.key.clone(),
            state,
            attempt: self.attempt,
            reason,
        }
    }

    pub fn begin_connect(&mut self) -> ConnectionStatusSnapshot {
        let reason = if self.attempt == 0 {
            "opening stream".to_string()
        } else {
            format!("reconnect attempt {}", self.attempt)
        };
        self.transition(ConnectionState::Connecting, Some(reason))
    }

    pub fn on_connected(&mut self) -> ConnectionStatusSnapshot {
        self.attempt = 0;
        self.transition(ConnectionState::Connected, Some("stream connected".to_string()))
    }

    pub fn on_error(&mut self, reason: String) -> ConnectionStatusSnapshot {
        self.transition(ConnectionState::Error, Some(reason))
    }

    pub fn on_closed(
        &mut self,
        code: u16,
        reason: Option<String>,
    ) -> (ConnectionStatusSnapshot, CloseDisposition) {
        if code == NORMAL_CLOSURE_CODE {
            let snapshot = self.transition(ConnectionState::Disconnected, reason);
            return (snapshot, CloseDisposition::Settle);
        }

        if self.attempt >= self.policy.max_attempts {
            let reason = Some(format!(
                "gave up after {} reconnect attempts (last close code {code})",
                self.attempt
            ));
            let snapshot = self.transition(ConnectionState::Failed, reason);
            return (snapshot, CloseDisposition::GiveUp);
        }

        self.attempt += 1;
        let delay = self.policy.delay_for(self.attempt);
        let reason = Some(match reason {
            Some(reason) => format!("closed with code {code}: {reason}"),
            None => format!("closed with code {code}"),
        });
        let snapshot = self.transition(ConnectionState::Reconnecting, reason);
        (
            snapshot,
            CloseDisposition::Retry {
                attempt: self.attempt,
                delay,
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Status(ConnectionStatusSnapshot),
    Frame(String),
}

/// Everything one supervised key needs to publish into the outside world.
pub(crate) struct SupervisedLink {
    pub supervisor: Supervisor,
    pub slot: RegistrySlot,
    pub events: mpsc::Sender<StreamEvent>,
    pub cancel: CancellationToken,
}

impl SupervisedLink {
    async fn deliver(&self, event: StreamEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    async fn publish(&self, snapshot: ConnectionStatusSnapshot) -> bool {
        if !self.slot.record_status(&snapshot) {
            return false;
        }
        self.deliver(StreamEvent::Status(snapshot)).await
    }
}

enum LinkExit {
    Closed { code: u16, reason: Option<String> },
    Teardown,
}

/// Drives one key until it settles, gives up, or is torn down, then frees its
/// registry slot unless the key was already closed or reopened.
pub(crate) async fn supervise(link: SupervisedLink, factory: Arc<dyn TransportFactory>) {
    let slot = link.slot.clone();
    drive(link, factory).await;
    slot.release();
}

async fn drive(mut link: SupervisedLink, factory: Arc<dyn TransportFactory>) {
    let endpoint = factory.endpoint().to_string();

    loop {
        let snapshot = link.supervisor.begin_connect();
        if !link.publish(snapshot).await {
            return;
        }

        let connect_result = tokio::select! {
            biased;
            _ = link.cancel.cancelled() => return,
            result = factory.connect() => result,
        };

        let exit = match connect_result {
            Ok(transport) => {
                info!(key = %link.supervisor.key(), endpoint = %endpoint, "stream connected");
                let snapshot = link.supervisor.on_connected();
                if !link.publish(snapshot).await {
                    tokio::spawn(transport.close());
                    return;
                }
                pump(&mut link, transport).await
            }
            Err(error) => {
                warn!(
                    key = %link.supervisor.key(),
                    endpoint = %endpoint,
                    error = %error,
                    "stream connect failed"
                );
                let snapshot = link.supervisor.on_error(format!("connect failed: {error}"));
                if !link.publish(snapshot).await {
                    return;
                }
                LinkExit::Closed {
                    code: ABNORMAL_CLOSURE_CODE,
                    reason: Some(error.to_string()),
                }
            }
        };

        let (code, reason) = match exit {
            LinkExit::Closed { code, reason } => (code, reason),
            LinkExit::Teardown => return,
        };

        let (snapshot, disposition) = link.supervisor.on_closed(code, reason);
        if !link.publish(snapshot).await {
            return;
        }

        match disposition {
            CloseDisposition::Settle => {
                info!(key = %link.supervisor.key(), "stream closed intentionally");
                return;
            }
            CloseDisposition::GiveUp => {
                warn!(key = %link.supervisor.key(), "reconnect attempts exhausted");
                return;
            }
            CloseDisposition::Retry { attempt, delay } => {
                debug!(key = %link.supervisor.key(), attempt, ?delay, "scheduling reconnect");
                tokio::select! {
                    biased;
                    _ = link.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if !link.slot.is_live() {
                    return;
                }
            }
        }
    }
}

async fn pump(link: &mut SupervisedLink, mut transport: BoxTransport) -> LinkExit {
    loop {
        let event = tokio::select! {
            biased;
            _ = link.cancel.cancelled() => {
                tokio::spawn(transport.close());
                return LinkExit::Teardown;
            }
            event = transport.next() => event,
        };

        match event {
            Some(TransportEvent::Message(text)) => {
                if !link.deliver(StreamEvent::Frame(text)).await {
                    tokio::spawn(transport.close());
                    return LinkExit::Teardown;
                }
            }
            Some(TransportEvent::Error(reason)) => {
                warn!(key = %link.supervisor.key(), error = %reason, "stream transport error");
                let snapshot = link.supervisor.on_error(reason);
                if !link.publish(snapshot).await {
                    tokio::spawn(transport.close());
                    return LinkExit::Teardown;
                }
            }
            Some(TransportEvent::Closed { code, reason }) => {
                return LinkExit::Closed { code, reason };
            }
            None => {
                return LinkExit::Closed {
                    code: ABNORMAL_CLOSURE_CODE,
                    reason: None,
                };
            }
        }
    }
}

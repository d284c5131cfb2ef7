//! Connection supervisor state machine.
//!
//! The supervisor performs no I/O. Every input carries the current time and,
//! where it originates from an asynchronous operation, the [`AttemptId`] that
//! operation was started under. Inputs tagged with a superseded attempt are
//! ignored, which is the only cancellation mechanism: nothing is ever
//! unregistered from the transport.
//!
//! ```text
//! Connecting ──open──▶ Connected ──error/close──▶ Error | Disconnected
//!     ▲                                                 │
//!     └──────────────── retry (backoff) ◀───────────────┘
//! ```
//!
//! The async driver in [`super::service`] executes the returned
//! [`SupervisorAction`]s.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;

/// Externally visible connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// A connection attempt is in progress
    Connecting,
    /// Stream is open and delivering messages
    Connected,
    /// Stream closed or timed out; a retry is scheduled
    Disconnected,
    /// Transport failed; a retry is scheduled
    Error,
}

impl ConnectionState {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifier minted on every (re)connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(u64);

impl AttemptId {
    /// Raw numeric value, for logging.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transport-level readiness, mirroring what the stream itself reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closed,
}

/// Signals a transport raises for the attempt it was opened under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// The stream is established
    Opened,
    /// One message body
    Message(String),
    /// The transport failed. `recovering` means it is retrying on its own.
    Failed { recovering: bool, reason: String },
    /// The server ended the stream
    Closed,
}

/// Side effects requested by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorAction {
    /// Drop the active stream, if any
    Close,
    /// Open a fresh stream for this attempt
    Open { attempt: AttemptId },
    /// Deliver `ConnectTimeout` for this attempt after the delay
    ArmConnectTimeout { attempt: AttemptId, after: Duration },
    /// Deliver `RetryDue` for this attempt after the delay
    ScheduleRetry { attempt: AttemptId, after: Duration },
    /// Probe the liveness endpoint and report back
    Probe { attempt: AttemptId },
    /// Hand a message body to the event dispatcher
    Dispatch { body: String },
    /// Publish a new status value
    Publish { state: ConnectionState },
}

/// Exponential backoff: starts at `initial`, doubles per use, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Create a backoff starting at `initial` and capped at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Return the delay to use now and double the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Delay the next call to `next_delay` would return.
    pub fn peek(&self) -> Duration {
        self.current
    }

    /// Return to the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Single-owner connection state machine.
#[derive(Debug)]
pub struct Supervisor {
    config: ConnectionConfig,
    state: ConnectionState,
    ready: ReadyState,
    next_attempt: u64,
    current: Option<AttemptId>,
    last_message_at: Option<Instant>,
    backoff: Backoff,
    retry_pending: bool,
    probe_in_flight: bool,
    shut_down: bool,
}

impl Supervisor {
    /// Create an idle supervisor. Call [`Supervisor::connect`] to start.
    pub fn new(config: ConnectionConfig) -> Self {
        let backoff = Backoff::new(config.backoff_initial(), config.backoff_max());
        Self {
            config,
            state: ConnectionState::Disconnected,
            ready: ReadyState::Closed,
            next_attempt: 0,
            current: None,
            last_message_at: None,
            backoff,
            retry_pending: false,
            probe_in_flight: false,
            shut_down: false,
        }
    }

    /// Current status.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Transport readiness as last reported.
    pub fn ready_state(&self) -> ReadyState {
        self.ready
    }

    /// Attempt currently acted upon.
    pub fn current_attempt(&self) -> Option<AttemptId> {
        self.current
    }

    /// Delay the next scheduled retry would use.
    pub fn next_backoff(&self) -> Duration {
        self.backoff.peek()
    }

    /// Time of the most recent message or open.
    pub fn last_message_at(&self) -> Option<Instant> {
        self.last_message_at
    }

    /// Whether teardown has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    fn is_current(&self, attempt: AttemptId) -> bool {
        !self.shut_down && self.current == Some(attempt)
    }

    fn mint_attempt(&mut self) -> AttemptId {
        self.next_attempt += 1;
        let attempt = AttemptId(self.next_attempt);
        self.current = Some(attempt);
        attempt
    }

    fn set_state(&mut self, state: ConnectionState, actions: &mut Vec<SupervisorAction>) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Connection state transition");
            self.state = state;
            actions.push(SupervisorAction::Publish { state });
        }
    }

    /// Start a new attempt, superseding any prior one.
    pub fn connect(&mut self, _now: Instant) -> Vec<SupervisorAction> {
        if self.shut_down {
            return Vec::new();
        }

        let mut actions = vec![SupervisorAction::Close];
        let attempt = self.mint_attempt();
        self.ready = ReadyState::Connecting;
        self.retry_pending = false;
        self.probe_in_flight = false;
        self.set_state(ConnectionState::Connecting, &mut actions);

        info!(attempt = %attempt, "Opening agent event stream");
        actions.push(SupervisorAction::Open { attempt });
        actions.push(SupervisorAction::ArmConnectTimeout {
            attempt,
            after: self.config.connect_timeout(),
        });
        actions
    }

    /// Manual or endpoint-change reconnect: backoff starts over.
    pub fn reconnect_now(&mut self, now: Instant) -> Vec<SupervisorAction> {
        self.backoff.reset();
        self.connect(now)
    }

    /// Feed a transport signal raised under `attempt`.
    pub fn on_transport(
        &mut self,
        attempt: AttemptId,
        signal: TransportSignal,
        now: Instant,
    ) -> Vec<SupervisorAction> {
        if !self.is_current(attempt) {
            debug!(attempt = %attempt, "Ignoring signal from superseded attempt");
            return Vec::new();
        }

        let mut actions = Vec::new();
        match signal {
            TransportSignal::Opened => {
                self.ready = ReadyState::Open;
                self.backoff.reset();
                self.last_message_at = Some(now);
                self.set_state(ConnectionState::Connected, &mut actions);
                info!(attempt = %attempt, "Agent event stream connected");
            }
            TransportSignal::Message(body) => {
                self.last_message_at = Some(now);
                self.ready = ReadyState::Open;
                self.set_state(ConnectionState::Connected, &mut actions);
                actions.push(SupervisorAction::Dispatch { body });
            }
            TransportSignal::Failed { recovering, reason } => {
                if recovering {
                    // The transport retries on its own; scheduling here would double up.
                    debug!(attempt = %attempt, reason = %reason, "Transport recovering");
                    self.ready = ReadyState::Connecting;
                    self.set_state(ConnectionState::Connecting, &mut actions);
                } else {
                    warn!(attempt = %attempt, reason = %reason, "Agent event stream failed");
                    self.ready = ReadyState::Closed;
                    self.set_state(ConnectionState::Error, &mut actions);
                    self.schedule_retry(&mut actions);
                }
            }
            TransportSignal::Closed => {
                info!(attempt = %attempt, "Agent event stream closed by server");
                self.ready = ReadyState::Closed;
                self.set_state(ConnectionState::Disconnected, &mut actions);
                self.schedule_retry(&mut actions);
            }
        }
        actions
    }

    /// Establishment timeout for `attempt` expired.
    pub fn on_connect_timeout(&mut self, attempt: AttemptId, _now: Instant) -> Vec<SupervisorAction> {
        if !self.is_current(attempt) || self.state != ConnectionState::Connecting {
            return Vec::new();
        }

        warn!(
            attempt = %attempt,
            timeout_ms = self.config.connect_timeout_ms,
            "Agent event stream did not open in time"
        );
        let mut actions = vec![SupervisorAction::Close];
        self.ready = ReadyState::Closed;
        self.set_state(ConnectionState::Disconnected, &mut actions);
        self.schedule_retry(&mut actions);
        actions
    }

    /// Retry delay scheduled under `attempt` elapsed.
    pub fn on_retry_due(&mut self, attempt: AttemptId, now: Instant) -> Vec<SupervisorAction> {
        if !self.is_current(attempt) || !self.retry_pending {
            return Vec::new();
        }
        self.connect(now)
    }

    /// Periodic health check.
    pub fn on_health_tick(&mut self, now: Instant) -> Vec<SupervisorAction> {
        let Some(attempt) = self.current.filter(|_| !self.shut_down) else {
            return Vec::new();
        };

        match self.ready {
            ReadyState::Open => {
                let silent_for = self
                    .last_message_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();
                if silent_for > self.config.stale_after() {
                    warn!(
                        attempt = %attempt,
                        silent_ms = silent_for.as_millis() as u64,
                        "Agent event stream is stale, forcing reconnect"
                    );
                    return self.connect(now);
                }
                Vec::new()
            }
            ReadyState::Closed if !self.probe_in_flight => {
                self.probe_in_flight = true;
                vec![SupervisorAction::Probe { attempt }]
            }
            _ => Vec::new(),
        }
    }

    /// Liveness probe started under `attempt` finished.
    pub fn on_probe_result(
        &mut self,
        attempt: AttemptId,
        healthy: bool,
        now: Instant,
    ) -> Vec<SupervisorAction> {
        if !self.is_current(attempt) {
            return Vec::new();
        }
        self.probe_in_flight = false;

        if healthy && self.ready == ReadyState::Closed {
            info!(attempt = %attempt, "Agent reported healthy, reconnecting ahead of backoff");
            return self.reconnect_now(now);
        }
        Vec::new()
    }

    /// Close everything and make every outstanding input inert.
    pub fn teardown(&mut self) -> Vec<SupervisorAction> {
        let mut actions = vec![SupervisorAction::Close];
        self.mint_attempt();
        self.shut_down = true;
        self.retry_pending = false;
        self.probe_in_flight = false;
        self.ready = ReadyState::Closed;
        self.set_state(ConnectionState::Disconnected, &mut actions);
        actions
    }

    fn schedule_retry(&mut self, actions: &mut Vec<SupervisorAction>) {
        if self.retry_pending {
            return;
        }
        let Some(attempt) = self.current else {
            return;
        };
        let after = self.backoff.next_delay();
        self.retry_pending = true;
        info!(attempt = %attempt, delay_ms = after.as_millis() as u64, "Scheduling reconnect");
        actions.push(SupervisorAction::ScheduleRetry { attempt, after });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> Supervisor {
        Supervisor::new(ConnectionConfig::default())
    }

    fn opened_attempt(actions: &[SupervisorAction]) -> AttemptId {
        actions
            .iter()
            .find_map(|a| match a {
                SupervisorAction::Open { attempt } => Some(*attempt),
                _ => None,
            })
            .expect("connect should open a stream")
    }

    fn retry_delay(actions: &[SupervisorAction]) -> Option<Duration> {
        actions.iter().find_map(|a| match a {
            SupervisorAction::ScheduleRetry { after, .. } => Some(*after),
            _ => None,
        })
    }

    fn failed() -> TransportSignal {
        TransportSignal::Failed {
            recovering: false,
            reason: "connection reset".to_string(),
        }
    }

    #[test]
    fn test_connect_arms_timeout_and_opens() {
        let mut sup = supervisor();
        let now = Instant::now();
        let actions = sup.connect(now);

        let attempt = opened_attempt(&actions);
        assert_eq!(actions[0], SupervisorAction::Close);
        assert!(actions.contains(&SupervisorAction::ArmConnectTimeout {
            attempt,
            after: Duration::from_secs(20),
        }));
        assert_eq!(sup.state(), ConnectionState::Connecting);
        assert_eq!(sup.ready_state(), ReadyState::Connecting);
    }

    #[test]
    fn test_open_sets_connected_and_records_time() {
        let mut sup = supervisor();
        let now = Instant::now();
        let attempt = opened_attempt(&sup.connect(now));

        let actions = sup.on_transport(attempt, TransportSignal::Opened, now);
        assert_eq!(sup.state(), ConnectionState::Connected);
        assert_eq!(sup.last_message_at(), Some(now));
        assert!(actions.contains(&SupervisorAction::Publish {
            state: ConnectionState::Connected
        }));
    }

    #[test]
    fn test_message_dispatches_and_promotes_to_connected() {
        let mut sup = supervisor();
        let now = Instant::now();
        let attempt = opened_attempt(&sup.connect(now));

        let later = now + Duration::from_secs(2);
        let actions = sup.on_transport(
            attempt,
            TransportSignal::Message(r#"{"type":"heartbeat"}"#.to_string()),
            later,
        );
        assert_eq!(sup.state(), ConnectionState::Connected);
        assert_eq!(sup.last_message_at(), Some(later));
        assert!(actions.contains(&SupervisorAction::Dispatch {
            body: r#"{"type":"heartbeat"}"#.to_string()
        }));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut sup = supervisor();
        let mut now = Instant::now();
        let mut delays = Vec::new();

        for _ in 0..7 {
            let attempt = opened_attempt(&sup.connect(now));
            let actions = sup.on_transport(attempt, failed(), now);
            delays.push(retry_delay(&actions).unwrap());
            now += Duration::from_secs(1);
        }

        let secs: Vec<u64> = delays.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(sup.state(), ConnectionState::Error);
    }

    #[test]
    fn test_open_resets_backoff() {
        let mut sup = supervisor();
        let now = Instant::now();
        for _ in 0..3 {
            let attempt = opened_attempt(&sup.connect(now));
            sup.on_transport(attempt, failed(), now);
        }
        assert_eq!(sup.next_backoff(), Duration::from_secs(8));

        let attempt = opened_attempt(&sup.connect(now));
        sup.on_transport(attempt, TransportSignal::Opened, now);
        assert_eq!(sup.next_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_recovering_error_does_not_schedule_retry() {
        let mut sup = supervisor();
        let now = Instant::now();
        let attempt = opened_attempt(&sup.connect(now));
        sup.on_transport(attempt, TransportSignal::Opened, now);

        let actions = sup.on_transport(
            attempt,
            TransportSignal::Failed {
                recovering: true,
                reason: "network blip".to_string(),
            },
            now,
        );
        assert!(retry_delay(&actions).is_none());
        assert_eq!(sup.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_only_one_retry_pending() {
        let mut sup = supervisor();
        let now = Instant::now();
        let attempt = opened_attempt(&sup.connect(now));

        let first = sup.on_transport(attempt, failed(), now);
        let second = sup.on_transport(attempt, TransportSignal::Closed, now);
        assert!(retry_delay(&first).is_some());
        assert!(retry_delay(&second).is_none());
    }

    #[test]
    fn test_connect_timeout_disconnects_and_retries() {
        let mut sup = supervisor();
        let now = Instant::now();
        let attempt = opened_attempt(&sup.connect(now));

        let actions = sup.on_connect_timeout(attempt, now + Duration::from_secs(20));
        assert_eq!(actions[0], SupervisorAction::Close);
        assert_eq!(sup.state(), ConnectionState::Disconnected);
        assert_eq!(retry_delay(&actions), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_connect_timeout_after_open_is_noop() {
        let mut sup = supervisor();
        let now = Instant::now();
        let attempt = opened_attempt(&sup.connect(now));
        sup.on_transport(attempt, TransportSignal::Opened, now);

        assert!(sup.on_connect_timeout(attempt, now).is_empty());
        assert_eq!(sup.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_superseded_attempt_callbacks_are_inert() {
        let mut sup = supervisor();
        let now = Instant::now();
        let stale = opened_attempt(&sup.connect(now));
        let fresh = opened_attempt(&sup.reconnect_now(now));
        assert_ne!(stale, fresh);

        assert!(sup.on_transport(stale, TransportSignal::Opened, now).is_empty());
        assert!(sup
            .on_transport(stale, TransportSignal::Message("{}".to_string()), now)
            .is_empty());
        assert!(sup.on_transport(stale, failed(), now).is_empty());
        assert!(sup.on_connect_timeout(stale, now).is_empty());
        assert!(sup.on_retry_due(stale, now).is_empty());
        assert_eq!(sup.state(), ConnectionState::Connecting);
        assert_eq!(sup.current_attempt(), Some(fresh));
    }

    #[test]
    fn test_retry_due_reconnects() {
        let mut sup = supervisor();
        let now = Instant::now();
        let attempt = opened_attempt(&sup.connect(now));
        sup.on_transport(attempt, TransportSignal::Closed, now);

        let actions = sup.on_retry_due(attempt, now + Duration::from_secs(1));
        let next = opened_attempt(&actions);
        assert_ne!(next, attempt);
        assert_eq!(sup.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_stale_connection_forces_reconnect() {
        let mut sup = supervisor();
        let now = Instant::now();
        let attempt = opened_attempt(&sup.connect(now));
        sup.on_transport(attempt, TransportSignal::Opened, now);

        assert!(sup.on_health_tick(now + Duration::from_secs(40)).is_empty());

        let actions = sup.on_health_tick(now + Duration::from_secs(46));
        let next = opened_attempt(&actions);
        assert_ne!(next, attempt);
    }

    #[test]
    fn test_heartbeats_keep_connection_fresh() {
        let mut sup = supervisor();
        let now = Instant::now();
        let attempt = opened_attempt(&sup.connect(now));
        sup.on_transport(attempt, TransportSignal::Opened, now);

        let beat = now + Duration::from_secs(30);
        sup.on_transport(
            attempt,
            TransportSignal::Message(r#"{"type":"heartbeat"}"#.to_string()),
            beat,
        );
        assert!(sup.on_health_tick(now + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_closed_connection_probes_once() {
        let mut sup = supervisor();
        let now = Instant::now();
        let attempt = opened_attempt(&sup.connect(now));
        sup.on_transport(attempt, TransportSignal::Closed, now);

        let actions = sup.on_health_tick(now);
        assert_eq!(actions, vec![SupervisorAction::Probe { attempt }]);
        assert!(sup.on_health_tick(now).is_empty());
    }

    #[test]
    fn test_healthy_probe_resets_backoff_and_reconnects() {
        let mut sup = supervisor();
        let now = Instant::now();
        let mut attempt = opened_attempt(&sup.connect(now));
        for _ in 0..3 {
            sup.on_transport(attempt, failed(), now);
            attempt = opened_attempt(&sup.on_retry_due(attempt, now));
        }
        sup.on_transport(attempt, failed(), now);
        assert!(sup.next_backoff() > Duration::from_secs(1));

        sup.on_health_tick(now);
        let actions = sup.on_probe_result(attempt, true, now);
        assert!(actions.iter().any(|a| matches!(a, SupervisorAction::Open { .. })));
        assert_eq!(sup.next_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_unhealthy_probe_waits_for_backoff() {
        let mut sup = supervisor();
        let now = Instant::now();
        let attempt = opened_attempt(&sup.connect(now));
        sup.on_transport(attempt, TransportSignal::Closed, now);
        sup.on_health_tick(now);

        assert!(sup.on_probe_result(attempt, false, now).is_empty());
        assert_eq!(sup.state(), ConnectionState::Disconnected);
        // Probe may run again on the next tick.
        assert_eq!(sup.on_health_tick(now).len(), 1);
    }

    #[test]
    fn test_teardown_invalidates_everything() {
        let mut sup = supervisor();
        let now = Instant::now();
        let attempt = opened_attempt(&sup.connect(now));

        let actions = sup.teardown();
        assert_eq!(actions[0], SupervisorAction::Close);
        assert!(sup.is_shut_down());
        assert!(sup.on_transport(attempt, TransportSignal::Opened, now).is_empty());
        assert!(sup.on_health_tick(now).is_empty());
        assert!(sup.connect(now).is_empty());
        assert_eq!(sup.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(ConnectionState::Error.to_string(), "error");
    }
}

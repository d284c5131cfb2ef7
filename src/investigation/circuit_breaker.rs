//! Per-tool circuit breakers.
//!
//! A breaker is created the first time a tool fails and follows the
//! closed/open/half-open state machine:
//!
//! - **Closed**: calls allowed; consecutive failures are counted
//! - **Open**: calls blocked until the cooldown elapses
//! - **Half-Open**: exactly one trial call allowed; its outcome closes or
//!   reopens the breaker

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::BreakerConfig;

/// State of one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls allowed
    Closed,
    /// Blocking calls - too many failures
    Open,
    /// Testing recovery - one trial call
    HalfOpen,
}

impl CircuitState {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Answer to "may this tool run now?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionGate {
    Allowed,
    Blocked { reason: String, retry_in: Duration },
}

impl ExecutionGate {
    /// Whether the call may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, ExecutionGate::Allowed)
    }
}

/// Read-only view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub cooldown: Duration,
}

#[derive(Debug, Clone)]
struct ToolBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    trial_started_at: Option<Instant>,
}

impl ToolBreaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            opened_at: None,
            trial_in_flight: false,
            trial_started_at: None,
        }
    }

    fn start_trial(&mut self, now: Instant) {
        self.trial_in_flight = true;
        self.trial_started_at = Some(now);
    }

    fn transition_to(&mut self, tool: &str, new_state: CircuitState) {
        tracing::info!(
            tool = %tool,
            from = %self.state,
            to = %new_state,
            consecutive_failures = self.consecutive_failures,
            "Circuit breaker state transition"
        );
        self.state = new_state;
    }
}

/// Registry of breakers keyed by tool name.
#[derive(Debug, Clone)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: HashMap<String, ToolBreaker>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    /// Create an empty registry.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: HashMap::new(),
        }
    }

    /// Check whether `tool` may run now.
    pub fn can_execute(&mut self, tool: &str) -> ExecutionGate {
        self.can_execute_at(tool, Instant::now())
    }

    /// [`Self::can_execute`] against an explicit clock.
    pub fn can_execute_at(&mut self, tool: &str, now: Instant) -> ExecutionGate {
        let cooldown = self.config.cooldown();
        let Some(breaker) = self.breakers.get_mut(tool) else {
            return ExecutionGate::Allowed;
        };

        match breaker.state {
            CircuitState::Closed => ExecutionGate::Allowed,
            CircuitState::Open => {
                let elapsed = breaker
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(cooldown);
                if elapsed >= cooldown {
                    breaker.transition_to(tool, CircuitState::HalfOpen);
                    breaker.start_trial(now);
                    return ExecutionGate::Allowed;
                }
                let retry_in = cooldown - elapsed;
                ExecutionGate::Blocked {
                    reason: format!(
                        "{} is temporarily disabled after {} consecutive failures, retry in {}s",
                        tool,
                        breaker.consecutive_failures,
                        retry_in.as_secs_f64().ceil() as u64
                    ),
                    retry_in,
                }
            }
            CircuitState::HalfOpen if breaker.trial_in_flight => {
                // A trial that never reported back (its caller was cancelled)
                // is abandoned after one cooldown.
                let elapsed = breaker
                    .trial_started_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(cooldown);
                if elapsed >= cooldown {
                    tracing::warn!(tool = %tool, "Trial call never completed, allowing a new one");
                    breaker.start_trial(now);
                    return ExecutionGate::Allowed;
                }
                ExecutionGate::Blocked {
                    reason: format!("{} is being retried, waiting for the trial call", tool),
                    retry_in: cooldown - elapsed,
                }
            }
            CircuitState::HalfOpen => {
                breaker.start_trial(now);
                ExecutionGate::Allowed
            }
        }
    }

    /// Record a successful call. Unknown tools create no state.
    pub fn record_success(&mut self, tool: &str) {
        let Some(breaker) = self.breakers.get_mut(tool) else {
            return;
        };
        breaker.consecutive_failures = 0;
        breaker.trial_in_flight = false;
        breaker.trial_started_at = None;
        breaker.opened_at = None;
        if breaker.state != CircuitState::Closed {
            breaker.transition_to(tool, CircuitState::Closed);
        }
    }

    /// Record a failed call.
    pub fn record_failure(&mut self, tool: &str) {
        self.record_failure_at(tool, Instant::now());
    }

    /// [`Self::record_failure`] against an explicit clock.
    pub fn record_failure_at(&mut self, tool: &str, now: Instant) {
        let threshold = self.config.failure_threshold;
        let breaker = self
            .breakers
            .entry(tool.to_string())
            .or_insert_with(ToolBreaker::new);

        breaker.consecutive_failures += 1;
        breaker.last_failure = Some(Utc::now());
        breaker.trial_in_flight = false;
        breaker.trial_started_at = None;

        match breaker.state {
            CircuitState::Closed => {
                if breaker.consecutive_failures >= threshold {
                    breaker.opened_at = Some(now);
                    breaker.transition_to(tool, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // Failed trial: cooldown restarts from now.
                breaker.opened_at = Some(now);
                breaker.transition_to(tool, CircuitState::Open);
            }
            CircuitState::Open => {
                breaker.opened_at = Some(now);
            }
        }
    }

    /// Current state for `tool`; unknown tools are closed.
    pub fn state(&self, tool: &str) -> CircuitState {
        self.breakers
            .get(tool)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Snapshot of the breaker for `tool`, if one exists.
    pub fn snapshot(&self, tool: &str) -> Option<BreakerSnapshot> {
        self.breakers.get(tool).map(|b| BreakerSnapshot {
            state: b.state,
            failure_count: b.consecutive_failures,
            last_failure: b.last_failure,
            cooldown: self.config.cooldown(),
        })
    }

    /// Number of tools with breaker state.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether no tool has failed yet.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Manually close one breaker.
    pub fn reset(&mut self, tool: &str) {
        if self.breakers.remove(tool).is_some() {
            tracing::info!(tool = %tool, "Circuit breaker manually reset");
        }
    }

    /// Drop all breaker state.
    pub fn reset_all(&mut self) {
        if !self.breakers.is_empty() {
            tracing::info!(count = self.breakers.len(), "All circuit breakers reset");
        }
        self.breakers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOOL: &str = "RUN_KUBECTL";

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: 3,
            cooldown_ms: 30_000,
        })
    }

    fn open(registry: &mut CircuitBreakerRegistry, now: Instant) {
        for _ in 0..3 {
            registry.record_failure_at(TOOL, now);
        }
    }

    #[test]
    fn test_unknown_tool_is_allowed_without_state() {
        let mut registry = registry();
        assert!(registry.can_execute("NEVER_SEEN").is_allowed());
        registry.record_success("NEVER_SEEN");
        assert!(registry.is_empty());
        assert_eq!(registry.state("NEVER_SEEN"), CircuitState::Closed);
        assert!(registry.snapshot("NEVER_SEEN").is_none());
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let mut registry = registry();
        let now = Instant::now();

        registry.record_failure_at(TOOL, now);
        registry.record_failure_at(TOOL, now);
        assert_eq!(registry.state(TOOL), CircuitState::Closed);
        assert!(registry.can_execute_at(TOOL, now).is_allowed());

        registry.record_failure_at(TOOL, now);
        assert_eq!(registry.state(TOOL), CircuitState::Open);
        match registry.can_execute_at(TOOL, now + Duration::from_secs(10)) {
            ExecutionGate::Blocked { reason, retry_in } => {
                assert_eq!(retry_in, Duration::from_secs(20));
                assert!(reason.contains("retry in 20s"), "{reason}");
            }
            ExecutionGate::Allowed => panic!("breaker should be open"),
        }
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut registry = registry();
        registry.record_failure(TOOL);
        registry.record_failure(TOOL);
        assert_eq!(registry.snapshot(TOOL).unwrap().failure_count, 2);

        registry.record_success(TOOL);
        let snapshot = registry.snapshot(TOOL).unwrap();
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert!(snapshot.last_failure.is_some());
    }

    #[test]
    fn test_half_open_allows_exactly_one_trial() {
        let mut registry = registry();
        let now = Instant::now();
        open(&mut registry, now);

        let later = now + Duration::from_secs(30);
        assert!(registry.can_execute_at(TOOL, later).is_allowed());
        assert_eq!(registry.state(TOOL), CircuitState::HalfOpen);
        assert!(!registry.can_execute_at(TOOL, later).is_allowed());

        registry.record_success(TOOL);
        assert_eq!(registry.state(TOOL), CircuitState::Closed);
        assert_eq!(registry.snapshot(TOOL).unwrap().failure_count, 0);
        assert!(registry.can_execute_at(TOOL, later).is_allowed());
    }

    #[test]
    fn test_failed_trial_restarts_cooldown() {
        let mut registry = registry();
        let now = Instant::now();
        open(&mut registry, now);

        let trial_at = now + Duration::from_secs(31);
        assert!(registry.can_execute_at(TOOL, trial_at).is_allowed());
        registry.record_failure_at(TOOL, trial_at);
        assert_eq!(registry.state(TOOL), CircuitState::Open);

        assert!(!registry
            .can_execute_at(TOOL, trial_at + Duration::from_secs(29))
            .is_allowed());
        assert!(registry
            .can_execute_at(TOOL, trial_at + Duration::from_secs(30))
            .is_allowed());
    }

    #[test]
    fn test_abandoned_trial_is_replaced_after_cooldown() {
        let mut registry = registry();
        let now = Instant::now();
        open(&mut registry, now);

        // Trial granted, then never reported back.
        let trial_at = now + Duration::from_secs(31);
        assert!(registry.can_execute_at(TOOL, trial_at).is_allowed());

        match registry.can_execute_at(TOOL, trial_at + Duration::from_secs(10)) {
            ExecutionGate::Blocked { retry_in, .. } => {
                assert_eq!(retry_in, Duration::from_secs(20));
            }
            ExecutionGate::Allowed => panic!("trial still in flight"),
        }

        let retry_at = trial_at + Duration::from_secs(30);
        assert!(registry.can_execute_at(TOOL, retry_at).is_allowed());
        assert!(!registry.can_execute_at(TOOL, retry_at).is_allowed());
        assert_eq!(registry.state(TOOL), CircuitState::HalfOpen);

        registry.record_success(TOOL);
        assert_eq!(registry.state(TOOL), CircuitState::Closed);
    }

    #[test]
    fn test_breakers_are_per_tool() {
        let mut registry = registry();
        let now = Instant::now();
        open(&mut registry, now);
        assert!(!registry.can_execute_at(TOOL, now).is_allowed());
        assert!(registry.can_execute_at("SEARCH_KNOWLEDGE", now).is_allowed());
    }

    #[test]
    fn test_reset_all() {
        let mut registry = registry();
        let now = Instant::now();
        open(&mut registry, now);
        registry.record_failure_at("SEARCH_KNOWLEDGE", now);
        assert_eq!(registry.len(), 2);

        registry.reset_all();
        assert!(registry.is_empty());
        assert!(registry.can_execute_at(TOOL, now).is_allowed());
    }

    #[test]
    fn test_circuit_state_string_conversion() {
        assert_eq!(CircuitState::Closed.as_str(), "closed");
        assert_eq!(CircuitState::Open.as_str(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }
}

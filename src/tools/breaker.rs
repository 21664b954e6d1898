//! Per-tool circuit breakers.
//!
//! ```text
//! Closed --(failure_threshold consecutive failures)--> Open
//! Open   --(recovery_timeout elapsed)----------------> HalfOpen
//! HalfOpen --(trial succeeds)--> Closed
//! HalfOpen --(trial fails)-----> Open
//! ```
//!
//! Timestamps use `tokio::time::Instant` so paused-clock tests can drive the
//! recovery timeout deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::BreakerConfig;

/// Health gate position for one tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPosition {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker state for a single tool name.
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub position: BreakerPosition,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    /// When the breaker last opened.
    pub opened_at: Option<Instant>,
    /// Whether the single HalfOpen trial call is currently outstanding.
    pub trial_in_flight: bool,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            position: BreakerPosition::Closed,
            failure_count: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

impl CircuitBreakerState {
    /// Remaining cooldown while open, if any.
    pub fn remaining_cooldown(&self, recovery_timeout: Duration, now: Instant) -> Option<Duration> {
        match (self.position, self.opened_at) {
            (BreakerPosition::Open, Some(opened)) => {
                let elapsed = now.saturating_duration_since(opened);
                recovery_timeout.checked_sub(elapsed).filter(|d| !d.is_zero())
            }
            _ => None,
        }
    }
}

/// Admission granted by a breaker for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call through a closed breaker.
    Normal,
    /// The single trial call of a half-open breaker.
    Trial,
}

/// Serializable snapshot for status listings.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub tool: String,
    pub position: BreakerPosition,
    pub failure_count: u32,
    pub cooldown_remaining_secs: Option<f64>,
}

/// Breakers for every tool, keyed by tool name.
///
/// Each call to `admit`/`record_*` is applied under one lock, making the map
/// the serialization point shared by all concurrent invokers.
#[derive(Debug, Clone)]
pub struct BreakerBoard {
    breakers: Arc<Mutex<HashMap<String, CircuitBreakerState>>>,
    config: BreakerConfig,
}

impl BreakerBoard {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CircuitBreakerState>> {
        self.breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decide whether a call to `tool` may proceed.
    ///
    /// Returns the remaining cooldown (zero while a trial is outstanding) when
    /// the call must fail fast.
    pub fn admit(&self, tool: &str) -> Result<Admission, Duration> {
        let now = Instant::now();
        let mut breakers = self.lock();
        let state = breakers.entry(tool.to_string()).or_default();

        match state.position {
            BreakerPosition::Closed => Ok(Admission::Normal),
            BreakerPosition::Open => {
                match state.remaining_cooldown(self.config.recovery_timeout, now) {
                    Some(remaining) => Err(remaining),
                    None => {
                        tracing::info!(tool, "Circuit half-open, admitting trial call");
                        state.position = BreakerPosition::HalfOpen;
                        state.trial_in_flight = true;
                        Ok(Admission::Trial)
                    }
                }
            }
            BreakerPosition::HalfOpen => {
                if state.trial_in_flight {
                    Err(Duration::ZERO)
                } else {
                    state.trial_in_flight = true;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    /// Record a successful call.
    ///
    /// Only a HalfOpen breaker closes on success. A late success from a call
    /// admitted before the breaker opened leaves an Open breaker untouched.
    pub fn record_success(&self, tool: &str) {
        let mut breakers = self.lock();
        let state = breakers.entry(tool.to_string()).or_default();
        match state.position {
            BreakerPosition::Closed => state.failure_count = 0,
            BreakerPosition::HalfOpen => {
                tracing::info!(tool, "Circuit closed after successful trial");
                *state = CircuitBreakerState::default();
            }
            BreakerPosition::Open => {
                tracing::debug!(tool, "Ignoring success reported while open");
            }
        }
    }

    /// Record a failed or timed-out call.
    ///
    /// Returns `true` when this failure opened the breaker.
    pub fn record_failure(&self, tool: &str) -> bool {
        let now = Instant::now();
        let mut breakers = self.lock();
        let state = breakers.entry(tool.to_string()).or_default();
        state.failure_count = state.failure_count.saturating_add(1);
        state.trial_in_flight = false;

        match state.position {
            BreakerPosition::HalfOpen => {
                state.position = BreakerPosition::Open;
                state.opened_at = Some(now);
                tracing::warn!(tool, "Trial call failed, circuit re-opened");
                true
            }
            BreakerPosition::Closed if state.failure_count >= self.config.failure_threshold => {
                state.position = BreakerPosition::Open;
                state.opened_at = Some(now);
                tracing::warn!(
                    tool,
                    consecutive_failures = state.failure_count,
                    cooldown_secs = self.config.recovery_timeout.as_secs_f64(),
                    "Circuit breaker tripped"
                );
                true
            }
            _ => false,
        }
    }

    /// Free an abandoned trial slot without changing the breaker position.
    pub fn abandon_trial(&self, tool: &str) {
        if let Some(state) = self.lock().get_mut(tool) {
            state.trial_in_flight = false;
        }
    }

    pub fn position(&self, tool: &str) -> BreakerPosition {
        self.lock()
            .get(tool)
            .map(|s| s.position)
            .unwrap_or(BreakerPosition::Closed)
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let mut out: Vec<BreakerSnapshot> = self
            .lock()
            .iter()
            .map(|(tool, state)| BreakerSnapshot {
                tool: tool.clone(),
                position: state.position,
                failure_count: state.failure_count,
                cooldown_remaining_secs: state
                    .remaining_cooldown(self.config.recovery_timeout, now)
                    .map(|d| d.as_secs_f64()),
            })
            .collect();
        out.sort_by(|a, b| a.tool.cmp(&b.tool));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board(threshold: u32) -> BreakerBoard {
        BreakerBoard::new(BreakerConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_secs(30),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_consecutive_failures() {
        let board = board(5);
        for _ in 0..4 {
            assert_eq!(board.admit("run_command"), Ok(Admission::Normal));
            assert!(!board.record_failure("run_command"));
        }
        assert_eq!(board.admit("run_command"), Ok(Admission::Normal));
        assert!(board.record_failure("run_command"));

        assert_eq!(board.position("run_command"), BreakerPosition::Open);
        assert!(board.admit("run_command").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_the_consecutive_count() {
        let board = board(3);
        board.record_failure("read_file");
        board.record_failure("read_file");
        board.record_success("read_file");
        board.record_failure("read_file");
        assert_eq!(board.position("read_file"), BreakerPosition::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_trial() {
        let board = board(1);
        board.record_failure("fetch_url");
        assert!(board.admit("fetch_url").is_err());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(board.admit("fetch_url"), Ok(Admission::Trial));
        assert_eq!(board.admit("fetch_url"), Err(Duration::ZERO));

        board.record_success("fetch_url");
        assert_eq!(board.position("fetch_url"), BreakerPosition::Closed);
        assert_eq!(board.admit("fetch_url"), Ok(Admission::Normal));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let board = board(1);
        board.record_failure("fetch_url");
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(board.admit("fetch_url"), Ok(Admission::Trial));

        assert!(board.record_failure("fetch_url"));
        assert_eq!(board.position("fetch_url"), BreakerPosition::Open);
        let remaining = board.admit("fetch_url").unwrap_err();
        assert_eq!(remaining, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_close_an_open_breaker() {
        let board = board(1);
        // Slow call admitted while closed.
        assert_eq!(board.admit("db"), Ok(Admission::Normal));
        // A concurrent call fails and opens the breaker.
        assert_eq!(board.admit("db"), Ok(Admission::Normal));
        assert!(board.record_failure("db"));

        tokio::time::advance(Duration::from_secs(1)).await;
        board.record_success("db");
        assert_eq!(board.position("db"), BreakerPosition::Open);
        assert_eq!(board.admit("db"), Err(Duration::from_secs(29)));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(board.admit("db"), Ok(Admission::Trial));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_frees_the_slot() {
        let board = board(1);
        board.record_failure("write_file");
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(board.admit("write_file"), Ok(Admission::Trial));

        board.abandon_trial("write_file");
        assert_eq!(board.position("write_file"), BreakerPosition::HalfOpen);
        assert_eq!(board.admit("write_file"), Ok(Admission::Trial));
    }
}

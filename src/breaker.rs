//! Per-channel circuit breakers.
//!
//! Each channel gets its own independent breaker: `Closed` until
//! `failure_threshold` consecutive failures, then `Open` for `cooldown`, then
//! `HalfOpen` where `success_threshold` consecutive successes close it again
//! and any failure reopens it. One channel's outage never gates another.
//!
//! Breaker state is best-effort and lives in-process, owned by one controller
//! instance and handed to the reconciler as an explicit dependency.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::model::ChannelId;
use crate::telemetry::metrics::MetricsSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Value reported on the breaker gauge.
    pub fn gauge_value(self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ChannelBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<DateTime<Utc>>,
}

impl Default for ChannelBreaker {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
        }
    }
}

/// Breakers for every channel seen by one controller instance.
pub struct CircuitBreakers {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    breakers: Mutex<HashMap<ChannelId, ChannelBreaker>>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            config,
            clock,
            metrics,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelId, ChannelBreaker>> {
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// May a send to `channel` go ahead? Moves an open breaker whose cooldown
    /// has elapsed to half-open.
    pub fn allow_request(&self, channel: &ChannelId) -> bool {
        let now = self.clock.now();
        let mut breakers = self.lock();
        let breaker = breakers.entry(channel.clone()).or_default();

        if breaker.state != BreakerState::Open {
            return true;
        }
        if self.cooldown_remaining(breaker, now).is_some() {
            return false;
        }

        breaker.state = BreakerState::HalfOpen;
        breaker.consecutive_successes = 0;
        info!(%channel, "circuit half-open, probing");
        self.metrics.breaker_state(channel, BreakerState::HalfOpen);
        true
    }

    pub fn record_success(&self, channel: &ChannelId) {
        let mut breakers = self.lock();
        let breaker = breakers.entry(channel.clone()).or_default();
        breaker.consecutive_failures = 0;

        match breaker.state {
            BreakerState::HalfOpen => {
                breaker.consecutive_successes += 1;
                if breaker.consecutive_successes >= self.config.success_threshold.max(1) {
                    breaker.state = BreakerState::Closed;
                    breaker.consecutive_successes = 0;
                    breaker.opened_at = None;
                    info!(%channel, "circuit closed");
                    self.metrics.breaker_state(channel, BreakerState::Closed);
                }
            }
            // A success while open can only come from a send admitted before
            // the breaker tripped; it does not shorten the cooldown.
            BreakerState::Open | BreakerState::Closed => {}
        }
    }

    pub fn record_failure(&self, channel: &ChannelId) {
        let now = self.clock.now();
        let mut breakers = self.lock();
        let breaker = breakers.entry(channel.clone()).or_default();
        breaker.consecutive_successes = 0;
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);

        let trip = match breaker.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => {
                breaker.consecutive_failures >= self.config.failure_threshold.max(1)
            }
            BreakerState::Open => false,
        };

        if trip {
            breaker.state = BreakerState::Open;
            breaker.opened_at = Some(now);
            warn!(
                %channel,
                consecutive_failures = breaker.consecutive_failures,
                cooldown_secs = self.config.cooldown.as_secs(),
                "circuit opened"
            );
            self.metrics.breaker_state(channel, BreakerState::Open);
        }
    }

    /// Current state, without the open → half-open promotion.
    pub fn state(&self, channel: &ChannelId) -> BreakerState {
        self.lock()
            .get(channel)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Time until an open breaker may be probed again. `None` unless open and
    /// still cooling down.
    pub fn remaining_cooldown(&self, channel: &ChannelId) -> Option<Duration> {
        let now = self.clock.now();
        let breakers = self.lock();
        let breaker = breakers.get(channel)?;
        if breaker.state != BreakerState::Open {
            return None;
        }
        self.cooldown_remaining(breaker, now)
    }

    fn cooldown_remaining(&self, breaker: &ChannelBreaker, now: DateTime<Utc>) -> Option<Duration> {
        let opened_at = breaker.opened_at?;
        let elapsed = (now - opened_at).to_std().unwrap_or(Duration::ZERO);
        self.config
            .cooldown
            .checked_sub(elapsed)
            .filter(|d| !d.is_zero())
    }
}

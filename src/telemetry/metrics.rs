//! Metric instruments and the sink the core reports through.
//!
//! Instruments come from the globally-registered OTel `MeterProvider` via the
//! `"herald-rs"` meter. The reconciler never touches them directly: it talks
//! to a [`MetricsSink`], so tests can stub or record the side channel.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};

use crate::breaker::BreakerState;
use crate::model::{ChannelId, Phase};

/// Returns the shared meter for herald-rs instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("herald-rs")
}

/// Counter: phase transitions of notification requests.
/// Labels: `from`, `to`.
pub fn phase_transitions() -> Counter<u64> {
    meter()
        .u64_counter("herald.request.phase_transitions")
        .with_description("Number of notification request phase transitions")
        .build()
}

/// Histogram: channel send duration in milliseconds.
/// Labels: `channel`, `outcome` ("success" | "failed").
pub fn send_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("herald.channel.send_duration_ms")
        .with_description("Channel send duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Gauge: circuit breaker state per channel (0 closed, 1 half-open, 2 open).
/// Labels: `channel`.
pub fn breaker_state() -> Gauge<i64> {
    meter()
        .i64_gauge("herald.channel.breaker_state")
        .with_description("Circuit breaker state per channel")
        .build()
}

/// Counter: redactions applied by the sanitizer.
/// Labels: `rule`.
pub fn redactions() -> Counter<u64> {
    meter()
        .u64_counter("herald.sanitizer.redactions")
        .with_description("Number of sanitizer redactions")
        .build()
}

/// Counter: reconcile invocations run by the control plane.
/// Labels: `result` ("done" | "requeue" | "error").
pub fn reconcile_runs() -> Counter<u64> {
    meter()
        .u64_counter("herald.reconcile.runs")
        .with_description("Number of reconcile invocations")
        .build()
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Side-channel observations produced by the delivery core.
pub trait MetricsSink: Send + Sync {
    fn phase_transition(&self, from: Phase, to: Phase);
    fn send_duration(&self, channel: &ChannelId, success: bool, duration: Duration);
    fn breaker_state(&self, channel: &ChannelId, state: BreakerState);
    fn redaction(&self, rule: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn phase_transition(&self, _from: Phase, _to: Phase) {}
    fn send_duration(&self, _channel: &ChannelId, _success: bool, _duration: Duration) {}
    fn breaker_state(&self, _channel: &ChannelId, _state: BreakerState) {}
    fn redaction(&self, _rule: &str) {}
}

/// Reports to OpenTelemetry. Instruments are built once.
pub struct OtelMetrics {
    phase_transitions: Counter<u64>,
    send_duration_ms: Histogram<f64>,
    breaker_state: Gauge<i64>,
    redactions: Counter<u64>,
}

impl OtelMetrics {
    pub fn new() -> Self {
        Self {
            phase_transitions: phase_transitions(),
            send_duration_ms: send_duration_ms(),
            breaker_state: breaker_state(),
            redactions: redactions(),
        }
    }
}

impl Default for OtelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for OtelMetrics {
    fn phase_transition(&self, from: Phase, to: Phase) {
        self.phase_transitions.add(
            1,
            &[
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
    }

    fn send_duration(&self, channel: &ChannelId, success: bool, duration: Duration) {
        self.send_duration_ms.record(
            duration.as_secs_f64() * 1000.0,
            &[
                KeyValue::new("channel", channel.to_string()),
                KeyValue::new("outcome", if success { "success" } else { "failed" }),
            ],
        );
    }

    fn breaker_state(&self, channel: &ChannelId, state: BreakerState) {
        self.breaker_state.record(
            state.gauge_value(),
            &[KeyValue::new("channel", channel.to_string())],
        );
    }

    fn redaction(&self, rule: &str) {
        self.redactions
            .add(1, &[KeyValue::new("rule", rule.to_string())]);
    }
}

/// Remembers every observation. Meant for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    inner: Mutex<Recorded>,
}

#[derive(Debug, Default)]
struct Recorded {
    transitions: Vec<(Phase, Phase)>,
    sends: Vec<(ChannelId, bool, Duration)>,
    breaker_states: HashMap<ChannelId, BreakerState>,
    redactions: HashMap<String, u64>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn transitions(&self) -> Vec<(Phase, Phase)> {
        self.lock().transitions.clone()
    }

    pub fn sends_for(&self, channel: &ChannelId) -> usize {
        self.lock()
            .sends
            .iter()
            .filter(|(c, _, _)| c == channel)
            .count()
    }

    pub fn last_breaker_state(&self, channel: &ChannelId) -> Option<BreakerState> {
        self.lock().breaker_states.get(channel).copied()
    }

    pub fn redactions(&self, rule: &str) -> u64 {
        self.lock().redactions.get(rule).copied().unwrap_or(0)
    }

    pub fn total_redactions(&self) -> u64 {
        self.lock().redactions.values().sum()
    }
}

impl MetricsSink for RecordingMetrics {
    fn phase_transition(&self, from: Phase, to: Phase) {
        self.lock().transitions.push((from, to));
    }

    fn send_duration(&self, channel: &ChannelId, success: bool, duration: Duration) {
        self.lock().sends.push((channel.clone(), success, duration));
    }

    fn breaker_state(&self, channel: &ChannelId, state: BreakerState) {
        self.lock().breaker_states.insert(channel.clone(), state);
    }

    fn redaction(&self, rule: &str) {
        *self.lock().redactions.entry(rule.to_string()).or_default() += 1;
    }
}

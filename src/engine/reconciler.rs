//! The reconciler: one short-lived, idempotent pass over a request.
//!
//! Each invocation reads the current record, sends to every channel that is
//! still owed a delivery and may be tried now, records the outcomes through
//! the status tracker in a single write, and tells the scheduler whether to
//! come back later. Nothing here sleeps or loops.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{Instrument, Span, debug, info, warn};

use super::outcome::{Assessment, Verdict};
use crate::breaker::{BreakerConfig, CircuitBreakers};
use crate::channel::{ChannelRegistry, Message, SendError};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::event::{EventKind, EventSink, TracingEventSink};
use crate::model::{ChannelId, DeliveryAttempt, NotificationRequest, Phase, RequestId, reason};
use crate::retry::RetryPolicy;
use crate::sanitize::Sanitizer;
use crate::status::{StatusEditor, StatusTracker};
use crate::store::RequestStore;
use crate::telemetry::metrics::{MetricsSink, NoopMetrics};
use crate::telemetry::reconcile::{record_phase, record_phase_transition, start_reconcile_span};

/// What the scheduler should do after an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing more to do until the record changes.
    Done,
    /// Invoke again after this delay.
    RequeueAfter(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub retry: RetryPolicy,
    /// Hard limit on a single channel send.
    pub send_timeout: Duration,
    /// Shortest delay ever handed back to the scheduler.
    pub min_requeue: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            send_timeout: Duration::from_secs(10),
            min_requeue: Duration::from_secs(1),
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn RequestStore>,
    tracker: StatusTracker,
    channels: Arc<ChannelRegistry>,
    breakers: Arc<CircuitBreakers>,
    sanitizer: Arc<Sanitizer>,
    metrics: Arc<dyn MetricsSink>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
}

/// Assembles a [`Reconciler`]. Everything but the store and the channels has
/// a default.
pub struct ReconcilerBuilder {
    store: Arc<dyn RequestStore>,
    channels: ChannelRegistry,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    events: Arc<dyn EventSink>,
    sanitizer: Option<Sanitizer>,
    breakers: Option<Arc<CircuitBreakers>>,
    breaker_config: BreakerConfig,
    config: ReconcilerConfig,
}

impl ReconcilerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Share breakers with another reconciler instead of creating new ones.
    pub fn breakers(mut self, breakers: Arc<CircuitBreakers>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Reconciler {
        let breakers = self.breakers.unwrap_or_else(|| {
            Arc::new(CircuitBreakers::new(
                self.breaker_config,
                self.clock.clone(),
                self.metrics.clone(),
            ))
        });
        let sanitizer = self
            .sanitizer
            .unwrap_or_default()
            .with_metrics(self.metrics.clone());
        let tracker = StatusTracker::new(
            self.store.clone(),
            self.clock.clone(),
            self.metrics.clone(),
            self.events.clone(),
            self.config.retry.max_attempts,
        );

        Reconciler {
            store: self.store,
            tracker,
            channels: Arc::new(self.channels),
            breakers,
            sanitizer: Arc::new(sanitizer),
            metrics: self.metrics,
            events: self.events,
            clock: self.clock,
            config: self.config,
        }
    }
}

impl Reconciler {
    pub fn builder(store: Arc<dyn RequestStore>, channels: ChannelRegistry) -> ReconcilerBuilder {
        ReconcilerBuilder {
            store,
            channels,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NoopMetrics),
            events: Arc::new(TracingEventSink),
            sanitizer: None,
            breakers: None,
            breaker_config: BreakerConfig::default(),
            config: ReconcilerConfig::default(),
        }
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Run one reconcile pass for `id`.
    ///
    /// # Errors
    ///
    /// Store failures and exhausted write conflicts. The caller should
    /// re-invoke; nothing was half-applied.
    pub async fn reconcile(&self, id: RequestId) -> Result<Action> {
        let span = start_reconcile_span(&id);
        self.reconcile_inner(id, &span)
            .instrument(span.clone())
            .await
    }

    async fn reconcile_inner(&self, id: RequestId, span: &Span) -> Result<Action> {
        let Some(mut request) = self.store.get(&id).await? else {
            debug!(request_id = %id, "request no longer exists");
            return Ok(Action::Done);
        };
        record_phase(span, request.status.phase);

        if request.status.phase.is_terminal() {
            debug!(request_id = %id, phase = %request.status.phase, "already terminal");
            return Ok(Action::Done);
        }

        if request.status.phase == Phase::Pending {
            let started = self
                .tracker
                .update(&id, |editor| start_processing(editor))
                .await?;
            let Some((fresh, ())) = started else {
                return Ok(Action::Done);
            };
            record_phase_transition(span, Phase::Pending, fresh.status.phase);
            request = fresh;
            if request.status.phase.is_terminal() {
                return Ok(Action::Done);
            }
        }

        let attempts = self.deliver(&request).await;

        let generation = request.generation;
        let phase_before = request.status.phase;
        let committed = self
            .tracker
            .update(&id, |editor| {
                if editor.status().phase.is_terminal() {
                    return Ok(Action::Done);
                }
                start_processing(editor)?;
                for attempt in &attempts {
                    editor.record_attempt(attempt.clone());
                }
                if editor.generation() != generation {
                    // The spec changed under this pass. Keep the audit trail
                    // but let the next pass settle against the new channels.
                    return Ok(Action::RequeueAfter(self.config.min_requeue));
                }
                editor.observe_version(generation);
                let channels = editor.spec().channels.clone();
                self.settle(editor, &channels)
            })
            .await?;

        let Some((request, action)) = committed else {
            debug!(request_id = %id, "request deleted mid-reconcile");
            return Ok(Action::Done);
        };

        let phase_after = request.status.phase;
        record_phase(span, phase_after);
        if phase_after != phase_before {
            record_phase_transition(span, phase_before, phase_after);
        }
        info!(
            request_id = %id,
            phase = %phase_after,
            attempted = attempts.len(),
            ?action,
            "reconciled"
        );
        Ok(action)
    }

    /// Send to every channel that is owed a delivery and may be tried now.
    /// At most one attempt per channel.
    async fn deliver(&self, request: &NotificationRequest) -> Vec<DeliveryAttempt> {
        let status = &request.status;
        let now = self.clock.now();
        let policy = &self.config.retry;
        let mut seen = HashSet::new();
        let mut attempts = Vec::new();
        let mut message: Option<Message> = None;

        for channel in &request.spec.channels {
            if !seen.insert(channel) {
                continue;
            }
            if status.has_channel_succeeded(channel) || policy.is_exhausted(status, channel) {
                continue;
            }
            if let Some(due) = policy.retry_due_at(status, channel) {
                if due > now {
                    debug!(request_id = %request.id, %channel, %due, "retry not due yet");
                    continue;
                }
            }
            if !self.breakers.allow_request(channel) {
                self.events.emit(EventKind::ChannelSkipped {
                    id: request.id,
                    channel: channel.clone(),
                    reason: reason::CIRCUIT_OPEN.to_string(),
                });
                continue;
            }

            let message = message.get_or_insert_with(|| self.compose(request));
            let attempt_number = status.attempt_count_for_channel(channel) + 1;
            attempts.push(self.attempt(channel, attempt_number, message).await);
        }

        attempts
    }

    /// Build the sanitized outbound message.
    fn compose(&self, request: &NotificationRequest) -> Message {
        Message {
            request_id: request.id,
            subject: self.sanitizer.sanitize(&request.spec.subject).into_owned(),
            body: self.sanitizer.sanitize(&request.spec.body).into_owned(),
            priority: request.spec.priority,
            kind: request.spec.kind,
        }
    }

    /// One bounded send, classified and reported to the breaker.
    async fn attempt(
        &self,
        channel: &ChannelId,
        attempt_number: u32,
        message: &Message,
    ) -> DeliveryAttempt {
        let started = Instant::now();
        let sender = self.channels.get(channel);
        let result = match sender {
            None => Err(SendError::config(format!(
                "no sender registered for channel {channel}"
            ))),
            Some(sender) => {
                match tokio::time::timeout(self.config.send_timeout, sender.send(message)).await {
                    Ok(result) => result,
                    Err(_) => Err(SendError::timeout(format!(
                        "no response within {}s",
                        self.config.send_timeout.as_secs_f64()
                    ))),
                }
            }
        };
        let elapsed = started.elapsed();
        let timestamp = self.clock.now();
        self.metrics.send_duration(channel, result.is_ok(), elapsed);

        match result {
            Ok(_) => {
                self.breakers.record_success(channel);
                DeliveryAttempt::success(channel.clone(), attempt_number, timestamp)
                    .with_duration(elapsed)
            }
            Err(err) => {
                if sender.is_some() {
                    self.breakers.record_failure(channel);
                }
                let permanent = !self.config.retry.is_retryable(&err);
                let error = self.sanitizer.sanitize(&err.to_string()).into_owned();
                warn!(
                    request_id = %message.request_id,
                    %channel,
                    attempt = attempt_number,
                    permanent,
                    error = %error,
                    "send failed"
                );
                DeliveryAttempt::failure(channel.clone(), attempt_number, timestamp, error, permanent)
                    .with_retry_after(err.retry_after)
                    .with_duration(elapsed)
            }
        }
    }

    /// Decide the phase from the (already updated) audit trail.
    fn settle(&self, editor: &mut StatusEditor<'_>, channels: &[ChannelId]) -> Result<Action> {
        let assessment = Assessment::of(editor.status(), channels, &self.config.retry);
        let summary = assessment.summary();

        match assessment.verdict() {
            Verdict::Delivered => {
                editor.transition_phase(Phase::Sent, reason::ALL_DELIVERIES_SUCCEEDED, summary)?;
                Ok(Action::Done)
            }
            Verdict::Exhausted => {
                if !assessment.delivered.is_empty() && editor.status().phase == Phase::Sending {
                    editor.transition_phase(
                        Phase::PartiallySent,
                        reason::PARTIAL_DELIVERY,
                        summary.clone(),
                    )?;
                }
                let why = if !assessment.delivered.is_empty() {
                    reason::CHANNELS_EXHAUSTED
                } else if assessment.any_capped() {
                    reason::MAX_RETRIES_EXCEEDED
                } else {
                    reason::ALL_DELIVERIES_FAILED
                };
                editor.transition_phase(Phase::Failed, why, summary)?;
                Ok(Action::Done)
            }
            Verdict::InProgress => {
                if !assessment.delivered.is_empty() {
                    editor.transition_phase(
                        Phase::PartiallySent,
                        reason::PARTIAL_DELIVERY,
                        summary,
                    )?;
                } else if assessment.most_failed().is_some() {
                    editor.set_condition(reason::RETRY_SCHEDULED, summary);
                } else {
                    editor.set_condition(reason::CIRCUIT_OPEN, summary);
                }
                Ok(Action::RequeueAfter(self.requeue_delay(editor, &assessment)))
            }
        }
    }

    /// Wait for the most-failed channel's backoff (or, if nothing has failed
    /// yet, for the soonest breaker to cool down).
    fn requeue_delay(&self, editor: &StatusEditor<'_>, assessment: &Assessment) -> Duration {
        let delay = match assessment.most_failed() {
            Some(channel) => self.ready_in(editor, channel),
            None => assessment
                .eligible
                .iter()
                .map(|(channel, _)| self.ready_in(editor, channel))
                .min()
                .unwrap_or(Duration::ZERO),
        };
        delay.max(self.config.min_requeue)
    }

    /// Time until `channel` may be tried again: its retry backoff or its
    /// breaker cooldown, whichever ends later.
    fn ready_in(&self, editor: &StatusEditor<'_>, channel: &ChannelId) -> Duration {
        let backoff = self
            .config
            .retry
            .retry_due_at(editor.status(), channel)
            .and_then(|due| (due - editor.now()).to_std().ok())
            .unwrap_or(Duration::ZERO);
        let cooldown = self
            .breakers
            .remaining_cooldown(channel)
            .unwrap_or(Duration::ZERO);
        backoff.max(cooldown)
    }
}

fn start_processing(editor: &mut StatusEditor<'_>) -> Result<()> {
    if editor.status().phase == Phase::Pending {
        editor.transition_phase(Phase::Sending, reason::PROCESSING_STARTED, "delivery in progress")?;
        editor.mark_processing_started();
    }
    Ok(())
}

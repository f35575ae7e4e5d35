//! Status/audit tracker.
//!
//! The one place that mutates a request's status. Mutations run inside
//! [`StatusTracker::update`], which reads the request, applies the caller's
//! edits through a [`StatusEditor`] and writes back with a version check,
//! retrying on conflict with a fresh read. Guards live in the editor, so a
//! retried batch is re-validated against the fresh state: an attempt for a
//! channel that meanwhile succeeded, or that would exceed the attempt cap, is
//! dropped rather than duplicated.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::event::{EventKind, EventSink};
use crate::model::{
    DeliveryAttempt, NotificationRequest, NotificationSpec, NotificationStatus, Phase, RequestId,
};
use crate::telemetry::metrics::MetricsSink;

/// Default number of read-modify-write rounds before giving up on conflicts.
pub const DEFAULT_WRITE_ATTEMPTS: u32 = 3;

/// Validated, in-memory edits to one status. Nothing is persisted until the
/// enclosing [`StatusTracker::update`] commits.
pub struct StatusEditor<'a> {
    spec: &'a NotificationSpec,
    generation: i64,
    status: &'a mut NotificationStatus,
    now: DateTime<Utc>,
    max_attempts: u32,
    transitions: Vec<(Phase, Phase, String)>,
    recorded: Vec<DeliveryAttempt>,
}

impl<'a> StatusEditor<'a> {
    fn new(request: &'a mut NotificationRequest, now: DateTime<Utc>, max_attempts: u32) -> Self {
        Self {
            spec: &request.spec,
            generation: request.generation,
            status: &mut request.status,
            now,
            max_attempts,
            transitions: Vec::new(),
            recorded: Vec::new(),
        }
    }

    pub fn status(&self) -> &NotificationStatus {
        self.status
    }

    /// The spec as of the read this edit runs against.
    pub fn spec(&self) -> &NotificationSpec {
        self.spec
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Append `attempt` to the audit trail and refresh the counters.
    ///
    /// Returns `false` (and changes nothing) if the request is terminal, the
    /// channel already has a success, or the channel is at its attempt cap.
    /// The attempt number is reassigned from the current trail.
    pub fn record_attempt(&mut self, mut attempt: DeliveryAttempt) -> bool {
        if self.status.phase.is_terminal() {
            return false;
        }
        if self.status.has_channel_succeeded(&attempt.channel) {
            debug!(channel = %attempt.channel, "dropping attempt for already delivered channel");
            return false;
        }
        let count = self.status.attempt_count_for_channel(&attempt.channel);
        if count >= self.max_attempts {
            debug!(channel = %attempt.channel, count, "dropping attempt beyond cap");
            return false;
        }

        attempt.attempt_number = count + 1;
        self.status.delivery_attempts.push(attempt.clone());
        self.status.recount();
        self.recorded.push(attempt);
        true
    }

    /// Move to `to`, recording `reason` and `message`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] if the edge is not part of the phase
    /// state machine. That is a programming error in the caller.
    pub fn transition_phase(
        &mut self,
        to: Phase,
        reason: &str,
        message: impl Into<String>,
    ) -> Result<()> {
        let from = self.status.phase;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition { from, to });
        }

        self.status.phase = to;
        self.status.reason = Some(reason.to_string());
        self.status.message = Some(message.into());
        if from != to {
            self.status.last_transition_time = Some(self.now);
            self.transitions.push((from, to, reason.to_string()));
        }
        if to.is_terminal() && self.status.completion_time.is_none() {
            self.status.completion_time = Some(self.now);
        }
        Ok(())
    }

    /// Update reason and message without changing phase.
    pub fn set_condition(&mut self, reason: &str, message: impl Into<String>) {
        if self.status.phase.is_terminal() {
            return;
        }
        self.status.reason = Some(reason.to_string());
        self.status.message = Some(message.into());
    }

    /// Stamp the processing start time, once.
    pub fn mark_processing_started(&mut self) {
        if self.status.processing_started_at.is_none() {
            self.status.processing_started_at = Some(self.now);
        }
    }

    /// Record that spec `generation` has been processed. Never goes backwards.
    pub fn observe_version(&mut self, generation: i64) {
        self.status.observed_version = self.status.observed_version.max(generation);
    }
}

/// Owns every status write.
#[derive(Clone)]
pub struct StatusTracker {
    store: Arc<dyn crate::store::RequestStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    events: Arc<dyn EventSink>,
    max_attempts_per_channel: u32,
    write_attempts: u32,
}

impl StatusTracker {
    pub fn new(
        store: Arc<dyn crate::store::RequestStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        events: Arc<dyn EventSink>,
        max_attempts_per_channel: u32,
    ) -> Self {
        Self {
            store,
            clock,
            metrics,
            events,
            max_attempts_per_channel,
            write_attempts: DEFAULT_WRITE_ATTEMPTS,
        }
    }

    pub fn with_write_attempts(mut self, n: u32) -> Self {
        self.write_attempts = n.max(1);
        self
    }

    /// Read-modify-write the status of `id`.
    ///
    /// `edit` may run more than once (once per conflicting write). Returns
    /// `None` if the request does not exist. If `edit` leaves the status
    /// unchanged nothing is written.
    ///
    /// # Errors
    ///
    /// Whatever `edit` returns, store errors, or [`Error::Conflict`] once all
    /// write attempts lost the race.
    pub async fn update<T, F>(
        &self,
        id: &RequestId,
        mut edit: F,
    ) -> Result<Option<(NotificationRequest, T)>>
    where
        F: FnMut(&mut StatusEditor<'_>) -> Result<T> + Send,
        T: Send,
    {
        for round in 1..=self.write_attempts {
            let Some(mut request) = self.store.get(id).await? else {
                return Ok(None);
            };

            let before = request.status.clone();
            let (value, transitions, recorded) = {
                let mut editor = StatusEditor::new(
                    &mut request,
                    self.clock.now(),
                    self.max_attempts_per_channel,
                );
                let value = edit(&mut editor)?;
                (value, editor.transitions, editor.recorded)
            };

            if request.status == before {
                return Ok(Some((request, value)));
            }

            match self
                .store
                .update_status(id, request.resource_version, &request.status)
                .await
            {
                Ok(version) => {
                    request.resource_version = version;
                    self.publish(id, transitions, recorded);
                    return Ok(Some((request, value)));
                }
                Err(Error::Conflict(_)) => {
                    warn!(request_id = %id, round, "status write conflict, re-reading");
                }
                Err(Error::NotFound(_)) => return Ok(None),
                Err(e) => return Err(e),
            }
        }

        Err(Error::Conflict(id.to_string()))
    }

    /// Append one attempt and persist.
    pub async fn record_attempt(
        &self,
        id: &RequestId,
        attempt: DeliveryAttempt,
    ) -> Result<Option<NotificationRequest>> {
        let updated = self
            .update(id, |editor| Ok(editor.record_attempt(attempt.clone())))
            .await?;
        Ok(updated.map(|(request, _)| request))
    }

    /// Validate and persist one phase transition.
    pub async fn transition_phase(
        &self,
        id: &RequestId,
        to: Phase,
        reason: &str,
        message: &str,
    ) -> Result<Option<NotificationRequest>> {
        let updated = self
            .update(id, |editor| editor.transition_phase(to, reason, message))
            .await?;
        Ok(updated.map(|(request, _)| request))
    }

    fn publish(
        &self,
        id: &RequestId,
        transitions: Vec<(Phase, Phase, String)>,
        recorded: Vec<DeliveryAttempt>,
    ) {
        for attempt in recorded {
            self.events.emit(EventKind::DeliveryAttempted {
                id: *id,
                success: attempt.is_success(),
                channel: attempt.channel,
                attempt: attempt.attempt_number,
                permanent: attempt.permanent,
                error: attempt.error,
            });
        }
        for (from, to, reason) in transitions {
            self.metrics.phase_transition(from, to);
            self.events.emit(EventKind::PhaseChanged {
                id: *id,
                from,
                to,
                reason,
            });
        }
    }
}

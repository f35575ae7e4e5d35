//! Core data model.
//!
//! A notification request is a declarative record: what to say, how urgent it
//! is, and which channels should carry it. The status half of the record is
//! owned by the reconciler and only ever mutated through the status tracker.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Newtype for notification request IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RequestId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Validation(format!("bad request id {s:?}: {e}")))
    }
}

/// Identifier of a delivery channel (e.g. "console", "webhook").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Spec
// ---------------------------------------------------------------------------

/// How urgent a notification is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(Error::Validation(format!("unknown priority: {other}"))),
        }
    }
}

/// What kind of notification this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationType {
    #[default]
    Alert,
    StatusUpdate,
    Escalation,
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NotificationType::Alert => "alert",
            NotificationType::StatusUpdate => "status-update",
            NotificationType::Escalation => "escalation",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for NotificationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "alert" => Ok(NotificationType::Alert),
            "status-update" | "status_update" => Ok(NotificationType::StatusUpdate),
            "escalation" => Ok(NotificationType::Escalation),
            other => Err(Error::Validation(format!("unknown notification type: {other}"))),
        }
    }
}

/// The desired state of a notification request. Written by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSpec {
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(rename = "type", default)]
    pub kind: NotificationType,
    /// Target channels, in delivery order. Never empty, never duplicated.
    pub channels: Vec<ChannelId>,
}

impl NotificationSpec {
    /// Drop duplicate channels (keeping first occurrence) and reject specs
    /// that cannot be delivered.
    pub fn normalized(mut self) -> Result<Self> {
        let mut seen = HashSet::new();
        self.channels
            .retain(|c| !c.as_str().trim().is_empty() && seen.insert(c.clone()));

        if self.channels.is_empty() {
            return Err(Error::Validation(
                "at least one channel is required".to_string(),
            ));
        }
        if self.subject.trim().is_empty() {
            return Err(Error::Validation("subject must not be empty".to_string()));
        }
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Coarse lifecycle stage of a notification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    /// Accepted, not yet picked up.
    #[default]
    Pending,
    /// Delivery in progress, nothing delivered yet.
    Sending,
    /// Every channel delivered. Terminal.
    Sent,
    /// Some channels delivered, others still retrying.
    PartiallySent,
    /// Every undelivered channel is exhausted. Terminal.
    Failed,
}

impl Phase {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, to),
            (Pending, Sending)
                | (Sending, Sent)
                | (Sending, PartiallySent)
                | (Sending, Failed)
                | (PartiallySent, PartiallySent) // further retries
                | (PartiallySent, Sent)
                | (PartiallySent, Failed)
        )
    }

    /// Is this a terminal phase?
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Sent | Phase::Failed)
    }

    pub const ALL: [Phase; 5] = [
        Phase::Pending,
        Phase::Sending,
        Phase::Sent,
        Phase::PartiallySent,
        Phase::Failed,
    ];
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Sending => "Sending",
            Phase::Sent => "Sent",
            Phase::PartiallySent => "PartiallySent",
            Phase::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Phase::ALL
            .into_iter()
            .find(|p| p.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Validation(format!("unknown phase: {s}")))
    }
}

/// Machine-readable reasons recorded alongside phase changes.
pub mod reason {
    pub const PROCESSING_STARTED: &str = "ProcessingStarted";
    pub const ALL_DELIVERIES_SUCCEEDED: &str = "AllDeliveriesSucceeded";
    pub const PARTIAL_DELIVERY: &str = "PartialDelivery";
    pub const RETRY_SCHEDULED: &str = "RetryScheduled";
    pub const CIRCUIT_OPEN: &str = "CircuitOpen";
    pub const MAX_RETRIES_EXCEEDED: &str = "MaxRetriesExceeded";
    pub const ALL_DELIVERIES_FAILED: &str = "AllDeliveriesFailed";
    /// Some channels delivered, the rest can no longer be retried.
    pub const CHANNELS_EXHAUSTED: &str = "ChannelsExhausted";
}

// ---------------------------------------------------------------------------
// Delivery attempts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed,
}

/// One recorded try to send to one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAttempt {
    pub channel: ChannelId,
    /// 1-based, per channel.
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The failure can never succeed on retry (auth, bad request, unknown channel).
    #[serde(default)]
    pub permanent: bool,
    /// Upstream asked us to wait at least this long before retrying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl DeliveryAttempt {
    pub fn success(channel: ChannelId, attempt_number: u32, timestamp: DateTime<Utc>) -> Self {
        Self {
            channel,
            attempt_number,
            timestamp,
            outcome: AttemptOutcome::Success,
            error: None,
            permanent: false,
            retry_after_seconds: None,
            duration_ms: 0,
        }
    }

    pub fn failure(
        channel: ChannelId,
        attempt_number: u32,
        timestamp: DateTime<Utc>,
        error: impl Into<String>,
        permanent: bool,
    ) -> Self {
        Self {
            channel,
            attempt_number,
            timestamp,
            outcome: AttemptOutcome::Failed,
            error: Some(error.into()),
            permanent,
            retry_after_seconds: None,
            duration_ms: 0,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<std::time::Duration>) -> Self {
        self.retry_after_seconds = retry_after.map(|d| d.as_secs());
        self
    }

    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Observed state of a notification request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationStatus {
    pub phase: Phase,
    pub reason: Option<String>,
    pub message: Option<String>,
    /// Append-only audit trail. Never truncated or reordered.
    pub delivery_attempts: Vec<DeliveryAttempt>,
    pub total_attempts: u32,
    pub successful_deliveries: u32,
    pub failed_deliveries: u32,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Set iff `phase` is terminal.
    pub completion_time: Option<DateTime<Utc>>,
    /// Last spec generation fully processed.
    pub observed_version: i64,
}

impl NotificationStatus {
    pub fn attempts_for<'a>(
        &'a self,
        channel: &'a ChannelId,
    ) -> impl Iterator<Item = &'a DeliveryAttempt> + 'a {
        self.delivery_attempts
            .iter()
            .filter(move |a| &a.channel == channel)
    }

    pub fn has_channel_succeeded(&self, channel: &ChannelId) -> bool {
        self.attempts_for(channel).any(DeliveryAttempt::is_success)
    }

    pub fn attempt_count_for_channel(&self, channel: &ChannelId) -> u32 {
        self.attempts_for(channel).count() as u32
    }

    pub fn failed_count_for_channel(&self, channel: &ChannelId) -> u32 {
        self.attempts_for(channel).filter(|a| !a.is_success()).count() as u32
    }

    pub fn last_attempt_for_channel<'a>(
        &'a self,
        channel: &'a ChannelId,
    ) -> Option<&'a DeliveryAttempt> {
        self.attempts_for(channel).last()
    }

    /// Highest per-channel attempt count, 0 when nothing was attempted.
    pub fn max_attempt_count_across_channels(&self) -> u32 {
        let mut seen: Vec<&ChannelId> = Vec::new();
        let mut max = 0;
        for attempt in &self.delivery_attempts {
            if seen.contains(&&attempt.channel) {
                continue;
            }
            seen.push(&attempt.channel);
            max = max.max(self.attempt_count_for_channel(&attempt.channel));
        }
        max
    }

    /// Recompute the derived counters from the audit trail.
    pub(crate) fn recount(&mut self) {
        self.total_attempts = self.delivery_attempts.len() as u32;
        self.successful_deliveries =
            self.delivery_attempts.iter().filter(|a| a.is_success()).count() as u32;
        self.failed_deliveries = self.total_attempts - self.successful_deliveries;
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// The unit of work: one notification fanned out to one or more channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub id: RequestId,
    /// Spec version. Starts at 1, bumped on every spec update.
    pub generation: i64,
    /// Store write version, used for optimistic concurrency.
    pub resource_version: i64,
    pub spec: NotificationSpec,
    #[serde(default)]
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationRequest {
    pub(crate) fn new(spec: NotificationSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: RequestId::new(),
            generation: 1,
            resource_version: 1,
            spec,
            status: NotificationStatus::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new notification requests. The public API for submitting work.
#[derive(Debug, Clone)]
pub struct NewNotificationRequest {
    pub(crate) subject: String,
    pub(crate) body: String,
    pub(crate) priority: Priority,
    pub(crate) kind: NotificationType,
    pub(crate) channels: Vec<ChannelId>,
}

impl NewNotificationRequest {
    pub fn new(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            priority: Priority::default(),
            kind: NotificationType::default(),
            channels: Vec::new(),
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn kind(mut self, kind: NotificationType) -> Self {
        self.kind = kind;
        self
    }

    pub fn channel(mut self, channel: impl Into<ChannelId>) -> Self {
        self.channels.push(channel.into());
        self
    }

    pub fn channels<I, C>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<ChannelId>,
    {
        self.channels.extend(channels.into_iter().map(Into::into));
        self
    }

    /// Validate and produce the spec to store.
    pub fn into_spec(self) -> Result<NotificationSpec> {
        NotificationSpec {
            subject: self.subject,
            body: self.body,
            priority: self.priority,
            kind: self.kind,
            channels: self.channels,
        }
        .normalized()
    }
}

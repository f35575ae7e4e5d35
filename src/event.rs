//! Structured events emitted by the reconciler and the status tracker.
//!
//! Events are the audit voice of the system: every committed phase change,
//! every committed delivery attempt, every channel skipped in a round.
//! Consumers plug in an [`EventSink`] to forward them to dashboards or an
//! audit log.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ChannelId, Phase, RequestId};

/// A structured event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number within one sink. Consumers can detect gaps.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    PhaseChanged {
        id: RequestId,
        from: Phase,
        to: Phase,
        reason: String,
    },
    DeliveryAttempted {
        id: RequestId,
        channel: ChannelId,
        attempt: u32,
        success: bool,
        permanent: bool,
        error: Option<String>,
    },
    ChannelSkipped {
        id: RequestId,
        channel: ChannelId,
        reason: String,
    },
}

/// Destination for events.
pub trait EventSink: Send + Sync {
    fn emit(&self, kind: EventKind);
}

/// Writes every event to the tracing pipeline.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, kind: EventKind) {
        match &kind {
            EventKind::PhaseChanged {
                id,
                from,
                to,
                reason,
            } => {
                tracing::info!(request_id = %id, %from, %to, reason, "phase changed");
            }
            EventKind::DeliveryAttempted {
                id,
                channel,
                attempt,
                success: true,
                ..
            } => {
                tracing::info!(request_id = %id, %channel, attempt, "delivered");
            }
            EventKind::DeliveryAttempted {
                id,
                channel,
                attempt,
                permanent,
                error,
                ..
            } => {
                tracing::warn!(
                    request_id = %id,
                    %channel,
                    attempt,
                    permanent,
                    error = error.as_deref().unwrap_or(""),
                    "delivery failed"
                );
            }
            EventKind::ChannelSkipped {
                id,
                channel,
                reason,
            } => {
                tracing::debug!(request_id = %id, %channel, reason, "channel skipped");
            }
        }
    }
}

/// Keeps events in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every event emitted so far.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, kind: EventKind) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let seq = events.len() as u64 + 1;
        events.push(Event {
            seq,
            timestamp: Utc::now(),
            kind,
        });
    }
}

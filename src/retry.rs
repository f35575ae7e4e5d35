//! Retry policy: backoff progression, attempt cap and error classification.
//!
//! Pure functions over the audit trail. Nothing here sleeps; the reconciler
//! turns the answers into a requeue delay for its scheduler.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::channel::{SendError, SendErrorKind};
use crate::model::{ChannelId, NotificationStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    Retryable,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
    /// Attempts per channel before it is exhausted.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(30),
            multiplier: 2,
            max_backoff: Duration::from_secs(480),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Backoff after `attempt_count` earlier retries:
    /// `30s, 60s, 120s, 240s, 480s, 480s, ...` with the defaults.
    pub fn next_backoff(&self, attempt_count: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(attempt_count);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    pub fn classify(&self, error: &SendError) -> Retryability {
        match error.kind {
            SendErrorKind::Timeout | SendErrorKind::Network => Retryability::Retryable,
            SendErrorKind::Http { status } => match status {
                408 | 429 => Retryability::Retryable,
                500..=599 => Retryability::Retryable,
                _ => Retryability::Permanent,
            },
            SendErrorKind::Config => Retryability::Permanent,
        }
    }

    pub fn is_retryable(&self, error: &SendError) -> bool {
        self.classify(error) == Retryability::Retryable
    }

    /// A channel is exhausted once it hit the attempt cap or its latest
    /// failure was permanent. Delivered channels are never exhausted.
    pub fn is_exhausted(&self, status: &NotificationStatus, channel: &ChannelId) -> bool {
        if status.has_channel_succeeded(channel) {
            return false;
        }
        if status.attempt_count_for_channel(channel) >= self.max_attempts {
            return true;
        }
        status
            .last_attempt_for_channel(channel)
            .is_some_and(|a| a.permanent)
    }

    /// How long to wait after the latest failure of `channel` before trying
    /// again. A server `Retry-After` can only lengthen the wait.
    pub fn backoff_for(&self, status: &NotificationStatus, channel: &ChannelId) -> Duration {
        let failed = status.failed_count_for_channel(channel);
        let backoff = self.next_backoff(failed.saturating_sub(1));
        let hinted = status
            .last_attempt_for_channel(channel)
            .and_then(|a| a.retry_after_seconds)
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);
        backoff.max(hinted)
    }

    /// When the next try of `channel` becomes due. `None` if it has never
    /// been attempted or already succeeded.
    pub fn retry_due_at(
        &self,
        status: &NotificationStatus,
        channel: &ChannelId,
    ) -> Option<DateTime<Utc>> {
        let last = status.last_attempt_for_channel(channel)?;
        if last.is_success() {
            return None;
        }
        let backoff = chrono::Duration::from_std(self.backoff_for(status, channel))
            .unwrap_or(chrono::Duration::MAX);
        Some(
            last.timestamp
                .checked_add_signed(backoff)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }
}

//! Aggregate assessment of a request's channels after a delivery round.

use crate::model::{ChannelId, NotificationStatus};
use crate::retry::RetryPolicy;

/// Where one channel stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelProgress {
    Delivered,
    /// No further attempts will be made.
    Exhausted {
        /// Hit the attempt cap (as opposed to a permanent error).
        capped: bool,
        last_error: Option<String>,
    },
    /// Still eligible: never tried, skipped this round, or waiting out a
    /// backoff.
    Eligible { failed_attempts: u32 },
}

pub fn channel_progress(
    status: &NotificationStatus,
    channel: &ChannelId,
    policy: &RetryPolicy,
) -> ChannelProgress {
    if status.has_channel_succeeded(channel) {
        return ChannelProgress::Delivered;
    }
    if policy.is_exhausted(status, channel) {
        let last = status.last_attempt_for_channel(channel);
        return ChannelProgress::Exhausted {
            capped: last.is_none_or(|a| !a.permanent),
            last_error: last.and_then(|a| a.error.clone()),
        };
    }
    ChannelProgress::Eligible {
        failed_attempts: status.failed_count_for_channel(channel),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Every channel delivered.
    Delivered,
    /// Nothing left that could make progress.
    Exhausted,
    /// At least one channel can still be tried.
    InProgress,
}

#[derive(Debug, Default)]
pub struct Assessment {
    pub delivered: Vec<ChannelId>,
    pub exhausted: Vec<(ChannelId, bool, Option<String>)>,
    pub eligible: Vec<(ChannelId, u32)>,
}

impl Assessment {
    pub fn of(status: &NotificationStatus, channels: &[ChannelId], policy: &RetryPolicy) -> Self {
        let mut assessment = Self::default();
        for channel in channels {
            match channel_progress(status, channel, policy) {
                ChannelProgress::Delivered => assessment.delivered.push(channel.clone()),
                ChannelProgress::Exhausted { capped, last_error } => {
                    assessment
                        .exhausted
                        .push((channel.clone(), capped, last_error))
                }
                ChannelProgress::Eligible { failed_attempts } => {
                    assessment.eligible.push((channel.clone(), failed_attempts))
                }
            }
        }
        assessment
    }

    pub fn verdict(&self) -> Verdict {
        if !self.eligible.is_empty() {
            Verdict::InProgress
        } else if self.exhausted.is_empty() {
            Verdict::Delivered
        } else {
            Verdict::Exhausted
        }
    }

    pub fn any_capped(&self) -> bool {
        self.exhausted.iter().any(|(_, capped, _)| *capped)
    }

    /// The eligible channel with the most failures, if any has failed.
    pub fn most_failed(&self) -> Option<&ChannelId> {
        self.eligible
            .iter()
            .filter(|(_, failed)| *failed > 0)
            .max_by_key(|(_, failed)| *failed)
            .map(|(channel, _)| channel)
    }

    /// Human-readable summary, e.g.
    /// `delivered: console; failed: webhook (HTTP 401: unauthorized)`.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.delivered.is_empty() {
            parts.push(format!("delivered: {}", join(&self.delivered)));
        }
        if !self.exhausted.is_empty() {
            let failed: Vec<String> = self
                .exhausted
                .iter()
                .map(|(channel, capped, error)| {
                    let why = error.as_deref().unwrap_or("no attempts");
                    if *capped {
                        format!("{channel} (retries exhausted: {why})")
                    } else {
                        format!("{channel} ({why})")
                    }
                })
                .collect();
            parts.push(format!("failed: {}", failed.join(", ")));
        }
        if !self.eligible.is_empty() {
            let pending: Vec<ChannelId> = self.eligible.iter().map(|(c, _)| c.clone()).collect();
            parts.push(format!("pending: {}", join(&pending)));
        }
        parts.join("; ")
    }
}

fn join(channels: &[ChannelId]) -> String {
    channels
        .iter()
        .map(ChannelId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

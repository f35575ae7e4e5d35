//! Delivery channels.
//!
//! A channel is anything that can carry a [`Message`]: the console, a chat
//! webhook, a test double. Each adapter implements [`ChannelSender`] and
//! reports failures as a [`SendError`] whose [`SendErrorKind`] the retry
//! policy classifies as retryable or permanent.

pub mod console;
pub mod scripted;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::model::{ChannelId, NotificationType, Priority, RequestId};

pub use console::ConsoleSender;
pub use scripted::ScriptedSender;
pub use webhook::WebhookSender;

/// Sanitized content handed to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub request_id: RequestId,
    pub subject: String,
    pub body: String,
    pub priority: Priority,
    #[serde(rename = "type")]
    pub kind: NotificationType,
}

impl Message {
    /// Subject prefixed with the priority, e.g. `[CRITICAL] disk full`.
    pub fn headline(&self) -> String {
        format!(
            "[{}] {}",
            self.priority.to_string().to_ascii_uppercase(),
            self.subject
        )
    }
}

/// Receipt for a successful send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Adapter-specific detail, e.g. the upstream HTTP status.
    pub detail: Option<String>,
}

/// Why a send failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    /// No answer within the send timeout.
    Timeout,
    /// Connection refused, reset, DNS failure and the like.
    Network,
    /// Upstream answered with a non-success HTTP status.
    Http { status: u16 },
    /// The channel is misconfigured or not registered.
    Config,
}

impl std::fmt::Display for SendErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendErrorKind::Timeout => write!(f, "timeout"),
            SendErrorKind::Network => write!(f, "network"),
            SendErrorKind::Http { status } => write!(f, "HTTP {status}"),
            SendErrorKind::Config => write!(f, "config"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct SendError {
    pub kind: SendErrorKind,
    pub message: String,
    /// Upstream asked for at least this much delay before the next try.
    pub retry_after: Option<Duration>,
}

impl SendError {
    fn new(kind: SendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(SendErrorKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(SendErrorKind::Network, message)
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(SendErrorKind::Http { status }, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(SendErrorKind::Config, message)
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

/// The uniform send contract every channel adapter implements.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Short adapter name for logs ("console", "webhook", ...).
    fn kind(&self) -> &'static str;

    async fn send(&self, message: &Message) -> Result<Delivery, SendError>;
}

/// Maps channel ids to their senders.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    senders: HashMap<ChannelId, Arc<dyn ChannelSender>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<ChannelId>, sender: Arc<dyn ChannelSender>) {
        self.senders.insert(id.into(), sender);
    }

    pub fn with(mut self, id: impl Into<ChannelId>, sender: Arc<dyn ChannelSender>) -> Self {
        self.register(id, sender);
        self
    }

    pub fn get(&self, id: &ChannelId) -> Option<&Arc<dyn ChannelSender>> {
        self.senders.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ChannelId> {
        self.senders.keys()
    }
}

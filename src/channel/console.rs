//! Console channel: writes the message to the log (and optionally stdout).
//! Never fails.

use async_trait::async_trait;
use tracing::info;

use super::{ChannelSender, Delivery, Message, SendError};

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleSender {
    stdout: bool,
}

impl ConsoleSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also print each message to stdout.
    pub fn with_stdout(mut self) -> Self {
        self.stdout = true;
        self
    }
}

#[async_trait]
impl ChannelSender for ConsoleSender {
    fn kind(&self) -> &'static str {
        "console"
    }

    async fn send(&self, message: &Message) -> Result<Delivery, SendError> {
        info!(
            request_id = %message.request_id,
            priority = %message.priority,
            kind = %message.kind,
            subject = %message.subject,
            "notification"
        );
        if self.stdout {
            println!("{}\n{}", message.headline(), message.body);
        }
        Ok(Delivery::default())
    }
}

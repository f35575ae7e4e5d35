//! A channel that replays a script of results. Test double for the send
//! contract, also handy for dry runs.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::webhook::classify_response;
use super::{ChannelSender, Delivery, Message, SendError};

type SendResult = Result<Delivery, SendError>;

pub struct ScriptedSender {
    script: Mutex<VecDeque<SendResult>>,
    /// Returned once the script runs out.
    fallback: SendResult,
    delay: Option<Duration>,
    calls: AtomicUsize,
    received: Mutex<Vec<Message>>,
}

impl ScriptedSender {
    fn with_script(script: Vec<SendResult>, fallback: SendResult) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: None,
            calls: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        }
    }

    /// Always succeeds.
    pub fn ok() -> Self {
        Self::with_script(Vec::new(), Ok(Delivery::default()))
    }

    /// Always fails with `error`.
    pub fn failing(error: SendError) -> Self {
        Self::with_script(Vec::new(), Err(error))
    }

    /// Replays `results` in order, then repeats the last one.
    pub fn sequence(results: Vec<SendResult>) -> Self {
        let fallback = results.last().cloned().unwrap_or(Ok(Delivery::default()));
        Self::with_script(results, fallback)
    }

    /// Behaves like a webhook answering with these HTTP statuses in order.
    pub fn http_statuses(statuses: &[u16]) -> Self {
        Self::sequence(
            statuses
                .iter()
                .map(|&status| classify_response(status, None))
                .collect(),
        )
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of sends attempted so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every message this sender was handed.
    pub fn received(&self) -> Vec<Message> {
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ChannelSender for ScriptedSender {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn send(&self, message: &Message) -> SendResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.received
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

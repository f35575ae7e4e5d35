//! Chat webhook channel.
//!
//! Posts a JSON payload (`text` plus structured fields) to an incoming-webhook
//! URL and surfaces the upstream HTTP status so the retry policy can tell a
//! rate limit or outage from a revoked token.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tracing::debug;

use super::{ChannelSender, Delivery, Message, SendError};
use crate::error::{Error, Result};

pub struct WebhookSender {
    client: reqwest::Client,
    url: SecretString,
}

impl WebhookSender {
    /// Build a sender whose HTTP client gives up after `timeout`.
    pub fn new(url: SecretString, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build webhook client: {e}")))?;
        Ok(Self { client, url })
    }

    fn payload(message: &Message) -> serde_json::Value {
        json!({
            "text": format!("*{}*\n{}", message.headline(), message.body),
            "request_id": message.request_id,
            "priority": message.priority,
            "type": message.kind,
        })
    }
}

#[async_trait]
impl ChannelSender for WebhookSender {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, message: &Message) -> std::result::Result<Delivery, SendError> {
        let response = self
            .client
            .post(self.url.expose_secret())
            .json(&Self::payload(message))
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        debug!(request_id = %message.request_id, status, "webhook responded");

        classify_response(status, retry_after.as_deref())
    }
}

/// Map an upstream HTTP status (and optional `Retry-After` header value) to
/// a send result.
pub fn classify_response(
    status: u16,
    retry_after: Option<&str>,
) -> std::result::Result<Delivery, SendError> {
    if (200..300).contains(&status) {
        return Ok(Delivery {
            detail: Some(format!("HTTP {status}")),
        });
    }

    let message = match status {
        400 => "bad request",
        401 => "unauthorized",
        403 => "forbidden",
        404 => "webhook not found",
        408 => "request timeout",
        429 => "rate limited",
        500..=599 => "upstream error",
        _ => "unexpected status",
    };
    Err(SendError::http(status, message).with_retry_after(retry_after.and_then(parse_retry_after)))
}

/// `Retry-After` in its delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn classify_transport_error(e: reqwest::Error) -> SendError {
    if e.is_timeout() {
        SendError::timeout(e.to_string())
    } else if e.is_builder() {
        SendError::config(e.to_string())
    } else {
        SendError::network(e.to_string())
    }
}

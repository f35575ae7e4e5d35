//! Integration tests for channel adapters. The webhook is exercised against a
//! throwaway HTTP responder on localhost.

use std::sync::Arc;
use std::time::Duration;

use herald_rs::channel::{
    ChannelRegistry, ChannelSender, ConsoleSender, Message, ScriptedSender, SendErrorKind,
    WebhookSender,
};
use herald_rs::model::{ChannelId, NotificationType, Priority, RequestId};
use secrecy::SecretString;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn message() -> Message {
    Message {
        request_id: RequestId::new(),
        subject: "disk full".to_string(),
        body: "node-7 at 99%".to_string(),
        priority: Priority::Critical,
        kind: NotificationType::Alert,
    }
}

/// Answer exactly one HTTP request with `status_line` and `headers`, and
/// hand back the raw request that was received.
async fn respond_once(
    status_line: &'static str,
    headers: &'static str,
) -> (String, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hook", listener.local_addr().unwrap());

    let served = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&received);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if received.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        let response =
            format!("HTTP/1.1 {status_line}\r\n{headers}content-length: 0\r\nconnection: close\r\n\r\n");
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
        String::from_utf8_lossy(&received).into_owned()
    });

    (url, served)
}

// ---------------------------------------------------------------------------
// Console
// ---------------------------------------------------------------------------

#[tokio::test]
async fn console_always_succeeds() {
    let console = ConsoleSender::new().with_stdout();
    assert_eq!(console.kind(), "console");
    assert!(console.send(&message()).await.is_ok());
}

#[test]
fn headline_carries_priority() {
    assert_eq!(message().headline(), "[CRITICAL] disk full");
}

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

#[tokio::test]
async fn webhook_posts_json_and_succeeds_on_2xx() {
    let (url, served) = respond_once("200 OK", "").await;
    let webhook = WebhookSender::new(SecretString::from(url), Duration::from_secs(5)).unwrap();

    let delivery = webhook.send(&message()).await.unwrap();
    assert_eq!(delivery.detail.as_deref(), Some("HTTP 200"));

    let request = served.await.unwrap();
    assert!(request.starts_with("POST /hook"));
    assert!(request.contains("[CRITICAL] disk full"));
    assert!(request.contains("\"priority\":\"critical\""));
}

#[tokio::test]
async fn webhook_surfaces_rate_limit_and_retry_after() {
    let (url, _served) = respond_once("429 Too Many Requests", "retry-after: 45\r\n").await;
    let webhook = WebhookSender::new(SecretString::from(url), Duration::from_secs(5)).unwrap();

    let err = webhook.send(&message()).await.unwrap_err();
    assert_eq!(err.kind, SendErrorKind::Http { status: 429 });
    assert_eq!(err.retry_after, Some(Duration::from_secs(45)));
}

#[tokio::test]
async fn webhook_reports_unauthorized() {
    let (url, _served) = respond_once("401 Unauthorized", "").await;
    let webhook = WebhookSender::new(SecretString::from(url), Duration::from_secs(5)).unwrap();

    let err = webhook.send(&message()).await.unwrap_err();
    assert_eq!(err.kind, SendErrorKind::Http { status: 401 });
    assert_eq!(err.to_string(), "HTTP 401: unauthorized");
}

#[tokio::test]
async fn webhook_connection_refused_is_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hook", listener.local_addr().unwrap());
    drop(listener);

    let webhook = WebhookSender::new(SecretString::from(url), Duration::from_secs(5)).unwrap();
    let err = webhook.send(&message()).await.unwrap_err();
    assert_eq!(err.kind, SendErrorKind::Network);
}

// ---------------------------------------------------------------------------
// Scripted sender and registry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scripted_sender_replays_then_repeats_last() {
    let scripted = ScriptedSender::http_statuses(&[503, 200]);
    assert!(scripted.send(&message()).await.is_err());
    assert!(scripted.send(&message()).await.is_ok());
    assert!(scripted.send(&message()).await.is_ok());
    assert_eq!(scripted.calls(), 3);
    assert_eq!(scripted.received().len(), 3);
}

#[test]
fn registry_maps_ids_to_senders() {
    let registry = ChannelRegistry::new()
        .with("console", Arc::new(ConsoleSender::new()))
        .with("webhook", Arc::new(ScriptedSender::ok()));

    let mut ids: Vec<_> = registry.ids().cloned().collect();
    ids.sort();
    assert_eq!(ids, vec![ChannelId::from("console"), ChannelId::from("webhook")]);
    assert_eq!(
        registry.get(&ChannelId::from("webhook")).map(|s| s.kind()),
        Some("scripted")
    );
    assert!(registry.get(&ChannelId::from("pager")).is_none());
}

//! Integration tests for the retry policy.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use herald_rs::channel::SendError;
use herald_rs::channel::webhook::classify_response;
use herald_rs::model::{ChannelId, DeliveryAttempt, NotificationStatus};
use herald_rs::retry::{RetryPolicy, Retryability};

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

#[test]
fn backoff_doubles_and_caps() {
    let policy = RetryPolicy::default();
    let observed: Vec<_> = (0..6).map(|n| policy.next_backoff(n)).collect();
    assert_eq!(
        observed,
        vec![secs(30), secs(60), secs(120), secs(240), secs(480), secs(480)]
    );
}

#[test]
fn backoff_is_monotonic_and_never_overflows() {
    let policy = RetryPolicy::default();
    let mut previous = Duration::ZERO;
    for n in 0..200 {
        let next = policy.next_backoff(n);
        assert!(next >= previous);
        assert!(next <= policy.max_backoff);
        previous = next;
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[test]
fn transient_errors_are_retryable() {
    let policy = RetryPolicy::default();
    for err in [
        SendError::timeout("slow"),
        SendError::network("connection reset"),
        SendError::http(408, "request timeout"),
        SendError::http(429, "rate limited"),
        SendError::http(500, "boom"),
        SendError::http(503, "unavailable"),
        SendError::http(599, "edge"),
    ] {
        assert!(policy.is_retryable(&err), "{err} should be retryable");
    }
}

#[test]
fn client_errors_are_permanent() {
    let policy = RetryPolicy::default();
    for status in [400, 401, 403, 404, 410, 422] {
        let err = SendError::http(status, "nope");
        assert_eq!(policy.classify(&err), Retryability::Permanent, "HTTP {status}");
    }
    assert!(!policy.is_retryable(&SendError::config("no sender")));
}

#[test]
fn webhook_statuses_map_to_send_results() {
    assert!(classify_response(200, None).is_ok());
    assert!(classify_response(204, None).is_ok());

    let err = classify_response(429, Some("120")).unwrap_err();
    assert_eq!(err.retry_after, Some(secs(120)));

    let err = classify_response(503, Some("Wed, 21 Oct 2015 07:28:00 GMT")).unwrap_err();
    assert_eq!(err.retry_after, None);

    let err = classify_response(302, None).unwrap_err();
    assert!(!RetryPolicy::default().is_retryable(&err));
}

// ---------------------------------------------------------------------------
// Audit-trail driven decisions
// ---------------------------------------------------------------------------

fn status_with(attempts: Vec<DeliveryAttempt>) -> NotificationStatus {
    NotificationStatus {
        delivery_attempts: attempts,
        ..NotificationStatus::default()
    }
}

#[test]
fn channel_is_exhausted_at_cap_or_after_permanent_failure() {
    let policy = RetryPolicy::default();
    let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let webhook = ChannelId::from("webhook");

    let transient: Vec<_> = (1..=4)
        .map(|n| DeliveryAttempt::failure(webhook.clone(), n, t0, "HTTP 503", false))
        .collect();
    assert!(!policy.is_exhausted(&status_with(transient.clone()), &webhook));

    let mut capped = transient;
    capped.push(DeliveryAttempt::failure(webhook.clone(), 5, t0, "HTTP 503", false));
    assert!(policy.is_exhausted(&status_with(capped), &webhook));

    let permanent = vec![DeliveryAttempt::failure(webhook.clone(), 1, t0, "HTTP 401", true)];
    assert!(policy.is_exhausted(&status_with(permanent), &webhook));

    let delivered = vec![DeliveryAttempt::success(webhook.clone(), 1, t0)];
    assert!(!policy.is_exhausted(&status_with(delivered), &webhook));
}

#[test]
fn retry_due_follows_failure_count_and_retry_after() {
    let policy = RetryPolicy::default();
    let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let webhook = ChannelId::from("webhook");

    let one = status_with(vec![DeliveryAttempt::failure(webhook.clone(), 1, t0, "x", false)]);
    assert_eq!(
        policy.retry_due_at(&one, &webhook),
        Some(t0 + chrono::Duration::seconds(30))
    );

    let two = status_with(vec![
        DeliveryAttempt::failure(webhook.clone(), 1, t0, "x", false),
        DeliveryAttempt::failure(webhook.clone(), 2, t0, "x", false),
    ]);
    assert_eq!(policy.backoff_for(&two, &webhook), secs(60));

    // A longer server hint wins, a shorter one is ignored.
    let hinted = status_with(vec![
        DeliveryAttempt::failure(webhook.clone(), 1, t0, "HTTP 429", false)
            .with_retry_after(Some(secs(300))),
    ]);
    assert_eq!(policy.backoff_for(&hinted, &webhook), secs(300));
    let short = status_with(vec![
        DeliveryAttempt::failure(webhook.clone(), 1, t0, "HTTP 429", false)
            .with_retry_after(Some(secs(5))),
    ]);
    assert_eq!(policy.backoff_for(&short, &webhook), secs(30));

    assert_eq!(policy.retry_due_at(&status_with(vec![]), &webhook), None);
}

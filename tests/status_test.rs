//! Integration tests for the status/audit tracker.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use herald_rs::clock::ManualClock;
use herald_rs::error::Error;
use herald_rs::event::{EventKind, MemoryEventSink};
use herald_rs::model::{
    ChannelId, DeliveryAttempt, NewNotificationRequest, Phase, RequestId, reason,
};
use herald_rs::status::StatusTracker;
use herald_rs::store::{MemoryStore, RequestStore};
use herald_rs::telemetry::metrics::RecordingMetrics;

struct Harness {
    store: Arc<MemoryStore>,
    tracker: StatusTracker,
    events: Arc<MemoryEventSink>,
    metrics: Arc<RecordingMetrics>,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
    ));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let events = Arc::new(MemoryEventSink::new());
    let metrics = Arc::new(RecordingMetrics::new());
    let tracker = StatusTracker::new(store.clone(), clock, metrics.clone(), events.clone(), 5);
    Harness {
        store,
        tracker,
        events,
        metrics,
    }
}

async fn submit(store: &MemoryStore) -> RequestId {
    store
        .create(
            NewNotificationRequest::new("disk full", "node-7 at 99%")
                .channel("console")
                .channel("webhook"),
        )
        .await
        .unwrap()
        .id
}

fn failure(channel: &str, n: u32) -> DeliveryAttempt {
    DeliveryAttempt::failure(ChannelId::from(channel), n, Utc::now(), "HTTP 503", false)
}

fn success(channel: &str, n: u32) -> DeliveryAttempt {
    DeliveryAttempt::success(ChannelId::from(channel), n, Utc::now())
}

// ---------------------------------------------------------------------------
// Phase state machine
// ---------------------------------------------------------------------------

#[test]
fn phase_transition_table() {
    use Phase::*;
    let allowed = [
        (Pending, Sending),
        (Sending, Sent),
        (Sending, PartiallySent),
        (Sending, Failed),
        (PartiallySent, PartiallySent),
        (PartiallySent, Sent),
        (PartiallySent, Failed),
    ];
    for from in Phase::ALL {
        for to in Phase::ALL {
            assert_eq!(
                from.can_transition_to(to),
                allowed.contains(&(from, to)),
                "{from} -> {to}"
            );
        }
    }
    assert!(Sent.is_terminal());
    assert!(Failed.is_terminal());
    assert!(!PartiallySent.is_terminal());
}

#[test]
fn phase_parses_case_insensitively_and_defaults_to_pending() {
    assert_eq!("partiallysent".parse::<Phase>().unwrap(), Phase::PartiallySent);
    assert!("Delivered".parse::<Phase>().is_err());

    let status: herald_rs::model::NotificationStatus = serde_json::from_str("{}").unwrap();
    assert_eq!(status.phase, Phase::Pending);
}

#[tokio::test]
async fn illegal_transition_is_rejected_and_nothing_is_written() {
    let h = harness();
    let id = submit(&h.store).await;

    let err = h
        .tracker
        .transition_phase(&id, Phase::Sent, reason::ALL_DELIVERIES_SUCCEEDED, "")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: Phase::Pending,
            to: Phase::Sent
        }
    ));
    assert_eq!(h.store.status_writes(), 0);
}

#[tokio::test]
async fn terminal_transition_sets_completion_time_once() {
    let h = harness();
    let id = submit(&h.store).await;

    h.tracker
        .transition_phase(&id, Phase::Sending, reason::PROCESSING_STARTED, "")
        .await
        .unwrap();
    let sent = h
        .tracker
        .transition_phase(&id, Phase::Sent, reason::ALL_DELIVERIES_SUCCEEDED, "done")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(sent.status.phase, Phase::Sent);
    assert!(sent.status.completion_time.is_some());
    assert_eq!(sent.status.reason.as_deref(), Some(reason::ALL_DELIVERIES_SUCCEEDED));
    assert_eq!(
        h.metrics.transitions(),
        vec![(Phase::Pending, Phase::Sending), (Phase::Sending, Phase::Sent)]
    );

    // Nothing leaves a terminal phase.
    let err = h
        .tracker
        .transition_phase(&id, Phase::PartiallySent, reason::PARTIAL_DELIVERY, "")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

// ---------------------------------------------------------------------------
// Audit trail
// ---------------------------------------------------------------------------

#[tokio::test]
async fn record_attempt_keeps_counters_consistent() {
    let h = harness();
    let id = submit(&h.store).await;

    h.tracker.record_attempt(&id, failure("webhook", 1)).await.unwrap();
    h.tracker.record_attempt(&id, success("console", 1)).await.unwrap();
    let request = h
        .tracker
        .record_attempt(&id, success("webhook", 2))
        .await
        .unwrap()
        .unwrap();

    let status = &request.status;
    assert_eq!(status.total_attempts, 3);
    assert_eq!(status.successful_deliveries, 2);
    assert_eq!(status.failed_deliveries, 1);
    assert_eq!(status.attempt_count_for_channel(&"webhook".into()), 2);
    assert_eq!(status.max_attempt_count_across_channels(), 2);
    assert!(status.has_channel_succeeded(&"console".into()));

    let attempted = h
        .events
        .kinds()
        .into_iter()
        .filter(|k| matches!(k, EventKind::DeliveryAttempted { .. }))
        .count();
    assert_eq!(attempted, 3);
}

#[tokio::test]
async fn last_attempt_for_channel_follows_the_trail() {
    let h = harness();
    let id = submit(&h.store).await;

    h.tracker.record_attempt(&id, failure("webhook", 1)).await.unwrap();
    h.tracker.record_attempt(&id, success("console", 1)).await.unwrap();
    h.tracker.record_attempt(&id, failure("webhook", 2)).await.unwrap();
    let request = h.store.get(&id).await.unwrap().unwrap();

    let webhook = ChannelId::from("webhook");
    let last = request.status.last_attempt_for_channel(&webhook).unwrap();
    assert_eq!(last.attempt_number, 2);
    assert!(!last.is_success());

    let pager = ChannelId::from("pager");
    assert!(request.status.last_attempt_for_channel(&pager).is_none());
}

#[tokio::test]
async fn editor_sees_the_spec_of_the_read_it_edits() {
    let h = harness();
    let id = submit(&h.store).await;

    let mut spec = h.store.get(&id).await.unwrap().unwrap().spec;
    spec.channels.push(ChannelId::from("pager"));
    h.store.update_spec(&id, spec).await.unwrap();

    let (_, (generation, channels)) = h
        .tracker
        .update(&id, |editor| {
            Ok((editor.generation(), editor.spec().channels.len()))
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(generation, 2);
    assert_eq!(channels, 3);
}

#[tokio::test]
async fn attempts_after_success_are_dropped() {
    let h = harness();
    let id = submit(&h.store).await;

    h.tracker.record_attempt(&id, success("console", 1)).await.unwrap();
    let writes = h.store.status_writes();
    let request = h
        .tracker
        .record_attempt(&id, success("console", 2))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(request.status.attempt_count_for_channel(&"console".into()), 1);
    assert_eq!(h.store.status_writes(), writes);
}

#[tokio::test]
async fn attempts_beyond_cap_are_dropped() {
    let h = harness();
    let id = submit(&h.store).await;

    for n in 1..=7 {
        h.tracker.record_attempt(&id, failure("webhook", n)).await.unwrap();
    }
    let request = h.store.get(&id).await.unwrap().unwrap();
    assert_eq!(request.status.attempt_count_for_channel(&"webhook".into()), 5);
    let numbers: Vec<_> = request
        .status
        .delivery_attempts
        .iter()
        .map(|a| a.attempt_number)
        .collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn attempt_numbers_come_from_the_trail() {
    let h = harness();
    let id = submit(&h.store).await;

    h.tracker.record_attempt(&id, failure("webhook", 1)).await.unwrap();
    let request = h
        .tracker
        .record_attempt(&id, failure("webhook", 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.status.delivery_attempts[1].attempt_number, 2);
}

// ---------------------------------------------------------------------------
// Optimistic concurrency
// ---------------------------------------------------------------------------

#[tokio::test]
async fn conflicting_write_is_retried_on_fresh_read() {
    let h = harness();
    let id = submit(&h.store).await;

    h.store.inject_conflicts(2);
    let request = h
        .tracker
        .record_attempt(&id, success("console", 1))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(request.status.successful_deliveries, 1);
    assert_eq!(h.store.status_writes(), 1);
    // Events only for the committed write.
    assert_eq!(h.events.kinds().len(), 1);
}

#[tokio::test]
async fn conflict_surfaces_after_three_rounds() {
    let h = harness();
    let id = submit(&h.store).await;

    h.store.inject_conflicts(3);
    let err = h
        .tracker
        .record_attempt(&id, success("console", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(h.store.status_writes(), 0);
    assert!(h.events.kinds().is_empty());
}

#[tokio::test]
async fn concurrent_writer_success_is_not_duplicated() {
    let h = harness();
    let id = submit(&h.store).await;

    // Another writer records the console success between our read and write.
    let stale = h.store.get(&id).await.unwrap().unwrap();
    h.tracker.record_attempt(&id, success("console", 1)).await.unwrap();
    let mut theirs = stale.status.clone();
    theirs.delivery_attempts.push(success("console", 1));
    let err = h
        .store
        .update_status(&id, stale.resource_version, &theirs)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    // Retrying through the tracker re-applies the guards on fresh state.
    let request = h
        .tracker
        .record_attempt(&id, success("console", 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.status.successful_deliveries, 1);
}

#[tokio::test]
async fn missing_request_is_not_an_error() {
    let h = harness();
    let result = h
        .tracker
        .record_attempt(&RequestId::new(), success("console", 1))
        .await
        .unwrap();
    assert!(result.is_none());
}

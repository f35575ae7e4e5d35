//! Smoke tests for the full observability stack.
//!
//! These tests need an OTLP collector on localhost:4317 feeding Tempo
//! (:3200), Prometheus (:9090) and Loki (:3100).
//!
//! Run with:
//! ```sh
//! cargo test --test telemetry_smoke_test -- --ignored --nocapture
//! ```

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use herald_rs::channel::{ChannelRegistry, ScriptedSender};
use herald_rs::engine::{Action, Reconciler};
use herald_rs::model::NewNotificationRequest;
use herald_rs::store::{MemoryStore, RequestStore};
use herald_rs::telemetry::metrics::OtelMetrics;
use herald_rs::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};

static TELEMETRY: OnceLock<TelemetryGuard> = OnceLock::new();

fn ensure_telemetry() -> &'static TelemetryGuard {
    TELEMETRY.get_or_init(|| {
        init_telemetry(TelemetryConfig {
            endpoint: Some("http://localhost:4317".to_string()),
            service_name: "herald-smoke-test".to_string(),
            log_level: "info".to_string(),
        })
        .expect("failed to init telemetry")
    })
}

/// Force-flush all providers and give backends time to ingest.
async fn flush_and_wait(guard: &TelemetryGuard) {
    guard.force_flush();
    // Give batch exporters and backends time to process.
    tokio::time::sleep(Duration::from_secs(8)).await;
}

/// Run one request through the reconciler with real OTel metrics.
async fn reconcile_one() {
    let store = Arc::new(MemoryStore::new());
    let reconciler = Reconciler::builder(
        store.clone(),
        ChannelRegistry::new()
            .with("console", Arc::new(ScriptedSender::ok()))
            .with("webhook", Arc::new(ScriptedSender::http_statuses(&[200]))),
    )
    .metrics(Arc::new(OtelMetrics::new()))
    .build();

    let request = store
        .create(
            NewNotificationRequest::new("smoke", "password=hunter2 should be redacted")
                .channels(["console", "webhook"]),
        )
        .await
        .unwrap();
    assert_eq!(reconciler.reconcile(request.id).await.unwrap(), Action::Done);
}

// ---------------------------------------------------------------------------
// Traces
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn smoke_traces() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();
        reconcile_one().await;
        flush_and_wait(guard).await;

        let client = reqwest::Client::new();
        let resp = client
            .get("http://localhost:3200/api/search")
            .query(&[("tags", "service.name=herald-smoke-test"), ("limit", "5")])
            .send()
            .await
            .expect("failed to query Tempo");
        assert!(
            resp.status().is_success(),
            "Tempo query failed: {}",
            resp.status()
        );

        let body: serde_json::Value = resp.json().await.expect("failed to parse Tempo response");
        let traces = body["traces"].as_array();
        assert!(
            traces.is_some_and(|t| !t.is_empty()),
            "expected traces in Tempo, got: {body}"
        );
    });
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn smoke_metrics() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();
        reconcile_one().await;
        flush_and_wait(guard).await;

        let client = reqwest::Client::new();
        for query in [
            "herald_request_phase_transitions_total",
            "herald_sanitizer_redactions_total",
        ] {
            let resp = client
                .get("http://localhost:9090/api/v1/query")
                .query(&[("query", query)])
                .send()
                .await
                .expect("failed to query Prometheus");
            assert!(
                resp.status().is_success(),
                "Prometheus query failed: {}",
                resp.status()
            );

            let body: serde_json::Value = resp
                .json()
                .await
                .expect("failed to parse Prometheus response");
            let results = body["data"]["result"].as_array();
            assert!(
                results.is_some_and(|r| !r.is_empty()),
                "expected {query} in Prometheus, got: {body}"
            );
        }
    });
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn smoke_logs() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();
        reconcile_one().await;
        flush_and_wait(guard).await;

        let client = reqwest::Client::new();
        let resp = client
            .get("http://localhost:3100/loki/api/v1/query_range")
            .query(&[
                ("query", r#"{service_name="herald-smoke-test"}"#),
                ("limit", "10"),
            ])
            .send()
            .await
            .expect("failed to query Loki");
        assert!(
            resp.status().is_success(),
            "Loki query failed: {}",
            resp.status()
        );

        let body: serde_json::Value = resp.json().await.expect("failed to parse Loki response");
        let streams = body["data"]["result"].as_array();
        assert!(
            streams.is_some_and(|s| !s.is_empty()),
            "expected log streams in Loki, got: {body}"
        );
        // Sanitized content only.
        assert!(!body.to_string().contains("hunter2"));
    });
}

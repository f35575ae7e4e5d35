//! # herald-rs
//!
//! Level-triggered delivery core for notification requests.
//!
//! A notification request names a subject, a body and a set of channels.
//! The [`engine::Reconciler`] drives each request from `Pending` to a
//! terminal phase by sending sanitized messages through pluggable channel
//! adapters, retrying transient failures with backoff, isolating failing
//! channels behind circuit breakers, and recording every attempt in an
//! append-only audit trail. Storage is Postgres (sqlx) in production and an
//! in-memory store for tests; observability goes through tracing and
//! OpenTelemetry.

pub mod breaker;
pub mod channel;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod retry;
pub mod sanitize;
pub mod status;
pub mod store;
pub mod telemetry;

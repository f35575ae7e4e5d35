//! Reconcile span helpers.
//!
//! Provides span creation and phase-transition recording for notification
//! requests flowing through the reconciler.

use tracing::Span;

use crate::model::{Phase, RequestId};

/// Start a span for one reconcile invocation.
///
/// The `request.phase` field is declared empty and filled via
/// [`record_phase`].
pub fn start_reconcile_span(id: &RequestId) -> Span {
    tracing::info_span!(
        "notification.reconcile",
        "request.id" = %id,
        "request.phase" = tracing::field::Empty,
    )
}

/// Record the phase the request is in on the given span.
pub fn record_phase(span: &Span, phase: Phase) {
    span.record("request.phase", tracing::field::display(phase));
}

/// Record a phase transition event scoped to the given span.
pub fn record_phase_transition(span: &Span, from: Phase, to: Phase) {
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "phase_transition");
    });
}

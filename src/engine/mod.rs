//! Reconciliation engine: the per-request reconciler and the control plane
//! that schedules it.

pub mod control;
pub mod outcome;
pub mod reconciler;

pub use control::{ControlConfig, ControlHandle, ControlPlane};
pub use reconciler::{Action, Reconciler, ReconcilerBuilder, ReconcilerConfig};

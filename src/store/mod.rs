//! Durable storage for notification requests.
//!
//! The store is the only coordination point between concurrent reconcile
//! invocations. Status writes are version-checked: a write carrying a stale
//! `resource_version` fails with [`Error::Conflict`](crate::error::Error)
//! and the caller re-reads.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    NewNotificationRequest, NotificationRequest, NotificationSpec, NotificationStatus, Phase,
    RequestId,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Validate and insert a new request in `Pending`.
    async fn create(&self, new: NewNotificationRequest) -> Result<NotificationRequest>;

    /// Fetch a request. `None` if it does not exist (any more).
    async fn get(&self, id: &RequestId) -> Result<Option<NotificationRequest>>;

    /// Most recent requests first, optionally filtered by phase.
    async fn list(&self, phase: Option<Phase>, limit: i64) -> Result<Vec<NotificationRequest>>;

    /// Ids of every request not yet in a terminal phase, oldest first.
    async fn list_active(&self) -> Result<Vec<RequestId>>;

    /// Replace the spec and bump `generation`. Rejected once terminal.
    async fn update_spec(&self, id: &RequestId, spec: NotificationSpec)
    -> Result<NotificationRequest>;

    /// Write `status` if the stored `resource_version` still equals
    /// `expected_version`. Returns the new version.
    async fn update_status(
        &self,
        id: &RequestId,
        expected_version: i64,
        status: &NotificationStatus,
    ) -> Result<i64>;

    /// Remove a request. Returns whether it existed.
    async fn delete(&self, id: &RequestId) -> Result<bool>;
}

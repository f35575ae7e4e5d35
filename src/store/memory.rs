//! In-process request store. Same version-checked semantics as the Postgres
//! store; used by tests and single-process embeddings.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::RequestStore;
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::model::{
    NewNotificationRequest, NotificationRequest, NotificationSpec, NotificationStatus, Phase,
    RequestId,
};

pub struct MemoryStore {
    requests: RwLock<HashMap<RequestId, NotificationRequest>>,
    clock: Arc<dyn Clock>,
    status_writes: AtomicU64,
    injected_conflicts: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            clock,
            status_writes: AtomicU64::new(0),
            injected_conflicts: AtomicU32::new(0),
        }
    }

    /// Number of successful status writes so far.
    pub fn status_writes(&self) -> u64 {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Make the next `n` status writes fail with a conflict, as if another
    /// writer got there first.
    pub fn inject_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn create(&self, new: NewNotificationRequest) -> Result<NotificationRequest> {
        let spec = new.into_spec()?;
        let request = NotificationRequest::new(spec, self.clock.now());
        self.requests
            .write()
            .await
            .insert(request.id, request.clone());
        Ok(request)
    }

    async fn get(&self, id: &RequestId) -> Result<Option<NotificationRequest>> {
        Ok(self.requests.read().await.get(id).cloned())
    }

    async fn list(&self, phase: Option<Phase>, limit: i64) -> Result<Vec<NotificationRequest>> {
        let requests = self.requests.read().await;
        let mut items: Vec<_> = requests
            .values()
            .filter(|r| phase.is_none_or(|p| r.status.phase == p))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn list_active(&self) -> Result<Vec<RequestId>> {
        let requests = self.requests.read().await;
        let mut active: Vec<_> = requests
            .values()
            .filter(|r| !r.status.phase.is_terminal())
            .map(|r| (r.created_at, r.id))
            .collect();
        active.sort();
        Ok(active.into_iter().map(|(_, id)| id).collect())
    }

    async fn update_spec(
        &self,
        id: &RequestId,
        spec: NotificationSpec,
    ) -> Result<NotificationRequest> {
        let spec = spec.normalized()?;
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if request.status.phase.is_terminal() {
            return Err(Error::Immutable(id.to_string()));
        }
        request.spec = spec;
        request.generation += 1;
        request.resource_version += 1;
        request.updated_at = self.clock.now();
        Ok(request.clone())
    }

    async fn update_status(
        &self,
        id: &RequestId,
        expected_version: i64,
        status: &NotificationStatus,
    ) -> Result<i64> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if request.resource_version != expected_version || self.take_injected_conflict() {
            return Err(Error::Conflict(id.to_string()));
        }

        request.status = status.clone();
        request.resource_version += 1;
        request.updated_at = self.clock.now();
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(request.resource_version)
    }

    async fn delete(&self, id: &RequestId) -> Result<bool> {
        Ok(self.requests.write().await.remove(id).is_some())
    }
}

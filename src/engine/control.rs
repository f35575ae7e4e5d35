//! Control plane: queues request ids, runs reconciles with bounded
//! concurrency, and re-enqueues requests the reconciler asked to see again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, info, warn};

use super::reconciler::{Action, Reconciler};
use crate::error::{Error, Result};
use crate::model::RequestId;
use crate::store::RequestStore;
use crate::telemetry::metrics;

/// Configuration for the control plane.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Maximum reconciles running at once, across all requests.
    pub max_concurrent: usize,
    /// How often every non-terminal request is re-enqueued from the store.
    pub resync_interval: Duration,
    /// Delay before retrying a reconcile that returned an error.
    pub error_requeue: Duration,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            resync_interval: Duration::from_secs(30),
            error_requeue: Duration::from_secs(5),
        }
    }
}

/// Cheap handle for feeding and stopping a running control plane.
#[derive(Clone)]
pub struct ControlHandle {
    queue: UnboundedSender<RequestId>,
    shutdown: Arc<Notify>,
}

impl ControlHandle {
    /// Ask for `id` to be reconciled.
    pub fn enqueue(&self, id: RequestId) {
        if self.queue.send(id).is_err() {
            warn!(request_id = %id, "control plane stopped, dropping enqueue");
        }
    }

    /// Signal the control plane to shut down.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// In-flight bookkeeping: a request id is reconciled by at most one task of
/// this control plane at a time. Enqueues that arrive meanwhile set `dirty`
/// so the request is run once more when the current pass finishes.
type InFlight = Arc<Mutex<HashMap<RequestId, bool>>>;

/// The control plane loop: receive ids, reconcile, requeue.
pub struct ControlPlane {
    reconciler: Arc<Reconciler>,
    store: Arc<dyn RequestStore>,
    config: ControlConfig,
    handle: ControlHandle,
    queue: tokio::sync::Mutex<UnboundedReceiver<RequestId>>,
    in_flight: InFlight,
    permits: Arc<Semaphore>,
}

impl ControlPlane {
    pub fn new(
        reconciler: Arc<Reconciler>,
        store: Arc<dyn RequestStore>,
        config: ControlConfig,
    ) -> Self {
        let (tx, rx) = unbounded_channel();
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            reconciler,
            store,
            config,
            handle: ControlHandle {
                queue: tx,
                shutdown: Arc::new(Notify::new()),
            },
            queue: tokio::sync::Mutex::new(rx),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    pub fn handle(&self) -> ControlHandle {
        self.handle.clone()
    }

    /// Run until [`ControlHandle::shutdown`], then wait for in-flight
    /// reconciles to finish.
    pub async fn run(&self) -> Result<()> {
        let mut queue = self
            .queue
            .try_lock()
            .map_err(|_| Error::Other("control plane is already running".to_string()))?;
        let mut resync = tokio::time::interval(self.config.resync_interval);

        info!(
            max_concurrent = self.config.max_concurrent,
            "control plane started"
        );

        loop {
            tokio::select! {
                _ = self.handle.shutdown.notified() => {
                    info!("control plane shutting down");
                    break;
                }
                _ = resync.tick() => {
                    self.resync().await;
                }
                received = queue.recv() => {
                    // The handle we own keeps the channel open, so `None`
                    // cannot happen while we are running.
                    if let Some(id) = received {
                        self.dispatch(id).await;
                    }
                }
            }
        }

        let permits = self.config.max_concurrent.max(1) as u32;
        let _drained = self
            .permits
            .acquire_many(permits)
            .await
            .map_err(|e| Error::Other(format!("semaphore closed: {e}")))?;
        Ok(())
    }

    /// Enqueue every request that has not reached a terminal phase.
    async fn resync(&self) {
        match self.store.list_active().await {
            Ok(ids) => {
                debug!(count = ids.len(), "resync");
                for id in ids {
                    self.handle.enqueue(id);
                }
            }
            Err(e) => warn!("resync failed: {e}"),
        }
    }

    async fn dispatch(&self, id: RequestId) {
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(dirty) = in_flight.get_mut(&id) {
                *dirty = true;
                return;
            }
            in_flight.insert(id, false);
        }

        let Ok(permit) = self.permits.clone().acquire_owned().await else {
            return;
        };

        let reconciler = Arc::clone(&self.reconciler);
        let in_flight = Arc::clone(&self.in_flight);
        let handle = self.handle.clone();
        let error_requeue = self.config.error_requeue;

        tokio::spawn(async move {
            let result = reconciler.reconcile(id).await;
            drop(permit);

            let outcome = match result {
                Ok(Action::Done) => "done",
                Ok(Action::RequeueAfter(delay)) => {
                    debug!(request_id = %id, delay_ms = delay.as_millis() as u64, "requeue scheduled");
                    schedule(&handle, id, delay);
                    "requeue"
                }
                Err(e) => {
                    error!(request_id = %id, "reconcile error: {e}");
                    schedule(&handle, id, error_requeue);
                    "error"
                }
            };
            metrics::reconcile_runs().add(1, &[KeyValue::new("result", outcome)]);

            let dirty = in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id)
                .unwrap_or(false);
            if dirty {
                handle.enqueue(id);
            }
        });
    }
}

/// Park `id` on a timer and enqueue it when the delay is up. Only a timer is
/// held while waiting, never a reconcile permit.
fn schedule(handle: &ControlHandle, id: RequestId, delay: Duration) {
    let handle = handle.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        handle.enqueue(id);
    });
}

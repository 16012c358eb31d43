//! Pod events for the placement operator
//!
//! Gate decisions and inspection failures show up under `kubectl describe
//! pod`. Publishing never fails the caller: errors are logged and dropped.
//! The admission path goes one step further and hands events to an
//! [`EventDispatcher`] so a slow API server never delays an admission
//! response.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Default number of event publishing workers
pub const DEFAULT_EVENT_WORKERS: usize = 16;

/// Default capacity of the pending event queue
pub const DEFAULT_EVENT_QUEUE: usize = 1024;

/// Sink for pod events; implementations swallow their own errors
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `reason` (see [`reasons`]) against `resource_ref`
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publishes through the API server with a `kube` [`Recorder`]
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `controller_name` becomes the event's reporting component
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Dropping pod event after publish failure"
            );
        }
    }
}

/// Discards every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// An event waiting to be published by the dispatcher
#[derive(Clone, Debug)]
pub struct PendingEvent {
    /// Object the event is about
    pub resource_ref: ObjectReference,
    /// Normal or Warning
    pub type_: EventType,
    /// Machine-readable reason
    pub reason: &'static str,
    /// Action taken
    pub action: &'static str,
    /// Free-form detail
    pub note: Option<String>,
}

/// Bounded pool of workers publishing events off the caller's path.
///
/// `dispatch` never blocks: when the queue is full the event is dropped and
/// a warning logged. `shutdown` closes the queue, waits for the workers to
/// drain it for at most the given timeout, then aborts whatever is left.
pub struct EventDispatcher {
    tx: parking_lot::Mutex<Option<mpsc::Sender<PendingEvent>>>,
    workers: Mutex<JoinSet<()>>,
}

impl EventDispatcher {
    /// Spawn `workers` publishing tasks sharing a queue of `capacity` events
    pub fn start(publisher: Arc<dyn EventPublisher>, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<PendingEvent>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let mut set = JoinSet::new();

        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let publisher = publisher.clone();
            set.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(event) = next else { break };
                    publisher
                        .publish(
                            &event.resource_ref,
                            event.type_,
                            event.reason,
                            event.action,
                            event.note,
                        )
                        .await;
                }
            });
        }

        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            workers: Mutex::new(set),
        }
    }

    /// Queue an event; returns false if it was dropped
    pub fn dispatch(&self, event: PendingEvent) -> bool {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            debug!(reason = event.reason, "Event dispatcher closed, dropping event");
            return false;
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(reason = event.reason, "Event queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(reason = event.reason, "Event queue closed, dropping event");
                false
            }
        }
    }

    /// Stop accepting events and drain the queue within `timeout`
    pub async fn shutdown(&self, timeout: Duration) {
        drop(self.tx.lock().take());

        let mut workers = self.workers.lock().await;
        let drained = tokio::time::timeout(timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                timeout_secs = timeout.as_secs(),
                pending_workers = workers.len(),
                "Event workers did not drain in time, aborting"
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    /// Gate added at admission
    pub const SCHEDULING_GATE_ADDED: &str = "ArchAwareSchedulingGateAdded";
    /// Gate removed by the controller
    pub const SCHEDULING_GATE_REMOVED: &str = "ArchAwareSchedulingGateRemoved";
    /// Pod already constrains the architecture, left untouched
    pub const PREDICATE_CONFLICT: &str = "ArchAwarePredicateConflict";
    /// Node affinity written onto the pod
    pub const AFFINITY_SET: &str = "ArchAwarePredicateSet";
    /// Image inspection failed
    pub const IMAGE_INSPECTION_ERROR: &str = "ImageArchitectureInspectionError";
    /// Images share no architecture
    pub const NO_SUPPORTED_ARCHITECTURES: &str = "NoSupportedArchitecturesFound";
}

/// Event actions
pub mod actions {
    /// Admission webhook decision
    pub const ADMIT: &str = "Admit";
    /// Pod controller pass
    pub const RECONCILE: &str = "Reconcile";
}

//! Local write-ahead log for store writes that could not be delivered.
//!
//! When the alert store is unreachable the write is queued here and replayed
//! in order on the next flush. Every write is an upsert keyed by record id, so
//! replaying a write that actually landed is harmless.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::alert::{Alert, AlertId, AlertStatus, LocationSample, Response, ResponseId};
use crate::services::{AlertStore, StoreResult};

/// A store write waiting to be replayed.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    /// Upsert of a whole alert.
    Alert(Box<Alert>),
    /// Status transition.
    Status {
        /// Target alert.
        alert_id: AlertId,
        /// New status.
        status: AlertStatus,
        /// When the transition happened.
        at: DateTime<Utc>,
    },
    /// Relay sample for the location trail.
    Location {
        /// Target alert.
        alert_id: AlertId,
        /// The sample.
        sample: LocationSample,
    },
    /// Responder response.
    Response(Box<Response>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WriteKey {
    Alert(AlertId),
    Status(AlertId),
    Location(AlertId, DateTime<Utc>),
    Response(ResponseId),
}

impl PendingWrite {
    /// The alert this write belongs to.
    #[must_use]
    pub fn alert_id(&self) -> AlertId {
        match self {
            Self::Alert(alert) => alert.id,
            Self::Status { alert_id, .. } | Self::Location { alert_id, .. } => *alert_id,
            Self::Response(response) => response.alert_id,
        }
    }

    /// Short label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Alert(_) => "alert",
            Self::Status { .. } => "status",
            Self::Location { .. } => "location",
            Self::Response(_) => "response",
        }
    }

    fn key(&self) -> WriteKey {
        match self {
            Self::Alert(alert) => WriteKey::Alert(alert.id),
            Self::Status { alert_id, .. } => WriteKey::Status(*alert_id),
            Self::Location { alert_id, sample } => WriteKey::Location(*alert_id, sample.timestamp),
            Self::Response(response) => WriteKey::Response(response.id),
        }
    }

    async fn apply(&self, store: &dyn AlertStore) -> StoreResult<()> {
        match self {
            Self::Alert(alert) => store.save_alert(alert).await,
            Self::Status {
                alert_id,
                status,
                at,
            } => store.update_status(*alert_id, *status, *at).await,
            Self::Location { alert_id, sample } => store.append_location(*alert_id, sample).await,
            Self::Response(response) => store.save_response(response).await,
        }
    }
}

/// Result of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Writes the store accepted.
    pub applied: usize,
    /// Writes the store rejected permanently; they are dropped.
    pub dropped: usize,
    /// Writes still queued.
    pub remaining: usize,
}

/// Ordered queue of pending store writes.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Mutex<VecDeque<PendingWrite>>,
    flushing: tokio::sync::Mutex<()>,
}

impl Outbox {
    /// Create an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a write. A newer write for the same record replaces the queued
    /// one in place, keeping its position.
    pub fn push(&self, write: PendingWrite) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let key = write.key();
        debug!(kind = write.kind(), alert_id = %write.alert_id(), "Queued store write");
        if let Some(slot) = queue.iter_mut().find(|queued| queued.key() == key) {
            *slot = write;
        } else {
            queue.push_back(write);
        }
    }

    /// Number of queued writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queued writes for one alert.
    #[must_use]
    pub fn pending_for(&self, alert_id: AlertId) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|write| write.alert_id() == alert_id)
            .count()
    }

    /// Replay queued writes in order.
    ///
    /// Stops at the first transient failure, leaving that write and everything
    /// after it queued. Writes the store rejects permanently are logged and
    /// dropped so they cannot block the queue.
    pub async fn flush(&self, store: &dyn AlertStore) -> FlushReport {
        let _flushing = self.flushing.lock().await;
        let mut report = FlushReport::default();

        loop {
            let Some(write) = self.pop_front() else {
                break;
            };

            match write.apply(store).await {
                Ok(()) => report.applied += 1,
                Err(e) if e.is_transient() => {
                    debug!(kind = write.kind(), error = %e, "Store still unreachable");
                    self.requeue_front(write);
                    break;
                }
                Err(e) => {
                    error!(
                        kind = write.kind(),
                        alert_id = %write.alert_id(),
                        error = %e,
                        "Dropping store write rejected by the store"
                    );
                    report.dropped += 1;
                }
            }
        }

        report.remaining = self.len();
        if report.applied > 0 || report.dropped > 0 {
            debug!(
                applied = report.applied,
                dropped = report.dropped,
                remaining = report.remaining,
                "Outbox flushed"
            );
        }
        report
    }

    fn pop_front(&self) -> Option<PendingWrite> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn requeue_front(&self, write: PendingWrite) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        // A newer write for the same record arrived during the attempt.
        if queue.iter().any(|queued| queued.key() == write.key()) {
            warn!(kind = write.kind(), "Superseded store write discarded");
            return;
        }
        queue.push_front(write);
    }
}

//! Responder coordination for active alerts.
//!
//! Each open alert has an append-only log of responses in arrival order.
//! Local responses are written optimistically: they land in the log first and
//! reach the store afterwards, through the outbox when the store is down.
//! Responses arriving from the store are merged by id, so a response seen
//! twice is recorded once.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alert::{Alert, AlertId, LocationFix, Responder, Response, ResponseId, ResponseKind};
use crate::error::{Error, Result};
use crate::outbox::{Outbox, PendingWrite};
use crate::services::AlertStore;

/// Callback receiving the full ordered response list after every change.
pub type ResponseCallback = Arc<dyn Fn(&[Response]) + Send + Sync>;

struct ResponseLog {
    entries: Vec<Response>,
    seen: HashSet<ResponseId>,
    subscribers: Vec<(u64, ResponseCallback)>,
    feed: Option<JoinHandle<()>>,
}

impl ResponseLog {
    fn new(seed: &[Response]) -> Self {
        let mut log = Self {
            entries: Vec::new(),
            seen: HashSet::new(),
            subscribers: Vec::new(),
            feed: None,
        };
        for response in seed {
            log.append(response.clone());
        }
        log
    }

    fn append(&mut self, response: Response) -> bool {
        if !self.seen.insert(response.id) {
            return false;
        }
        self.entries.push(response);
        true
    }

    fn notify(&self) {
        for (_, callback) in &self.subscribers {
            callback(&self.entries);
        }
    }
}

impl Drop for ResponseLog {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.abort();
        }
    }
}

#[derive(Default)]
struct Logs {
    logs: HashMap<AlertId, ResponseLog>,
    next_subscriber: u64,
}

type SharedLogs = Mutex<Logs>;

fn lock(logs: &SharedLogs) -> MutexGuard<'_, Logs> {
    logs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Merge one response into an open log and notify on change.
fn ingest_into(logs: &SharedLogs, response: Response) -> bool {
    let mut logs = lock(logs);
    let Some(log) = logs.logs.get_mut(&response.alert_id) else {
        debug!(alert_id = %response.alert_id, "Response for closed alert ignored");
        return false;
    };
    let added = log.append(response);
    if added {
        log.notify();
    }
    added
}

/// Append-only response logs with live subscriptions.
///
/// Subscriber callbacks run while the log is locked so every subscriber sees
/// lists in append order. A callback must not call back into the coordinator.
pub struct ResponderCoordinator {
    logs: Arc<SharedLogs>,
    store: Arc<dyn AlertStore>,
    outbox: Arc<Outbox>,
}

impl std::fmt::Debug for ResponderCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let logs = lock(&self.logs);
        f.debug_struct("ResponderCoordinator")
            .field("open_logs", &logs.logs.len())
            .field("outbox", &self.outbox.len())
            .finish_non_exhaustive()
    }
}

impl ResponderCoordinator {
    /// Create a coordinator writing through `store`.
    #[must_use]
    pub fn new(store: Arc<dyn AlertStore>, outbox: Arc<Outbox>) -> Self {
        Self {
            logs: Arc::new(Mutex::new(Logs::default())),
            store,
            outbox,
        }
    }

    /// Open the log for an alert, seeded with any responses it carries.
    /// Re-opening an open alert keeps the existing log.
    pub fn open(&self, alert: &Alert) {
        let mut logs = lock(&self.logs);
        logs.logs
            .entry(alert.id)
            .or_insert_with(|| ResponseLog::new(&alert.responses));
        debug!(alert_id = %alert.id, "Response log opened");
    }

    /// Close an alert's log, dropping its subscribers and store feed.
    /// Returns `false` if it was not open.
    pub fn close(&self, alert_id: AlertId) -> bool {
        let removed = lock(&self.logs).logs.remove(&alert_id);
        if removed.is_some() {
            debug!(alert_id = %alert_id, "Response log closed");
        }
        removed.is_some()
    }

    /// Whether the alert's log is open.
    #[must_use]
    pub fn is_open(&self, alert_id: AlertId) -> bool {
        lock(&self.logs).logs.contains_key(&alert_id)
    }

    /// Current responses in arrival order; empty for unknown alerts.
    #[must_use]
    pub fn responses(&self, alert_id: AlertId) -> Vec<Response> {
        lock(&self.logs)
            .logs
            .get(&alert_id)
            .map(|log| log.entries.clone())
            .unwrap_or_default()
    }

    /// Register a callback for changes to an alert's responses.
    ///
    /// Returns the current list and a handle that unsubscribes when dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAlert`] if the alert's log is not open.
    pub fn subscribe<F>(&self, alert_id: AlertId, on_update: F) -> Result<(Vec<Response>, Subscription)>
    where
        F: Fn(&[Response]) + Send + Sync + 'static,
    {
        let mut logs = lock(&self.logs);
        logs.next_subscriber += 1;
        let id = logs.next_subscriber;

        let log = logs
            .logs
            .get_mut(&alert_id)
            .ok_or(Error::UnknownAlert(alert_id))?;
        log.subscribers.push((id, Arc::new(on_update)));
        let snapshot = log.entries.clone();

        Ok((
            snapshot,
            Subscription {
                id,
                alert_id,
                logs: Arc::downgrade(&self.logs),
                active: AtomicBool::new(true),
            },
        ))
    }

    /// Record a response from a responder.
    ///
    /// The local append always succeeds for an open alert; a store failure
    /// queues the write for reconciliation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAlert`] if the alert's log is not open.
    pub async fn respond(
        &self,
        alert_id: AlertId,
        responder: &Responder,
        kind: ResponseKind,
        message: Option<String>,
        location: Option<LocationFix>,
    ) -> Result<Response> {
        let response = Response::new(alert_id, responder, kind, message, location);

        {
            let mut logs = lock(&self.logs);
            let log = logs
                .logs
                .get_mut(&alert_id)
                .ok_or(Error::UnknownAlert(alert_id))?;
            log.append(response.clone());
            log.notify();
        }
        info!(
            alert_id = %alert_id,
            responder = %responder.id,
            kind = %kind,
            "Response recorded"
        );

        if let Err(e) = self.store.save_response(&response).await {
            warn!(alert_id = %alert_id, error = %e, "Response not stored yet, queued for retry");
            self.outbox
                .push(PendingWrite::Response(Box::new(response.clone())));
        }
        Ok(response)
    }

    /// Merge a response pushed from elsewhere. Returns `true` if it was new.
    pub fn ingest(&self, response: Response) -> bool {
        ingest_into(&self.logs, response)
    }

    /// Forward the store's push subscription for an alert into [`Self::ingest`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAlert`] if the alert's log is not open.
    pub fn attach(&self, alert_id: AlertId) -> Result<()> {
        let mut rx = self.store.subscribe(alert_id);
        let logs = Arc::downgrade(&self.logs);

        let feed = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(response) => {
                        let Some(logs) = logs.upgrade() else { break };
                        ingest_into(&logs, response);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(alert_id = %alert_id, missed, "Response feed lagged; reconcile to catch up");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let mut guard = lock(&self.logs);
        let Some(log) = guard.logs.get_mut(&alert_id) else {
            feed.abort();
            return Err(Error::UnknownAlert(alert_id));
        };
        if let Some(previous) = log.feed.replace(feed) {
            previous.abort();
        }
        Ok(())
    }

    /// Flush pending writes, then merge the store's responses for an alert.
    ///
    /// Returns the number of responses that were new locally.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn reconcile(&self, alert_id: AlertId) -> Result<usize> {
        self.outbox.flush(self.store.as_ref()).await;
        let remote = self.store.responses(alert_id).await?;

        let mut logs = lock(&self.logs);
        let Some(log) = logs.logs.get_mut(&alert_id) else {
            return Err(Error::UnknownAlert(alert_id));
        };
        let merged = remote
            .into_iter()
            .filter(|response| response.alert_id == alert_id)
            .map(|response| log.append(response))
            .filter(|added| *added)
            .count();
        if merged > 0 {
            log.notify();
        }
        debug!(alert_id = %alert_id, merged, "Responses reconciled");
        Ok(merged)
    }
}

/// Handle for a response subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    alert_id: AlertId,
    logs: Weak<SharedLogs>,
    active: AtomicBool,
}

impl Subscription {
    /// Stop receiving updates. Safe to call any number of times; returns
    /// `true` only for the call that removed the callback.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        let Some(logs) = self.logs.upgrade() else {
            return false;
        };
        let mut logs = lock(&logs);
        match logs.logs.get_mut(&self.alert_id) {
            Some(log) => {
                let before = log.subscribers.len();
                log.subscribers.retain(|(id, _)| *id != self.id);
                log.subscribers.len() < before
            }
            None => false,
        }
    }

    /// Whether the subscription is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertStatus, Priority};
    use crate::storage::Storage;
    use chrono::Utc;

    fn setup() -> (ResponderCoordinator, Arc<Storage>, Alert) {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let coordinator = ResponderCoordinator::new(storage.clone(), Arc::new(Outbox::new()));
        let alert = Alert {
            id: AlertId::new(),
            originator_id: "u1".to_string(),
            originator_name: "Sam".to_string(),
            message: String::new(),
            location: LocationFix::new(0.0, 0.0, 1.0),
            status: AlertStatus::Active,
            priority: Priority::Critical,
            created_at: Utc::now(),
            resolved_at: None,
            recipients: Vec::new(),
            responses: Vec::new(),
        };
        coordinator.open(&alert);
        (coordinator, storage, alert)
    }

    #[tokio::test]
    async fn test_subscriber_sees_responses_in_order() {
        let (coordinator, _storage, alert) = setup();
        let seen = Arc::new(Mutex::new(Vec::<Vec<String>>::new()));
        let sink = seen.clone();
        let (initial, _sub) = coordinator
            .subscribe(alert.id, move |list| {
                sink.lock()
                    .unwrap()
                    .push(list.iter().map(|r| r.responder_id.clone()).collect());
            })
            .unwrap();
        assert!(initial.is_empty());

        let a = Responder::new("a", "Alex");
        let b = Responder::new("b", "Blair");
        coordinator
            .respond(alert.id, &a, ResponseKind::Acknowledged, None, None)
            .await
            .unwrap();
        coordinator
            .respond(alert.id, &b, ResponseKind::EnRoute, None, None)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_respond_to_unknown_alert_fails() {
        let (coordinator, _storage, _alert) = setup();
        let err = coordinator
            .respond(
                AlertId::new(),
                &Responder::new("a", "A"),
                ResponseKind::Safe,
                None,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownAlert(_)));
    }

    #[tokio::test]
    async fn test_same_responder_may_respond_repeatedly() {
        let (coordinator, storage, alert) = setup();
        let a = Responder::new("a", "Alex");
        for kind in [ResponseKind::Acknowledged, ResponseKind::EnRoute, ResponseKind::Arrived] {
            coordinator.respond(alert.id, &a, kind, None, None).await.unwrap();
        }
        assert_eq!(coordinator.responses(alert.id).len(), 3);
        assert_eq!(storage.load_responses(alert.id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_ingest_dedupes_by_id() {
        let (coordinator, _storage, alert) = setup();
        let response = Response::new(
            alert.id,
            &Responder::new("a", "A"),
            ResponseKind::Acknowledged,
            None,
            None,
        );
        assert!(coordinator.ingest(response.clone()));
        assert!(!coordinator.ingest(response));
        assert_eq!(coordinator.responses(alert.id).len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let (coordinator, _storage, alert) = setup();
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let (_, sub) = coordinator
            .subscribe(alert.id, move |_| *counter.lock().unwrap() += 1)
            .unwrap();

        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert!(!sub.is_active());

        coordinator
            .respond(alert.id, &Responder::new("a", "A"), ResponseKind::Safe, None, None)
            .await
            .unwrap();
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let (coordinator, _storage, alert) = setup();
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let (_, sub) = coordinator
            .subscribe(alert.id, move |_| *counter.lock().unwrap() += 1)
            .unwrap();
        drop(sub);

        coordinator.ingest(Response::new(
            alert.id,
            &Responder::new("a", "A"),
            ResponseKind::Safe,
            None,
            None,
        ));
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_attach_merges_store_pushes_once() {
        let (coordinator, storage, alert) = setup();
        coordinator.attach(alert.id).unwrap();

        let remote = Response::new(
            alert.id,
            &Responder::new("r", "Remote"),
            ResponseKind::EnRoute,
            None,
            None,
        );
        storage.write_response(&remote).unwrap();

        for _ in 0..10 {
            if !coordinator.responses(alert.id).is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(coordinator.responses(alert.id).len(), 1);

        // A local response echoes back through the feed without duplicating.
        coordinator
            .respond(alert.id, &Responder::new("a", "A"), ResponseKind::Safe, None, None)
            .await
            .unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(coordinator.responses(alert.id).len(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_merges_remote_responses() {
        let (coordinator, storage, alert) = setup();
        let remote = Response::new(
            alert.id,
            &Responder::new("r", "Remote"),
            ResponseKind::Arrived,
            None,
            None,
        );
        storage.write_response(&remote).unwrap();

        assert_eq!(coordinator.reconcile(alert.id).await.unwrap(), 1);
        assert_eq!(coordinator.reconcile(alert.id).await.unwrap(), 0);
        assert_eq!(coordinator.responses(alert.id)[0].id, remote.id);
    }

    #[tokio::test]
    async fn test_close_drops_log() {
        let (coordinator, _storage, alert) = setup();
        assert!(coordinator.is_open(alert.id));
        assert!(coordinator.close(alert.id));
        assert!(!coordinator.close(alert.id));
        assert!(coordinator.subscribe(alert.id, |_| {}).is_err());
    }
}

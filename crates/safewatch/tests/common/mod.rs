//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use safewatch::alert::{Alert, AlertId, AlertStatus, LocationSample, Originator, Response};
use safewatch::controller::{AlertController, ControllerConfig};
use safewatch::guard::{CancellationGuard, CancellationPolicy};
use safewatch::services::{
    AlertStore, Geolocator, LocationError, Notifier, Services, StoreError, StoreResult,
};
use safewatch::share::{ShareBackend, ShareChannel, ShareError};
use safewatch::storage::Storage;

pub const PASSWORD: &str = "1234";

pub fn san_francisco() -> LocationSample {
    LocationSample::new(37.7749, -122.4194, 5.0)
}

pub fn sam() -> Originator {
    Originator::new("sam", "Sam")
}

/// A store that can be switched offline.
#[derive(Debug)]
pub struct FlakyStore {
    pub inner: Storage,
    offline: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: Storage::open_in_memory().unwrap(),
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unreachable("network down".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl AlertStore for FlakyStore {
    async fn save_alert(&self, alert: &Alert) -> StoreResult<()> {
        self.check()?;
        self.inner.save_alert(alert).await
    }

    async fn update_status(
        &self,
        alert_id: AlertId,
        status: AlertStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check()?;
        self.inner.update_status(alert_id, status, at).await
    }

    async fn append_location(&self, alert_id: AlertId, sample: &LocationSample) -> StoreResult<()> {
        self.check()?;
        self.inner.append_location(alert_id, sample).await
    }

    async fn save_response(&self, response: &Response) -> StoreResult<()> {
        self.check()?;
        self.inner.save_response(response).await
    }

    async fn responses(&self, alert_id: AlertId) -> StoreResult<Vec<Response>> {
        self.check()?;
        self.inner.responses(alert_id).await
    }

    async fn alert(&self, alert_id: AlertId) -> StoreResult<Option<Alert>> {
        self.check()?;
        AlertStore::alert(&self.inner, alert_id).await
    }

    async fn recent_alerts(&self, limit: usize) -> StoreResult<Vec<Alert>> {
        self.check()?;
        self.inner.recent_alerts(limit).await
    }

    async fn metadata(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        self.inner.metadata(key).await
    }

    async fn set_metadata(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check()?;
        self.inner.set_metadata(key, value).await
    }

    fn subscribe(&self, alert_id: AlertId) -> broadcast::Receiver<Response> {
        self.inner.subscribe(alert_id)
    }
}

/// A geolocator that plays back a script; the last entry repeats.
///
/// Each fix is stamped one second after the previous one so trail rows stay
/// distinct.
#[derive(Debug)]
pub struct ScriptedLocator {
    script: Mutex<VecDeque<Result<LocationSample, LocationError>>>,
    last_known: Mutex<Option<LocationSample>>,
    calls: AtomicU32,
    epoch: DateTime<Utc>,
}

impl ScriptedLocator {
    pub fn new(script: Vec<Result<LocationSample, LocationError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last_known: Mutex::new(None),
            calls: AtomicU32::new(0),
            epoch: Utc::now(),
        }
    }

    pub fn fixed(sample: LocationSample) -> Self {
        Self::new(vec![Ok(sample)])
    }

    pub fn failing(error: LocationError) -> Self {
        Self::new(vec![Err(error)])
    }

    pub fn with_last_known(self, sample: LocationSample) -> Self {
        *self.last_known.lock().unwrap() = Some(sample);
        self
    }
}

#[async_trait::async_trait]
impl Geolocator for ScriptedLocator {
    async fn current_location(&self) -> Result<LocationSample, LocationError> {
        let next = {
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        };
        let calls = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut result = next.unwrap_or(Err(LocationError::PositionUnavailable("empty".into())));
        if let Ok(sample) = &mut result {
            sample.timestamp = self.epoch + chrono::Duration::seconds(i64::from(calls));
            *self.last_known.lock().unwrap() = Some(sample.clone());
        }
        result
    }

    fn last_known(&self) -> Option<LocationSample> {
        self.last_known.lock().unwrap().clone()
    }
}

/// A share backend that records what it was given.
#[derive(Debug)]
pub struct RecordingShare {
    name: &'static str,
    accept: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl RecordingShare {
    pub fn new(name: &'static str, accept: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            accept: AtomicBool::new(accept),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.sent().iter().filter(|text| text.contains(needle)).count()
    }
}

#[async_trait::async_trait]
impl ShareBackend for RecordingShare {
    async fn share(&self, text: &str) -> Result<(), ShareError> {
        if !self.accept.load(Ordering::SeqCst) {
            return Err(ShareError::Rejected("user dismissed the sheet".into()));
        }
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Records notifications.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub alerts: Mutex<Vec<AlertId>>,
    pub updates: Mutex<Vec<(AlertId, String)>>,
}

impl RecordingNotifier {
    pub fn alert_count(&self) -> usize {
        self.alerts.lock().unwrap().len()
    }

    pub fn updates(&self) -> Vec<String> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn show_alert(&self, alert: &Alert) {
        self.alerts.lock().unwrap().push(alert.id);
    }

    fn show_update(&self, alert_id: AlertId, text: &str) {
        self.updates.lock().unwrap().push((alert_id, text.to_string()));
    }
}

/// A controller wired to fakes.
pub struct Harness {
    pub controller: Arc<AlertController>,
    pub store: Arc<FlakyStore>,
    pub native: Arc<RecordingShare>,
    pub notifier: Arc<RecordingNotifier>,
}

pub struct HarnessBuilder {
    locator: ScriptedLocator,
    policy: CancellationPolicy,
    config: ControllerConfig,
    native_accepts: bool,
    clipboard: Option<Arc<RecordingShare>>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            locator: ScriptedLocator::fixed(san_francisco()),
            policy: CancellationPolicy::default(),
            config: ControllerConfig {
                recipients: vec!["alex".to_string(), "blair".to_string()],
                ..ControllerConfig::default()
            },
            native_accepts: true,
            clipboard: None,
        }
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn stored(&self, alert_id: AlertId) -> Option<Alert> {
        self.store.inner.load_alert(alert_id).unwrap()
    }
}

impl HarnessBuilder {
    pub fn locator(mut self, locator: ScriptedLocator) -> Self {
        self.locator = locator;
        self
    }

    pub fn policy(mut self, policy: CancellationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(mut self, f: impl FnOnce(&mut ControllerConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn native_accepts(mut self, accept: bool) -> Self {
        self.native_accepts = accept;
        self
    }

    pub fn clipboard(mut self, clipboard: Arc<RecordingShare>) -> Self {
        self.clipboard = Some(clipboard);
        self
    }

    pub fn build(self) -> Harness {
        let store = Arc::new(FlakyStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let services = Services::builder()
            .geolocator(Arc::new(self.locator))
            .store(store.clone())
            .notifier(notifier.clone())
            .init()
            .unwrap();

        let native = RecordingShare::new("native", self.native_accepts);
        let clipboard = self.clipboard.map(|c| c as Arc<dyn ShareBackend>);
        let share = ShareChannel::new(Some(native.clone() as Arc<dyn ShareBackend>), clipboard);

        let guard = CancellationGuard::with_password(self.policy, PASSWORD);
        let controller = AlertController::new(services, share, guard, self.config);

        Harness {
            controller,
            store,
            native,
            notifier,
        }
    }
}

//! External collaborators and the service registry.
//!
//! Location, geocoding, persistence and notification are provided by the
//! platform. This module defines the traits they must fulfill and the
//! [`Services`] registry that injects them into the alert components. The
//! registry is built once at startup and shut down explicitly; nothing here
//! is global.

mod location;
mod notify;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

use crate::alert::{Alert, AlertId, AlertStatus, LocationSample, Response};
use crate::error::{Error, Result};

pub use location::{GazetteerGeocoder, Place, StaticLocator};
pub use notify::LogNotifier;

/// Errors reported by a geolocation provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    /// The user (or platform) denied location access.
    #[error("location permission denied")]
    PermissionDenied,

    /// The provider has no position to report.
    #[error("position unavailable: {0}")]
    PositionUnavailable(String),

    /// The provider did not answer in time.
    #[error("location request timed out")]
    Timeout,
}

/// Errors reported by the alert store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached; the write should be retried.
    #[error("store unreachable: {0}")]
    Unreachable(String),

    /// The backing database failed.
    #[error("store database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A record could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the same write later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A source of the originator's current position.
#[async_trait::async_trait]
pub trait Geolocator: Send + Sync + fmt::Debug {
    /// Request a fresh fix. May suspend on a permission prompt; callers bound
    /// this with a timeout.
    async fn current_location(&self) -> std::result::Result<LocationSample, LocationError>;

    /// The most recent fix the provider has cached, if any.
    fn last_known(&self) -> Option<LocationSample>;
}

/// Best-effort place lookup.
#[async_trait::async_trait]
pub trait ReverseGeocoder: Send + Sync + fmt::Debug {
    /// A human-readable place name for the coordinates, or `None` when the
    /// lookup fails or nothing is known.
    async fn place_name(&self, lat: f64, lng: f64) -> Option<String>;
}

/// Persistence for alerts, responses and location trails.
///
/// Writes are upserts keyed by record id so a write retried from the outbox
/// never duplicates a record.
#[async_trait::async_trait]
pub trait AlertStore: Send + Sync + fmt::Debug {
    /// Insert or update an alert.
    async fn save_alert(&self, alert: &Alert) -> StoreResult<()>;

    /// Record a status transition.
    async fn update_status(
        &self,
        alert_id: AlertId,
        status: AlertStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Append a relay sample to the alert's location trail.
    async fn append_location(&self, alert_id: AlertId, sample: &LocationSample) -> StoreResult<()>;

    /// Insert a response. Re-inserting an existing id is a no-op.
    async fn save_response(&self, response: &Response) -> StoreResult<()>;

    /// Responses for an alert, in the order the store received them.
    async fn responses(&self, alert_id: AlertId) -> StoreResult<Vec<Response>>;

    /// Load an alert with its responses.
    async fn alert(&self, alert_id: AlertId) -> StoreResult<Option<Alert>>;

    /// Most recent alerts, newest first.
    async fn recent_alerts(&self, limit: usize) -> StoreResult<Vec<Alert>>;

    /// Read a local key/value setting.
    async fn metadata(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a local key/value setting.
    async fn set_metadata(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Push subscription for responses newly written to an alert.
    ///
    /// Dropping the receiver unsubscribes.
    fn subscribe(&self, alert_id: AlertId) -> broadcast::Receiver<Response>;
}

/// Fire-and-forget user notifications. Implementations must not panic and
/// must not block.
pub trait Notifier: Send + Sync + fmt::Debug {
    /// Announce a freshly dispatched alert.
    fn show_alert(&self, alert: &Alert);

    /// Announce a change to an existing alert.
    fn show_update(&self, alert_id: AlertId, text: &str);
}

/// The injected set of external collaborators.
#[derive(Debug)]
pub struct Services {
    geolocator: Arc<dyn Geolocator>,
    geocoder: Arc<dyn ReverseGeocoder>,
    store: Arc<dyn AlertStore>,
    notifier: Arc<dyn Notifier>,
    running: AtomicBool,
}

impl Services {
    /// Start building a registry.
    #[must_use]
    pub fn builder() -> ServicesBuilder {
        ServicesBuilder::default()
    }

    /// The geolocation provider.
    #[must_use]
    pub fn geolocator(&self) -> &Arc<dyn Geolocator> {
        &self.geolocator
    }

    /// The reverse geocoder.
    #[must_use]
    pub fn geocoder(&self) -> &Arc<dyn ReverseGeocoder> {
        &self.geocoder
    }

    /// The alert store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn AlertStore> {
        &self.store
    }

    /// The notifier.
    #[must_use]
    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Whether the registry is still accepting work.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Fail with [`Error::ShutDown`] once the registry has been torn down.
    ///
    /// # Errors
    ///
    /// Returns an error after [`Services::shutdown`] has been called.
    pub fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::ShutDown)
        }
    }

    /// Tear down the registry. Idempotent.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Services shut down");
        }
    }
}

/// Builder for [`Services`].
#[derive(Debug, Default)]
pub struct ServicesBuilder {
    geolocator: Option<Arc<dyn Geolocator>>,
    geocoder: Option<Arc<dyn ReverseGeocoder>>,
    store: Option<Arc<dyn AlertStore>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl ServicesBuilder {
    /// Set the geolocation provider (required).
    #[must_use]
    pub fn geolocator(mut self, geolocator: Arc<dyn Geolocator>) -> Self {
        self.geolocator = Some(geolocator);
        self
    }

    /// Set the reverse geocoder (defaults to an empty gazetteer).
    #[must_use]
    pub fn geocoder(mut self, geocoder: Arc<dyn ReverseGeocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    /// Set the alert store (required).
    #[must_use]
    pub fn store(mut self, store: Arc<dyn AlertStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the notifier (defaults to [`LogNotifier`]).
    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Initialize the registry.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a required service is missing.
    pub fn init(self) -> Result<Arc<Services>> {
        let geolocator = self
            .geolocator
            .ok_or_else(|| Error::config("no geolocation provider configured"))?;
        let store = self
            .store
            .ok_or_else(|| Error::config("no alert store configured"))?;

        info!("Services initialized");
        Ok(Arc::new(Services {
            geolocator,
            geocoder: self
                .geocoder
                .unwrap_or_else(|| Arc::new(GazetteerGeocoder::default())),
            store,
            notifier: self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
            running: AtomicBool::new(true),
        }))
    }
}

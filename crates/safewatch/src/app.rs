//! Wiring from configuration to a running controller.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::alert::LocationSample;
use crate::config::Config;
use crate::controller::AlertController;
use crate::error::Result;
use crate::services::{GazetteerGeocoder, Notifier, Services, StaticLocator};
use crate::share::{CommandShare, ShareBackend, ShareChannel, SystemClipboard};
use crate::storage::Storage;

/// A controller with its storage and services, built from configuration.
#[derive(Debug)]
pub struct App {
    /// The loaded configuration.
    pub config: Config,
    /// The local alert store.
    pub storage: Arc<Storage>,
    /// The injected services.
    pub services: Arc<Services>,
    /// The alert controller.
    pub controller: Arc<AlertController>,
    /// The location source, for moving the reported position.
    pub locator: Arc<StaticLocator>,
}

impl App {
    /// Open storage, restore the cancellation credential and build the
    /// controller.
    ///
    /// `fix` overrides `location.static_fix` from the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the stored
    /// credential cannot be read.
    pub async fn open(
        config: Config,
        fix: Option<LocationSample>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let storage = Arc::new(Storage::open(config.database_path())?);
        Self::with_storage(config, storage, fix, notifier).await
    }

    /// Like [`App::open`] with an already opened store.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored credential cannot be read.
    pub async fn with_storage(
        config: Config,
        storage: Arc<Storage>,
        fix: Option<LocationSample>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        if let Some(max_age) = config.max_age() {
            let age = chrono::Duration::from_std(max_age)
                .unwrap_or_else(|_| chrono::Duration::days(i64::from(config.storage.max_age_days)));
            if let Err(e) = storage.prune_older_than(age) {
                warn!(error = %e, "Pruning old alerts failed");
            }
        }

        let fix = fix.or_else(|| config.location.static_fix.map(|f| f.sample()));
        let locator = Arc::new(StaticLocator::new(fix));

        let services = Services::builder()
            .geolocator(locator.clone())
            .geocoder(Arc::new(GazetteerGeocoder::new(config.location.places.clone())))
            .store(storage.clone())
            .notifier(notifier)
            .init()?;

        let guard = AlertController::restore_guard(
            storage.as_ref(),
            config.cancellation_policy(),
            config.cancellation.initial_password.as_deref(),
        )
        .await?;
        if !guard.is_configured() && config.cancellation.require_password_on_cancel {
            warn!("No cancellation password set; alerts cannot be cancelled until one is (swatch password set)");
        }

        let controller = AlertController::new(
            Arc::clone(&services),
            share_channel(&config),
            guard,
            config.controller(),
        );

        Ok(Self {
            config,
            storage,
            services,
            controller,
            locator,
        })
    }

    /// Stop the controller and the services.
    pub fn shutdown(&self) {
        self.controller.shutdown();
        self.services.shutdown();
    }
}

/// Build the share chain from configuration.
#[must_use]
pub fn share_channel(config: &Config) -> ShareChannel {
    let command = CommandShare::new(config.share.native_command.clone());
    let native: Option<Arc<dyn ShareBackend>> = if command.is_configured() {
        Some(Arc::new(command))
    } else {
        None
    };
    let clipboard: Option<Arc<dyn ShareBackend>> = if config.share.clipboard_enabled {
        Some(Arc::new(SystemClipboard::new()))
    } else {
        None
    };
    debug!(
        native = native.is_some(),
        clipboard = clipboard.is_some(),
        "Share chain configured"
    );
    ShareChannel::new(native, clipboard).with_timeout(config.share_timeout())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertStatus;
    use crate::services::LogNotifier;

    fn config() -> Config {
        let mut config = Config::default();
        config.share.clipboard_enabled = false;
        config.cancellation.initial_password = Some("1234".to_string());
        config.alert.contacts = vec!["alex".to_string()];
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_app_dispatches_from_configured_fix() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let app = App::with_storage(
            config(),
            storage,
            Some(LocationSample::new(51.5007, -0.1246, 10.0)),
            Arc::new(LogNotifier),
        )
        .await
        .unwrap();

        let originator = app.config.originator();
        let handle = app.controller.dispatch(&originator, None).await.unwrap();
        assert_eq!(handle.alert.status, AlertStatus::Active);
        assert!(handle.warnings.iter().any(|w| w.contains("manually")));

        app.controller.cancel(handle.id(), Some("1234")).await.unwrap();
        app.shutdown();
    }

    #[tokio::test]
    async fn test_share_channel_respects_config() {
        let mut config = Config::default();
        config.share.clipboard_enabled = false;
        let outcome = share_channel(&config).send("hello").await;
        assert!(!outcome.is_delivered());
    }
}

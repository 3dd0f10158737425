//! Configuration management for safewatch.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::alert::{is_valid_coordinate, LocationSample, Originator, Priority};
use crate::controller::ControllerConfig;
use crate::error::{Error, Result};
use crate::guard::CancellationPolicy;
use crate::relay::RelayConfig;
use crate::services::Place;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "safewatch";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "alerts.db";

/// Shortest minimum password length a configuration may ask for.
const MIN_PASSWORD_FLOOR: usize = 4;

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `SAFEWATCH_`, `__` between sections)
/// 2. TOML config file at `~/.config/safewatch/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Alert dispatch configuration.
    pub alert: AlertConfig,
    /// Location source and relay configuration.
    pub location: LocationConfig,
    /// Cancellation policy.
    pub cancellation: CancellationConfig,
    /// Share channel configuration.
    pub share: ShareConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
}

/// Alert-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Countdown before dispatch, in seconds.
    pub hold_seconds: u32,
    /// How long a cancelled or resolved alert stays visible, in seconds.
    pub grace_period_seconds: u64,
    /// Priority stamped on new alerts.
    pub priority: Priority,
    /// Identifier of the local originator.
    pub originator_id: String,
    /// Display name used in messages.
    pub originator_name: String,
    /// Trusted contact ids alerts are addressed to.
    pub contacts: Vec<String>,
}

/// Location-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Seconds between relay samples.
    pub relay_interval_seconds: u64,
    /// Samples kept in the relay's rolling history.
    pub history_capacity: usize,
    /// Bound on a single fix request, in seconds.
    pub fix_timeout_seconds: u64,
    /// Bound on reverse geocoding, in seconds.
    pub geocode_timeout_seconds: u64,
    /// Fixed position reported when no `--lat/--lng` is given.
    pub static_fix: Option<StaticFix>,
    /// Named places used for reverse geocoding.
    pub places: Vec<Place>,
}

/// A configured position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StaticFix {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
    /// Accuracy radius in meters.
    #[serde(default = "default_accuracy")]
    pub accuracy: f64,
}

fn default_accuracy() -> f64 {
    25.0
}

impl StaticFix {
    /// Turn the configured position into a sample.
    #[must_use]
    pub fn sample(&self) -> LocationSample {
        LocationSample::new(self.lat, self.lng, self.accuracy)
    }
}

/// Cancellation-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CancellationConfig {
    /// Require the password to cancel an active alert.
    pub require_password_on_cancel: bool,
    /// Resolve active alerts automatically after this many minutes.
    /// Set to 0 to disable.
    pub auto_resolve_after_minutes: u32,
    /// Minimum password length in characters.
    pub min_password_length: usize,
    /// Password installed on first run when none is stored.
    pub initial_password: Option<String>,
}

/// Share-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Program (and arguments) that receives messages on stdin.
    /// Empty disables the native share.
    pub native_command: Vec<String>,
    /// Fall back to the system clipboard.
    pub clipboard_enabled: bool,
    /// Bound on each share attempt, in seconds.
    pub timeout_seconds: u64,
}

/// Storage-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/safewatch/alerts.db`
    pub database_path: Option<PathBuf>,
    /// Maximum age of closed alerts to retain in days.
    /// Set to 0 for unlimited.
    pub max_age_days: u32,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            hold_seconds: 3,
            grace_period_seconds: 10,
            priority: Priority::Critical,
            originator_id: "local".to_string(),
            originator_name: whoami(),
            contacts: Vec::new(),
        }
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "Someone".to_string())
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            relay_interval_seconds: 30,
            history_capacity: 20,
            fix_timeout_seconds: 10,
            geocode_timeout_seconds: 5,
            static_fix: None,
            places: Vec::new(),
        }
    }
}

impl Default for CancellationConfig {
    fn default() -> Self {
        let policy = CancellationPolicy::default();
        Self {
            require_password_on_cancel: policy.require_password_on_cancel,
            auto_resolve_after_minutes: policy.auto_resolve_after_minutes,
            min_password_length: policy.min_password_length,
            initial_password: None,
        }
    }
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            native_command: Vec::new(),
            clipboard_enabled: true,
            timeout_seconds: 15,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None, // Resolved at runtime
            max_age_days: 90,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed("SAFEWATCH_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.location.relay_interval_seconds == 0 {
            return Err(Error::config("relay_interval_seconds must be greater than 0"));
        }
        if self.location.history_capacity == 0 {
            return Err(Error::config("history_capacity must be greater than 0"));
        }
        if self.location.fix_timeout_seconds == 0 {
            return Err(Error::config("fix_timeout_seconds must be greater than 0"));
        }
        if self.share.timeout_seconds == 0 {
            return Err(Error::config("share timeout_seconds must be greater than 0"));
        }

        if self.cancellation.min_password_length < MIN_PASSWORD_FLOOR {
            return Err(Error::config(format!(
                "min_password_length ({}) must be at least {MIN_PASSWORD_FLOOR}",
                self.cancellation.min_password_length
            )));
        }
        if let Some(password) = &self.cancellation.initial_password {
            if password.chars().count() < self.cancellation.min_password_length {
                return Err(Error::config(format!(
                    "initial_password is shorter than min_password_length ({})",
                    self.cancellation.min_password_length
                )));
            }
        }

        if let Some(fix) = &self.location.static_fix {
            if !is_valid_coordinate(fix.lat, fix.lng) {
                return Err(Error::config(format!(
                    "static_fix ({}, {}) is not a valid coordinate",
                    fix.lat, fix.lng
                )));
            }
        }
        for place in &self.location.places {
            if !is_valid_coordinate(place.lat, place.lng) {
                return Err(Error::config(format!(
                    "place '{}' has an invalid coordinate",
                    place.name
                )));
            }
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the max age as a Duration.
    #[must_use]
    pub fn max_age(&self) -> Option<Duration> {
        if self.storage.max_age_days == 0 {
            None
        } else {
            Some(Duration::from_secs(
                u64::from(self.storage.max_age_days) * 24 * 60 * 60,
            ))
        }
    }

    /// The local originator.
    #[must_use]
    pub fn originator(&self) -> Originator {
        Originator::new(&self.alert.originator_id, &self.alert.originator_name)
    }

    /// Cancellation policy for the guard.
    #[must_use]
    pub fn cancellation_policy(&self) -> CancellationPolicy {
        CancellationPolicy {
            require_password_on_cancel: self.cancellation.require_password_on_cancel,
            auto_resolve_after_minutes: self.cancellation.auto_resolve_after_minutes,
            min_password_length: self.cancellation.min_password_length,
        }
    }

    /// Relay settings.
    #[must_use]
    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            interval: Duration::from_secs(self.location.relay_interval_seconds),
            history_capacity: self.location.history_capacity,
            fix_timeout: Duration::from_secs(self.location.fix_timeout_seconds),
        }
    }

    /// Bound on each share attempt.
    #[must_use]
    pub fn share_timeout(&self) -> Duration {
        Duration::from_secs(self.share.timeout_seconds)
    }

    /// Controller settings.
    #[must_use]
    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            hold_seconds: self.alert.hold_seconds,
            grace_period: Duration::from_secs(self.alert.grace_period_seconds),
            priority: self.alert.priority,
            recipients: self.alert.contacts.clone(),
            geocode_timeout: Duration::from_secs(self.location.geocode_timeout_seconds),
            relay: self.relay(),
        }
    }
}

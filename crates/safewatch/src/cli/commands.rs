//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

/// Arguments for raising an alert.
#[derive(Debug, Args)]
pub struct SosCommand {
    /// Latitude of the current position
    #[arg(long, requires = "lng", allow_hyphen_values = true)]
    pub lat: Option<f64>,

    /// Longitude of the current position
    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    pub lng: Option<f64>,

    /// Accuracy radius in meters
    #[arg(long, default_value = "25")]
    pub accuracy: f64,

    /// Countdown before dispatch, in seconds (defaults to alert.hold_seconds)
    #[arg(long)]
    pub hold: Option<u32>,

    /// Name used in the alert message (defaults to alert.originator_name)
    #[arg(long)]
    pub name: Option<String>,

    /// Dispatch immediately, skipping the countdown
    #[arg(long)]
    pub now: bool,
}

/// Arguments for listing stored alerts.
#[derive(Debug, Args)]
pub struct AlertsCommand {
    /// Show one alert in detail, with responses and location trail
    #[arg(long)]
    pub id: Option<String>,

    /// Maximum number of alerts
    #[arg(short, long, default_value = "20")]
    pub limit: usize,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

/// Cancellation password commands.
#[derive(Debug, Subcommand)]
pub enum PasswordCommand {
    /// Set the first cancellation password
    Set {
        /// The new password
        password: String,
    },

    /// Change the cancellation password
    Change {
        /// The current password
        old: String,
        /// The new password
        new: String,
    },
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show configuration file path
    Path,

    /// Validate configuration file
    Validate {
        /// Path to config file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format
    #[default]
    Table,
    /// JSON format
    Json,
}

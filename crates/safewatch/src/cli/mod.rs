//! Command-line interface for safewatch.
//!
//! This module provides the CLI structure for the `swatch` binary.

mod commands;
mod session;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{AlertsCommand, ConfigCommand, OutputFormat, PasswordCommand, SosCommand};
pub use session::{SessionCommand, SessionParseError, SESSION_HELP};

use crate::logging::Verbosity;

/// swatch - Raise an emergency alert and share your location
///
/// Arms a short countdown, sends an alert with your position to your trusted
/// contacts, keeps relaying your location while the alert is active, and
/// collects responses until you cancel or resolve it.
#[derive(Debug, Parser)]
#[command(name = "swatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Arm and dispatch an alert, then run an interactive session
    Sos(SosCommand),

    /// List stored alerts
    Alerts(AlertsCommand),

    /// Manage the cancellation password
    #[command(subcommand)]
    Password(PasswordCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> Verbosity {
        Verbosity::from_flags(self.quiet, self.verbose)
    }
}

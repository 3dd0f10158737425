//! `safewatch` - Emergency alert lifecycle with a real-time location relay
//!
//! An originator arms a short countdown, the alert is dispatched with their
//! location to trusted contacts, the location keeps being relayed while the
//! alert is active, and responders report back until the originator cancels
//! (with a credential) or resolves it.
//!
//! [`AlertController`] owns the lifecycle. It is built from injected
//! [`services::Services`] (geolocation, reverse geocoding, the alert store and
//! a notifier) so any of them can be replaced.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod alert;
pub mod app;
pub mod armer;
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod guard;
pub mod logging;
pub mod message;
pub mod outbox;
pub mod relay;
pub mod responders;
pub mod services;
pub mod share;
pub mod storage;

pub use alert::{
    Alert, AlertId, AlertStatus, LocationFix, LocationSample, Originator, Priority, Responder,
    Response, ResponseKind,
};
pub use app::App;
pub use config::Config;
pub use controller::{AlertController, AlertHandle, ControllerConfig};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use storage::{Storage, StorageStats};

//! Core alert types for safewatch.
//!
//! This module defines the data model shared by every component: alerts,
//! responder responses, location fixes and relay samples.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Mean Earth radius used for distance calculations.
const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// A string could not be parsed into one of the model's enums.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseError {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

impl ParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Unique identifier of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(Uuid);

impl AlertId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AlertId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AlertId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ParseError::new("alert id", s))
    }
}

/// Unique identifier of a responder response.
///
/// Reconciliation against the store merges by this id, so a response written
/// twice collapses into one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseId(Uuid);

impl ResponseId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResponseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ResponseId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ParseError::new("response id", s))
    }
}

/// Lifecycle status of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// No alert in progress.
    #[default]
    Idle,
    /// Countdown running; can still be cancelled without side effects.
    Arming,
    /// Dispatched and broadcasting location.
    Active,
    /// Cancelled by the originator with a valid credential.
    Cancelled,
    /// Resolved manually or by the auto-resolve timeout.
    Resolved,
}

impl AlertStatus {
    /// Arming and active alerts occupy the originator's single slot.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Arming | Self::Active)
    }

    /// Cancelled and resolved are terminal; only the grace timer follows.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Resolved)
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Arming => write!(f, "arming"),
            Self::Active => write!(f, "active"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

impl FromStr for AlertStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "arming" => Ok(Self::Arming),
            "active" => Ok(Self::Active),
            "cancelled" => Ok(Self::Cancelled),
            "resolved" => Ok(Self::Resolved),
            _ => Err(ParseError::new("alert status", s)),
        }
    }
}

/// How urgently contacts should treat an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Check-in style alert.
    Normal,
    /// Needs attention soon.
    High,
    /// Emergency.
    #[default]
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for Priority {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(ParseError::new("priority", s)),
        }
    }
}

/// What a responder is reporting.
///
/// This is a closed set; anything a responder says beyond the kind travels in
/// the response's free-text message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    /// Saw the alert.
    Acknowledged,
    /// On the way to the originator.
    #[serde(rename = "enroute")]
    EnRoute,
    /// At the originator's location.
    Arrived,
    /// Helped the originator.
    Assisted,
    /// Confirms the originator is safe.
    Safe,
}

impl ResponseKind {
    /// All kinds, in the order a responder usually progresses through them.
    pub const ALL: [Self; 5] = [
        Self::Acknowledged,
        Self::EnRoute,
        Self::Arrived,
        Self::Assisted,
        Self::Safe,
    ];

    /// Human-readable phrase for status lines.
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::Acknowledged => "has seen your alert",
            Self::EnRoute => "is on the way",
            Self::Arrived => "has arrived",
            Self::Assisted => "is assisting",
            Self::Safe => "confirmed you are safe",
        }
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acknowledged => write!(f, "acknowledged"),
            Self::EnRoute => write!(f, "enroute"),
            Self::Arrived => write!(f, "arrived"),
            Self::Assisted => write!(f, "assisted"),
            Self::Safe => write!(f, "safe"),
        }
    }
}

impl FromStr for ResponseKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "acknowledged" | "ack" => Ok(Self::Acknowledged),
            "enroute" | "en_route" | "en-route" => Ok(Self::EnRoute),
            "arrived" => Ok(Self::Arrived),
            "assisted" => Ok(Self::Assisted),
            "safe" => Ok(Self::Safe),
            _ => Err(ParseError::new("response kind", s)),
        }
    }
}

/// The person raising an alert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Originator {
    /// Stable account identifier.
    pub id: String,
    /// Display name used in outgoing messages.
    pub name: String,
}

impl Originator {
    /// Create a new originator.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A trusted contact reacting to an alert.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Responder {
    /// Stable account identifier.
    pub id: String,
    /// Display name.
    pub name: String,
}

impl Responder {
    /// Create a new responder.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A resolved position attached to an alert or response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
    /// Horizontal accuracy radius in meters.
    pub accuracy: f64,
    /// When the fix was taken.
    pub timestamp: DateTime<Utc>,
    /// Reverse-geocoded place name, if the lookup succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub place_name: Option<String>,
}

impl LocationFix {
    /// Create a fix timestamped now.
    #[must_use]
    pub fn new(lat: f64, lng: f64, accuracy: f64) -> Self {
        Self {
            lat,
            lng,
            accuracy,
            timestamp: Utc::now(),
            place_name: None,
        }
    }

    /// Attach a place name.
    #[must_use]
    pub fn with_place(mut self, place_name: impl Into<String>) -> Self {
        self.place_name = Some(place_name.into());
        self
    }

    /// Coordinates rendered with six decimal places, `"<lat>, <lng>"`.
    #[must_use]
    pub fn coordinates(&self) -> String {
        format_coordinates(self.lat, self.lng)
    }

    /// The place name, or the coordinates when no name is known.
    #[must_use]
    pub fn place_or_coordinates(&self) -> String {
        self.place_name
            .clone()
            .unwrap_or_else(|| self.coordinates())
    }
}

impl From<&LocationSample> for LocationFix {
    fn from(sample: &LocationSample) -> Self {
        Self {
            lat: sample.lat,
            lng: sample.lng,
            accuracy: sample.accuracy,
            timestamp: sample.timestamp,
            place_name: None,
        }
    }
}

/// A single reading produced by the geolocation provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lng: f64,
    /// Horizontal accuracy radius in meters.
    pub accuracy: f64,
    /// When the reading was taken.
    pub timestamp: DateTime<Utc>,
    /// Ground speed in meters per second, when the provider reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Battery level in percent, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<u8>,
}

impl LocationSample {
    /// Create a sample timestamped now.
    #[must_use]
    pub fn new(lat: f64, lng: f64, accuracy: f64) -> Self {
        Self {
            lat,
            lng,
            accuracy,
            timestamp: Utc::now(),
            speed: None,
            battery: None,
        }
    }

    /// Whether the coordinates lie within valid latitude/longitude ranges.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        is_valid_coordinate(self.lat, self.lng) && self.accuracy.is_finite() && self.accuracy >= 0.0
    }

    /// Great-circle distance to a point, in meters.
    #[must_use]
    pub fn distance_to(&self, lat: f64, lng: f64) -> f64 {
        haversine_meters(self.lat, self.lng, lat, lng)
    }
}

/// One responder's reaction to an alert. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Unique id; the merge key during reconciliation.
    pub id: ResponseId,
    /// The alert this responds to.
    pub alert_id: AlertId,
    /// Who responded.
    pub responder_id: String,
    /// Responder display name.
    pub responder_name: String,
    /// What they report.
    pub kind: ResponseKind,
    /// Optional free-text note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Optional responder position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<LocationFix>,
    /// Self-reported time. Display only; ordering uses arrival.
    pub timestamp: DateTime<Utc>,
}

impl Response {
    /// Create a response stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(
        alert_id: AlertId,
        responder: &Responder,
        kind: ResponseKind,
        message: Option<String>,
        location: Option<LocationFix>,
    ) -> Self {
        Self {
            id: ResponseId::new(),
            alert_id,
            responder_id: responder.id.clone(),
            responder_name: responder.name.clone(),
            kind,
            message,
            location,
            timestamp: Utc::now(),
        }
    }

    /// One-line summary, e.g. `"Alex is on the way: 5 min out"`.
    #[must_use]
    pub fn summary(&self) -> String {
        match &self.message {
            Some(note) if !note.is_empty() => {
                format!("{} {}: {note}", self.responder_name, self.kind.describe())
            }
            _ => format!("{} {}", self.responder_name, self.kind.describe()),
        }
    }
}

/// One emergency event raised by an originator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Unique id.
    pub id: AlertId,
    /// Who raised it.
    pub originator_id: String,
    /// Originator display name.
    pub originator_name: String,
    /// The composed outgoing message.
    pub message: String,
    /// Where the originator was at dispatch.
    pub location: LocationFix,
    /// Current lifecycle status.
    pub status: AlertStatus,
    /// Urgency.
    pub priority: Priority,
    /// Dispatch time.
    pub created_at: DateTime<Utc>,
    /// When it was cancelled or resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Trusted contacts the alert was addressed to.
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Responses in arrival order.
    #[serde(default)]
    pub responses: Vec<Response>,
}

impl Alert {
    /// Whether the alert is currently broadcasting.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == AlertStatus::Active
    }
}

/// Render coordinates with six decimal places, `"<lat>, <lng>"`.
#[must_use]
pub fn format_coordinates(lat: f64, lng: f64) -> String {
    format!("{lat:.6}, {lng:.6}")
}

/// Whether a latitude/longitude pair is within range.
#[must_use]
pub fn is_valid_coordinate(lat: f64, lng: f64) -> bool {
    lat.is_finite() && lng.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng)
}

/// Great-circle distance between two points, in meters.
#[must_use]
pub fn haversine_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * a.sqrt().asin()
}

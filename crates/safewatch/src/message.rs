//! Outgoing message composition.
//!
//! Every message shares one body layout; consumers may rely on the presence
//! and order of these lines, not on exact bytes:
//!
//! ```text
//! <header>
//! Location: <place or coordinates>
//! Coordinates: <lat,6dp>, <lng,6dp>
//! Time: <local date time>
//! Accuracy: ±<meters>m
//! Map: <link>
//! ```

use std::fmt::Write as _;

use chrono::{DateTime, Local, Utc};

use crate::alert::{format_coordinates, LocationFix, LocationSample};

/// Header of the initial alert message.
pub const ALERT_HEADER: &str = "🚨 EMERGENCY ALERT";

/// Header of periodic relay updates.
pub const UPDATE_HEADER: &str = "📍 LOCATION UPDATE";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S %:z";

/// Compose the message sent when an alert is dispatched.
#[must_use]
pub fn alert_message(originator_name: &str, fix: &LocationFix) -> String {
    let mut out = format!("{ALERT_HEADER} from {originator_name}\n");
    out.push_str("I need help. This is my current location:\n");
    write_body(
        &mut out,
        &fix.place_or_coordinates(),
        fix.lat,
        fix.lng,
        fix.timestamp,
        fix.accuracy,
    );
    out
}

/// Compose a relay update for one location sample.
#[must_use]
pub fn update_message(originator_name: &str, sample: &LocationSample) -> String {
    let mut out = format!("{UPDATE_HEADER} from {originator_name}\n");
    write_body(
        &mut out,
        &format_coordinates(sample.lat, sample.lng),
        sample.lat,
        sample.lng,
        sample.timestamp,
        sample.accuracy,
    );
    if let Some(battery) = sample.battery {
        let _ = writeln!(out, "Battery: {battery}%");
    }
    out
}

/// Compose the follow-up sent after a successful cancellation.
#[must_use]
pub fn cancellation_message(originator_name: &str) -> String {
    format!(
        "✅ {originator_name} cancelled their emergency alert. \
         No further action is needed."
    )
}

/// Compose the follow-up sent when an alert is resolved.
#[must_use]
pub fn resolution_message(originator_name: &str) -> String {
    format!("✅ {originator_name} has been marked safe. The emergency alert is resolved.")
}

/// A map link for the given coordinates.
#[must_use]
pub fn map_link(lat: f64, lng: f64) -> String {
    format!("https://maps.google.com/?q={lat:.6},{lng:.6}")
}

/// Render a timestamp in the local time zone.
#[must_use]
pub fn local_time(timestamp: DateTime<Utc>) -> String {
    timestamp.with_timezone(&Local).format(TIME_FORMAT).to_string()
}

fn write_body(
    out: &mut String,
    place: &str,
    lat: f64,
    lng: f64,
    timestamp: DateTime<Utc>,
    accuracy: f64,
) {
    let _ = writeln!(out, "Location: {place}");
    let _ = writeln!(out, "Coordinates: {}", format_coordinates(lat, lng));
    let _ = writeln!(out, "Time: {}", local_time(timestamp));
    let _ = writeln!(out, "Accuracy: ±{:.0}m", accuracy.max(0.0));
    let _ = writeln!(out, "Map: {}", map_link(lat, lng));
}

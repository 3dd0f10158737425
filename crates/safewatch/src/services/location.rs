//! Desktop location stand-ins.
//!
//! Desktops rarely have a GNSS receiver, so the CLI works from a position the
//! user supplies (flags or config) and names it from a small gazetteer of
//! configured places.

use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{Geolocator, LocationError, ReverseGeocoder};
use crate::alert::{haversine_meters, LocationSample};

/// A geolocator that reports a fixed, user-supplied position.
#[derive(Debug)]
pub struct StaticLocator {
    fix: Mutex<Option<LocationSample>>,
    last: Mutex<Option<LocationSample>>,
}

impl StaticLocator {
    /// Create a locator. With `None` every request fails with
    /// [`LocationError::PositionUnavailable`].
    #[must_use]
    pub fn new(fix: Option<LocationSample>) -> Self {
        Self {
            fix: Mutex::new(fix),
            last: Mutex::new(None),
        }
    }

    /// Move the reported position.
    pub fn set(&self, sample: LocationSample) {
        if let Ok(mut fix) = self.fix.lock() {
            *fix = Some(sample);
        }
    }
}

#[async_trait::async_trait]
impl Geolocator for StaticLocator {
    async fn current_location(&self) -> Result<LocationSample, LocationError> {
        let fix = self
            .fix
            .lock()
            .map_err(|_| LocationError::PositionUnavailable("locator poisoned".to_string()))?
            .clone();

        let Some(mut sample) = fix else {
            return Err(LocationError::PositionUnavailable(
                "no position configured; pass --lat/--lng or set location.static_fix".to_string(),
            ));
        };

        sample.timestamp = Utc::now();
        if let Ok(mut last) = self.last.lock() {
            *last = Some(sample.clone());
        }
        Ok(sample)
    }

    fn last_known(&self) -> Option<LocationSample> {
        self.last.lock().ok().and_then(|last| last.clone())
    }
}

/// A named area used by [`GazetteerGeocoder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Place {
    /// Display name.
    pub name: String,
    /// Center latitude.
    pub lat: f64,
    /// Center longitude.
    pub lng: f64,
    /// Radius within which a point counts as being at this place.
    pub radius_meters: f64,
}

/// Reverse geocoder backed by a list of configured places.
///
/// Picks the nearest place whose radius contains the point.
#[derive(Debug, Default)]
pub struct GazetteerGeocoder {
    places: Vec<Place>,
}

impl GazetteerGeocoder {
    /// Create a geocoder over the given places.
    #[must_use]
    pub fn new(places: Vec<Place>) -> Self {
        Self { places }
    }

    /// Synchronous lookup.
    #[must_use]
    pub fn lookup(&self, lat: f64, lng: f64) -> Option<&Place> {
        self.places
            .iter()
            .map(|place| (place, haversine_meters(lat, lng, place.lat, place.lng)))
            .filter(|(place, distance)| *distance <= place.radius_meters)
            .min_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(place, _)| place)
    }
}

#[async_trait::async_trait]
impl ReverseGeocoder for GazetteerGeocoder {
    async fn place_name(&self, lat: f64, lng: f64) -> Option<String> {
        let name = self.lookup(lat, lng).map(|place| place.name.clone());
        trace!(lat, lng, found = name.is_some(), "Gazetteer lookup");
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn place(name: &str, lat: f64, lng: f64, radius_meters: f64) -> Place {
        Place {
            name: name.to_string(),
            lat,
            lng,
            radius_meters,
        }
    }

    #[tokio::test]
    async fn test_static_locator_without_fix() {
        let locator = StaticLocator::new(None);
        let err = locator.current_location().await.unwrap_err();
        assert!(matches!(err, LocationError::PositionUnavailable(_)));
        assert!(locator.last_known().is_none());
    }

    #[tokio::test]
    async fn test_static_locator_caches_last_known() {
        let locator = StaticLocator::new(Some(LocationSample::new(37.7749, -122.4194, 10.0)));
        assert!(locator.last_known().is_none());

        let sample = locator.current_location().await.unwrap();
        assert_eq!(sample.lat, 37.7749);
        assert_eq!(locator.last_known().unwrap().lng, -122.4194);

        locator.set(LocationSample::new(1.0, 2.0, 3.0));
        assert_eq!(locator.current_location().await.unwrap().lat, 1.0);
    }

    #[tokio::test]
    async fn test_gazetteer_picks_nearest_containing_place() {
        let geocoder = GazetteerGeocoder::new(vec![
            place("Mission District", 37.7599, -122.4148, 1_500.0),
            place("San Francisco", 37.7749, -122.4194, 10_000.0),
        ]);

        assert_eq!(
            geocoder.place_name(37.7600, -122.4150).await.as_deref(),
            Some("Mission District")
        );
        assert_eq!(
            geocoder.place_name(37.7790, -122.4190).await.as_deref(),
            Some("San Francisco")
        );
        assert!(geocoder.place_name(40.7128, -74.0060).await.is_none());
    }

    #[tokio::test]
    async fn test_empty_gazetteer() {
        let geocoder = GazetteerGeocoder::default();
        assert!(geocoder.place_name(0.0, 0.0).await.is_none());
    }
}

//! Great-circle helpers, geofences and route interpolation

use crate::domain::Location;
use serde::Deserialize;

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Circular geofence
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Geofence {
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    pub radius_meters: f64,
}

/// Route waypoint
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RoutePoint {
    pub lat: f64,
    pub lon: f64,
}

/// Haversine distance between two coordinates, in meters
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * a.sqrt().asin() * EARTH_RADIUS_METERS
}

/// Move a location along a bearing by a distance
pub fn move_location(from: &Location, bearing_deg: f64, distance_meters: f64) -> Location {
    let angular = distance_meters / EARTH_RADIUS_METERS;
    let bearing = bearing_deg.to_radians();
    let lat1 = from.lat.to_radians();
    let lon1 = from.lon.to_radians();

    let lat2 =
        (lat1.sin() * angular.cos() + lat1.cos() * angular.sin() * bearing.cos()).asin();
    let lon2 = lon1
        + (bearing.sin() * angular.sin() * lat1.cos())
            .atan2(angular.cos() - lat1.sin() * lat2.sin());

    Location {
        lat: lat2.to_degrees(),
        lon: lon2.to_degrees(),
        alt: from.alt,
        accuracy: from.accuracy,
    }
}

/// Ids of the geofences containing the location
pub fn geofences_containing(location: &Location, fences: &[Geofence]) -> Vec<String> {
    fences
        .iter()
        .filter(|fence| {
            distance_meters(location.lat, location.lon, fence.lat, fence.lon)
                <= fence.radius_meters
        })
        .map(|fence| fence.id.clone())
        .collect()
}

/// Linear interpolation along a route for `progress` in `[0, 1]`.
///
/// Altitude and accuracy are carried over from the current location.
pub fn interpolate_route(route: &[RoutePoint], progress: f64, current: &Location) -> Location {
    if route.is_empty() {
        return *current;
    }
    if route.len() == 1 || progress <= 0.0 {
        return Location {
            lat: route[0].lat,
            lon: route[0].lon,
            ..*current
        };
    }

    let clamped = progress.min(1.0);
    let segments = (route.len() - 1) as f64;
    let position = clamped * segments;
    let index = (position.floor() as usize).min(route.len() - 2);
    let fraction = position - index as f64;

    let a = route[index];
    let b = route[index + 1];
    Location {
        lat: a.lat + (b.lat - a.lat) * fraction,
        lon: a.lon + (b.lon - a.lon) * fraction,
        ..*current
    }
}

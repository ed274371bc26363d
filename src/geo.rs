//! Coordinate helpers shared by shop discovery and notifications.

use mongodb::bson::{doc, Bson, Document};

use crate::error::ApiError;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

pub const INDIA_LAT_RANGE: (f64, f64) = (6.0, 38.0);
pub const INDIA_LNG_RANGE: (f64, f64) = (68.0, 98.0);

/// Great-circle distance in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

pub fn round_coordinate(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

pub fn round_km(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Rejects positions outside the serviceable bounding box and rounds to 6 decimals.
pub fn validate_indian_coordinates(lat: f64, lng: f64) -> Result<(f64, f64), ApiError> {
    if !lat.is_finite() || !lng.is_finite() {
        return Err(ApiError::validation("Coordinates must be numbers"));
    }
    if lat < INDIA_LAT_RANGE.0 || lat > INDIA_LAT_RANGE.1 {
        return Err(ApiError::validation("Latitude must be between 6.0 and 38.0 for India"));
    }
    if lng < INDIA_LNG_RANGE.0 || lng > INDIA_LNG_RANGE.1 {
        return Err(ApiError::validation("Longitude must be between 68.0 and 98.0 for India"));
    }
    Ok((round_coordinate(lat), round_coordinate(lng)))
}

pub fn validate_query_point(lat: f64, lng: f64) -> Result<(), ApiError> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
        return Err(ApiError::validation("Invalid coordinates"));
    }
    Ok(())
}

/// GeoJSON point; MongoDB expects `[lng, lat]` order.
pub fn geo_point(lat: f64, lng: f64) -> Document {
    doc! { "type": "Point", "coordinates": [lng, lat] }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Double(v) => Some(*v),
        Bson::Int32(v) => Some(*v as f64),
        Bson::Int64(v) => Some(*v as f64),
        _ => None,
    }
}

/// `(lat, lng)` of a stored shop or user.
pub fn shop_coordinates(doc: &Document) -> Option<(f64, f64)> {
    let lat = doc.get("latitude").and_then(as_f64);
    let lng = doc.get("longitude").and_then(as_f64);
    if let (Some(lat), Some(lng)) = (lat, lng) {
        return Some((lat, lng));
    }
    let coords = doc.get_document("location").ok()?.get_array("coordinates").ok()?;
    match coords.as_slice() {
        [lng, lat, ..] => Some((as_f64(lat)?, as_f64(lng)?)),
        _ => None,
    }
}

/// `$centerSphere` radius is expressed in radians.
pub fn radians_for_km(km: f64) -> f64 {
    km / EARTH_RADIUS_KM
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_is_zero_for_same_point() {
        assert!(haversine_km(12.97, 77.59, 12.97, 77.59).abs() < 1e-9);
    }

    #[test]
    fn haversine_matches_known_distance() {
        // Bengaluru to Chennai is roughly 290 km as the crow flies.
        let d = haversine_km(12.9716, 77.5946, 13.0827, 80.2707);
        assert!((d - 290.0).abs() < 5.0, "got {d}");
    }

    #[test]
    fn coordinates_inside_india_are_rounded() {
        let (lat, lng) = validate_indian_coordinates(12.971_598_765, 77.594_562_111).unwrap();
        assert_eq!(lat, 12.971599);
        assert_eq!(lng, 77.594562);
    }

    #[test]
    fn bounds_are_inclusive() {
        assert!(validate_indian_coordinates(6.0, 68.0).is_ok());
        assert!(validate_indian_coordinates(38.0, 98.0).is_ok());
        assert!(validate_indian_coordinates(5.99, 77.0).is_err());
        assert!(validate_indian_coordinates(20.0, 98.01).is_err());
        assert!(validate_indian_coordinates(f64::NAN, 77.0).is_err());
    }

    #[test]
    fn shop_coordinates_fall_back_to_geojson() {
        let flat = doc! { "latitude": 12.0, "longitude": 77.0 };
        assert_eq!(shop_coordinates(&flat), Some((12.0, 77.0)));

        let geo = doc! { "location": geo_point(13.5, 78.25) };
        assert_eq!(shop_coordinates(&geo), Some((13.5, 78.25)));

        assert_eq!(shop_coordinates(&doc! { "name": "x" }), None);
    }
}

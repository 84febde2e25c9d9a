use serde_json::{json, Value};

use crate::error::FetchError;

/// A closed polygon ring in WGS84 coordinates scoping a catalog query.
///
/// Vertices are `(longitude, latitude)` pairs. The ring must repeat its
/// first vertex at the end and hold at least four vertices total.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaOfInterest {
    ring: Vec<(f64, f64)>,
}

impl AreaOfInterest {
    pub fn new(ring: Vec<(f64, f64)>) -> Result<Self, FetchError> {
        if ring.len() < 4 {
            return Err(FetchError::Config(format!(
                "AOI ring needs at least 4 vertices, got {}",
                ring.len()
            )));
        }
        if ring.first() != ring.last() {
            return Err(FetchError::Config(
                "AOI ring is not closed (first and last vertices differ)".to_string(),
            ));
        }
        for &(lon, lat) in &ring {
            if !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
                return Err(FetchError::Config(format!(
                    "AOI vertex ({lon}, {lat}) is outside WGS84 bounds"
                )));
            }
        }
        Ok(Self { ring })
    }

    pub fn vertices(&self) -> &[(f64, f64)] {
        &self.ring
    }

    /// GeoJSON Polygon geometry, the shape STAC `intersects` expects.
    pub fn to_geojson(&self) -> Value {
        let coordinates: Vec<Vec<f64>> =
            self.ring.iter().map(|&(lon, lat)| vec![lon, lat]).collect();
        json!({
            "type": "Polygon",
            "coordinates": [coordinates],
        })
    }
}

//! Great-circle distance and viewport bounding-box containment used by the
//! broadcast gateway to filter which connected client a position update is
//! relevant to.

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Distance in meters between two lat/lon points via the haversine formula.
/// `haversine(p, p) == 0` exactly, and `haversine(p, antipode(p))` is within
/// 1 meter of `pi * EARTH_RADIUS_M`.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    if lat1 == lat2 && lon1 == lon2 {
        return 0.0;
    }
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_M * c
}

/// The point on the opposite side of the globe, used only by tests to
/// check the haversine identity at maximum distance.
pub fn antipode(lat: f64, lon: f64) -> (f64, f64) {
    let anti_lat = -lat;
    let anti_lon = if lon > 0.0 { lon - 180.0 } else { lon + 180.0 };
    (anti_lat, anti_lon)
}

/// `[minLon, minLat, maxLon, maxLat]` client viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl Viewport {
    pub fn from_bbox(bbox: [f64; 4]) -> Self {
        Self {
            min_lon: bbox[0],
            min_lat: bbox[1],
            max_lon: bbox[2],
            max_lat: bbox[3],
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_of_identical_points_is_exactly_zero() {
        assert_eq!(haversine_m(37.8, -122.4, 37.8, -122.4), 0.0);
    }

    #[test]
    fn haversine_of_antipodes_is_within_one_meter_of_half_circumference() {
        let (lat, lon) = (12.3, 45.6);
        let (alat, alon) = antipode(lat, lon);
        let d = haversine_m(lat, lon, alat, alon);
        let expected = std::f64::consts::PI * EARTH_RADIUS_M;
        assert!((d - expected).abs() < 1.0, "d={d} expected={expected}");
    }

    #[test]
    fn viewport_contains_checks_bbox_membership() {
        let vp = Viewport::from_bbox([-123.0, 37.0, -122.0, 38.0]);
        assert!(!vp.contains(37.5, -124.0));
        assert!(vp.contains(37.5, -122.5));
    }
}

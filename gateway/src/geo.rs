//! Great-circle distance helper shared by the GNSS listener, the fusion
//! controller's trip-distance accounting, and the route matcher.

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two WGS84 points, in meters.
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );

    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    c * EARTH_RADIUS_M
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_for_identical_points() {
        assert_eq!(haversine(22.5, 113.9, 22.5, 113.9), 0.0);
    }

    #[test]
    fn symmetric() {
        let a = (34.052235, -118.243683);
        let b = (34.060000, -118.250000);
        assert!((haversine(a.0, a.1, b.0, b.1) - haversine(b.0, b.1, a.0, a.1)).abs() < 1e-9);
    }

    #[test]
    fn one_degree_longitude_at_equator_is_about_111km() {
        let d = haversine(0.0, 0.0, 0.0, 1.0);
        assert!((d - 111_195.0).abs() < 200.0);
    }
}

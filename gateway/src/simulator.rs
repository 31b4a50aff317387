//! Simulator: walks a loaded speed plan at a fixed step and emits synthetic
//! `sim/position` / `sim/distance` updates, exercising the route matcher and
//! fusion controller without vehicle hardware attached.

use telemetry_types::SpeedPlanPoint;
use tracing::warn;

use crate::bus::Bus;
use crate::geo::haversine;

/// Interpolation step between consecutive plan points: 0.2-increment
/// interpolated steps along each segment.
const STEP: f64 = 0.2;
/// Below this step length the simulator treats the segment as exhausted and
/// advances to the next point rather than looping forever.
const MIN_SEGMENT_LENGTH_M: f64 = 1e-6;

pub struct Simulator {
    points: Vec<SpeedPlanPoint>,
    index: usize,
    r: f64,
    cumulative_distance_m: f64,
    bus: Bus,
}

impl Simulator {
    pub fn new(points: Vec<SpeedPlanPoint>, bus: Bus) -> Self {
        Self {
            points,
            index: 0,
            r: 0.0,
            cumulative_distance_m: 0.0,
            bus,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.index + 1 >= self.points.len()
    }

    /// Advance one step along the current segment, publishing the resulting
    /// synthetic position and cumulative distance. Returns `false` once the
    /// plan is exhausted.
    pub fn step(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }

        let p_i = self.points[self.index];
        let p_j = self.points[self.index + 1];
        let segment_length = haversine(p_i.lat, p_i.lon, p_j.lat, p_j.lon);

        if segment_length < MIN_SEGMENT_LENGTH_M {
            warn!(index = self.index, "simulator segment below minimum length, advancing index");
            self.index += 1;
            self.r = 0.0;
            return !self.is_exhausted();
        }

        let r_before = self.r;
        let r_after = r_before + STEP;
        let r_reported = r_after.min(1.0);
        self.cumulative_distance_m += segment_length * (r_reported - r_before);

        let lat = p_i.lat + r_reported * (p_j.lat - p_i.lat);
        let lon = p_i.lon + r_reported * (p_j.lon - p_i.lon);

        if r_after >= 1.0 {
            self.index += 1;
            self.r = 0.0;
        } else {
            self.r = r_after;
        }

        self.bus.publish(
            "sim/position",
            serde_json::json!({ "loc": { "lat": lat, "lon": lon }, "alt": 0.0 }),
        );
        self.bus
            .publish("sim/distance", serde_json::json!({ "total_distance_m": self.cumulative_distance_m }));

        !self.is_exhausted()
    }

    pub fn cumulative_distance_m(&self) -> f64 {
        self.cumulative_distance_m
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_types::VehState;

    fn pt(lat: f64, lon: f64) -> SpeedPlanPoint {
        SpeedPlanPoint {
            lat,
            lon,
            veh_state: VehState { speed: 20.0 },
            grade: 0.0,
        }
    }

    fn ten_point_route() -> Vec<SpeedPlanPoint> {
        (0..10).map(|i| pt(0.0, i as f64 * 1e-3)).collect()
    }

    #[tokio::test]
    async fn emits_at_least_nine_distance_updates_for_ten_point_route() {
        let bus = Bus::new();
        let mut rx = bus.subscribe("sim/distance");
        let mut sim = Simulator::new(ten_point_route(), bus);

        let mut steps = 0;
        while sim.step() {
            steps += 1;
            if steps > 1000 {
                panic!("simulator did not terminate");
            }
        }

        let mut updates = 0;
        while rx.try_recv().is_ok() {
            updates += 1;
        }
        assert!(updates >= 9, "expected at least 9 updates, got {updates}");
    }

    #[tokio::test]
    async fn cumulative_distance_matches_sum_of_haversines_within_one_percent() {
        let route = ten_point_route();
        let expected: f64 = route
            .windows(2)
            .map(|w| haversine(w[0].lat, w[0].lon, w[1].lat, w[1].lon))
            .sum();

        let bus = Bus::new();
        let mut sim = Simulator::new(route, bus);
        while sim.step() {}

        let actual = sim.cumulative_distance_m();
        assert!((actual - expected).abs() / expected < 0.01, "actual={actual} expected={expected}");
    }
}

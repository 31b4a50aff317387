//! # telemetry-types
//!
//! Shared wire types for the telemetry gateway's publish/subscribe bus and
//! for the speed-plan route model.
//!
//! These types are used by:
//! - `telemetry-gateway`: publishing and consuming bus messages, loading
//!   speed-plan routes for the route matcher.
//! - `route-sim`: replaying a speed plan as synthetic position/distance
//!   updates without a `telemetry-gateway` process attached.
//!
//! ## Coordinate conventions
//!
//! Latitude/longitude are decimal degrees (WGS84). Speeds on the bus are in
//! km/h unless a field name says otherwise (`speed_mps` on [`VehState`]).
//! Grade is a dimensionless slope (rise/run), not a percentage — callers
//! multiply by 100 where the spec calls for a percent display value.

use serde::{Deserialize, Serialize};

// ── Speed plan / route model ──────────────────────────────────────────────────

/// Per-point target vehicle state from the optimizer that produced the plan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct VehState {
    /// Target speed in meters/second.
    pub speed: f64,
}

/// One point of a speed plan: a location plus the target speed and grade an
/// optimal-control solver computed for that location.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpeedPlanPoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub veh_state: VehState,
    #[serde(default)]
    pub grade: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeedPlanStep {
    #[serde(default)]
    pub speedplan: Vec<Option<SpeedPlanPoint>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeedPlanLeg {
    #[serde(default)]
    pub steps: Vec<SpeedPlanStep>,
}

/// Top-level shape of a `*.route.json` speed-plan document (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
pub struct RouteDocument {
    #[serde(default)]
    pub legs: Vec<SpeedPlanLeg>,
}

impl RouteDocument {
    /// Flatten every non-null `speedplan` point across all legs/steps, in
    /// document order. Parent leg/step structure carries no meaning beyond
    /// this flattening (spec.md §4.8 "Load").
    pub fn flatten_points(&self) -> Vec<SpeedPlanPoint> {
        self.legs
            .iter()
            .flat_map(|leg| leg.steps.iter())
            .flat_map(|step| step.speedplan.iter())
            .filter_map(|pt| *pt)
            .collect()
    }
}

// ── Bus message envelope ──────────────────────────────────────────────────────

/// A single message in flight on the publish/subscribe bus. `payload` is the
/// JSON value a subscriber's callback receives; `topic` is carried alongside
/// it (rather than only as the routing key) because several payloads embed
/// their own topic field (spec.md §4.4 "publish a subset of parameter
/// names... to `j1939/<spn-name>`" with payload field `topic`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: serde_json::Value,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

// ── Canonical bus payload shapes (spec.md §6) ─────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalarValuePayload {
    pub value: f64,
    pub unit: String,
    pub topic: String,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdsSpeedPayload {
    pub timestamp: f64,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpsPositionPayload {
    pub timestamp: f64,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub num_sats: u32,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpsSpeedPayload {
    pub timestamp: f64,
    pub track_true: Option<f64>,
    pub track_magnetic: Option<f64>,
    pub speed_kmh: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotalDistancePayload {
    pub total_distance_m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackPosLoc {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackPosPayload {
    pub loc: TrackPosLoc,
    #[serde(default)]
    pub alt: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccGyroPayload {
    pub acc: Vec3,
    pub gyro: Vec3,
    #[serde(rename = "_stamp")]
    pub stamp: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_nested_legs_steps_and_drops_nulls() {
        let doc: RouteDocument = serde_json::from_value(serde_json::json!({
            "legs": [{
                "steps": [{
                    "speedplan": [
                        {"lat": 1.0, "lon": 2.0, "veh_state": {"speed": 10.0}, "grade": 0.01},
                        null,
                        {"lat": 1.1, "lon": 2.1, "veh_state": {"speed": 11.0}, "grade": 0.02}
                    ]
                }]
            }]
        }))
        .unwrap();

        let points = doc.flatten_points();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].lat, 1.1);
    }
}

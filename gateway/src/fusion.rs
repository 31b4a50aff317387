//! Fusion Controller: arbitrates redundant speed/distance/position sources,
//! tracks trip distance and follow-rate, drives the route matcher and the
//! HMI, and can run a simulation in place of real sensors (spec.md §4.10).
//!
//! Three bus-callback tasks (speed, distance, position) mutate a single
//! `Mutex`-protected [`FusionState`]; the bus's per-subscriber serialization
//! plus the mutex together give the "mutated only by bus-callback handlers"
//! contract of spec.md §3 and §5. The main worker only reads the state to
//! print heartbeats.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use telemetry_types::BusMessage;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bus::Bus;
use crate::geo::haversine;
use crate::hmi::HmiWriter;
use crate::route::{RouteCatalog, RouteMatcher};

/// OBD-family speed sources win over GPS speed while younger than this
/// (spec.md §4.10 "Arbitration").
const OBD_SPEED_FRESH: Duration = Duration::from_secs(3);
/// `h11gps/position` is preferred over `track/pos` while younger than this.
/// Not given a literal value by spec.md; chosen to match the GNSS listener's
/// typical 1 Hz fix rate with margin (documented in DESIGN.md).
const GPS_POSITION_FRESH: Duration = Duration::from_secs(5);
/// GPS cumulative distance is "stale" (falls back to the vehicle odometer
/// delta) once no position update has landed for this long.
const GPS_DISTANCE_STALE: Duration = Duration::from_secs(10);

/// Current speed is taken from the suggested speed within this tolerance for
/// follow-range accounting (spec.md §4.10 "Trip accounting").
const FOLLOW_TOLERANCE_KMH: f64 = 5.0;
/// Follow-rate is undefined below this much trip distance.
const FOLLOW_RATE_MIN_TRIP_KM: f64 = 0.1;

/// Distance accumulation thresholds shared with the GNSS listener
/// (spec.md §4.6, reused here for the controller's own per-fix accumulator).
const MIN_MOVE_M: f64 = 20.0;
const MAX_JUMP_M: f64 = 1_000_000.0;

#[derive(Clone, Copy)]
struct Reading<T> {
    value: T,
    seen_at: Instant,
}

impl<T: Copy> Reading<T> {
    fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.seen_at)
    }
}

/// Fusion State (spec.md §3): mutated only by bus callbacks.
#[derive(Default)]
struct FusionState {
    speed_obd: Option<Reading<f64>>,
    speed_gps: Option<Reading<f64>>,

    distance_hr_odometer_m: Option<Reading<f64>>,
    distance_lr_odometer_m: Option<Reading<f64>>,
    distance_obd2_m: Option<Reading<f64>>,
    odometer_baseline_m: Option<f64>,

    position_gps: Option<Reading<(f64, f64)>>,
    position_track: Option<Reading<(f64, f64)>>,
    sim_position: Option<(f64, f64)>,
    sim_distance_m: Option<f64>,

    last_accumulated_position: Option<(f64, f64)>,
    gps_cumulative_distance_m: f64,

    trip_distance_km: f64,
    follow_range_km: f64,
    follow_rate: f64,

    current_speed_kmh: f64,
    suggested_speed_kmh: f64,
    grade_pct: f64,
}

impl FusionState {
    /// Current vehicle speed per spec.md §4.10's speed arbitration: the most
    /// recently updated OBD-family source wins while it's fresh; otherwise
    /// GPS speed.
    fn arbitrate_speed(&self, now: Instant) -> f64 {
        match self.speed_obd {
            Some(r) if r.age(now) < OBD_SPEED_FRESH => r.value,
            _ => self.speed_gps.map(|r| r.value).unwrap_or(self.current_speed_kmh),
        }
    }

    /// Current best vehicle-odometer reading: high-resolution over
    /// low-resolution over the generic OBD2 trip counter.
    fn vehicle_odometer_m(&self) -> Option<f64> {
        self.distance_hr_odometer_m
            .map(|r| r.value)
            .or(self.distance_lr_odometer_m.map(|r| r.value))
            .or(self.distance_obd2_m.map(|r| r.value))
    }

    fn gps_distance_is_stale(&self, now: Instant) -> bool {
        match self.position_gps {
            Some(r) => r.age(now) >= GPS_DISTANCE_STALE,
            None => true,
        }
    }

    /// Recompute trip distance per spec.md §4.10: prefer the GPS cumulative
    /// distance unless it's stale, in which case fall back to
    /// `veh_distance - init_veh_distance`.
    fn recompute_trip_distance(&mut self, now: Instant, sim_mode: bool) {
        let new_trip_km = if sim_mode {
            self.sim_distance_m.unwrap_or(0.0) / 1000.0
        } else if self.gps_distance_is_stale(now) {
            match (self.vehicle_odometer_m(), self.odometer_baseline_m) {
                (Some(current), Some(baseline)) => (current - baseline) / 1000.0,
                _ => self.trip_distance_km,
            }
        } else {
            self.gps_cumulative_distance_m / 1000.0
        };

        let delta_km = new_trip_km - self.trip_distance_km;
        self.trip_distance_km = new_trip_km;

        if delta_km > 0.0 && (self.current_speed_kmh - self.suggested_speed_kmh).abs() <= FOLLOW_TOLERANCE_KMH {
            self.follow_range_km += delta_km;
        }

        if self.trip_distance_km > FOLLOW_RATE_MIN_TRIP_KM {
            self.follow_rate = self.follow_range_km / self.trip_distance_km;
        }
    }

    /// Heartbeat cadence, adaptive on current speed (spec.md §4.10
    /// "Heartbeat"): moving, low-speed, or stopped.
    fn heartbeat_interval(&self) -> Duration {
        if self.current_speed_kmh > 10.0 {
            Duration::from_secs(2)
        } else if self.current_speed_kmh > 0.0 {
            Duration::from_secs(5)
        } else {
            Duration::from_secs(10)
        }
    }
}

fn payload_f64(msg: &BusMessage, field: &str) -> Option<f64> {
    msg.payload.get(field).and_then(|v| v.as_f64())
}

pub struct FusionController {
    bus: Bus,
    state: std::sync::Arc<Mutex<FusionState>>,
    route_catalog: std::sync::Arc<RouteCatalog>,
    route_matcher: std::sync::Arc<Mutex<RouteMatcher>>,
    hmi: std::sync::Arc<Mutex<HmiWriter>>,
    sim_mode: bool,
}

impl FusionController {
    pub fn new(bus: Bus, route_catalog: RouteCatalog, hmi: HmiWriter, sim_mode: bool) -> Self {
        Self {
            bus,
            state: std::sync::Arc::new(Mutex::new(FusionState::default())),
            route_catalog: std::sync::Arc::new(route_catalog),
            route_matcher: std::sync::Arc::new(Mutex::new(RouteMatcher::new())),
            hmi: std::sync::Arc::new(Mutex::new(hmi)),
            sim_mode,
        }
    }

    /// Spawn the speed/distance/position bus-callback tasks plus the
    /// heartbeat loop. Returns immediately; the returned handles run until
    /// aborted or the process exits.
    pub fn spawn(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            self.spawn_speed_task(),
            self.spawn_distance_task(),
            self.spawn_position_task(),
            self.spawn_heartbeat_task(),
        ]
    }

    fn spawn_speed_task(&self) -> tokio::task::JoinHandle<()> {
        let mut group = self
            .bus
            .subscribe_group(&["j1939/Wheel-Based_Vehicle_Speed", "obd2/speed", "uds/speed", "h11gps/speed"]);
        let state = self.state.clone();
        let sim_mode = self.sim_mode;

        tokio::spawn(async move {
            while let Some(msg) = group.recv().await {
                if sim_mode {
                    continue;
                }
                let Some(speed) = payload_f64(&msg, "value").or_else(|| payload_f64(&msg, "speed_kmh")) else {
                    continue;
                };
                let now = Instant::now();
                let mut s = state.lock().await;
                let reading = Reading { value: speed, seen_at: now };
                if msg.topic == "h11gps/speed" {
                    s.speed_gps = Some(reading);
                } else {
                    s.speed_obd = Some(reading);
                }
                s.current_speed_kmh = s.arbitrate_speed(now);
                debug!(topic = %msg.topic, speed, "speed source update");
            }
        })
    }

    fn spawn_distance_task(&self) -> tokio::task::JoinHandle<()> {
        let mut group = self.bus.subscribe_group(&[
            "j1939/High_Resolution_Total_Vehicle_Distance",
            "j1939/Total_Vehicle_Distance",
            "obd2/distance_since_dtc_clear",
            "gps/distance",
            "sim/distance",
        ]);
        let state = self.state.clone();
        let sim_mode = self.sim_mode;

        tokio::spawn(async move {
            while let Some(msg) = group.recv().await {
                let now = Instant::now();
                let mut s = state.lock().await;

                match msg.topic.as_str() {
                    "sim/distance" => {
                        if let Some(d) = payload_f64(&msg, "total_distance_m") {
                            s.sim_distance_m = Some(d);
                        }
                    }
                    _ if sim_mode => continue,
                    "j1939/High_Resolution_Total_Vehicle_Distance" => {
                        if let Some(m) = payload_f64(&msg, "value") {
                            s.odometer_baseline_m.get_or_insert(m);
                            s.distance_hr_odometer_m = Some(Reading { value: m, seen_at: now });
                        }
                    }
                    "j1939/Total_Vehicle_Distance" => {
                        // Unit is km in the PGN table; normalize to meters
                        // to match the high-resolution odometer's unit.
                        if let Some(km) = payload_f64(&msg, "value") {
                            let m = km * 1000.0;
                            s.odometer_baseline_m.get_or_insert(m);
                            s.distance_lr_odometer_m = Some(Reading { value: m, seen_at: now });
                        }
                    }
                    "obd2/distance_since_dtc_clear" => {
                        if let Some(km) = payload_f64(&msg, "value") {
                            let m = km * 1000.0;
                            s.odometer_baseline_m.get_or_insert(m);
                            s.distance_obd2_m = Some(Reading { value: m, seen_at: now });
                        }
                    }
                    "gps/distance" => {
                        if let Some(m) = payload_f64(&msg, "total_distance_m") {
                            s.gps_cumulative_distance_m = m;
                        }
                    }
                    _ => {}
                }

                s.recompute_trip_distance(now, sim_mode);
            }
        })
    }

    fn spawn_position_task(&self) -> tokio::task::JoinHandle<()> {
        let mut group = self.bus.subscribe_group(&["h11gps/position", "track/pos", "sim/position"]);
        let state = self.state.clone();
        let bus = self.bus.clone();
        let route_catalog = self.route_catalog.clone();
        let route_matcher = self.route_matcher.clone();
        let hmi = self.hmi.clone();
        let sim_mode = self.sim_mode;

        tokio::spawn(async move {
            while let Some(msg) = group.recv().await {
                let now = Instant::now();

                let msg_fix = match msg.topic.as_str() {
                    "sim/position" => msg
                        .payload
                        .get("loc")
                        .and_then(|loc| Some((loc.get("lat")?.as_f64()?, loc.get("lon")?.as_f64()?))),
                    "track/pos" if !sim_mode => msg
                        .payload
                        .get("loc")
                        .and_then(|loc| Some((loc.get("lat")?.as_f64()?, loc.get("lon")?.as_f64()?))),
                    "h11gps/position" if !sim_mode => {
                        Some((payload_f64(&msg, "lat").unwrap_or(0.0), payload_f64(&msg, "lon").unwrap_or(0.0)))
                    }
                    _ => None,
                };
                let Some((msg_lat, msg_lon)) = msg_fix else { continue };

                // Record the reading, then arbitrate which source actually
                // drives the matcher/HMI this tick: `h11gps/position` while
                // fresh, else `track/pos` (spec.md §4.10 "Position").
                let (lat, lon) = {
                    let mut s = state.lock().await;
                    match msg.topic.as_str() {
                        "sim/position" => s.sim_position = Some((msg_lat, msg_lon)),
                        "track/pos" => s.position_track = Some(Reading { value: (msg_lat, msg_lon), seen_at: now }),
                        "h11gps/position" => s.position_gps = Some(Reading { value: (msg_lat, msg_lon), seen_at: now }),
                        _ => {}
                    }

                    if sim_mode {
                        (msg_lat, msg_lon)
                    } else {
                        match s.position_gps {
                            Some(r) if r.age(now) < GPS_POSITION_FRESH => r.value,
                            _ => s.position_track.map(|r| r.value).unwrap_or((msg_lat, msg_lon)),
                        }
                    }
                };

                {
                    let mut s = state.lock().await;

                    if !sim_mode {
                        if let Some((last_lat, last_lon)) = s.last_accumulated_position {
                            let delta = haversine(last_lat, last_lon, lat, lon);
                            if (MIN_MOVE_M..=MAX_JUMP_M).contains(&delta) {
                                s.gps_cumulative_distance_m += delta;
                                bus.publish(
                                    "gps/distance",
                                    serde_json::json!({ "total_distance_m": s.gps_cumulative_distance_m }),
                                );
                            }
                        }
                        s.last_accumulated_position = Some((lat, lon));
                    }
                }

                {
                    let mut matcher = route_matcher.lock().await;
                    if !matcher.has_active_route() {
                        matcher.select_closest_route(&route_catalog, lat, lon);
                    }
                    matcher.update_pt(lat, lon);

                    let mut s = state.lock().await;
                    if let Some((speed_mps, grade)) = matcher.suggest_speed_and_grade() {
                        s.suggested_speed_kmh = speed_mps * 3.6;
                        s.grade_pct = grade * 100.0;
                    }
                    // No real speed sensor feeds the bus in simulation mode
                    // (there is no `sim/speed` topic); assume perfect
                    // tracking of the speed plan so follow-rate accounting
                    // still exercises its logic instead of reading 0 km/h.
                    if sim_mode {
                        s.current_speed_kmh = s.suggested_speed_kmh;
                    }
                    s.recompute_trip_distance(now, sim_mode);

                    let mut writer = hmi.lock().await;
                    writer.set_speed(s.current_speed_kmh).await;
                    writer.set_suggested_speed(s.suggested_speed_kmh).await;
                    writer.set_grade(s.grade_pct / 100.0).await;
                    writer.set_distance_km(s.trip_distance_km).await;
                    writer.set_follow_range_km(s.follow_range_km).await;
                    writer.set_follow_rate(s.follow_rate).await;
                }
            }
        })
    }

    fn spawn_heartbeat_task(&self) -> tokio::task::JoinHandle<()> {
        let state = self.state.clone();
        let route_matcher = self.route_matcher.clone();

        tokio::spawn(async move {
            loop {
                let interval = {
                    let s = state.lock().await;
                    s.heartbeat_interval()
                };
                tokio::time::sleep(interval).await;

                let s = state.lock().await;
                let matcher_state = route_matcher.lock().await;
                info!(
                    current_speed_kmh = s.current_speed_kmh,
                    suggested_speed_kmh = s.suggested_speed_kmh,
                    grade_pct = s.grade_pct,
                    trip_distance_km = s.trip_distance_km,
                    follow_range_km = s.follow_range_km,
                    follow_rate = s.follow_rate,
                    matched_index = matcher_state.state().current_pt_index,
                    match_distance_m = matcher_state.state().distance_m,
                    "fusion heartbeat"
                );
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(value: f64, seen_at: Instant) -> Reading<f64> {
        Reading { value, seen_at }
    }

    #[test]
    fn obd_speed_wins_while_fresh() {
        let mut s = FusionState::default();
        let now = Instant::now();
        s.speed_obd = Some(reading(40.0, now));
        s.speed_gps = Some(reading(80.0, now));
        assert_eq!(s.arbitrate_speed(now), 40.0);
    }

    #[test]
    fn gps_speed_wins_once_obd_goes_stale() {
        let mut s = FusionState::default();
        let base = Instant::now();
        s.speed_obd = Some(reading(40.0, base));
        s.speed_gps = Some(reading(80.0, base));
        let later = base + Duration::from_secs(6);
        assert_eq!(s.arbitrate_speed(later), 80.0);
    }

    #[test]
    fn high_res_odometer_preferred_over_low_res() {
        let mut s = FusionState::default();
        let now = Instant::now();
        s.distance_hr_odometer_m = Some(reading(1000.0, now));
        s.distance_lr_odometer_m = Some(reading(2000.0, now));
        assert_eq!(s.vehicle_odometer_m(), Some(1000.0));
    }

    #[test]
    fn follow_range_only_accumulates_within_tolerance() {
        let mut s = FusionState::default();
        let now = Instant::now();
        s.position_gps = Some(Reading { value: (0.0, 0.0), seen_at: now });
        s.gps_cumulative_distance_m = 200.0;
        s.current_speed_kmh = 60.0;
        s.suggested_speed_kmh = 62.0;

        s.recompute_trip_distance(now, false);
        assert!(s.follow_range_km > 0.0);

        s.suggested_speed_kmh = 90.0;
        s.gps_cumulative_distance_m = 400.0;
        let before = s.follow_range_km;
        s.recompute_trip_distance(now, false);
        assert_eq!(s.follow_range_km, before);
    }

    #[test]
    fn follow_rate_stays_zero_below_minimum_trip_distance() {
        let mut s = FusionState::default();
        let now = Instant::now();
        s.position_gps = Some(Reading { value: (0.0, 0.0), seen_at: now });
        s.gps_cumulative_distance_m = 50.0; // 0.05 km < 0.1 km minimum
        s.current_speed_kmh = 60.0;
        s.suggested_speed_kmh = 60.0;
        s.recompute_trip_distance(now, false);
        assert_eq!(s.follow_rate, 0.0);
    }

    #[test]
    fn heartbeat_interval_adapts_to_speed() {
        let mut s = FusionState::default();
        s.current_speed_kmh = 0.0;
        assert_eq!(s.heartbeat_interval(), Duration::from_secs(10));
        s.current_speed_kmh = 5.0;
        assert_eq!(s.heartbeat_interval(), Duration::from_secs(5));
        s.current_speed_kmh = 50.0;
        assert_eq!(s.heartbeat_interval(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn arbitration_scenario_matches_spec_example() {
        // uds/speed=40 at t0, h11gps/speed=80 at t1; fusion reports 40 at
        // t2, then 80 once UDS goes stale past the 3s freshness window.
        let bus = Bus::new();
        let catalog = RouteCatalog::load_dir(std::env::temp_dir()).expect("temp dir always readable");
        let controller = FusionController::new(bus.clone(), catalog, HmiWriter::discover("/nonexistent/*").await, false);
        let handles = controller.spawn();

        bus.publish("uds/speed", serde_json::json!({"timestamp": 0.0, "value": 40.0}));
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.publish("h11gps/speed", serde_json::json!({"timestamp": 1.0, "track_true": null, "track_magnetic": null, "speed_kmh": 80.0}));
        tokio::time::sleep(Duration::from_millis(50)).await;

        {
            let s = controller.state.lock().await;
            assert_eq!(s.current_speed_kmh, 40.0);
        }

        tokio::time::sleep(Duration::from_secs(3)).await;
        // Re-publish GPS so arbitration re-evaluates past the OBD freshness window.
        bus.publish("h11gps/speed", serde_json::json!({"timestamp": 2.0, "track_true": null, "track_magnetic": null, "speed_kmh": 80.0}));
        tokio::time::sleep(Duration::from_millis(50)).await;

        {
            let s = controller.state.lock().await;
            assert_eq!(s.current_speed_kmh, 80.0);
        }

        for h in handles {
            h.abort();
        }
    }
}

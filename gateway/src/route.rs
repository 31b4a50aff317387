//! Route matcher: load a speed plan, pick the closest route, project a GPS
//! fix onto the matched segment and interpolate a suggested speed/grade.

use std::path::Path;

use telemetry_types::{RouteDocument, SpeedPlanPoint};
use tracing::warn;

use crate::error::GatewayError;
use crate::geo::haversine;

/// Added to the cross-track score of an out-of-[0,1] projection so that
/// segments naturally bracketing the GPS fix are preferred over ones where
/// the fix falls beyond an endpoint.
const EXTERIOR_PENALTY_M: f64 = 10.0;
/// Radius (each side of the previous match) searched before falling back to
/// the full route.
const WINDOW_BACK: usize = 20;
const WINDOW_FORWARD: usize = 100;
/// If nothing within this distance turns up in the windowed search, repeat
/// over the full route.
const WINDOW_MISS_THRESHOLD_M: f64 = 50.0;
/// Segment-index jump per update beyond which we log a warning.
const JUMP_WARNING_THRESHOLD: i64 = 5;

/// A loaded route: a flat, ordered sequence of speed-plan points. Built by
/// [`RouteCatalog::load`]; never mutated after load.
#[derive(Debug, Clone)]
pub struct Route {
    pub name: String,
    points: Vec<SpeedPlanPoint>,
}

impl Route {
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn first_point(&self) -> Option<&SpeedPlanPoint> {
        self.points.first()
    }

    pub fn points(&self) -> &[SpeedPlanPoint] {
        &self.points
    }
}

/// A directory of candidate routes the matcher can select from at startup.
#[derive(Clone)]
pub struct RouteCatalog {
    routes: Vec<Route>,
}

impl RouteCatalog {
    /// Load every `*.json` speed-plan document directly under `dir`, named
    /// after its filename stem. A document whose flattening yields fewer
    /// than two points is skipped — a route needs at least two points to
    /// define any segment at all.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let dir = dir.as_ref();
        let mut routes = Vec::new();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| GatewayError::RouteLoad(format!("reading route directory {}: {e}", dir.display())))?;

        for entry in entries {
            let entry = entry.map_err(|e| GatewayError::RouteLoad(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::load_one(&path) {
                Ok(route) => routes.push(route),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unloadable route file"),
            }
        }
        Ok(Self { routes })
    }

    fn load_one(path: &Path) -> Result<Route, GatewayError> {
        let text = std::fs::read_to_string(path).map_err(|e| GatewayError::RouteLoad(e.to_string()))?;
        let doc: RouteDocument =
            serde_json::from_str(&text).map_err(|e| GatewayError::RouteLoad(format!("{}: {e}", path.display())))?;
        let points = dedup_zero_length(doc.flatten_points());
        if points.len() < 2 {
            return Err(GatewayError::RouteLoad(format!(
                "{} has fewer than two usable points",
                path.display()
            )));
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("route")
            .to_string();
        Ok(Route { name, points })
    }

    /// Load one in-memory route, bypassing the filesystem. Used by
    /// `route-sim` and tests.
    pub fn from_points(name: impl Into<String>, points: Vec<SpeedPlanPoint>) -> Result<Route, GatewayError> {
        let points = dedup_zero_length(points);
        if points.len() < 2 {
            return Err(GatewayError::RouteLoad("route has fewer than two usable points".into()));
        }
        Ok(Route {
            name: name.into(),
            points,
        })
    }

    /// The first loaded route, if any — used by the simulator, which walks
    /// one plan rather than selecting by GPS proximity.
    pub fn first(&self) -> Option<&Route> {
        self.routes.first()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Select the candidate route whose first point is closest (great-circle)
    /// to `fix`.
    pub fn closest_to(&self, lat: f64, lon: f64) -> Option<&Route> {
        self.routes.iter().min_by(|a, b| {
            let da = a.first_point().map_or(f64::INFINITY, |p| haversine(lat, lon, p.lat, p.lon));
            let db = b.first_point().map_or(f64::INFINITY, |p| haversine(lat, lon, p.lat, p.lon));
            da.total_cmp(&db)
        })
    }
}

/// Consecutive points whose segment has zero length (loader-level dedup,
/// so consecutive points always define a segment with positive length).
fn dedup_zero_length(points: Vec<SpeedPlanPoint>) -> Vec<SpeedPlanPoint> {
    let mut out: Vec<SpeedPlanPoint> = Vec::with_capacity(points.len());
    for p in points {
        if let Some(last) = out.last() {
            if last.lat == p.lat && last.lon == p.lon {
                continue;
            }
        }
        out.push(p);
    }
    out
}

/// Local-planar projection of a GPS point onto a segment, via an
/// equirectangular approximation: flatten lat/lon to local x/y around the
/// segment's first point, project, then convert the projection ratio back
/// to a real distance with the haversine formula.
struct SegmentProjection {
    /// Projection ratio before clamping, 0 at `p_i`, 1 at `p_{i+1}`.
    r_raw: f64,
    /// Cross-track (or endpoint) distance, including the exterior penalty.
    score_m: f64,
    /// Ratio actually used to interpolate, clamped to [0,1].
    r_clamped: f64,
}

fn project(g_lat: f64, g_lon: f64, p_i: &SpeedPlanPoint, p_j: &SpeedPlanPoint) -> SegmentProjection {
    let lon_scale = p_i.lat.to_radians().cos();

    let to_local = |lat: f64, lon: f64| -> (f64, f64) { ((lon - p_i.lon) * lon_scale, lat - p_i.lat) };

    let (dx, dy) = to_local(p_j.lat, p_j.lon);
    let (vx, vy) = to_local(g_lat, g_lon);

    let dd = dx * dx + dy * dy;
    if dd == 0.0 {
        let d = haversine(g_lat, g_lon, p_i.lat, p_i.lon);
        return SegmentProjection {
            r_raw: 0.0,
            score_m: d,
            r_clamped: 0.0,
        };
    }

    let r_raw = (vx * dx + vy * dy) / dd;

    if (0.0..=1.0).contains(&r_raw) {
        let interp_lat = p_i.lat + r_raw * (p_j.lat - p_i.lat);
        let interp_lon = p_i.lon + r_raw * (p_j.lon - p_i.lon);
        SegmentProjection {
            r_raw,
            score_m: haversine(g_lat, g_lon, interp_lat, interp_lon),
            r_clamped: r_raw,
        }
    } else {
        let r_clamped = r_raw.clamp(0.0, 1.0);
        let interp_lat = p_i.lat + r_clamped * (p_j.lat - p_i.lat);
        let interp_lon = p_i.lon + r_clamped * (p_j.lon - p_i.lon);
        SegmentProjection {
            r_raw,
            score_m: haversine(g_lat, g_lon, interp_lat, interp_lon) + EXTERIOR_PENALTY_M,
            r_clamped,
        }
    }
}

/// Best segment match for one GPS fix. `index` is always the *lower* index
/// of the matched segment.
struct BestMatch {
    index: usize,
    distance_m: f64,
    r: f64,
}

fn best_in_range(route: &Route, g_lat: f64, g_lon: f64, range: std::ops::RangeInclusive<usize>) -> Option<BestMatch> {
    let n = route.points.len();
    if n < 2 {
        return None;
    }
    range
        .filter(|&i| i + 1 < n)
        .map(|i| {
            let proj = project(g_lat, g_lon, &route.points[i], &route.points[i + 1]);
            (i, proj)
        })
        .min_by(|(_, a), (_, b)| a.score_m.total_cmp(&b.score_m))
        .map(|(index, proj)| BestMatch {
            index,
            distance_m: proj.score_m,
            r: proj.r_clamped,
        })
}

/// Mutable matcher state, single-owner/single-writer: created at −1/0
/// and never destroyed, updated on every GPS fix.
#[derive(Debug, Clone)]
pub struct MatchState {
    pub current_pt_index: i64,
    pub distance_m: f64,
    pub r: f64,
}

impl Default for MatchState {
    fn default() -> Self {
        Self {
            current_pt_index: -1,
            distance_m: 0.0,
            r: 0.0,
        }
    }
}

/// Owns the active route (if any) and the match state projected onto it.
pub struct RouteMatcher {
    active: Option<Route>,
    state: MatchState,
}

impl RouteMatcher {
    pub fn new() -> Self {
        Self {
            active: None,
            state: MatchState::default(),
        }
    }

    pub fn has_active_route(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_route_name(&self) -> Option<&str> {
        self.active.as_ref().map(|r| r.name.as_str())
    }

    pub fn state(&self) -> &MatchState {
        &self.state
    }

    /// Select the closest candidate route from `catalog` for this fix.
    /// No-op if a route is already active.
    pub fn select_closest_route(&mut self, catalog: &RouteCatalog, lat: f64, lon: f64) {
        if self.active.is_some() {
            return;
        }
        if let Some(route) = catalog.closest_to(lat, lon) {
            self.active = Some(route.clone());
            self.state = MatchState::default();
        }
    }

    /// Activate a specific route directly, bypassing catalog selection.
    /// Used by the simulator, which already knows which plan it's walking.
    pub fn set_active_route(&mut self, route: Route) {
        self.active = Some(route);
        self.state = MatchState::default();
    }

    /// Project `(lat, lon)` onto the active route, updating `state` by
    /// searching a window around the previous match before falling back
    /// to the full route. A no-op (index stays −1) when no route is
    /// active.
    pub fn update_pt(&mut self, lat: f64, lon: f64) {
        let Some(route) = self.active.as_ref() else {
            self.state = MatchState::default();
            return;
        };
        let n = route.point_count();
        if n < 2 {
            self.state = MatchState::default();
            return;
        }

        let previous_index = self.state.current_pt_index;

        let windowed = if previous_index >= 0 {
            let k = previous_index as usize;
            let lo = k.saturating_sub(WINDOW_BACK);
            let hi = (k + WINDOW_FORWARD).min(n - 2);
            best_in_range(route, lat, lon, lo..=hi)
        } else {
            None
        };

        let best = match windowed {
            Some(m) if m.distance_m <= WINDOW_MISS_THRESHOLD_M => m,
            Some(windowed_match) => {
                // Windowed search didn't find anything close; fall back to
                // the full range and keep whichever candidate scores lower.
                match best_in_range(route, lat, lon, 0..=(n - 2)) {
                    Some(full_match) if full_match.distance_m < windowed_match.distance_m => full_match,
                    _ => windowed_match,
                }
            }
            None => best_in_range(route, lat, lon, 0..=(n - 2)).expect("n >= 2 guarantees a candidate"),
        };

        if previous_index >= 0 {
            let jump = (best.index as i64 - previous_index).abs();
            if jump > JUMP_WARNING_THRESHOLD {
                let old = &route.points[previous_index as usize];
                let new = &route.points[best.index];
                warn!(
                    jump,
                    distance_m = haversine(old.lat, old.lon, new.lat, new.lon),
                    "route matcher index jumped by more than 5"
                );
            }
        }

        self.state = MatchState {
            current_pt_index: best.index as i64,
            distance_m: best.distance_m,
            r: best.r,
        };
    }

    /// Ratio-weighted interpolation of `(speed, grade)` between the matched
    /// segment's endpoints (spec.md §4.8 "Outputs"). `speed` is in m/s, as
    /// stored on the plan; callers convert to km/h for display.
    pub fn suggest_speed_and_grade(&self) -> Option<(f64, f64)> {
        let route = self.active.as_ref()?;
        let i = self.state.current_pt_index;
        if i < 0 {
            return None;
        }
        let i = i as usize;
        let p_i = route.points.get(i)?;
        let Some(p_j) = route.points.get(i + 1) else {
            return Some((p_i.veh_state.speed, p_i.grade));
        };

        let r = self.state.r;
        let speed = p_i.veh_state.speed + r * (p_j.veh_state.speed - p_i.veh_state.speed);
        let grade = p_i.grade + r * (p_j.grade - p_i.grade);
        Some((speed, grade))
    }
}

impl Default for RouteMatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_types::VehState;

    fn pt(lat: f64, lon: f64, speed: f64, grade: f64) -> SpeedPlanPoint {
        SpeedPlanPoint {
            lat,
            lon,
            veh_state: VehState { speed },
            grade,
        }
    }

    #[test]
    fn fresh_matcher_is_unmatched() {
        let matcher = RouteMatcher::new();
        assert_eq!(matcher.state().current_pt_index, -1);
    }

    #[test]
    fn update_pt_without_route_stays_unmatched() {
        let mut matcher = RouteMatcher::new();
        matcher.update_pt(0.0, 0.0);
        assert_eq!(matcher.state().current_pt_index, -1);
    }

    #[test]
    fn interior_projection_halfway_between_two_points() {
        let route = RouteCatalog::from_points(
            "test",
            vec![pt(0.0, 0.0, 10.0, 0.0), pt(0.0, 1e-3, 20.0, 0.02), pt(0.0, 2e-3, 30.0, 0.04)],
        )
        .unwrap();
        let mut matcher = RouteMatcher::new();
        matcher.set_active_route(route);
        matcher.update_pt(0.0, 1.5e-3);

        assert_eq!(matcher.state().current_pt_index, 1);
        assert!((matcher.state().r - 0.5).abs() < 1e-6);

        let (speed, _grade) = matcher.suggest_speed_and_grade().unwrap();
        assert!((speed - 25.0).abs() < 1e-6);
    }

    #[test]
    fn exterior_projection_clamps_and_penalizes() {
        let route = RouteCatalog::from_points("test", vec![pt(0.0, 0.0, 10.0, 0.0), pt(0.0, 1e-3, 20.0, 0.0)]).unwrap();
        let mut matcher = RouteMatcher::new();
        matcher.set_active_route(route);
        matcher.update_pt(0.0, 3e-3);

        assert_eq!(matcher.state().current_pt_index, 0);
        assert_eq!(matcher.state().r, 1.0);
    }

    #[test]
    fn coincident_with_plan_point_has_near_zero_distance() {
        let route =
            RouteCatalog::from_points("test", vec![pt(0.0, 0.0, 10.0, 0.0), pt(0.0, 1e-3, 20.0, 0.0), pt(0.0, 2e-3, 30.0, 0.0)])
                .unwrap();
        let mut matcher = RouteMatcher::new();
        matcher.set_active_route(route);
        matcher.update_pt(0.0, 1e-3);

        assert!(matcher.state().current_pt_index == 0 || matcher.state().current_pt_index == 1);
        assert!(matcher.state().distance_m <= 1.0);
    }

    #[test]
    fn invariant_index_always_in_valid_range_or_unmatched() {
        let route = RouteCatalog::from_points(
            "test",
            vec![pt(0.0, 0.0, 10.0, 0.0), pt(0.0, 1e-3, 20.0, 0.0), pt(0.0, 2e-3, 30.0, 0.0)],
        )
        .unwrap();
        let mut matcher = RouteMatcher::new();
        matcher.set_active_route(route);

        for lon in [-5e-3, -1e-4, 5e-4, 1.2e-3, 5e-3] {
            matcher.update_pt(0.0001, lon);
            let idx = matcher.state().current_pt_index;
            assert!(idx == -1 || (0..=1).contains(&idx));
        }
    }

    #[test]
    fn route_with_fewer_than_two_points_is_rejected() {
        let err = RouteCatalog::from_points("test", vec![pt(0.0, 0.0, 10.0, 0.0)]);
        assert!(err.is_err());
    }

    #[test]
    fn zero_length_consecutive_points_are_deduped() {
        let route = RouteCatalog::from_points(
            "test",
            vec![pt(0.0, 0.0, 10.0, 0.0), pt(0.0, 0.0, 10.0, 0.0), pt(0.0, 1e-3, 20.0, 0.0)],
        )
        .unwrap();
        assert_eq!(route.point_count(), 2);
    }
}

//! `route-sim` — walks a loaded speed-plan JSON document and prints
//! synthetic position/distance updates as JSON lines, for bench-testing the
//! route matcher and GNSS ingestion path without vehicle hardware attached
//! (SPEC_FULL.md §A).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use telemetry_types::{RouteDocument, SpeedPlanPoint};
use tracing::{info, warn};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (lat1.to_radians(), lon1.to_radians(), lat2.to_radians(), lon2.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * a.sqrt().asin() * EARTH_RADIUS_M
}

/// Mirrors `gateway::simulator`'s step size and minimum-segment-length
/// cutoff (spec.md §4.10 "Simulation mode").
const DEFAULT_STEP: f64 = 0.2;
const MIN_SEGMENT_LENGTH_M: f64 = 1e-6;

#[derive(Parser, Debug)]
#[command(name = "route-sim", about = "Replay a speed-plan route as synthetic position/distance updates")]
struct Args {
    /// Path to a speed-plan JSON document (spec.md §6 "Speed-plan JSON").
    route_file: PathBuf,

    /// Interpolation step per tick, 0 < step <= 1.
    #[arg(long, default_value_t = DEFAULT_STEP)]
    step: f64,

    /// Delay between printed updates, milliseconds. 0 prints as fast as possible.
    #[arg(long, default_value_t = 200)]
    interval_ms: u64,
}

fn load_points(path: &std::path::Path) -> Result<Vec<SpeedPlanPoint>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let doc: RouteDocument = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let points = doc.flatten_points();
    if points.len() < 2 {
        anyhow::bail!("{} has fewer than two usable speed-plan points", path.display());
    }
    Ok(points)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "route_sim=info".into()))
        .init();

    let args = Args::parse();
    if !(0.0..=1.0).contains(&args.step) || args.step <= 0.0 {
        anyhow::bail!("--step must be in (0, 1]");
    }

    let points = load_points(&args.route_file)?;
    info!(points = points.len(), file = %args.route_file.display(), "loaded speed plan");

    let mut index = 0usize;
    let mut r = 0.0f64;
    let mut cumulative_distance_m = 0.0f64;

    while index + 1 < points.len() {
        let p_i = points[index];
        let p_j = points[index + 1];
        let segment_length = haversine(p_i.lat, p_i.lon, p_j.lat, p_j.lon);

        if segment_length < MIN_SEGMENT_LENGTH_M {
            warn!(index, "segment below minimum length, advancing index");
            index += 1;
            r = 0.0;
            continue;
        }

        let r_before = r;
        let r_after = (r_before + args.step).min(1.0);
        cumulative_distance_m += segment_length * (r_after - r_before);

        let lat = p_i.lat + r_after * (p_j.lat - p_i.lat);
        let lon = p_i.lon + r_after * (p_j.lon - p_i.lon);

        println!(
            "{}",
            serde_json::json!({
                "type": "position",
                "lat": lat,
                "lon": lon,
            })
        );
        println!(
            "{}",
            serde_json::json!({
                "type": "distance",
                "total_distance_m": cumulative_distance_m,
            })
        );

        if r_before + args.step >= 1.0 {
            index += 1;
            r = 0.0;
        } else {
            r = r_before + args.step;
        }

        if args.interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    info!(total_distance_m = cumulative_distance_m, "speed plan exhausted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry_types::VehState;

    fn pt(lat: f64, lon: f64) -> SpeedPlanPoint {
        SpeedPlanPoint {
            lat,
            lon,
            veh_state: VehState { speed: 10.0 },
            grade: 0.0,
        }
    }

    #[test]
    fn load_points_rejects_short_routes() {
        let dir = std::env::temp_dir().join(format!("route-sim-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("short.json");
        std::fs::write(&path, r#"{"legs":[{"steps":[{"speedplan":[{"lat":0,"lon":0,"veh_state":{"speed":1},"grade":0}]}]}]}"#).unwrap();
        assert!(load_points(&path).is_err());
    }

    #[test]
    fn load_points_flattens_valid_routes() {
        let dir = std::env::temp_dir().join(format!("route-sim-test2-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ok.json");
        std::fs::write(
            &path,
            r#"{"legs":[{"steps":[{"speedplan":[
                {"lat":0,"lon":0,"veh_state":{"speed":1},"grade":0},
                {"lat":0,"lon":0.001,"veh_state":{"speed":2},"grade":0.01}
            ]}]}]}"#,
        )
        .unwrap();
        let points = load_points(&path).unwrap();
        assert_eq!(points.len(), 2);
    }

    #[test]
    fn haversine_matches_known_one_degree_longitude_distance() {
        let d = haversine(0.0, 0.0, 0.0, 1.0);
        assert!((d - 111_195.0).abs() < 200.0);
    }

    #[test]
    fn unused_point_constructor_sanity() {
        let p = pt(1.0, 2.0);
        assert_eq!(p.lat, 1.0);
    }
}

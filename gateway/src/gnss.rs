//! Bluetooth GNSS listener: NMEA sentence parsing over an rfcomm-bound
//! serial port, haversine distance accumulation, position/speed publish.
//!
//! No crate in this workspace speaks NMEA directly, so GGA/VTG parsing is
//! implemented by hand against the comma-delimited sentence format, the
//! same way `uds::isotp` hand-rolls ISO-TP framing.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, warn};

use crate::bus::Bus;
use crate::error::GatewayError;
use crate::geo::haversine;
use crate::listener::{Listener, RawDataLogger};

const BAUD_RATE: u32 = 9600;
/// Ignore accumulated-distance increments below this (likely GPS jitter)
/// and above this (likely a bad fix / teleport).
const MIN_MOVE_M: f64 = 20.0;
const MAX_JUMP_M: f64 = 1_000_000.0;

struct Gga {
    lat: f64,
    lon: f64,
    alt: f64,
    num_sats: u32,
    fix_quality: u32,
}

struct Vtg {
    track_true: Option<f64>,
    track_magnetic: Option<f64>,
    speed_kmh: f64,
}

/// Convert NMEA `ddmm.mmmm` (or `dddmm.mmmm` for longitude) plus a
/// hemisphere letter into signed decimal degrees.
fn parse_nmea_coordinate(raw: &str, hemisphere: &str, degree_digits: usize) -> Option<f64> {
    if raw.is_empty() {
        return None;
    }
    let dot = raw.find('.')?;
    if dot < degree_digits {
        return None;
    }
    let degrees: f64 = raw[..degree_digits].parse().ok()?;
    let minutes: f64 = raw[degree_digits..].parse().ok()?;
    let mut decimal = degrees + minutes / 60.0;
    if hemisphere == "S" || hemisphere == "W" {
        decimal = -decimal;
    }
    Some(decimal)
}

fn parse_gga(fields: &[&str]) -> Option<Gga> {
    // $..GGA,time,lat,N/S,lon,E/W,quality,numSV,HDOP,alt,M,...
    if fields.len() < 10 {
        return None;
    }
    let lat = parse_nmea_coordinate(fields[2], fields[3], 2)?;
    let lon = parse_nmea_coordinate(fields[4], fields[5], 3)?;
    let fix_quality: u32 = fields[6].parse().ok()?;
    let num_sats: u32 = fields[7].parse().unwrap_or(0);
    let alt: f64 = fields[9].parse().unwrap_or(0.0);
    Some(Gga {
        lat,
        lon,
        alt,
        num_sats,
        fix_quality,
    })
}

fn parse_vtg(fields: &[&str]) -> Option<Vtg> {
    // $..VTG,trackTrue,T,trackMag,M,speedKnots,N,speedKmh,K,...
    if fields.len() < 9 {
        return None;
    }
    let track_true = fields[1].parse::<f64>().ok();
    let track_magnetic = fields[3].parse::<f64>().ok();
    let speed_kmh: f64 = fields[7].parse().ok()?;
    Some(Vtg {
        track_true,
        track_magnetic,
        speed_kmh,
    })
}

enum Sentence {
    Gga(Gga),
    Vtg(Vtg),
    Other,
}

fn parse_sentence(line: &str) -> Option<Sentence> {
    let line = line.trim();
    let body = line.strip_prefix('$')?;
    let body = body.split('*').next().unwrap_or(body);
    let fields: Vec<&str> = body.split(',').collect();
    let tag = fields.first()?;

    if tag.ends_with("GGA") {
        return Some(parse_gga(&fields).map(Sentence::Gga).unwrap_or(Sentence::Other));
    }
    if tag.ends_with("VTG") {
        return Some(parse_vtg(&fields).map(Sentence::Vtg).unwrap_or(Sentence::Other));
    }
    Some(Sentence::Other)
}

pub struct GnssListener {
    port_path: String,
    bind_mac: Option<String>,
    bus: Bus,
    raw_logger: RawDataLogger,
    reader: Option<BufReader<tokio_serial::SerialStream>>,
    last_fix: Option<(f64, f64)>,
    total_distance_m: f64,
}

impl GnssListener {
    pub fn new(port_path: impl Into<String>, bind_mac: Option<String>, data_dir: impl AsRef<Path>, bus: Bus) -> Self {
        Self {
            port_path: port_path.into(),
            bind_mac,
            bus,
            raw_logger: RawDataLogger::new(data_dir, "GNSS"),
            reader: None,
            last_fix: None,
            total_distance_m: 0.0,
        }
    }

    /// `rfcomm bind <port> <mac>` when the device node doesn't exist yet.
    /// Best-effort: failures are logged and the subsequent port open will
    /// fail on its own if the bind didn't help.
    async fn bind_rfcomm_if_needed(&self) {
        if Path::new(&self.port_path).exists() {
            return;
        }
        let Some(mac) = self.bind_mac.as_ref() else {
            return;
        };
        match tokio::process::Command::new("rfcomm")
            .args(["bind", &self.port_path, mac])
            .status()
            .await
        {
            Ok(status) if status.success() => {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
            Ok(status) => warn!(%status, port = %self.port_path, "rfcomm bind exited non-zero"),
            Err(e) => warn!(error = %e, port = %self.port_path, "rfcomm bind failed to launch"),
        }
    }

    fn handle_gga(&mut self, gga: Gga, timestamp: f64) {
        let status = if gga.fix_quality > 0 { "fix" } else { "no_fix" };
        self.bus.publish(
            "h11gps/position",
            serde_json::json!({
                "timestamp": timestamp,
                "lat": gga.lat,
                "lon": gga.lon,
                "alt": gga.alt,
                "num_sats": gga.num_sats,
                "status": status,
            }),
        );

        if gga.fix_quality > 0 {
            if let Some((last_lat, last_lon)) = self.last_fix {
                let delta = haversine(last_lat, last_lon, gga.lat, gga.lon);
                if delta >= MIN_MOVE_M && delta <= MAX_JUMP_M {
                    self.total_distance_m += delta;
                    self.bus.publish(
                        "h11gps/total_distance",
                        serde_json::json!({ "total_distance_m": self.total_distance_m }),
                    );
                } else if delta > MAX_JUMP_M {
                    debug!(delta_m = delta, "GNSS distance delta exceeds sanity ceiling, ignored");
                }
            }
            self.last_fix = Some((gga.lat, gga.lon));
        }
    }

    fn handle_vtg(&self, vtg: Vtg, timestamp: f64) {
        self.bus.publish(
            "h11gps/speed",
            serde_json::json!({
                "timestamp": timestamp,
                "track_true": vtg.track_true,
                "track_magnetic": vtg.track_magnetic,
                "speed_kmh": vtg.speed_kmh,
            }),
        );
    }
}

#[async_trait]
impl Listener for GnssListener {
    fn name(&self) -> &str {
        "GNSS"
    }

    async fn setup(&mut self) -> Result<(), GatewayError> {
        self.bind_rfcomm_if_needed().await;

        let port = tokio_serial::new(&self.port_path, BAUD_RATE)
            .open_native_async()
            .map_err(|e| GatewayError::SerialUnavailable(self.port_path.clone(), e.to_string()))?;
        self.reader = Some(BufReader::new(port));
        Ok(())
    }

    async fn tick(&mut self) -> Result<(), GatewayError> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(());
        };

        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| GatewayError::SerialUnavailable(self.port_path.clone(), e.to_string()))?;
        if n == 0 {
            return Ok(());
        }

        self.raw_logger.append(line.trim_end()).await;
        let timestamp = Utc::now().timestamp_millis() as f64 / 1000.0;

        match parse_sentence(&line) {
            Some(Sentence::Gga(gga)) => self.handle_gga(gga, timestamp),
            Some(Sentence::Vtg(vtg)) => self.handle_vtg(vtg, timestamp),
            Some(Sentence::Other) | None => {}
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.reader = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_northern_eastern_coordinate() {
        // 2237.5000,N -> 22 deg 37.5 min = 22.625
        let lat = parse_nmea_coordinate("2237.5000", "N", 2).unwrap();
        assert!((lat - 22.625).abs() < 1e-6);
    }

    #[test]
    fn southern_western_hemisphere_is_negated() {
        let lat = parse_nmea_coordinate("2237.5000", "S", 2).unwrap();
        assert!((lat + 22.625).abs() < 1e-6);
        let lon = parse_nmea_coordinate("11354.0000", "W", 3).unwrap();
        assert!(lon < 0.0);
    }

    #[test]
    fn parses_gga_sentence() {
        let line = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
        match parse_sentence(line).unwrap() {
            Sentence::Gga(gga) => {
                assert_eq!(gga.fix_quality, 1);
                assert_eq!(gga.num_sats, 8);
                assert!((gga.alt - 545.4).abs() < 1e-6);
            }
            _ => panic!("expected GGA"),
        }
    }

    #[test]
    fn parses_vtg_sentence() {
        let line = "$GPVTG,054.7,T,034.4,M,005.5,N,010.2,K*48";
        match parse_sentence(line).unwrap() {
            Sentence::Vtg(vtg) => {
                assert!((vtg.speed_kmh - 10.2).abs() < 1e-6);
                assert_eq!(vtg.track_true, Some(54.7));
            }
            _ => panic!("expected VTG"),
        }
    }

    #[test]
    fn zero_fix_quality_still_parses_but_no_accumulation_expected_by_caller() {
        let line = "$GPGGA,123519,4807.038,N,01131.000,E,0,00,99.9,0.0,M,0.0,M,,*";
        match parse_sentence(line).unwrap() {
            Sentence::Gga(gga) => assert_eq!(gga.fix_quality, 0),
            _ => panic!("expected GGA"),
        }
    }

    #[test]
    fn unrecognized_sentence_is_other() {
        assert!(matches!(parse_sentence("$GPGSA,A,3,,,,,,*"), Some(Sentence::Other)));
    }

    #[test]
    fn non_nmea_line_is_none() {
        assert!(parse_sentence("not a sentence").is_none());
    }
}

//! HMI Writer: auto-detects the serial-attached panel, formats scalar
//! setters with the panel's framing bytes. Silently drops writes when no
//! panel is attached — the gateway must run headless.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn};

const BAUD_RATE: u32 = 115_200;
const TERMINATOR: [u8; 3] = [0xFF, 0xFF, 0xFF];
const PROBE_COMMAND: &[u8] = b"sendme";
const PROBE_REPLY_DEADLINE: Duration = Duration::from_millis(1_000);
/// First byte of a genuine panel reply; anything else (including an echo of
/// the probe itself) is rejected.
const PROBE_REPLY_MARKER: u8 = 0x66;

/// Scale and clamp used by [`HmiWriter::set_suggested_speed`] to pick a
/// background picture index.
fn suggested_speed_picture_index(suggested_speed_kmh: f64) -> i64 {
    let pic = suggested_speed_kmh as i64 - 4;
    if (1..=111).contains(&pic) {
        pic
    } else {
        0
    }
}

/// Speed gauge needle angle, degrees, normalized into [0, 360).
fn speed_gauge_angle(speed_kmh: f64) -> f64 {
    let angle = (speed_kmh / 120.0) * 270.0 - 45.0;
    angle.rem_euclid(360.0)
}

/// Candidate serial device paths matching a simple `prefix*` glob (the only
/// shape `--hmi-port-glob` needs: `/dev/ttyUSB*`).
fn candidate_ports(glob: &str) -> Vec<String> {
    let Some((dir, prefix)) = glob.rsplit_once('/') else {
        return Vec::new();
    };
    let prefix = prefix.trim_end_matches('*');
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut ports: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.starts_with(prefix))
        .map(|name| format!("{dir}/{name}"))
        .collect();
    ports.sort();
    ports
}

async fn probe_port(path: &str) -> Option<tokio_serial::SerialStream> {
    let mut port = tokio_serial::new(path, BAUD_RATE).open_native_async().ok()?;

    // Flush any stale bytes the panel sent before we started listening.
    let mut discard = [0u8; 256];
    let _ = tokio::time::timeout(Duration::from_millis(50), port.read(&mut discard)).await;

    let mut probe = PROBE_COMMAND.to_vec();
    probe.extend_from_slice(&TERMINATOR);
    port.write_all(&probe).await.ok()?;

    let mut reply = [0u8; 1];
    match tokio::time::timeout(PROBE_REPLY_DEADLINE, port.read_exact(&mut reply)).await {
        Ok(Ok(_)) if reply[0] == PROBE_REPLY_MARKER => Some(port),
        _ => None,
    }
}

/// Owns the HMI panel's serial port, if one was found. `None` means the
/// writer silently drops every subsequent write.
pub struct HmiWriter {
    port: Option<tokio_serial::SerialStream>,
}

impl HmiWriter {
    /// Try every candidate device matching `port_glob`, accepting the first
    /// one that answers the probe. Returns a writer with no port (not an
    /// error) if none do.
    pub async fn discover(port_glob: &str) -> Self {
        for path in candidate_ports(port_glob) {
            if let Some(port) = probe_port(&path).await {
                info!(port = %path, "HMI panel discovered");
                return Self { port: Some(port) };
            }
        }
        warn!(glob = %port_glob, "no HMI panel found, writes will be dropped");
        Self { port: None }
    }

    async fn send_command(&mut self, command: String) {
        let Some(port) = self.port.as_mut() else {
            return;
        };
        let mut frame = command.into_bytes();
        frame.extend_from_slice(&TERMINATOR);
        if let Err(e) = port.write_all(&frame).await {
            warn!(error = %e, "HMI write failed, dropping port");
            self.port = None;
        }
    }

    async fn set_int(&mut self, field: &str, value: i64) {
        self.send_command(format!("{field}.val={value}")).await;
    }

    pub async fn set_speed(&mut self, speed_kmh: f64) {
        self.set_int("speed_num", speed_kmh.round() as i64).await;
        let angle = speed_gauge_angle(speed_kmh);
        self.set_int("speedmeter", angle.round() as i64).await;
    }

    pub async fn set_suggested_speed(&mut self, suggested_speed_kmh: f64) {
        self.set_int("suggest_speed", suggested_speed_kmh.round() as i64).await;
        let pic = suggested_speed_picture_index(suggested_speed_kmh);
        self.send_command(format!("speedmeter_bg.pic={pic}")).await;
    }

    pub async fn set_grade(&mut self, grade_fraction: f64) {
        self.set_int("grade", (grade_fraction * 100.0 * 10.0).round() as i64).await;
    }

    pub async fn set_distance_km(&mut self, distance_km: f64) {
        self.set_int("distance", (distance_km * 10.0).round() as i64).await;
    }

    pub async fn set_follow_range_km(&mut self, follow_range_km: f64) {
        self.set_int("follow_range", (follow_range_km * 10.0).round() as i64).await;
    }

    pub async fn set_follow_rate(&mut self, follow_rate: f64) {
        self.set_int("follow_rate", (follow_rate * 100.0 * 10.0).round() as i64).await;
    }

    pub fn is_attached(&self) -> bool {
        self.port.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picture_index_tracks_suggested_speed_minus_four() {
        assert_eq!(suggested_speed_picture_index(10.0), 6);
        assert_eq!(suggested_speed_picture_index(5.0), 1);
    }

    #[test]
    fn picture_index_is_zero_out_of_range() {
        assert_eq!(suggested_speed_picture_index(3.0), 0);
        assert_eq!(suggested_speed_picture_index(200.0), 0);
    }

    #[test]
    fn gauge_angle_normalizes_into_0_360() {
        assert!((speed_gauge_angle(0.0) - 315.0).abs() < 1e-9);
        assert!((speed_gauge_angle(120.0) - 225.0).abs() < 1e-9);
    }

    #[test]
    fn candidate_ports_filters_by_prefix() {
        let dir = std::env::temp_dir().join(format!("hmi-port-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("ttyUSB0"), b"").unwrap();
        std::fs::write(dir.join("ttyS0"), b"").unwrap();

        let glob = format!("{}/ttyUSB*", dir.display());
        let ports = candidate_ports(&glob);
        assert_eq!(ports.len(), 1);
        assert!(ports[0].ends_with("ttyUSB0"));
    }

    #[tokio::test]
    async fn writer_with_no_port_silently_drops_writes() {
        let mut writer = HmiWriter { port: None };
        assert!(!writer.is_attached());
        writer.set_speed(60.0).await;
    }
}

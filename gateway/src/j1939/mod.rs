//! SAE J1939 protocol engine: CAN-up, address claim, PGN discovery, request
//! scheduling, decode, publish.

pub mod decoder;
pub mod pgn_db;
pub mod schedule;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use socketcan::{CanDataFrame, CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket};
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::error::GatewayError;
use crate::listener::{Listener, RawDataLogger};

use decoder::{decode, DecodeResult, DecodedValue};
use pgn_db::PgnDatabase;
use schedule::RequestSchedule;

/// PGN of the Request PGN message itself.
const REQUEST_PGN: u32 = 0x00EA00;
/// Our node's source address when issuing PGN requests. J1939 reserves
/// 0xF9 for "off-board diagnostic-service tool #1", the closest fit for a
/// gateway that only requests and never claims a functional ECU address.
const OUR_SOURCE_ADDRESS: u8 = 0xF9;
const DISCOVERY_PASSES: usize = 5;
const DISCOVERY_PASS_PAUSE: Duration = Duration::from_millis(500);
const CAN_SAMPLE_POINT: &str = "0.8";

/// Parameter names published to the bus; every other decoded SPN is
/// cached internally but not published.
const PUBLISH_ALLOW_LIST: &[&str] = &[
    "Vehicle_Speed",
    "Fuel_Level",
    "Fuel_Rate",
    "Fuel_Used",
    "Vehicle_Distance",
    "Distance",
    "Pitch",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    CanDown,
    Claiming,
    Normal,
}

/// Decode the 29-bit extended CAN identifier into (priority, PGN, PDU-specific
/// byte, source address), per the standard PDU1/PDU2 split on the PF byte.
fn parse_can_id(can_id: u32) -> (u8, u32, u8, u8) {
    let sa = (can_id & 0xFF) as u8;
    let ps = ((can_id >> 8) & 0xFF) as u8;
    let pf = ((can_id >> 16) & 0xFF) as u8;
    let dp = ((can_id >> 24) & 0x01) as u8;
    let priority = ((can_id >> 26) & 0x07) as u8;

    let pgn = if pf >= 240 {
        ((dp as u32) << 16) | ((pf as u32) << 8) | (ps as u32)
    } else {
        ((dp as u32) << 16) | ((pf as u32) << 8)
    };

    (priority, pgn, ps, sa)
}

fn build_can_id(priority: u8, pgn: u32, destination: u8, sa: u8) -> u32 {
    let dp = ((pgn >> 16) & 0x01) as u32;
    let pf = ((pgn >> 8) & 0xFF) as u32;
    let ps = if pf < 240 { destination as u32 } else { pgn & 0xFF };
    ((priority as u32) << 26) | (dp << 24) | (pf << 16) | (ps << 8) | (sa as u32)
}

struct CachedParam {
    value: f64,
    unit: String,
    last_seen: Instant,
}

pub struct J1939Listener {
    can_channel: String,
    bitrate: u32,
    db: PgnDatabase,
    socket: Option<CanSocket>,
    state: State,
    schedule: RequestSchedule,
    cache: HashMap<String, CachedParam>,
    raw_csv_path: std::path::PathBuf,
    raw_logger: RawDataLogger,
    bus: Bus,
}

impl J1939Listener {
    pub fn new(can_channel: impl Into<String>, bitrate: u32, db: PgnDatabase, data_dir: impl AsRef<std::path::Path>, bus: Bus) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            can_channel: can_channel.into(),
            bitrate,
            db,
            socket: None,
            state: State::CanDown,
            schedule: RequestSchedule::new(),
            cache: HashMap::new(),
            raw_csv_path: data_dir.join("j1939").join("j1939_raw.csv"),
            raw_logger: RawDataLogger::new(data_dir, "J1939"),
            bus,
        }
    }

    fn send_request(&self, pgn: u32) -> Result<(), GatewayError> {
        let socket = self.socket.as_ref().expect("socket set after setup");
        let mut data = [0u8; 8];
        data[0] = (pgn & 0xFF) as u8;
        data[1] = ((pgn >> 8) & 0xFF) as u8;
        data[2] = ((pgn >> 16) & 0xFF) as u8;

        let id = build_can_id(6, REQUEST_PGN, 0x00, OUR_SOURCE_ADDRESS);
        let frame = CanDataFrame::new(ExtendedId::new(id).expect("valid 29-bit id"), &data)
            .ok_or_else(|| GatewayError::Decode("request PGN frame too large".into()))?;
        socket
            .write_frame(&CanFrame::from(frame))
            .map_err(|e| GatewayError::CanUnavailable(self.can_channel.clone(), e.to_string()))?;
        Ok(())
    }

    async fn run_discovery(&mut self) {
        let known: Vec<u32> = self.db.known_pgns().collect();
        for pass in 0..DISCOVERY_PASSES {
            debug!(pass, "J1939 discovery pass");
            for pgn in &known {
                if let Err(e) = self.send_request(*pgn) {
                    warn!(pgn, error = %e, "discovery request failed");
                }
            }
            tokio::time::sleep(DISCOVERY_PASS_PAUSE).await;
        }
    }

    fn save_raw_frame(&self, timestamp: f64, pgn: u32, bytes: &[u8]) {
        let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
        self.append_raw_csv(timestamp, pgn, &hex);
    }

    fn append_raw_csv(&self, timestamp: f64, pgn: u32, hex: &str) {
        use std::io::Write;
        if let Some(parent) = self.raw_csv_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let is_new = !self.raw_csv_path.exists();
        let file = std::fs::OpenOptions::new().create(true).append(true).open(&self.raw_csv_path);
        match file {
            Ok(mut f) => {
                if is_new {
                    let _ = writeln!(f, "Timestamp,PGN,Data");
                }
                let _ = writeln!(f, "{timestamp},{pgn},{hex}");
            }
            Err(e) => warn!(error = %e, "failed to append J1939 raw CSV"),
        }
    }

    fn handle_frame(&mut self, pgn: u32, bytes: &[u8]) {
        if !self.db.contains(pgn) {
            return;
        }

        self.schedule.discover(pgn);

        let now_epoch = Utc::now().timestamp_millis() as f64 / 1000.0;
        self.save_raw_frame(now_epoch, pgn, bytes);

        let DecodeResult::Decoded(fields) = decode(&self.db, pgn, bytes) else {
            return;
        };

        for (name, value) in fields {
            let DecodedValue::Value { value, unit } = value else {
                continue;
            };
            self.cache.insert(
                name.clone(),
                CachedParam {
                    value,
                    unit: unit.clone(),
                    last_seen: Instant::now(),
                },
            );

            if PUBLISH_ALLOW_LIST.iter().any(|allowed| name.contains(allowed)) {
                let topic = format!("j1939/{name}");
                self.bus.publish(
                    &topic,
                    serde_json::json!({
                        "value": value,
                        "unit": unit,
                        "topic": topic,
                        "timestamp": now_epoch,
                    }),
                );
            }
        }
    }
}

#[async_trait]
impl Listener for J1939Listener {
    fn name(&self) -> &str {
        "J1939"
    }

    async fn setup(&mut self) -> Result<(), GatewayError> {
        crate::can::bring_up(&self.can_channel, self.bitrate, Some(CAN_SAMPLE_POINT)).await?;
        let socket = CanSocket::open(&self.can_channel)
            .map_err(|e| GatewayError::CanUnavailable(self.can_channel.clone(), e.to_string()))?;
        socket
            .set_read_timeout(Duration::from_millis(100))
            .map_err(|e| GatewayError::CanUnavailable(self.can_channel.clone(), e.to_string()))?;
        self.socket = Some(socket);
        self.state = State::CanDown;

        // Address claim is a formality for a request-only node on this bus;
        // we never contend for a functional ECU address, so claim succeeds
        // unconditionally once the socket is up.
        self.state = State::Claiming;
        info!(channel = %self.can_channel, "J1939 address claim (request-only node)");
        self.state = State::Normal;

        self.run_discovery().await;
        info!(known_pgns = self.db.known_pgns().count(), "J1939 discovery complete");
        Ok(())
    }

    async fn tick(&mut self) -> Result<(), GatewayError> {
        if self.state != State::Normal {
            return Ok(());
        }

        let socket = self.socket.as_ref().expect("socket set after setup");
        match socket.read_frame() {
            Ok(frame) => {
                if let Some(id) = frame.id().as_extended() {
                    let (_priority, pgn, _ps, _sa) = parse_can_id(id.as_raw());
                    self.handle_frame(pgn, frame.data());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                warn!(error = %e, "J1939 CAN read error");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        let now = Instant::now();
        for pgn in self.schedule.due(now) {
            if let Err(e) = self.send_request(pgn) {
                warn!(pgn, error = %e, "J1939 request failed");
            }
            self.schedule.mark_requested(pgn, now);
        }

        Ok(())
    }

    async fn close(&mut self) {
        self.state = State::CanDown;
        self.socket = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_can_id_decodes_pdu2_broadcast() {
        // CCVS1 broadcast from SA 0x00: priority 3, PGN 65265.
        let can_id = (3u32 << 26) | (0 << 24) | (0xFEu32 << 16) | (0xF1 << 8) | 0x00;
        let (priority, pgn, _ps, sa) = parse_can_id(can_id);
        assert_eq!(priority, 3);
        assert_eq!(pgn, 65265);
        assert_eq!(sa, 0x00);
    }

    #[test]
    fn parse_can_id_decodes_pdu1_request() {
        let can_id = build_can_id(6, REQUEST_PGN, 0x00, OUR_SOURCE_ADDRESS);
        let (priority, pgn, ps, sa) = parse_can_id(can_id);
        assert_eq!(priority, 6);
        assert_eq!(pgn, REQUEST_PGN);
        assert_eq!(ps, 0x00);
        assert_eq!(sa, OUR_SOURCE_ADDRESS);
    }

    #[tokio::test]
    async fn handle_frame_caches_and_publishes_allow_listed_params() {
        let bus = Bus::new();
        let mut rx = bus.subscribe("j1939/Wheel-Based_Vehicle_Speed");
        let mut listener = J1939Listener::new(
            "vcan0",
            250_000,
            PgnDatabase::builtin(),
            std::env::temp_dir().join("telemetry-gateway-j1939-test"),
            bus,
        );

        listener.handle_frame(65265, &[0u8, 0x3C, 0, 0, 0, 0, 0, 0]);

        assert!(listener.cache.contains_key("Wheel-Based_Vehicle_Speed"));
        let msg = rx.try_recv().expect("publish expected");
        assert_eq!(msg.payload["value"], 60.0);
    }

    #[tokio::test]
    async fn handle_frame_ignores_unknown_pgn() {
        let bus = Bus::new();
        let mut listener = J1939Listener::new(
            "vcan0",
            250_000,
            PgnDatabase::builtin(),
            std::env::temp_dir().join("telemetry-gateway-j1939-test-unknown"),
            bus,
        );
        listener.handle_frame(999999, &[0u8; 8]);
        assert!(listener.cache.is_empty());
    }
}

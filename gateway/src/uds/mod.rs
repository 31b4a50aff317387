//! UDS diagnostic session over ISO-TP: tester-present keep-alive,
//! periodic ReadDataByIdentifier, per-DID decode, publish.

pub mod codecs;
pub mod isotp;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use crate::bus::Bus;
use crate::error::GatewayError;
use crate::listener::Listener;

use isotp::IsoTpSocket;

pub(crate) const TX_ID: u32 = 0x18DA00F1;
pub(crate) const RX_ID: u32 = 0x18DAF100;
const TESTER_PRESENT: &[u8] = &[0x3E, 0x00];
const SID_READ_DATA_BY_IDENTIFIER: u8 = 0x22;
const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// Target 5 Hz tick rate.
const TICK_INTERVAL: Duration = Duration::from_millis(200);

const MONITORED_DIDS: &[u16] = &[codecs::DID_ENGINE, codecs::DID_FUEL_RATE, codecs::DID_FUEL_LEVEL];

pub struct UdsListener {
    can_channel: String,
    bitrate: u32,
    socket: Option<IsoTpSocket>,
    csv_path: std::path::PathBuf,
    bus: Bus,
}

impl UdsListener {
    pub fn new(can_channel: impl Into<String>, bitrate: u32, data_dir: impl AsRef<std::path::Path>, bus: Bus) -> Self {
        Self {
            can_channel: can_channel.into(),
            bitrate,
            socket: None,
            csv_path: data_dir.as_ref().join("uds").join("uds_raw.csv"),
            bus,
        }
    }

    fn send_tester_present(&self) -> Result<(), GatewayError> {
        let socket = self.socket.as_ref().expect("socket set after setup");
        socket.send_single_frame(TESTER_PRESENT)
    }

    fn read_data_by_identifier(&self, did: u16) -> Result<BTreeMap<String, f64>, GatewayError> {
        let socket = self.socket.as_ref().expect("socket set after setup");
        let request = [SID_READ_DATA_BY_IDENTIFIER, (did >> 8) as u8, (did & 0xFF) as u8];
        socket.send_single_frame(&request)?;

        let response = socket.receive_message()?;
        if response.first() == Some(&NEGATIVE_RESPONSE_SID) {
            return Err(GatewayError::ProtocolNegative(format!(
                "UDS NRC for DID {did:#06x}: {:02x?}",
                response
            )));
        }
        // Positive response: [SID+0x40, DID-hi, DID-lo, payload...]
        if response.len() < 3 {
            return Err(GatewayError::Decode("UDS response shorter than header".into()));
        }
        codecs::decode_did(did, &response[3..])
    }

    fn append_csv_row(&self, timestamp: f64, fields: &BTreeMap<String, f64>) {
        use std::io::Write;
        if let Some(parent) = self.csv_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let is_new = !self.csv_path.exists();
        match std::fs::OpenOptions::new().create(true).append(true).open(&self.csv_path) {
            Ok(mut f) => {
                if is_new {
                    let mut header = vec!["Timestamp".to_string()];
                    header.extend(fields.keys().cloned());
                    let _ = writeln!(f, "{}", header.join(","));
                }
                let mut row = vec![timestamp.to_string()];
                row.extend(fields.values().map(|v| v.to_string()));
                let _ = writeln!(f, "{}", row.join(","));
            }
            Err(e) => warn!(error = %e, "failed to append UDS raw CSV"),
        }
    }
}

#[async_trait]
impl Listener for UdsListener {
    fn name(&self) -> &str {
        "UDS"
    }

    async fn setup(&mut self) -> Result<(), GatewayError> {
        crate::can::bring_up(&self.can_channel, self.bitrate, None).await?;
        // Default diagnostic session is acceptable; no session-change
        // request is sent.
        self.socket = Some(IsoTpSocket::open(&self.can_channel, TX_ID, RX_ID)?);
        Ok(())
    }

    async fn tick(&mut self) -> Result<(), GatewayError> {
        if let Err(e) = self.send_tester_present() {
            warn!(error = %e, "UDS tester-present failed");
        }

        let mut merged = BTreeMap::new();
        for &did in MONITORED_DIDS {
            match self.read_data_by_identifier(did) {
                Ok(fields) => merged.extend(fields),
                Err(GatewayError::ProtocolNegative(msg)) => {
                    warn!(did = did, msg = %msg, "UDS negative response, skipping DID this tick");
                }
                Err(e) => {
                    warn!(did = did, error = %e, "UDS read timed out or failed, continuing");
                }
            }
        }

        let timestamp = Utc::now().timestamp_millis() as f64 / 1000.0;
        if !merged.is_empty() {
            self.append_csv_row(timestamp, &merged);
        }

        if let Some(&speed) = merged.get("speed") {
            self.bus.publish(
                "uds/speed",
                serde_json::json!({ "timestamp": timestamp, "value": speed }),
            );
        }

        tokio::time::sleep(TICK_INTERVAL).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_response_sid_is_0x7f() {
        assert_eq!(NEGATIVE_RESPONSE_SID, 0x7F);
    }

    #[test]
    fn monitored_dids_match_registry() {
        assert_eq!(MONITORED_DIDS, &[0x0102, 0x013F, 0x0173]);
    }
}

//! OBD2 listener: a thin variant of the UDS engine that polls the generic
//! OBD-II PID set over the same ISO-TP transport instead of
//! manufacturer-specific DIDs, so `--obd-mode OBD2` is a real, working
//! selection.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use crate::bus::Bus;
use crate::error::GatewayError;
use crate::listener::Listener;
use crate::uds::isotp::IsoTpSocket;
use crate::uds::{RX_ID, TX_ID};

/// Mode 1 "show current data" service id.
const SID_SHOW_CURRENT_DATA: u8 = 0x01;
/// PID 0x0D — vehicle speed, km/h, one byte, no scaling.
const PID_VEHICLE_SPEED: u8 = 0x0D;
/// PID 0x31 — distance traveled since codes cleared, km, two bytes big-endian.
const PID_DISTANCE_SINCE_DTC_CLEAR: u8 = 0x31;

const TICK_INTERVAL: Duration = Duration::from_millis(200);

pub struct Obd2Listener {
    can_channel: String,
    bitrate: u32,
    socket: Option<IsoTpSocket>,
    bus: Bus,
}

impl Obd2Listener {
    pub fn new(can_channel: impl Into<String>, bitrate: u32, bus: Bus) -> Self {
        Self {
            can_channel: can_channel.into(),
            bitrate,
            socket: None,
            bus,
        }
    }

    fn read_pid(&self, pid: u8) -> Result<Vec<u8>, GatewayError> {
        let socket = self.socket.as_ref().expect("socket set after setup");
        socket.send_single_frame(&[SID_SHOW_CURRENT_DATA, pid])?;
        let response = socket.receive_message()?;
        // Positive response: [SID+0x40, PID, data...]
        if response.len() < 3 || response[0] != SID_SHOW_CURRENT_DATA + 0x40 || response[1] != pid {
            return Err(GatewayError::ProtocolNegative(format!(
                "unexpected OBD2 response for PID {pid:#04x}: {response:02x?}"
            )));
        }
        Ok(response[2..].to_vec())
    }
}

#[async_trait]
impl Listener for Obd2Listener {
    fn name(&self) -> &str {
        "OBD2"
    }

    async fn setup(&mut self) -> Result<(), GatewayError> {
        crate::can::bring_up(&self.can_channel, self.bitrate, None).await?;
        self.socket = Some(IsoTpSocket::open(&self.can_channel, TX_ID, RX_ID)?);
        Ok(())
    }

    async fn tick(&mut self) -> Result<(), GatewayError> {
        let timestamp = Utc::now().timestamp_millis() as f64 / 1000.0;

        match self.read_pid(PID_VEHICLE_SPEED) {
            Ok(data) if !data.is_empty() => {
                self.bus.publish(
                    "obd2/speed",
                    serde_json::json!({ "timestamp": timestamp, "value": data[0] as f64 }),
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "OBD2 vehicle speed PID failed"),
        }

        match self.read_pid(PID_DISTANCE_SINCE_DTC_CLEAR) {
            Ok(data) if data.len() >= 2 => {
                let km = u16::from_be_bytes([data[0], data[1]]) as f64;
                self.bus.publish(
                    "obd2/distance_since_dtc_clear",
                    serde_json::json!({ "timestamp": timestamp, "value": km }),
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "OBD2 distance-since-DTC-clear PID failed"),
        }

        tokio::time::sleep(TICK_INTERVAL).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_constants_match_generic_obd2_registry() {
        assert_eq!(PID_VEHICLE_SPEED, 0x0D);
        assert_eq!(PID_DISTANCE_SINCE_DTC_CLEAR, 0x31);
    }
}

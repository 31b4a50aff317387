//! IMU listener: pitch/roll from a 6-axis accelerometer/gyro sample arriving
//! on the bus, rate-limited raw logging.
//!
//! Unlike the other listeners, the IMU has no hardware of its own to open —
//! `acc/gyro_acc_xyz` is produced by the host platform — so `setup` only
//! subscribes and `tick` drains the bus.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use telemetry_types::AccGyroPayload;
use tokio::sync::broadcast;
use tracing::debug;

use crate::bus::Bus;
use crate::error::GatewayError;
use crate::listener::{Listener, RawDataLogger};

const TOPIC: &str = "acc/gyro_acc_xyz";
/// Minimum gap between raw-sample log lines.
const LOG_MIN_GAP: Duration = Duration::from_millis(300);

/// Pitch/roll in degrees, computed from one accelerometer sample.
pub fn pitch_roll_degrees(ax: f64, ay: f64, az: f64) -> (f64, f64) {
    let pitch = (-ax).atan2((ay * ay + az * az).sqrt()).to_degrees();
    let roll = ay.atan2(az).to_degrees();
    (pitch, roll)
}

pub struct ImuListener {
    bus: Bus,
    rx: Option<broadcast::Receiver<telemetry_types::BusMessage>>,
    raw_logger: RawDataLogger,
    last_logged: Option<Instant>,
}

impl ImuListener {
    pub fn new(data_dir: impl AsRef<Path>, bus: Bus) -> Self {
        Self {
            bus,
            rx: None,
            raw_logger: RawDataLogger::new(data_dir, "IMU"),
            last_logged: None,
        }
    }

    fn should_log(&mut self) -> bool {
        let now = Instant::now();
        let due = match self.last_logged {
            Some(last) => now.duration_since(last) >= LOG_MIN_GAP,
            None => true,
        };
        if due {
            self.last_logged = Some(now);
        }
        due
    }
}

#[async_trait]
impl Listener for ImuListener {
    fn name(&self) -> &str {
        "IMU"
    }

    async fn setup(&mut self) -> Result<(), GatewayError> {
        self.rx = Some(self.bus.subscribe(TOPIC));
        Ok(())
    }

    async fn tick(&mut self) -> Result<(), GatewayError> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(());
        };

        match rx.recv().await {
            Ok(msg) => {
                let sample: AccGyroPayload = match serde_json::from_value(msg.payload) {
                    Ok(s) => s,
                    Err(e) => {
                        debug!(error = %e, "malformed acc/gyro_acc_xyz sample, skipping");
                        return Ok(());
                    }
                };
                let (pitch, roll) = pitch_roll_degrees(sample.acc.x, sample.acc.y, sample.acc.z);
                debug!(pitch, roll, "IMU sample");

                if self.should_log() {
                    self.raw_logger
                        .append(&format!(
                            "{},{},{},{},{},{},{}",
                            sample.stamp, sample.acc.x, sample.acc.y, sample.acc.z, sample.gyro.x, sample.gyro.y, sample.gyro.z
                        ))
                        .await;
                }
                Ok(())
            }
            Err(broadcast::error::RecvError::Lagged(_)) => Ok(()),
            Err(broadcast::error::RecvError::Closed) => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_orientation_is_zero_pitch_and_roll() {
        let (pitch, roll) = pitch_roll_degrees(0.0, 0.0, 1.0);
        assert!(pitch.abs() < 1e-9);
        assert!(roll.abs() < 1e-9);
    }

    #[test]
    fn nose_down_is_positive_pitch() {
        // ax negative (decelerating along +x when nose-down convention);
        // pitch = atan2(-ax, ...) should be positive for ax < 0.
        let (pitch, _roll) = pitch_roll_degrees(-1.0, 0.0, 1.0);
        assert!(pitch > 0.0);
    }

    #[tokio::test]
    async fn tick_logs_throttled_samples() {
        let bus = Bus::new();
        let mut listener = ImuListener::new(std::env::temp_dir().join("telemetry-gateway-imu-test"), bus.clone());
        listener.setup().await.unwrap();

        bus.publish(
            TOPIC,
            serde_json::json!({
                "acc": {"x": 0.0, "y": 0.0, "z": 1.0},
                "gyro": {"x": 0.0, "y": 0.0, "z": 0.0},
                "_stamp": 1.0
            }),
        );
        listener.tick().await.unwrap();
        assert!(listener.last_logged.is_some());
    }
}

//! Shared SocketCAN interface bring-up. Per spec.md §5 at most one of
//! J1939/UDS/OBD2 is enabled per run, so whichever listener is active owns
//! the interface and brings it up itself.

use tracing::warn;

use crate::error::GatewayError;

/// Cycle `channel` down then back up at `bitrate`. `sample_point`, when
/// given, is pinned via `ip link ... sample-point <value>` (J1939 always
/// does this at 0.8; UDS/OBD2 leave the driver's default in place).
pub async fn bring_up(channel: &str, bitrate: u32, sample_point: Option<&str>) -> Result<(), GatewayError> {
    let down = tokio::process::Command::new("sudo")
        .args(["ip", "link", "set", channel, "down"])
        .status()
        .await;
    if let Err(e) = down {
        warn!(channel, error = %e, "ip link down failed, continuing");
    }

    let bitrate_str = bitrate.to_string();
    let mut args = vec!["ip", "link", "set", channel, "up", "type", "can", "bitrate", &bitrate_str];
    if let Some(sp) = sample_point {
        args.push("sample-point");
        args.push(sp);
    }

    let up = tokio::process::Command::new("sudo")
        .args(&args)
        .status()
        .await
        .map_err(|e| GatewayError::CanUnavailable(channel.to_string(), e.to_string()))?;

    if !up.success() {
        return Err(GatewayError::CanUnavailable(channel.to_string(), format!("ip link up exited with {up}")));
    }
    Ok(())
}

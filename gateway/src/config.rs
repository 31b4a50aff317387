use clap::{Parser, ValueEnum};

/// Which on-vehicle diagnostic transport feeds the speed/fuel/distance
/// topics the fusion controller arbitrates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ObdMode {
    J1939,
    Obd2,
    Uds,
}

/// Command-line configuration. `--obd-mode` and `--virtual-sim-mode` pick
/// the operating mode; the rest are ambient deployment knobs (CAN
/// channel/bitrate, serial ports, data directory) exposed as flags rather
/// than baked in.
#[derive(Debug, Clone, Parser)]
#[command(name = "telemetry-gateway", about = "On-vehicle telemetry fusion gateway")]
pub struct Config {
    /// OBD transport to use for speed/fuel/engine telemetry.
    #[arg(long, value_enum, default_value_t = ObdMode::Uds)]
    pub obd_mode: ObdMode,

    /// Walk the loaded speed plan and synthesize position/distance instead
    /// of reading GNSS/track-pos topics.
    #[arg(long, default_value_t = false)]
    pub virtual_sim_mode: bool,

    /// SocketCAN interface name shared by the J1939 and UDS engines.
    #[arg(long, default_value = "can0")]
    pub can_channel: String,

    /// CAN bitrate in bit/s, used when bringing the interface up for J1939.
    #[arg(long, default_value_t = 250_000)]
    pub can_bitrate_j1939: u32,

    /// CAN bitrate in bit/s, used when bringing the interface up for
    /// UDS/OBD2 ISO-TP sessions.
    #[arg(long, default_value_t = 500_000)]
    pub can_bitrate_uds: u32,

    /// Path to a PGN parameter database CSV. Falls back to the built-in
    /// default table when absent.
    #[arg(long)]
    pub pgn_database: Option<String>,

    /// Serial device for the Bluetooth GNSS receiver.
    #[arg(long, default_value = "/dev/rfcomm0")]
    pub gnss_port: String,

    /// Bluetooth MAC address to `rfcomm bind` when `gnss_port` is missing.
    #[arg(long)]
    pub gnss_bind_mac: Option<String>,

    /// Base directory for raw-capture logs and the speed-plan catalog.
    #[arg(long, default_value = "data")]
    pub data_dir: String,

    /// Glob of candidate serial devices to probe for the HMI panel.
    #[arg(long, default_value = "/dev/ttyUSB*")]
    pub hmi_port_glob: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            obd_mode: ObdMode::Uds,
            virtual_sim_mode: false,
            can_channel: "can0".to_string(),
            can_bitrate_j1939: 250_000,
            can_bitrate_uds: 500_000,
            pgn_database: None,
            gnss_port: "/dev/rfcomm0".to_string(),
            gnss_bind_mac: None,
            data_dir: "data".to_string(),
            hmi_port_glob: "/dev/ttyUSB*".to_string(),
        }
    }
}

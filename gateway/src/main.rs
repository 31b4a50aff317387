//! On-vehicle telematics gateway: fuses J1939/UDS/OBD2/GNSS/IMU telemetry
//! with a precomputed speed plan and drives an HMI panel.

mod bus;
mod can;
mod config;
mod error;
mod fusion;
mod geo;
mod gnss;
mod hmi;
mod imu;
mod j1939;
mod listener;
mod obd2;
mod route;
mod simulator;
mod uds;

use clap::Parser;
use tracing::{info, warn};

use bus::Bus;
use config::{Config, ObdMode};
use fusion::FusionController;
use gnss::GnssListener;
use hmi::HmiWriter;
use imu::ImuListener;
use j1939::pgn_db::PgnDatabase;
use j1939::J1939Listener;
use listener::ListenerHandle;
use obd2::Obd2Listener;
use route::RouteCatalog;
use uds::UdsListener;

/// Sub-directory of `--data-dir` holding `*.json` speed-plan documents.
const ROUTES_SUBDIR: &str = "routes";
/// Tick rate for the virtual-sim-mode plan walker.
const SIMULATOR_TICK: std::time::Duration = std::time::Duration::from_millis(200);

fn load_pgn_database(config: &Config) -> PgnDatabase {
    match &config.pgn_database {
        Some(path) => match PgnDatabase::load_csv(path) {
            Ok(db) => db,
            Err(e) => {
                warn!(path, error = %e, "failed to load PGN database CSV, falling back to built-in table");
                PgnDatabase::builtin()
            }
        },
        None => PgnDatabase::builtin(),
    }
}

fn spawn_simulator(bus: Bus, catalog: &RouteCatalog) -> Option<tokio::task::JoinHandle<()>> {
    let route = catalog.first()?;
    let mut sim = simulator::Simulator::new(route.points().to_vec(), bus);
    Some(tokio::spawn(async move {
        loop {
            if !sim.step() {
                info!("simulator exhausted the loaded speed plan");
                break;
            }
            tokio::time::sleep(SIMULATOR_TICK).await;
        }
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "telemetry_gateway=info".into()),
        )
        .init();

    info!(obd_mode = ?config.obd_mode, virtual_sim_mode = config.virtual_sim_mode, "telemetry gateway starting");

    let bus = Bus::new();

    let routes_dir = std::path::Path::new(&config.data_dir).join(ROUTES_SUBDIR);
    let route_catalog = match RouteCatalog::load_dir(&routes_dir) {
        Ok(catalog) => catalog,
        Err(e) => {
            warn!(dir = %routes_dir.display(), error = %e, "failed to load route catalog, matcher will stay unselected");
            RouteCatalog::load_dir(&config.data_dir).unwrap_or_else(|_| RouteCatalog::load_dir(".").expect("cwd always readable"))
        }
    };
    if route_catalog.is_empty() {
        warn!("no speed-plan routes loaded; suggested speed/grade will never be published");
    }

    let mut handles: Vec<ListenerHandle> = Vec::new();
    let mut background_tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    if config.virtual_sim_mode {
        match spawn_simulator(bus.clone(), &route_catalog) {
            Some(handle) => {
                info!("virtual simulation mode active");
                background_tasks.push(handle);
            }
            None => warn!("virtual-sim-mode requested but no route is loaded to walk"),
        }
    } else {
        match config.obd_mode {
            ObdMode::J1939 => {
                let db = load_pgn_database(&config);
                let listener = J1939Listener::new(config.can_channel.clone(), config.can_bitrate_j1939, db, &config.data_dir, bus.clone());
                handles.push(ListenerHandle::spawn(Box::new(listener)).await);
            }
            ObdMode::Uds => {
                let listener = UdsListener::new(config.can_channel.clone(), config.can_bitrate_uds, &config.data_dir, bus.clone());
                handles.push(ListenerHandle::spawn(Box::new(listener)).await);
            }
            ObdMode::Obd2 => {
                let listener = Obd2Listener::new(config.can_channel.clone(), config.can_bitrate_uds, bus.clone());
                handles.push(ListenerHandle::spawn(Box::new(listener)).await);
            }
        }

        let gnss = GnssListener::new(config.gnss_port.clone(), config.gnss_bind_mac.clone(), &config.data_dir, bus.clone());
        handles.push(ListenerHandle::spawn(Box::new(gnss)).await);

        let imu = ImuListener::new(&config.data_dir, bus.clone());
        handles.push(ListenerHandle::spawn(Box::new(imu)).await);
    }

    let hmi = HmiWriter::discover(&config.hmi_port_glob).await;
    let controller = FusionController::new(bus.clone(), route_catalog, hmi, config.virtual_sim_mode);
    background_tasks.extend(controller.spawn());

    info!(
        enabled_listeners = handles.iter().filter(|h| h.is_enabled()).count(),
        total_listeners = handles.len(),
        "gateway running"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    for mut handle in handles {
        handle.close().await;
    }
    for h in background_tasks {
        h.abort();
    }

    Ok(())
}

//! # Trackteur
//!
//! Host runner for the cellular GPS tracker core.
//!
//! Drives a SIMCom-family modem attached to a serial port, keeps reports in
//! a sector log file and delivers them to an OsmAnd-compatible server.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use trackteur::board::{SoftWatchdog, SystemClock, UnwiredPowerKey};
use trackteur::config::{BeaconConfig, Config, LoggingConfig, StorageConfig};
use trackteur::modem::network::NetworkManager;
use trackteur::modem::Modem;
use trackteur::serial::ModemSerial;
use trackteur::storage::{FileBlockDevice, PersistentLog};
use trackteur::telemetry::NetFailCounter;
use trackteur::{Fix, Tracker};

/// Configuration file used when none is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Period of the software watchdog (matches the board's hardware one)
const WATCHDOG_PERIOD: Duration = Duration::from_secs(8);

/// Granularity of the stop-flag check between ticks
const STOP_CHECK_MS: u64 = 100;

/// Main entry point for Trackteur
///
/// Loads the configuration, then runs the blocking tracker loop on a
/// dedicated thread until Ctrl+C.
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load and validate the TOML configuration
///    - Set up logging (stdout, plus a daily log file when configured)
///    - Open the modem serial port and the log storage
///    - Power the modem on and identify the model
///
/// 2. **Main Loop** (every `poll_interval_ms`)
///    - Service the network state machine
///    - Append the beacon position, if configured
///    - Retry the oldest pending report while online
///
/// 3. **Graceful Shutdown**
///    - Ctrl+C raises the stop flag; the loop exits after the current tick
///    - The GNSS engine is powered down before the thread returns
///
/// # Errors
///
/// Returns error if the configuration is invalid or no serial port can be
/// opened. Network and storage failures are handled inside the loop.
///
/// # Examples
///
/// ```bash
/// RUST_LOG=trackteur=debug cargo run --release -- config/default.toml
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let _log_guard = init_logging(&config.logging);

    info!("Trackteur v{} starting...", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from {}", config_path);

    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = Arc::clone(&stop);
    let mut worker = tokio::task::spawn_blocking(move || run(config, worker_stop));

    info!("Press Ctrl+C to exit");
    tokio::select! {
        joined = &mut worker => {
            return joined.context("Tracker loop panicked")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down after the current tick...");
            stop.store(true, Ordering::Relaxed);
        }
    }

    worker.await.context("Tracker loop panicked")??;
    info!("Shutdown complete");
    Ok(())
}

/// Install the tracing subscriber; the returned guard flushes the log file
fn init_logging(logging: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    match &logging.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "trackteur.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

/// Blocking tracker loop
fn run(config: Config, stop: Arc<AtomicBool>) -> Result<()> {
    let serial = ModemSerial::open_with_paths(&[config.serial.port.as_str()], config.serial.baud_rate)
        .context("Failed to open modem serial port")?;
    info!("Modem serial port opened at: {}", serial.device_path());

    let watchdog = SoftWatchdog::new(WATCHDOG_PERIOD);
    let modem = Modem::new(serial, SystemClock::new(), watchdog.clone(), UnwiredPowerKey)
        .with_filter(config.modem.response_filter);
    let network = NetworkManager::new(config.radio_profile(), config.network.reconnect_interval_ms);
    let mut tracker = Tracker::new(
        modem,
        network,
        open_log(&config.storage, watchdog),
        config.endpoint(),
        NetFailCounter::new(config.network.net_fail_threshold),
    )
    .with_gnss(config.modem.gnss);

    tracker.start();

    let poll_ms = config.network.poll_interval_ms;
    while !stop.load(Ordering::Relaxed) {
        let fix = config.beacon.as_ref().and_then(beacon_fix);
        let report = tracker.tick(fix.as_ref());
        debug!("Tick: {:?}, {:?}", report, tracker.log());

        let mut waited = 0;
        while waited < poll_ms && !stop.load(Ordering::Relaxed) {
            tracker.idle(STOP_CHECK_MS);
            waited += STOP_CHECK_MS;
        }
    }

    tracker.shutdown();
    Ok(())
}

fn open_log(
    storage: &StorageConfig,
    watchdog: SoftWatchdog,
) -> PersistentLog<FileBlockDevice, SoftWatchdog> {
    if !storage.enabled {
        info!("Report log disabled");
        return PersistentLog::unavailable(watchdog, storage.max_sectors);
    }
    match FileBlockDevice::open(&storage.path) {
        Ok(device) => PersistentLog::recover(device, watchdog, storage.max_sectors),
        Err(e) => {
            warn!("Report log unavailable ({}): {}", storage.path, e);
            PersistentLog::unavailable(watchdog, storage.max_sectors)
        }
    }
}

fn beacon_fix(beacon: &BeaconConfig) -> Option<Fix> {
    match Fix::at(beacon.latitude, beacon.longitude, chrono::Utc::now()) {
        Ok(fix) => Some(fix),
        Err(e) => {
            warn!("Beacon position rejected: {}", e);
            None
        }
    }
}

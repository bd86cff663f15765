//! LipoDoc Simulator - Headless fleet of simulated lipemic analyzers
//!
//! This service registers a set of simulated LipoDoc devices, connects them
//! to a device server, and keeps them reporting status and donation results
//! until interrupted.
//!
//! ## Features
//!
//! - One async status loop per connected device
//! - Offline storage of donation records with delivery on recovery
//! - Optional periodic donation creation across the fleet
//! - Graceful shutdown on Ctrl+C
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `LIPODOC_SERVER_ADDRESS`: Server host or IP (default: 192.168.1.124)
//! - `LIPODOC_SERVER_PORT`: Server port (default: 5000)
//! - `LIPODOC_CONNECT_TIMEOUT_SECS`: TCP connect timeout (default: 10)
//! - `LIPODOC_ACK_TIMEOUT_SECS`: Donation acknowledgment timeout (default: 5)
//! - `LIPODOC_DEVICES`: Comma-separated serial numbers (default: LD0000001)
//! - `LIPODOC_AUTO_CONNECT`: Connect devices at startup (default: true)
//! - `LIPODOC_DONATION_INTERVAL_SECS`: Seconds between generated donations,
//!   0 disables (default: 0)
//! - `LIPODOC_SEED`: Seed for reproducible device data (default: unset)
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use lipodoc_sim::config::Config;
use lipodoc_sim::device::{DeviceEvent, DonationOutcome};
use lipodoc_sim::fleet::Fleet;

/// Interval between fleet summary reports
const SUMMARY_INTERVAL_SECS: u64 = 30;

/// Time allowed for devices to stop during shutdown
const SHUTDOWN_TIMEOUT_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber with environment filter
    init_tracing();

    info!("Starting LipoDoc simulator...");

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                server = %config.server,
                devices = config.serials.len(),
                auto_connect = config.auto_connect,
                donation_interval_secs = config.donation_interval.map(|d| d.as_secs()),
                seeded = config.seed.is_some(),
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    // Register configured devices
    let fleet = match Fleet::from_config(&config) {
        Ok(fleet) => Arc::new(fleet),
        Err(e) => {
            error!(error = %e, "Failed to register devices");
            std::process::exit(1);
        }
    };

    // Spawn event logger before connecting so no lifecycle event is missed
    let events = fleet.subscribe();
    let event_handle = tokio::spawn(async move {
        run_event_logger(events).await;
    });

    if config.auto_connect {
        let report = fleet.connect_all().await;
        for (serial, e) in &report.failures {
            warn!(serial = %serial, error = %e, "Device did not connect");
        }
    } else {
        info!("Auto-connect disabled, devices stay disconnected");
    }

    // Spawn donation generator if enabled
    let generator_handle = config.donation_interval.map(|period| {
        let fleet = fleet.clone();
        tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "Donation generator started");
            run_donation_generator(fleet, period).await;
        })
    });

    // Spawn periodic summary reporter
    let summary_fleet = fleet.clone();
    let summary_handle = tokio::spawn(async move {
        run_summary_reporter(summary_fleet).await;
    });

    // Wait for shutdown signal
    info!("LipoDoc simulator running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping...");
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    }

    // Graceful shutdown
    info!("Initiating graceful shutdown...");

    if let Some(handle) = generator_handle {
        handle.abort();
    }
    summary_handle.abort();

    let shutdown_timeout = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
    match tokio::time::timeout(shutdown_timeout, fleet.disconnect_all()).await {
        Ok(report) => {
            info!(devices = report.attempted, "All devices disconnected");
        }
        Err(_) => {
            warn!("Device shutdown timed out after {:?}", shutdown_timeout);
        }
    }

    event_handle.abort();
    info!("LipoDoc simulator stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Log device events as JSON at debug level until the channel closes.
async fn run_event_logger(mut events: broadcast::Receiver<DeviceEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => debug!(target: "lipodoc_sim::events", "{}", json),
                Err(e) => warn!(error = %e, "Failed to serialize device event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event logger fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Create one donation per interval, cycling through the devices.
///
/// Each donation uses a random layout and is sent right away when the device
/// is connected, otherwise it is stored for later delivery.
async fn run_donation_generator(fleet: Arc<Fleet>, period: Duration) {
    let mut ticker = interval(period);
    // First tick completes immediately
    ticker.tick().await;

    let mut next: usize = 0;
    let mut delivered: u64 = 0;
    let mut stored: u64 = 0;

    loop {
        ticker.tick().await;

        let devices = fleet.devices();
        if devices.is_empty() {
            continue;
        }
        let device = &devices[next % devices.len()];
        next = next.wrapping_add(1);

        match device.create_donation_data(None, true).await {
            Ok(outcome) => {
                debug!(
                    serial = %device.serial(),
                    layout = outcome.variant().name(),
                    delivered = outcome.is_delivered(),
                    "Donation created"
                );
                match outcome {
                    DonationOutcome::Delivered { .. } => delivered += 1,
                    DonationOutcome::Stored { .. } => stored += 1,
                }
            }
            Err(e) => {
                error!(serial = %device.serial(), error = %e, "Failed to create donation");
            }
        }

        debug!(delivered, stored, "Donation generator progress");
    }
}

/// Periodically log the state of every device.
async fn run_summary_reporter(fleet: Arc<Fleet>) {
    let mut ticker = interval(Duration::from_secs(SUMMARY_INTERVAL_SECS));
    ticker.tick().await;

    loop {
        ticker.tick().await;

        for device in fleet.devices() {
            let stats = device.store_stats();
            info!(
                records_stored = stats.records_stored,
                records_removed = stats.records_removed,
                "{}",
                device.summary()
            );
        }

        let summaries = fleet.list();
        match serde_json::to_string(&summaries) {
            Ok(json) => debug!(target: "lipodoc_sim::summary", "{}", json),
            Err(e) => warn!(error = %e, "Failed to serialize fleet summary"),
        }
    }
}

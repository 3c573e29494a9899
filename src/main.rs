mod domain;
mod infrastructure;
mod presentation;

use anyhow::Context;
use clap::Parser;
use domain::settings::SettingsService;
use eframe::egui;
use infrastructure::bluetooth::protocol::BleAddress;
use infrastructure::bluetooth::BluetoothService;
use infrastructure::logging::init_logger;
use presentation::app::RacingApp;
use std::time::Duration;

/// Drive Shell Racing Legends cars over Bluetooth LE.
#[derive(Debug, Parser)]
#[command(name = "shell-racing-controller", version, about)]
struct Cli {
    /// Bluetooth address of the car, e.g. AA:BB:CC:DD:EE:FF. Opens the
    /// device picker when omitted.
    address: Option<String>,

    /// Seconds to listen for cars in the device picker.
    #[arg(long)]
    scan_timeout: Option<u64>,

    /// Log level or filter directive, overrides the configured level.
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = SettingsService::new().context("Failed to load settings")?;

    let mut log_settings = settings.get().log_settings.clone();
    if let Some(level) = cli.log_level {
        log_settings.level = level;
    }
    let _logging_guard = init_logger(&log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    tracing::info!("Starting Shell Racing Legends controller");

    let target = cli
        .address
        .as_deref()
        .map(str::parse::<BleAddress>)
        .transpose()
        .context("Invalid Bluetooth address")?;
    let scan_window = Duration::from_secs(cli.scan_timeout.unwrap_or(settings.get().scan_timeout_secs));

    let service = BluetoothService::start()?;

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([760.0, 560.0])
            .with_title("Shell Racing Legends Controller"),
        ..Default::default()
    };

    eframe::run_native(
        "Shell Racing Legends Controller",
        options,
        Box::new(move |cc| {
            Ok(Box::new(RacingApp::new(
                cc,
                settings,
                service,
                target,
                scan_window,
            )))
        }),
    )
    .map_err(|e| anyhow::anyhow!("GUI failed: {}", e))?;

    tracing::info!("Controller closed");
    Ok(())
}

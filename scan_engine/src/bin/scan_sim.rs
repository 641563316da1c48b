//! Scanner simulator
//!
//! Calibrates and runs a scan against a simulated device, then returns the
//! carriage home. Raw line data can be written to a file for inspection.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use hardware::sim::SimulatedScanner;
use scan_engine::driver::{DriverConfig, ScanDriver};
use scan_engine::request::{ColorMode, ScanArea, ScanRequest};
use shared::config_storage::ConfigStorage;
use shared::device_interface::mock::MockDevice;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Lineart,
    Gray,
    Color,
}

impl From<Mode> for ColorMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Lineart => ColorMode::Lineart,
            Mode::Gray => ColorMode::Gray,
            Mode::Color => ColorMode::Color,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "scan_sim")]
#[command(about = "Calibrate and scan against a simulated scanner")]
struct Args {
    /// Model preset name
    #[arg(short, long, default_value = "CIS A4 600")]
    model: String,

    /// Scan resolution in dpi
    #[arg(short, long, default_value = "300")]
    resolution: u32,

    #[arg(long, value_enum, default_value = "color")]
    mode: Mode,

    /// Bits per sample (1 for lineart, 8 or 16 otherwise)
    #[arg(short, long, default_value = "8")]
    depth: u8,

    /// Scan width in inches
    #[arg(long, default_value = "8.5")]
    width: f64,

    /// Scan height in inches
    #[arg(long, default_value = "11.0")]
    height: f64,

    /// Directory holding the calibration cache (default: ~/.scan_config)
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Write raw line data to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Lines fetched per read
    #[arg(long, default_value = "64")]
    chunk_lines: u32,

    /// Calibrate even when a cached calibration matches
    #[arg(long)]
    force_calibration: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let preset = hardware::models::by_name(&args.model).with_context(|| {
        let names: Vec<String> = hardware::models::all().into_iter().map(|m| m.name).collect();
        format!("unknown model '{}', available: {}", args.model, names.join(", "))
    })?;

    let storage = match args.config_dir {
        Some(dir) => ConfigStorage::with_path(dir),
        None => ConfigStorage::new().context("Failed to locate config directory")?,
    };

    let config = DriverConfig {
        force_calibration: args.force_calibration,
        ..Default::default()
    };
    let device = MockDevice::new(Box::new(SimulatedScanner::for_preset(&preset)));
    let mut driver = ScanDriver::new(device, &preset, config).with_storage(storage);

    let request = ScanRequest::new(
        args.resolution,
        ScanArea::from_inches(0.0, 0.0, args.width, args.height),
        args.mode.into(),
        args.depth,
    );

    info!("Scanning with {} at {} dpi", preset.name, args.resolution);
    let session = driver.start_scan(&request).context("Failed to start scan")?;
    info!(
        "Calibration values: exposure {:?}, gain {:?}, offset {:?}",
        driver.values().exposure,
        driver.values().gain,
        driver.values().offset
    );

    let mut output = match &args.output {
        Some(path) => Some(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => None,
    };

    let mut total_bytes = 0usize;
    while driver.remaining_lines() > 0 {
        let data = driver.read_lines(args.chunk_lines.max(1))?;
        total_bytes += data.len();
        if let Some(file) = output.as_mut() {
            file.write_all(&data)?;
        }
    }
    driver.end_scan()?;
    driver.move_home()?;

    println!("Model:          {}", preset.name);
    println!(
        "Resolution:     {}x{} dpi (native {})",
        session.xres, session.yres, session.native_resolution
    );
    println!("Pixels/line:    {}", session.pixels_per_line);
    println!("Bytes/line:     {}", session.bytes_per_line);
    println!(
        "Lines:          {} ({} with skew correction)",
        session.lines, session.hardware_lines
    );
    println!("Bytes read:     {total_bytes}");
    if session.inexact {
        println!("Note: scan area was clamped to the sensor");
    }
    if let Some(path) = &args.output {
        println!("Raw data:       {}", path.display());
    }

    Ok(())
}

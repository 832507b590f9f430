//! chroma-core - Colorimetric calibration core for a four-channel
//! ambient-light color-matching instrument
//!
//! Drives a TCS3430-class X/Y/Z/IR sensor through lighting-regime
//! detection, IR-aware dual-matrix conversion to sRGB, a wizard-driven
//! field calibration trainer, and atomic non-volatile persistence,
//! exposed here over a thin HTTP transport shim for local exercise.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use parking_lot::Mutex;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use chroma_core::config;
use chroma_core::driver::{FakeSensorDriver, RawSample};
use chroma_core::facade::ColorMatchingFacade;
use chroma_core::persistence::{default_store_dir, CalibrationStore};
use chroma_core::server;

/// chroma-core - run the colorimetric calibration core behind a demo HTTP server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Web server host
    #[arg(long)]
    host: Option<String>,

    /// Web server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("chroma-core v{}", env!("CARGO_PKG_VERSION"));

    let config = config::Config::load_or_create(&args.config)?;

    let host = args.host.unwrap_or_else(|| config.server.host.clone());
    let port = args.port.unwrap_or(config.server.port);

    info!(
        "sensor defaults: atime={} again={} wtime={} dual_mode={}",
        config.sensor.atime, config.sensor.again, config.sensor.wtime, config.dual_matrix.dual_mode
    );

    let store_dir = default_store_dir(std::path::Path::new(&config.storage.data_dir));
    let store = CalibrationStore::open(&store_dir)?;

    // No concrete I2C backend is in scope for this core (§1); the demo
    // server runs against a fake driver seeded with a plausible indoor
    // reading so `/api/scan` returns something meaningful.
    let driver = FakeSensorDriver::new(RawSample::new(8_000, 8_000, 8_000, 500, 0));

    let mut facade = ColorMatchingFacade::new(driver, store, config.delta_e_metric.into())?;
    facade.enable_ir_postfilter(config.ir_postfilter_enabled);
    facade.apply_sensor_config(config.sensor.to_sensor_config())?;
    facade.set_dual_mode(config.dual_matrix.dual_mode);
    facade.set_ir_thresholds(
        config.dual_matrix.ir_threshold_low,
        config.dual_matrix.ir_threshold_high,
    )?;

    let state = Arc::new(server::AppState {
        facade: Mutex::new(facade),
    });

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!("starting HTTP transport shim at http://{}", addr);

    let router = server::build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

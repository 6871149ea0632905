//! CLI entry point.
//!
//! Runs the waveform engine against the simulated hardware: a
//! memory-mapped flash image and a clock-paced mock transfer engine.
//! Useful for exercising the full boot -> stream -> fault-burst flow on
//! a development host:
//!
//! ```bash
//! edgewave --flash-image /tmp/edgewave-flash.bin --load-only
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use edgewave::app::{BootMode, NullHooks, WaveApp};
use edgewave::config::WaveConfig;
use edgewave::hardware::mock::{MockDacBus, SimFlash, SystemClock};
use edgewave::hardware::SharedFlash;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "edgewave")]
#[command(about = "Four-channel DAC waveform streamer with fault-burst injection", long_about = None)]
struct Cli {
    /// TOML configuration file (missing file falls back to defaults).
    #[arg(long, default_value = "edgewave.toml")]
    config: PathBuf,

    /// Flash image backing the simulated waveform flash.
    #[arg(long, default_value = "edgewave-flash.bin")]
    flash_image: PathBuf,

    /// Validate prior flash contents instead of a full sync.
    #[arg(long)]
    load_only: bool,

    /// Trigger this fault id a second after boot (demo).
    #[arg(long)]
    fault: Option<u32>,

    /// Burst duration for --fault, in seconds.
    #[arg(long, default_value_t = 5)]
    fault_duration: u32,

    /// Probability of an injected transfer error per buffer half.
    #[arg(long, default_value_t = 0.0)]
    error_rate: f64,

    /// Stop after this many seconds (runs until killed when omitted).
    #[arg(long)]
    run_seconds: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = WaveConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let clock = Arc::new(SystemClock::new());
    let flash: SharedFlash = Arc::new(RwLock::new(SimFlash::open(
        &cli.flash_image,
        config.flash.capacity_bytes,
        config.flash.erase_unit,
    )?));
    let bus = MockDacBus::paced(clock.clone(), config.engine.timer_clock_hz)
        .with_error_rate(cli.error_rate);

    let mode = if cli.load_only || !config.sync.full_sync {
        BootMode::LoadOnly
    } else {
        BootMode::FullSync
    };

    let mut app = WaveApp::new(config, bus, flash, clock.clone(), Box::new(NullHooks));
    app.boot(mode);

    let started = std::time::Instant::now();
    let mut demo_fault_fired = false;
    loop {
        app.tick();

        if let (Some(fault_id), false) = (cli.fault, demo_fault_fired) {
            if started.elapsed() >= Duration::from_secs(1) {
                demo_fault_fired = true;
                if let Some(fault) = app.fault() {
                    let accepted = fault.trigger(fault_id, cli.fault_duration);
                    tracing::info!(fault_id, accepted, "demo fault trigger");
                }
            }
        }

        if let Some(limit) = cli.run_seconds {
            if started.elapsed() >= Duration::from_secs(limit) {
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    let stats = app.engine().get_stats();
    let health = app.engine().get_health();
    tracing::info!(
        ok = stats.ok,
        fail = stats.fail,
        recover = health.recover_count,
        "run complete"
    );
    Ok(())
}

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::fs::{self, File};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::{signal, time};

use clap_verbosity_flag::{InfoLevel, Verbosity};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cellbus_lib::acquisition::{Acquisition, CellModuleOp, MasterState};
use cellbus_lib::config::{BmsConfig, ModuleConfig};
use cellbus_lib::sim::SimBus;

/// Runs the master acquisition state machine against a simulated module chain.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of simulated cell modules on the bus.
    #[arg(short, long, default_value_t = 4)]
    modules: usize,
    /// Master configuration file (JSON). Missing fields take defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Stop after this many ticks; runs until Ctrl+C when omitted.
    #[arg(short, long)]
    ticks: Option<u64>,
    /// Print a JSON status line every N ticks.
    #[arg(long, default_value_t = 25)]
    status_every: u64,
    /// Install an inverting stage on the return path to the master.
    #[arg(long)]
    inverted_return: bool,
    /// Silence the replies of this module (1-based address).
    #[arg(long)]
    fail_module: Option<usize>,
    /// Pack current in amperes fed to the charge counter, positive = charging.
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    current: f64,
    /// Firmware image streamed to the modules once acquisition runs.
    #[arg(short, long)]
    firmware: Option<PathBuf>,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file =
            File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // INFO by default, DEBUG with -v, TRACE with -vv
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

fn build_master(cli: &Cli) -> Result<Acquisition<SimBus>> {
    let mut config = match &cli.config {
        Some(path) => BmsConfig::load(path).with_context(|| format!("Failed to load config from {:?}", path))?,
        None => BmsConfig::default(),
    };
    if cli.config.is_none() {
        config.expected_modules = u8::try_from(cli.modules).context("Too many modules")?;
    }

    let module_config = ModuleConfig {
        max_pages: config.max_pages,
        ..Default::default()
    };
    let mut bus = SimBus::new(cli.modules, module_config);
    if cli.inverted_return {
        bus = bus.with_inverted_return();
    }
    if let Some(address) = cli.fail_module {
        if address == 0 || address > cli.modules {
            bail!("--fail-module must be between 1 and {}", cli.modules);
        }
        bus.fail_module(address - 1);
    }

    let mut acq = Acquisition::new(bus, config).context("Invalid master configuration")?;
    if let Some(path) = &cli.firmware {
        let image = fs::read(path).with_context(|| format!("Failed to read firmware image {:?}", path))?;
        acq.load_firmware(&image).context("Firmware image rejected")?;
    }
    Ok(acq)
}

fn print_status(acq: &Acquisition<SimBus>) -> Result<()> {
    let line = serde_json::to_string(&acq.status()).context("Failed to serialize status")?;
    println!("{}", line);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut acq = build_master(&cli)?;
    let period_ms = acq.config().tick_period_ms;
    info!(
        modules = cli.modules,
        expected = acq.config().expected_modules,
        period_ms,
        "Starting simulated bus"
    );

    let mut upgrade_requested = cli.firmware.is_none();
    let mut interval = time::interval(Duration::from_millis(period_ms));

    loop {
        interval.tick().await;
        acq.calc_mut().record_current(cli.current, period_ms);
        acq.tick();

        if !upgrade_requested && acq.state() == MasterState::Run && acq.rounds() > 0 {
            acq.set_operation(CellModuleOp::FwUpgrade);
            upgrade_requested = true;
        }

        if cli.status_every > 0 && acq.ticks() % cli.status_every == 0 {
            print_status(&acq)?;
        }
        if cli.ticks.is_some_and(|limit| acq.ticks() >= limit) {
            break;
        }
    }

    if acq.state() != MasterState::Run {
        warn!("Stopped in state {}", acq.state());
    }
    print_status(&acq)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    tokio::select! {
        res = run(cli) => {
            if let Err(e) = res {
                error!("Simulation failed: {:?}", e);
                process::exit(1);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Ctrl+C received, shutting down gracefully.");
        }
    }
    Ok(())
}

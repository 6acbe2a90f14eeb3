//! CLI Entry Point for opo-daq
//!
//! Provides command-line access to:
//! - Offline energy/wavelength conversion
//! - Direct OPO controller commands (status, goto, speed)
//! - Closed-loop energy targeting and energy scans
//!
//! # Usage
//!
//! ```bash
//! opo-daq convert 3000
//! opo-daq --config config/opo_daq.toml goto 780.5
//! opo-daq energy 3000 --simulate
//! opo-daq scan --start 2900 --stop 3100 --step 10 --name mir_1 --simulate
//! ```
//!
//! There is no hardware wavemeter driver in this crate; `energy` and `scan`
//! need `--simulate`, which samples a simulated wavemeter following the OPO's
//! reported wavelength.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use opo_daq::config::{OpoConfig, DEFAULT_CONFIG_PATH};
use opo_daq::conversion::{classify_and_convert, full_conversion, Band};
use opo_daq::logging::{self, LoggingConfig, OutputFormat};
use opo_daq::opo::OpoLink;
use opo_daq::sampler::WavelengthSampler;
use opo_daq::storage::{ErrorSummary, MeasurementLog};
use opo_daq::targeting::{scan_points, EnergyTargetingController};
use opo_daq::wavemeter::{SimulatedWavemeter, SimulationProfile};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "opo-daq")]
#[command(about = "OPO laser control and closed-loop energy targeting", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Compact)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a photon energy to its band and motor wavelength (offline)
    Convert {
        /// Wavenumber (cm⁻¹)
        wavenumber: f64,
    },

    /// Print motor status and current wavelength
    Status,

    /// Move the motor and wait for it to stop
    Goto {
        /// Near-IR wavelength (nm), 710-880
        wavelength: f64,
    },

    /// Set the motor speed
    Speed {
        /// Speed (nm/s), 0.5-5.0
        nm_per_sec: f64,
    },

    /// Drive the OPO to a photon energy
    Energy {
        /// Wavenumber (cm⁻¹)
        wavenumber: f64,

        /// Use the simulated wavemeter
        #[arg(long)]
        simulate: bool,
    },

    /// Step through an energy range and save the measurements
    Scan {
        /// First wavenumber (cm⁻¹)
        #[arg(long)]
        start: f64,

        /// Last wavenumber (cm⁻¹), inclusive
        #[arg(long)]
        stop: f64,

        /// Increment (cm⁻¹)
        #[arg(long)]
        step: f64,

        /// Output file name stem
        #[arg(long)]
        name: String,

        /// Use the simulated wavemeter
        #[arg(long)]
        simulate: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = OpoConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    logging::init(LoggingConfig::from_config(&config)?.with_format(cli.log_format))?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted; cancelling");
            on_signal.cancel();
        }
    });

    let result = match cli.command {
        Commands::Convert { wavenumber } => convert(wavenumber),
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Status => status(&config).await,
        Commands::Goto { wavelength } => goto(&config, wavelength, &cancel).await,
        Commands::Speed { nm_per_sec } => speed(&config, nm_per_sec).await,
        Commands::Energy {
            wavenumber,
            simulate,
        } => energy(&config, wavenumber, simulate, &cancel).await,
        Commands::Scan {
            start,
            stop,
            step,
            name,
            simulate,
        } => scan(&config, start, stop, step, &name, simulate, &cancel).await,
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

fn convert(wavenumber: f64) -> Result<()> {
    let target = classify_and_convert(wavenumber)?;
    println!(
        "{} cm-1 is {}; motor wavelength {:.4} nm",
        wavenumber, target.band, target.near_ir_wavelength
    );
    println!();
    println!("{:<5} {:>14} {:>14}", "band", "wavelength/nm", "energy/cm-1");
    let all = full_conversion(target.near_ir_wavelength);
    for band in Band::ALL {
        let v = all.get(band);
        println!("{:<5} {:>14.4} {:>14.3}", band.to_string(), v.wavelength, v.wavenumber);
    }
    Ok(())
}

async fn connect(config: &OpoConfig) -> Result<Arc<OpoLink>> {
    let link = Arc::new(OpoLink::new(config.link_options()));
    link.connect().await?;
    if let Some(speed) = config.opo.speed_nm_per_sec {
        link.apply_speed(speed).await?;
    }
    Ok(link)
}

async fn status(config: &OpoConfig) -> Result<()> {
    let link = connect(config).await?;
    let motor = link.read_motor_status().await?;
    let wavelength = link.read_wavelength().await?;
    println!("motor:      {:?}", motor);
    println!("wavelength: {:.5} nm", wavelength);
    link.disconnect().await;
    Ok(())
}

async fn goto(config: &OpoConfig, wavelength: f64, cancel: &CancellationToken) -> Result<()> {
    let link = connect(config).await?;
    let _session = link.lock_session().await;
    link.move_and_settle(wavelength, cancel).await?;
    let reached = link.read_wavelength().await?;
    println!("motor stopped at {:.5} nm", reached);
    link.disconnect().await;
    Ok(())
}

async fn speed(config: &OpoConfig, nm_per_sec: f64) -> Result<()> {
    let link = connect(config).await?;
    link.apply_speed(nm_per_sec).await?;
    println!("motor speed set to {:.3} nm/s", nm_per_sec);
    link.disconnect().await;
    Ok(())
}

fn require_simulation(simulate: bool) -> Result<()> {
    if !simulate {
        bail!("no wavemeter driver is available; rerun with --simulate");
    }
    Ok(())
}

fn controller(config: &OpoConfig, link: &Arc<OpoLink>) -> EnergyTargetingController {
    let wavemeter = Arc::new(SimulatedWavemeter::new(
        link.wavelength_watch(),
        SimulationProfile::default(),
    ));
    let sampler = WavelengthSampler::new(wavemeter, config.sampler_options());
    EnergyTargetingController::new(link.clone(), sampler, config.targeting_options())
}

async fn energy(
    config: &OpoConfig,
    wavenumber: f64,
    simulate: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    // Resolve first so an impossible request never opens a connection
    classify_and_convert(wavenumber)?;
    require_simulation(simulate)?;
    let link = connect(config).await?;
    let ctl = controller(config, &link);

    let result = ctl.move_to_energy(wavenumber, cancel).await?;
    let last = result.final_attempt();
    println!(
        "{} target {:.3} cm-1 -> achieved {:.3} cm-1 (error {:+.3}, {})",
        result.target.band,
        result.target.requested_wavenumber,
        last.achieved_energy,
        result.energy_error(),
        if result.corrected() { "corrected" } else { "no correction" }
    );
    println!(
        "motor target {:.4} nm, measured {:.5} nm ± {:.5} nm",
        result.target.near_ir_wavelength,
        last.measured_wavelength(),
        last.measurement.reduction.stdev
    );
    link.disconnect().await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn scan(
    config: &OpoConfig,
    start: f64,
    stop: f64,
    step: f64,
    name: &str,
    simulate: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let log = MeasurementLog::new(&config.storage.output_dir, name)?;
    scan_points(start, stop, step)?;
    require_simulation(simulate)?;
    let link = connect(config).await?;
    let ctl = controller(config, &link);

    let outcome = ctl.scan(start, stop, step, cancel).await?;
    link.disconnect().await;

    // Persist whatever was measured, even if the scan ended early
    let path = log.write_records(&outcome.records)?;
    let raw: Vec<f64> = outcome
        .records
        .iter()
        .flat_map(|r| r.wl_measurements.initial_values.iter().copied())
        .collect();
    log.write_values(&raw)?;

    println!(
        "{} steps recorded, {} skipped -> {}",
        outcome.records.len(),
        outcome.skipped.len(),
        path.display()
    );
    for skipped in &outcome.skipped {
        println!("  skipped {} cm-1: {}", skipped.wavenumber, skipped.reason);
    }

    if let Ok(summary) = ErrorSummary::from_records(&outcome.records) {
        println!(
            "Average error: {:.3} cm-1, max error: {:.3} cm-1, min error: {:.3} cm-1",
            summary.average, summary.max, summary.min
        );
        if summary.has_outliers() {
            if let Ok(reduced) = ErrorSummary::reduced(&outcome.records) {
                println!(
                    "Reduced - average error: {:.3} cm-1, max error: {:.3} cm-1, min error: {:.3} cm-1",
                    reduced.average, reduced.max, reduced.min
                );
            }
        }
    }

    if let Some(aborted) = &outcome.aborted {
        bail!(
            "scan aborted at {} cm-1 after {} recorded steps: {}",
            aborted.wavenumber,
            outcome.records.len(),
            aborted.reason
        );
    }
    Ok(())
}

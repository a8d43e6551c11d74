//! CLI entry point for visa_vulture
//!
//! Headless front end for the equipment model:
//! - `validate` checks a CSV test plan and prints errors and warnings
//! - `scan` lists the resources the configured resource manager can open
//! - `run` connects an instrument and executes a plan (Ctrl-C stops it and
//!   switches the output off)
//!
//! # Usage
//!
//! ```bash
//! visa_vulture validate plans/ramp.csv
//! visa_vulture --simulate run plans/ramp.csv \
//!     --resource TCPIP::192.168.1.100::INSTR --instrument power_supply
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use visa_vulture::config::{AppConfig, DEFAULT_CONFIG_PATH};
use visa_vulture::file_io::read_test_plan;
use visa_vulture::logging;
use visa_vulture::model::EquipmentModel;

#[derive(Parser)]
#[command(name = "visa_vulture")]
#[command(about = "Run CSV test plans against VISA/SCPI instruments", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use simulated instruments regardless of the configuration
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a test plan without running it
    Validate {
        /// Path to the CSV test plan
        plan: PathBuf,
    },

    /// List available instrument resources
    Scan,

    /// Execute a test plan
    Run {
        /// Path to the CSV test plan
        plan: PathBuf,

        /// VISA resource string of the instrument
        #[arg(long)]
        resource: String,

        /// Instrument type: base type (power_supply) or registered name
        #[arg(long)]
        instrument: String,

        /// First step to execute
        #[arg(long, default_value = "1")]
        start_step: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if cli.simulate {
        config.simulation_mode = true;
    }
    config.validate()?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Validate { plan } => validate_plan(plan, &config),
        Commands::Scan => scan(&config).await,
        Commands::Run {
            plan,
            resource,
            instrument,
            start_step,
        } => run_plan(plan, &resource, &instrument, start_step, &config).await,
    }
}

fn validate_plan(path: PathBuf, config: &AppConfig) -> Result<()> {
    let result = read_test_plan(&path, Some(&config.validation_limits));
    for warning in &result.warnings {
        println!("warning: {}", warning);
    }
    match result.into_result() {
        Ok((plan, _)) => {
            println!("{}", plan);
            Ok(())
        }
        Err(errors) => {
            for error in &errors {
                println!("error: {}", error);
            }
            bail!("{} has {} error(s)", path.display(), errors.len())
        }
    }
}

async fn scan(config: &AppConfig) -> Result<()> {
    let model = EquipmentModel::from_config(config);
    let resources = model.scan_resources().await?;
    if resources.is_empty() {
        println!("No resources found");
    }
    for resource in resources {
        println!("{}", resource);
    }
    Ok(())
}

async fn run_plan(
    path: PathBuf,
    resource: &str,
    instrument: &str,
    start_step: u32,
    config: &AppConfig,
) -> Result<()> {
    let (plan, warnings) = read_test_plan(&path, Some(&config.validation_limits))
        .into_result()
        .map_err(|errors| anyhow::anyhow!(errors.join("\n")))?;
    for warning in warnings {
        warn!("{}", warning);
    }

    let model = Arc::new(EquipmentModel::from_config(config));
    model.register_state_callback(|old, new| info!(%old, %new, "State changed"));
    model.register_progress_callback(|step, total, test_step| {
        println!("Step {}/{}: {}", step, total, test_step.description());
    });
    model.register_complete_callback(|success, message| {
        println!("{} ({})", message, if success { "success" } else { "failure" });
    });

    model.connect_instrument(resource, instrument).await?;
    if let Some(identification) = model.instrument_identification() {
        println!("{}", identification.formatted());
    }
    model.load_test_plan(plan)?;

    let worker = Arc::clone(&model);
    let mut run = tokio::spawn(async move { worker.run_test(start_step).await });

    let outcome = tokio::select! {
        joined = &mut run => joined,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping test");
            model.stop_test();
            run.await
        }
    };

    let disconnected = model.disconnect().await;
    outcome.context("Run task panicked")??;
    disconnected?;
    Ok(())
}

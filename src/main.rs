//! regpoll service binary
//!
//! Loads configuration, connects the coordinator to the configured device,
//! and runs the poll loop until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use regpoll::{
    logging, CoordinatorConfig, DeviceCoordinator, ModbusTcpTransport, RegisterSnapshot,
};

#[derive(Parser, Debug)]
#[command(name = "regpoll", about = "Register device state coordinator")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "regpoll.yaml", env = "REGPOLL_CONFIG")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = CoordinatorConfig::from_file(&args.config)?;
    if args.validate {
        println!("Configuration {} is valid", args.config.display());
        return Ok(());
    }

    let mut logging_section = config.logging.clone();
    if let Some(level) = &args.log_level {
        logging_section.level = level.clone();
    }
    let _log_guard = logging::init_logging(&logging_section)?;

    info!(
        "Starting regpoll for {}:{} (unit {})",
        config.device.host, config.device.port, config.device.unit_id
    );

    let transport = ModbusTcpTransport::new(config.device.clone(), config.connect_timeout());
    let coordinator = Arc::new(DeviceCoordinator::new(Box::new(transport), &config));

    coordinator.subscribe(|snapshot: &Arc<RegisterSnapshot>| {
        info!(
            sequence = snapshot.sequence(),
            coils = snapshot.coils().len(),
            discrete_inputs = snapshot.discrete_inputs().len(),
            input_registers = snapshot.input_registers().len(),
            holding_registers = snapshot.holding_registers().len(),
            "Snapshot published"
        );
    });

    coordinator.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    coordinator.shutdown().await;

    Ok(())
}

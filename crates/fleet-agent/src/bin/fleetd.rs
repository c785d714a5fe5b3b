//! Main binary for the gpufleet controller daemon (fleetd)

use clap::{Parser, Subcommand};
use fleet_agent::{logging, Agent, AgentBuilder, AgentConfig, Result};
use fleet_dev::{MockClusterRuntime, MockMetricsReader};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "fleetd")]
#[command(about = "GPU fleet autoscaling and cost-optimization controller")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level override
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the controller
    Start {
        /// Override configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the default configuration
    Config {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate a configuration file
    Validate {
        /// Configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Start { ref config }) => {
            let config_path = config.clone().or(cli.config.clone());
            start(config_path, &cli).await
        }
        Some(Commands::Config { output }) => generate_config(output),
        Some(Commands::Validate { config }) => validate_config(config),
        None => {
            let config_path = cli.config.clone();
            start(config_path, &cli).await
        }
    }
}

async fn start(config_path: Option<PathBuf>, cli: &Cli) -> Result<()> {
    let mut config = match config_path {
        Some(path) => AgentConfig::from_file(&path)?,
        None => AgentConfig::default(),
    };

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    logging::init(&config.logging)?;
    info!(
        provider = %config.cluster.provider,
        region = %config.cluster.region,
        "loaded configuration"
    );

    // The standalone build runs against the in-memory dev capabilities;
    // a deployment wires real cluster-runtime and metrics adapters
    // through AgentBuilder instead.
    let mut agent: Agent = AgentBuilder::new(config)
        .with_runtime(Arc::new(MockClusterRuntime::new()))
        .with_metrics_reader(Arc::new(MockMetricsReader::new()))
        .build()?;

    agent.run().await
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let yaml = AgentConfig::default_yaml()?;
    match output {
        Some(path) => {
            std::fs::write(&path, yaml)?;
            println!("Wrote default configuration to {}", path.display());
        }
        None => print!("{}", yaml),
    }
    Ok(())
}

fn validate_config(path: PathBuf) -> Result<()> {
    match AgentConfig::from_file(&path) {
        Ok(_) => {
            println!("Configuration is valid: {}", path.display());
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration is invalid: {}", e);
            Err(e)
        }
    }
}

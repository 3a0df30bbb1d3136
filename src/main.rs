//! cardata-bridge main entry point

use cardata_bridge::bridge::Supervisor;
use cardata_bridge::config::BridgeConfig;
use cardata_bridge::observability::init_default_logging;
use clap::{Parser, Subcommand};
use std::process;
use tracing::{error, info};

/// Bridge a vendor vehicle-telemetry MQTT v5 stream to a local broker
#[derive(Parser)]
#[command(name = "cardata-bridge")]
#[command(about = "Bridge a vendor vehicle-telemetry MQTT v5 stream to a local broker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge until SIGINT/SIGTERM
    Run,
    /// Validate the configuration
    Config {
        /// Print the resolved configuration (secrets elided)
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    init_default_logging();
    let cli = Cli::parse();

    let config = match BridgeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            let e = cardata_bridge::BridgeError::from(e);
            error!("configuration: {e}");
            process::exit(e.exit_code());
        }
    };

    match cli.command {
        Commands::Config { show } => {
            if show {
                println!("{}", config.display_redacted());
            }
            info!("configuration OK");
        }
        Commands::Run => run_bridge(config).await,
    }
}

async fn run_bridge(config: BridgeConfig) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        account = %config.account_id,
        upstream = %format!("{}:{}", config.upstream_host, config.upstream_port),
        "starting cardata-bridge"
    );

    let supervisor = match Supervisor::bootstrap(config).await {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!("startup failed: {e}");
            process::exit(e.exit_code());
        }
    };

    if let Err(e) = supervisor.run().await {
        error!("bridge failed: {e}");
        process::exit(1);
    }
}

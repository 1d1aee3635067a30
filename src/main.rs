//! wwwhisper Gateway - authorization in front of an unmodified application

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use wwwhisper_gateway::{cli::Cli, config::Config, gateway::Server, setup_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            cli.apply(&mut config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        "Starting wwwhisper gateway"
    );

    // Neither WWWHISPER_URL nor WWWHISPER_DISABLE set fails here, before binding.
    let server = match Server::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}

//! Campus Gateway - request-security gateway for the learning platform

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use campus_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::{Gateway, GatewayDeps, demo_downstream},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckConfig) => run_check_config(&cli),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Validate the configuration and report the first problem found
fn run_check_config(cli: &Cli) -> ExitCode {
    match load_config(cli) {
        Ok(config) => match config.validate() {
            Ok(()) => {
                println!("Configuration OK ({} route rules)", config.routes.len());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Configuration invalid: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the gateway server
async fn run_server(cli: Cli) -> ExitCode {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = config.validate() {
        error!("Configuration invalid: {e}");
        return ExitCode::FAILURE;
    }

    let gateway = match Gateway::new(config, GatewayDeps::in_memory()) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("Failed to build gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    match gateway.run(demo_downstream()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Gateway error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Load config and apply CLI overrides
fn load_config(cli: &Cli) -> campus_gateway::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }
    Ok(config)
}

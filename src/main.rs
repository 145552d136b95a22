mod cli;
mod simulate;

use clap::Parser;
use peerwatch_core::{Config, ConfigLoader, ConfigValidator, DomainError, PeerwatchError};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::cli::{Cli, Commands, SimulateArgs};
use crate::simulate::{format_transition, Simulation};

#[tokio::main]
async fn main() -> Result<(), PeerwatchError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("peerwatch=info,warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::ConfigSample { output }) => {
            let path = output.unwrap_or_else(|| PathBuf::from("./peerwatch.yaml"));
            Config::sample().save(&path)?;
            println!("Sample configuration written to {}", path.display());
        }
        Some(Commands::CheckConfig) => {
            let config = Config::load(&cli.config_path)?;
            println!("Configuration is valid:");
            println!("  account:  {}", config.account.id.as_ref().map_or("<none>", |a| a.as_str()));
            println!("  contacts: {}", config.account.contacts.len());
            println!(
                "  poll {:?} / check {:?} / timeout {:?} / suppress {:?}",
                config.presence.poll_interval(),
                config.presence.check_interval(),
                config.presence.timeout_window(),
                config.presence.suppress_window()
            );
        }
        Some(Commands::Simulate(args)) => run_simulation(&cli.config_path, &args).await?,
        None => run_simulation(&cli.config_path, &SimulateArgs::default()).await?,
    }

    Ok(())
}

/// Load the configuration for a simulation run.
///
/// Without an explicit path a missing config file falls back to the sample.
fn simulation_config(path: &Option<String>) -> Result<Config, PeerwatchError> {
    match ConfigLoader::load(path.as_deref()) {
        Ok(config) => Ok(config),
        Err(PeerwatchError::Domain(DomainError::ConfigNotFound { .. })) if path.is_none() => {
            warn!("No configuration file found, using the sample configuration");
            Ok(Config::sample())
        }
        Err(e) => Err(e),
    }
}

async fn run_simulation(path: &Option<String>, args: &SimulateArgs) -> Result<(), PeerwatchError> {
    let mut config = simulation_config(path)?;
    args.apply(&mut config);
    ConfigValidator::validate(&config)?;

    let duration = match args.duration_secs {
        0 => Duration::from_secs(300),
        secs => Duration::from_secs(secs),
    };

    let simulation = Simulation::new(config);
    tokio::select! {
        report = simulation.run(duration, |t| println!("{}", format_transition(t))) => {
            let report = report?;
            println!();
            println!(
                "{} transitions observed, {} reachability flips",
                report.transitions.len(),
                report.flips
            );
            for presence in report.final_state {
                println!("  {:<12} {}", presence.peer.as_str(), presence.status);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping simulation");
        }
    }

    Ok(())
}

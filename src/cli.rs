use clap::{Args, Parser, Subcommand};
use peerwatch_core::Config;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "peerwatch", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file path
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config_path: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the presence engine against the simulated liveness channel
    Simulate(SimulateArgs),

    /// Generate sample configuration
    ConfigSample {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load and validate the configuration, then print it
    CheckConfig,
}

#[derive(Args, Debug, Default, Clone)]
pub struct SimulateArgs {
    /// How long to run, in seconds
    #[arg(short, long, default_value_t = 300)]
    pub duration_secs: u64,

    /// Override presence.poll_interval_ms
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Override presence.check_interval_ms
    #[arg(long)]
    pub check_interval_ms: Option<u64>,

    /// Override presence.timeout_window_ms
    #[arg(long)]
    pub timeout_window_ms: Option<u64>,

    /// Override presence.suppress_window_ms
    #[arg(long)]
    pub suppress_window_ms: Option<u64>,

    /// Override simulator.flip_interval_ms
    #[arg(long)]
    pub flip_interval_ms: Option<u64>,

    /// Override simulator.seed
    #[arg(long)]
    pub seed: Option<u64>,
}

impl SimulateArgs {
    /// Apply command-line overrides on top of the loaded configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(ms) = self.poll_interval_ms {
            config.presence.poll_interval_ms = ms;
        }
        if let Some(ms) = self.check_interval_ms {
            config.presence.check_interval_ms = ms;
        }
        if let Some(ms) = self.timeout_window_ms {
            config.presence.timeout_window_ms = ms;
        }
        if let Some(ms) = self.suppress_window_ms {
            config.presence.suppress_window_ms = ms;
        }
        if let Some(ms) = self.flip_interval_ms {
            config.simulator.flip_interval_ms = ms;
        }
        if self.seed.is_some() {
            config.simulator.seed = self.seed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulate_flags_parse() {
        let cli = Cli::try_parse_from([
            "peerwatch",
            "simulate",
            "--duration-secs",
            "30",
            "--poll-interval-ms",
            "20000",
            "--seed",
            "42",
        ])
        .unwrap();
        let Some(Commands::Simulate(args)) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.duration_secs, 30);

        let mut config = Config::sample();
        args.apply(&mut config);
        assert_eq!(config.presence.poll_interval_ms, 20_000);
        assert_eq!(config.presence.timeout_window_ms, 90_000);
        assert_eq!(config.simulator.seed, Some(42));
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::try_parse_from(["peerwatch", "check-config", "-c", "x.yaml"]).unwrap();
        assert_eq!(cli.config_path.as_deref(), Some("x.yaml"));
        assert!(matches!(cli.command, Some(Commands::CheckConfig)));
    }
}

//! CLI entrypoints for the feedloom pipeline.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

use feedloom::config::{load_configuration, Configuration, HandlerRegistry};
use feedloom::modules::register_builtins;
use feedloom::Runtime;

/// Feed ingestion and fan-out pipeline.
#[derive(Parser)]
#[command(name = "feedloom-cli", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the pipeline
    Run {
        /// Directory containing the yaml configuration files
        #[arg(long, default_value = "config")]
        config: PathBuf,
    },
    /// Load the configuration and print the normalized yaml
    DumpConfig {
        /// Directory containing the yaml configuration files
        #[arg(long, default_value = "config")]
        config: PathBuf,
    },
}

/// Parses arguments and dispatches the selected command. Exit code 0 on
/// clean shutdown, 1 on configuration errors, 2 on fatal runtime errors.
pub async fn run() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_pipeline(&config).await,
        Commands::DumpConfig { config } => dump_config(&config),
    }
}

async fn run_pipeline(config_dir: &Path) -> ExitCode {
    let configuration = match load_configuration(config_dir) {
        Ok(configuration) => configuration,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    setup_logging(&configuration);

    let mut registry = HandlerRegistry::new();
    if let Err(e) = register_builtins(&mut registry) {
        eprintln!("configuration error: {e}");
        return ExitCode::from(1);
    }
    if let Err(e) = registry.init(&configuration) {
        eprintln!("configuration error: {e}");
        return ExitCode::from(1);
    }

    let runtime = match Runtime::new(configuration, registry) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{e}"), "pipeline failed");
            ExitCode::from(2)
        }
    }
}

fn dump_config(config_dir: &Path) -> ExitCode {
    let configuration = match load_configuration(config_dir) {
        Ok(configuration) => configuration,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    match serde_yaml::to_string(&configuration.raw) {
        Ok(normalized) => {
            println!("{normalized}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("configuration error: {e}");
            ExitCode::from(1)
        }
    }
}

fn setup_logging(configuration: &Configuration) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(&configuration.app_settings.log_level)
            .unwrap_or_else(|_| EnvFilter::new("info"))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

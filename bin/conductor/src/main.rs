mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "In-process agent coordination: message bus, registry, activations and dispatch", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of ~/.conductor/config.json
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Wire a demo context, run events through it and print the resulting state
    Demo {
        /// Make the audit engine fail every other run
        #[arg(long)]
        failures: bool,

        /// Also write the exported state to ~/.conductor/snapshots/<label>.json
        #[arg(long)]
        dump: Option<String>,
    },

    /// Run demo operations and print the registry health report
    Health {
        /// Number of audit operations to run before scoring
        #[arg(short, long, default_value_t = 10)]
        runs: usize,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config_path = cli.config;
    match cli.command {
        Commands::Demo { failures, dump } => {
            commands::demo::run(config_path.as_deref(), failures, dump.as_deref()).await?;
        }
        Commands::Health { runs } => {
            commands::health::run(config_path.as_deref(), runs).await?;
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                commands::config_cmd::show(config_path.as_deref()).await?;
            }
            ConfigCommands::Init { force } => {
                commands::config_cmd::init(config_path.as_deref(), force).await?;
            }
            ConfigCommands::Path => {
                commands::config_cmd::path(config_path.as_deref());
            }
        },
    }

    Ok(())
}

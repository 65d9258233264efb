//! Switchyard CLI: run the workflow pipeline in-process.
//!
//! Every command starts the full pipeline (pools, domain masters, global
//! master) inside this process with deterministic echo slaves.

use std::time::Duration;

use clap::{Parser, Subcommand};
use switchyard_cli::commands;

/// Switchyard: route queries through nlp → query → response
#[derive(Parser)]
#[command(name = "switchyard", version, about = "Switchyard: workflow routing through domain masters and slave pools")]
pub struct Cli {
    /// Path to a YAML config file (defaults apply when omitted)
    #[arg(long, env = "SWITCHYARD_CONFIG")]
    config: Option<String>,

    /// Simulated work per echo slave task, in milliseconds
    #[arg(long, default_value_t = 0)]
    slave_delay_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit one query and wait for its result
    Run {
        /// Natural-language query
        query: String,
        /// Context as a JSON string
        #[arg(long)]
        context: Option<String>,
        /// Seconds to wait before giving up
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },

    /// Run a batch of sample queries and print pool status and health
    Demo {
        /// Number of queries to submit
        #[arg(long, default_value_t = 5)]
        count: usize,
        /// Seconds to wait for each workflow
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        /// Also print Prometheus metrics
        #[arg(long)]
        metrics: bool,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as YAML
    Show,
    /// Validate a config file
    Validate {
        /// Path to the YAML file
        file: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchyard_core=info,switchyard=info,switchyard_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let slave_delay = Duration::from_millis(cli.slave_delay_ms);
    let result = match cli.command {
        Commands::Run {
            query,
            context,
            timeout_secs,
        } => match commands::load_config(cli.config.as_deref()) {
            Ok(config) => {
                commands::run::run(
                    config,
                    commands::run::RunOptions {
                        query: &query,
                        context: context.as_deref(),
                        timeout: Duration::from_secs(timeout_secs),
                        slave_delay,
                    },
                )
                .await
            }
            Err(e) => Err(e),
        },

        Commands::Demo {
            count,
            timeout_secs,
            metrics,
        } => match commands::load_config(cli.config.as_deref()) {
            Ok(config) => {
                commands::demo::run(config, count, slave_delay, Duration::from_secs(timeout_secs), metrics).await
            }
            Err(e) => Err(e),
        },

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                commands::load_config(cli.config.as_deref()).and_then(|config| commands::config::show(&config))
            }
            ConfigAction::Validate { file } => commands::config::validate(&file).map(|_| ()),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

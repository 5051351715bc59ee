//! Glimpse CLI - describe images in batches with vision models.
//!
//! Glimpse sends each image to a local Ollama daemon, a cloud API, or an
//! on-device llama.cpp runtime and streams the descriptions out as JSON.
//!
//! # Usage
//!
//! ```bash
//! # Describe a directory with the configured Ollama model
//! glimpse describe ./photos/ --output descriptions.jsonl
//!
//! # Resume an interrupted run
//! glimpse describe ./photos/ --output descriptions.jsonl --skip-existing
//!
//! # See what a provider offers
//! glimpse models anthropic
//!
//! # View configuration
//! glimpse config show
//! ```

use clap::{Parser, Subcommand};

mod cli;
mod logging;

/// Glimpse - batch image descriptions from local, cloud, and on-device models.
#[derive(Parser, Debug)]
#[command(name = "glimpse")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Describe an image or every image under a directory
    Describe(cli::describe::DescribeArgs),

    /// Check provider availability and list models
    Models(cli::models::ModelsArgs),

    /// View and manage configuration
    Config(cli::config::ConfigArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging isn't initialized yet, so config warnings go straight to stderr.
    let config = match glimpse_core::Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Warning: Failed to load config: {e}\n  \
                 Using default configuration. Check your config file with `glimpse config path`."
            );
            glimpse_core::Config::default()
        }
    };
    logging::init_from_config(&config, cli.verbose, cli.json_logs);

    tracing::debug!("Glimpse v{}", glimpse_core::VERSION);

    match cli.command {
        Commands::Describe(args) => cli::describe::execute(args, config).await,
        Commands::Models(args) => cli::models::execute(args, config).await,
        Commands::Config(args) => cli::config::execute(args).await,
    }
}

//! modelhost - command-line interface for the modelhost controller

use anyhow::Result;
use clap::{Parser, Subcommand};
use modelhost_core::EventCategory;
use std::time::Duration;
use tracing::debug;

mod client;
mod commands;
mod output;
mod reconciler;

use client::ModelhostClient;
use output::{OutputFormat, OutputFormatter};

/// Command-line interface for the modelhost controller
#[derive(Debug, Parser)]
#[command(name = "modelhost")]
#[command(about = "Launch, swap and watch inference engines on a modelhost controller")]
#[command(version)]
pub struct Cli {
    /// Controller endpoint
    #[arg(short, long, global = true, default_value = "http://127.0.0.1:8080")]
    endpoint: String,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable JSON output (overrides --output)
    #[arg(long, global = true)]
    json: bool,

    /// Timeout for requests in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show the supervised engine process
    Status,

    /// Show GPU telemetry
    Gpus,

    /// List launchable recipes
    Recipes,

    /// Launch a recipe, replacing whatever is running
    Launch {
        /// Recipe identifier
        recipe: String,

        /// Follow launch progress until the engine is ready or the launch ends
        #[arg(short, long)]
        follow: bool,
    },

    /// Cancel an in-flight launch
    Cancel {
        /// Recipe identifier (defaults to the current launch)
        recipe: Option<String>,
    },

    /// Stop the running engine
    Evict,

    /// Show engine throughput metrics
    Metrics {
        /// Best values since the controller started
        #[arg(long, conflicts_with = "lifetime")]
        peak: bool,

        /// Totals across every engine process
        #[arg(long)]
        lifetime: bool,
    },

    /// Wait for the running engine to become healthy
    #[command(name = "wait-ready")]
    WaitReady {
        /// Seconds to wait (server default when omitted)
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Print controller events as they happen
    Events {
        /// Only these categories (comma-separated)
        #[arg(short, long, value_delimiter = ',', value_parser = parse_category)]
        category: Vec<EventCategory>,

        /// Stop after this many events
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Live dashboard
    Watch,

    /// Event bus statistics
    Stats {
        /// Refresh interval in seconds (for continuous monitoring)
        #[arg(short, long)]
        refresh: Option<u64>,
    },
}

fn parse_category(value: &str) -> std::result::Result<EventCategory, String> {
    value.parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("modelhost={},modelhost_core={}", log_level, log_level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    debug!("Starting modelhost CLI with {:?}", cli);

    // Determine output format
    let output_format = if cli.json {
        OutputFormat::Json
    } else {
        cli.output
    };

    let client = ModelhostClient::new(&cli.endpoint, Duration::from_secs(cli.timeout))?;

    if let Err(e) = run(&client, cli.command, output_format).await {
        OutputFormatter::new(output_format).print_error(&format!("{:#}", e))?;
        std::process::exit(1);
    }

    Ok(())
}

async fn run(client: &ModelhostClient, command: Commands, output_format: OutputFormat) -> Result<()> {
    match command {
        Commands::Status => commands::status::show_status(client, output_format).await,
        Commands::Gpus => commands::status::list_gpus(client, output_format).await,
        Commands::Recipes => commands::status::list_recipes(client, output_format).await,
        Commands::Launch { recipe, follow } => {
            commands::launch::launch(client, recipe, follow, output_format).await
        }
        Commands::Cancel { recipe } => commands::launch::cancel(client, recipe, output_format).await,
        Commands::Evict => commands::launch::evict(client, output_format).await,
        Commands::Metrics { peak, lifetime } => {
            commands::status::show_metrics(client, peak, lifetime, output_format).await
        }
        Commands::WaitReady { timeout } => {
            commands::launch::wait_ready(client, timeout, output_format).await
        }
        Commands::Events { category, count } => {
            commands::events::tail_events(client, category, count, output_format).await
        }
        Commands::Watch => commands::watch::watch(client, output_format).await,
        Commands::Stats { refresh } => commands::stats::show_stats(client, refresh, output_format).await,
    }
}

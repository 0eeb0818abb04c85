//! modelhostd: supervises one inference engine and serves its state over HTTP

use clap::{Parser, Subcommand};
use modelhost_agent::{init_logging, AgentBuilder, AgentError, Result};
use modelhost_core::Config;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "modelhostd", version)]
#[command(about = "Control plane daemon for a single-GPU inference host")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Overrides `logging.level`
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Overrides `server.bind_addr`
    #[arg(long, value_name = "ADDR")]
    bind: Option<SocketAddr>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (the default)
    Start,
    /// Write the built-in defaults as YAML
    Config {
        /// Write here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Load --config and report what it resolves to
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { ref output }) => dump_config(output.as_deref()),
        Some(Commands::Validate) => check_config(cli.config.as_deref()),
        Some(Commands::Start) | None => serve(&cli).await,
    }
}

async fn serve(cli: &Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }

    init_logging(&config.logging)?;
    if let Some(path) = &cli.config {
        info!(config = %path.display(), "configuration loaded");
    }

    let mut agent = AgentBuilder::new().with_config(config).build().await?;
    if let Err(e) = agent.run().await {
        error!("modelhostd stopped with an error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn dump_config(output: Option<&Path>) -> Result<()> {
    let yaml = Config::default().to_yaml()?;
    match output {
        Some(path) => {
            std::fs::write(path, yaml)?;
            eprintln!("wrote {}", path.display());
        }
        None => print!("{}", yaml),
    }
    Ok(())
}

fn check_config(path: Option<&Path>) -> Result<()> {
    let path = path.ok_or_else(|| AgentError::Setup("validate needs --config FILE".to_string()))?;
    let config = Config::load_from_file(path)?;

    let gpu = match (config.gpu.enabled, config.gpu.mock) {
        (false, _) => "off".to_string(),
        (true, true) => "mock".to_string(),
        (true, false) => config.gpu.nvidia_smi_path.clone(),
    };
    let recipes = config
        .recipes
        .path
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "-".to_string());

    println!("{}: ok", path.display());
    println!("  listen     {}", config.server.bind_addr);
    println!(
        "  readiness  {}s, polled every {}ms",
        config.launch.readiness_timeout_seconds, config.launch.readiness_poll_interval_ms
    );
    println!("  recipes    {}", recipes);
    println!("  gpu        {}", gpu);
    Ok(())
}

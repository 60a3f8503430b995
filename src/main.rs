//! Herald CLI
//!
//! Runs the broadcast server or writes a default configuration file.

use anyhow::Context;
use clap::{Parser, Subcommand};
use herald::config::{generate_default_config, Config, ConfigLoad, LoggingConfig};
use herald::server::Server;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "herald")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-threaded WebSocket broadcast server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file (default: search the standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// TCP port
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Number of worker threads
    #[arg(short, long, global = true)]
    pub workers: Option<usize>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the broadcast server (default)
    Serve,

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { ref output }) => write_default_config(output.as_ref()),
        Some(Commands::Serve) | None => serve(&cli),
    }
}

fn serve(cli: &Cli) -> anyhow::Result<()> {
    let loaded = match &cli.config {
        Some(path) => ConfigLoad {
            config: Config::load_with_env(path)
                .with_context(|| format!("Failed to load config from {:?}", path))?,
            source: Some(path.clone()),
            rejected: Vec::new(),
        },
        None => Config::load_default(),
    };
    let mut config = loaded.config;

    // Command-line flags win over file and environment
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(workers) = cli.workers {
        config.server.workers = workers;
    }
    config.validate().context("Invalid configuration")?;

    init_logging(&config.logging);
    tracing::info!("Starting Herald v{}", env!("CARGO_PKG_VERSION"));
    for error in &loaded.rejected {
        tracing::warn!("Skipped config file: {}", error);
    }
    match &loaded.source {
        Some(path) => tracing::info!("Loaded config from {:?}", path),
        None => tracing::info!("Using default config with environment overrides"),
    }
    tracing::info!(
        workers = config.server.workers,
        max_frame_size = config.server.max_frame_size,
        "Server configuration loaded"
    );

    let server = Server::bind(&config.server)
        .with_context(|| format!("Failed to bind {}", config.server.bind_address()))?;
    server.run().context("Server stopped with an error")?;

    tracing::info!("Herald shutdown complete");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("herald={}", logging.level).into());
    let json = logging.format == "json";

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

fn write_default_config(output: Option<&PathBuf>) -> anyhow::Result<()> {
    let config = generate_default_config();

    match output {
        Some(path) => {
            // Create parent directory if needed
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
            std::fs::write(path, &config)
                .with_context(|| format!("Failed to write {:?}", path))?;
            println!("Config written to {:?}", path);
        }
        None => {
            print!("{}", config);
        }
    }

    Ok(())
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pasarela::config::{Config, ConfigError};
use pasarela::{Pasarela, PasarelaConfig};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "pasarela")]
#[command(
    about = "A failover TCP proxy that routes clients to the single healthy active member of a database cluster"
)]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Pasarela Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pasarela proxy
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_pasarela(config).await?,
        Commands::Config { output } => generate_config(output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

async fn run_pasarela(config_path: PathBuf) -> Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config);

    info!("Configuration loaded from: {:?}", config_path);
    info!("Listening on: {}", config.server.listen_addr);
    for backend in &config.proxy.backends {
        info!(
            backend = %backend.name,
            "Backend {}:{} (status on port {})",
            backend.host,
            backend.port,
            backend.status_port
        );
    }

    let pasarela = Pasarela::new(PasarelaConfig::from(&config))
        .context("Failed to initialize pasarela")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received interrupt, shutting down"),
            Err(e) => error!("Failed to listen for interrupt signal: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    pasarela
        .run_until(shutdown_rx)
        .await
        .context("Failed to run pasarela")?;

    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  pasarela run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Listen address: {}", config.server.listen_addr);
            if let Some(port) = config.server.health_port {
                println!("  Health port: {}", port);
            }
            println!("  Active selection: {:?}", config.proxy.active_selection);
            println!(
                "  Health check timeout: {}",
                pasarela::utils::format_duration(config.proxy.healthcheck_timeout())
            );
            println!("  ARP cache clearing: {}", if config.arp.enabled { "enabled" } else { "disabled" });
            println!("  Backends: {} instances", config.proxy.backends.len());
            for (i, backend) in config.proxy.backends.iter().enumerate() {
                println!(
                    "    {}: {} at {}:{} (status http://{}:{}/{})",
                    i + 1,
                    backend.name,
                    backend.host,
                    backend.port,
                    backend.host,
                    backend.status_port,
                    backend.status_endpoint.trim_start_matches('/')
                );
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("pasarela v{}", env!("CARGO_PKG_VERSION"));
    println!("A failover TCP proxy for replicated database clusters");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Active backend election by reported ordinal index");
    println!("  • Automatic failover with session severing");
    println!("  • Operator traffic enable/disable");
    println!("  • Optional ARP cache invalidation for failed members");
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let fmt_layer = tracing_subscriber::fmt::layer();

    match config.logging.format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json())
            .init(),
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init(),
    }

    info!("Logging initialized at level: {}", config.logging.level);
}

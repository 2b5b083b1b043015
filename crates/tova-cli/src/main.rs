//! tova CLI - multi-vantage-point domain validation over Tor
//!
//! Usage:
//!   tova circus                                 Run the circuit pool manager
//!   tova validate <protocol> <domain> <path>    Run one validation session
//!
//! Both commands read CIRCUIT_TTL, REQUEST_TIMEOUT, VAL_K, VAL_N, N_CIRCUITS,
//! PREFIX_LEN and BUILD_INTERVAL from the environment.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::future::Future;
use tova_circus::{discover_vantage_ip, CircuitPool, PoolConfig, DISCOVERY_URL};
use tova_control::{TorControl, CONNECT_BACKOFF};
use tova_core::{Protocol, RecordSink, TovaConfig};
use tova_registry::FileRegistry;
use tova_validation::{OverlayFetcher, SessionConfig, ValidationEngine};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "tova")]
#[command(author, version, about = "Multi-vantage-point domain validation over Tor")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep a pool of diverse circuits alive until interrupted
    Circus,

    /// Fetch a challenge from several vantage points and print the verdict
    Validate {
        /// http or https
        protocol: Protocol,

        /// Domain to validate
        domain: String,

        /// Challenge path on the domain
        challenge: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; RUST_LOG wins over --verbose
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = TovaConfig::from_env().context("Invalid configuration")?;

    match cli.command {
        Commands::Circus => cmd_circus(config).await,
        Commands::Validate {
            protocol,
            domain,
            challenge,
        } => cmd_validate(config, protocol, domain, challenge).await,
    }
}

async fn connect(config: &TovaConfig) -> Result<TorControl> {
    let deployment = &config.deployment;
    TorControl::connect(
        deployment.control_addr,
        deployment.control_password.as_deref(),
        CONNECT_BACKOFF,
    )
    .await
    .with_context(|| format!("Failed to authenticate to {}", deployment.control_addr))
}

async fn cmd_circus(config: TovaConfig) -> Result<()> {
    let link = connect(&config).await?;
    let registry = FileRegistry::open(&config.deployment.registry_dir)
        .await
        .context("Failed to open circuit registry")?;

    let vantage_ip = match config.deployment.vantage_ip {
        Some(ip) => Some(ip),
        None => discover_vantage_ip(&reqwest::Client::new(), DISCOVERY_URL).await,
    };
    info!("Vantage IP: {:?}", vantage_ip);

    let mut pool = CircuitPool::new(
        link,
        registry,
        PoolConfig::from_config(&config),
        RecordSink::for_circus(&config.deployment.log_dir),
    )
    .with_vantage_ip(vantage_ip);
    pool.record_vantage_ip().await;

    info!(
        "Maintaining {} circuits (ttl {}s, /{} exit diversity)",
        config.n_circuits, config.circuit_ttl, config.prefix_len
    );
    pool.run(shutdown_signal()).await;

    Ok(())
}

async fn shutdown_signal() {
    wait_for_signal(tokio::signal::ctrl_c()).await
}

/// Resolves when `signal` fires; never resolves if it could not be installed
async fn wait_for_signal<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => info!("Received Ctrl-C, shutting down"),
        Err(e) => {
            error!("Failed to listen for Ctrl-C, running until killed: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

async fn cmd_validate(
    config: TovaConfig,
    protocol: Protocol,
    domain: String,
    challenge: String,
) -> Result<()> {
    let link = connect(&config).await?;
    link.leave_streams_unattached()
        .await
        .context("Failed to take over stream attachment")?;
    link.watch_streams()
        .await
        .context("Failed to subscribe to stream events")?;
    let registry = FileRegistry::open(&config.deployment.registry_dir)
        .await
        .context("Failed to open circuit registry")?;
    let fetcher = OverlayFetcher::new(&config.deployment.socks_proxy, config.request_timeout())?;

    let engine = ValidationEngine::new(
        link,
        registry,
        fetcher,
        SessionConfig::from_config(&config),
        RecordSink::for_worker(&config.deployment.log_dir),
    );
    let verdict = engine.run_session(protocol, &domain, &challenge).await;

    info!(
        "{} of {} vantage points agreed",
        verdict.confidence, verdict.attempts
    );
    println!("{}", verdict.output);
    Ok(())
}

//! benchd binary: bring up the control core and supervise it.
//!
//! The process-wide instances (session service, console fan-out hub) are
//! created at startup and torn down at shutdown; the HTTP surface mounts
//! on top of [`SessionService`] from a separate layer. Shutdown drains
//! live sessions within a bounded window.

use anyhow::Context;
use benchd::{Config, ConsoleHub, MemStore, SessionService};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Bounded drain window for graceful shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(
    name = "benchd",
    version,
    about = "Control plane for embedded-target simulation and debug backends"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane (default).
    Serve,
    /// Print capability descriptors of the enabled backends as JSON.
    Capabilities,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(p) => {
            Config::load(p).with_context(|| format!("loading config from {}", p.display()))
        }
        None => Ok(Config::default()),
    }
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
            _ = sigquit.recv() => {},
            _ = tokio::signal::ctrl_c() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let enabled: Vec<&str> = [
        ("qemu", config.backends.qemu.enabled),
        ("renode", config.backends.renode.enabled),
        ("openocd", config.backends.openocd.enabled),
    ]
    .iter()
    .filter(|(_, on)| *on)
    .map(|(name, _)| *name)
    .collect();

    let hub = ConsoleHub::spawn();
    let service = Arc::new(SessionService::new(
        config,
        Arc::new(MemStore::new()),
        Some(hub.clone()),
    )?);

    info!(backends = ?enabled, "benchd control plane started");

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received");

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, service.shutdown_all())
        .await
        .is_err()
    {
        warn!(
            "session drain exceeded {}s; abandoning remaining children",
            SHUTDOWN_TIMEOUT.as_secs()
        );
    }

    info!("benchd stopped");
    Ok(())
}

fn capabilities(config: Config) -> anyhow::Result<()> {
    let service = SessionService::new(config, Arc::new(MemStore::new()), None)?;
    println!("{}", serde_json::to_string_pretty(&service.capabilities())?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("benchd={}", config.log.level))),
        )
        .init();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Capabilities => capabilities(config),
    }
}

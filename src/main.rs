//! devspace-configure
//!
//! Provisions DNS and TLS for a developer space and holds it until the
//! process is told to shut down, then cleans the DNS records up again.
//!
//! # Usage
//! ```bash
//! # Bring the dev space up and keep it alive until SIGINT/SIGTERM
//! devspace-configure --config devspace.yaml create-keys
//!
//! # Remove the published DNS records after a crash
//! devspace-configure --config devspace.yaml teardown
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use devspace_configure::cloudflare::CloudflareDns;
use devspace_configure::config::Config;
use devspace_configure::orchestrator::Orchestrator;
use devspace_configure::servicemeta::KubernetesServiceLocator;
use devspace_configure::vault::VaultIssuer;

// ============================================================
// CLI Definition
// ============================================================

#[derive(Parser)]
#[command(name = "devspace-configure")]
#[command(about = "Provision DNS and TLS for a developer space", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "DEVSPACE_CONFIG", default_value = "devspace.yaml")]
    config: PathBuf,

    /// Directory the credential bundle is written into
    #[arg(long, default_value = "/tmp/certs")]
    output_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision certificates and DNS, then hold until shutdown
    CreateKeys,

    /// Remove the published DNS records and exit
    Teardown,
}

// ============================================================
// Main Entry Point
// ============================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    info!(host = %config.domains.fqdn(), "devspace-configure starting");

    let issuer = Arc::new(VaultIssuer::new(config.vault.clone()));
    let dns = Arc::new(CloudflareDns::new(&config.cloudflare)?);
    let locator = Arc::new(
        KubernetesServiceLocator::connect(&config.kubernetes)
            .await
            .context("connecting to the kubernetes cluster")?,
    );

    let orchestrator = Orchestrator::new(
        issuer,
        dns,
        locator,
        config.domains.clone(),
        cli.output_dir,
    );

    match cli.command {
        Commands::CreateKeys => {
            let cancel = CancellationToken::new();
            tokio::spawn(wait_for_shutdown(cancel.clone()));

            orchestrator.run(cancel).await?;
        }
        Commands::Teardown => {
            orchestrator.teardown().await?;
        }
    }

    Ok(())
}

/// Cancel the token on the first SIGINT or SIGTERM.
async fn wait_for_shutdown(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            Err(error) => {
                tracing::warn!(%error, "could not install SIGTERM handler");
                let _ = ctrl_c.await;
                info!("received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received ctrl-c");
    }

    cancel.cancel();
}

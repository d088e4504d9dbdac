//! Provisioning orchestrator
//!
//! Sequences the credential issuer, service locator and DNS publisher into
//! the bringup and teardown phases, driven by a cancellation token wired to
//! process signals. The components are capability traits so each phase can
//! be exercised against in-memory substitutes.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cloudflare::DnsError;
use crate::config::DomainsConfig;
use crate::credentials::{CredentialBundle, WriteError};
use crate::servicemeta::DiscoveryError;
use crate::vault::CredentialError;

// ============================================================
// Capability traits
// ============================================================

/// Can open an authenticated session against the secrets backend.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn authenticate(&self) -> Result<Box<dyn CredentialSession>, CredentialError>;
}

/// An authenticated secrets-backend session.
#[async_trait]
pub trait CredentialSession: Send + Sync {
    /// Retrieve the DNS API token stored for `root_domain`.
    async fn fetch_dns_token(&self, root_domain: &str) -> Result<String, CredentialError>;

    /// Issue a TLS bundle for `<subdomain>.<root_domain>`.
    async fn issue_certificate(
        &self,
        root_domain: &str,
        subdomain: &str,
    ) -> Result<CredentialBundle, CredentialError>;
}

/// Can create and delete the dev-space DNS record set.
#[async_trait]
pub trait DnsPublisher: Send + Sync {
    async fn create_records(
        &self,
        token: &str,
        root_domain: &str,
        subdomain: &str,
        target: &str,
    ) -> Result<(), DnsError>;

    async fn delete_records(
        &self,
        token: &str,
        root_domain: &str,
        subdomain: &str,
    ) -> Result<(), DnsError>;
}

/// Can resolve the load-balancer hostname serving a dev-space host.
#[async_trait]
pub trait ServiceLocator: Send + Sync {
    async fn discover_hostname(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DiscoveryError>;
}

// ============================================================
// Orchestrator
// ============================================================

/// Lifecycle phase, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Bringup,
    Running,
    Teardown,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Bringup => "bringup",
            Phase::Running => "running",
            Phase::Teardown => "teardown",
            Phase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A failed sub-step. Every variant is fatal for its phase.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("credential issuer: {0}")]
    Credentials(#[from] CredentialError),

    #[error("dns publisher: {0}")]
    Dns(#[from] DnsError),

    #[error("service discovery: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("credential artifacts: {0}")]
    Artifacts(#[from] WriteError),

    #[error("bringup task: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Wires the three capabilities to the configured dev-space domain.
#[derive(Clone)]
pub struct Orchestrator {
    issuer: Arc<dyn CredentialIssuer>,
    dns: Arc<dyn DnsPublisher>,
    locator: Arc<dyn ServiceLocator>,
    domains: DomainsConfig,
    output_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(
        issuer: Arc<dyn CredentialIssuer>,
        dns: Arc<dyn DnsPublisher>,
        locator: Arc<dyn ServiceLocator>,
        domains: DomainsConfig,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            issuer,
            dns,
            locator,
            domains,
            output_dir,
        }
    }

    /// Forward provisioning sequence. Strictly sequential; the first failed
    /// sub-step halts the phase.
    pub async fn bringup(&self, cancel: &CancellationToken) -> Result<(), OrchestratorError> {
        info!(phase = %Phase::Bringup, host = %self.domains.fqdn(), "starting bringup");

        let session = self.issuer.authenticate().await?;
        let token = session.fetch_dns_token(&self.domains.root_domain).await?;

        let bundle = session
            .issue_certificate(&self.domains.root_domain, &self.domains.subdomain)
            .await?;
        bundle.write_to_dir(&self.output_dir)?;

        let target = self
            .locator
            .discover_hostname(&self.domains.subdomain, cancel)
            .await?;

        info!(host = %self.domains.fqdn(), %target, "publishing DNS records");
        self.dns
            .create_records(
                &token,
                &self.domains.root_domain,
                &self.domains.subdomain,
                &target,
            )
            .await?;

        info!("bringup complete");
        Ok(())
    }

    /// Reverse sequence: remove the published DNS records.
    ///
    /// Re-authenticates from scratch so it also works as a standalone
    /// recovery invocation after a crash. Never touches the certificate or
    /// the locator.
    pub async fn teardown(&self) -> Result<(), OrchestratorError> {
        info!(phase = %Phase::Teardown, host = %self.domains.fqdn(), "starting teardown");

        let session = self.issuer.authenticate().await?;
        let token = session.fetch_dns_token(&self.domains.root_domain).await?;

        self.dns
            .delete_records(&token, &self.domains.root_domain, &self.domains.subdomain)
            .await?;

        info!("teardown complete");
        Ok(())
    }

    /// Full lifecycle: run bringup concurrently, wait for the cancellation
    /// signal, then tear down.
    ///
    /// A bringup failure before any cancellation is fatal and skips
    /// teardown. Once cancellation is observed, teardown always runs; a
    /// bringup interrupted by the same signal is logged, not propagated.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        let worker = self.clone();
        let bringup_cancel = cancel.clone();
        let mut bringup =
            tokio::spawn(async move { worker.bringup(&bringup_cancel).await });

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("shutdown signal observed");
                match (&mut bringup).await {
                    Ok(Ok(())) => info!("bringup had already completed"),
                    Ok(Err(error)) => warn!(%error, "bringup interrupted by shutdown"),
                    Err(error) => warn!(%error, "bringup task failed"),
                }
            }
            result = &mut bringup => {
                result??;
                info!(phase = %Phase::Running, "provisioning complete, waiting for shutdown signal");
                cancel.cancelled().await;
                info!("shutdown signal observed");
            }
        }

        let outcome = self.teardown().await;
        info!(phase = %Phase::Stopped, "shutdown complete");
        outcome
    }
}

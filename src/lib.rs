//! devspace-configure
//!
//! Provisions a developer space: issues a short-lived mTLS certificate from
//! Vault, discovers the Kubernetes load balancer fronting the space, and
//! publishes the matching Cloudflare CNAME records. On shutdown the records
//! are removed again.
//!
//! Modules map one-to-one onto the external systems involved:
//! - [`config`] - YAML configuration, validated up front
//! - [`vault`] - authentication, DNS token lookup and certificate issuance
//! - [`credentials`] - the PEM bundle and its on-disk layout
//! - [`servicemeta`] - load-balancer hostname discovery
//! - [`cloudflare`] - CNAME publication and cleanup
//! - [`orchestrator`] - phase sequencing over the capability traits

pub mod cloudflare;
pub mod config;
pub mod credentials;
pub mod orchestrator;
pub mod servicemeta;
pub mod vault;

pub use cloudflare::CloudflareDns;
pub use config::Config;
pub use credentials::CredentialBundle;
pub use orchestrator::{Orchestrator, OrchestratorError, Phase};
pub use servicemeta::KubernetesServiceLocator;
pub use vault::VaultIssuer;

//! Configuration loading and validation
//!
//! The config file is YAML with one section per external system. Everything
//! is validated up front so a bad config never reaches a network call.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("missing required config value: {0}")]
    Missing(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Top-level configuration, immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub vault: VaultConfig,
    pub cloudflare: CloudflareConfig,
    pub domains: DomainsConfig,
    pub kubernetes: KubernetesConfig,
}

/// Vault connection and auth settings.
#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    pub address: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub use_kubernetes: bool,
    #[serde(default)]
    pub kubernetes_role: Option<String>,
    pub mounts: VaultMounts,
}

/// Mount points for the KV store holding the DNS token and the PKI engine.
#[derive(Debug, Clone, Deserialize)]
pub struct VaultMounts {
    pub kv: String,
    pub pki: String,
}

/// Cloudflare account settings. The API token is fetched from Vault at
/// runtime, never configured here.
#[derive(Debug, Clone, Deserialize)]
pub struct CloudflareConfig {
    #[serde(default)]
    pub email: Option<String>,
}

/// The dev-space hostname, split into zone and subdomain.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainsConfig {
    #[serde(rename = "root")]
    pub root_domain: String,
    #[serde(rename = "sub")]
    pub subdomain: String,
}

impl DomainsConfig {
    /// Fully-qualified dev-space hostname, `<sub>.<root>`.
    pub fn fqdn(&self) -> String {
        format!("{}.{}", self.subdomain, self.root_domain)
    }
}

/// How to reach the cluster that hosts the dev-space load balancer.
#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default)]
    pub use_cluster_config: bool,
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every invariant that must hold before any side effect runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vault.address.is_empty() {
            return Err(ConfigError::Missing("vault.address"));
        }
        if self.vault.mounts.kv.is_empty() {
            return Err(ConfigError::Missing("vault.mounts.kv"));
        }
        if self.vault.mounts.pki.is_empty() {
            return Err(ConfigError::Missing("vault.mounts.pki"));
        }

        let has_token = self.vault.token.as_deref().is_some_and(|t| !t.is_empty());
        if self.vault.use_kubernetes {
            if has_token {
                return Err(ConfigError::Invalid {
                    field: "vault.token",
                    reason: "static token and kubernetes auth are mutually exclusive".to_string(),
                });
            }
            if self
                .vault
                .kubernetes_role
                .as_deref()
                .map_or(true, str::is_empty)
            {
                return Err(ConfigError::Missing("vault.kubernetes_role"));
            }
        } else if !has_token {
            return Err(ConfigError::Missing("vault.token"));
        }

        validate_domain("domains.root", &self.domains.root_domain)?;
        validate_domain("domains.sub", &self.domains.subdomain)?;

        Ok(())
    }
}

/// Domains become Vault path segments, so a slash would let a config walk
/// into unrelated secrets.
fn validate_domain(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Missing(field));
    }
    if value.contains('/') {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("{value:?} contains a path separator"),
        });
    }
    Ok(())
}

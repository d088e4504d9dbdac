//! Vault credential issuer
//!
//! Typed client for the two Vault mounts this tool touches: a KV v2 store
//! holding the Cloudflare API token per root domain, and a PKI engine that
//! issues the dev-space certificate. Authentication is either a static token
//! or a Kubernetes service-account exchange; in the latter case the session
//! owns a renewal task that keeps the lease alive until the session drops.

use std::fs;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::VaultConfig;
use crate::credentials::CredentialBundle;
use crate::orchestrator::{CredentialIssuer, CredentialSession};

const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Field of the KV secret that holds the Cloudflare API token.
const DNS_TOKEN_FIELD: &str = "token";

/// Issued certificates are valid for 30 days.
const CERTIFICATE_TTL: &str = "2592000s";

/// Errors from the Vault credential issuer.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("vault authentication failed: {0}")]
    Auth(String),

    #[error("service account token not found at {0}")]
    MissingIdentity(String),

    #[error("root domain is empty")]
    EmptyDomain,

    #[error("root domain {0:?} contains a path separator")]
    UnsafeSecretKey(String),

    #[error("no DNS token stored for {root_domain}")]
    TokenNotFound { root_domain: String },

    #[error("secret for {root_domain} has a non-string {field} field")]
    MalformedSecret {
        root_domain: String,
        field: &'static str,
    },

    #[error("certificate issuance for {common_name} returned no {field}")]
    IncompleteIssuance {
        common_name: String,
        field: &'static str,
    },

    #[error("vault returned {status} for {path}: {message}")]
    Api {
        status: u16,
        path: String,
        message: String,
    },

    #[error("vault request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

// ============================================================
// API request/response types
// ============================================================

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    role: &'a str,
    jwt: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    auth: Option<LoginAuth>,
}

#[derive(Debug, Deserialize)]
struct LoginAuth {
    client_token: String,
    #[serde(default)]
    lease_duration: u64,
    #[serde(default)]
    renewable: bool,
}

#[derive(Debug, Deserialize)]
struct KvReadResponse {
    data: Option<KvReadData>,
}

#[derive(Debug, Deserialize)]
struct KvReadData {
    data: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Serialize)]
struct IssueRequest<'a> {
    common_name: &'a str,
    ttl: &'a str,
    exclude_cn_from_sans: bool,
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    data: Option<IssueData>,
}

#[derive(Debug, Default, Deserialize)]
struct IssueData {
    certificate: Option<String>,
    issuing_ca: Option<String>,
    private_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VaultErrors {
    #[serde(default)]
    errors: Vec<String>,
}

// ============================================================
// Issuer
// ============================================================

/// Builds authenticated [`VaultSession`]s from the loaded config. Each
/// bringup and teardown phase opens its own session; nothing is cached
/// across phases.
pub struct VaultIssuer {
    config: VaultConfig,
}

impl VaultIssuer {
    pub fn new(config: VaultConfig) -> Self {
        Self { config }
    }

    /// Authenticate against Vault and return a live session.
    pub async fn connect(&self) -> Result<VaultSession, CredentialError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let mut session = VaultSession {
            http,
            address: self.config.address.trim_end_matches('/').to_string(),
            namespace: self.config.namespace.clone(),
            kv_mount: self.config.mounts.kv.clone(),
            pki_mount: self.config.mounts.pki.clone(),
            token: String::new(),
            renewer: None,
        };

        if self.config.use_kubernetes {
            let role = self.config.kubernetes_role.as_deref().unwrap_or_default();
            session.login_kubernetes(role).await?;
        } else {
            session.token = self
                .config
                .token
                .clone()
                .ok_or_else(|| CredentialError::Auth("no vault token configured".to_string()))?;
        }

        Ok(session)
    }
}

#[async_trait]
impl CredentialIssuer for VaultIssuer {
    async fn authenticate(&self) -> Result<Box<dyn CredentialSession>, CredentialError> {
        Ok(Box::new(self.connect().await?))
    }
}

// ============================================================
// Session
// ============================================================

/// An authenticated Vault session. Dropping the session aborts the lease
/// renewal task, if one is running.
pub struct VaultSession {
    http: Client,
    address: String,
    namespace: Option<String>,
    kv_mount: String,
    pki_mount: String,
    token: String,
    renewer: Option<JoinHandle<()>>,
}

impl VaultSession {
    /// Exchange the local service-account JWT for a Vault token and start
    /// the renewal task for its lease.
    async fn login_kubernetes(&mut self, role: &str) -> Result<(), CredentialError> {
        let jwt = fs::read_to_string(SERVICE_ACCOUNT_TOKEN_PATH)
            .map_err(|_| CredentialError::MissingIdentity(SERVICE_ACCOUNT_TOKEN_PATH.to_string()))?;

        let path = "auth/kubernetes/login";
        let response = self
            .request(Method::POST, path)
            .json(&LoginRequest {
                role,
                jwt: jwt.trim(),
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(path, response).await);
        }

        let login: LoginResponse = response.json().await?;
        let auth = login
            .auth
            .ok_or_else(|| CredentialError::Auth("login response had no auth data".to_string()))?;

        self.token = auth.client_token;

        if auth.renewable && auth.lease_duration > 0 {
            let http = self.http.clone();
            let address = self.address.clone();
            let namespace = self.namespace.clone();
            let token = self.token.clone();
            self.renewer = Some(tokio::spawn(renew_loop(
                http,
                address,
                namespace,
                token,
                auth.lease_duration,
            )));
        }

        debug!(lease_secs = auth.lease_duration, "vault kubernetes login succeeded");
        Ok(())
    }

    /// Read the Cloudflare API token stored for `root_domain`.
    ///
    /// The domain becomes a path segment, so anything containing a slash is
    /// rejected before a request is built.
    pub async fn fetch_dns_token(&self, root_domain: &str) -> Result<String, CredentialError> {
        let key = root_domain.trim_end_matches('/');
        if key.is_empty() {
            return Err(CredentialError::EmptyDomain);
        }
        if key.contains('/') {
            return Err(CredentialError::UnsafeSecretKey(root_domain.to_string()));
        }

        let path = format!("{}/data/{}", self.kv_mount, key);
        let response = self.request(Method::GET, &path).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(CredentialError::TokenNotFound {
                root_domain: key.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(api_error(&path, response).await);
        }

        let secret: KvReadResponse = response.json().await?;
        let data = secret
            .data
            .and_then(|d| d.data)
            .ok_or_else(|| CredentialError::TokenNotFound {
                root_domain: key.to_string(),
            })?;

        match data.get(DNS_TOKEN_FIELD) {
            Some(serde_json::Value::String(token)) => Ok(token.clone()),
            Some(_) => Err(CredentialError::MalformedSecret {
                root_domain: key.to_string(),
                field: DNS_TOKEN_FIELD,
            }),
            None => Err(CredentialError::TokenNotFound {
                root_domain: key.to_string(),
            }),
        }
    }

    /// Ask the PKI mount to issue a certificate for `<sub>.<root>`.
    pub async fn issue_certificate(
        &self,
        root_domain: &str,
        subdomain: &str,
    ) -> Result<CredentialBundle, CredentialError> {
        let common_name = format!("{subdomain}.{root_domain}");
        let path = format!("{}/issue/{}", self.pki_mount, root_domain);

        let response = self
            .request(Method::POST, &path)
            .json(&IssueRequest {
                common_name: &common_name,
                ttl: CERTIFICATE_TTL,
                exclude_cn_from_sans: false,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(api_error(&path, response).await);
        }

        let issued: IssueResponse = response.json().await?;
        bundle_from_issue_data(&common_name, issued.data.unwrap_or_default())
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        vault_request(
            &self.http,
            &self.address,
            self.namespace.as_deref(),
            &self.token,
            method,
            path,
        )
    }
}

impl Drop for VaultSession {
    fn drop(&mut self) {
        if let Some(renewer) = self.renewer.take() {
            renewer.abort();
        }
    }
}

#[async_trait]
impl CredentialSession for VaultSession {
    async fn fetch_dns_token(&self, root_domain: &str) -> Result<String, CredentialError> {
        VaultSession::fetch_dns_token(self, root_domain).await
    }

    async fn issue_certificate(
        &self,
        root_domain: &str,
        subdomain: &str,
    ) -> Result<CredentialBundle, CredentialError> {
        VaultSession::issue_certificate(self, root_domain, subdomain).await
    }
}

// ============================================================
// Helpers
// ============================================================

fn vault_request(
    http: &Client,
    address: &str,
    namespace: Option<&str>,
    token: &str,
    method: Method,
    path: &str,
) -> RequestBuilder {
    let mut builder = http
        .request(method, format!("{address}/v1/{path}"))
        .header("X-Vault-Token", token);
    if let Some(namespace) = namespace {
        builder = builder.header("X-Vault-Namespace", namespace);
    }
    builder
}

fn bundle_from_issue_data(
    common_name: &str,
    data: IssueData,
) -> Result<CredentialBundle, CredentialError> {
    let missing = |field: &'static str| CredentialError::IncompleteIssuance {
        common_name: common_name.to_string(),
        field,
    };

    Ok(CredentialBundle {
        certificate: data.certificate.ok_or_else(|| missing("certificate"))?,
        private_key: data.private_key.ok_or_else(|| missing("private_key"))?,
        issuing_ca: data.issuing_ca.ok_or_else(|| missing("issuing_ca"))?,
    })
}

async fn api_error(path: &str, response: reqwest::Response) -> CredentialError {
    let status = response.status().as_u16();
    let message = response
        .json::<VaultErrors>()
        .await
        .map(|e| e.errors.join(", "))
        .unwrap_or_default();
    CredentialError::Api {
        status,
        path: path.to_string(),
        message,
    }
}

/// Renew the session token at half-lease intervals until aborted.
async fn renew_loop(
    http: Client,
    address: String,
    namespace: Option<String>,
    token: String,
    mut lease_secs: u64,
) {
    loop {
        let wait = Duration::from_secs((lease_secs / 2).max(10));
        tokio::time::sleep(wait).await;

        match renew_self(&http, &address, namespace.as_deref(), &token).await {
            Ok(new_lease) => {
                debug!(lease_secs = new_lease, "renewed vault token lease");
                if new_lease > 0 {
                    lease_secs = new_lease;
                }
            }
            Err(error) => warn!(%error, "vault token renewal failed"),
        }
    }
}

async fn renew_self(
    http: &Client,
    address: &str,
    namespace: Option<&str>,
    token: &str,
) -> Result<u64, CredentialError> {
    let path = "auth/token/renew-self";
    let response = vault_request(http, address, namespace, token, Method::POST, path)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(api_error(path, response).await);
    }

    let renewed: LoginResponse = response.json().await?;
    Ok(renewed.auth.map(|a| a.lease_duration).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_session() -> VaultSession {
        VaultSession {
            http: Client::new(),
            // Unroutable; the guard tests must fail before any request.
            address: "http://vault.invalid".to_string(),
            namespace: None,
            kv_mount: "secret".to_string(),
            pki_mount: "pki".to_string(),
            token: "s.test".to_string(),
            renewer: None,
        }
    }

    #[tokio::test]
    async fn slash_in_root_domain_is_rejected_without_network() {
        let session = offline_session();

        let err = session
            .fetch_dns_token("example.com/../other")
            .await
            .unwrap_err();

        assert!(matches!(err, CredentialError::UnsafeSecretKey(_)));
    }

    #[tokio::test]
    async fn trailing_slash_is_trimmed_but_inner_slash_rejected() {
        let session = offline_session();

        // A single trailing slash is tolerated by trimming, so this must
        // get past the guard and fail on the (unroutable) transport instead.
        let err = session.fetch_dns_token("example.com/").await.unwrap_err();
        assert!(matches!(err, CredentialError::Transport(_)));

        let err = session.fetch_dns_token("a/b").await.unwrap_err();
        assert!(matches!(err, CredentialError::UnsafeSecretKey(_)));
    }

    #[tokio::test]
    async fn empty_root_domain_is_rejected() {
        let session = offline_session();

        let err = session.fetch_dns_token("/").await.unwrap_err();
        assert!(matches!(err, CredentialError::EmptyDomain));
    }

    #[test]
    fn issue_data_must_be_complete() {
        let complete = IssueData {
            certificate: Some("CERT".to_string()),
            issuing_ca: Some("CA".to_string()),
            private_key: Some("KEY".to_string()),
        };
        let bundle = bundle_from_issue_data("dev1.example.com", complete).unwrap();
        assert_eq!(bundle.certificate, "CERT");
        assert_eq!(bundle.issuing_ca, "CA");

        let incomplete = IssueData {
            certificate: Some("CERT".to_string()),
            issuing_ca: None,
            private_key: Some("KEY".to_string()),
        };
        let err = bundle_from_issue_data("dev1.example.com", incomplete).unwrap_err();
        assert!(matches!(
            err,
            CredentialError::IncompleteIssuance {
                field: "issuing_ca",
                ..
            }
        ));
    }

    #[test]
    fn kv_response_token_field_must_be_a_string() {
        let secret: KvReadResponse = serde_json::from_value(serde_json::json!({
            "data": { "data": { "token": 42 } }
        }))
        .unwrap();

        let data = secret.data.and_then(|d| d.data).unwrap();
        assert!(!data.get(DNS_TOKEN_FIELD).unwrap().is_string());
    }
}

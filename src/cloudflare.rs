//! Cloudflare DNS publisher
//!
//! Thin typed wrapper over the v4 REST API: zone lookup by name, CNAME
//! create for the dev-space host and its wildcard, and the matching delete.
//! The API token is fetched from Vault per phase and passed in per call.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CloudflareConfig;
use crate::orchestrator::DnsPublisher;

const CLOUDFLARE_API: &str = "https://api.cloudflare.com/client/v4";

/// Cloudflare error code for a create that collides with an existing record.
const RECORD_ALREADY_EXISTS: i64 = 81057;

/// Errors from the DNS publisher.
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("no cloudflare zone found for {domain}")]
    ZoneNotFound { domain: String },

    #[error("cloudflare api error for {name}: {message}")]
    Api { name: String, message: String },

    #[error("cloudflare request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

// ============================================================
// API response types
// ============================================================

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DnsRecord {
    id: String,
    name: String,
    #[serde(rename = "type")]
    record_type: String,
}

#[derive(Debug, Serialize)]
struct CreateRecordRequest<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
    proxied: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum CreateOutcome {
    Created,
    AlreadyExists,
}

// ============================================================
// Client
// ============================================================

/// Cloudflare DNS client.
pub struct CloudflareDns {
    http: Client,
    email: Option<String>,
}

impl CloudflareDns {
    pub fn new(config: &CloudflareConfig) -> Result<Self, DnsError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            email: config.email.clone(),
        })
    }

    /// Bearer-token auth by default; a configured account email switches to
    /// the legacy API-key header pair.
    fn auth(&self, builder: RequestBuilder, token: &str) -> RequestBuilder {
        match &self.email {
            Some(email) => builder
                .header("X-Auth-Email", email)
                .header("X-Auth-Key", token),
            None => builder.bearer_auth(token),
        }
    }

    async fn zone_id(&self, token: &str, domain: &str) -> Result<String, DnsError> {
        let url = format!("{CLOUDFLARE_API}/zones?name={domain}");
        let response: ApiResponse<Vec<Zone>> = self
            .auth(self.http.get(&url), token)
            .send()
            .await?
            .json()
            .await?;

        if !response.success {
            return Err(DnsError::Api {
                name: domain.to_string(),
                message: join_errors(&response.errors),
            });
        }

        let zone = response
            .result
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| DnsError::ZoneNotFound {
                domain: domain.to_string(),
            })?;

        debug!(zone_id = %zone.id, %domain, "resolved cloudflare zone");
        Ok(zone.id)
    }

    async fn create_record(
        &self,
        token: &str,
        zone_id: &str,
        name: &str,
        target: &str,
    ) -> Result<(), DnsError> {
        let url = format!("{CLOUDFLARE_API}/zones/{zone_id}/dns_records");
        let request = CreateRecordRequest {
            record_type: "CNAME",
            name,
            content: target,
            ttl: 1, // auto
            proxied: false,
        };

        let response: ApiResponse<DnsRecord> = self
            .auth(self.http.post(&url), token)
            .json(&request)
            .send()
            .await?
            .json()
            .await?;

        match check_create_response(name, &response)? {
            CreateOutcome::Created => info!(record = %name, %target, "created CNAME record"),
            CreateOutcome::AlreadyExists => {
                debug!(record = %name, "CNAME record already exists, treating as created")
            }
        }
        Ok(())
    }

    /// Create the `<sub>` and `*.<sub>` CNAME records pointing at `target`.
    /// An existing record with either name counts as success.
    pub async fn create_records(
        &self,
        token: &str,
        root_domain: &str,
        subdomain: &str,
        target: &str,
    ) -> Result<(), DnsError> {
        let zone_id = self.zone_id(token, root_domain).await?;
        let wildcard = format!("*.{subdomain}");

        self.create_record(token, &zone_id, subdomain, target)
            .await?;
        self.create_record(token, &zone_id, &wildcard, target).await
    }

    /// Delete the CNAME records named `<sub>.<root>` and `*.<sub>.<root>`,
    /// the exact pair [`create_records`](Self::create_records) publishes.
    ///
    /// Subdomains shorter than two characters are refused outright so a
    /// mangled config can never delete apex or near-apex records.
    pub async fn delete_records(
        &self,
        token: &str,
        root_domain: &str,
        subdomain: &str,
    ) -> Result<(), DnsError> {
        if subdomain.len() < 2 {
            warn!(%subdomain, "subdomain too short, skipping DNS delete");
            return Ok(());
        }

        let zone_id = self.zone_id(token, root_domain).await?;
        let fqdn = format!("{subdomain}.{root_domain}");

        let url =
            format!("{CLOUDFLARE_API}/zones/{zone_id}/dns_records?type=CNAME&per_page=1000");
        let response: ApiResponse<Vec<DnsRecord>> = self
            .auth(self.http.get(&url), token)
            .send()
            .await?
            .json()
            .await?;

        if !response.success {
            return Err(DnsError::Api {
                name: fqdn,
                message: join_errors(&response.errors),
            });
        }

        let records = response.result.unwrap_or_default();
        for id in matching_record_ids(&records, &fqdn) {
            self.delete_record(token, &zone_id, &id, &fqdn).await?;
        }
        Ok(())
    }

    async fn delete_record(
        &self,
        token: &str,
        zone_id: &str,
        record_id: &str,
        name: &str,
    ) -> Result<(), DnsError> {
        let url = format!("{CLOUDFLARE_API}/zones/{zone_id}/dns_records/{record_id}");
        let response: ApiResponse<serde_json::Value> = self
            .auth(self.http.delete(&url), token)
            .send()
            .await?
            .json()
            .await?;

        if !response.success {
            return Err(DnsError::Api {
                name: name.to_string(),
                message: join_errors(&response.errors),
            });
        }

        info!(record = %name, id = %record_id, "deleted CNAME record");
        Ok(())
    }
}

#[async_trait]
impl DnsPublisher for CloudflareDns {
    async fn create_records(
        &self,
        token: &str,
        root_domain: &str,
        subdomain: &str,
        target: &str,
    ) -> Result<(), DnsError> {
        CloudflareDns::create_records(self, token, root_domain, subdomain, target).await
    }

    async fn delete_records(
        &self,
        token: &str,
        root_domain: &str,
        subdomain: &str,
    ) -> Result<(), DnsError> {
        CloudflareDns::delete_records(self, token, root_domain, subdomain).await
    }
}

// ============================================================
// Helpers
// ============================================================

fn join_errors(errors: &[ApiError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A failed create whose only complaint is "record already exists" is a
/// success: publish is a merge, not a strict create.
fn check_create_response<T>(
    name: &str,
    response: &ApiResponse<T>,
) -> Result<CreateOutcome, DnsError> {
    if response.success {
        return Ok(CreateOutcome::Created);
    }

    let already_exists = response
        .errors
        .iter()
        .any(|e| e.code == RECORD_ALREADY_EXISTS || e.message.contains("already exists"));

    if already_exists {
        Ok(CreateOutcome::AlreadyExists)
    } else {
        Err(DnsError::Api {
            name: name.to_string(),
            message: join_errors(&response.errors),
        })
    }
}

/// Only records whose name matches the composed FQDN or its wildcard
/// exactly are deleted; anything else in the listing is left untouched.
fn matching_record_ids(records: &[DnsRecord], fqdn: &str) -> Vec<String> {
    let wildcard = format!("*.{fqdn}");
    records
        .iter()
        .filter(|r| r.record_type == "CNAME" && (r.name == fqdn || r.name == wildcard))
        .map(|r| r.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_response(code: i64, message: &str) -> ApiResponse<DnsRecord> {
        ApiResponse {
            success: false,
            errors: vec![ApiError {
                code,
                message: message.to_string(),
            }],
            result: None,
        }
    }

    #[test]
    fn repeated_create_is_success() {
        let response = error_response(RECORD_ALREADY_EXISTS, "Record already exists.");
        assert_eq!(
            check_create_response("dev1", &response).unwrap(),
            CreateOutcome::AlreadyExists
        );

        let response = error_response(9999, "a CNAME with that name already exists");
        assert_eq!(
            check_create_response("dev1", &response).unwrap(),
            CreateOutcome::AlreadyExists
        );
    }

    #[test]
    fn other_create_errors_are_fatal() {
        let response = error_response(10000, "Authentication error");
        let err = check_create_response("dev1", &response).unwrap_err();
        assert!(matches!(err, DnsError::Api { ref name, .. } if name == "dev1"));
    }

    #[test]
    fn delete_only_touches_exact_name_matches() {
        let records = vec![
            DnsRecord {
                id: "a".to_string(),
                name: "dev1.example.com".to_string(),
                record_type: "CNAME".to_string(),
            },
            DnsRecord {
                id: "b".to_string(),
                name: "*.dev1.example.com".to_string(),
                record_type: "CNAME".to_string(),
            },
            DnsRecord {
                id: "c".to_string(),
                name: "other.example.com".to_string(),
                record_type: "CNAME".to_string(),
            },
            DnsRecord {
                id: "d".to_string(),
                name: "dev1.example.com".to_string(),
                record_type: "TXT".to_string(),
            },
        ];

        assert_eq!(
            matching_record_ids(&records, "dev1.example.com"),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn short_subdomain_delete_is_a_no_op() {
        let client = CloudflareDns::new(&CloudflareConfig { email: None }).unwrap();

        // Guard fires before any request is built, so a bogus token and no
        // network access must still succeed.
        client.delete_records("bogus", "example.com", "d").await.unwrap();
        client.delete_records("bogus", "example.com", "").await.unwrap();
    }

    #[test]
    fn create_request_shape() {
        let request = CreateRecordRequest {
            record_type: "CNAME",
            name: "*.dev1",
            content: "lb.provider.net",
            ttl: 1,
            proxied: false,
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"type\":\"CNAME\""));
        assert!(json.contains("\"proxied\":false"));
        assert!(json.contains("\"name\":\"*.dev1\""));
    }
}

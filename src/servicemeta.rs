//! Kubernetes load-balancer locator
//!
//! Finds the single `LoadBalancer` service labelled for the dev-space host
//! and waits for the cloud provider to assign it an ingress hostname.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::KubernetesConfig;
use crate::orchestrator::ServiceLocator;

/// Label that marks a service as belonging to a dev-space host.
pub const DEVSPACE_LABEL: &str = "for-devspace";

/// How long to wait for the cloud provider to assign a hostname.
pub const HOSTNAME_DEADLINE: Duration = Duration::from_secs(180);

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Errors from service discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no service found for host {host}; apply the label for-devspace={host} to the dev-space service")]
    NotFound { host: String },

    #[error("{count} services found for host {host}; exactly one may carry the for-devspace label")]
    Ambiguous { host: String, count: usize },

    #[error("service {service} is not a load balancer")]
    WrongServiceType { service: String },

    #[error("timed out waiting for a load-balancer hostname on service {service}")]
    HostnameTimeout { service: String },

    #[error("cancelled while waiting for a load-balancer hostname on service {service}")]
    Cancelled { service: String },

    #[error("could not build cluster config: {0}")]
    ClusterConfig(String),

    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),
}

/// Locator backed by the cluster API.
pub struct KubernetesServiceLocator {
    client: Client,
    namespace: String,
}

impl KubernetesServiceLocator {
    /// Build a client from the configured access mode: in-cluster service
    /// account, an explicit kubeconfig path, or inferred defaults.
    pub async fn connect(config: &KubernetesConfig) -> Result<Self, DiscoveryError> {
        let client = if config.use_cluster_config {
            let cluster = Config::incluster()
                .map_err(|e| DiscoveryError::ClusterConfig(e.to_string()))?;
            Client::try_from(cluster)?
        } else if let Some(path) = &config.kubeconfig {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| DiscoveryError::ClusterConfig(e.to_string()))?;
            let cluster =
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| DiscoveryError::ClusterConfig(e.to_string()))?;
            Client::try_from(cluster)?
        } else {
            Client::try_default().await?
        };

        Ok(Self {
            client,
            namespace: config.namespace.clone(),
        })
    }

    /// Find the single load-balancer service labelled for `host`.
    pub async fn find_service(&self, host: &str) -> Result<Service, DiscoveryError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = ListParams::default().labels(&format!("{DEVSPACE_LABEL}={host}"));

        let services = api.list(&params).await?;
        select_target_service(services.items, host)
    }

    /// Wait for `service` to expose an ingress hostname.
    ///
    /// Returns immediately if one is already present; otherwise polls the
    /// live status once per second until the hostname appears, the deadline
    /// elapses, or `cancel` fires.
    pub async fn await_hostname(
        &self,
        service: &Service,
        cancel: &CancellationToken,
    ) -> Result<String, DiscoveryError> {
        if let Some(hostname) = ingress_hostname(service) {
            return Ok(hostname);
        }

        let name = service.metadata.name.clone().unwrap_or_default();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);

        info!(service = %name, "waiting for load-balancer hostname");

        let poll_name = name.clone();
        wait_for_hostname(
            move || {
                let api = api.clone();
                let name = poll_name.clone();
                async move {
                    let live = api.get(&name).await?;
                    Ok(ingress_hostname(&live))
                }
            },
            HOSTNAME_DEADLINE,
            cancel,
            &name,
        )
        .await
    }
}

#[async_trait]
impl ServiceLocator for KubernetesServiceLocator {
    async fn discover_hostname(
        &self,
        host: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DiscoveryError> {
        let service = self.find_service(host).await?;
        self.await_hostname(&service, cancel).await
    }
}

/// Exactly one labelled service is required, and it must be a LoadBalancer.
fn select_target_service(
    mut services: Vec<Service>,
    host: &str,
) -> Result<Service, DiscoveryError> {
    match services.len() {
        0 => {
            return Err(DiscoveryError::NotFound {
                host: host.to_string(),
            })
        }
        1 => {}
        count => {
            return Err(DiscoveryError::Ambiguous {
                host: host.to_string(),
                count,
            })
        }
    }

    let service = services.remove(0);
    let service_type = service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .unwrap_or_default();

    if service_type != "LoadBalancer" {
        return Err(DiscoveryError::WrongServiceType {
            service: service.metadata.name.clone().unwrap_or_default(),
        });
    }

    Ok(service)
}

/// First non-empty ingress hostname on the service status, if any.
fn ingress_hostname(service: &Service) -> Option<String> {
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?
        .hostname
        .clone()
        .filter(|hostname| !hostname.is_empty())
}

/// Poll loop behind [`KubernetesServiceLocator::await_hostname`], generic
/// over the poll future so the timing contract is testable off-cluster.
async fn wait_for_hostname<F, Fut>(
    mut poll: F,
    deadline: Duration,
    cancel: &CancellationToken,
    service: &str,
) -> Result<String, DiscoveryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<String>, DiscoveryError>>,
{
    let expiry = tokio::time::sleep(deadline);
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(DiscoveryError::Cancelled {
                    service: service.to_string(),
                });
            }
            _ = &mut expiry => {
                return Err(DiscoveryError::HostnameTimeout {
                    service: service.to_string(),
                });
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                if let Some(hostname) = poll().await? {
                    debug!(%service, %hostname, "load-balancer hostname observed");
                    return Ok(hostname);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, ServiceSpec, ServiceStatus};
    use kube::core::ObjectMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn service(name: &str, service_type: &str, hostname: Option<&str>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(service_type.to_string()),
                ..Default::default()
            }),
            status: hostname.map(|h| ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        hostname: Some(h.to_string()),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn zero_matches_is_not_found() {
        let err = select_target_service(vec![], "dev1").unwrap_err();
        assert!(matches!(err, DiscoveryError::NotFound { ref host } if host == "dev1"));
        // The operator should be told which label to apply.
        assert!(err.to_string().contains("for-devspace=dev1"));
    }

    #[test]
    fn multiple_matches_is_ambiguous() {
        let services = vec![
            service("a", "LoadBalancer", None),
            service("b", "LoadBalancer", None),
        ];
        let err = select_target_service(services, "dev1").unwrap_err();
        assert!(matches!(err, DiscoveryError::Ambiguous { count: 2, .. }));
    }

    #[test]
    fn single_match_must_be_a_load_balancer() {
        let err =
            select_target_service(vec![service("web", "ClusterIP", None)], "dev1").unwrap_err();
        assert!(
            matches!(err, DiscoveryError::WrongServiceType { ref service } if service == "web")
        );

        let found =
            select_target_service(vec![service("web", "LoadBalancer", None)], "dev1").unwrap();
        assert_eq!(found.metadata.name.as_deref(), Some("web"));
    }

    #[test]
    fn empty_ingress_hostname_is_ignored() {
        assert_eq!(
            ingress_hostname(&service("web", "LoadBalancer", Some("lb.provider.net"))),
            Some("lb.provider.net".to_string())
        );
        assert_eq!(ingress_hostname(&service("web", "LoadBalancer", Some(""))), None);
        assert_eq!(ingress_hostname(&service("web", "LoadBalancer", None)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn polls_once_per_second_until_hostname_appears() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();

        let start = tokio::time::Instant::now();
        let hostname = wait_for_hostname(
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
                        Ok(Some("lb.provider.net".to_string()))
                    } else {
                        Ok(None)
                    }
                }
            },
            HOSTNAME_DEADLINE,
            &CancellationToken::new(),
            "web",
        )
        .await
        .unwrap();

        assert_eq!(hostname, "lb.provider.net");
        assert_eq!(polls.load(Ordering::SeqCst), 5);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_the_deadline() {
        let start = tokio::time::Instant::now();
        let err = wait_for_hostname(
            || async { Ok::<Option<String>, DiscoveryError>(None) },
            HOSTNAME_DEADLINE,
            &CancellationToken::new(),
            "web",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DiscoveryError::HostnameTimeout { ref service } if service == "web"));
        assert_eq!(start.elapsed(), HOSTNAME_DEADLINE);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_over_the_deadline() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(40)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        let err = wait_for_hostname(
            || async { Ok::<Option<String>, DiscoveryError>(None) },
            HOSTNAME_DEADLINE,
            &cancel,
            "web",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DiscoveryError::Cancelled { .. }));
        assert_eq!(start.elapsed(), Duration::from_secs(40));
    }
}

use k8s_openapi::api::networking::v1::Ingress;
use kube::Client;
use kube::api::WatchEvent;
use kube::ResourceExt;

use crate::errors::Result;
use crate::timeout::Timeout;
use super::object::ObjectStorage;
use super::watcher::KubernetesWatcher;

/// Whether an ingress has a load-balancer IP address assigned.
pub fn ingress_has_ip_address(ingress: &Ingress) -> bool {
    ingress
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .and_then(|entries| entries.first())
        .and_then(|entry| entry.ip.as_deref())
        .is_some_and(|ip| !ip.is_empty())
}

/// Storage layer for `Ingress` objects.
pub struct IngressStorage {
    storage: ObjectStorage<Ingress>,
}

impl IngressStorage {
    pub fn new(client: Client) -> Self {
        IngressStorage { storage: ObjectStorage::new(client) }
    }

    pub fn objects(&self) -> &ObjectStorage<Ingress> {
        &self.storage
    }

    /// Wait for an ingress to get an IP address assigned.
    ///
    /// The ingress is allowed to not exist yet, since it may be generated
    /// from a custom object after the watch starts.
    pub async fn wait_for_ip_address(
        &self,
        name: &str,
        namespace: &str,
        timeout: &Timeout,
    ) -> Result<()> {
        let ingress = self.storage.read(name, namespace, timeout).await?;
        let mut resource_version = None;
        if let Some(ingress) = ingress {
            if ingress_has_ip_address(&ingress) {
                return Ok(());
            }
            resource_version = ingress.resource_version();
        }

        let mut watcher = KubernetesWatcher::new(
            self.storage.api(namespace),
            "Ingress",
            Some(name),
            Some(namespace),
            None,
            resource_version,
            Some(timeout.clone()),
        );
        timeout
            .enforce(async {
                loop {
                    match watcher.next().await? {
                        WatchEvent::Added(ingress) | WatchEvent::Modified(ingress) => {
                            if ingress_has_ip_address(&ingress) {
                                return Ok(());
                            }
                        }
                        _ => continue,
                    }
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressStatus};

    #[test]
    fn test_ingress_has_ip_address() {
        let mut ingress = Ingress::default();
        assert!(!ingress_has_ip_address(&ingress));

        ingress.status = Some(IngressStatus { load_balancer: None });
        assert!(!ingress_has_ip_address(&ingress));

        ingress.status = Some(IngressStatus {
            load_balancer: Some(IngressLoadBalancerStatus {
                ingress: Some(vec![IngressLoadBalancerIngress {
                    ip: Some("10.0.0.1".to_string()),
                    ..Default::default()
                }]),
            }),
        });
        assert!(ingress_has_ip_address(&ingress));
    }
}

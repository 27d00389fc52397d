use std::collections::HashSet;

use futures::Stream;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, ResourceQuota, Secret, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::Client;
use kube::ResourceExt;

use crate::builder::lab::{LabObjectNames, LabObjects, LabStateObjects};
use crate::constants::LAB_STOP_GRACE_PERIOD;
use crate::errors::{ControllerError, Result};
use crate::models::kubernetes::PodPhase;
use crate::timeout::Timeout;
use super::namespace::NamespaceStorage;
use super::object::ObjectStorage;
use super::pod::PodStorage;

/// Kubernetes storage layer for user labs.
///
/// Wrangles the storage for the many object kinds making up a lab so the
/// lab manager reads as the state machine it is.
pub struct LabStorage {
    config_map: ObjectStorage<ConfigMap>,
    namespace: NamespaceStorage,
    network_policy: ObjectStorage<NetworkPolicy>,
    pod: PodStorage,
    pvc: ObjectStorage<PersistentVolumeClaim>,
    quota: ObjectStorage<ResourceQuota>,
    secret: ObjectStorage<Secret>,
    service: ObjectStorage<Service>,
}

impl LabStorage {
    pub fn new(client: Client) -> Self {
        LabStorage {
            config_map: ObjectStorage::new(client.clone()),
            namespace: NamespaceStorage::new(client.clone()),
            network_policy: ObjectStorage::new(client.clone()),
            pod: PodStorage::new(client.clone()),
            pvc: ObjectStorage::new(client.clone()),
            quota: ObjectStorage::new(client.clone()),
            secret: ObjectStorage::new(client.clone()),
            service: ObjectStorage::new(client),
        }
    }

    pub fn pods(&self) -> &PodStorage {
        &self.pod
    }

    /// Create all of the objects for a user's lab, in dependency order.
    pub async fn create(&self, objects: &LabObjects, timeout: &Timeout) -> Result<()> {
        let namespace = objects.namespace.name_any();
        self.namespace.create(&objects.namespace, timeout).await?;
        for pvc in &objects.pvcs {
            self.pvc.create(&namespace, pvc, timeout, false, None).await?;
        }
        self.config_map.create(&namespace, &objects.env_config_map, timeout, false, None).await?;
        for config_map in &objects.config_maps {
            self.config_map.create(&namespace, config_map, timeout, false, None).await?;
        }
        for secret in &objects.secrets {
            self.secret.create(&namespace, secret, timeout, false, None).await?;
        }
        if let Some(quota) = &objects.quota {
            self.quota.create(&namespace, quota, timeout, false, None).await?;
        }
        self.network_policy.create(&namespace, &objects.network_policy, timeout, false, None).await?;
        self.service.create(&namespace, &objects.service, timeout, false, None).await?;
        self.pod.objects().create(&namespace, &objects.pod, timeout, false, None).await?;
        Ok(())
    }

    /// Delete a lab pod with the short grace period a lab deserves, waiting
    /// for the deletion to finish.
    pub async fn delete_pod(&self, names: &LabObjectNames, timeout: &Timeout) -> Result<()> {
        self.pod
            .objects()
            .delete(
                &names.pod,
                &names.namespace,
                timeout,
                true,
                None,
                Some(LAB_STOP_GRACE_PERIOD),
            )
            .await
    }

    /// Delete a lab namespace and wait for it to go away.
    pub async fn delete_namespace(&self, name: &str, timeout: &Timeout) -> Result<()> {
        self.namespace.delete(name, timeout, true).await
    }

    /// Names of all namespaces starting with the lab prefix.
    pub async fn list_namespaces(&self, prefix: &str, timeout: &Timeout) -> Result<Vec<String>> {
        let namespaces = self.namespace.list(timeout).await?;
        Ok(namespaces
            .iter()
            .map(|namespace| namespace.name_any())
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    /// Read the objects needed to reconstruct lab state.
    ///
    /// Returns `None` if any required object is missing; the quota is
    /// optional since not every user has one.
    pub async fn read_lab_objects(
        &self,
        names: &LabObjectNames,
        timeout: &Timeout,
    ) -> Result<Option<LabStateObjects>> {
        let namespace = &names.namespace;
        let Some(env_config_map) =
            self.config_map.read(&names.env_config_map, namespace, timeout).await?
        else {
            return Ok(None);
        };
        let Some(pod) = self.pod.objects().read(&names.pod, namespace, timeout).await? else {
            return Ok(None);
        };
        let quota = self.quota.read(&names.quota, namespace, timeout).await?;
        Ok(Some(LabStateObjects { env_config_map, quota, pod }))
    }

    /// Current phase of the lab pod, or `None` if it does not exist.
    pub async fn read_pod_phase(
        &self,
        names: &LabObjectNames,
        timeout: &Timeout,
    ) -> Result<Option<PodPhase>> {
        let pod = self.pod.objects().read(&names.pod, &names.namespace, timeout).await?;
        Ok(pod.as_ref().map(PodPhase::from_pod))
    }

    /// Read a source secret, converting absence into the domain error.
    pub async fn read_secret(&self, name: &str, namespace: &str, timeout: &Timeout) -> Result<Secret> {
        self.secret.read(name, namespace, timeout).await?.ok_or_else(|| {
            ControllerError::MissingSecret {
                name: name.to_string(),
                namespace: namespace.to_string(),
                key: None,
            }
        })
    }

    /// Wait for the lab pod to leave Pending, returning the new phase.
    pub async fn wait_for_pod_start(
        &self,
        names: &LabObjectNames,
        timeout: &Timeout,
    ) -> Result<Option<PodPhase>> {
        let until_not = HashSet::from([PodPhase::Pending, PodPhase::Unknown]);
        self.pod.wait_for_phase(&names.pod, &names.namespace, &until_not, timeout).await
    }

    /// Stream Kubernetes event messages involving the lab pod.
    pub fn watch_pod_events(
        &self,
        names: &LabObjectNames,
        timeout: &Timeout,
    ) -> impl Stream<Item = String> + Send + 'static {
        self.pod.watch_pod_events(&names.pod, &names.namespace, timeout)
    }
}

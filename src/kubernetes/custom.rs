use std::time::Duration;

use kube::api::{ApiResource, DeleteParams, DynamicObject, GroupVersionKind, PostParams, PropagationPolicy, WatchEvent};
use kube::{Api, Client, ResourceExt};

use crate::errors::{ControllerError, KubernetesError, Result};
use crate::timeout::Timeout;
use super::watcher::KubernetesWatcher;

const DELETION_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Storage layer for `GafaelfawrIngress` custom objects.
///
/// Custom objects are handled dynamically rather than with typed bindings,
/// since the controller only creates and deletes them and never inspects
/// their spec.
pub struct GafaelfawrIngressStorage {
    client: Client,
    resource: ApiResource,
}

impl GafaelfawrIngressStorage {
    pub fn new(client: Client) -> Self {
        let gvk = GroupVersionKind::gvk("gafaelfawr.lsst.io", "v1alpha1", "GafaelfawrIngress");
        GafaelfawrIngressStorage { client, resource: ApiResource::from_gvk(&gvk) }
    }

    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }

    pub async fn create(
        &self,
        namespace: &str,
        body: &DynamicObject,
        timeout: &Timeout,
        replace: bool,
    ) -> Result<()> {
        let name = body.name_any();
        debug!(name = name.as_str(), namespace, "Creating GafaelfawrIngress");
        match self.try_create(namespace, body, timeout).await {
            Ok(()) => Ok(()),
            Err(ControllerError::Kubernetes(e)) if replace && e.status == Some(409) => {
                warn!(
                    name = name.as_str(),
                    namespace, "GafaelfawrIngress already exists, deleting and recreating"
                );
                self.delete(&name, namespace, timeout, true, None).await?;
                self.try_create(namespace, body, timeout).await
            }
            Err(e) => Err(e),
        }
    }

    async fn try_create(
        &self,
        namespace: &str,
        body: &DynamicObject,
        timeout: &Timeout,
    ) -> Result<()> {
        let api = self.api(namespace);
        let name = body.name_any();
        timeout
            .enforce(async {
                api.create(&PostParams::default(), body).await.map_err(|e| {
                    ControllerError::from(KubernetesError::from_error(
                        "Error creating object",
                        e,
                        "GafaelfawrIngress",
                        Some(namespace),
                        Some(&name),
                    ))
                })
            })
            .await?;
        Ok(())
    }

    pub async fn read(
        &self,
        name: &str,
        namespace: &str,
        timeout: &Timeout,
    ) -> Result<Option<DynamicObject>> {
        let api = self.api(namespace);
        timeout
            .enforce(async {
                match api.get(name).await {
                    Ok(object) => Ok(Some(object)),
                    Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
                    Err(e) => Err(ControllerError::from(KubernetesError::from_error(
                        "Error reading object",
                        e,
                        "GafaelfawrIngress",
                        Some(namespace),
                        Some(name),
                    ))),
                }
            })
            .await
    }

    pub async fn delete(
        &self,
        name: &str,
        namespace: &str,
        timeout: &Timeout,
        wait: bool,
        propagation_policy: Option<PropagationPolicy>,
    ) -> Result<()> {
        let api = self.api(namespace);
        let params = DeleteParams { propagation_policy, ..DeleteParams::default() };
        debug!(name, namespace, "Deleting GafaelfawrIngress");
        timeout
            .enforce(async {
                match api.delete(name, &params).await {
                    Ok(_) => Ok(()),
                    Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
                    Err(e) => Err(ControllerError::from(KubernetesError::from_error(
                        "Error deleting object",
                        e,
                        "GafaelfawrIngress",
                        Some(namespace),
                        Some(name),
                    ))),
                }
            })
            .await?;
        if wait {
            self.wait_for_deletion(name, namespace, timeout).await?;
        }
        Ok(())
    }

    pub async fn wait_for_deletion(
        &self,
        name: &str,
        namespace: &str,
        timeout: &Timeout,
    ) -> Result<()> {
        let Some(object) = self.read(name, namespace, timeout).await? else {
            return Ok(());
        };

        let headroom = timeout.left()?.saturating_sub(DELETION_CHECK_TIMEOUT);
        let watch_timeout = timeout.partial(headroom)?;
        let mut watcher = KubernetesWatcher::new(
            self.api(namespace),
            "GafaelfawrIngress",
            Some(name),
            Some(namespace),
            None,
            object.resource_version(),
            Some(watch_timeout.clone()),
        );
        let result = watch_timeout
            .enforce(async {
                loop {
                    if let WatchEvent::Deleted(_) = watcher.next().await? {
                        return Ok(());
                    }
                }
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(ControllerError::Timeout(e)) => {
                let read_timeout = timeout.partial(DELETION_CHECK_TIMEOUT)?;
                if self.read(name, namespace, &read_timeout).await?.is_none() {
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
            Err(e) => Err(e),
        }
    }
}

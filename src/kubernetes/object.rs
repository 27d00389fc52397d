use std::fmt::Debug;
use std::time::Duration;

use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, ListParams, PostParams, PropagationPolicy, WatchEvent};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::{ControllerError, KubernetesError, Result};
use crate::timeout::Timeout;
use super::watcher::KubernetesWatcher;

/// Headroom reserved at the end of a deletion watch for one final read, to
/// catch deletes that raced with a watch restart.
const DELETION_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Generic storage layer for one namespaced Kubernetes object type.
///
/// Wraps create, read, list, and delete with logging, exception conversion,
/// and waiting for deletion to complete, so that the per-kind storage used
/// by the services stays thin.
pub struct ObjectStorage<K> {
    client: Client,
    kind: String,
    _marker: std::marker::PhantomData<K>,
}

impl<K> ObjectStorage<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default,
{
    pub fn new(client: Client) -> Self {
        let kind = K::kind(&K::DynamicType::default()).to_string();
        ObjectStorage { client, kind, _marker: std::marker::PhantomData }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Create a new object.
    ///
    /// With `replace`, a 409 conflict deletes the existing object (waiting
    /// for the deletion) and then retries the create once.
    pub async fn create(
        &self,
        namespace: &str,
        body: &K,
        timeout: &Timeout,
        replace: bool,
        propagation_policy: Option<PropagationPolicy>,
    ) -> Result<()> {
        let name = body.name_any();
        debug!(kind = self.kind.as_str(), name = name.as_str(), namespace, "Creating object");
        match self.try_create(namespace, body, timeout).await {
            Ok(()) => Ok(()),
            Err(ControllerError::Kubernetes(e)) if replace && e.status == Some(409) => {
                warn!(
                    kind = self.kind.as_str(),
                    name = name.as_str(),
                    namespace,
                    "Object already exists, deleting and recreating"
                );
                self.delete(&name, namespace, timeout, true, propagation_policy, None)
                    .await?;
                self.try_create(namespace, body, timeout).await
            }
            Err(e) => Err(e),
        }
    }

    async fn try_create(&self, namespace: &str, body: &K, timeout: &Timeout) -> Result<()> {
        let api = self.api(namespace);
        let name = body.name_any();
        timeout
            .enforce(async {
                api.create(&PostParams::default(), body).await.map_err(|e| {
                    ControllerError::from(KubernetesError::from_error(
                        "Error creating object",
                        e,
                        &self.kind,
                        Some(namespace),
                        Some(&name),
                    ))
                })
            })
            .await?;
        Ok(())
    }

    /// Read an object, returning `None` if it does not exist.
    pub async fn read(&self, name: &str, namespace: &str, timeout: &Timeout) -> Result<Option<K>> {
        let api = self.api(namespace);
        timeout
            .enforce(async {
                match api.get(name).await {
                    Ok(object) => Ok(Some(object)),
                    Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
                    Err(e) => Err(ControllerError::from(KubernetesError::from_error(
                        "Error reading object",
                        e,
                        &self.kind,
                        Some(namespace),
                        Some(name),
                    ))),
                }
            })
            .await
    }

    pub async fn list(
        &self,
        namespace: &str,
        timeout: &Timeout,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>> {
        let api = self.api(namespace);
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let objects = timeout
            .enforce(async {
                api.list(&params).await.map_err(|e| {
                    ControllerError::from(KubernetesError::from_error(
                        "Error listing objects",
                        e,
                        &self.kind,
                        Some(namespace),
                        None,
                    ))
                })
            })
            .await?;
        Ok(objects.items)
    }

    /// Delete an object. A missing object is silently treated as success.
    pub async fn delete(
        &self,
        name: &str,
        namespace: &str,
        timeout: &Timeout,
        wait: bool,
        propagation_policy: Option<PropagationPolicy>,
        grace_period: Option<Duration>,
    ) -> Result<()> {
        let api = self.api(namespace);
        let params = DeleteParams {
            propagation_policy,
            grace_period_seconds: grace_period.map(|g| g.as_secs() as u32),
            ..DeleteParams::default()
        };
        debug!(kind = self.kind.as_str(), name, namespace, "Deleting object");
        timeout
            .enforce(async {
                match api.delete(name, &params).await {
                    Ok(_) => Ok(()),
                    Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
                    Err(e) => Err(ControllerError::from(KubernetesError::from_error(
                        "Error deleting object",
                        e,
                        &self.kind,
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

    /// Wait for an object to disappear.
    ///
    /// Watches from the object's current resource version. If the watch
    /// times out, one final read decides whether the delete was simply
    /// missed during a watch restart.
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
            &self.kind,
            Some(name),
            Some(namespace),
            None,
            object.meta().resource_version.clone(),
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

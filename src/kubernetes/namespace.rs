use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{DeleteParams, ListParams, PostParams, WatchEvent};
use kube::{Api, Client, ResourceExt};

use crate::errors::{ControllerError, KubernetesError, Result};
use crate::timeout::Timeout;
use super::watcher::KubernetesWatcher;

const DELETION_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Storage layer for `Namespace` objects.
///
/// Namespaces are cluster-scoped and so cannot share the generic namespaced
/// object storage.
pub struct NamespaceStorage {
    client: Client,
}

impl NamespaceStorage {
    pub fn new(client: Client) -> Self {
        NamespaceStorage { client }
    }

    fn api(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    pub async fn create(&self, body: &Namespace, timeout: &Timeout) -> Result<()> {
        let name = body.name_any();
        debug!(name = name.as_str(), "Creating namespace");
        timeout
            .enforce(async {
                self.api().create(&PostParams::default(), body).await.map_err(|e| {
                    ControllerError::from(KubernetesError::from_error(
                        "Error creating namespace",
                        e,
                        "Namespace",
                        None,
                        Some(&name),
                    ))
                })
            })
            .await?;
        Ok(())
    }

    pub async fn read(&self, name: &str, timeout: &Timeout) -> Result<Option<Namespace>> {
        timeout
            .enforce(async {
                match self.api().get(name).await {
                    Ok(namespace) => Ok(Some(namespace)),
                    Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
                    Err(e) => Err(ControllerError::from(KubernetesError::from_error(
                        "Error reading namespace",
                        e,
                        "Namespace",
                        None,
                        Some(name),
                    ))),
                }
            })
            .await
    }

    pub async fn list(&self, timeout: &Timeout) -> Result<Vec<Namespace>> {
        let namespaces = timeout
            .enforce(async {
                self.api().list(&ListParams::default()).await.map_err(|e| {
                    ControllerError::from(KubernetesError::from_error(
                        "Error listing namespaces",
                        e,
                        "Namespace",
                        None,
                        None,
                    ))
                })
            })
            .await?;
        Ok(namespaces.items)
    }

    /// Delete a namespace, optionally waiting for it to disappear. A missing
    /// namespace is treated as success.
    pub async fn delete(&self, name: &str, timeout: &Timeout, wait: bool) -> Result<()> {
        debug!(name, "Deleting namespace");
        timeout
            .enforce(async {
                match self.api().delete(name, &DeleteParams::default()).await {
                    Ok(_) => Ok(()),
                    Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
                    Err(e) => Err(ControllerError::from(KubernetesError::from_error(
                        "Error deleting namespace",
                        e,
                        "Namespace",
                        None,
                        Some(name),
                    ))),
                }
            })
            .await?;
        if wait {
            self.wait_for_deletion(name, timeout).await?;
        }
        Ok(())
    }

    /// Wait for a namespace deletion to complete, with a final read to catch
    /// deletes missed during a watch restart.
    pub async fn wait_for_deletion(&self, name: &str, timeout: &Timeout) -> Result<()> {
        let Some(namespace) = self.read(name, timeout).await? else {
            return Ok(());
        };

        let headroom = timeout.left()?.saturating_sub(DELETION_CHECK_TIMEOUT);
        let watch_timeout = timeout.partial(headroom)?;
        let mut watcher = KubernetesWatcher::new(
            self.api(),
            "Namespace",
            Some(name),
            None,
            None,
            namespace.resource_version(),
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
                if self.read(name, &read_timeout).await?.is_none() {
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
            Err(e) => Err(e),
        }
    }
}

use std::collections::HashSet;

use futures::Stream;
use k8s_openapi::api::core::v1::{Event as CoreEvent, Pod};
use kube::api::WatchEvent;
use kube::{Api, Client, ResourceExt};

use crate::errors::{ControllerError, Result};
use crate::models::kubernetes::{PodChange, PodPhase};
use crate::timeout::Timeout;
use super::object::ObjectStorage;
use super::watcher::KubernetesWatcher;

/// Storage layer for `Pod` objects.
///
/// Adds the watch-based primitives the services need on top of the generic
/// object storage: waiting for phase changes, streaming involved events, and
/// watching a namespace for pod changes.
pub struct PodStorage {
    storage: ObjectStorage<Pod>,
    client: Client,
}

impl PodStorage {
    pub fn new(client: Client) -> Self {
        PodStorage { storage: ObjectStorage::new(client.clone()), client }
    }

    pub fn objects(&self) -> &ObjectStorage<Pod> {
        &self.storage
    }

    /// Wait for a pod to exit a set of phases and return the new phase, or
    /// `None` if the pod disappeared.
    ///
    /// `Unknown` gets no special handling beyond whatever the caller puts in
    /// `until_not`; we rely on the timeout and trust Kubernetes to
    /// eventually figure the phase out.
    pub async fn wait_for_phase(
        &self,
        name: &str,
        namespace: &str,
        until_not: &HashSet<PodPhase>,
        timeout: &Timeout,
    ) -> Result<Option<PodPhase>> {
        debug!(name, namespace, "Waiting for pod phase change");

        // The pod may already be in an acceptable phase, in which case there
        // is nothing to watch. Otherwise watch from its current resource
        // version so no change is missed.
        let Some(pod) = self.storage.read(name, namespace, timeout).await? else {
            return Ok(None);
        };
        let phase = PodPhase::from_pod(&pod);
        if !until_not.contains(&phase) {
            return Ok(Some(phase));
        }

        let mut watcher = KubernetesWatcher::new(
            self.storage.api(namespace),
            "Pod",
            Some(name),
            Some(namespace),
            None,
            pod.resource_version(),
            Some(timeout.clone()),
        );
        timeout
            .enforce(async {
                loop {
                    match watcher.next().await? {
                        WatchEvent::Deleted(_) => return Ok(None),
                        WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
                            let phase = PodPhase::from_pod(&pod);
                            if !until_not.contains(&phase) {
                                debug!(name, namespace, status = %phase, "Pod phase changed");
                                return Ok(Some(phase));
                            }
                        }
                        _ => continue,
                    }
                }
            })
            .await
    }

    /// Wait for a pod to finish running and then delete it.
    ///
    /// Does not wait for the deletion itself to complete.
    pub async fn delete_after_completion(
        &self,
        name: &str,
        namespace: &str,
        timeout: &Timeout,
    ) -> Result<()> {
        let until_not =
            HashSet::from([PodPhase::Unknown, PodPhase::Pending, PodPhase::Running]);
        let phase = self.wait_for_phase(name, namespace, &until_not, timeout).await?;
        match phase {
            None => {
                warn!(name, namespace, "Pod was already missing");
                return Ok(());
            }
            Some(PodPhase::Succeeded) => debug!(name, namespace, "Removing succeeded pod"),
            Some(phase) => warn!(name, namespace, phase = %phase, "Removing pod"),
        }
        self.storage.delete(name, namespace, timeout, false, None, None).await
    }

    /// Stream the messages of Kubernetes events involving a pod.
    ///
    /// The stream ends when the timeout expires or the watch fails; watching
    /// events is only ever a best-effort observation, so errors are logged
    /// and swallowed here rather than surfaced.
    pub fn watch_pod_events(
        &self,
        name: &str,
        namespace: &str,
        timeout: &Timeout,
    ) -> impl Stream<Item = String> + Send + 'static {
        let api: Api<CoreEvent> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("involvedObject.name={name}");
        let watcher = KubernetesWatcher::new(
            api,
            "Event",
            None,
            Some(namespace),
            Some(&selector),
            None,
            Some(timeout.clone()),
        );
        futures::stream::unfold(watcher, |mut watcher| async move {
            loop {
                match watcher.next().await {
                    Ok(WatchEvent::Added(event)) | Ok(WatchEvent::Modified(event)) => {
                        if let Some(message) = event.message {
                            return Some((message, watcher));
                        }
                    }
                    Ok(_) => continue,
                    Err(ControllerError::Timeout(_)) => return None,
                    Err(error) => {
                        debug!(error = %error, "Error watching pod events");
                        return None;
                    }
                }
            }
        })
    }

    /// Watch a namespace for pod changes.
    ///
    /// Yields the current phase of any modified pod, forever, restarting the
    /// underlying watch as needed. Errors are yielded so the caller can
    /// decide how to back off.
    pub fn watch_pod_changes(
        &self,
        namespace: &str,
    ) -> impl Stream<Item = Result<PodChange>> + Send + 'static {
        let watcher = KubernetesWatcher::new(
            self.storage.api(namespace),
            "Pod",
            None,
            Some(namespace),
            None,
            None,
            None,
        );
        futures::stream::unfold(watcher, |mut watcher| async move {
            loop {
                match watcher.next().await {
                    Ok(WatchEvent::Modified(pod)) => {
                        let phase = PodPhase::from_pod(&pod);
                        debug!(name = pod.name_any().as_str(), phase = %phase, "Saw modified pod");
                        return Some((Ok(PodChange { pod, phase }), watcher));
                    }
                    Ok(_) => continue,
                    Err(error) => return Some((Err(error), watcher)),
                }
            }
        })
    }
}

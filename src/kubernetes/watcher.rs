use std::fmt::Debug;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use kube::Api;
use kube::api::{WatchEvent, WatchParams};
use serde::de::DeserializeOwned;

use crate::constants::KUBERNETES_WATCH_RECONNECT_TIMEOUT;
use crate::errors::{ControllerError, KubernetesError};
use crate::timeout::Timeout;

/// Wrapper around the Kubernetes watch API implementing the restart rules
/// that make long watches reliable.
///
/// Every restart of the underlying list-watch call refreshes the per-call
/// request timeout from the remaining cumulative budget. A 410 Gone with a
/// resource version in play drops the resource version and retries; a 410
/// without one sleeps a second and retries. The server closing the stream
/// early (its internal caps are lower than ours) simply restarts the watch.
/// The per-call timeout is additionally capped by a reconnect timeout so
/// that long-lived watches proactively restart rather than stall.
pub struct KubernetesWatcher<K> {
    api: Api<K>,
    kind: String,
    name: Option<String>,
    namespace: Option<String>,
    params: WatchParams,
    resource_version: String,
    timeout: Option<Timeout>,
    stream: Option<BoxStream<'static, Result<WatchEvent<K>, kube::Error>>>,
}

impl<K> KubernetesWatcher<K>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    /// Watch objects through an API handle.
    ///
    /// `name` restricts the watch to a single object, `field_selector` to an
    /// arbitrary field expression (the two are mutually exclusive; `name`
    /// wins). A `resource_version` of `None` starts from the present.
    pub fn new(
        api: Api<K>,
        kind: &str,
        name: Option<&str>,
        namespace: Option<&str>,
        field_selector: Option<&str>,
        resource_version: Option<String>,
        timeout: Option<Timeout>,
    ) -> Self {
        let mut params = WatchParams::default();
        if let Some(name) = name {
            params = params.fields(&format!("metadata.name={name}"));
        } else if let Some(selector) = field_selector {
            params = params.fields(selector);
        }
        KubernetesWatcher {
            api,
            kind: kind.to_string(),
            name: name.map(str::to_string),
            namespace: namespace.map(str::to_string),
            params,
            resource_version: resource_version.unwrap_or_else(|| "0".to_string()),
            timeout,
            stream: None,
        }
    }

    /// Return the next added, modified, or deleted event.
    ///
    /// Restarts the underlying watch as needed per the rules above. Runs
    /// until an event arrives, the cumulative timeout expires, or the API
    /// returns a non-retriable error.
    pub async fn next(&mut self) -> Result<WatchEvent<K>, ControllerError> {
        loop {
            if self.stream.is_none() {
                self.connect().await?;
            }
            let stream = self.stream.as_mut().expect("watch stream connected");
            match stream.next().await {
                Some(Ok(WatchEvent::Bookmark(_))) => continue,
                Some(Ok(WatchEvent::Error(status))) => {
                    self.stream = None;
                    if status.code == 410 {
                        self.handle_gone().await;
                        continue;
                    }
                    let error = kube::Error::Api(status);
                    return Err(self.wrap("Error watching objects", error).into());
                }
                Some(Ok(event)) => {
                    if let Some(version) = self.event_resource_version(&event) {
                        self.resource_version = version;
                    }
                    return Ok(event);
                }
                Some(Err(error)) => {
                    self.stream = None;
                    if let kube::Error::Api(status) = &error
                        && status.code == 410
                    {
                        self.handle_gone().await;
                        continue;
                    }
                    return Err(self.wrap("Error watching objects", error).into());
                }
                // The server ended the stream without error, which happens
                // before our deadline when its internal caps are lower.
                // Restart with a refreshed per-call timeout.
                None => self.stream = None,
            }
        }
    }

    async fn connect(&mut self) -> Result<(), ControllerError> {
        let mut per_call = KUBERNETES_WATCH_RECONNECT_TIMEOUT;
        if let Some(timeout) = &self.timeout {
            per_call = per_call.min(timeout.left()?);
        }
        let params = self.params.clone().timeout(per_call.as_secs().max(1) as u32);
        match self.api.watch(&params, &self.resource_version).await {
            Ok(stream) => {
                self.stream = Some(stream.boxed());
                Ok(())
            }
            Err(error) => {
                if let kube::Error::Api(status) = &error
                    && status.code == 410
                {
                    self.handle_gone().await;
                    return Ok(());
                }
                Err(self.wrap("Error starting watch", error).into())
            }
        }
    }

    /// Handle a 410 Gone. With a resource version in play, drop it and
    /// retry immediately; we may miss events between the error and the
    /// retry, which callers guard against with a final read. Without one,
    /// pause briefly so a misbehaving control plane cannot drive a tight
    /// retry loop.
    async fn handle_gone(&mut self) {
        if self.resource_version != "0" {
            info!(
                kind = self.kind.as_str(),
                version = self.resource_version.as_str(),
                "Resource version expired, retrying watch"
            );
            self.resource_version = "0".to_string();
        } else {
            info!(kind = self.kind.as_str(), "Watch expired (no resource version), retrying");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    fn event_resource_version(&self, event: &WatchEvent<K>) -> Option<String> {
        let object = match event {
            WatchEvent::Added(object)
            | WatchEvent::Modified(object)
            | WatchEvent::Deleted(object) => object,
            _ => return None,
        };
        object.meta().resource_version.clone()
    }

    fn wrap(&self, message: &str, error: kube::Error) -> KubernetesError {
        KubernetesError::from_error(
            message,
            error,
            &self.kind,
            self.namespace.as_deref(),
            self.name.as_deref(),
        )
    }
}

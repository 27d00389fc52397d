use std::collections::HashMap;

use futures::Stream;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use kube::Client;
use kube::ResourceExt;
use kube::api::PropagationPolicy;

use crate::errors::Result;
use crate::models::fileserver::{FileserverObjects, FileserverStateObjects};
use crate::models::kubernetes::{PodChange, PodPhase};
use crate::timeout::Timeout;
use super::custom::GafaelfawrIngressStorage;
use super::ingress::IngressStorage;
use super::namespace::NamespaceStorage;
use super::object::ObjectStorage;
use super::pod::PodStorage;

/// Kubernetes storage layer for user file servers.
pub struct FileserverStorage {
    gafaelfawr: GafaelfawrIngressStorage,
    ingress: IngressStorage,
    job: ObjectStorage<Job>,
    namespace: NamespaceStorage,
    pod: PodStorage,
    pvc: ObjectStorage<PersistentVolumeClaim>,
    service: ObjectStorage<Service>,
}

impl FileserverStorage {
    pub fn new(client: Client) -> Self {
        FileserverStorage {
            gafaelfawr: GafaelfawrIngressStorage::new(client.clone()),
            ingress: IngressStorage::new(client.clone()),
            job: ObjectStorage::new(client.clone()),
            namespace: NamespaceStorage::new(client.clone()),
            pod: PodStorage::new(client.clone()),
            pvc: ObjectStorage::new(client.clone()),
            service: ObjectStorage::new(client),
        }
    }

    /// Create the objects for a file server and wait for it to be usable:
    /// the generated ingress must have an IP and the job's pod must get out
    /// of Pending.
    pub async fn create(
        &self,
        namespace: &str,
        objects: &FileserverObjects,
        timeout: &Timeout,
    ) -> Result<()> {
        for pvc in &objects.pvcs {
            self.pvc.create(namespace, pvc, timeout, true, None).await?;
        }
        self.gafaelfawr.create(namespace, &objects.ingress, timeout, true).await?;
        self.service.create(namespace, &objects.service, timeout, true, None).await?;
        self.job
            .create(namespace, &objects.job, timeout, true, Some(PropagationPolicy::Foreground))
            .await?;

        // The ingress usually takes the longest.
        let name = objects.ingress.name_any();
        self.ingress.wait_for_ip_address(&name, namespace, timeout).await?;

        let job_name = objects.job.name_any();
        let pod = self.wait_for_pod_creation(&job_name, namespace, timeout).await?;
        let until_not = std::collections::HashSet::from([PodPhase::Unknown, PodPhase::Pending]);
        self.pod.wait_for_phase(&pod.name_any(), namespace, &until_not, timeout).await?;
        Ok(())
    }

    /// Delete a file server's objects in an order that avoids stranding the
    /// generated ingress: the custom object first (foreground, waiting),
    /// then the cascaded ingress, then the service, job, and labeled PVCs.
    pub async fn delete(
        &self,
        name: &str,
        namespace: &str,
        username: &str,
        timeout: &Timeout,
    ) -> Result<()> {
        self.gafaelfawr
            .delete(name, namespace, timeout, true, Some(PropagationPolicy::Foreground))
            .await?;
        self.ingress.objects().wait_for_deletion(name, namespace, timeout).await?;
        self.service.delete(name, namespace, timeout, true, None, None).await?;
        self.job
            .delete(name, namespace, timeout, true, Some(PropagationPolicy::Foreground), None)
            .await?;
        let selector = format!("nublado.lsst.io/user={username}");
        for pvc in self.pvc.list(namespace, timeout, Some(&selector)).await? {
            self.pvc.delete(&pvc.name_any(), namespace, timeout, false, None, None).await?;
        }
        Ok(())
    }

    pub async fn namespace_exists(&self, name: &str, timeout: &Timeout) -> Result<bool> {
        Ok(self.namespace.read(name, timeout).await?.is_some())
    }

    /// Read the objects for all running file servers, mapped by username.
    ///
    /// All of a file server's objects share the name of its `Job`.
    pub async fn read_fileserver_state(
        &self,
        namespace: &str,
        timeout: &Timeout,
    ) -> Result<HashMap<String, FileserverStateObjects>> {
        let selector = "nublado.lsst.io/category=fileserver";
        let jobs = self.job.list(namespace, timeout, Some(selector)).await?;

        let mut state: HashMap<String, FileserverStateObjects> = HashMap::new();
        for job in jobs {
            let Some(username) =
                job.labels().get("nublado.lsst.io/user").cloned()
            else {
                continue;
            };
            if let Some(other) = state.get(&username) {
                warn!(
                    user = username.as_str(),
                    namespace,
                    first = other.job.name_any().as_str(),
                    second = job.name_any().as_str(),
                    "Duplicate jobs for user, ignoring the second"
                );
                continue;
            }
            let pod = self.pod_for_job(&job.name_any(), namespace, timeout).await?;
            let ingress = self.ingress.objects().read(&job.name_any(), namespace, timeout).await?;
            state.insert(username, FileserverStateObjects { job, pod, ingress });
        }
        Ok(state)
    }

    /// Watch the file server namespace for pod changes, forever.
    pub fn watch_pods(
        &self,
        namespace: &str,
    ) -> impl Stream<Item = Result<PodChange>> + Send + 'static {
        self.pod.watch_pod_changes(namespace)
    }

    /// Find the pod created for a job, allowing for the job controller not
    /// having created it yet.
    async fn wait_for_pod_creation(
        &self,
        job_name: &str,
        namespace: &str,
        timeout: &Timeout,
    ) -> Result<Pod> {
        loop {
            if let Some(pod) = self.pod_for_job(job_name, namespace, timeout).await? {
                return Ok(pod);
            }
            timeout.left()?;
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
    }

    async fn pod_for_job(
        &self,
        job_name: &str,
        namespace: &str,
        timeout: &Timeout,
    ) -> Result<Option<Pod>> {
        let selector = format!("job-name={job_name}");
        let mut pods =
            self.pod.objects().list(namespace, timeout, Some(&selector)).await?;
        if pods.len() > 1 {
            warn!(namespace, job = job_name, "Multiple pods for job, ignoring them all");
            return Ok(None);
        }
        Ok(pods.pop())
    }
}

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::DynamicObject;

/// The Kubernetes objects making up one user's file server.
#[derive(Debug, Clone)]
pub struct FileserverObjects {
    /// `GafaelfawrIngress` custom object from which the real ingress is
    /// generated.
    pub ingress: DynamicObject,
    pub service: Service,
    pub job: Job,
    pub pvcs: Vec<PersistentVolumeClaim>,
}

/// Objects discovered for a possibly-running file server during
/// reconciliation.
#[derive(Debug, Clone)]
pub struct FileserverStateObjects {
    pub job: Job,
    pub pod: Option<Pod>,
    pub ingress: Option<Ingress>,
}

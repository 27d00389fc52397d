use k8s_openapi::api::core::v1::{ContainerImage, Pod, Taint, Toleration as K8sToleration};
use serde_derive::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::rspimage::RspImageCollection;

/// Phase of a Kubernetes pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Phase from a pod status, treating anything unparseable as `Unknown`.
    pub fn from_pod(pod: &Pod) -> PodPhase {
        pod.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .and_then(|p| p.parse().ok())
            .unwrap_or(PodPhase::Unknown)
    }
}

/// A change observed to a pod by a namespace watch.
#[derive(Debug, Clone)]
pub struct PodChange {
    pub pod: Pod,
    pub phase: PodPhase,
}

/// Operator for a toleration in the controller configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum TolerationOperator {
    Exists,
    Equal,
}

/// Effect of a toleration in the controller configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum TolerationEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

/// Toleration applied to spawned pods, also used to decide which nodes are
/// eligible for prepulling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Toleration {
    #[serde(default)]
    pub key: Option<String>,
    pub operator: TolerationOperator,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub effect: Option<TolerationEffect>,
    #[serde(default)]
    pub toleration_seconds: Option<i64>,
}

impl Toleration {
    pub fn to_kubernetes(&self) -> K8sToleration {
        K8sToleration {
            key: self.key.clone(),
            operator: Some(self.operator.to_string()),
            value: self.value.clone(),
            effect: self.effect.map(|e| e.to_string()),
            toleration_seconds: self.toleration_seconds,
        }
    }

    /// Whether this toleration matches a taint for prepull eligibility.
    ///
    /// Temporary tolerations never count, since prepulling to a node that
    /// will evict the image shortly afterwards is wasted work.
    pub fn matches(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect
            && effect.to_string() != taint.effect
        {
            return false;
        }
        if self.toleration_seconds.is_some() && taint.effect == "NoExecute" {
            return false;
        }
        match self.operator {
            TolerationOperator::Exists => match &self.key {
                Some(key) => *key == taint.key,
                None => true,
            },
            TolerationOperator::Equal => match (&self.key, &self.value) {
                (Some(key), Some(value)) => {
                    *key == taint.key && Some(value.as_str()) == taint.value.as_deref()
                }
                _ => false,
            },
        }
    }
}

/// Whether a node can run controller-spawned pods, with an explanation when
/// it cannot.
#[derive(Debug, Clone, Default)]
pub struct NodeToleration {
    pub eligible: bool,
    pub comment: Option<String>,
}

/// A cached image as reported in a node's status.
#[derive(Debug, Clone)]
pub struct KubernetesNodeImage {
    /// All references by which the image is known on the node.
    pub references: Vec<String>,
    /// Digest of the image, if any reference pins one.
    pub digest: Option<String>,
}

impl KubernetesNodeImage {
    pub fn from_container_image(image: &ContainerImage) -> Self {
        let references = image.names.clone().unwrap_or_default();
        let digest = references
            .iter()
            .find_map(|r| r.split_once('@').map(|(_, digest)| digest.to_string()));
        KubernetesNodeImage { references, digest }
    }
}

/// Everything the image catalog tracks about one node.
#[derive(Debug, Clone)]
pub struct NodeData {
    pub name: String,
    pub eligible: bool,
    pub comment: Option<String>,
    /// Images of interest cached on this node.
    pub images: RspImageCollection,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taint(key: &str, value: Option<&str>, effect: &str) -> Taint {
        Taint {
            key: key.to_string(),
            value: value.map(str::to_string),
            effect: effect.to_string(),
            time_added: None,
        }
    }

    #[test]
    fn test_toleration_matching() {
        let toleration = Toleration {
            key: Some("dedicated".to_string()),
            operator: TolerationOperator::Equal,
            value: Some("jupyter".to_string()),
            effect: Some(TolerationEffect::NoSchedule),
            toleration_seconds: None,
        };
        assert!(toleration.matches(&taint("dedicated", Some("jupyter"), "NoSchedule")));
        assert!(!toleration.matches(&taint("dedicated", Some("other"), "NoSchedule")));
        assert!(!toleration.matches(&taint("dedicated", Some("jupyter"), "NoExecute")));

        let exists = Toleration {
            key: None,
            operator: TolerationOperator::Exists,
            value: None,
            effect: None,
            toleration_seconds: None,
        };
        assert!(exists.matches(&taint("anything", None, "NoSchedule")));

        // Time-bounded tolerations do not make a NoExecute taint eligible.
        let temporary = Toleration {
            key: None,
            operator: TolerationOperator::Exists,
            value: None,
            effect: None,
            toleration_seconds: Some(300),
        };
        assert!(!temporary.matches(&taint("anything", None, "NoExecute")));
        assert!(temporary.matches(&taint("anything", None, "NoSchedule")));
    }

    #[test]
    fn test_node_image_digest() {
        let image = ContainerImage {
            names: Some(vec![
                "lighthouse.ceres/library/sketchbook:w_2077_44".to_string(),
                "lighthouse.ceres/library/sketchbook@sha256:5678".to_string(),
            ]),
            size_bytes: None,
        };
        let parsed = KubernetesNodeImage::from_container_image(&image);
        assert_eq!(parsed.digest.as_deref(), Some("sha256:5678"));
    }
}

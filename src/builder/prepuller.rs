use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, LocalObjectReference, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::kubernetes::metadata::MetadataStorage;
use crate::models::rspimage::RspImage;

/// Kubernetes object names may be at most 253 characters long.
const MAX_POD_NAME_LENGTH: usize = 253;

static POD_NAME_INVALID_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w.-]").unwrap());

/// Construct the Kubernetes objects used by the prepuller.
pub struct PrepullerBuilder {
    pull_secret: Option<String>,
}

impl PrepullerBuilder {
    pub fn new(pull_secret: Option<String>) -> Self {
        PrepullerBuilder { pull_secret }
    }

    /// The pod object for one prepull.
    ///
    /// The pod does nothing but run `/bin/true` with the target image,
    /// pinned to the node being pulled to. It carries an owner reference to
    /// the controller pod so the cluster garbage-collects leftovers.
    pub fn build_pod(&self, image: &RspImage, node: &str, metadata: &MetadataStorage) -> Pod {
        let pull_secrets = self
            .pull_secret
            .as_ref()
            .map(|name| vec![LocalObjectReference { name: name.clone() }]);
        Pod {
            metadata: ObjectMeta {
                name: Some(self.build_pod_name(image, node)),
                labels: Some(BTreeMap::from([(
                    "nublado.lsst.io/category".to_string(),
                    "prepuller".to_string(),
                )])),
                owner_references: metadata.owner_reference().map(|o| vec![o.clone()]),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "prepull".to_string(),
                    command: Some(vec!["/bin/true".to_string()]),
                    image: Some(image.reference_with_digest()),
                    working_dir: Some("/tmp".to_string()),
                    ..Container::default()
                }],
                image_pull_secrets: pull_secrets,
                node_name: Some(node.to_string()),
                restart_policy: Some("Never".to_string()),
                ..PodSpec::default()
            }),
            ..Pod::default()
        }
    }

    /// Pod name embedding the tag and node for easier debugging.
    fn build_pod_name(&self, image: &RspImage, node: &str) -> String {
        let tag_part = image.tag_name().replace('_', "-");
        let tag_part = POD_NAME_INVALID_CHARS.replace_all(&tag_part, "");
        let name = format!("prepull-{tag_part}-{node}");
        name.chars().take(MAX_POD_NAME_LENGTH).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::rsptag::RspImageTag;

    fn image(tag: &str) -> RspImage {
        RspImage::new(
            "lighthouse.ceres",
            "library/sketchbook",
            RspImageTag::from_str(tag),
            "sha256:1234",
        )
    }

    #[test]
    fn test_pod_name() {
        let builder = PrepullerBuilder::new(None);
        let metadata = MetadataStorage::new("/nonexistent");
        let pod = builder.build_pod(&image("d_2077_10_23"), "node2", &metadata);
        assert_eq!(pod.metadata.name.as_deref(), Some("prepull-d-2077-10-23-node2"));

        let spec = pod.spec.unwrap();
        assert_eq!(spec.node_name.as_deref(), Some("node2"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(
            spec.containers[0].image.as_deref(),
            Some("lighthouse.ceres/library/sketchbook:d_2077_10_23@sha256:1234")
        );
        assert_eq!(spec.containers[0].command.as_ref().unwrap(), &["/bin/true"]);
    }

    #[test]
    fn test_pod_name_is_sanitized_and_truncated() {
        let builder = PrepullerBuilder::new(None);
        let metadata = MetadataStorage::new("/nonexistent");
        let pod = builder.build_pod(&image("exp_w_2021_05+weird"), "node1", &metadata);
        assert_eq!(pod.metadata.name.as_deref(), Some("prepull-exp-w-2021-05weird-node1"));

        let long_tag = "w_".to_string() + &"x".repeat(300);
        let pod = builder.build_pod(&image(&long_tag), "node1", &metadata);
        assert_eq!(pod.metadata.name.unwrap().len(), 253);
    }

    #[test]
    fn test_pull_secret() {
        let builder = PrepullerBuilder::new(Some("pull-secret".to_string()));
        let metadata = MetadataStorage::new("/nonexistent");
        let pod = builder.build_pod(&image("w_2077_43"), "node1", &metadata);
        let secrets = pod.spec.unwrap().image_pull_secrets.unwrap();
        assert_eq!(secrets[0].name, "pull-secret");
    }
}

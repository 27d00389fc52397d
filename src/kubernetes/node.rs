use std::collections::HashMap;

use itertools::Itertools;
use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::{Api, Client, ResourceExt};

use crate::errors::{ControllerError, KubernetesError, Result};
use crate::models::kubernetes::{KubernetesNodeImage, NodeToleration, Toleration};
use crate::timeout::Timeout;

/// Build the map of which images are cached on each node.
pub fn cached_images(nodes: &[Node]) -> HashMap<String, Vec<KubernetesNodeImage>> {
    let mut image_data = HashMap::new();
    for node in nodes {
        let images = node
            .status
            .as_ref()
            .and_then(|status| status.images.as_ref())
            .map(|images| images.iter().map(KubernetesNodeImage::from_container_image).collect())
            .unwrap_or_default();
        image_data.insert(node.name_any(), images);
    }
    image_data
}

/// Decide whether controller-spawned pods can be placed on a node.
///
/// Evaluates the node's taints against the configured tolerations.
/// `PreferNoSchedule` taints never disqualify a node.
pub fn node_is_tolerated(node: &Node, tolerations: &[Toleration]) -> NodeToleration {
    let Some(taints) = node.spec.as_ref().and_then(|spec| spec.taints.as_ref()) else {
        return NodeToleration { eligible: true, comment: None };
    };

    for taint in taints {
        if taint.effect == "PreferNoSchedule" {
            continue;
        }
        if tolerations.iter().any(|toleration| toleration.matches(taint)) {
            continue;
        }

        // Only the first untolerated taint is reported.
        let comment = match &taint.value {
            Some(value) => format!("Node is tainted ({}, {} = {value})", taint.effect, taint.key),
            None => format!("Node is tainted ({}, {})", taint.effect, taint.key),
        };
        return NodeToleration { eligible: false, comment: Some(comment) };
    }
    NodeToleration { eligible: true, comment: None }
}

/// Storage layer for Kubernetes node objects.
pub struct NodeStorage {
    client: Client,
}

impl NodeStorage {
    pub fn new(client: Client) -> Self {
        NodeStorage { client }
    }

    /// List nodes matching the configured node selector.
    pub async fn list(
        &self,
        node_selector: &HashMap<String, String>,
        timeout: &Timeout,
    ) -> Result<Vec<Node>> {
        debug!(?node_selector, "Getting node data");
        let api: Api<Node> = Api::all(self.client.clone());
        let mut params = ListParams::default();
        if !node_selector.is_empty() {
            let selector = node_selector.iter().map(|(k, v)| format!("{k}={v}")).join(",");
            params = params.labels(&selector);
        }
        let nodes = timeout
            .enforce(async {
                api.list(&params).await.map_err(|e| {
                    ControllerError::from(KubernetesError::from_error(
                        "Error reading node information",
                        e,
                        "Node",
                        None,
                        None,
                    ))
                })
            })
            .await?;
        Ok(nodes.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeSpec, Taint};

    use crate::models::kubernetes::TolerationOperator;

    fn node_with_taints(taints: Vec<Taint>) -> Node {
        Node {
            spec: Some(NodeSpec { taints: Some(taints), ..Default::default() }),
            ..Default::default()
        }
    }

    #[test]
    fn test_untainted_node_is_eligible() {
        assert!(node_is_tolerated(&Node::default(), &[]).eligible);
    }

    #[test]
    fn test_prefer_no_schedule_never_disqualifies() {
        let node = node_with_taints(vec![Taint {
            key: "soft".to_string(),
            value: None,
            effect: "PreferNoSchedule".to_string(),
            time_added: None,
        }]);
        assert!(node_is_tolerated(&node, &[]).eligible);
    }

    #[test]
    fn test_untolerated_taint_reports_comment() {
        let node = node_with_taints(vec![Taint {
            key: "dedicated".to_string(),
            value: Some("infra".to_string()),
            effect: "NoSchedule".to_string(),
            time_added: None,
        }]);
        let result = node_is_tolerated(&node, &[]);
        assert!(!result.eligible);
        assert_eq!(
            result.comment.as_deref(),
            Some("Node is tainted (NoSchedule, dedicated = infra)")
        );

        let toleration = Toleration {
            key: Some("dedicated".to_string()),
            operator: TolerationOperator::Exists,
            value: None,
            effect: None,
            toleration_seconds: None,
        };
        assert!(node_is_tolerated(&node, &[toleration]).eligible);
    }
}

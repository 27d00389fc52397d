use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::Notify;

use crate::config::PrepullerConfig;
use crate::constants::KUBERNETES_REQUEST_TIMEOUT;
use crate::errors::{ControllerError, Result};
use crate::kubernetes::node::{NodeStorage, cached_images, node_is_tolerated};
use crate::models::kubernetes::{KubernetesNodeImage, NodeData, Toleration};
use crate::models::lab::ImageClass;
use crate::models::menu::{
    MenuImage, MenuImages, NodeImage, PrepulledImage, PrepullerImageStatus, PrepullerNode,
    PrepullerStatus, SpawnerImages,
};
use crate::models::rspimage::{RspImage, RspImageCollection};
use crate::models::rsptag::RspImageType;
use crate::registry::source::ImageSource;
use crate::timeout::Timeout;

#[derive(Default)]
struct CatalogState {
    /// Images that should be prepulled.
    to_prepull: RspImageCollection,
    /// Per-node data, including which images of interest each node holds.
    nodes: HashMap<String, NodeData>,
}

/// Tracks the images available for labs.
///
/// Two places know about lab images: the tags in the remote registry (the
/// full set of possible images) and the images cached on cluster nodes (the
/// preferred set, since they spawn fast). This service merges the two, picks
/// the subset worth prepulling, and answers questions for both the prepuller
/// and the spawner menu.
pub struct ImageService {
    config: PrepullerConfig,
    node_selector: HashMap<String, String>,
    tolerations: Vec<Toleration>,
    source: Box<dyn ImageSource>,
    nodes: NodeStorage,
    state: Mutex<CatalogState>,
    refresh_lock: tokio::sync::Mutex<()>,
    refreshed: Notify,
}

impl ImageService {
    pub fn new(
        config: PrepullerConfig,
        node_selector: HashMap<String, String>,
        tolerations: Vec<Toleration>,
        source: Box<dyn ImageSource>,
        nodes: NodeStorage,
    ) -> Self {
        ImageService {
            config,
            node_selector,
            tolerations,
            source,
            nodes,
            state: Mutex::new(CatalogState::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
            refreshed: Notify::new(),
        }
    }

    /// Refresh data from the registry and Kubernetes.
    ///
    /// Single-flight under an async lock; normally run from a background
    /// task but safe to call directly to force a refresh. Signals the
    /// prepuller when done.
    pub async fn refresh(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        let timeout = Timeout::new("List nodes", KUBERNETES_REQUEST_TIMEOUT, None);
        let node_list = self.nodes.list(&self.node_selector, &timeout).await?;
        let cached = cached_images(&node_list);
        let to_prepull = self.source.update_images(&cached).await?;

        let mut nodes = HashMap::new();
        for node in &node_list {
            let name = node.metadata.name.clone().unwrap_or_default();
            let images = self.node_images(&to_prepull, cached.get(&name));
            let tolerated = node_is_tolerated(node, &self.tolerations);
            nodes.insert(
                name.clone(),
                NodeData {
                    name,
                    eligible: tolerated.eligible,
                    comment: tolerated.comment,
                    images,
                },
            );
        }

        let mut state = self.state.lock().expect("catalog state lock poisoned");
        state.to_prepull = to_prepull;
        state.nodes = nodes;
        drop(state);
        info!("Refreshed image information");
        self.refreshed.notify_one();
        Ok(())
    }

    /// Wait for a data refresh.
    ///
    /// Meant to be called by the prepuller loop, which is the only
    /// consumer: each refresh wakes it exactly once.
    pub async fn prepuller_wait(&self) {
        self.refreshed.notified().await;
    }

    /// Determine the image by class keyword.
    ///
    /// Only prepulled images can be selected by class, so if no release has
    /// been prepulled yet, `latest-release` is an error.
    pub fn image_for_class(&self, class: ImageClass) -> Result<RspImage> {
        let state = self.state.lock().expect("catalog state lock poisoned");
        let image = match class {
            ImageClass::Recommended => {
                state.to_prepull.image_for_tag_name(&self.config.recommended_tag)
            }
            ImageClass::LatestRelease => state.to_prepull.latest(RspImageType::Release),
            ImageClass::LatestWeekly => state.to_prepull.latest(RspImageType::Weekly),
            ImageClass::LatestDaily => state.to_prepull.latest(RspImageType::Daily),
        };
        image
            .cloned()
            .ok_or_else(|| ControllerError::UnknownDockerImage(format!("No {class} image found")))
    }

    pub async fn image_for_reference(
        &self,
        reference: &crate::models::docker::DockerReference,
    ) -> Result<RspImage> {
        self.source.image_for_reference(reference).await
    }

    pub async fn image_for_tag_name(&self, tag_name: &str) -> Result<RspImage> {
        self.source.image_for_tag_name(tag_name).await
    }

    /// All images available for spawning, for the image listing API.
    pub fn images(&self) -> SpawnerImages {
        let state = self.state.lock().expect("catalog state lock poisoned");
        let nodes = eligible_nodes(&state.nodes);
        let prepulled = |image: Option<&RspImage>| {
            image.map(|image| PrepulledImage::from_rsp_image(image, &nodes))
        };
        SpawnerImages {
            recommended: prepulled(
                state.to_prepull.image_for_tag_name(&self.config.recommended_tag),
            ),
            latest_weekly: prepulled(state.to_prepull.latest(RspImageType::Weekly)),
            latest_daily: prepulled(state.to_prepull.latest(RspImageType::Daily)),
            latest_release: prepulled(state.to_prepull.latest(RspImageType::Release)),
            all: self.source.prepulled_images(&nodes),
        }
    }

    /// The two image lists the spawner form is built from.
    ///
    /// The main menu contains only prepulled images that pass the display
    /// policy, with the recommended image forced to the top regardless of
    /// any other ordering.
    pub fn menu_images(&self) -> MenuImages {
        let state = self.state.lock().expect("catalog state lock poisoned");
        let nodes = eligible_nodes(&state.nodes);
        let now = Utc::now();

        let mut menu = Vec::new();
        let mut recommended = None;
        let mut index = 0;
        let mut current_type = None;
        for image in state.to_prepull.all_images(true, false) {
            if current_type != Some(image.image_type()) {
                current_type = Some(image.image_type());
                index = 0;
            }
            let position = index;
            index += 1;
            let entry = MenuImage {
                reference: image.reference_with_digest(),
                name: image.display_name().to_string(),
            };
            if image.tag_name() == self.config.recommended_tag {
                recommended = Some(entry);
            } else if image.prepulled_on(&nodes)
                && self.config.filter_policy.keep(&image.tag, position, now)
            {
                menu.push(entry);
            }
        }
        if let Some(recommended) = recommended {
            menu.insert(0, recommended);
        }

        MenuImages { menu, dropdown: self.source.menu_images() }
    }

    /// Record that an image was just prepulled to a node.
    ///
    /// Optimistically updates cached data so the menu reflects the prepull
    /// before the next full refresh. If it turns out not to be true, the
    /// next refresh corrects it.
    pub fn mark_prepulled(&self, image: &RspImage, node: &str) {
        let mut state = self.state.lock().expect("catalog state lock poisoned");
        if state.to_prepull.image_for_digest(&image.digest).is_none() {
            return;
        }
        self.source.mark_prepulled(image, node);
        state.to_prepull.mark_image_on_node(&image.digest, node);
        if let Some(node_data) = state.nodes.get_mut(node) {
            let mut images: Vec<RspImage> =
                node_data.images.all_images(false, false).cloned().collect();
            if !images.iter().any(|i| i.digest == image.digest) {
                images.push(image.clone());
                node_data.images = RspImageCollection::new(images);
            }
        }
    }

    /// For each node, the prepull-set images it does not yet hold.
    pub fn missing_images_by_node(&self) -> HashMap<String, Vec<RspImage>> {
        let state = self.state.lock().expect("catalog state lock poisoned");
        let mut result = HashMap::new();
        for (name, node) in &state.nodes {
            let missing: Vec<RspImage> =
                state.to_prepull.subtract(&node.images).into_iter().cloned().collect();
            if !missing.is_empty() {
                result.insert(name.clone(), missing);
            }
        }
        result
    }

    /// Current prepuller status for the status API.
    pub fn prepull_status(&self) -> PrepullerStatus {
        let state = self.state.lock().expect("catalog state lock poisoned");
        let all_nodes = eligible_nodes(&state.nodes);
        let mut nodes: HashMap<String, PrepullerNode> = state
            .nodes
            .values()
            .map(|node| {
                (
                    node.name.clone(),
                    PrepullerNode {
                        name: node.name.clone(),
                        eligible: node.eligible,
                        comment: node.comment.clone(),
                        cached: Vec::new(),
                    },
                )
            })
            .collect();

        let mut prepulled = Vec::new();
        let mut pending = Vec::new();
        for image in state.to_prepull.all_images(false, true) {
            let mut node_image = NodeImage::from_rsp_image(image);
            if image.prepulled_on(&all_nodes) {
                prepulled.push(node_image);
            } else {
                let mut missing: Vec<String> =
                    all_nodes.difference(&image.nodes).cloned().collect();
                missing.sort();
                node_image.missing = Some(missing);
                pending.push(node_image);
            }
            for node in &image.nodes {
                if let Some(entry) = nodes.get_mut(node) {
                    entry.cached.push(image.reference());
                }
            }
        }

        let mut nodes: Vec<PrepullerNode> = nodes.into_values().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        PrepullerStatus {
            config: serde_json::to_value(&self.config).unwrap_or_default(),
            images: PrepullerImageStatus { prepulled, pending },
            nodes,
        }
    }

    fn node_images(
        &self,
        to_prepull: &RspImageCollection,
        cached: Option<&Vec<KubernetesNodeImage>>,
    ) -> RspImageCollection {
        let Some(cached) = cached else {
            return RspImageCollection::default();
        };
        let images = cached
            .iter()
            .filter_map(|image| image.digest.as_deref())
            .filter_map(|digest| to_prepull.image_for_digest(digest))
            .cloned()
            .collect();
        RspImageCollection::new(images)
    }
}

fn eligible_nodes(nodes: &HashMap<String, NodeData>) -> HashSet<String> {
    nodes.values().filter(|n| n.eligible).map(|n| n.name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kube::Client;

    use crate::config::Config;
    use crate::models::docker::DockerReference;
    use crate::models::rsptag::RspImageTag;
    use crate::registry::source::ImageSource;

    /// Image source serving a fixed set of images, for catalog tests.
    struct StaticSource {
        images: Mutex<RspImageCollection>,
    }

    #[async_trait]
    impl ImageSource for StaticSource {
        async fn update_images(
            &self,
            _node_cache: &HashMap<String, Vec<KubernetesNodeImage>>,
        ) -> crate::errors::Result<RspImageCollection> {
            Ok(self.images.lock().unwrap().clone())
        }

        async fn image_for_reference(
            &self,
            reference: &DockerReference,
        ) -> crate::errors::Result<RspImage> {
            let images = self.images.lock().unwrap();
            images
                .all_images(false, false)
                .find(|image| Some(image.tag_name()) == reference.tag.as_deref())
                .cloned()
                .ok_or_else(|| {
                    crate::errors::ControllerError::UnknownDockerImage(reference.to_string())
                })
        }

        async fn image_for_tag_name(&self, tag_name: &str) -> crate::errors::Result<RspImage> {
            let images = self.images.lock().unwrap();
            images.image_for_tag_name(tag_name).cloned().ok_or_else(|| {
                crate::errors::ControllerError::UnknownDockerImage(tag_name.to_string())
            })
        }

        fn mark_prepulled(&self, image: &RspImage, node: &str) {
            self.images.lock().unwrap().mark_image_on_node(&image.digest, node);
        }

        fn menu_images(&self) -> Vec<MenuImage> {
            let images = self.images.lock().unwrap();
            images
                .all_images(false, false)
                .map(|image| MenuImage {
                    reference: image.reference(),
                    name: image.display_name().to_string(),
                })
                .collect()
        }

        fn prepulled_images(&self, eligible_nodes: &HashSet<String>) -> Vec<PrepulledImage> {
            let images = self.images.lock().unwrap();
            images
                .all_images(false, false)
                .map(|image| PrepulledImage::from_rsp_image(image, eligible_nodes))
                .collect()
        }
    }

    fn image(tag: &str, digest: &str, nodes: &[&str]) -> RspImage {
        let mut image = RspImage::new(
            "lighthouse.ceres",
            "library/sketchbook",
            RspImageTag::from_str(tag),
            digest,
        );
        image.nodes = nodes.iter().map(|n| n.to_string()).collect();
        image
    }

    fn alias_image(tag: &str, digest: &str, nodes: &[&str]) -> RspImage {
        let mut image = RspImage::new(
            "lighthouse.ceres",
            "library/sketchbook",
            RspImageTag::alias(tag),
            digest,
        );
        image.nodes = nodes.iter().map(|n| n.to_string()).collect();
        image
    }

    fn node_data(name: &str, eligible: bool, images: Vec<RspImage>) -> NodeData {
        NodeData {
            name: name.to_string(),
            eligible,
            comment: None,
            images: RspImageCollection::new(images),
        }
    }

    /// Build a service with a static prepull set: a weekly cached on both
    /// nodes (aliased by recommended) and a daily cached only on node1.
    fn test_service() -> ImageService {
        let weekly = image("w_2077_43", "sha256:5678", &["node1", "node2"]);
        let recommended = alias_image("recommended", "sha256:5678", &["node1", "node2"]);
        let daily = image("d_2077_10_23", "sha256:1234", &["node1"]);
        let to_prepull =
            RspImageCollection::new(vec![weekly.clone(), recommended.clone(), daily.clone()]);

        let yaml = r#"
baseUrl: "https://data.example.org"
lab:
  sizes:
    - size: medium
      cpu: 2.0
      memory: 4GiB
images:
  source:
    registry: lighthouse.ceres
    repository: library/sketchbook
  numWeeklies: 1
  numDailies: 1
fileserver:
  enabled: false
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let source = StaticSource { images: Mutex::new(to_prepull.clone()) };
        let kube_config = kube::Config::new("http://127.0.0.1:8080".parse().unwrap());
        let client = Client::try_from(kube_config).unwrap();
        let service = ImageService::new(
            config.images,
            HashMap::new(),
            Vec::new(),
            Box::new(source),
            NodeStorage::new(client),
        );

        let nodes = HashMap::from([
            (
                "node1".to_string(),
                node_data("node1", true, vec![weekly.clone(), daily]),
            ),
            ("node2".to_string(), node_data("node2", true, vec![weekly])),
        ]);
        let mut state = service.state.lock().unwrap();
        state.to_prepull = to_prepull;
        state.nodes = nodes;
        drop(state);
        service
    }

    #[tokio::test]
    async fn test_image_for_class() {
        let service = test_service();
        let image = service.image_for_class(ImageClass::Recommended).unwrap();
        assert_eq!(image.tag_name(), "recommended");
        let image = service.image_for_class(ImageClass::LatestWeekly).unwrap();
        assert_eq!(image.tag_name(), "w_2077_43");
        assert!(service.image_for_class(ImageClass::LatestRelease).is_err());
    }

    #[tokio::test]
    async fn test_missing_images_by_node() {
        let service = test_service();
        let missing = service.missing_images_by_node();

        // The daily is cached only on node1, so node2 needs it. For every
        // image in the prepull set, the union of its nodes and its missing
        // entries covers all eligible nodes.
        assert_eq!(missing.len(), 1);
        let node2: Vec<&str> = missing["node2"].iter().map(|i| i.tag_name()).collect();
        assert_eq!(node2, ["d_2077_10_23"]);
    }

    #[tokio::test]
    async fn test_mark_prepulled_updates_status() {
        let service = test_service();
        let daily = service.image_for_class(ImageClass::LatestDaily).unwrap();

        let status = service.prepull_status();
        assert_eq!(status.images.prepulled.len(), 1);
        let pending: Vec<&str> =
            status.images.pending.iter().map(|i| i.tag.as_str()).collect();
        assert_eq!(pending, ["d_2077_10_23"]);
        assert_eq!(
            status.images.pending[0].missing.as_ref().unwrap(),
            &["node2".to_string()]
        );

        // After marking the prepull the image moves to prepulled and the
        // missing list empties, before any refresh.
        service.mark_prepulled(&daily, "node2");
        let status = service.prepull_status();
        assert_eq!(status.images.prepulled.len(), 2);
        assert!(status.images.pending.is_empty());
        assert!(service.missing_images_by_node().is_empty());
    }

    #[tokio::test]
    async fn test_menu_images() {
        let service = test_service();
        let menu = service.menu_images();

        // Recommended is forced to the top; the weekly it aliases is hidden;
        // the daily is not on all nodes and is left off the menu.
        let names: Vec<&str> = menu.menu.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["Recommended (Weekly 2077_43)"]);
        assert!(!menu.dropdown.is_empty());
    }

    #[tokio::test]
    async fn test_images_listing() {
        let service = test_service();
        let images = service.images();
        assert_eq!(images.recommended.unwrap().tag, "recommended");
        let weekly = images.latest_weekly.unwrap();
        assert_eq!(weekly.tag, "w_2077_43");
        assert!(weekly.prepulled);
        let daily = images.latest_daily.unwrap();
        assert!(!daily.prepulled);
        assert!(images.latest_release.is_none());
    }
}

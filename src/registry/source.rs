use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::PrepullerConfig;
use crate::errors::{ControllerError, Result};
use crate::models::docker::DockerReference;
use crate::models::imagepolicy::filter_tags;
use crate::models::kubernetes::KubernetesNodeImage;
use crate::models::menu::{MenuImage, PrepulledImage};
use crate::models::rspimage::{RspImage, RspImageCollection};
use crate::models::rsptag::{RspImageTag, RspImageTagCollection, is_alias_tag};
use super::DockerRegistryClient;

/// Source of remote images for the image catalog.
///
/// Wraps an image registry, gathers the list of available tags, and selects
/// which ones should be prepulled.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Refresh remote tags and return the new set of images to prepull,
    /// with node presence filled in from the per-node cache inventory.
    async fn update_images(
        &self,
        node_cache: &HashMap<String, Vec<KubernetesNodeImage>>,
    ) -> Result<RspImageCollection>;

    /// Resolve a full Docker reference against this source.
    async fn image_for_reference(&self, reference: &DockerReference) -> Result<RspImage>;

    /// Resolve a bare tag name against this source.
    async fn image_for_tag_name(&self, tag_name: &str) -> Result<RspImage>;

    /// Record a successful prepull in the source's own bookkeeping.
    fn mark_prepulled(&self, image: &RspImage, node: &str);

    /// Dropdown entries: everything known, filtered by the display policy.
    fn menu_images(&self) -> Vec<MenuImage>;

    /// The prepull set with per-node status, for the image listing API.
    fn prepulled_images(&self, eligible_nodes: &HashSet<String>) -> Vec<PrepulledImage>;
}

#[derive(Default)]
struct SourceState {
    tags: RspImageTagCollection,
    images: RspImageCollection,
}

/// Image source backed by a Docker registry.
pub struct DockerImageSource {
    config: PrepullerConfig,
    client: DockerRegistryClient,
    state: Mutex<SourceState>,
}

impl DockerImageSource {
    pub fn new(config: PrepullerConfig, client: DockerRegistryClient) -> Self {
        DockerImageSource { config, client, state: Mutex::new(SourceState::default()) }
    }

    fn aliases(&self) -> HashSet<String> {
        let mut aliases: HashSet<String> =
            self.config.alias_tags.iter().cloned().collect();
        aliases.insert(self.config.recommended_tag.clone());
        aliases
    }

    fn parse_tag(&self, tag_name: &str) -> RspImageTag {
        if is_alias_tag(tag_name, &self.aliases()) {
            RspImageTag::alias(tag_name)
        } else {
            RspImageTag::from_str(tag_name)
        }
    }

    async fn image_for_tag(&self, tag_name: &str, digest: Option<String>) -> Result<RspImage> {
        let source = &self.config.source;
        let digest = match digest {
            Some(digest) => digest,
            None => self.client.get_image_digest(source, tag_name).await?,
        };
        let mut image = RspImage::new(
            &source.registry,
            &source.repository,
            self.parse_tag(tag_name),
            &digest,
        );

        // If this digest is already in the prepull set, adopt its node
        // bookkeeping so the caller sees accurate prepull status.
        let state = self.state.lock().expect("source state lock poisoned");
        if let Some(known) = state.images.image_for_digest(&digest) {
            image.nodes = known.nodes.clone();
            image.aliases = known.aliases.clone();
        }
        Ok(image)
    }
}

#[async_trait]
impl ImageSource for DockerImageSource {
    async fn update_images(
        &self,
        node_cache: &HashMap<String, Vec<KubernetesNodeImage>>,
    ) -> Result<RspImageCollection> {
        let source = &self.config.source;
        let mut tag_names = self.client.list_tags(source).await?;
        tag_names.sort();

        let aliases = self.aliases();
        let tags = RspImageTagCollection::from_tag_names(&tag_names, &aliases, self.config.cycle);

        // The prepull subset: the latest dated tags per category plus the
        // recommended tag, pins, and aliases.
        let mut include = aliases;
        include.extend(self.config.pin.iter().cloned());
        let subset = tags.subset(
            self.config.num_releases,
            self.config.num_weeklies,
            self.config.num_dailies,
            &include,
        );

        let mut images = Vec::new();
        for tag in subset.all_tags() {
            let digest = self.client.get_image_digest(source, &tag.tag).await?;
            let mut image =
                RspImage::new(&source.registry, &source.repository, tag.clone(), &digest);
            for (node, cached) in node_cache {
                if cached.iter().any(|c| c.digest.as_deref() == Some(image.digest.as_str())) {
                    image.nodes.insert(node.clone());
                }
            }
            images.push(image);
        }
        let collection = RspImageCollection::new(images);

        let mut state = self.state.lock().expect("source state lock poisoned");
        state.tags = tags;
        state.images = collection.clone();
        Ok(collection)
    }

    async fn image_for_reference(&self, reference: &DockerReference) -> Result<RspImage> {
        let source = &self.config.source;
        if reference.registry != source.registry || reference.repository != source.repository {
            return Err(ControllerError::InvalidDockerReference(reference.to_string()));
        }
        let tag = reference.tag.clone().unwrap_or_else(|| "latest".to_string());
        self.image_for_tag(&tag, reference.digest.clone()).await
    }

    async fn image_for_tag_name(&self, tag_name: &str) -> Result<RspImage> {
        self.image_for_tag(tag_name, None).await
    }

    fn mark_prepulled(&self, image: &RspImage, node: &str) {
        let mut state = self.state.lock().expect("source state lock poisoned");
        state.images.mark_image_on_node(&image.digest, node);
    }

    fn menu_images(&self) -> Vec<MenuImage> {
        let source = &self.config.source;
        let state = self.state.lock().expect("source state lock poisoned");
        filter_tags(&state.tags, &self.config.filter_policy, Utc::now())
            .iter()
            .map(|tag| MenuImage {
                reference: format!("{}/{}:{}", source.registry, source.repository, tag.tag),
                name: tag.display_name.clone(),
            })
            .collect()
    }

    fn prepulled_images(&self, eligible_nodes: &HashSet<String>) -> Vec<PrepulledImage> {
        let state = self.state.lock().expect("source state lock poisoned");
        state
            .images
            .all_images(false, false)
            .map(|image| PrepulledImage::from_rsp_image(image, eligible_nodes))
            .collect()
    }
}

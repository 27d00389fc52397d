use std::collections::{HashMap, HashSet};

use super::rsptag::{RspImageTag, RspImageType};

/// A tag bound to a concrete image in a registry.
///
/// Within a collection, the digest identifies an image uniquely. Several tag
/// names may point at the same digest; one of them is canonical and the
/// others are recorded as aliases.
#[derive(Debug, Clone, PartialEq)]
pub struct RspImage {
    pub tag: RspImageTag,
    pub registry: String,
    pub repository: String,
    pub digest: String,
    /// Other tag names known to share this digest.
    pub aliases: HashSet<String>,
    /// For alias images, the canonical tag this alias points at.
    pub alias_target: Option<String>,
    /// Names of the nodes that have this image cached.
    pub nodes: HashSet<String>,
}

impl RspImage {
    pub fn new(registry: &str, repository: &str, tag: RspImageTag, digest: &str) -> Self {
        RspImage {
            tag,
            registry: registry.to_string(),
            repository: repository.to_string(),
            digest: digest.to_string(),
            aliases: HashSet::new(),
            alias_target: None,
            nodes: HashSet::new(),
        }
    }

    pub fn tag_name(&self) -> &str {
        &self.tag.tag
    }

    pub fn image_type(&self) -> RspImageType {
        self.tag.image_type
    }

    pub fn display_name(&self) -> &str {
        &self.tag.display_name
    }

    /// `registry/repository:tag` form.
    pub fn reference(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag.tag)
    }

    /// `registry/repository:tag@digest` form, used everywhere an exact image
    /// must be named.
    pub fn reference_with_digest(&self) -> String {
        format!(
            "{}/{}:{}@{}",
            self.registry, self.repository, self.tag.tag, self.digest
        )
    }

    /// Whether this image is cached on every node in the given set.
    pub fn prepulled_on(&self, nodes: &HashSet<String>) -> bool {
        nodes.is_subset(&self.nodes)
    }

    /// Resolve this alias against its target image.
    ///
    /// Promotes unknown images to aliases, since anything that shares a
    /// digest with a real image but has an unparseable tag is serving as an
    /// alias in practice.
    fn resolve_alias(&mut self, target: &mut RspImage) {
        self.image_type_promote();
        self.alias_target = Some(target.tag.tag.clone());
        self.tag.display_name = format!("{} ({})", self.tag.display_name, target.tag.display_name);
        if self.tag.cycle.is_none() {
            self.tag.cycle = target.tag.cycle;
        }
        target.aliases.insert(self.tag.tag.clone());
    }

    fn image_type_promote(&mut self) {
        if self.tag.image_type == RspImageType::Unknown {
            self.tag.image_type = RspImageType::Alias;
        }
    }
}

/// Set of images indexed by tag name, digest, and category.
///
/// Iteration yields aliases first and then each category newest first, the
/// order the spawner menu wants.
#[derive(Debug, Clone, Default)]
pub struct RspImageCollection {
    images: Vec<RspImage>,
    by_tag: HashMap<String, usize>,
    by_digest: HashMap<String, usize>,
}

impl RspImageCollection {
    pub fn new(images: Vec<RspImage>) -> Self {
        let mut images = images;
        Self::resolve_aliases(&mut images);
        images.sort_by(|a, b| {
            a.tag
                .image_type
                .cmp(&b.tag.image_type)
                .then_with(|| b.tag.sort_key().cmp(&a.tag.sort_key()))
        });

        let mut by_tag = HashMap::new();
        let mut by_digest = HashMap::new();
        for (index, image) in images.iter().enumerate() {
            by_tag.insert(image.tag.tag.clone(), index);
        }
        // The canonical image for a digest is the first non-alias image
        // holding it, falling back to the alias itself.
        for (index, image) in images.iter().enumerate() {
            if image.alias_target.is_none() {
                by_digest.entry(image.digest.clone()).or_insert(index);
            }
        }
        for (index, image) in images.iter().enumerate() {
            by_digest.entry(image.digest.clone()).or_insert(index);
        }
        RspImageCollection { images, by_tag, by_digest }
    }

    fn resolve_aliases(images: &mut [RspImage]) {
        let mut canonical: HashMap<String, usize> = HashMap::new();
        for (index, image) in images.iter().enumerate() {
            let aliasable = matches!(
                image.image_type(),
                RspImageType::Alias | RspImageType::Unknown
            );
            if !aliasable {
                canonical.entry(image.digest.clone()).or_insert(index);
            }
        }
        // Unknown tags only become aliases when they share a digest with a
        // real image; plain unknowns stay as they are.
        for index in 0..images.len() {
            let aliasable = matches!(
                images[index].image_type(),
                RspImageType::Alias | RspImageType::Unknown
            );
            if !aliasable {
                continue;
            }
            let Some(&target) = canonical.get(&images[index].digest) else {
                continue;
            };
            if target == index {
                continue;
            }
            let (alias, target_image) = if index < target {
                let (left, right) = images.split_at_mut(target);
                (&mut left[index], &mut right[0])
            } else {
                let (left, right) = images.split_at_mut(index);
                (&mut right[0], &mut left[target])
            };
            alias.resolve_alias(target_image);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn image_for_tag_name(&self, name: &str) -> Option<&RspImage> {
        self.by_tag.get(name).map(|&index| &self.images[index])
    }

    pub fn image_for_digest(&self, digest: &str) -> Option<&RspImage> {
        self.by_digest.get(digest).map(|&index| &self.images[index])
    }

    /// The newest image of a category, ignoring unresolved aliases.
    pub fn latest(&self, image_type: RspImageType) -> Option<&RspImage> {
        self.images
            .iter()
            .find(|image| image.image_type() == image_type)
    }

    /// All images in menu order.
    ///
    /// `hide_aliased` drops images that some alias points at (the alias
    /// entry conveys them); `hide_resolved_aliases` drops aliases whose
    /// target is in the collection (the target entry conveys them).
    pub fn all_images(
        &self,
        hide_aliased: bool,
        hide_resolved_aliases: bool,
    ) -> impl Iterator<Item = &RspImage> {
        self.images.iter().filter(move |image| {
            if hide_aliased && !image.aliases.is_empty() {
                return false;
            }
            if hide_resolved_aliases && image.alias_target.is_some() {
                return false;
            }
            true
        })
    }

    /// Images in this collection whose digest does not appear in `other`.
    pub fn subtract(&self, other: &RspImageCollection) -> Vec<&RspImage> {
        self.images
            .iter()
            .filter(|image| other.image_for_digest(&image.digest).is_none())
            .collect()
    }

    /// Record that a node now has the image with the given digest cached.
    pub fn mark_image_on_node(&mut self, digest: &str, node: &str) {
        for image in &mut self.images {
            if image.digest == digest {
                image.nodes.insert(node.to_string());
            }
        }
    }
}

impl FromIterator<RspImage> for RspImageCollection {
    fn from_iter<I: IntoIterator<Item = RspImage>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::rsptag::RspImageTag;

    fn image(tag: &str, digest: &str) -> RspImage {
        RspImage::new("lighthouse.ceres", "library/sketchbook", RspImageTag::from_str(tag), digest)
    }

    fn alias_image(tag: &str, digest: &str) -> RspImage {
        RspImage::new("lighthouse.ceres", "library/sketchbook", RspImageTag::alias(tag), digest)
    }

    #[test]
    fn test_alias_resolution() {
        let collection = RspImageCollection::new(vec![
            image("w_2077_46", "sha256:5678"),
            alias_image("recommended", "sha256:5678"),
            image("d_2077_10_21", "sha256:1234"),
        ]);

        let recommended = collection.image_for_tag_name("recommended").unwrap();
        assert_eq!(recommended.alias_target.as_deref(), Some("w_2077_46"));
        assert_eq!(recommended.display_name(), "Recommended (Weekly 2077_46)");

        let weekly = collection.image_for_tag_name("w_2077_46").unwrap();
        assert!(weekly.aliases.contains("recommended"));

        // The canonical image for the digest is the non-alias one.
        let canonical = collection.image_for_digest("sha256:5678").unwrap();
        assert_eq!(canonical.tag_name(), "w_2077_46");

        // Menu order: aliases first, then categories.
        let order: Vec<&str> = collection.all_images(false, false).map(|i| i.tag_name()).collect();
        assert_eq!(order, ["recommended", "w_2077_46", "d_2077_10_21"]);
        let order: Vec<&str> = collection.all_images(true, false).map(|i| i.tag_name()).collect();
        assert_eq!(order, ["recommended", "d_2077_10_21"]);
        let order: Vec<&str> = collection.all_images(false, true).map(|i| i.tag_name()).collect();
        assert_eq!(order, ["w_2077_46", "d_2077_10_21"]);
    }

    #[test]
    fn test_latest_and_subtract() {
        let collection = RspImageCollection::new(vec![
            image("w_2077_43", "sha256:1111"),
            image("w_2077_46", "sha256:5678"),
            image("d_2077_10_21", "sha256:1234"),
        ]);
        assert_eq!(
            collection.latest(RspImageType::Weekly).unwrap().tag_name(),
            "w_2077_46"
        );
        assert!(collection.latest(RspImageType::Release).is_none());

        let cached = RspImageCollection::new(vec![image("w_2077_46", "sha256:5678")]);
        let missing: Vec<&str> = collection.subtract(&cached).iter().map(|i| i.tag_name()).collect();
        assert_eq!(missing, ["w_2077_43", "d_2077_10_21"]);
    }

    #[test]
    fn test_mark_image_on_node() {
        let mut collection = RspImageCollection::new(vec![image("w_2077_46", "sha256:5678")]);
        collection.mark_image_on_node("sha256:5678", "node2");
        let image = collection.image_for_digest("sha256:5678").unwrap();
        assert!(image.nodes.contains("node2"));
    }
}

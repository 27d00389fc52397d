use std::collections::HashSet;

use serde_derive::Serialize;

use super::rspimage::RspImage;

/// One entry on the spawner form, either in the radio menu or the dropdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuImage {
    /// Reference to pass back in the spawn request.
    pub reference: String,
    /// Name shown to the user.
    pub name: String,
}

/// The two lists of images the spawner form is built from.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MenuImages {
    /// Prepulled images, shown as the primary menu.
    pub menu: Vec<MenuImage>,
    /// Everything else the user may select from the dropdown.
    pub dropdown: Vec<MenuImage>,
}

/// An image as reported by the image listing API.
#[derive(Debug, Clone, Serialize)]
pub struct PrepulledImage {
    pub reference: String,
    pub tag: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub prepulled: bool,
}

impl PrepulledImage {
    pub fn from_rsp_image(image: &RspImage, eligible_nodes: &HashSet<String>) -> Self {
        PrepulledImage {
            reference: image.reference(),
            tag: image.tag_name().to_string(),
            name: image.display_name().to_string(),
            digest: Some(image.digest.clone()),
            prepulled: image.prepulled_on(eligible_nodes),
        }
    }
}

/// Images grouped by class for the spawner API.
#[derive(Debug, Clone, Serialize)]
pub struct SpawnerImages {
    pub recommended: Option<PrepulledImage>,
    pub latest_weekly: Option<PrepulledImage>,
    pub latest_daily: Option<PrepulledImage>,
    pub latest_release: Option<PrepulledImage>,
    pub all: Vec<PrepulledImage>,
}

/// Per-image prepull state for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct NodeImage {
    pub reference: String,
    pub tag: String,
    pub name: String,
    pub digest: String,
    pub nodes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<Vec<String>>,
}

impl NodeImage {
    pub fn from_rsp_image(image: &RspImage) -> Self {
        let mut nodes: Vec<String> = image.nodes.iter().cloned().collect();
        nodes.sort();
        NodeImage {
            reference: image.reference(),
            tag: image.tag_name().to_string(),
            name: image.display_name().to_string(),
            digest: image.digest.clone(),
            nodes,
            missing: None,
        }
    }
}

/// Prepull state grouped by completeness.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PrepullerImageStatus {
    pub prepulled: Vec<NodeImage>,
    pub pending: Vec<NodeImage>,
}

/// Per-node prepull state for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct PrepullerNode {
    pub name: String,
    pub eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub cached: Vec<String>,
}

/// Full prepuller status returned by the status API.
#[derive(Debug, Clone, Serialize)]
pub struct PrepullerStatus {
    pub config: serde_json::Value,
    pub images: PrepullerImageStatus,
    pub nodes: Vec<PrepullerNode>,
}

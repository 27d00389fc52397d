use std::collections::HashMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde_derive::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::constants::{DROPDOWN_SENTINEL_VALUE, LIMIT_TO_REQUEST_RATIO};
use crate::errors::ControllerError;
use super::kubernetes::PodPhase;

/// Named lab sizes, in hobbit-inspired ascending order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LabSize {
    Fine,
    Diminutive,
    Tiny,
    Small,
    Medium,
    Large,
    Huge,
    Gargantuan,
    Colossal,
    /// Sentinel for reconciled labs whose resources match no configured size.
    Custom,
}

/// Status of a user's lab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LabStatus {
    Pending,
    Running,
    Terminating,
    Terminated,
    Failed,
}

impl LabStatus {
    pub fn from_phase(phase: PodPhase) -> LabStatus {
        match phase {
            PodPhase::Pending | PodPhase::Unknown => LabStatus::Pending,
            PodPhase::Running => LabStatus::Running,
            PodPhase::Succeeded => LabStatus::Terminated,
            PodPhase::Failed => LabStatus::Failed,
        }
    }

    /// Terminated and failed labs are not running; everything else is at
    /// least on its way up or down.
    pub fn is_running(&self) -> bool {
        !matches!(self, LabStatus::Terminated | LabStatus::Failed)
    }
}

/// Classes of images that can be requested by keyword instead of by tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ImageClass {
    Recommended,
    LatestRelease,
    LatestWeekly,
    LatestDaily,
}

/// How the user chose the lab image, after form-level normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSelector {
    Reference(String),
    Class(ImageClass),
    Tag(String),
}

/// User-submitted lab options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabRequestOptions {
    #[serde(default)]
    pub image_list: Option<String>,
    #[serde(default)]
    pub image_dropdown: Option<String>,
    #[serde(default)]
    pub image_class: Option<ImageClass>,
    #[serde(default)]
    pub image_tag: Option<String>,
    pub size: LabSize,
    #[serde(default)]
    pub enable_debug: bool,
    #[serde(default)]
    pub reset_user_env: bool,
}

impl LabRequestOptions {
    /// Determine the image selector, enforcing that exactly one was given.
    ///
    /// The HTML form submits the sentinel in `image_list` when the dropdown
    /// was used, so that combination counts as one selector.
    pub fn image_selector(&self) -> Result<ImageSelector, ControllerError> {
        let image_list = match self.image_list.as_deref() {
            Some(DROPDOWN_SENTINEL_VALUE) => None,
            other => other,
        };
        let selectors = [
            image_list.is_some(),
            self.image_dropdown.is_some() && image_list.is_none(),
            self.image_class.is_some(),
            self.image_tag.is_some(),
        ];
        if selectors.iter().filter(|s| **s).count() != 1 {
            let msg = "exactly one image selector must be given".to_string();
            return Err(ControllerError::InvalidDockerReference(msg));
        }
        if let Some(reference) = image_list {
            return Ok(ImageSelector::Reference(reference.to_string()));
        }
        if let Some(reference) = &self.image_dropdown {
            return Ok(ImageSelector::Reference(reference.clone()));
        }
        if let Some(class) = self.image_class {
            return Ok(ImageSelector::Class(class));
        }
        Ok(ImageSelector::Tag(self.image_tag.clone().expect("tag selector")))
    }
}

/// A user's lab spawn request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabSpecification {
    pub options: LabRequestOptions,
    pub env: HashMap<String, String>,
}

impl LabSpecification {
    /// JupyterHub must tell us the service prefix or the internal URL of the
    /// lab cannot be constructed.
    pub fn validate_env(&self) -> Result<(), ControllerError> {
        if !self.env.contains_key("JUPYTERHUB_SERVICE_PREFIX") {
            let msg = "env.JUPYTERHUB_SERVICE_PREFIX must be set".to_string();
            return Err(ControllerError::Config(msg));
        }
        Ok(())
    }
}

/// A group the user belongs to. Groups without GIDs exist on the identity
/// side but cannot appear in supplemental groups or /etc/group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGroup {
    pub name: String,
    #[serde(default)]
    pub id: Option<u32>,
}

/// Notebook quota from the identity service, in CPU equivalents and GiB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NotebookQuota {
    pub cpu: f64,
    pub memory: f64,
}

impl NotebookQuota {
    pub fn memory_bytes(&self) -> u64 {
        (self.memory * (1024.0 * 1024.0 * 1024.0)) as u64
    }
}

/// Quota information from the identity service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserQuota {
    /// Per-service API call budgets.
    #[serde(default)]
    pub api: HashMap<String, u32>,
    #[serde(default)]
    pub notebook: Option<NotebookQuota>,
}

/// Identity and group information for a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
    pub uid: u32,
    pub gid: u32,
    #[serde(default)]
    pub groups: Vec<UserGroup>,
    #[serde(default)]
    pub quota: Option<UserQuota>,
}

impl UserInfo {
    /// GIDs for the pod's supplemental groups. Only groups with GIDs
    /// survive.
    pub fn supplemental_groups(&self) -> Vec<i64> {
        self.groups.iter().filter_map(|g| g.id.map(i64::from)).collect()
    }

    /// Serialized group list, stored as a pod annotation so that group names
    /// can be recovered during reconciliation.
    pub fn groups_json(&self) -> String {
        serde_json::to_string(&self.groups).unwrap_or_else(|_| "[]".to_string())
    }
}

/// CPU equivalents and memory bytes for one side of a resource spec.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuantity {
    pub cpu: f64,
    pub memory: u64,
}

/// Requests and limits for a lab.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabResources {
    pub limits: ResourceQuantity,
    pub requests: ResourceQuantity,
}

impl LabResources {
    pub fn to_kubernetes(&self) -> ResourceRequirements {
        ResourceRequirements {
            limits: Some(
                [
                    ("cpu".to_string(), Quantity(self.limits.cpu.to_string())),
                    ("memory".to_string(), Quantity(self.limits.memory.to_string())),
                ]
                .into(),
            ),
            requests: Some(
                [
                    ("cpu".to_string(), Quantity(self.requests.cpu.to_string())),
                    ("memory".to_string(), Quantity(self.requests.memory.to_string())),
                ]
                .into(),
            ),
            claims: None,
        }
    }
}

/// Parse a human-friendly memory quantity (`3GiB`, `2949120KiB`, raw bytes).
pub fn parse_memory(memory: &str) -> Result<u64, ControllerError> {
    let memory = memory.trim();
    let (number, multiplier) = match memory {
        m if m.ends_with("KiB") || m.ends_with("Ki") => (m.trim_end_matches('B').trim_end_matches("Ki"), 1u64 << 10),
        m if m.ends_with("MiB") || m.ends_with("Mi") => (m.trim_end_matches('B').trim_end_matches("Mi"), 1u64 << 20),
        m if m.ends_with("GiB") || m.ends_with("Gi") => (m.trim_end_matches('B').trim_end_matches("Gi"), 1u64 << 30),
        m if m.ends_with("TiB") || m.ends_with("Ti") => (m.trim_end_matches('B').trim_end_matches("Ti"), 1u64 << 40),
        m => (m, 1),
    };
    let value: f64 = number
        .parse()
        .map_err(|_| ControllerError::Config(format!("Invalid memory quantity {memory:?}")))?;
    Ok((value * multiplier as f64) as u64)
}

/// One configured lab size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizeDefinition {
    pub size: LabSize,
    pub cpu: f64,
    /// Memory limit with a binary suffix, as operators write it.
    pub memory: String,
}

impl SizeDefinition {
    pub fn memory_bytes(&self) -> Result<u64, ControllerError> {
        parse_memory(&self.memory)
    }

    /// Resources for this size: the configuration gives limits, and requests
    /// are derived via the overcommit ratio.
    pub fn to_lab_resources(&self) -> Result<LabResources, ControllerError> {
        let memory = self.memory_bytes()?;
        let limits = ResourceQuantity { cpu: self.cpu, memory };
        let requests = ResourceQuantity {
            cpu: self.cpu / LIMIT_TO_REQUEST_RATIO,
            memory: (memory as f64 / LIMIT_TO_REQUEST_RATIO) as u64,
        };
        Ok(LabResources { limits, requests })
    }

    /// Human-readable form used for the form and the CONTAINER_SIZE variable.
    pub fn description(&self) -> String {
        let mut size = self.size.to_string();
        if let Some(first) = size.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        format!("{size} ({} CPU, {} RAM)", self.cpu, self.memory)
    }
}

/// Options as actually chosen for a spawned lab, with the image pinned to a
/// digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabOptions {
    /// Image reference in `registry/repository:tag@digest` form.
    pub image: String,
    pub size: LabSize,
    pub enable_debug: bool,
    pub reset_user_env: bool,
}

/// The authoritative in-memory record of a user's lab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabState {
    pub user: UserInfo,
    pub options: LabOptions,
    pub status: LabStatus,
    #[serde(default)]
    pub internal_url: Option<String>,
    pub resources: LabResources,
    #[serde(default)]
    pub quota: Option<ResourceQuantity>,
}

impl LabState {
    pub fn from_request(
        user: &UserInfo,
        spec: &LabSpecification,
        resources: LabResources,
        image_reference: String,
    ) -> Self {
        let quota = user.quota.as_ref().and_then(|q| q.notebook).map(|n| ResourceQuantity {
            cpu: n.cpu,
            memory: n.memory_bytes(),
        });
        LabState {
            user: user.clone(),
            options: LabOptions {
                image: image_reference,
                size: spec.options.size,
                enable_debug: spec.options.enable_debug,
                reset_user_env: spec.options.reset_user_env,
            },
            status: LabStatus::Pending,
            internal_url: None,
            resources,
            quota,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }
}

/// Type of a progress event for a lab operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventType {
    Info,
    Error,
    Complete,
    Failed,
}

/// Progress event for a lab spawn or deletion, shown to the user via the
/// server-sent event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

impl Event {
    pub fn info(message: impl Into<String>, progress: u8) -> Self {
        Event {
            event_type: EventType::Info,
            message: message.into(),
            progress: Some(progress),
        }
    }

    pub fn complete(message: impl Into<String>) -> Self {
        Event {
            event_type: EventType::Complete,
            message: message.into(),
            progress: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Event { event_type: EventType::Error, message: message.into(), progress: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Event { event_type: EventType::Failed, message: message.into(), progress: None }
    }

    /// Terminal events end the event stream.
    pub fn done(&self) -> bool {
        matches!(self.event_type, EventType::Complete | EventType::Failed)
    }

    /// Wire form for the server-sent event stream.
    pub fn to_sse(&self) -> String {
        let mut data = serde_json::json!({ "message": self.message });
        if let Some(progress) = self.progress {
            data["progress"] = progress.into();
        }
        format!("event: {}\ndata: {}\n\n", self.event_type, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("1024").unwrap(), 1024);
        assert_eq!(parse_memory("2KiB").unwrap(), 2048);
        assert_eq!(parse_memory("3GiB").unwrap(), 3 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1536MiB").unwrap(), 1536 * 1024 * 1024);
        assert_eq!(parse_memory("2Gi").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_memory("many").is_err());
    }

    #[test]
    fn test_size_resources() {
        let size = SizeDefinition {
            size: LabSize::Medium,
            cpu: 2.0,
            memory: "3GiB".to_string(),
        };
        let resources = size.to_lab_resources().unwrap();
        assert_eq!(resources.limits.cpu, 2.0);
        assert_eq!(resources.limits.memory, 3 * 1024 * 1024 * 1024);
        assert_eq!(resources.requests.cpu, 0.5);
        assert_eq!(resources.requests.memory, 3 * 1024 * 1024 * 1024 / 4);
        assert_eq!(size.description(), "Medium (2 CPU, 3GiB RAM)");
    }

    #[test]
    fn test_image_selector() {
        let mut options = LabRequestOptions {
            image_list: Some("lighthouse.ceres/library/sketchbook@sha256:1234".to_string()),
            image_dropdown: None,
            image_class: None,
            image_tag: None,
            size: LabSize::Medium,
            enable_debug: false,
            reset_user_env: false,
        };
        assert_eq!(
            options.image_selector().unwrap(),
            ImageSelector::Reference("lighthouse.ceres/library/sketchbook@sha256:1234".to_string())
        );

        // Sentinel defers to the dropdown selection.
        options.image_list = Some(DROPDOWN_SENTINEL_VALUE.to_string());
        options.image_dropdown = Some("lighthouse.ceres/library/sketchbook:w_2077_44".to_string());
        assert_eq!(
            options.image_selector().unwrap(),
            ImageSelector::Reference("lighthouse.ceres/library/sketchbook:w_2077_44".to_string())
        );

        options.image_dropdown = None;
        options.image_list = None;
        assert!(options.image_selector().is_err());

        options.image_class = Some(ImageClass::Recommended);
        assert_eq!(
            options.image_selector().unwrap(),
            ImageSelector::Class(ImageClass::Recommended)
        );

        options.image_tag = Some("w_2077_44".to_string());
        assert!(options.image_selector().is_err());
    }

    #[test]
    fn test_status_from_phase() {
        assert_eq!(LabStatus::from_phase(PodPhase::Running), LabStatus::Running);
        assert_eq!(LabStatus::from_phase(PodPhase::Pending), LabStatus::Pending);
        assert_eq!(LabStatus::from_phase(PodPhase::Unknown), LabStatus::Pending);
        assert_eq!(LabStatus::from_phase(PodPhase::Succeeded), LabStatus::Terminated);
        assert_eq!(LabStatus::from_phase(PodPhase::Failed), LabStatus::Failed);
        assert!(!LabStatus::Failed.is_running());
        assert!(LabStatus::Terminating.is_running());
    }

    #[test]
    fn test_event_sse() {
        let event = Event::info("Creating namespace", 5);
        assert_eq!(
            event.to_sse(),
            "event: info\ndata: {\"message\":\"Creating namespace\",\"progress\":5}\n\n"
        );
        let event = Event::complete("Lab started");
        assert_eq!(event.to_sse(), "event: complete\ndata: {\"message\":\"Lab started\"}\n\n");
        assert!(event.done());
        assert!(!Event::error("oops").done());
    }
}

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::constants::{METADATA_PATH, RESERVED_ENV, RESERVED_PATHS};
use crate::errors::ControllerError;
use crate::models::kubernetes::Toleration;
use crate::models::lab::{LabSize, SizeDefinition};

fn default_spawn_timeout() -> u64 {
    600
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_activity_interval() -> u64 {
    3600
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_creation_timeout() -> u64 {
    120
}

fn default_delete_timeout() -> u64 {
    60
}

fn default_idle_timeout() -> u64 {
    3600
}

fn default_fileserver_reconcile_interval() -> u64 {
    3600
}

fn default_namespace_prefix() -> String {
    "userlabs".to_string()
}

fn default_fileserver_namespace() -> String {
    "fileservers".to_string()
}

fn default_recommended_tag() -> String {
    "recommended".to_string()
}

fn default_homedir_prefix() -> String {
    "/home".to_string()
}

fn default_runtime_mounts_dir() -> String {
    "/opt/lsst/software/jupyterlab".to_string()
}

fn default_lab_start_command() -> Vec<String> {
    vec!["/opt/lsst/software/jupyterlab/runlab.sh".to_string()]
}

fn default_metadata_path() -> PathBuf {
    PathBuf::from(METADATA_PATH)
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

/// Where a lab volume's data comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VolumeSource {
    #[serde(rename_all = "camelCase")]
    HostPath { path: String },
    #[serde(rename_all = "camelCase")]
    Nfs {
        server: String,
        server_path: String,
        #[serde(default)]
        read_only: bool,
    },
    #[serde(rename_all = "camelCase")]
    PersistentVolumeClaim {
        storage_class_name: String,
        access_modes: Vec<String>,
        size: String,
    },
}

/// A volume that can be mounted into labs and file servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabVolume {
    pub name: String,
    pub source: VolumeSource,
}

/// A mount of a configured volume into the lab container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabVolumeMount {
    pub container_path: String,
    pub volume_name: String,
    #[serde(default)]
    pub sub_path: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

/// One (source secret, key) pair copied into the lab secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabSecret {
    pub secret_name: String,
    pub secret_key: String,
    /// Environment variable to also expose the secret as.
    #[serde(default)]
    pub env: Option<String>,
    /// Path inside the lab to also mount the secret at.
    #[serde(default)]
    pub path: Option<String>,
}

/// Base contents of the lab /etc/passwd and /etc/group files, to which the
/// user and their groups are appended.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NssConfig {
    #[serde(default)]
    pub base_passwd: String,
    #[serde(default)]
    pub base_group: String,
}

/// Container image for init containers and file servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerImageConfig {
    pub repository: String,
    pub tag: String,
    #[serde(default = "default_pull_policy")]
    pub pull_policy: String,
}

/// An init container run before the lab container starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitContainerConfig {
    pub name: String,
    pub image: ContainerImageConfig,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub volume_mounts: Vec<LabVolumeMount>,
}

/// Scheme for constructing user home directory paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HomeDirectorySchema {
    Username,
    InitialThenUsername,
}

impl Default for HomeDirectorySchema {
    fn default() -> Self {
        HomeDirectorySchema::Username
    }
}

/// Whether the lab /tmp comes out of pod memory or node-local disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TmpSource {
    Memory,
    Disk,
}

impl Default for TmpSource {
    fn default() -> Self {
        TmpSource::Memory
    }
}

/// Configuration for user labs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabConfig {
    #[serde(default = "default_namespace_prefix")]
    pub namespace_prefix: String,
    /// Seconds allowed for a spawn or delete to complete.
    #[serde(default = "default_spawn_timeout")]
    pub spawn_timeout: u64,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: u64,
    #[serde(default = "default_activity_interval")]
    pub activity_interval: u64,
    pub sizes: Vec<SizeDefinition>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Vec<LabSecret>,
    #[serde(default)]
    pub pull_secret: Option<String>,
    /// Extra files mounted into the lab, keyed by path.
    #[serde(default)]
    pub files: HashMap<String, String>,
    #[serde(default)]
    pub nss: NssConfig,
    #[serde(default)]
    pub volumes: Vec<LabVolume>,
    #[serde(default)]
    pub volume_mounts: Vec<LabVolumeMount>,
    #[serde(default)]
    pub init_containers: Vec<InitContainerConfig>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub node_selector: HashMap<String, String>,
    #[serde(default)]
    pub extra_annotations: HashMap<String, String>,
    /// Argo CD application instance label to add to lab objects.
    #[serde(default)]
    pub application: Option<String>,
    #[serde(default = "default_homedir_prefix")]
    pub homedir_prefix: String,
    #[serde(default)]
    pub homedir_schema: HomeDirectorySchema,
    #[serde(default)]
    pub homedir_suffix: Option<String>,
    #[serde(default = "default_runtime_mounts_dir")]
    pub runtime_mounts_dir: String,
    #[serde(default = "default_runtime_mounts_dir")]
    pub jupyterlab_config_dir: String,
    #[serde(default = "default_lab_start_command")]
    pub lab_start_command: Vec<String>,
    #[serde(default)]
    pub tmp_source: TmpSource,
}

impl LabConfig {
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval)
    }

    pub fn get_size_definition(&self, size: LabSize) -> Result<&SizeDefinition, ControllerError> {
        self.sizes
            .iter()
            .find(|definition| definition.size == size)
            .ok_or_else(|| ControllerError::InvalidLabSize(size.to_string()))
    }
}

/// Where to find remote images.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerSourceConfig {
    pub registry: String,
    pub repository: String,
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,
}

/// Configuration for the image catalog and prepuller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepullerConfig {
    pub source: DockerSourceConfig,
    #[serde(default = "default_recommended_tag")]
    pub recommended_tag: String,
    #[serde(default)]
    pub num_releases: usize,
    #[serde(default)]
    pub num_weeklies: usize,
    #[serde(default)]
    pub num_dailies: usize,
    /// Restrict everything to one SAL cycle when set.
    #[serde(default)]
    pub cycle: Option<u32>,
    /// Additional tags to always prepull.
    #[serde(default)]
    pub pin: Vec<String>,
    #[serde(default)]
    pub alias_tags: Vec<String>,
    /// Display policy applied to the spawner menu and dropdown.
    #[serde(default)]
    pub filter_policy: crate::models::imagepolicy::RspImageFilterPolicy,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
}

impl PrepullerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }
}

/// Resource limits for the file server container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileserverResources {
    pub cpu: f64,
    pub memory: String,
}

/// Configuration for user file servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileserverConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_fileserver_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub image: Option<ContainerImageConfig>,
    #[serde(default = "default_creation_timeout")]
    pub creation_timeout: u64,
    #[serde(default = "default_delete_timeout")]
    pub delete_timeout: u64,
    /// Seconds of inactivity after which the file server exits.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default)]
    pub resources: Option<FileserverResources>,
    #[serde(default = "default_fileserver_reconcile_interval")]
    pub reconcile_interval: u64,
    #[serde(default)]
    pub application: Option<String>,
}

impl FileserverConfig {
    pub fn creation_timeout(&self) -> Duration {
        Duration::from_secs(self.creation_timeout)
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_secs(self.delete_timeout)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval)
    }
}

/// Top-level controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// External base URL of this science platform instance.
    pub base_url: String,
    /// URL path prefix of the controller itself.
    #[serde(default)]
    pub path_prefix: String,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub slack_webhook: Option<String>,
    #[serde(default = "default_metadata_path")]
    pub metadata_path: PathBuf,
    pub lab: LabConfig,
    pub images: PrepullerConfig,
    pub fileserver: FileserverConfig,
}

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Config, ControllerError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ControllerError::Config(format!("Cannot read {}: {e}", path.display())))?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Config, ControllerError> {
        let config: Config = serde_yaml::from_str(contents)
            .map_err(|e| ControllerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Enforce the configuration contract.
    ///
    /// Reserved environment variables and mount paths are rejected here, at
    /// parse time, rather than surfacing as broken labs later.
    pub fn validate(&self) -> Result<(), ControllerError> {
        for name in self.lab.env.keys() {
            if RESERVED_ENV.contains(&name.as_str()) || name.starts_with("JUPYTERHUB_") {
                let msg = format!("Reserved environment variable {name} may not be set");
                return Err(ControllerError::Config(msg));
            }
        }

        let mut mounted_paths: Vec<&str> =
            self.lab.volume_mounts.iter().map(|m| m.container_path.as_str()).collect();
        mounted_paths.extend(self.lab.files.keys().map(String::as_str));
        mounted_paths.extend(self.lab.secrets.iter().filter_map(|s| s.path.as_deref()));
        for path in mounted_paths {
            if RESERVED_PATHS.contains(&path) {
                let msg = format!("Reserved path {path} may not be mounted over");
                return Err(ControllerError::Config(msg));
            }
        }

        let mut seen_keys = std::collections::HashSet::new();
        for secret in &self.lab.secrets {
            if secret.secret_key == "token" {
                let msg = "Secret key token is reserved for the user token".to_string();
                return Err(ControllerError::Config(msg));
            }
            if !seen_keys.insert(secret.secret_key.as_str()) {
                let msg = format!("Duplicate secret key {}", secret.secret_key);
                return Err(ControllerError::Config(msg));
            }
        }

        let volume_names: std::collections::HashSet<&str> =
            self.lab.volumes.iter().map(|v| v.name.as_str()).collect();
        let mounts = self
            .lab
            .volume_mounts
            .iter()
            .chain(self.lab.init_containers.iter().flat_map(|c| c.volume_mounts.iter()));
        for mount in mounts {
            if !volume_names.contains(mount.volume_name.as_str()) {
                let msg = format!("Volume mount references unknown volume {}", mount.volume_name);
                return Err(ControllerError::Config(msg));
            }
        }

        if self.fileserver.enabled && self.fileserver.image.is_none() {
            let msg = "fileserver.image must be set when file servers are enabled".to_string();
            return Err(ControllerError::Config(msg));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> String {
        r#"
baseUrl: "https://data.example.org"
lab:
  sizes:
    - size: small
      cpu: 1.0
      memory: 3GiB
    - size: medium
      cpu: 2.0
      memory: 6GiB
images:
  source:
    registry: lighthouse.ceres
    repository: library/sketchbook
  numReleases: 1
  numWeeklies: 2
  numDailies: 3
fileserver:
  enabled: false
"#
        .to_string()
    }

    #[test]
    fn test_minimal_config() {
        let config = Config::from_yaml(&minimal_yaml()).unwrap();
        assert_eq!(config.lab.namespace_prefix, "userlabs");
        assert_eq!(config.lab.spawn_timeout(), Duration::from_secs(600));
        assert_eq!(config.images.recommended_tag, "recommended");
        assert_eq!(config.images.num_weeklies, 2);
        assert!(config.lab.get_size_definition(LabSize::Medium).is_ok());
        assert!(config.lab.get_size_definition(LabSize::Colossal).is_err());
    }

    #[test]
    fn test_reserved_env_rejected() {
        let yaml = minimal_yaml().replace(
            "lab:\n  sizes:",
            "lab:\n  env:\n    CPU_LIMIT: \"4\"\n  sizes:",
        );
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("CPU_LIMIT"));

        let yaml = minimal_yaml().replace(
            "lab:\n  sizes:",
            "lab:\n  env:\n    JUPYTERHUB_API_URL: \"x\"\n  sizes:",
        );
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_reserved_path_rejected() {
        let yaml = minimal_yaml().replace(
            "lab:\n  sizes:",
            concat!(
                "lab:\n",
                "  volumes:\n",
                "    - name: home\n",
                "      source:\n",
                "        type: nfs\n",
                "        server: 10.0.0.2\n",
                "        serverPath: /export/home\n",
                "  volumeMounts:\n",
                "    - containerPath: /tmp\n",
                "      volumeName: home\n",
                "  sizes:"
            ),
        );
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("/tmp"));
    }

    #[test]
    fn test_duplicate_secret_key_rejected() {
        let yaml = minimal_yaml().replace(
            "lab:\n  sizes:",
            concat!(
                "lab:\n",
                "  secrets:\n",
                "    - secretName: one\n",
                "      secretKey: shared\n",
                "    - secretName: two\n",
                "      secretKey: shared\n",
                "  sizes:"
            ),
        );
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate secret key"));
    }

    #[test]
    fn test_unknown_volume_rejected() {
        let yaml = minimal_yaml().replace(
            "lab:\n  sizes:",
            concat!(
                "lab:\n",
                "  volumeMounts:\n",
                "    - containerPath: /data\n",
                "      volumeName: nope\n",
                "  sizes:"
            ),
        );
        assert!(Config::from_yaml(&yaml).is_err());
    }
}

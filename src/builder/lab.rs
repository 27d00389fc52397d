use std::collections::BTreeMap;

use itertools::Itertools;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapEnvSource, ConfigMapVolumeSource, Container, ContainerPort,
    DownwardAPIVolumeFile, DownwardAPIVolumeSource, EmptyDirVolumeSource, EnvFromSource, EnvVar,
    EnvVarSource, KeyToPath, LocalObjectReference, Namespace, ObjectFieldSelector,
    PersistentVolumeClaim, Pod, PodSecurityContext, PodSpec, ResourceFieldSelector, ResourceQuota,
    ResourceQuotaSpec, Secret, SecretKeySelector, SecretVolumeSource, SecurityContext, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort,
    NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{HomeDirectorySchema, LabConfig, TmpSource};
use crate::constants::{ARGO_CD_ANNOTATIONS, MEMORY_TO_TMP_SIZE_RATIO};
use crate::models::kubernetes::PodPhase;
use crate::models::lab::{
    LabOptions, LabResources, LabSize, LabSpecification, LabState, LabStatus, ResourceQuantity,
    UserGroup, UserInfo,
};
use crate::models::rspimage::RspImage;
use super::volumes;

/// Annotation holding the serialized group list, since /etc/group contents
/// cannot be recovered from the pod alone.
const USER_GROUPS_ANNOTATION: &str = "nublado.lsst.io/user-groups";
const USER_NAME_ANNOTATION: &str = "nublado.lsst.io/user-name";

static FILE_KEY_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"[_.]").unwrap());

/// Names of the critical Kubernetes objects for one user's lab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabObjectNames {
    pub username: String,
    pub namespace: String,
    pub env_config_map: String,
    pub quota: String,
    pub pod: String,
}

/// The full set of objects making up one user's lab.
#[derive(Debug, Clone)]
pub struct LabObjects {
    pub namespace: Namespace,
    pub env_config_map: ConfigMap,
    pub config_maps: Vec<ConfigMap>,
    pub network_policy: NetworkPolicy,
    pub pvcs: Vec<PersistentVolumeClaim>,
    pub quota: Option<ResourceQuota>,
    pub secrets: Vec<Secret>,
    pub service: Service,
    pub pod: Pod,
}

/// The objects reconciliation reads back to reconstruct lab state.
#[derive(Debug, Clone)]
pub struct LabStateObjects {
    pub env_config_map: ConfigMap,
    pub quota: Option<ResourceQuota>,
    pub pod: Pod,
}

/// Construct Kubernetes objects for user lab environments.
///
/// All of the build methods are pure; nothing here talks to Kubernetes.
pub struct LabBuilder {
    config: LabConfig,
    base_url: String,
}

impl LabBuilder {
    pub fn new(config: LabConfig, base_url: &str) -> Self {
        LabBuilder { config, base_url: base_url.to_string() }
    }

    /// Determine the internal URL of a spawned lab.
    ///
    /// The hostname and port are fixed by the `Service` we create; the local
    /// part comes from an environment variable passed by JupyterHub.
    pub fn build_internal_url(&self, username: &str, env: &BTreeMap<String, String>) -> Option<String> {
        let namespace = format!("{}-{username}", self.config.namespace_prefix);
        let prefix = env.get("JUPYTERHUB_SERVICE_PREFIX")?;
        Some(format!("http://lab.{namespace}:8888{prefix}"))
    }

    pub fn build_object_names(&self, username: &str) -> LabObjectNames {
        LabObjectNames {
            username: username.to_string(),
            namespace: format!("{}-{username}", self.config.namespace_prefix),
            env_config_map: format!("{username}-nb-env"),
            quota: format!("{username}-nb"),
            pod: format!("{username}-nb"),
        }
    }

    /// All lab namespaces start with this prefix.
    pub fn namespace_prefix(&self) -> String {
        format!("{}-", self.config.namespace_prefix)
    }

    /// Construct the objects that make up a user's lab.
    pub fn build_lab(
        &self,
        user: &UserInfo,
        lab: &LabSpecification,
        image: &RspImage,
        secrets: BTreeMap<String, ByteString>,
        pull_secret: Option<&Secret>,
    ) -> Result<LabObjects, crate::errors::ControllerError> {
        Ok(LabObjects {
            namespace: self.build_namespace(&user.username),
            env_config_map: self.build_env_config_map(user, lab, image)?,
            config_maps: self.build_config_maps(user),
            network_policy: self.build_network_policy(&user.username),
            pvcs: self.build_pvcs(&user.username),
            quota: self.build_quota(user),
            secrets: self.build_secrets(&user.username, secrets, pull_secret),
            service: self.build_service(&user.username),
            pod: self.build_pod(user, lab, image)?,
        })
    }

    /// Recreate user lab state from the objects found in Kubernetes.
    ///
    /// The inverse of `build_lab`, used during reconciliation to rebuild
    /// internal state after a restart. Returns `None` on any inconsistency.
    pub fn recreate_lab_state(
        &self,
        username: &str,
        objects: Option<&LabStateObjects>,
    ) -> Option<LabState> {
        let objects = objects?;
        let pod = &objects.pod;
        let env = objects.env_config_map.data.as_ref()?;

        let lab_container =
            pod.spec.as_ref()?.containers.iter().find(|c| c.name == "notebook")?;

        let resources = LabResources {
            limits: ResourceQuantity {
                cpu: env.get("CPU_LIMIT")?.parse().ok()?,
                memory: env.get("MEM_LIMIT")?.parse().ok()?,
            },
            requests: ResourceQuantity {
                cpu: env.get("CPU_GUARANTEE")?.parse().ok()?,
                memory: env.get("MEM_GUARANTEE")?.parse().ok()?,
            },
        };
        let options = LabOptions {
            image: env.get("JUPYTER_IMAGE_SPEC")?.clone(),
            size: self.recreate_size(&resources),
            enable_debug: env.get("DEBUG").map(String::as_str) == Some("TRUE"),
            reset_user_env: env.get("RESET_USER_ENV").map(String::as_str) == Some("TRUE"),
        };
        let annotations = pod.metadata.annotations.as_ref();
        let security = lab_container.security_context.as_ref()?;
        let user = UserInfo {
            username: username.to_string(),
            name: annotations.and_then(|a| a.get(USER_NAME_ANNOTATION)).cloned(),
            uid: u32::try_from(security.run_as_user?).ok()?,
            gid: u32::try_from(security.run_as_group?).ok()?,
            groups: self.recreate_groups(pod)?,
            quota: None,
        };
        Some(LabState {
            user,
            options,
            status: LabStatus::from_phase(PodPhase::from_pod(pod)),
            internal_url: self.build_internal_url(username, env),
            resources,
            quota: self.recreate_quota(objects.quota.as_ref()),
        })
    }

    fn build_home_directory(&self, username: &str) -> String {
        let prefix = &self.config.homedir_prefix;
        let mut home = match self.config.homedir_schema {
            HomeDirectorySchema::Username => format!("{prefix}/{username}"),
            HomeDirectorySchema::InitialThenUsername => {
                let initial = &username[..1];
                format!("{prefix}/{initial}/{username}")
            }
        };
        if let Some(suffix) = &self.config.homedir_suffix {
            home = format!("{home}/{suffix}");
        }
        home
    }

    /// Standard metadata for lab objects: identifying labels plus the
    /// annotations that keep Argo CD from pruning them.
    fn build_metadata(&self, name: &str, username: &str) -> ObjectMeta {
        let mut labels = BTreeMap::from([
            ("nublado.lsst.io/category".to_string(), "lab".to_string()),
            ("nublado.lsst.io/user".to_string(), username.to_string()),
        ]);
        if let Some(application) = &self.config.application {
            labels.insert("argocd.argoproj.io/instance".to_string(), application.clone());
        }
        let annotations = ARGO_CD_ANNOTATIONS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..ObjectMeta::default()
        }
    }

    fn build_namespace(&self, username: &str) -> Namespace {
        let name = format!("{}-{username}", self.config.namespace_prefix);
        Namespace {
            metadata: self.build_metadata(&name, username),
            ..Namespace::default()
        }
    }

    fn build_config_maps(&self, user: &UserInfo) -> Vec<ConfigMap> {
        let mut config_maps = vec![self.build_nss_config_map(user)];
        if let Some(files) = self.build_file_config_map(&user.username) {
            config_maps.push(files);
        }
        config_maps
    }

    /// The config map holding the lab environment.
    ///
    /// Merge order matters: the spec environment is the base, the option
    /// flags and controller-computed variables are layered on top, and
    /// operator-configured environment wins last.
    fn build_env_config_map(
        &self,
        user: &UserInfo,
        lab: &LabSpecification,
        image: &RspImage,
    ) -> Result<ConfigMap, crate::errors::ControllerError> {
        let mut env: BTreeMap<String, String> =
            lab.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        if lab.options.enable_debug {
            env.insert("DEBUG".to_string(), "TRUE".to_string());
        }
        if lab.options.reset_user_env {
            env.insert("RESET_USER_ENV".to_string(), "TRUE".to_string());
        }

        let size = self.config.get_size_definition(lab.options.size)?;
        let resources = size.to_lab_resources()?;
        env.extend([
            // Deprecated in favor of JUPYTER_IMAGE_SPEC, but still used by
            // the lab extensions.
            ("JUPYTER_IMAGE".to_string(), image.reference_with_digest()),
            ("JUPYTER_IMAGE_SPEC".to_string(), image.reference_with_digest()),
            ("IMAGE_DESCRIPTION".to_string(), image.display_name().to_string()),
            ("IMAGE_DIGEST".to_string(), image.digest.clone()),
            ("CONTAINER_SIZE".to_string(), size.description()),
            ("CPU_GUARANTEE".to_string(), resources.requests.cpu.to_string()),
            ("CPU_LIMIT".to_string(), resources.limits.cpu.to_string()),
            ("MEM_GUARANTEE".to_string(), resources.requests.memory.to_string()),
            ("MEM_LIMIT".to_string(), resources.limits.memory.to_string()),
            (
                "JUPYTERHUB_ACTIVITY_INTERVAL".to_string(),
                self.config.activity_interval.to_string(),
            ),
            ("EXTERNAL_INSTANCE_URL".to_string(), self.base_url.clone()),
            (
                "JUPYTERLAB_CONFIG_DIR".to_string(),
                self.config.jupyterlab_config_dir.clone(),
            ),
            (
                "JUPYTERLAB_START_COMMAND".to_string(),
                self.config.lab_start_command.join(" "),
            ),
            (
                "NUBLADO_RUNTIME_MOUNTS_DIR".to_string(),
                self.config.runtime_mounts_dir.clone(),
            ),
        ]);

        // Operator-configured environment overrides anything the user sent
        // or anything computed above.
        env.extend(self.config.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let username = &user.username;
        Ok(ConfigMap {
            metadata: self.build_metadata(&format!("{username}-nb-env"), username),
            immutable: Some(true),
            data: Some(env),
            ..ConfigMap::default()
        })
    }

    fn build_file_config_map(&self, username: &str) -> Option<ConfigMap> {
        if self.config.files.is_empty() {
            return None;
        }
        let data = self
            .config
            .files
            .iter()
            .map(|(path, contents)| (file_key(path), contents.clone()))
            .collect();
        Some(ConfigMap {
            metadata: self.build_metadata(&format!("{username}-nb-files"), username),
            immutable: Some(true),
            data: Some(data),
            ..ConfigMap::default()
        })
    }

    /// The config map holding the /etc/passwd and /etc/group files,
    /// constructed by appending the user and their groups to configured base
    /// files.
    fn build_nss_config_map(&self, user: &UserInfo) -> ConfigMap {
        let homedir = self.build_home_directory(&user.username);
        let display_name = user.name.as_deref().unwrap_or(&user.username);
        let mut etc_passwd = self.config.nss.base_passwd.clone();
        etc_passwd.push_str(&format!(
            "{}:x:{}:{}:{display_name}:{homedir}:/bin/bash\n",
            user.username, user.uid, user.gid
        ));

        // The user appears as a member of their supplemental groups but not
        // of their primary group.
        let mut etc_group = self.config.nss.base_group.clone();
        for group in &user.groups {
            let Some(gid) = group.id else { continue };
            if gid == user.gid {
                etc_group.push_str(&format!("{}:x:{gid}:\n", group.name));
            } else {
                etc_group.push_str(&format!("{}:x:{gid}:{}\n", group.name, user.username));
            }
        }

        let username = &user.username;
        ConfigMap {
            metadata: self.build_metadata(&format!("{username}-nb-nss"), username),
            immutable: Some(true),
            data: Some(BTreeMap::from([
                ("passwd".to_string(), etc_passwd),
                ("group".to_string(), etc_group),
            ])),
            ..ConfigMap::default()
        }
    }

    /// Ingress is allowed only from pods in the same namespace and from the
    /// JupyterHub pod.
    fn build_network_policy(&self, username: &str) -> NetworkPolicy {
        let lab_selector = LabelSelector {
            match_labels: Some(BTreeMap::from([
                ("nublado.lsst.io/category".to_string(), "lab".to_string()),
                ("nublado.lsst.io/user".to_string(), username.to_string()),
            ])),
            ..LabelSelector::default()
        };
        let hub_selector = LabelSelector {
            match_labels: Some(BTreeMap::from([(
                "app".to_string(),
                "jupyterhub".to_string(),
            )])),
            ..LabelSelector::default()
        };
        NetworkPolicy {
            metadata: self.build_metadata(&format!("{username}-nb"), username),
            spec: Some(NetworkPolicySpec {
                policy_types: Some(vec!["Ingress".to_string()]),
                pod_selector: lab_selector.clone(),
                ingress: Some(vec![NetworkPolicyIngressRule {
                    from: Some(vec![
                        NetworkPolicyPeer {
                            namespace_selector: Some(lab_selector),
                            ..NetworkPolicyPeer::default()
                        },
                        NetworkPolicyPeer {
                            namespace_selector: Some(LabelSelector::default()),
                            pod_selector: Some(hub_selector),
                            ..NetworkPolicyPeer::default()
                        },
                    ]),
                    ports: Some(vec![NetworkPolicyPort {
                        port: Some(IntOrString::Int(8888)),
                        ..NetworkPolicyPort::default()
                    }]),
                }]),
                ..NetworkPolicySpec::default()
            }),
        }
    }

    fn build_pvcs(&self, username: &str) -> Vec<PersistentVolumeClaim> {
        let mounted: std::collections::HashSet<&str> =
            self.config.volume_mounts.iter().map(|m| m.volume_name.as_str()).collect();
        self.config
            .volumes
            .iter()
            .filter(|volume| mounted.contains(volume.name.as_str()))
            .filter_map(|volume| {
                let spec = volumes::build_pvc_spec(volume)?;
                let name = format!("{username}-nb-pvc-{}", volume.name);
                Some(PersistentVolumeClaim {
                    metadata: self.build_metadata(&name, username),
                    spec: Some(spec),
                    ..PersistentVolumeClaim::default()
                })
            })
            .collect()
    }

    fn build_quota(&self, user: &UserInfo) -> Option<ResourceQuota> {
        let notebook = user.quota.as_ref()?.notebook?;
        let username = &user.username;
        Some(ResourceQuota {
            metadata: self.build_metadata(&format!("{username}-nb"), username),
            spec: Some(ResourceQuotaSpec {
                hard: Some(BTreeMap::from([
                    ("limits.cpu".to_string(), Quantity(notebook.cpu.to_string())),
                    (
                        "limits.memory".to_string(),
                        Quantity(notebook.memory_bytes().to_string()),
                    ),
                ])),
                ..ResourceQuotaSpec::default()
            }),
            ..ResourceQuota::default()
        })
    }

    fn build_secrets(
        &self,
        username: &str,
        data: BTreeMap<String, ByteString>,
        pull_secret: Option<&Secret>,
    ) -> Vec<Secret> {
        let mut secrets = vec![Secret {
            metadata: self.build_metadata(&format!("{username}-nb"), username),
            data: Some(data),
            immutable: Some(true),
            type_: Some("Opaque".to_string()),
            ..Secret::default()
        }];
        if let Some(pull_secret) = pull_secret {
            secrets.push(Secret {
                metadata: self.build_metadata("pull-secret", username),
                data: pull_secret.data.clone(),
                immutable: Some(true),
                type_: pull_secret.type_.clone(),
                ..Secret::default()
            });
        }
        secrets
    }

    fn build_service(&self, username: &str) -> Service {
        Service {
            metadata: self.build_metadata("lab", username),
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port: 8888,
                    target_port: Some(IntOrString::Int(8888)),
                    ..ServicePort::default()
                }]),
                selector: Some(BTreeMap::from([
                    ("nublado.lsst.io/category".to_string(), "lab".to_string()),
                    ("nublado.lsst.io/user".to_string(), username.to_string()),
                ])),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }

    fn build_pod(
        &self,
        user: &UserInfo,
        lab: &LabSpecification,
        image: &RspImage,
    ) -> Result<Pod, crate::errors::ControllerError> {
        let username = &user.username;
        let size = self.config.get_size_definition(lab.options.size)?;
        let resources = size.to_lab_resources()?;

        let mut metadata = self.build_metadata(&format!("{username}-nb"), username);
        let annotations = metadata.annotations.get_or_insert_default();
        annotations.insert(USER_GROUPS_ANNOTATION.to_string(), user.groups_json());
        if let Some(name) = &user.name {
            annotations.insert(USER_NAME_ANNOTATION.to_string(), name.clone());
        }
        annotations
            .extend(self.config.extra_annotations.iter().map(|(k, v)| (k.clone(), v.clone())));

        // Gather the volume and volume mount definitions.
        let mut mounted = Vec::new();
        mounted.extend(self.build_pod_nss_volumes(username));
        mounted.extend(self.build_pod_file_volumes(username));
        mounted.push(self.build_pod_secret_volume(username));
        mounted.push(self.build_pod_env_volume(username));
        mounted.push(self.build_pod_tmp_volume(resources.limits.memory));
        mounted.push(self.build_pod_downward_api_volume());

        let mut pod_volumes =
            volumes::build_volumes(&self.config.volumes, &format!("{username}-nb"));
        pod_volumes.extend(mounted.iter().map(|m| m.volume.clone()));

        let mut mounts = volumes::build_mounts(&self.config.volume_mounts);
        mounts.extend(mounted.iter().map(|m| m.volume_mount.clone()));
        for secret in &self.config.secrets {
            let Some(path) = &secret.path else { continue };
            mounts.push(VolumeMount {
                mount_path: path.clone(),
                name: "secrets".to_string(),
                read_only: Some(true),
                sub_path: Some(secret.secret_key.clone()),
                ..VolumeMount::default()
            });
        }

        let containers = self.build_pod_containers(user, mounts, &resources, image);
        let init_containers = self.build_pod_init_containers(user, &resources);
        let pull_secrets = self
            .config
            .pull_secret
            .as_ref()
            .map(|_| vec![LocalObjectReference { name: "pull-secret".to_string() }]);
        let node_selector = if self.config.node_selector.is_empty() {
            None
        } else {
            Some(self.config.node_selector.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        };
        let tolerations: Vec<_> =
            self.config.tolerations.iter().map(|t| t.to_kubernetes()).collect();

        Ok(Pod {
            metadata,
            spec: Some(PodSpec {
                automount_service_account_token: Some(false),
                containers,
                image_pull_secrets: pull_secrets,
                init_containers: if init_containers.is_empty() {
                    None
                } else {
                    Some(init_containers)
                },
                node_selector,
                restart_policy: Some("OnFailure".to_string()),
                security_context: Some(PodSecurityContext {
                    supplemental_groups: Some(user.supplemental_groups()),
                    ..PodSecurityContext::default()
                }),
                tolerations: if tolerations.is_empty() { None } else { Some(tolerations) },
                volumes: Some(pod_volumes),
                ..PodSpec::default()
            }),
            ..Pod::default()
        })
    }

    fn build_pod_config_map_volume(&self, config_map: &str, path: &str) -> volumes::MountedVolume {
        let subpath = path.rsplit('/').next().unwrap_or(path).to_string();
        let name = file_key(&subpath);
        volumes::MountedVolume {
            volume: Volume {
                name: name.clone(),
                config_map: Some(ConfigMapVolumeSource {
                    name: config_map.to_string(),
                    items: Some(vec![KeyToPath {
                        mode: Some(0o644),
                        key: name.clone(),
                        path: subpath.clone(),
                    }]),
                    ..ConfigMapVolumeSource::default()
                }),
                ..Volume::default()
            },
            volume_mount: VolumeMount {
                mount_path: path.to_string(),
                name,
                read_only: Some(true),
                sub_path: Some(subpath),
                ..VolumeMount::default()
            },
        }
    }

    fn build_pod_nss_volumes(&self, username: &str) -> Vec<volumes::MountedVolume> {
        ["/etc/passwd", "/etc/group"]
            .iter()
            .map(|path| self.build_pod_config_map_volume(&format!("{username}-nb-nss"), path))
            .collect()
    }

    fn build_pod_file_volumes(&self, username: &str) -> Vec<volumes::MountedVolume> {
        self.config
            .files
            .keys()
            .sorted()
            .map(|path| self.build_pod_config_map_volume(&format!("{username}-nb-files"), path))
            .collect()
    }

    /// All lab secrets are mounted in one directory under the runtime
    /// mounts tree; individual paths and environment variables are layered
    /// on top for compatibility.
    fn build_pod_secret_volume(&self, username: &str) -> volumes::MountedVolume {
        volumes::MountedVolume {
            volume: Volume {
                name: "secrets".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(format!("{username}-nb")),
                    ..SecretVolumeSource::default()
                }),
                ..Volume::default()
            },
            volume_mount: VolumeMount {
                mount_path: format!("{}/secrets", self.config.runtime_mounts_dir),
                name: "secrets".to_string(),
                read_only: Some(true),
                ..VolumeMount::default()
            },
        }
    }

    fn build_pod_env_volume(&self, username: &str) -> volumes::MountedVolume {
        volumes::MountedVolume {
            volume: Volume {
                name: "env".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: format!("{username}-nb-env"),
                    ..ConfigMapVolumeSource::default()
                }),
                ..Volume::default()
            },
            volume_mount: VolumeMount {
                mount_path: format!("{}/environment", self.config.runtime_mounts_dir),
                name: "env".to_string(),
                read_only: Some(true),
                ..VolumeMount::default()
            },
        }
    }

    /// A writable /tmp sized at a quarter of the memory limit. The `Memory`
    /// medium makes this tmpfs, charged against the pod memory allocation
    /// rather than node disk.
    fn build_pod_tmp_volume(&self, memory_limit: u64) -> volumes::MountedVolume {
        let medium = match self.config.tmp_source {
            TmpSource::Memory => Some("Memory".to_string()),
            TmpSource::Disk => None,
        };
        volumes::MountedVolume {
            volume: Volume {
                name: "tmp".to_string(),
                empty_dir: Some(EmptyDirVolumeSource {
                    medium,
                    size_limit: Some(Quantity(
                        (memory_limit / MEMORY_TO_TMP_SIZE_RATIO).to_string(),
                    )),
                }),
                ..Volume::default()
            },
            volume_mount: VolumeMount {
                mount_path: "/tmp".to_string(),
                name: "tmp".to_string(),
                read_only: Some(false),
                ..VolumeMount::default()
            },
        }
    }

    /// Expose the container resource limits and requests as files via the
    /// downward API.
    fn build_pod_downward_api_volume(&self) -> volumes::MountedVolume {
        let fields = ["limits.cpu", "requests.cpu", "limits.memory", "requests.memory"];
        let items = fields
            .iter()
            .map(|field| DownwardAPIVolumeFile {
                resource_field_ref: Some(ResourceFieldSelector {
                    container_name: Some("notebook".to_string()),
                    resource: field.to_string(),
                    divisor: None,
                }),
                path: field.replace('.', "_"),
                ..DownwardAPIVolumeFile::default()
            })
            .collect();
        volumes::MountedVolume {
            volume: Volume {
                name: "runtime".to_string(),
                downward_api: Some(DownwardAPIVolumeSource {
                    items: Some(items),
                    ..DownwardAPIVolumeSource::default()
                }),
                ..Volume::default()
            },
            volume_mount: VolumeMount {
                mount_path: format!("{}/runtime", self.config.runtime_mounts_dir),
                name: "runtime".to_string(),
                read_only: Some(true),
                ..VolumeMount::default()
            },
        }
    }

    fn build_pod_init_containers(
        &self,
        user: &UserInfo,
        resources: &LabResources,
    ) -> Vec<Container> {
        let as_root = SecurityContext {
            allow_privilege_escalation: Some(true),
            privileged: Some(true),
            read_only_root_filesystem: Some(true),
            run_as_non_root: Some(false),
            run_as_user: Some(0),
            ..SecurityContext::default()
        };
        let as_user = SecurityContext {
            allow_privilege_escalation: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["all".to_string()]),
                ..Capabilities::default()
            }),
            read_only_root_filesystem: Some(true),
            run_as_non_root: Some(true),
            run_as_user: Some(user.uid.into()),
            run_as_group: Some(user.gid.into()),
            ..SecurityContext::default()
        };

        // Init containers get the same environment config map as the
        // notebook container plus the variables that form our provisioning
        // interface.
        let env_source = ConfigMapEnvSource {
            name: format!("{}-nb-env", user.username),
            optional: None,
        };
        let env = vec![
            EnvVar {
                name: "NUBLADO_HOME".to_string(),
                value: Some(self.build_home_directory(&user.username)),
                value_from: None,
            },
            EnvVar {
                name: "NUBLADO_UID".to_string(),
                value: Some(user.uid.to_string()),
                value_from: None,
            },
            EnvVar {
                name: "NUBLADO_GID".to_string(),
                value: Some(user.gid.to_string()),
                value_from: None,
            },
        ];

        self.config
            .init_containers
            .iter()
            .map(|spec| Container {
                name: spec.name.clone(),
                env: Some(env.clone()),
                env_from: Some(vec![EnvFromSource {
                    config_map_ref: Some(env_source.clone()),
                    ..EnvFromSource::default()
                }]),
                image: Some(format!("{}:{}", spec.image.repository, spec.image.tag)),
                image_pull_policy: Some(spec.image.pull_policy.clone()),
                resources: Some(resources.to_kubernetes()),
                security_context: Some(if spec.privileged {
                    as_root.clone()
                } else {
                    as_user.clone()
                }),
                volume_mounts: Some(volumes::build_mounts(&spec.volume_mounts)),
                ..Container::default()
            })
            .collect()
    }

    fn build_pod_containers(
        &self,
        user: &UserInfo,
        mounts: Vec<VolumeMount>,
        resources: &LabResources,
        image: &RspImage,
    ) -> Vec<Container> {
        // Environment on top of the env config map: the values that cannot
        // be known before the pod is scheduled, plus the user's token.
        let mut env = vec![
            EnvVar {
                name: "ACCESS_TOKEN".to_string(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        key: "token".to_string(),
                        name: format!("{}-nb", user.username),
                        optional: Some(false),
                    }),
                    ..EnvVarSource::default()
                }),
            },
            EnvVar {
                name: "KUBERNETES_NODE_NAME".to_string(),
                value: None,
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "spec.nodeName".to_string(),
                        api_version: None,
                    }),
                    ..EnvVarSource::default()
                }),
            },
            // Deprecated spelling still used by older lab clients.
            EnvVar {
                name: "K8S_NODE_NAME".to_string(),
                value: None,
                value_from: Some(EnvVarSource {
                    field_ref: Some(ObjectFieldSelector {
                        field_path: "spec.nodeName".to_string(),
                        api_version: None,
                    }),
                    ..EnvVarSource::default()
                }),
            },
        ];
        for secret in &self.config.secrets {
            let Some(variable) = &secret.env else { continue };
            env.push(EnvVar {
                name: variable.clone(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        key: secret.secret_key.clone(),
                        name: format!("{}-nb", user.username),
                        optional: Some(false),
                    }),
                    ..EnvVarSource::default()
                }),
            });
        }

        let env_source = ConfigMapEnvSource {
            name: format!("{}-nb-env", user.username),
            optional: None,
        };
        vec![Container {
            name: "notebook".to_string(),
            args: Some(self.config.lab_start_command.clone()),
            env: Some(env),
            env_from: Some(vec![EnvFromSource {
                config_map_ref: Some(env_source),
                ..EnvFromSource::default()
            }]),
            image: Some(image.reference_with_digest()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            ports: Some(vec![ContainerPort {
                container_port: 8888,
                name: Some("jupyterlab".to_string()),
                ..ContainerPort::default()
            }]),
            resources: Some(resources.to_kubernetes()),
            security_context: Some(SecurityContext {
                allow_privilege_escalation: Some(false),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["all".to_string()]),
                    ..Capabilities::default()
                }),
                read_only_root_filesystem: Some(true),
                run_as_non_root: Some(true),
                run_as_user: Some(user.uid.into()),
                run_as_group: Some(user.gid.into()),
                ..SecurityContext::default()
            }),
            volume_mounts: Some(mounts),
            working_dir: Some(self.build_home_directory(&user.username)),
            ..Container::default()
        }]
    }

    /// Group names cannot be recovered from /etc/group contents in the pod,
    /// so they round-trip through a pod annotation.
    fn recreate_groups(&self, pod: &Pod) -> Option<Vec<UserGroup>> {
        let serialized = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(USER_GROUPS_ANNOTATION))
            .map(String::as_str)
            .unwrap_or("[]");
        serde_json::from_str(serialized).ok()
    }

    fn recreate_quota(&self, quota: Option<&ResourceQuota>) -> Option<ResourceQuantity> {
        let hard = quota?.spec.as_ref()?.hard.as_ref()?;
        Some(ResourceQuantity {
            cpu: hard.get("limits.cpu")?.0.parse().ok()?,
            memory: hard.get("limits.memory")?.0.parse().ok()?,
        })
    }

    /// Match reconciled resources back to a configured size, falling back to
    /// the custom sentinel.
    fn recreate_size(&self, resources: &LabResources) -> LabSize {
        for definition in &self.config.sizes {
            let Ok(memory) = definition.memory_bytes() else { continue };
            if definition.cpu == resources.limits.cpu && memory == resources.limits.memory {
                return definition.size;
            }
        }
        LabSize::Custom
    }
}

/// Config map keys may not contain underscores or dots, so file names are
/// normalized when used as keys.
fn file_key(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    FILE_KEY_REGEX.replace_all(name, "-").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::config::Config;
    use crate::models::lab::{LabRequestOptions, NotebookQuota, UserQuota};
    use crate::models::rsptag::RspImageTag;

    fn test_config() -> LabConfig {
        let yaml = r#"
baseUrl: "https://data.example.org"
lab:
  env:
    AUTO_REPO_URLS: "https://github.com/lsst-sqre/system-test"
  nss:
    basePasswd: "root:x:0:0:root:/root:/bin/bash\n"
    baseGroup: "root:x:0:\n"
  sizes:
    - size: small
      cpu: 1.0
      memory: 2GiB
    - size: medium
      cpu: 2.0
      memory: 4GiB
images:
  source:
    registry: lighthouse.ceres
    repository: library/sketchbook
fileserver:
  enabled: false
"#;
        Config::from_yaml(yaml).unwrap().lab
    }

    fn test_user() -> UserInfo {
        UserInfo {
            username: "rachel".to_string(),
            name: Some("Rachel (?)".to_string()),
            uid: 1101,
            gid: 1101,
            groups: vec![
                UserGroup { name: "rachel".to_string(), id: Some(1101) },
                UserGroup { name: "lunatics".to_string(), id: Some(2028) },
                UserGroup { name: "disabled".to_string(), id: None },
            ],
            quota: Some(UserQuota {
                api: HashMap::new(),
                notebook: Some(NotebookQuota { cpu: 9.0, memory: 27.0 }),
            }),
        }
    }

    fn test_spec() -> LabSpecification {
        LabSpecification {
            options: LabRequestOptions {
                image_list: None,
                image_dropdown: None,
                image_class: None,
                image_tag: Some("w_2077_43".to_string()),
                size: LabSize::Medium,
                enable_debug: false,
                reset_user_env: false,
            },
            env: HashMap::from([(
                "JUPYTERHUB_SERVICE_PREFIX".to_string(),
                "/nb/user/rachel/".to_string(),
            )]),
        }
    }

    fn test_image() -> RspImage {
        RspImage::new(
            "lighthouse.ceres",
            "library/sketchbook",
            RspImageTag::from_str("w_2077_43"),
            "sha256:e693782192ecef4f7846ad2b21b1574682e70074746094e29675d559d48d2510",
        )
    }

    fn builder() -> LabBuilder {
        LabBuilder::new(test_config(), "https://data.example.org")
    }

    #[test]
    fn test_object_names() {
        let names = builder().build_object_names("rachel");
        assert_eq!(names.namespace, "userlabs-rachel");
        assert_eq!(names.env_config_map, "rachel-nb-env");
        assert_eq!(names.pod, "rachel-nb");
    }

    #[test]
    fn test_env_config_map_merge() {
        let objects = builder()
            .build_lab(&test_user(), &test_spec(), &test_image(), BTreeMap::new(), None)
            .unwrap();
        let env = objects.env_config_map.data.unwrap();

        // Controller-computed values.
        assert_eq!(
            env.get("JUPYTER_IMAGE_SPEC").unwrap(),
            &test_image().reference_with_digest()
        );
        assert_eq!(env.get("CPU_LIMIT").unwrap(), "2");
        assert_eq!(env.get("CPU_GUARANTEE").unwrap(), "0.5");
        assert_eq!(env.get("MEM_LIMIT").unwrap(), &(4u64 << 30).to_string());
        assert_eq!(env.get("EXTERNAL_INSTANCE_URL").unwrap(), "https://data.example.org");
        // User-supplied and operator values survive.
        assert_eq!(env.get("JUPYTERHUB_SERVICE_PREFIX").unwrap(), "/nb/user/rachel/");
        assert_eq!(
            env.get("AUTO_REPO_URLS").unwrap(),
            "https://github.com/lsst-sqre/system-test"
        );
        // Flags only appear when requested.
        assert!(!env.contains_key("DEBUG"));
        assert!(!env.contains_key("RESET_USER_ENV"));
    }

    #[test]
    fn test_operator_env_wins_last() {
        let mut config = test_config();
        config.env.insert("EXTERNAL_INSTANCE_URL".to_string(), "https://other".to_string());
        let builder = LabBuilder::new(config, "https://data.example.org");
        let objects = builder
            .build_lab(&test_user(), &test_spec(), &test_image(), BTreeMap::new(), None)
            .unwrap();
        let env = objects.env_config_map.data.unwrap();
        assert_eq!(env.get("EXTERNAL_INSTANCE_URL").unwrap(), "https://other");
    }

    #[test]
    fn test_nss_config_map() {
        let objects = builder()
            .build_lab(&test_user(), &test_spec(), &test_image(), BTreeMap::new(), None)
            .unwrap();
        let nss = &objects.config_maps[0];
        let data = nss.data.as_ref().unwrap();
        assert_eq!(
            data.get("passwd").unwrap(),
            "root:x:0:0:root:/root:/bin/bash\n\
             rachel:x:1101:1101:Rachel (?):/home/rachel:/bin/bash\n"
        );
        // Groups without GIDs are dropped; the user is a member of the
        // supplemental group but not the primary one.
        assert_eq!(
            data.get("group").unwrap(),
            "root:x:0:\nrachel:x:1101:\nlunatics:x:2028:rachel\n"
        );
    }

    #[test]
    fn test_pod_shape() {
        let objects = builder()
            .build_lab(&test_user(), &test_spec(), &test_image(), BTreeMap::new(), None)
            .unwrap();
        let spec = objects.pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("OnFailure"));
        assert_eq!(spec.automount_service_account_token, Some(false));
        assert_eq!(
            spec.security_context.unwrap().supplemental_groups.unwrap(),
            vec![1101, 2028]
        );

        let container = &spec.containers[0];
        assert_eq!(container.name, "notebook");
        assert_eq!(container.working_dir.as_deref(), Some("/home/rachel"));
        let security = container.security_context.as_ref().unwrap();
        assert_eq!(security.run_as_user, Some(1101));
        assert_eq!(security.read_only_root_filesystem, Some(true));

        // tmpfs /tmp sized at a quarter of the memory limit.
        let tmp = spec.volumes.unwrap().into_iter().find(|v| v.name == "tmp").unwrap();
        let empty_dir = tmp.empty_dir.unwrap();
        assert_eq!(empty_dir.medium.as_deref(), Some("Memory"));
        assert_eq!(empty_dir.size_limit.unwrap().0, (1u64 << 30).to_string());

        // Groups round-trip through the annotation.
        let annotations = objects.pod.metadata.annotations.unwrap();
        assert!(annotations.contains_key(USER_GROUPS_ANNOTATION));
        assert_eq!(
            annotations.get("argocd.argoproj.io/compare-options").map(String::as_str),
            Some("IgnoreExtraneous")
        );
    }

    #[test]
    fn test_quota_only_with_notebook_quota() {
        let objects = builder()
            .build_lab(&test_user(), &test_spec(), &test_image(), BTreeMap::new(), None)
            .unwrap();
        let quota = objects.quota.unwrap();
        let hard = quota.spec.unwrap().hard.unwrap();
        assert_eq!(hard.get("limits.cpu").unwrap().0, "9");

        let mut user = test_user();
        user.quota = None;
        let objects = builder()
            .build_lab(&user, &test_spec(), &test_image(), BTreeMap::new(), None)
            .unwrap();
        assert!(objects.quota.is_none());
    }

    #[test]
    fn test_recreate_lab_state_round_trip() {
        let builder = builder();
        let user = test_user();
        let spec = test_spec();
        let image = test_image();
        let objects = builder
            .build_lab(&user, &spec, &image, BTreeMap::new(), None)
            .unwrap();

        let state_objects = LabStateObjects {
            env_config_map: objects.env_config_map.clone(),
            quota: objects.quota.clone(),
            pod: objects.pod.clone(),
        };
        let state = builder.recreate_lab_state("rachel", Some(&state_objects)).unwrap();

        assert_eq!(state.user.username, "rachel");
        assert_eq!(state.user.uid, 1101);
        assert_eq!(state.user.groups, user.groups);
        assert_eq!(state.options.image, image.reference_with_digest());
        assert_eq!(state.options.size, LabSize::Medium);
        assert!(!state.options.enable_debug);
        let size = builder.config.get_size_definition(LabSize::Medium).unwrap();
        assert_eq!(state.resources, size.to_lab_resources().unwrap());
        let quota = state.quota.unwrap();
        assert_eq!(quota.cpu, 9.0);
        assert_eq!(quota.memory, 27 * (1u64 << 30));
        assert_eq!(
            state.internal_url.as_deref(),
            Some("http://lab.userlabs-rachel:8888/nb/user/rachel/")
        );

        // A pod without the notebook container is an inconsistency.
        let mut broken = state_objects.clone();
        broken.pod.spec.as_mut().unwrap().containers[0].name = "other".to_string();
        assert!(builder.recreate_lab_state("rachel", Some(&broken)).is_none());
        assert!(builder.recreate_lab_state("rachel", None).is_none());
    }

    #[test]
    fn test_recreate_size_falls_back_to_custom() {
        let builder = builder();
        let resources = LabResources {
            limits: ResourceQuantity { cpu: 17.0, memory: 1 << 30 },
            requests: ResourceQuantity { cpu: 4.25, memory: 1 << 28 },
        };
        assert_eq!(builder.recreate_size(&resources), LabSize::Custom);
    }

    #[test]
    fn test_file_key() {
        assert_eq!(file_key("/opt/lsst/software/jupyterlab/idle_culler.py"), "idle-culler-py");
        assert_eq!(file_key("plain"), "plain");
    }
}

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaim, Pod, PodSecurityContext, PodSpec,
    PodTemplateSpec, SecurityContext, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::api::DynamicObject;
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::config::{FileserverConfig, LabVolume};
use crate::constants::ARGO_CD_ANNOTATIONS;
use crate::errors::ControllerError;
use crate::models::fileserver::{FileserverObjects, FileserverStateObjects};
use crate::models::lab::UserInfo;
use super::volumes;

static FILESERVER_NAME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.*)-fs$").unwrap());

/// Construct Kubernetes objects for user file servers.
pub struct FileserverBuilder {
    config: FileserverConfig,
    base_url: String,
    volumes: Vec<LabVolume>,
}

impl FileserverBuilder {
    pub fn new(config: FileserverConfig, base_url: &str, volumes: Vec<LabVolume>) -> Self {
        FileserverBuilder { config, base_url: base_url.to_string(), volumes }
    }

    /// All objects for a user's file server share one name.
    pub fn build_name(&self, username: &str) -> String {
        format!("{username}-fs")
    }

    pub fn build(&self, user: &UserInfo) -> Result<FileserverObjects, ControllerError> {
        Ok(FileserverObjects {
            ingress: self.build_ingress(&user.username)?,
            service: self.build_service(&user.username),
            job: self.build_job(user)?,
            pvcs: self.build_pvcs(&user.username),
        })
    }

    /// Determine the username for a file server pod, from the user label
    /// with the pod name as a fallback.
    pub fn username_for_pod(&self, pod: &Pod) -> Option<String> {
        if let Some(labels) = &pod.metadata.labels
            && let Some(username) = labels.get("nublado.lsst.io/user")
        {
            return Some(username.clone());
        }
        FILESERVER_NAME_REGEX
            .captures(&pod.name_any())
            .map(|captures| captures[1].to_string())
    }

    /// Whether a discovered file server is actually running: the pod must be
    /// in Running phase and the ingress must have an IP.
    pub fn is_valid(&self, username: &str, state: &FileserverStateObjects) -> bool {
        let Some(pod) = &state.pod else {
            info!(user = username, "File server pod does not exist");
            return false;
        };
        let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
        if phase != Some("Running") {
            info!(user = username, phase = phase.unwrap_or("none"), "File server pod is not running");
            return false;
        }
        let Some(ingress) = &state.ingress else {
            info!(user = username, "File server ingress does not exist");
            return false;
        };
        if !crate::kubernetes::ingress::ingress_has_ip_address(ingress) {
            info!(user = username, "Ingress does not have IP address");
            return false;
        }
        debug!(user = username, "File server is running");
        true
    }

    fn build_metadata(&self, username: &str) -> ObjectMeta {
        let mut labels = BTreeMap::from([
            ("nublado.lsst.io/category".to_string(), "fileserver".to_string()),
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
            name: Some(self.build_name(username)),
            labels: Some(labels),
            annotations: Some(annotations),
            ..ObjectMeta::default()
        }
    }

    /// The `GafaelfawrIngress` custom object. The identity service turns
    /// this into a real `Ingress` with authentication attached.
    fn build_ingress(&self, username: &str) -> Result<DynamicObject, ControllerError> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| ControllerError::Config(format!("Invalid base URL: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| ControllerError::Config("Base URL has no host".to_string()))?;
        let name = self.build_name(username);

        let body = serde_json::json!({
            "apiVersion": "gafaelfawr.lsst.io/v1alpha1",
            "kind": "GafaelfawrIngress",
            "config": {
                "baseUrl": self.base_url,
                "scopes": {"all": ["exec:notebook"]},
                "loginRedirect": false,
                "authType": "basic",
            },
            "template": {
                "metadata": {
                    "name": name,
                    "labels": {
                        "nublado.lsst.io/category": "fileserver",
                        "nublado.lsst.io/user": username,
                    },
                },
                "spec": {
                    "rules": [{
                        "host": host,
                        "http": {
                            "paths": [{
                                "path": format!("/files/{username}"),
                                "pathType": "Prefix",
                                "backend": {
                                    "service": {
                                        "name": name,
                                        "port": {"number": 8000},
                                    }
                                },
                            }],
                        },
                    }],
                },
            },
        });

        let mut object = DynamicObject {
            types: Some(kube::api::TypeMeta {
                api_version: "gafaelfawr.lsst.io/v1alpha1".to_string(),
                kind: "GafaelfawrIngress".to_string(),
            }),
            metadata: self.build_metadata(username),
            data: body,
        };
        // apiVersion and kind live in types; keep data to the custom fields.
        if let Some(data) = object.data.as_object_mut() {
            data.remove("apiVersion");
            data.remove("kind");
        }
        Ok(object)
    }

    fn build_job(&self, user: &UserInfo) -> Result<Job, ControllerError> {
        let Some(image) = &self.config.image else {
            return Err(ControllerError::NotConfigured);
        };
        let name = self.build_name(&user.username);
        let volume_data =
            volumes::build_mounted_volumes(&self.volumes, &name, "/mnt");
        let url = format!("/files/{}", user.username);
        let timeout = self.config.idle_timeout.to_string();

        let resources = self.config.resources.as_ref().map(|resources| {
            k8s_openapi::api::core::v1::ResourceRequirements {
                limits: Some(
                    [
                        ("cpu".to_string(), Quantity(resources.cpu.to_string())),
                        ("memory".to_string(), Quantity(resources.memory.clone())),
                    ]
                    .into(),
                ),
                ..Default::default()
            }
        });

        let container = Container {
            name: "fileserver".to_string(),
            env: Some(vec![
                EnvVar { name: "WORBLEHAT_BASE_HREF".to_string(), value: Some(url), value_from: None },
                EnvVar { name: "WORBLEHAT_TIMEOUT".to_string(), value: Some(timeout), value_from: None },
                EnvVar { name: "WORBLEHAT_DIR".to_string(), value: Some("/mnt".to_string()), value_from: None },
            ]),
            image: Some(format!("{}:{}", image.repository, image.tag)),
            image_pull_policy: Some(image.pull_policy.clone()),
            ports: Some(vec![ContainerPort {
                container_port: 8000,
                name: Some("http".to_string()),
                ..ContainerPort::default()
            }]),
            resources,
            security_context: Some(SecurityContext {
                allow_privilege_escalation: Some(false),
                read_only_root_filesystem: Some(true),
                ..SecurityContext::default()
            }),
            volume_mounts: Some(volume_data.iter().map(|v| v.volume_mount.clone()).collect()),
            ..Container::default()
        };

        let metadata = self.build_metadata(&user.username);
        Ok(Job {
            metadata: metadata.clone(),
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        name: metadata.name.clone(),
                        labels: metadata.labels.clone(),
                        ..ObjectMeta::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        restart_policy: Some("Never".to_string()),
                        security_context: Some(PodSecurityContext {
                            run_as_user: Some(user.uid.into()),
                            run_as_group: Some(user.gid.into()),
                            run_as_non_root: Some(true),
                            supplemental_groups: Some(user.supplemental_groups()),
                            ..PodSecurityContext::default()
                        }),
                        volumes: Some(volume_data.into_iter().map(|v| v.volume).collect()),
                        ..PodSpec::default()
                    }),
                },
                ..JobSpec::default()
            }),
            ..Job::default()
        })
    }

    fn build_pvcs(&self, username: &str) -> Vec<PersistentVolumeClaim> {
        let name = self.build_name(username);
        self.volumes
            .iter()
            .filter_map(|volume| {
                let spec = volumes::build_pvc_spec(volume)?;
                let mut metadata = self.build_metadata(username);
                metadata.name = Some(format!("{name}-pvc-{}", volume.name));
                Some(PersistentVolumeClaim {
                    metadata,
                    spec: Some(spec),
                    ..PersistentVolumeClaim::default()
                })
            })
            .collect()
    }

    fn build_service(&self, username: &str) -> Service {
        Service {
            metadata: self.build_metadata(username),
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port: 8000,
                    target_port: Some(IntOrString::Int(8000)),
                    ..ServicePort::default()
                }]),
                selector: Some(BTreeMap::from([
                    ("nublado.lsst.io/category".to_string(), "fileserver".to_string()),
                    ("nublado.lsst.io/user".to_string(), username.to_string()),
                ])),
                ..ServiceSpec::default()
            }),
            ..Service::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerImageConfig;

    fn test_builder() -> FileserverBuilder {
        let config = FileserverConfig {
            enabled: true,
            namespace: "fileservers".to_string(),
            image: Some(ContainerImageConfig {
                repository: "lighthouse.ceres/library/worblehat".to_string(),
                tag: "1.0.0".to_string(),
                pull_policy: "IfNotPresent".to_string(),
            }),
            creation_timeout: 120,
            delete_timeout: 60,
            idle_timeout: 3600,
            resources: None,
            reconcile_interval: 3600,
            application: None,
        };
        FileserverBuilder::new(config, "https://data.example.org", Vec::new())
    }

    fn test_user() -> UserInfo {
        UserInfo {
            username: "rachel".to_string(),
            name: None,
            uid: 1101,
            gid: 1101,
            groups: Vec::new(),
            quota: None,
        }
    }

    #[test]
    fn test_build_name_and_username_recovery() {
        let builder = test_builder();
        assert_eq!(builder.build_name("rachel"), "rachel-fs");

        let objects = builder.build(&test_user()).unwrap();
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("rachel-fs".to_string()),
                labels: objects.job.metadata.labels.clone(),
                ..ObjectMeta::default()
            },
            ..Pod::default()
        };
        assert_eq!(builder.username_for_pod(&pod).as_deref(), Some("rachel"));

        // Falls back to the name regex when the label is missing.
        let unlabeled = Pod {
            metadata: ObjectMeta { name: Some("someuser-fs".to_string()), ..ObjectMeta::default() },
            ..Pod::default()
        };
        assert_eq!(builder.username_for_pod(&unlabeled).as_deref(), Some("someuser"));

        let unrelated = Pod {
            metadata: ObjectMeta { name: Some("prepull-x".to_string()), ..ObjectMeta::default() },
            ..Pod::default()
        };
        assert_eq!(builder.username_for_pod(&unrelated), None);
    }

    #[test]
    fn test_ingress_shape() {
        let builder = test_builder();
        let objects = builder.build(&test_user()).unwrap();
        let ingress = &objects.ingress;
        assert_eq!(ingress.metadata.name.as_deref(), Some("rachel-fs"));
        let rules = &ingress.data["template"]["spec"]["rules"];
        assert_eq!(rules[0]["host"], "data.example.org");
        assert_eq!(rules[0]["http"]["paths"][0]["path"], "/files/rachel");
        assert_eq!(ingress.data["config"]["authType"], "basic");
    }

    #[test]
    fn test_job_shape() {
        let builder = test_builder();
        let objects = builder.build(&test_user()).unwrap();
        let template = objects.job.spec.as_ref().unwrap().template.clone();
        let spec = template.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let security = spec.security_context.unwrap();
        assert_eq!(security.run_as_user, Some(1101));
        assert_eq!(security.run_as_non_root, Some(true));

        let container = &spec.containers[0];
        assert_eq!(container.name, "fileserver");
        assert_eq!(container.image.as_deref(), Some("lighthouse.ceres/library/worblehat:1.0.0"));
        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "WORBLEHAT_BASE_HREF"
            && e.value.as_deref() == Some("/files/rachel")));
        assert!(env.iter().any(|e| e.name == "WORBLEHAT_TIMEOUT"
            && e.value.as_deref() == Some("3600")));
    }
}

use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, NFSVolumeSource, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::config::{LabVolume, LabVolumeMount, VolumeSource};

/// A volume paired with the mount that attaches it to a container.
#[derive(Debug, Clone)]
pub struct MountedVolume {
    pub volume: Volume,
    pub volume_mount: VolumeMount,
}

/// Kubernetes volume for a configured volume source.
///
/// PVC-backed volumes reference a per-user claim named
/// `<prefix>-pvc-<volume>`, which the lab builder creates alongside the pod.
pub fn build_volume(volume: &LabVolume, pvc_prefix: &str) -> Volume {
    let mut result = Volume { name: volume.name.clone(), ..Volume::default() };
    match &volume.source {
        VolumeSource::HostPath { path } => {
            result.host_path =
                Some(HostPathVolumeSource { path: path.clone(), type_: None });
        }
        VolumeSource::Nfs { server, server_path, read_only } => {
            result.nfs = Some(NFSVolumeSource {
                server: server.clone(),
                path: server_path.clone(),
                read_only: Some(*read_only),
            });
        }
        VolumeSource::PersistentVolumeClaim { .. } => {
            result.persistent_volume_claim = Some(PersistentVolumeClaimVolumeSource {
                claim_name: format!("{pvc_prefix}-pvc-{}", volume.name),
                read_only: None,
            });
        }
    }
    result
}

pub fn build_volumes(volumes: &[LabVolume], pvc_prefix: &str) -> Vec<Volume> {
    volumes.iter().map(|volume| build_volume(volume, pvc_prefix)).collect()
}

pub fn build_mounts(mounts: &[LabVolumeMount]) -> Vec<VolumeMount> {
    mounts
        .iter()
        .map(|mount| VolumeMount {
            name: mount.volume_name.clone(),
            mount_path: mount.container_path.clone(),
            sub_path: mount.sub_path.clone(),
            read_only: Some(mount.read_only),
            ..VolumeMount::default()
        })
        .collect()
}

/// All configured volumes mounted under a flat prefix, as the file server
/// wants them (`/mnt/<volume>`).
pub fn build_mounted_volumes(
    volumes: &[LabVolume],
    pvc_prefix: &str,
    mount_prefix: &str,
) -> Vec<MountedVolume> {
    volumes
        .iter()
        .map(|volume| MountedVolume {
            volume: build_volume(volume, pvc_prefix),
            volume_mount: VolumeMount {
                name: volume.name.clone(),
                mount_path: format!("{mount_prefix}/{}", volume.name),
                read_only: Some(matches!(
                    &volume.source,
                    VolumeSource::Nfs { read_only: true, .. }
                )),
                ..VolumeMount::default()
            },
        })
        .collect()
}

/// The claim spec for a PVC-backed volume, or `None` for other sources.
pub fn build_pvc_spec(volume: &LabVolume) -> Option<PersistentVolumeClaimSpec> {
    match &volume.source {
        VolumeSource::PersistentVolumeClaim { storage_class_name, access_modes, size } => {
            Some(PersistentVolumeClaimSpec {
                storage_class_name: Some(storage_class_name.clone()),
                access_modes: Some(access_modes.clone()),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(
                        [("storage".to_string(), Quantity(size.clone()))].into(),
                    ),
                    limits: None,
                }),
                ..PersistentVolumeClaimSpec::default()
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nfs_volume(name: &str) -> LabVolume {
        LabVolume {
            name: name.to_string(),
            source: VolumeSource::Nfs {
                server: "10.0.0.2".to_string(),
                server_path: format!("/export/{name}"),
                read_only: false,
            },
        }
    }

    #[test]
    fn test_pvc_volume_references_per_user_claim() {
        let volume = LabVolume {
            name: "scratch".to_string(),
            source: VolumeSource::PersistentVolumeClaim {
                storage_class_name: "fast".to_string(),
                access_modes: vec!["ReadWriteOnce".to_string()],
                size: "10Gi".to_string(),
            },
        };
        let built = build_volume(&volume, "someuser-nb");
        assert_eq!(
            built.persistent_volume_claim.unwrap().claim_name,
            "someuser-nb-pvc-scratch"
        );
        let spec = build_pvc_spec(&volume).unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("fast"));
        assert!(build_pvc_spec(&nfs_volume("home")).is_none());
    }

    #[test]
    fn test_mounted_volumes_for_fileserver() {
        let mounted = build_mounted_volumes(&[nfs_volume("home"), nfs_volume("project")], "x", "/mnt");
        assert_eq!(mounted.len(), 2);
        assert_eq!(mounted[0].volume_mount.mount_path, "/mnt/home");
        assert_eq!(mounted[1].volume_mount.mount_path, "/mnt/project");
    }
}

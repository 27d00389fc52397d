use std::path::PathBuf;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use once_cell::sync::OnceCell;

/// Fallback namespace when no downward-API mount is available, such as when
/// running outside a cluster during development.
const FALLBACK_NAMESPACE: &str = "userlabs";

/// Metadata about the controller's own pod, read from the downward API.
///
/// Prepull pods carry an owner reference to the controller pod so that the
/// Kubernetes garbage collector cascade-deletes leftovers when the
/// controller is removed, and some objects are created in the controller's
/// own namespace. Both facts come from a mounted directory containing
/// `name`, `uid`, and `namespace` files. The files are read once and cached.
pub struct MetadataStorage {
    path: PathBuf,
    namespace: OnceCell<String>,
    owner_reference: OnceCell<Option<OwnerReference>>,
}

impl MetadataStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        MetadataStorage {
            path: path.into(),
            namespace: OnceCell::new(),
            owner_reference: OnceCell::new(),
        }
    }

    /// The namespace the controller is running in.
    pub fn namespace(&self) -> &str {
        self.namespace.get_or_init(|| match self.read_file("namespace") {
            Some(namespace) => namespace,
            None => {
                warn!(
                    path = %self.path.display(),
                    "No downward-API namespace, falling back to {FALLBACK_NAMESPACE}"
                );
                FALLBACK_NAMESPACE.to_string()
            }
        })
    }

    /// Owner reference pointing at the controller pod, or `None` when the
    /// downward-API mount is unavailable.
    pub fn owner_reference(&self) -> Option<&OwnerReference> {
        self.owner_reference
            .get_or_init(|| {
                let name = self.read_file("name")?;
                let uid = self.read_file("uid")?;
                Some(OwnerReference {
                    api_version: "v1".to_string(),
                    kind: "Pod".to_string(),
                    name,
                    uid,
                    block_owner_deletion: Some(true),
                    controller: None,
                })
            })
            .as_ref()
    }

    fn read_file(&self, name: &str) -> Option<String> {
        let contents = std::fs::read_to_string(self.path.join(name)).ok()?;
        Some(contents.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_downward_api_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("name"), "nublado-controller-0\n").unwrap();
        std::fs::write(dir.path().join("uid"), "d4fe9bc4\n").unwrap();
        std::fs::write(dir.path().join("namespace"), "nublado\n").unwrap();

        let metadata = MetadataStorage::new(dir.path());
        assert_eq!(metadata.namespace(), "nublado");
        let owner = metadata.owner_reference().unwrap();
        assert_eq!(owner.name, "nublado-controller-0");
        assert_eq!(owner.uid, "d4fe9bc4");
        assert_eq!(owner.kind, "Pod");
    }

    #[test]
    fn test_missing_mount_falls_back() {
        let metadata = MetadataStorage::new("/nonexistent");
        assert_eq!(metadata.namespace(), FALLBACK_NAMESPACE);
        assert!(metadata.owner_reference().is_none());
    }
}

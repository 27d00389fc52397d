use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::ControllerError;

static REFERENCE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<registry>[^/]+)/(?P<repository>[^:@]+)(?::(?P<tag>[^@]+))?(?:@(?P<digest>.+))?$")
        .expect("reference regex is valid")
});

/// Parsed Docker image reference (`registry/repository[:tag][@digest]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerReference {
    /// Registry (Docker API server) hosting the image.
    pub registry: String,
    /// Repository of images (for example, `lsstsqre/sciplat-lab`).
    pub repository: String,
    /// Tag, if present.
    pub tag: Option<String>,
    /// Digest, if present.
    pub digest: Option<String>,
}

impl DockerReference {
    pub fn from_str(reference: &str) -> Result<Self, ControllerError> {
        let captures = REFERENCE_REGEX
            .captures(reference)
            .ok_or_else(|| ControllerError::InvalidDockerReference(reference.to_string()))?;
        Ok(DockerReference {
            registry: captures["registry"].to_string(),
            repository: captures["repository"].to_string(),
            tag: captures.name("tag").map(|m| m.as_str().to_string()),
            digest: captures.name("digest").map(|m| m.as_str().to_string()),
        })
    }
}

impl fmt::Display for DockerReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Credentials for one Docker API server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerCredentials {
    pub username: String,
    pub password: String,
}

impl DockerCredentials {
    /// Value for an `Authorization` header using HTTP Basic auth.
    pub fn authorization(&self) -> String {
        format!("Basic {}", self.credentials())
    }

    pub fn credentials(&self) -> String {
        BASE64.encode(format!("{}:{}", self.username, self.password))
    }
}

/// In-memory copy of a Kubernetes-style `.dockerconfigjson` file, mapping
/// registry hosts to credentials.
#[derive(Debug, Clone, Default)]
pub struct DockerCredentialStore {
    credentials: HashMap<String, DockerCredentials>,
}

impl DockerCredentialStore {
    pub fn new(credentials: HashMap<String, DockerCredentials>) -> Self {
        DockerCredentialStore { credentials }
    }

    pub fn from_path(path: &Path) -> Result<Self, ControllerError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ControllerError::Config(format!("Cannot read {}: {e}", path.display())))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, ControllerError> {
        let parsed: serde_json::Value = serde_json::from_str(contents)
            .map_err(|e| ControllerError::Config(format!("Invalid Docker credentials: {e}")))?;
        let auths = parsed
            .get("auths")
            .and_then(|a| a.as_object())
            .ok_or_else(|| ControllerError::Config("Docker credentials have no auths".to_string()))?;
        let mut credentials = HashMap::new();
        for (host, entry) in auths {
            let auth = entry
                .get("auth")
                .and_then(|a| a.as_str())
                .ok_or_else(|| ControllerError::Config(format!("No auth entry for {host}")))?;
            let decoded = BASE64
                .decode(auth)
                .ok()
                .and_then(|b| String::from_utf8(b).ok())
                .ok_or_else(|| ControllerError::Config(format!("Invalid auth entry for {host}")))?;
            let (username, password) = decoded
                .split_once(':')
                .ok_or_else(|| ControllerError::Config(format!("Malformed auth entry for {host}")))?;
            credentials.insert(
                host.clone(),
                DockerCredentials {
                    username: username.to_string(),
                    password: password.to_string(),
                },
            );
        }
        Ok(DockerCredentialStore { credentials })
    }

    /// Look up credentials for a host, falling back through parent domains
    /// the way Docker itself does (`registry.example.com` matches an entry
    /// for `example.com`).
    pub fn get(&self, host: &str) -> Option<&DockerCredentials> {
        if let Some(credentials) = self.credentials.get(host) {
            return Some(credentials);
        }
        let mut domain = host;
        while let Some((_, parent)) = domain.split_once('.') {
            if let Some(credentials) = self.credentials.get(parent) {
                return Some(credentials);
            }
            domain = parent;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_parsing() {
        let reference =
            DockerReference::from_str("lighthouse.ceres/library/sketchbook:w_2077_44@sha256:1234")
                .unwrap();
        assert_eq!(reference.registry, "lighthouse.ceres");
        assert_eq!(reference.repository, "library/sketchbook");
        assert_eq!(reference.tag.as_deref(), Some("w_2077_44"));
        assert_eq!(reference.digest.as_deref(), Some("sha256:1234"));
        assert_eq!(
            reference.to_string(),
            "lighthouse.ceres/library/sketchbook:w_2077_44@sha256:1234"
        );

        let reference = DockerReference::from_str("lighthouse.ceres/library/sketchbook").unwrap();
        assert_eq!(reference.tag, None);
        assert_eq!(reference.digest, None);

        assert!(DockerReference::from_str("sketchbook").is_err());
    }

    #[test]
    fn test_credential_store() {
        let auth = BASE64.encode("someuser:somepass");
        let contents = format!(r#"{{"auths": {{"example.com": {{"auth": "{auth}"}}}}}}"#);
        let store = DockerCredentialStore::from_json(&contents).unwrap();

        let credentials = store.get("example.com").unwrap();
        assert_eq!(credentials.username, "someuser");
        assert_eq!(credentials.password, "somepass");
        assert_eq!(
            credentials.authorization(),
            format!("Basic {}", BASE64.encode("someuser:somepass"))
        );

        // Parent-domain fallback.
        assert!(store.get("registry.example.com").is_some());
        assert!(store.get("other.org").is_none());
    }
}

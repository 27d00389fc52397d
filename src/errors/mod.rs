use chrono::{DateTime, Utc};
use thiserror::Error;

/// A cumulative timeout expired.
///
/// Carries enough context to report which logical operation timed out, for
/// whom, and when, independent of where in the call stack the expiry was
/// detected.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{operation} timed out after {}s", .failed_at.signed_duration_since(*.started_at).num_seconds())]
pub struct ControllerTimeoutError {
    /// Human-readable name of the operation that timed out.
    pub operation: String,
    /// User on whose behalf the operation ran, if any.
    pub user: Option<String>,
    /// When the operation started.
    pub started_at: DateTime<Utc>,
    /// When the timeout expired.
    pub failed_at: DateTime<Utc>,
}

/// Wrapper around any failure returned by the Kubernetes API.
///
/// Every Kubernetes call site attaches the kind and coordinates of the object
/// being acted on, since the raw client error rarely identifies it.
#[derive(Debug, Error)]
#[error("{}", self.format())]
pub struct KubernetesError {
    pub message: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub status: Option<u16>,
    #[source]
    pub source: kube::Error,
}

impl KubernetesError {
    pub fn from_error(
        message: &str,
        source: kube::Error,
        kind: &str,
        namespace: Option<&str>,
        name: Option<&str>,
    ) -> Self {
        let status = match &source {
            kube::Error::Api(response) => Some(response.code),
            _ => None,
        };
        KubernetesError {
            message: message.to_string(),
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: name.map(str::to_string),
            status,
            source,
        }
    }

    fn format(&self) -> String {
        let mut obj = self.kind.clone();
        match (&self.namespace, &self.name) {
            (Some(namespace), Some(name)) => obj = format!("{obj} {namespace}/{name}"),
            (None, Some(name)) => obj = format!("{obj} {name}"),
            _ => (),
        }
        match self.status {
            Some(status) => format!("{} ({obj}, status {status}): {}", self.message, self.source),
            None => format!("{} ({obj}): {}", self.message, self.source),
        }
    }
}

/// Failure talking to the Docker registry.
#[derive(Debug, Error)]
#[error("{message} ({method} {url})")]
pub struct RegistryError {
    pub message: String,
    pub method: String,
    pub url: String,
}

impl RegistryError {
    pub fn new(message: impl Into<String>, method: &str, url: &str) -> Self {
        RegistryError {
            message: message.into(),
            method: method.to_string(),
            url: url.to_string(),
        }
    }
}

/// Failure talking to the Gafaelfawr identity service.
#[derive(Debug, Error)]
pub enum GafaelfawrError {
    #[error("Token rejected by identity service")]
    InvalidToken,

    /// The raw body is retained so that the alert sink can include it.
    #[error("Cannot parse identity service response: {error}")]
    ParseFailure { error: String, raw: String },

    #[error("Error talking to identity service: {0}")]
    Request(#[from] reqwest::Error),
}

/// All errors surfaced by the controller.
///
/// Client errors (rejected requests) and internal errors share one enum so
/// that route handlers can map each variant to an HTTP status and a stable
/// error kind in a single place.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Duplicate {0}")]
    DuplicateObject(String),

    #[error("Insufficient quota to spawn requested lab")]
    InsufficientQuota,

    #[error("Invalid Docker reference {0:?}")]
    InvalidDockerReference(String),

    #[error("Invalid lab size {0:?}")]
    InvalidLabSize(String),

    #[error("Cannot compare image tags of different categories")]
    IncomparableImageTypes,

    #[error("Lab already exists for {0}")]
    LabExists(String),

    #[error("Deleting lab for {0} failed")]
    LabDeletionFailed(String),

    #[error("Secret {namespace}/{name} {}", match key { Some(key) => format!("does not have key {key}"), None => "does not exist".to_string() })]
    MissingSecret {
        name: String,
        namespace: String,
        key: Option<String>,
    },

    #[error("{kind} {name} does not exist")]
    MissingObject { kind: String, name: String },

    #[error("No operation in progress for {0}")]
    NoOperation(String),

    #[error("File server not configured")]
    NotConfigured,

    #[error("Operation in progress for {username}: {operation}")]
    OperationConflict { username: String, operation: String },

    #[error("Unknown image {0}")]
    UnknownDockerImage(String),

    #[error("Unknown user {0}")]
    UnknownUser(String),

    #[error("Username does not match authenticated user")]
    PermissionDenied,

    #[error(transparent)]
    Gafaelfawr(#[from] GafaelfawrError),

    #[error(transparent)]
    Kubernetes(#[from] KubernetesError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Timeout(#[from] ControllerTimeoutError),

    #[error("Template rendering failed: {0}")]
    Template(#[from] tera::Error),
}

impl ControllerError {
    /// Stable machine-readable kind for API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerError::Config(_) => "invalid_config",
            ControllerError::DuplicateObject(_) => "duplicate_object",
            ControllerError::InsufficientQuota => "insufficient_quota",
            ControllerError::InvalidDockerReference(_) => "invalid_docker_reference",
            ControllerError::InvalidLabSize(_) => "invalid_lab_size",
            ControllerError::IncomparableImageTypes => "incomparable_image_types",
            ControllerError::LabExists(_) => "lab_exists",
            ControllerError::LabDeletionFailed(_) => "lab_deletion_failed",
            ControllerError::MissingSecret { .. } => "missing_secret",
            ControllerError::MissingObject { .. } => "missing_object",
            ControllerError::NoOperation(_) => "no_operation",
            ControllerError::NotConfigured => "not_configured",
            ControllerError::OperationConflict { .. } => "operation_in_progress",
            ControllerError::UnknownDockerImage(_) => "unknown_image",
            ControllerError::UnknownUser(_) => "unknown_user",
            ControllerError::PermissionDenied => "permission_denied",
            ControllerError::Gafaelfawr(GafaelfawrError::InvalidToken) => "invalid_token",
            ControllerError::Gafaelfawr(_) => "gafaelfawr_error",
            ControllerError::Kubernetes(_) => "kubernetes_error",
            ControllerError::Registry(_) => "registry_error",
            ControllerError::Timeout(_) => "timeout",
            ControllerError::Template(_) => "template_error",
        }
    }

    /// HTTP status to report this error with.
    pub fn status(&self) -> u16 {
        match self {
            ControllerError::InsufficientQuota | ControllerError::PermissionDenied => 403,
            ControllerError::Gafaelfawr(GafaelfawrError::InvalidToken) => 403,
            ControllerError::UnknownUser(_)
            | ControllerError::NoOperation(_)
            | ControllerError::MissingObject { .. }
            | ControllerError::NotConfigured => 404,
            ControllerError::OperationConflict { .. } | ControllerError::LabExists(_) => 409,
            ControllerError::InvalidDockerReference(_)
            | ControllerError::InvalidLabSize(_)
            | ControllerError::UnknownDockerImage(_) => 400,
            _ => 500,
        }
    }

    /// Request body path the error refers to, when the error was caused by a
    /// specific field of the request.
    pub fn path(&self) -> Option<&'static str> {
        match self {
            ControllerError::InsufficientQuota | ControllerError::InvalidLabSize(_) => {
                Some("options.size")
            }
            ControllerError::InvalidDockerReference(_) | ControllerError::UnknownDockerImage(_) => {
                Some("options.image")
            }
            _ => None,
        }
    }
}

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_and_status() {
        let err = ControllerError::OperationConflict {
            username: "rachel".to_string(),
            operation: "spawn".to_string(),
        };
        assert_eq!(err.kind(), "operation_in_progress");
        assert_eq!(err.status(), 409);

        let err = ControllerError::InsufficientQuota;
        assert_eq!(err.kind(), "insufficient_quota");
        assert_eq!(err.status(), 403);
        assert_eq!(err.path(), Some("options.size"));

        let err = ControllerError::UnknownUser("someuser".to_string());
        assert_eq!(err.status(), 404);
    }

    #[test]
    fn test_timeout_error_display() {
        let started = Utc::now();
        let err = ControllerTimeoutError {
            operation: "spawn lab".to_string(),
            user: Some("someuser".to_string()),
            started_at: started,
            failed_at: started + chrono::Duration::seconds(600),
        };
        assert_eq!(err.to_string(), "spawn lab timed out after 600s");
    }
}

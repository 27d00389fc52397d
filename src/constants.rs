use std::time::Duration;

/// Annotations added to every managed object so that Argo CD neither prunes
/// them nor reports the owning application as out of sync.
pub const ARGO_CD_ANNOTATIONS: [(&str, &str); 2] = [
    ("argocd.argoproj.io/compare-options", "IgnoreExtraneous"),
    ("argocd.argoproj.io/sync-options", "Prune=false"),
];

/// Default path to the controller configuration file.
pub const CONFIGURATION_PATH: &str = "/etc/nublado/config.yaml";

/// Default path to the Docker registry credentials file.
pub const DOCKER_CREDENTIALS_PATH: &str = "/etc/secrets/.dockerconfigjson";

/// Default path to the downward-API metadata mount.
pub const METADATA_PATH: &str = "/etc/podinfo";

/// Sentinel used by the lab form for the image list when the dropdown is used
/// instead.
pub const DROPDOWN_SENTINEL_VALUE: &str = "use_image_from_dropdown";

/// Upper bound on one-off Kubernetes API calls that are not part of a larger
/// operation with its own budget.
pub const KUBERNETES_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a single underlying watch request may run before it is restarted
/// with a fresh resource version. The Kubernetes control plane enforces its
/// own internal cap, so this must stay below it.
pub const KUBERNETES_WATCH_RECONNECT_TIMEOUT: Duration = Duration::from_secs(250);

/// Grace period between SIGTERM and SIGKILL when stopping a lab pod. The lab
/// does nothing useful with SIGTERM, so this matches kubespawner.
pub const LAB_STOP_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Ratio of lab resource limits to requests, i.e. the overcommit factor for
/// labs.
pub const LIMIT_TO_REQUEST_RATIO: f64 = 4.0;

/// Ratio of the memory limit to the size of the tmpfs mounted on /tmp.
pub const MEMORY_TO_TMP_SIZE_RATIO: u64 = 4;

/// How long to wait for a prepull pod to spawn and finish pulling its image.
pub const PREPULLER_POD_TIMEOUT: Duration = Duration::from_secs(600);

/// Environment variables that must be set by the controller or by JupyterHub
/// and therefore may not appear in the operator lab configuration. Anything
/// starting with `JUPYTERHUB_` is also rejected.
pub const RESERVED_ENV: [&str; 15] = [
    "ACCESS_TOKEN",
    "CONTAINER_SIZE",
    "CPU_GUARANTEE",
    "CPU_LIMIT",
    "DEBUG",
    "EXTERNAL_INSTANCE_URL",
    "IMAGE_DESCRIPTION",
    "IMAGE_DIGEST",
    "JPY_API_TOKEN",
    "JUPYTER_IMAGE",
    "JUPYTER_IMAGE_SPEC",
    "KUBERNETES_NODE_NAME",
    "MEM_GUARANTEE",
    "MEM_LIMIT",
    "RESET_USER_ENV",
];

/// Paths inside the lab reserved for files the controller itself provides.
pub const RESERVED_PATHS: [&str; 3] = ["/etc/group", "/etc/passwd", "/tmp"];

/// Regex matching all valid usernames, kept in sync with the identity
/// service.
pub const USERNAME_REGEX: &str = "^[a-z0-9](?:[a-z0-9]|-[a-z0-9])*[a-z](?:[a-z0-9]|-[a-z0-9])*$";

/// Regex matching all valid group names, kept in sync with the identity
/// service.
pub const GROUPNAME_REGEX: &str = "^[a-zA-Z0-9][a-zA-Z0-9._-]*[a-zA-Z][a-zA-Z0-9._-]*$";

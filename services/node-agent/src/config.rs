//! Configuration for the node agent.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

/// Default CRI socket.
pub const DEFAULT_CONTAINER_RUNTIME_ENDPOINT: &str = "unix:///run/containerd/containerd.sock";

/// Default kubelet installer image.
pub const DEFAULT_KUBELET_INSTALLER_IMAGE: &str = "ghcr.io/nodemesh/kubelet-installer:latest";

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Join flow settings.
    pub join: JoinSettings,

    /// Local file layout.
    pub paths: NodePaths,

    /// PEM CA bundle used to verify the API server.
    pub ca_cert_file: Option<PathBuf>,

    /// Bearer token for the join API.
    pub join_token: String,

    /// Base64 X25519 public key the join key is wrapped for.
    pub join_public_key: String,
}

/// Settings for one join attempt.
#[derive(Debug, Clone)]
pub struct JoinSettings {
    /// Name the node joins under.
    pub node_name: String,

    /// Cluster API server endpoint.
    pub api_server: String,

    /// CRI runtime endpoint.
    pub container_runtime_endpoint: String,

    /// CRI image endpoint.
    pub image_service_endpoint: String,

    /// Overall deadline for the join request to be issued.
    pub timeout: Duration,

    /// Interval between join request polls.
    pub poll_interval: Duration,

    /// Mesh-agent image.
    pub mesh_image: String,

    /// Kubelet installer image.
    pub kubelet_installer_image: String,

    /// Create long-running debug pods.
    pub debug_pods: bool,
}

impl JoinSettings {
    /// Settings with default timings and images.
    pub fn new(node_name: impl Into<String>, api_server: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            api_server: api_server.into(),
            container_runtime_endpoint: DEFAULT_CONTAINER_RUNTIME_ENDPOINT.to_string(),
            image_service_endpoint: DEFAULT_CONTAINER_RUNTIME_ENDPOINT.to_string(),
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            mesh_image: nodemesh_reconcile::DEFAULT_WIREGUARD_IMAGE.to_string(),
            kubelet_installer_image: DEFAULT_KUBELET_INSTALLER_IMAGE.to_string(),
            debug_pods: false,
        }
    }
}

/// Where the agent keeps its files.
#[derive(Debug, Clone)]
pub struct NodePaths {
    pub config_dir: PathBuf,
    pub kubelet_dir: PathBuf,
    pub systemd_dir: PathBuf,
}

impl Default for NodePaths {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/nodemesh"),
            kubelet_dir: PathBuf::from("/var/lib/kubelet"),
            systemd_dir: PathBuf::from("/etc/systemd/system"),
        }
    }
}

impl NodePaths {
    /// All directories under a common root. Used by tests and dry runs.
    pub fn under(root: &Path) -> Self {
        Self {
            config_dir: root.join("etc/nodemesh"),
            kubelet_dir: root.join("var/lib/kubelet"),
            systemd_dir: root.join("etc/systemd/system"),
        }
    }

    pub fn join_key(&self) -> PathBuf {
        self.config_dir.join("join.key")
    }

    pub fn kubeconfig(&self) -> PathBuf {
        self.config_dir.join("kubelet.conf")
    }

    pub fn kubelet_config(&self) -> PathBuf {
        self.kubelet_dir.join("config.yaml")
    }

    pub fn kubelet_unit(&self) -> PathBuf {
        self.systemd_dir.join("kubelet.service")
    }

    pub fn mesh_config(&self) -> PathBuf {
        self.config_dir.join("wg0.conf")
    }

    /// Scratch space for pod and container definitions.
    pub fn pods_dir(&self) -> PathBuf {
        self.config_dir.join("pods")
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            var(key)
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("{} must be set", key))
        };

        let node_name = match var("NODEMESH_NODE_NAME").filter(|v| !v.trim().is_empty()) {
            Some(name) => name,
            None => std::fs::read_to_string("/etc/hostname")
                .map(|s| s.trim().to_string())
                .context("NODEMESH_NODE_NAME not set and /etc/hostname unreadable")?,
        };

        let mut join = JoinSettings::new(node_name, required("NODEMESH_API_SERVER")?);

        if let Some(endpoint) = var("NODEMESH_CONTAINER_RUNTIME_ENDPOINT") {
            join.container_runtime_endpoint = endpoint;
        }
        join.image_service_endpoint = var("NODEMESH_IMAGE_SERVICE_ENDPOINT")
            .unwrap_or_else(|| join.container_runtime_endpoint.clone());

        if let Some(secs) = var("NODEMESH_JOIN_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .context("NODEMESH_JOIN_TIMEOUT_SECS must be a number of seconds")?;
            join.timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = var("NODEMESH_JOIN_POLL_INTERVAL_MS") {
            let ms: u64 = ms
                .parse()
                .context("NODEMESH_JOIN_POLL_INTERVAL_MS must be a number of milliseconds")?;
            join.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(image) = var("NODEMESH_MESH_IMAGE") {
            join.mesh_image = image;
        }
        if let Some(image) = var("NODEMESH_KUBELET_INSTALLER_IMAGE") {
            join.kubelet_installer_image = image;
        }
        join.debug_pods = var("NODEMESH_DEBUG_PODS")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let defaults = NodePaths::default();
        let paths = NodePaths {
            config_dir: var("NODEMESH_CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_dir),
            kubelet_dir: var("NODEMESH_KUBELET_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.kubelet_dir),
            systemd_dir: var("NODEMESH_SYSTEMD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.systemd_dir),
        };

        Ok(Self {
            join,
            paths,
            ca_cert_file: var("NODEMESH_CA_CERT_FILE").map(PathBuf::from),
            join_token: required("NODEMESH_JOIN_TOKEN")?,
            join_public_key: required("NODEMESH_JOIN_PUBLIC_KEY")?,
        })
    }
}

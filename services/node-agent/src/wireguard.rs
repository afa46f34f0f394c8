//! Leaf mesh setup on a joining node.
//!
//! The node keeps one tunnel to the cluster ingress. The rendered config is
//! written to `<config_dir>/wg0.conf` and brought up with `wg-quick` from a
//! network-privileged pod, so the interface lives in the host namespace.

use std::path::{Path, PathBuf};

use nodemesh_networking::WgInterface;
use nodemesh_reconcile::{ContainerSpec, Hypervisor, HypervisorError, PodSpec, Privileges};
use thiserror::Error;
use tracing::{info, warn};

use crate::client::JOIN_NAMESPACE;
use crate::files;

/// Name of the leaf interface; `wg-quick` derives it from the file name.
pub const LEAF_INTERFACE: &str = "wg0";

const SETUP_POD: &str = "wireguard";
const DEBUG_POD: &str = "wireguard-debug";

/// Errors setting up the leaf mesh.
#[derive(Debug, Error)]
pub enum LeafMeshError {
    #[error("failed to write {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Hypervisor(#[from] HypervisorError),
}

/// Brings up the node's tunnel to the ingress.
pub struct LeafMeshSetup<'a> {
    pub hypervisor: &'a dyn Hypervisor,
    pub image: &'a str,
    pub config_path: &'a Path,
    pub debug_pods: bool,
}

impl LeafMeshSetup<'_> {
    /// Write `mesh` and bring the interface up. Safe to repeat.
    pub async fn apply(&self, node_name: &str, mesh: &WgInterface) -> Result<(), LeafMeshError> {
        files::write_private(self.config_path, mesh.render().as_bytes()).map_err(|source| {
            LeafMeshError::Persist {
                path: self.config_path.to_path_buf(),
                source,
            }
        })?;

        self.hypervisor.ensure_image(self.image).await?;

        let config = self.config_path.to_string_lossy().into_owned();
        let config_dir = self
            .config_path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| config.clone());

        if self.debug_pods {
            let debug = network_pod(
                DEBUG_POD,
                ContainerSpec::new(DEBUG_POD, self.image)
                    .with_command(["sleep"])
                    .with_args(["365d"])
                    .with_mount(config_dir.as_str(), config_dir.as_str()),
            );
            if let Err(e) = self
                .hypervisor
                .ensure_pod(JOIN_NAMESPACE, node_name, DEBUG_POD, &debug)
                .await
            {
                warn!(pod = %DEBUG_POD, error = %e, "failed to ensure debug pod");
            }
        }

        let up = network_pod(
            SETUP_POD,
            ContainerSpec::new(SETUP_POD, self.image)
                .with_command(["sh", "-c"])
                .with_args([format!(
                    "wg show {iface} >/dev/null 2>&1 || wg-quick up {conf}",
                    iface = LEAF_INTERFACE,
                    conf = config
                )])
                .with_mount(config.as_str(), config.as_str()),
        );
        self.hypervisor
            .run_and_wait_for_pod(JOIN_NAMESPACE, node_name, SETUP_POD, &up)
            .await?;

        info!(
            node_name = %node_name,
            interface = LEAF_INTERFACE,
            peers = mesh.peers.len(),
            "leaf mesh is up"
        );
        Ok(())
    }
}

fn network_pod(name: &str, container: ContainerSpec) -> PodSpec {
    PodSpec::new(
        name,
        vec![container.with_privileges(Privileges::NetworkPrivileged)],
    )
    .with_privileges(Privileges::NetworkPrivileged)
}

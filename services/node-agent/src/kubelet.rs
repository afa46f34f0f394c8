//! Kubelet installation through the local hypervisor.

use nodemesh_reconcile::{ContainerSpec, Hypervisor, HypervisorError, PodSpec};
use tracing::info;

use crate::client::JOIN_NAMESPACE;

/// Name of the one-shot installer pod.
pub const KUBELET_INSTALLER_POD: &str = "kubelet-installer";

/// Host directory the installer copies binaries into.
pub const HOST_BIN_DIR: &str = "/usr/local/bin";

/// Where the installer expects the host directory.
pub const INSTALLER_TARGET: &str = "/host";

/// Installer pod: copies the kubelet binary into the host's bin directory.
pub fn installer_pod(image: &str) -> PodSpec {
    PodSpec::new(
        KUBELET_INSTALLER_POD,
        vec![ContainerSpec::new(KUBELET_INSTALLER_POD, image)
            .with_mount(HOST_BIN_DIR, INSTALLER_TARGET)],
    )
}

/// Install the kubelet binary on this node.
pub async fn install_kubelet(
    hypervisor: &dyn Hypervisor,
    node_name: &str,
    image: &str,
) -> Result<(), HypervisorError> {
    hypervisor.ensure_image(image).await?;
    hypervisor
        .run_and_wait_for_pod(
            JOIN_NAMESPACE,
            node_name,
            KUBELET_INSTALLER_POD,
            &installer_pod(image),
        )
        .await?;

    info!(node_name = %node_name, image = %image, "kubelet installed");
    Ok(())
}

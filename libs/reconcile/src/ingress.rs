//! Ingress mesh reconciler.
//!
//! Converges the WireGuard interface of a cluster's ingress component:
//!
//! 1. ensure the mesh-agent image
//! 2. upload the quick and full configs
//! 3. optional debug pods
//! 4. bring the interface up from the quick config
//! 5. `wg syncconf` the full config onto it
//!
//! Step 4 is a no-op once the interface exists, so the live peer set is only
//! ever changed by step 5 and existing tunnels are not torn down.

use std::collections::BTreeMap;

use nodemesh_networking::{derive_ingress_config, Cluster, IngressMeshConfig};
use tracing::{debug, info, warn};

use crate::component::Component;
use crate::hypervisor::Hypervisor;
use crate::pod::{ContainerSpec, PodSpec, Privileges};
use crate::{ReconcileError, ReconcileStep, DEFAULT_WIREGUARD_IMAGE};

/// Host port allocation name for the ingress listen port.
pub const WIREGUARD_HOST_PORT_NAME: &str = "wireguard";

const QUICK_CONFIG_FILE: &str = "wg-quick.conf";
const FULL_CONFIG_FILE: &str = "wg.conf";

/// Inputs to one reconciliation.
pub struct ReconcileContext<'a> {
    /// Cluster snapshot. Changes after this point are seen on the next pass.
    pub cluster: &'a Cluster,

    /// The ingress component.
    pub component: &'a Component,

    /// Hypervisor the component runs on.
    pub hypervisor: &'a dyn Hypervisor,
}

/// Reconciles the ingress end of a cluster mesh.
#[derive(Debug, Clone)]
pub struct IngressMeshReconciler {
    /// Mesh-agent image.
    pub image: String,

    /// Create long-running debug pods next to the interface.
    pub debug_pods: bool,
}

impl Default for IngressMeshReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_WIREGUARD_IMAGE)
    }
}

impl IngressMeshReconciler {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            debug_pods: false,
        }
    }

    pub fn with_debug_pods(mut self, enabled: bool) -> Self {
        self.debug_pods = enabled;
        self
    }

    /// Run one reconciliation pass.
    ///
    /// Returns the applied configuration. The first failing step aborts the
    /// pass; calling again retries from the start.
    pub async fn reconcile(
        &self,
        ctx: &ReconcileContext<'_>,
    ) -> Result<IngressMeshConfig, ReconcileError> {
        let cluster = ctx.cluster;
        let component = ctx.component;
        let hypervisor = ctx.hypervisor;

        if component.hypervisor != hypervisor.name() {
            return Err(ReconcileError::HypervisorMismatch {
                component: component.name.clone(),
                expected: component.hypervisor.clone(),
                actual: hypervisor.name().to_string(),
            });
        }

        let listen_port = component
            .host_port(WIREGUARD_HOST_PORT_NAME)
            .ok_or_else(|| ReconcileError::PortNotAllocated {
                component: component.name.clone(),
                name: WIREGUARD_HOST_PORT_NAME.to_string(),
            })?;
        let config = derive_ingress_config(cluster, listen_port)?;
        let paths = ConfigPaths::new(component, &config.interface_name);

        debug!(
            namespace = %cluster.namespace,
            cluster = %cluster.name,
            hypervisor = %hypervisor.name(),
            interface = %config.interface_name,
            peers = config.peer_count(),
            "reconciling ingress mesh"
        );

        hypervisor
            .ensure_image(&self.image)
            .await
            .map_err(ReconcileError::step(ReconcileStep::EnsureImage))?;

        let files = BTreeMap::from([
            (paths.quick_host.clone(), config.quick_config()),
            (paths.full_host.clone(), config.full_config()),
        ]);
        hypervisor
            .upload_files(&cluster.namespace, &cluster.name, &component.name, &files)
            .await
            .map_err(ReconcileError::step(ReconcileStep::UploadConfig))?;

        if self.debug_pods {
            self.ensure_debug_pods(ctx, &paths).await;
        }

        let up = self.task_pod(
            &cluster.name,
            ["sh", "-c"],
            [format!(
                "wg show {iface} >/dev/null 2>&1 || wg-quick up {conf}",
                iface = config.interface_name,
                conf = paths.guest
            )],
            &paths.quick_host,
            &paths.guest,
        );
        hypervisor
            .run_and_wait_for_pod(&cluster.namespace, &cluster.name, &component.name, &up)
            .await
            .map_err(ReconcileError::step(ReconcileStep::InterfaceUp))?;

        let sync = self.task_pod(
            &cluster.name,
            ["wg"],
            [
                "syncconf".to_string(),
                config.interface_name.clone(),
                paths.guest.clone(),
            ],
            &paths.full_host,
            &paths.guest,
        );
        hypervisor
            .run_and_wait_for_pod(&cluster.namespace, &cluster.name, &component.name, &sync)
            .await
            .map_err(ReconcileError::step(ReconcileStep::SyncConfig))?;

        info!(
            namespace = %cluster.namespace,
            cluster = %cluster.name,
            interface = %config.interface_name,
            listen_port,
            peers = config.peer_count(),
            "ingress mesh reconciled"
        );

        Ok(config)
    }

    fn task_pod<C, A>(
        &self,
        cluster: &str,
        command: C,
        args: A,
        host_file: &str,
        guest_file: &str,
    ) -> PodSpec
    where
        C: IntoIterator,
        C::Item: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        PodSpec::new(
            format!("wireguard-{}", cluster),
            vec![ContainerSpec::new("wireguard", &self.image)
                .with_command(command)
                .with_args(args)
                .with_mount(host_file, guest_file)
                .with_privileges(Privileges::NetworkPrivileged)],
        )
        .with_privileges(Privileges::NetworkPrivileged)
    }

    async fn ensure_debug_pods(&self, ctx: &ReconcileContext<'_>, paths: &ConfigPaths) {
        let debug_pods = [
            ("wireguard-debug-quick", &paths.quick_host),
            ("wireguard-debug", &paths.full_host),
        ];

        for (name, host_file) in debug_pods {
            let pod = PodSpec::new(
                name,
                vec![ContainerSpec::new(name, &self.image)
                    .with_command(["sleep"])
                    .with_args(["365d"])
                    .with_mount(host_file.as_str(), paths.guest.as_str())
                    .with_privileges(Privileges::NetworkPrivileged)],
            )
            .with_privileges(Privileges::NetworkPrivileged);

            if let Err(e) = ctx
                .hypervisor
                .ensure_pod(&ctx.cluster.namespace, &ctx.cluster.name, name, &pod)
                .await
            {
                warn!(pod = %name, error = %e, "failed to ensure debug pod");
            }
        }
    }
}

/// Host and guest locations of the mesh configs for one component.
struct ConfigPaths {
    quick_host: String,
    full_host: String,
    /// Named after the interface: `wg-quick` derives the name from the file.
    guest: String,
}

impl ConfigPaths {
    fn new(component: &Component, interface: &str) -> Self {
        Self {
            quick_host: component.secrets_file(QUICK_CONFIG_FILE),
            full_host: component.secrets_file(FULL_CONFIG_FILE),
            guest: component.secrets_file(&format!("{}.conf", interface)),
        }
    }
}

//! Reconciliation primitives for cluster components on hypervisors.
//!
//! A reconciliation converges what runs on a hypervisor to what the cluster
//! state says should run there. Key concepts:
//!
//! - **Hypervisor**: a host that can pull images, receive files and run pods.
//! - **Component**: a named unit of a cluster bound to one hypervisor.
//! - **Reconciler**: derives desired configuration and applies it step by step.
//!
//! # Invariants
//!
//! - Every step is idempotent; reconcilers are re-run on every tick
//! - Derivation is deterministic given the same cluster snapshot
//! - The first failing step aborts the attempt; retry belongs to the caller

use std::fmt;

use nodemesh_networking::NetworkError;
use thiserror::Error;

pub mod component;
pub mod hypervisor;
pub mod ingress;
pub mod mock;
pub mod pod;

pub use component::{component_secrets_path, Component, HostPortAllocator};
pub use hypervisor::{Hypervisor, HypervisorError};
pub use ingress::{IngressMeshReconciler, ReconcileContext, WIREGUARD_HOST_PORT_NAME};
pub use mock::{HypervisorCall, HypervisorOp, RecordingHypervisor};
pub use pod::{ContainerSpec, PodSpec, Privileges};

/// Default mesh-agent image (ships `wg` and `wg-quick`).
pub const DEFAULT_WIREGUARD_IMAGE: &str = "ghcr.io/nodemesh/wireguard:latest";

/// A step of a mesh reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStep {
    /// Pull the mesh-agent image.
    EnsureImage,

    /// Upload rendered configuration files.
    UploadConfig,

    /// Bring the interface up from the quick config.
    InterfaceUp,

    /// Live-sync the full config onto the interface.
    SyncConfig,
}

impl ReconcileStep {
    /// Stable label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EnsureImage => "ensure-image",
            Self::UploadConfig => "upload-config",
            Self::InterfaceUp => "interface-up",
            Self::SyncConfig => "sync-config",
        }
    }
}

impl fmt::Display for ReconcileStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A hypervisor step failed.
    #[error("{step} failed: {source}")]
    Step {
        step: ReconcileStep,
        source: HypervisorError,
    },

    /// Desired configuration could not be derived.
    #[error("mesh derivation failed: {0}")]
    Mesh(#[from] NetworkError),

    /// Component has no allocation for a required host port.
    #[error("component {component} has no {name:?} host port allocated")]
    PortNotAllocated { component: String, name: String },

    /// Hypervisor port range is fully allocated.
    #[error("no free host ports on {hypervisor} in {low}-{high}")]
    PortsExhausted {
        hypervisor: String,
        low: u16,
        high: u16,
    },

    /// Component is bound to a different hypervisor.
    #[error("component {component} is bound to hypervisor {expected}, not {actual}")]
    HypervisorMismatch {
        component: String,
        expected: String,
        actual: String,
    },
}

impl ReconcileError {
    /// Wrap a hypervisor error with the step it failed in.
    pub fn step(step: ReconcileStep) -> impl FnOnce(HypervisorError) -> Self {
        move |source| Self::Step { step, source }
    }
}

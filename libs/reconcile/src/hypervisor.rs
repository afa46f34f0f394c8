//! Hypervisor interface.
//!
//! A hypervisor is the host a cluster component runs on. Reconcilers only
//! talk to it through [`Hypervisor`], so the same driver runs against a real
//! host or the [`RecordingHypervisor`](crate::RecordingHypervisor) in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::pod::PodSpec;

/// Errors reported by a hypervisor.
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// Image could not be made available.
    #[error("image {image} unavailable: {reason}")]
    Image { image: String, reason: String },

    /// Files could not be written.
    #[error("upload to {path} failed: {reason}")]
    Upload { path: String, reason: String },

    /// Pod could not be created or started.
    #[error("pod {pod} failed: {reason}")]
    Pod { pod: String, reason: String },

    /// Run-to-completion pod exited unsuccessfully.
    #[error("pod {pod} exited with code {code}")]
    PodExit { pod: String, code: i32 },

    /// A hypervisor-side command failed.
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    /// Hypervisor not reachable.
    #[error("hypervisor unavailable: {0}")]
    Unavailable(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operations a reconciler may perform on a hypervisor.
///
/// Every operation must be idempotent: reconcilers call them again on every
/// pass whether or not anything changed.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Hypervisor name, for logs.
    fn name(&self) -> &str;

    /// Make an image available locally. No-op when already present.
    async fn ensure_image(&self, image: &str) -> Result<(), HypervisorError>;

    /// Write files on behalf of a component.
    ///
    /// Keys are absolute host paths under the component's secrets directory;
    /// existing files are overwritten.
    async fn upload_files(
        &self,
        namespace: &str,
        cluster: &str,
        component: &str,
        files: &BTreeMap<String, String>,
    ) -> Result<(), HypervisorError>;

    /// Ensure a long-running pod exists. No-op when it is already running.
    async fn ensure_pod(
        &self,
        namespace: &str,
        cluster: &str,
        name: &str,
        pod: &PodSpec,
    ) -> Result<(), HypervisorError>;

    /// Run a pod to completion and wait for it.
    ///
    /// Fails with [`HypervisorError::PodExit`] on a non-zero exit.
    async fn run_and_wait_for_pod(
        &self,
        namespace: &str,
        cluster: &str,
        component: &str,
        pod: &PodSpec,
    ) -> Result<(), HypervisorError>;
}

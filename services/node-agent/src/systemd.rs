//! Kubelet service unit and service management.

use std::fmt::Write as _;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

/// Name of the kubelet service.
pub const KUBELET_SERVICE: &str = "kubelet";

/// Where the kubelet installer drops the binary.
pub const KUBELET_BINARY: &str = "/usr/local/bin/kubelet";

/// Service manager errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("failed to run service manager: {0}")]
    Io(#[from] io::Error),

    #[error("{command} exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Controls host services.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Enable `unit` at boot and start it now. No-op for a running unit.
    async fn enable_and_start(&self, unit: &str) -> Result<(), ServiceError>;
}

/// [`ServiceManager`] backed by `systemctl`.
#[derive(Debug, Default, Clone)]
pub struct Systemctl;

#[async_trait]
impl ServiceManager for Systemctl {
    async fn enable_and_start(&self, unit: &str) -> Result<(), ServiceError> {
        // Picks up a unit file written since the last reload.
        run_systemctl(&["daemon-reload"]).await?;
        run_systemctl(&["enable", "--now", unit]).await?;
        info!(unit = %unit, "service enabled and started");
        Ok(())
    }
}

async fn run_systemctl(args: &[&str]) -> Result<(), ServiceError> {
    let output = Command::new("systemctl").args(args).output().await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ServiceError::Failed {
            command: format!("systemctl {}", args.join(" ")),
            status: output.status.to_string(),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(())
}

/// Kubelet systemd unit.
#[derive(Debug, Clone)]
pub struct KubeletUnit {
    pub node_name: String,
    pub kubeconfig: PathBuf,
    pub kubelet_config: PathBuf,
    pub container_runtime_endpoint: String,
    pub image_service_endpoint: String,
}

impl KubeletUnit {
    /// Render the unit file.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("[Unit]\n");
        out.push_str("Description=kubelet: the node agent of the cluster\n");
        out.push_str("Wants=network-online.target\n");
        out.push_str("After=network-online.target\n\n");

        out.push_str("[Service]\n");
        let _ = writeln!(out, "ExecStart={} \\", KUBELET_BINARY);
        let _ = writeln!(out, "  --hostname-override={} \\", self.node_name);
        let _ = writeln!(out, "  --kubeconfig={} \\", self.kubeconfig.display());
        let _ = writeln!(out, "  --config={} \\", self.kubelet_config.display());
        let _ = writeln!(
            out,
            "  --container-runtime-endpoint={} \\",
            self.container_runtime_endpoint
        );
        let _ = writeln!(
            out,
            "  --image-service-endpoint={}",
            self.image_service_endpoint
        );
        out.push_str("Restart=always\n");
        out.push_str("RestartSec=10\n");
        out.push_str("StartLimitInterval=0\n\n");

        out.push_str("[Install]\n");
        out.push_str("WantedBy=multi-user.target\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_kubelet_unit() {
        let unit = KubeletUnit {
            node_name: "node-1".to_string(),
            kubeconfig: PathBuf::from("/etc/nodemesh/kubelet.conf"),
            kubelet_config: PathBuf::from("/var/lib/kubelet/config.yaml"),
            container_runtime_endpoint: "unix:///run/containerd/containerd.sock".to_string(),
            image_service_endpoint: "unix:///run/containerd/containerd.sock".to_string(),
        };

        let text = unit.render();
        assert!(text.starts_with("[Unit]\n"));
        assert!(text.contains("ExecStart=/usr/local/bin/kubelet \\\n"));
        assert!(text.contains("  --hostname-override=node-1 \\\n"));
        assert!(text.contains("  --kubeconfig=/etc/nodemesh/kubelet.conf \\\n"));
        assert!(text.contains("  --config=/var/lib/kubelet/config.yaml \\\n"));
        assert!(text.contains(
            "  --image-service-endpoint=unix:///run/containerd/containerd.sock\nRestart=always\n"
        ));
        assert!(text.ends_with("[Install]\nWantedBy=multi-user.target\n"));
    }
}

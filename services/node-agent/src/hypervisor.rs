//! Node-local hypervisor backed by the CRI.
//!
//! Drives the local container runtime through `crictl`:
//! - images: `inspecti` then `pull`
//! - pods: `runp` + `create` + `start` from generated JSON configs
//! - run-to-completion: poll `inspect` until every container exited
//!
//! Uploads are plain local writes since the hypervisor is this host.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use nodemesh_reconcile::{ContainerSpec, Hypervisor, HypervisorError, PodSpec, Privileges};
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::files;

/// CRI `NamespaceMode::POD`.
const NAMESPACE_MODE_POD: u8 = 0;

/// CRI `NamespaceMode::NODE`.
const NAMESPACE_MODE_NODE: u8 = 2;

const CONTAINER_EXITED: &str = "CONTAINER_EXITED";

/// Hypervisor for the host the agent runs on.
#[derive(Debug, Clone)]
pub struct CrictlHypervisor {
    name: String,
    runtime_endpoint: String,
    image_endpoint: String,
    work_dir: PathBuf,
    run_timeout: Duration,
    poll_interval: Duration,
}

impl CrictlHypervisor {
    /// Create a hypervisor; pod definitions are written under `work_dir`.
    pub fn new(
        name: impl Into<String>,
        runtime_endpoint: impl Into<String>,
        image_endpoint: impl Into<String>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            runtime_endpoint: runtime_endpoint.into(),
            image_endpoint: image_endpoint.into(),
            work_dir: work_dir.into(),
            run_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Bound how long a run-to-completion pod may take.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }

    async fn crictl(&self, args: &[&str]) -> Result<String, HypervisorError> {
        let output = Command::new("crictl")
            .arg("--runtime-endpoint")
            .arg(&self.runtime_endpoint)
            .arg("--image-endpoint")
            .arg(&self.image_endpoint)
            .args(args)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HypervisorError::Command {
                command: format!("crictl {}", args.join(" ")),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn write_definition(&self, file_name: &str, value: &Value) -> Result<PathBuf, HypervisorError> {
        let path = self.work_dir.join(file_name);
        let body = serde_json::to_vec_pretty(value).map_err(|e| HypervisorError::Pod {
            pod: file_name.to_string(),
            reason: e.to_string(),
        })?;
        files::write_private(&path, &body)?;
        Ok(path)
    }

    async fn pod_ids(&self, namespace: &str, name: &str) -> Result<Vec<String>, HypervisorError> {
        let args = pod_query_args(namespace, name);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.crictl(&args).await?;
        Ok(out
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn remove_pods(&self, namespace: &str, name: &str) -> Result<(), HypervisorError> {
        for id in self.pod_ids(namespace, name).await? {
            debug!(pod = %name, pod_id = %id, "removing stale pod");
            self.crictl(&["rmp", "-f", &id]).await?;
        }
        Ok(())
    }

    /// Create and start the sandbox and all containers of `pod`.
    async fn start_pod(
        &self,
        namespace: &str,
        pod: &PodSpec,
    ) -> Result<(String, Vec<String>), HypervisorError> {
        let sandbox = sandbox_config(namespace, pod);
        let sandbox_path = self.write_definition(&format!("{}-pod.json", pod.name), &sandbox)?;
        let sandbox_arg = path_arg(&sandbox_path);

        let pod_id = self.crictl(&["runp", &sandbox_arg]).await?;

        let mut container_ids = Vec::with_capacity(pod.containers.len());
        for (i, container) in pod.containers.iter().enumerate() {
            let config = container_config(pod, container);
            let path =
                self.write_definition(&format!("{}-container-{}.json", pod.name, i), &config)?;
            let id = self
                .crictl(&["create", &pod_id, &path_arg(&path), &sandbox_arg])
                .await?;
            self.crictl(&["start", &id]).await?;
            container_ids.push(id);
        }

        Ok((pod_id, container_ids))
    }

    /// Wait until every container exited; returns the first non-zero exit code.
    async fn wait_for_exit(&self, pod: &PodSpec, ids: &[String]) -> Result<i32, HypervisorError> {
        let deadline = Instant::now() + self.run_timeout;
        loop {
            let mut exit_code = 0;
            let mut running = false;
            for id in ids {
                let out = self.crictl(&["inspect", "-o", "json", id]).await?;
                let status: Value = serde_json::from_str(&out).map_err(|e| HypervisorError::Pod {
                    pod: pod.name.clone(),
                    reason: format!("unreadable container status: {}", e),
                })?;
                if status["status"]["state"] != CONTAINER_EXITED {
                    running = true;
                    break;
                }
                let code = exit_code_of(&status).ok_or_else(|| HypervisorError::Pod {
                    pod: pod.name.clone(),
                    reason: format!("container {} exited without a valid exit code", id),
                })?;
                if exit_code == 0 {
                    exit_code = code;
                }
            }

            if !running {
                return Ok(exit_code);
            }
            if Instant::now() >= deadline {
                return Err(HypervisorError::Pod {
                    pod: pod.name.clone(),
                    reason: format!("did not finish within {:?}", self.run_timeout),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl Hypervisor for CrictlHypervisor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_image(&self, image: &str) -> Result<(), HypervisorError> {
        if self.crictl(&["inspecti", "-q", image]).await.is_ok() {
            debug!(image = %image, "image already present");
            return Ok(());
        }

        info!(image = %image, "pulling image");
        self.crictl(&["pull", image])
            .await
            .map_err(|e| HypervisorError::Image {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn upload_files(
        &self,
        _namespace: &str,
        _cluster: &str,
        _component: &str,
        files: &BTreeMap<String, String>,
    ) -> Result<(), HypervisorError> {
        for (path, contents) in files {
            files::write_private(Path::new(path), contents.as_bytes()).map_err(|e| {
                HypervisorError::Upload {
                    path: path.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        Ok(())
    }

    async fn ensure_pod(
        &self,
        namespace: &str,
        _cluster: &str,
        name: &str,
        pod: &PodSpec,
    ) -> Result<(), HypervisorError> {
        if !self.pod_ids(namespace, name).await?.is_empty() {
            debug!(pod = %name, "pod already present");
            return Ok(());
        }

        let (pod_id, _) = self.start_pod(namespace, pod).await?;
        info!(pod = %name, pod_id = %pod_id, "pod started");
        Ok(())
    }

    async fn run_and_wait_for_pod(
        &self,
        namespace: &str,
        _cluster: &str,
        component: &str,
        pod: &PodSpec,
    ) -> Result<(), HypervisorError> {
        self.remove_pods(namespace, &pod.name).await?;

        let (pod_id, container_ids) = self.start_pod(namespace, pod).await?;
        debug!(
            pod = %pod.name,
            pod_id = %pod_id,
            component = %component,
            "waiting for pod to complete"
        );

        let result = self.wait_for_exit(pod, &container_ids).await;

        if let Err(e) = self.crictl(&["rmp", "-f", &pod_id]).await {
            warn!(pod = %pod.name, error = %e, "failed to remove finished pod");
        }

        match result? {
            0 => Ok(()),
            code => Err(HypervisorError::PodExit {
                pod: pod.name.clone(),
                code,
            }),
        }
    }
}

/// `crictl pods` arguments matching exactly one sandbox name in `namespace`.
///
/// Both filters are regular expressions to crictl, so they are anchored and
/// escaped.
fn pod_query_args(namespace: &str, name: &str) -> Vec<String> {
    vec![
        "pods".to_string(),
        "--namespace".to_string(),
        exact_match(namespace),
        "--name".to_string(),
        exact_match(name),
        "-q".to_string(),
    ]
}

fn exact_match(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len() + 2);
    out.push('^');
    for c in literal.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('$');
    out
}

/// Exit code of an exited container from `crictl inspect` output.
fn exit_code_of(status: &Value) -> Option<i32> {
    status["status"]["exitCode"]
        .as_i64()
        .and_then(|code| i32::try_from(code).ok())
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn network_mode(pod: &PodSpec) -> u8 {
    if pod.uses_host_network() {
        NAMESPACE_MODE_NODE
    } else {
        NAMESPACE_MODE_POD
    }
}

/// CRI `PodSandboxConfig` for `pod`.
fn sandbox_config(namespace: &str, pod: &PodSpec) -> Value {
    let port_mappings: Vec<Value> = pod
        .host_ports
        .iter()
        .map(|(host, container)| {
            json!({ "host_port": host, "container_port": container, "protocol": 0 })
        })
        .collect();

    json!({
        "metadata": {
            "name": pod.name,
            "namespace": namespace,
            "uid": format!("{}-{}", namespace, pod.name),
            "attempt": 0,
        },
        "port_mappings": port_mappings,
        "linux": {
            "security_context": {
                "privileged": pod.privileges == Privileges::Privileged,
                "namespace_options": { "network": network_mode(pod) },
            },
        },
    })
}

/// CRI `ContainerConfig` for `container` inside `pod`.
fn container_config(pod: &PodSpec, container: &ContainerSpec) -> Value {
    let name = if container.name.is_empty() {
        &pod.name
    } else {
        &container.name
    };
    let mounts: Vec<Value> = container
        .mounts
        .iter()
        .map(|(host, guest)| json!({ "host_path": host, "container_path": guest }))
        .collect();
    let capabilities: &[&str] = match container.privileges {
        Privileges::NetworkPrivileged => &["NET_ADMIN", "NET_RAW"],
        _ => &[],
    };

    json!({
        "metadata": { "name": name },
        "image": { "image": container.image },
        "command": container.command,
        "args": container.args,
        "mounts": mounts,
        "linux": {
            "security_context": {
                "privileged": container.privileges == Privileges::Privileged,
                "capabilities": { "add_capabilities": capabilities },
                "namespace_options": { "network": network_mode(pod) },
            },
        },
    })
}

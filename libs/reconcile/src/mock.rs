//! In-memory hypervisor for tests and dry runs.
//!
//! Records every call in order, keeps the latest uploaded content per path,
//! and can be told to fail specific operations.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::hypervisor::{Hypervisor, HypervisorError};
use crate::pod::PodSpec;

/// Kinds of hypervisor operation, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HypervisorOp {
    EnsureImage,
    UploadFiles,
    EnsurePod,
    RunPod,
}

/// A recorded hypervisor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HypervisorCall {
    EnsureImage {
        image: String,
    },
    UploadFiles {
        namespace: String,
        cluster: String,
        component: String,
        paths: Vec<String>,
    },
    EnsurePod {
        namespace: String,
        cluster: String,
        name: String,
    },
    RunPod {
        namespace: String,
        cluster: String,
        component: String,
        pod: String,
        command: String,
    },
}

impl HypervisorCall {
    pub fn op(&self) -> HypervisorOp {
        match self {
            Self::EnsureImage { .. } => HypervisorOp::EnsureImage,
            Self::UploadFiles { .. } => HypervisorOp::UploadFiles,
            Self::EnsurePod { .. } => HypervisorOp::EnsurePod,
            Self::RunPod { .. } => HypervisorOp::RunPod,
        }
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    calls: Vec<HypervisorCall>,
    images: BTreeSet<String>,
    files: BTreeMap<String, String>,
    pods: BTreeMap<String, PodSpec>,
    failing: HashSet<HypervisorOp>,
    failing_nth: HashMap<HypervisorOp, usize>,
    op_counts: HashMap<HypervisorOp, usize>,
}

/// Hypervisor that records calls instead of acting on a host.
#[derive(Debug)]
pub struct RecordingHypervisor {
    name: String,
    state: Mutex<RecorderState>,
}

impl RecordingHypervisor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RecorderState::default()),
        }
    }

    /// Make every future call of `op` fail.
    pub fn fail_on(&self, op: HypervisorOp) {
        self.state().failing.insert(op);
    }

    /// Make only the `n`th call (1-based, counted from creation) of `op` fail.
    pub fn fail_on_nth(&self, op: HypervisorOp, n: usize) {
        self.state().failing_nth.insert(op, n);
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.failing.clear();
        state.failing_nth.clear();
    }

    /// All calls so far, in order.
    pub fn calls(&self) -> Vec<HypervisorCall> {
        self.state().calls.clone()
    }

    /// Forget recorded calls, keeping images, files and pods.
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Latest content uploaded to `path`.
    pub fn file(&self, path: &str) -> Option<String> {
        self.state().files.get(path).cloned()
    }

    /// Whether `image` has been ensured.
    pub fn has_image(&self, image: &str) -> bool {
        self.state().images.contains(image)
    }

    /// Long-running pods created so far, by key `<namespace>/<cluster>/<name>`.
    pub fn pods(&self) -> Vec<String> {
        self.state().pods.keys().cloned().collect()
    }

    fn state(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: HypervisorCall) -> Result<MutexGuard<'_, RecorderState>, HypervisorError> {
        let mut state = self.state();
        let op = call.op();
        let count = {
            let count = state.op_counts.entry(op).or_insert(0);
            *count += 1;
            *count
        };
        let failing =
            state.failing.contains(&op) || state.failing_nth.get(&op) == Some(&count);
        let target = call_target(&call);
        state.calls.push(call);

        if failing {
            debug!(hypervisor = %self.name, ?op, "[MOCK] injected failure");
            return Err(match op {
                HypervisorOp::EnsureImage => HypervisorError::Image {
                    image: target,
                    reason: "injected failure".to_string(),
                },
                HypervisorOp::UploadFiles => HypervisorError::Upload {
                    path: target,
                    reason: "injected failure".to_string(),
                },
                HypervisorOp::EnsurePod => HypervisorError::Pod {
                    pod: target,
                    reason: "injected failure".to_string(),
                },
                HypervisorOp::RunPod => HypervisorError::PodExit {
                    pod: target,
                    code: 1,
                },
            });
        }

        Ok(state)
    }
}

fn call_target(call: &HypervisorCall) -> String {
    match call {
        HypervisorCall::EnsureImage { image } => image.clone(),
        HypervisorCall::UploadFiles { paths, .. } => paths.join(","),
        HypervisorCall::EnsurePod { name, .. } => name.clone(),
        HypervisorCall::RunPod { pod, .. } => pod.clone(),
    }
}

#[async_trait]
impl Hypervisor for RecordingHypervisor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_image(&self, image: &str) -> Result<(), HypervisorError> {
        let mut state = self.record(HypervisorCall::EnsureImage {
            image: image.to_string(),
        })?;
        state.images.insert(image.to_string());
        Ok(())
    }

    async fn upload_files(
        &self,
        namespace: &str,
        cluster: &str,
        component: &str,
        files: &BTreeMap<String, String>,
    ) -> Result<(), HypervisorError> {
        let mut state = self.record(HypervisorCall::UploadFiles {
            namespace: namespace.to_string(),
            cluster: cluster.to_string(),
            component: component.to_string(),
            paths: files.keys().cloned().collect(),
        })?;
        state
            .files
            .extend(files.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn ensure_pod(
        &self,
        namespace: &str,
        cluster: &str,
        name: &str,
        pod: &PodSpec,
    ) -> Result<(), HypervisorError> {
        let mut state = self.record(HypervisorCall::EnsurePod {
            namespace: namespace.to_string(),
            cluster: cluster.to_string(),
            name: name.to_string(),
        })?;
        state
            .pods
            .entry(format!("{}/{}/{}", namespace, cluster, name))
            .or_insert_with(|| pod.clone());
        Ok(())
    }

    async fn run_and_wait_for_pod(
        &self,
        namespace: &str,
        cluster: &str,
        component: &str,
        pod: &PodSpec,
    ) -> Result<(), HypervisorError> {
        let command = pod
            .containers
            .iter()
            .map(|c| c.command_line())
            .collect::<Vec<_>>()
            .join("; ");

        info!(
            hypervisor = %self.name,
            pod = %pod.name,
            command = %command,
            "[MOCK] running pod"
        );

        self.record(HypervisorCall::RunPod {
            namespace: namespace.to_string(),
            cluster: cluster.to_string(),
            component: component.to_string(),
            pod: pod.name.clone(),
            command,
        })?;
        Ok(())
    }
}

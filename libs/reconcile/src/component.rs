//! Cluster components and their host resources.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use tracing::debug;

use crate::ReconcileError;

/// Root of per-component secret files on a hypervisor.
pub const COMPONENT_SECRETS_ROOT: &str = "/etc/nodemesh/clusters";

/// Default host port range handed out to components.
pub const DEFAULT_HOST_PORT_RANGE: RangeInclusive<u16> = 30000..=32767;

/// A named unit of a cluster bound to one hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    pub namespace: String,
    pub cluster: String,
    pub name: String,

    /// Name of the hypervisor the component runs on.
    pub hypervisor: String,

    /// Allocation name -> host port.
    pub host_ports: BTreeMap<String, u16>,
}

impl Component {
    pub fn new(
        namespace: impl Into<String>,
        cluster: impl Into<String>,
        name: impl Into<String>,
        hypervisor: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            cluster: cluster.into(),
            name: name.into(),
            hypervisor: hypervisor.into(),
            host_ports: BTreeMap::new(),
        }
    }

    /// Host port allocated under `name`, if any.
    pub fn host_port(&self, name: &str) -> Option<u16> {
        self.host_ports.get(name).copied()
    }

    /// Secrets directory of this component on its hypervisor.
    pub fn secrets_path(&self) -> String {
        component_secrets_path(&self.namespace, &self.cluster, &self.name)
    }

    /// Path of a file inside the secrets directory.
    pub fn secrets_file(&self, file: &str) -> String {
        format!("{}/{}", self.secrets_path(), file)
    }
}

/// Secrets directory for a component: `<root>/<namespace>/<cluster>/<component>`.
pub fn component_secrets_path(namespace: &str, cluster: &str, component: &str) -> String {
    format!(
        "{}/{}/{}/{}",
        COMPONENT_SECRETS_ROOT, namespace, cluster, component
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PortOwner {
    namespace: String,
    cluster: String,
    component: String,
    name: String,
}

impl PortOwner {
    fn of(component: &Component, name: &str) -> Self {
        Self {
            namespace: component.namespace.clone(),
            cluster: component.cluster.clone(),
            component: component.name.clone(),
            name: name.to_string(),
        }
    }
}

/// Hands out host ports on one hypervisor.
///
/// Requests are idempotent per (namespace, cluster, component, name): asking
/// again returns the port already recorded on the component.
#[derive(Debug, Clone)]
pub struct HostPortAllocator {
    hypervisor: String,
    range: RangeInclusive<u16>,
    allocated: BTreeMap<u16, PortOwner>,
}

impl HostPortAllocator {
    pub fn new(hypervisor: impl Into<String>, range: RangeInclusive<u16>) -> Self {
        Self {
            hypervisor: hypervisor.into(),
            range,
            allocated: BTreeMap::new(),
        }
    }

    /// Allocate (or return the existing) host port for `name` on `component`.
    pub fn request(&mut self, component: &mut Component, name: &str) -> Result<u16, ReconcileError> {
        if component.hypervisor != self.hypervisor {
            return Err(ReconcileError::HypervisorMismatch {
                component: component.name.clone(),
                expected: component.hypervisor.clone(),
                actual: self.hypervisor.clone(),
            });
        }

        let owner = PortOwner::of(component, name);

        // Recorded on the component but unknown here, e.g. after a restart.
        if let Some(port) = component.host_port(name) {
            self.allocated.entry(port).or_insert(owner);
            return Ok(port);
        }

        let port = self
            .range
            .clone()
            .find(|p| !self.allocated.contains_key(p))
            .ok_or_else(|| ReconcileError::PortsExhausted {
                hypervisor: self.hypervisor.clone(),
                low: *self.range.start(),
                high: *self.range.end(),
            })?;

        debug!(
            hypervisor = %self.hypervisor,
            component = %component.name,
            name = %name,
            port,
            "allocated host port"
        );

        self.allocated.insert(port, owner);
        component.host_ports.insert(name.to_string(), port);
        Ok(port)
    }

    /// Release the port allocated for `name` on `component`.
    pub fn release(&mut self, component: &mut Component, name: &str) -> Option<u16> {
        let port = component.host_ports.remove(name)?;
        if self.allocated.get(&port) == Some(&PortOwner::of(component, name)) {
            self.allocated.remove(&port);
        }
        Some(port)
    }

    /// Number of allocated ports.
    pub fn len(&self) -> usize {
        self.allocated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocated.is_empty()
    }
}

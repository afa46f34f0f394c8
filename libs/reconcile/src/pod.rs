//! Pod shapes submitted to hypervisors.

use std::collections::BTreeMap;

/// Privilege level of a pod or container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Privileges {
    /// Default sandbox.
    #[default]
    Regular,

    /// Host network namespace plus `NET_ADMIN`.
    NetworkPrivileged,

    /// Fully privileged.
    Privileged,
}

/// A container within a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    /// Host path -> guest path.
    pub mounts: BTreeMap<String, String>,
    pub privileges: Privileges,
}

impl ContainerSpec {
    /// Create a container running the image's default entrypoint.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            args: Vec::new(),
            mounts: BTreeMap::new(),
            privileges: Privileges::Regular,
        }
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mount(mut self, host: impl Into<String>, guest: impl Into<String>) -> Self {
        self.mounts.insert(host.into(), guest.into());
        self
    }

    pub fn with_privileges(mut self, privileges: Privileges) -> Self {
        self.privileges = privileges;
        self
    }

    /// Command line as a single string, for logs.
    pub fn command_line(&self) -> String {
        self.command
            .iter()
            .chain(self.args.iter())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A pod: one or more containers sharing a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSpec {
    pub name: String,
    pub containers: Vec<ContainerSpec>,
    /// Host port -> container port.
    pub host_ports: BTreeMap<u16, u16>,
    pub privileges: Privileges,
}

impl PodSpec {
    pub fn new(name: impl Into<String>, containers: Vec<ContainerSpec>) -> Self {
        Self {
            name: name.into(),
            containers,
            host_ports: BTreeMap::new(),
            privileges: Privileges::Regular,
        }
    }

    pub fn with_privileges(mut self, privileges: Privileges) -> Self {
        self.privileges = privileges;
        self
    }

    pub fn with_host_port(mut self, host: u16, container: u16) -> Self {
        self.host_ports.insert(host, container);
        self
    }

    /// Whether the sandbox shares the host network namespace.
    pub fn uses_host_network(&self) -> bool {
        self.privileges != Privileges::Regular
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line() {
        let c = ContainerSpec::new("wg", "img")
            .with_command(["wg"])
            .with_args(["syncconf", "wg-0", "/etc/wg.conf"]);
        assert_eq!(c.command_line(), "wg syncconf wg-0 /etc/wg.conf");
    }

    #[test]
    fn test_host_network() {
        let pod = PodSpec::new("p", vec![]);
        assert!(!pod.uses_host_network());
        assert!(pod
            .with_privileges(Privileges::NetworkPrivileged)
            .uses_host_network());
    }
}

//! WireGuard configuration model and rendering.
//!
//! Renders the `wg-quick`/`wg setconf` text format:
//!
//! ```text
//! [Interface]
//! Address = 10.0.0.1/24
//! ListenPort = 51820
//! PrivateKey = ...
//!
//! [Peer]
//! Endpoint = 203.0.113.10:51820
//! PublicKey = ...
//! AllowedIPs = 10.0.0.2/32
//! PersistentKeepalive = 21
//! ```
//!
//! Keys appear in the order above and absent keys are omitted. `wg setconf`
//! and `wg syncconf` reject `Address`, so configs meant for them leave it unset.

use std::fmt::Write as _;

use crate::WgKey;

/// WireGuard peer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgPeer {
    /// Peer's public key.
    pub public_key: WgKey,

    /// Endpoint address and port (if known).
    pub endpoint: Option<String>,

    /// Allowed IPs for this peer.
    pub allowed_ips: Vec<String>,

    /// Persistent keepalive interval in seconds, if enabled.
    pub persistent_keepalive: Option<u16>,
}

impl WgPeer {
    /// Create a new peer with minimal configuration.
    pub fn new(public_key: WgKey, allowed_ips: Vec<String>) -> Self {
        Self {
            public_key,
            endpoint: None,
            allowed_ips,
            persistent_keepalive: None,
        }
    }

    /// Set the endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the persistent keepalive.
    pub fn with_keepalive(mut self, seconds: u16) -> Self {
        self.persistent_keepalive = Some(seconds);
        self
    }

    fn render_into(&self, out: &mut String) {
        out.push_str("[Peer]\n");
        if let Some(endpoint) = &self.endpoint {
            let _ = writeln!(out, "Endpoint = {}", endpoint);
        }
        let _ = writeln!(out, "PublicKey = {}", self.public_key);
        if !self.allowed_ips.is_empty() {
            let _ = writeln!(out, "AllowedIPs = {}", self.allowed_ips.join(", "));
        }
        if let Some(keepalive) = self.persistent_keepalive {
            let _ = writeln!(out, "PersistentKeepalive = {}", keepalive);
        }
    }
}

/// WireGuard interface configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgInterface {
    /// Interface address (CIDR notation). Only understood by `wg-quick`.
    pub address: Option<String>,

    /// Listen port. Unset lets the kernel choose.
    pub listen_port: Option<u16>,

    /// Interface private key.
    pub private_key: WgKey,

    /// Configured peers, in render order.
    pub peers: Vec<WgPeer>,
}

impl WgInterface {
    /// Create an interface with only a private key.
    pub fn new(private_key: WgKey) -> Self {
        Self {
            address: None,
            listen_port: None,
            private_key,
            peers: Vec::new(),
        }
    }

    /// Set the address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Set the listen port.
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = Some(port);
        self
    }

    /// Add a peer.
    pub fn add_peer(&mut self, peer: WgPeer) {
        self.peers.push(peer);
    }

    /// Find a peer by public key.
    pub fn find_peer(&self, key: &WgKey) -> Option<&WgPeer> {
        self.peers.iter().find(|p| &p.public_key == key)
    }

    /// Render to configuration text.
    pub fn render(&self) -> String {
        let mut out = String::from("[Interface]\n");
        if let Some(address) = &self.address {
            let _ = writeln!(out, "Address = {}", address);
        }
        if let Some(port) = self.listen_port {
            let _ = writeln!(out, "ListenPort = {}", port);
        }
        let _ = writeln!(out, "PrivateKey = {}", self.private_key);

        for peer in &self.peers {
            out.push('\n');
            peer.render_into(&mut out);
        }

        out
    }
}

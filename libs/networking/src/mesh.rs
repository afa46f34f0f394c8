//! Mesh configuration derivation.
//!
//! The cluster mesh is a hub and spoke: one ingress peer (named
//! [`INGRESS_PEER_NAME`]) sees every other peer, and each leaf keeps a single
//! tunnel to the ingress.
//!
//! Derivation is a pure function of a [`Cluster`] snapshot. Peer blocks follow
//! snapshot order, so the same snapshot always renders the same text.

use sha2::{Digest, Sha256};

use crate::wireguard::{WgInterface, WgPeer};
use crate::{host_route, Cidr, NetworkError, WgKey};

/// Name of the VPN peer that acts as the mesh ingress.
pub const INGRESS_PEER_NAME: &str = "control-plane-ingress";

/// Keepalive for leaf tunnels. Leaves usually sit behind NAT.
pub const LEAF_PERSISTENT_KEEPALIVE: u16 = 21;

/// Linux interface name limit (`IFNAMSIZ - 1`).
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// A participant in the cluster mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnPeer {
    /// Unique name within the cluster.
    pub name: String,

    /// Address in CIDR notation (e.g. `10.0.0.2/24`).
    pub address: String,

    /// Base64 WireGuard public key.
    pub public_key: String,

    /// Base64 WireGuard private key.
    pub private_key: String,
}

/// Cluster membership as seen by the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    /// Cluster namespace.
    pub namespace: String,

    /// Cluster name.
    pub name: String,

    /// VPN peers, in control-plane order.
    pub vpn_peers: Vec<VpnPeer>,
}

impl Cluster {
    /// Look up a peer by name.
    pub fn vpn_peer(&self, name: &str) -> Result<&VpnPeer, NetworkError> {
        self.vpn_peers
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| NetworkError::PeerNotFound {
                namespace: self.namespace.clone(),
                cluster: self.name.clone(),
                peer: name.to_string(),
            })
    }

    /// Peers other than the ingress.
    pub fn leaf_peers(&self) -> impl Iterator<Item = &VpnPeer> {
        self.vpn_peers
            .iter()
            .filter(|p| p.name != INGRESS_PEER_NAME)
    }
}

/// Decrypted VPN settings handed to a joining node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnDescriptor {
    /// Range routed through the ingress tunnel.
    pub cidr: String,

    /// This node's mesh address (CIDR notation).
    pub address: String,

    /// This node's private key.
    pub peer_private_key: String,

    /// Ingress endpoint (`host:port`).
    pub endpoint: String,

    /// Ingress public key.
    pub endpoint_public_key: String,
}

/// Derived configuration for the ingress component of a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressMeshConfig {
    /// Interface name on the hypervisor.
    pub interface_name: String,

    /// Bring-up config for `wg-quick up`: interface only.
    pub quick: WgInterface,

    /// Live config for `wg syncconf`: interface without address, plus peers.
    pub full: WgInterface,
}

impl IngressMeshConfig {
    /// Rendered quick config.
    pub fn quick_config(&self) -> String {
        self.quick.render()
    }

    /// Rendered full config.
    pub fn full_config(&self) -> String {
        self.full.render()
    }

    /// Number of peer blocks in the full config.
    pub fn peer_count(&self) -> usize {
        self.full.peers.len()
    }
}

/// Deterministic interface name for a cluster's ingress tunnel.
///
/// `wg-` followed by the SHA-256 of `<namespace>-<name>` in hex, cut to the
/// kernel's interface name limit.
pub fn interface_name(namespace: &str, name: &str) -> String {
    let digest = Sha256::digest(format!("{}-{}", namespace, name).as_bytes());
    let mut iface = format!("wg-{}", hex::encode(digest));
    iface.truncate(MAX_INTERFACE_NAME_LEN);
    iface
}

/// Derive the ingress quick and full configurations from a cluster snapshot.
pub fn derive_ingress_config(
    cluster: &Cluster,
    listen_port: u16,
) -> Result<IngressMeshConfig, NetworkError> {
    let ingress = cluster.vpn_peer(INGRESS_PEER_NAME)?;
    let address: Cidr = ingress.address.parse()?;
    let private_key = WgKey::from_base64(&ingress.private_key)?;

    let quick = WgInterface::new(private_key.clone())
        .with_address(address.to_string())
        .with_listen_port(listen_port);

    let mut full = WgInterface::new(private_key).with_listen_port(listen_port);
    for peer in cluster.leaf_peers() {
        let public_key = WgKey::from_base64(&peer.public_key)?;
        full.add_peer(WgPeer::new(public_key, vec![host_route(&peer.address)?]));
    }

    Ok(IngressMeshConfig {
        interface_name: interface_name(&cluster.namespace, &cluster.name),
        quick,
        full,
    })
}

/// Derive a leaf node's single-tunnel configuration.
pub fn derive_leaf_config(vpn: &VpnDescriptor) -> Result<WgInterface, NetworkError> {
    let address: Cidr = vpn.address.parse()?;
    let cidr: Cidr = vpn.cidr.parse()?;
    let private_key = WgKey::from_base64(&vpn.peer_private_key)?;
    let endpoint_key = WgKey::from_base64(&vpn.endpoint_public_key)?;

    if vpn.endpoint.trim().is_empty() {
        return Err(NetworkError::InvalidAddress("empty ingress endpoint".to_string()));
    }

    let mut iface = WgInterface::new(private_key).with_address(address.to_string());
    iface.add_peer(
        WgPeer::new(endpoint_key, vec![cidr.to_string()])
            .with_endpoint(vpn.endpoint.trim())
            .with_keepalive(LEAF_PERSISTENT_KEEPALIVE),
    );

    Ok(iface)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WgKeyPair;

    fn peer(name: &str, address: &str) -> (VpnPeer, WgKeyPair) {
        let keys = WgKeyPair::generate();
        (
            VpnPeer {
                name: name.to_string(),
                address: address.to_string(),
                public_key: keys.public_key.to_string(),
                private_key: keys.private_key.to_string(),
            },
            keys,
        )
    }

    fn cluster(peers: Vec<VpnPeer>) -> Cluster {
        Cluster {
            namespace: "default".to_string(),
            name: "cluster-a".to_string(),
            vpn_peers: peers,
        }
    }

    #[test]
    fn test_interface_name_is_stable_and_short() {
        let a = interface_name("default", "cluster-a");
        assert_eq!(a, interface_name("default", "cluster-a"));
        assert_eq!(a.len(), MAX_INTERFACE_NAME_LEN);
        assert!(a.starts_with("wg-"));
        assert_ne!(a, interface_name("default", "cluster-b"));
        assert_ne!(a, interface_name("other", "cluster-a"));
    }

    #[test]
    fn test_interface_name_long_inputs() {
        let long = "x".repeat(253);
        assert!(interface_name(&long, &long).len() <= MAX_INTERFACE_NAME_LEN);
    }

    #[test]
    fn test_ingress_quick_config() {
        let (ingress, keys) = peer(INGRESS_PEER_NAME, "10.0.0.1/24");
        let config = derive_ingress_config(&cluster(vec![ingress]), 51820).unwrap();

        assert_eq!(
            config.quick_config(),
            format!(
                "[Interface]\nAddress = 10.0.0.1/24\nListenPort = 51820\nPrivateKey = {}\n",
                keys.private_key
            )
        );
        assert_eq!(config.peer_count(), 0);
        assert!(!config.full_config().contains("Address"));
    }

    #[test]
    fn test_ingress_excludes_itself_and_uses_host_routes() {
        let (ingress, _) = peer(INGRESS_PEER_NAME, "10.0.0.1/24");
        let (a, a_keys) = peer("a", "10.0.0.2/24");
        let (b, b_keys) = peer("b", "fd00::3/64");
        let config = derive_ingress_config(&cluster(vec![a, ingress, b]), 4000).unwrap();

        assert_eq!(config.peer_count(), 2);
        assert_eq!(config.full.peers[0].public_key, a_keys.public_key);
        assert_eq!(config.full.peers[0].allowed_ips, vec!["10.0.0.2/32"]);
        assert_eq!(config.full.peers[1].public_key, b_keys.public_key);
        assert_eq!(config.full.peers[1].allowed_ips, vec!["fd00::3/128"]);
        assert!(config.full.peers.iter().all(|p| p.endpoint.is_none()));
    }

    #[test]
    fn test_missing_ingress_peer() {
        let (a, _) = peer("a", "10.0.0.2/24");
        let err = derive_ingress_config(&cluster(vec![a]), 4000).unwrap_err();
        assert!(matches!(err, NetworkError::PeerNotFound { .. }));
    }

    #[test]
    fn test_invalid_peer_address() {
        let (ingress, _) = peer(INGRESS_PEER_NAME, "10.0.0.1/24");
        let (a, _) = peer("a", "10.0.0.2");
        assert!(derive_ingress_config(&cluster(vec![ingress, a]), 4000).is_err());
    }

    #[test]
    fn test_leaf_config() {
        let node = WgKeyPair::generate();
        let ingress = WgKeyPair::generate();
        let vpn = VpnDescriptor {
            cidr: "10.0.0.0/24".to_string(),
            address: "10.0.0.2/24".to_string(),
            peer_private_key: node.private_key.to_string(),
            endpoint: "203.0.113.10:4000".to_string(),
            endpoint_public_key: ingress.public_key.to_string(),
        };

        let iface = derive_leaf_config(&vpn).unwrap();
        assert_eq!(
            iface.render(),
            format!(
                "[Interface]\nAddress = 10.0.0.2/24\nPrivateKey = {}\n\n[Peer]\nEndpoint = 203.0.113.10:4000\nPublicKey = {}\nAllowedIPs = 10.0.0.0/24\nPersistentKeepalive = 21\n",
                node.private_key, ingress.public_key
            )
        );
    }

    #[test]
    fn test_leaf_rejects_bad_key() {
        let vpn = VpnDescriptor {
            cidr: "10.0.0.0/24".to_string(),
            address: "10.0.0.2/24".to_string(),
            peer_private_key: "short".to_string(),
            endpoint: "203.0.113.10:4000".to_string(),
            endpoint_public_key: WgKeyPair::generate().public_key.to_string(),
        };
        assert!(matches!(
            derive_leaf_config(&vpn),
            Err(NetworkError::InvalidKey(_))
        ));
    }
}

//! End-to-end mesh derivation for a three-peer cluster.
//!
//! The ingress sees both leaves through host routes; each leaf sees only the
//! ingress, reached through its public endpoint.

use nodemesh_networking::{
    derive_ingress_config, derive_leaf_config, interface_name, Cluster, VpnDescriptor, VpnPeer,
    WgKeyPair, INGRESS_PEER_NAME, LEAF_PERSISTENT_KEEPALIVE,
};

const INGRESS_ENDPOINT: &str = "198.51.100.7:31820";

struct Fixture {
    cluster: Cluster,
    keys: Vec<WgKeyPair>,
}

fn fixture() -> Fixture {
    let specs = [
        (INGRESS_PEER_NAME, "10.0.0.1/24"),
        ("a", "10.0.0.2/24"),
        ("b", "10.0.0.3/24"),
    ];
    let keys: Vec<WgKeyPair> = specs.iter().map(|_| WgKeyPair::generate()).collect();
    let vpn_peers = specs
        .iter()
        .zip(&keys)
        .map(|((name, address), k)| VpnPeer {
            name: name.to_string(),
            address: address.to_string(),
            public_key: k.public_key.to_string(),
            private_key: k.private_key.to_string(),
        })
        .collect();

    Fixture {
        cluster: Cluster {
            namespace: "tenants".to_string(),
            name: "blue".to_string(),
            vpn_peers,
        },
        keys,
    }
}

fn leaf_descriptor(cluster: &Cluster, name: &str) -> VpnDescriptor {
    let ingress = cluster.vpn_peer(INGRESS_PEER_NAME).unwrap();
    let leaf = cluster.vpn_peer(name).unwrap();
    VpnDescriptor {
        cidr: ingress.address.clone(),
        address: leaf.address.clone(),
        peer_private_key: leaf.private_key.clone(),
        endpoint: INGRESS_ENDPOINT.to_string(),
        endpoint_public_key: ingress.public_key.clone(),
    }
}

#[test]
fn ingress_full_config_has_one_host_route_per_leaf() {
    let f = fixture();
    let config = derive_ingress_config(&f.cluster, 31820).unwrap();

    assert_eq!(config.peer_count(), f.cluster.vpn_peers.len() - 1);

    let full = config.full_config();
    assert_eq!(full.matches("[Peer]").count(), 2);
    assert!(full.contains(&format!(
        "[Peer]\nPublicKey = {}\nAllowedIPs = 10.0.0.2/32\n",
        f.keys[1].public_key
    )));
    assert!(full.contains(&format!(
        "[Peer]\nPublicKey = {}\nAllowedIPs = 10.0.0.3/32\n",
        f.keys[2].public_key
    )));
    assert!(!full.contains(&f.keys[0].public_key.to_string()));
    assert!(full.starts_with("[Interface]\nListenPort = 31820\n"));
}

#[test]
fn each_leaf_points_at_the_ingress() {
    let f = fixture();

    for (name, own) in [("a", &f.keys[1]), ("b", &f.keys[2])] {
        let iface = derive_leaf_config(&leaf_descriptor(&f.cluster, name)).unwrap();
        assert_eq!(iface.private_key, own.private_key);
        assert_eq!(iface.peers.len(), 1);

        let ingress = &iface.peers[0];
        assert_eq!(ingress.public_key, f.keys[0].public_key);
        assert_eq!(ingress.endpoint.as_deref(), Some(INGRESS_ENDPOINT));
        assert_eq!(ingress.allowed_ips, vec!["10.0.0.1/24"]);
        assert_eq!(ingress.persistent_keepalive, Some(LEAF_PERSISTENT_KEEPALIVE));
    }
}

#[test]
fn derivation_is_deterministic_for_a_snapshot() {
    let f = fixture();
    let first = derive_ingress_config(&f.cluster, 31820).unwrap();
    let second = derive_ingress_config(&f.cluster.clone(), 31820).unwrap();

    assert_eq!(first.quick_config(), second.quick_config());
    assert_eq!(first.full_config(), second.full_config());
    assert_eq!(
        first.interface_name,
        interface_name(&f.cluster.namespace, &f.cluster.name)
    );
}

#[test]
fn membership_changes_show_up_on_next_derivation() {
    let mut f = fixture();
    let before = derive_ingress_config(&f.cluster, 31820).unwrap();

    let c = WgKeyPair::generate();
    f.cluster.vpn_peers.push(VpnPeer {
        name: "c".to_string(),
        address: "10.0.0.4/24".to_string(),
        public_key: c.public_key.to_string(),
        private_key: c.private_key.to_string(),
    });
    let after = derive_ingress_config(&f.cluster, 31820).unwrap();

    assert_eq!(before.quick_config(), after.quick_config());
    assert_eq!(after.peer_count(), before.peer_count() + 1);
    assert!(after.full_config().contains("AllowedIPs = 10.0.0.4/32"));
}

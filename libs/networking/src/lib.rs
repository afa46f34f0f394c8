//! Networking utilities for the node mesh.
//!
//! This library provides helpers for:
//! - CIDR parsing and host-route normalization
//! - WireGuard key validation and generation
//! - WireGuard configuration rendering (`wireguard`)
//! - Deriving ingress and leaf mesh configuration from cluster state (`mesh`)

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

pub mod mesh;
pub mod wireguard;

pub use mesh::{
    derive_ingress_config, derive_leaf_config, interface_name, Cluster, IngressMeshConfig,
    VpnDescriptor, VpnPeer, INGRESS_PEER_NAME, LEAF_PERSISTENT_KEEPALIVE,
};
pub use wireguard::{WgInterface, WgPeer};

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid WireGuard key.
    #[error("invalid WireGuard key: {0}")]
    InvalidKey(String),

    /// Named VPN peer is not part of the cluster.
    #[error("VPN peer {peer:?} not found in cluster {namespace}/{cluster}")]
    PeerNotFound {
        namespace: String,
        cluster: String,
        peer: String,
    },
}

// ============================================================================
// CIDR
// ============================================================================

/// An address with a prefix length (e.g. `10.0.0.2/24`).
///
/// The host bits are kept: a VPN peer address names both the peer and the
/// network it lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    /// Address as written.
    pub address: IpAddr,

    /// Prefix length.
    pub prefix_len: u8,
}

impl Cidr {
    /// Maximum prefix length for the address family.
    pub fn max_prefix_len(address: IpAddr) -> u8 {
        match address {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }

    /// The single-host route for this address (`/32` or `/128`).
    pub fn host_route(&self) -> Cidr {
        Cidr {
            address: self.address,
            prefix_len: Self::max_prefix_len(self.address),
        }
    }
}

impl FromStr for Cidr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        let max = Self::max_prefix_len(address);
        if prefix_len > max {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds {}",
                prefix_len, max
            )));
        }

        Ok(Self {
            address,
            prefix_len,
        })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Normalize a CIDR-notation address into a host route string.
///
/// `10.0.0.2/24` becomes `10.0.0.2/32`, `fd00::2/64` becomes `fd00::2/128`.
pub fn host_route(cidr: &str) -> Result<String, NetworkError> {
    Ok(cidr.parse::<Cidr>()?.host_route().to_string())
}

// ============================================================================
// WireGuard keys
// ============================================================================

/// Length of a raw WireGuard key.
pub const WG_KEY_LEN: usize = 32;

/// A WireGuard key (base64-encoded, 32 bytes). Used for both halves.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct WgKey(String);

impl WgKey {
    /// Create from a base64-encoded string.
    pub fn from_base64(s: &str) -> Result<Self, NetworkError> {
        let s = s.trim();
        let decoded = STANDARD
            .decode(s)
            .map_err(|_| NetworkError::InvalidKey("key is not valid base64".to_string()))?;

        if decoded.len() != WG_KEY_LEN {
            return Err(NetworkError::InvalidKey(format!(
                "key must be {} bytes, got {}",
                WG_KEY_LEN,
                decoded.len()
            )));
        }

        Ok(Self(s.to_string()))
    }

    /// Get the base64-encoded key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for WgKey {
    // Private keys share this type; never print the material.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WgKey(..)")
    }
}

/// A freshly generated WireGuard key pair.
#[derive(Debug, Clone)]
pub struct WgKeyPair {
    /// Private key.
    pub private_key: WgKey,

    /// Public key derived from the private key.
    pub public_key: WgKey,
}

impl WgKeyPair {
    /// Generate a key pair (`wg genkey | wg pubkey`).
    pub fn generate() -> Self {
        let mut bytes = [0u8; WG_KEY_LEN];
        rand::rng().fill_bytes(&mut bytes);
        // Clamp as `wg genkey` does so the stored key is canonical.
        bytes[0] &= 248;
        bytes[31] &= 127;
        bytes[31] |= 64;

        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);

        Self {
            private_key: WgKey(STANDARD.encode(secret.to_bytes())),
            public_key: WgKey(STANDARD.encode(public.as_bytes())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("10.0.0.2/24", "10.0.0.2/32")]
    #[case("10.0.0.1/32", "10.0.0.1/32")]
    #[case("192.168.1.7/16", "192.168.1.7/32")]
    #[case("fd00::2/64", "fd00::2/128")]
    #[case("2001:db8::1/128", "2001:db8::1/128")]
    fn test_host_route(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(host_route(input).unwrap(), expected);
    }

    #[rstest]
    #[case("10.0.0.2")]
    #[case("10.0.0.2/33")]
    #[case("fd00::1/129")]
    #[case("not-an-ip/24")]
    #[case("10.0.0.2/abc")]
    fn test_invalid_cidr(#[case] input: &str) {
        assert!(input.parse::<Cidr>().is_err());
    }

    #[test]
    fn test_cidr_keeps_host_bits() {
        let cidr: Cidr = "10.0.0.3/24".parse().unwrap();
        assert_eq!(cidr.to_string(), "10.0.0.3/24");
        assert_eq!(cidr.prefix_len, 24);
    }

    #[test]
    fn test_wg_key() {
        // Valid 32-byte key in base64
        let valid = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";
        assert!(WgKey::from_base64(valid).is_ok());

        // Invalid length
        let short = "AAAA";
        assert!(WgKey::from_base64(short).is_err());

        assert!(WgKey::from_base64("!!!").is_err());
    }

    #[test]
    fn test_generated_keypair_is_valid() {
        let pair = WgKeyPair::generate();
        assert!(WgKey::from_base64(pair.private_key.as_str()).is_ok());
        assert!(WgKey::from_base64(pair.public_key.as_str()).is_ok());
        assert_ne!(pair.private_key, pair.public_key);
    }

    #[test]
    fn test_key_debug_hides_material() {
        let pair = WgKeyPair::generate();
        assert!(!format!("{:?}", pair).contains(pair.private_key.as_str()));
    }
}

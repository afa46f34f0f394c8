//! nodemesh Node Agent Library
//!
//! The node agent runs once on each host that should become a cluster node.
//! It joins the host to a cluster over an untrusted channel and brings up the
//! node's tunnel into the cluster mesh.
//!
//! ## Flow
//!
//! ```text
//! join.key ──wrap──> NodeJoinRequest ──poll──> Issued response
//!                                                  │ decrypt all fields
//!                                                  ▼
//!          kubeconfig + kubelet config ─> kubelet install ─> kubelet.service ─> wg0
//! ```
//!
//! ## Modules
//!
//! - `join`: join state machine
//! - `client`: cluster API client
//! - `hypervisor`: CRI-backed local hypervisor
//! - `kubelet`, `systemd`, `wireguard`: the steps applied after issue

pub mod client;
pub mod config;
pub mod files;
pub mod hypervisor;
pub mod join;
pub mod keystore;
pub mod kubelet;
pub mod systemd;
pub mod wireguard;

// Re-export commonly used types
pub use client::{ApiError, ClusterApi, HttpClusterClient, JoinRecord, JoinRequest};
pub use config::{Config, JoinSettings, NodePaths};
pub use hypervisor::CrictlHypervisor;
pub use join::{DecryptedJoinConfig, JoinError, JoinFlow, JoinState};
pub use systemd::{ServiceManager, Systemctl};
